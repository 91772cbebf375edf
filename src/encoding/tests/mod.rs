mod tests_parks;

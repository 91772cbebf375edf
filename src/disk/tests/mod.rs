mod tests_filtered;

mod tests_slicing;

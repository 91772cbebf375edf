mod tests_f1;

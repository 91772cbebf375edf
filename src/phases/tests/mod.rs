mod tests_phase2;

mod tests_primitives;

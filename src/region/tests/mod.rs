mod tests_coordinate;
mod tests_hasher;

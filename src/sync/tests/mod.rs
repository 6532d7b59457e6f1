mod tests_barrier;
mod tests_striped;

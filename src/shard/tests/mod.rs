mod helpers;

mod tests_basic;
mod tests_record;
mod tests_snapshot;

mod helpers;
mod tests_locking;
mod tests_recovery;

//! Lifecycle scenarios driven through the engine with fake VM and shell doubles.

mod bdd_steps;
mod scenarios;
mod test_helpers;

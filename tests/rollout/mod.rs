//! Behavioural coverage for `upkeep start` and `upkeep stop`.

mod bdd_steps;
mod scenarios;
mod test_helpers;

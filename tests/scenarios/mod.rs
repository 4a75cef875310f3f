//! Scenario-based tests for stepvm

mod demos;
mod error_handling;
mod linking;
mod loops;
mod map_ordering;
mod observability;
mod resources;
mod transactions;
mod validation;

//! State machine module.

pub mod machine;

pub use machine::{BringupState, BringupTracker, StateError};

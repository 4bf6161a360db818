//! Coordination backends shipped with the crate.

pub mod memory;

pub use memory::{InMemoryCoordinator, Operation};

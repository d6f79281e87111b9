//! Command execution: the single-key retry engine and the batch router.

pub mod batch;
pub mod executor;

pub use batch::{BatchEntry, BatchExecutor, BatchOutcome, BatchRouter};
pub use executor::{Command, Executor};

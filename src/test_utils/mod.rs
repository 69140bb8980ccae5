//! Helpers shared by unit and integration tests.
//!
//! Compiled for the crate's own tests and, through the `test-util` feature,
//! for the integration tests under `tests/`.

#[cfg(test)]
pub(crate) mod log_capture;
pub mod memory_broker;

pub use memory_broker::{MemoryBroker, ReceivedMessage};

//! Deterministic, pure logic shared by the scheduler and the agent layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod classifier;
pub mod dependency;
pub mod pool_key;
pub mod queue;
pub mod types;

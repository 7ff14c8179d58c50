//! Deterministic, pure logic shared by the provisioning pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod build_machine;
pub mod overlay;
pub mod partition;
pub mod types;

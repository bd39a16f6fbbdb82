//! Deterministic, pure logic shared by the experiment manager.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod error;
pub mod lifecycle;
pub mod name;
pub mod selector;
pub mod types;

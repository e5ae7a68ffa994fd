//! Deterministic, pure logic shared by the runner.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! structures and return deterministic outputs suitable for tests.

pub mod search;
pub mod template;
pub mod tokens;
pub mod types;
pub mod uct;
pub mod variables;

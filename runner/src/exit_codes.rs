//! Stable exit codes for the `mlrunner` commands.

/// A node succeeded and `best_run` was promoted, or a template is valid.
pub const OK: i32 = 0;
/// Invalid configuration, input or template, or a fatal error.
pub const INVALID: i32 = 1;
/// The search finished without any successful node.
pub const NO_SUCCESS: i32 = 2;
/// The run was cancelled before finishing.
pub const CANCELLED: i32 = 3;

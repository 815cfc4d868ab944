//! Stable exit codes for `workorder` CLI commands.

/// Every work order succeeded, or the batch is valid.
pub const OK: i32 = 0;
/// Invalid input, configuration, or repository state, or a fatal engine error.
pub const INVALID: i32 = 1;
/// A work order ended FAILED; later work orders were skipped.
pub const FAILED: i32 = 2;
/// The run was cancelled before a work order could finish.
pub const CANCELLED: i32 = 3;

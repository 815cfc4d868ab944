//! Work order execution engine.
//!
//! A work order is a scoped request for change: which files may be written,
//! what context to show, and which commands must pass. The engine asks a
//! proposal oracle for a change, applies it transactionally, verifies it, and
//! either commits exactly the accepted write set or rolls the repository back
//! to its baseline and retries with a failure brief.
//!
//! - **[`core`]**: Pure, deterministic logic (validation, scope, state machine,
//!   retry budget). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, child processes,
//!   the oracle). Isolated behind traits to enable scripting in tests.
//!
//! Orchestration modules ([`engine`], [`batch`]) coordinate core logic with
//! I/O to implement CLI commands.

pub mod batch;
pub mod cancel;
pub mod core;
pub mod engine;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

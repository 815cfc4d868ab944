//! Side-effecting operations: filesystem, git, child processes, the oracle.

pub mod artifacts;
pub mod baseline;
pub mod config;
pub mod context;
pub mod document;
pub mod git;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod verify;
pub mod writer;

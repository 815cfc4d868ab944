//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod commands;
pub mod hash;
pub mod machine;
pub mod paths;
pub mod retry;
pub mod scope;
pub mod types;
pub mod validator;

//! CLI command implementations.
//!
//! Each submodule implements a sandkit CLI command with pure core logic
//! separated from IO for testability.

pub mod cleanup;
pub mod list;
pub mod run;

//! revish CLI library
//!
//! Shared code for the `revish` binary: subcommand implementations, terminal
//! output helpers and the interactive credential prompt.

pub mod commands;
pub mod output;
pub mod prompt;

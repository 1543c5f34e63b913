//! Operator shells served on forwarded connections

mod handler;
pub mod pty;

pub use handler::{ShellHandler, ShellServer};
pub use pty::{spawn_shell, validate_shell_path, TerminalSize};

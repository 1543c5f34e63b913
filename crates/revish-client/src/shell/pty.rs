//! PTY-backed shell processes
//!
//! Spawns the operator's shell on a pseudo-terminal using the portable-pty
//! crate. The master side is split in two: a [`PtyShell`] that owns input,
//! resizing and the kill switch, and a [`PtyOutput`] that is moved onto a
//! blocking thread to drain output and reap the child.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};

/// Shells operators may be attached to
const ALLOWED_SHELLS_UNIX: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/bin/ksh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/dash",
    "/usr/bin/ksh",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/bash",
    "/opt/homebrew/bin/zsh",
    "/opt/homebrew/bin/fish",
];

const ALLOWED_SHELLS_WINDOWS: &[&str] = &[
    "cmd.exe",
    "powershell.exe",
    "pwsh.exe",
    "C:\\Windows\\System32\\cmd.exe",
    "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe",
];

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    /// Build from the 32-bit sizes carried by SSH requests, clamping to
    /// sane bounds
    pub fn from_request(cols: u32, rows: u32) -> Self {
        let clamp = |value: u32, fallback: u16| match u16::try_from(value) {
            Ok(0) => fallback,
            Ok(v) => v,
            Err(_) => u16::MAX,
        };
        Self {
            cols: clamp(cols, 80),
            rows: clamp(rows, 24),
        }
    }

    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Validate that a shell path is allowed and exists
pub fn validate_shell_path(shell: &str) -> Result<String> {
    let allowed = if cfg!(windows) {
        ALLOWED_SHELLS_WINDOWS
    } else {
        ALLOWED_SHELLS_UNIX
    };

    let shell_lower = shell.to_lowercase();
    let is_allowed = allowed.iter().any(|s| s.to_lowercase() == shell_lower);

    if !is_allowed {
        #[cfg(unix)]
        if listed_in_etc_shells(shell) && Path::new(shell).exists() {
            return Ok(shell.to_string());
        }

        anyhow::bail!(
            "Shell '{}' is not in the allowed shell list. Allowed shells: {:?}",
            shell,
            allowed
        );
    }

    if !cfg!(windows) && !Path::new(shell).exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }

    Ok(shell.to_string())
}

#[cfg(unix)]
fn listed_in_etc_shells(shell: &str) -> bool {
    std::fs::read_to_string("/etc/shells")
        .map(|shells| {
            shells.lines().any(|line| {
                let line = line.trim();
                !line.starts_with('#') && line == shell
            })
        })
        .unwrap_or(false)
}

/// Input side of a running shell
pub struct PtyShell {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

/// Output side of a running shell, drained on a blocking thread
pub struct PtyOutput {
    reader: Box<dyn Read + Send>,
    child: Box<dyn Child + Send + Sync>,
}

/// Spawn `shell` on a fresh PTY
pub fn spawn_shell(shell: &str, term: &str, size: TerminalSize) -> Result<(PtyShell, PtyOutput)> {
    let shell_path =
        validate_shell_path(shell).with_context(|| format!("Invalid shell requested: {}", shell))?;

    tracing::info!(
        "Spawning {} on a {}x{} {} terminal",
        shell_path,
        size.cols,
        size.rows,
        term
    );

    let pair = native_pty_system()
        .openpty(size.to_pty_size())
        .context("Failed to open PTY")?;

    let mut cmd = CommandBuilder::new(&shell_path);
    cmd.env("TERM", if term.is_empty() { "xterm-256color" } else { term });

    let child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("Failed to spawn shell: {}", shell_path))?;
    // The master only sees EOF once every slave handle is gone
    drop(pair.slave);

    let pid = child.process_id();
    tracing::debug!("Spawned shell process with PID: {:?}", pid);

    let reader = pair
        .master
        .try_clone_reader()
        .context("Failed to clone PTY reader")?;
    let writer = pair
        .master
        .take_writer()
        .context("Failed to take PTY writer")?;
    let killer = child.clone_killer();

    Ok((
        PtyShell {
            master: pair.master,
            writer,
            killer,
            pid,
        },
        PtyOutput { reader, child },
    ))
}

impl PtyShell {
    /// Process ID of the shell, when the platform reports one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send input to the shell
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .context("Failed to write to PTY")?;
        self.writer.flush().context("Failed to flush PTY")?;
        Ok(())
    }

    /// Propagate a terminal resize
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        tracing::debug!("Resizing PTY to {}x{}", size.cols, size.rows);
        self.master
            .resize(size.to_pty_size())
            .context("Failed to resize PTY")?;
        Ok(())
    }

    /// Terminate the shell
    pub fn kill(&mut self) {
        if let Err(e) = self.killer.kill() {
            tracing::debug!("Failed to kill shell {:?}: {}", self.pid, e);
        }
    }
}

impl PtyOutput {
    /// Read the next chunk of output. `Ok(0)` means the shell side closed.
    pub fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.reader.read(buf) {
            // Linux reports EIO on the master once the slave side is closed
            Err(e) if e.raw_os_error() == Some(5) => Ok(0),
            other => other,
        }
    }

    /// Block until the shell exits and return its exit code
    pub fn wait(mut self) -> u32 {
        match self.child.wait() {
            Ok(status) => status.exit_code(),
            Err(e) => {
                tracing::warn!("Failed to reap shell: {}", e);
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unlisted_shell() {
        let err = validate_shell_path("/tmp/definitely-not-a-shell").unwrap_err();
        assert!(err.to_string().contains("not in the allowed shell list"));
    }

    #[test]
    fn test_rejects_lookalike_path() {
        assert!(validate_shell_path("/tmp/evil/bin/sh").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_accepts_bin_sh() {
        assert_eq!(validate_shell_path("/bin/sh").unwrap(), "/bin/sh");
    }

    #[test]
    fn test_terminal_size_from_request() {
        assert_eq!(
            TerminalSize::from_request(120, 40),
            TerminalSize { cols: 120, rows: 40 }
        );
        assert_eq!(TerminalSize::from_request(0, 0), TerminalSize::default());
        assert_eq!(TerminalSize::from_request(u32::MAX, 10).cols, u16::MAX);
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_exit_code_is_reported() {
        let (mut shell, mut output) =
            spawn_shell("/bin/sh", "dumb", TerminalSize::default()).unwrap();
        shell.write(b"exit 3\n").unwrap();

        let mut buf = [0u8; 1024];
        while output.read(&mut buf).unwrap_or(0) > 0 {}

        assert_eq!(output.wait(), 3);
    }
}

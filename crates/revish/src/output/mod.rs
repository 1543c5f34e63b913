//! Output formatting utilities for the CLI

use tabled::{settings::Style, Table, Tabled};

use revish_server::DirectoryEntry;

/// Format the directory as an ASCII table
///
/// Each row carries the `ssh -J` invocation an operator uses to reach the
/// endpoint through the server.
pub fn format_directory(entries: &[DirectoryEntry], jump_host: &str) -> String {
    if entries.is_empty() {
        return "No reachable sessions".to_string();
    }

    #[derive(Tabled)]
    struct DirectoryRow {
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "ADDRESS")]
        address: String,
        #[tabled(rename = "CONNECT")]
        connect: String,
    }

    let rows: Vec<DirectoryRow> = entries
        .iter()
        .map(|e| {
            let (host, port) = split_address(&e.listening_address);
            DirectoryRow {
                name: e.display_name.clone(),
                address: e.listening_address.clone(),
                connect: format!("ssh -J {} -p {} {}@{}", jump_host, port, e.proxy_user, host),
            }
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Split `host:port`, unbracketing IPv6 hosts
fn split_address(address: &str) -> (&str, &str) {
    match address.rsplit_once(':') {
        Some((host, port)) => (host.trim_start_matches('[').trim_end_matches(']'), port),
        None => (address, "22"),
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red to stderr
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning in yellow
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Yellow),
        Print("! "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in blue
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Blue),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

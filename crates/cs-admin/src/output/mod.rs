//! Output formatting utilities for the console
//!
//! Tables for terminal listings, one-line renderings of server pushes and
//! colored status messages.

use tabled::{settings::Style, Table, Tabled};

use cs_core::rpc::TerminalInfo;
use cs_core::types::TerminalId;

use crate::client::AdminNotification;

/// Format terminals as an ASCII table
///
/// Returns "No terminals registered" for an empty list.
pub fn format_terminals(terminals: &[(TerminalId, TerminalInfo)]) -> String {
    if terminals.is_empty() {
        return "No terminals registered".to_string();
    }

    #[derive(Tabled)]
    struct TerminalRow {
        #[tabled(rename = "ID")]
        id: u32,
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "STATUS")]
        status: &'static str,
    }

    let rows: Vec<TerminalRow> = terminals
        .iter()
        .map(|(id, info)| TerminalRow {
            id: id.as_u32(),
            name: info.name.clone(),
            status: status_label(info.online),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format one terminal's details
pub fn format_terminal(id: TerminalId, info: &TerminalInfo) -> String {
    format!(
        "Terminal {}\nName: {}\nStatus: {}\n",
        id,
        info.name,
        status_label(info.online)
    )
}

/// Render a pushed event as one line
pub fn format_notification(event: &AdminNotification) -> String {
    match event {
        AdminNotification::TerminalAdded(id) => format!("terminal {} added", id),
        AdminNotification::TerminalRemoved(id) => format!("terminal {} removed", id),
        AdminNotification::TerminalStatusChanged { id, online } => {
            format!("terminal {} is now {}", id, status_label(*online))
        }
    }
}

fn status_label(online: bool) -> &'static str {
    if online {
        "online"
    } else {
        "offline"
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

/// Print an error message in red with an X prefix
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

/// Print a warning message in yellow
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

//! Info command implementation

use anyhow::Result;

use cs_core::types::TerminalId;

use crate::client::AdminClient;
use crate::output::{format_terminal, print_error};

/// Execute the info command
pub async fn info_command(client: &AdminClient, id: TerminalId) -> Result<()> {
    let info = match client.terminal_info(id).await {
        Ok(info) => info,
        Err(e) => {
            print_error(&format!("Terminal {}: {}", id, e));
            return Err(e.into());
        }
    };

    print!("{}", format_terminal(id, &info));
    Ok(())
}

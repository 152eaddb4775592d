//! List command implementation

use anyhow::Result;

use cs_core::rpc::{AdminError, RpcError};

use crate::client::AdminClient;
use crate::output::{format_terminals, print_error};

/// Execute the list command
pub async fn list_command(client: &AdminClient, online_only: bool) -> Result<()> {
    let ids = match client.list_terminals().await {
        Ok(ids) => ids,
        Err(e) => {
            print_error(&format!("Failed to list terminals: {}", e));
            return Err(e.into());
        }
    };

    let mut terminals = Vec::with_capacity(ids.len());
    for id in ids {
        match client.terminal_info(id).await {
            Ok(info) if online_only && !info.online => {}
            Ok(info) => terminals.push((id, info)),
            // Removed between the two calls
            Err(RpcError::Declared(AdminError::NoSuchObject)) => {}
            Err(e) => {
                print_error(&format!("Failed to query terminal {}: {}", id, e));
                return Err(e.into());
            }
        }
    }

    println!("{}", format_terminals(&terminals));
    Ok(())
}

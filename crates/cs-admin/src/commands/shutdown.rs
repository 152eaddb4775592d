//! Shutdown command implementation

use anyhow::Result;

use cs_core::types::TerminalId;

use crate::client::AdminClient;
use crate::output::{print_error, print_success, print_warning};

/// Execute the shutdown command
pub async fn shutdown_command(client: &AdminClient, ids: &[TerminalId], force: bool) -> Result<()> {
    if ids.is_empty() {
        print_error("No terminals specified");
        return Ok(());
    }

    if !force && ids.len() > 1 {
        print_warning(&format!(
            "About to shut down {} terminals. Use --force to skip confirmation.",
            ids.len()
        ));

        print!("Continue? [y/N] ");
        std::io::Write::flush(&mut std::io::stdout())?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            print_warning("Aborted");
            return Ok(());
        }
    }

    let mut failed = 0;

    for id in ids {
        match client.shutdown_terminal(*id).await {
            Ok(()) => print_success(&format!("Shut down terminal {}", id)),
            Err(e) => {
                print_error(&format!("Failed to shut down terminal {}: {}", id, e));
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("Failed to shut down {} terminal(s)", failed);
    }

    Ok(())
}

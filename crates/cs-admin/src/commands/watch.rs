//! Watch command implementation

use anyhow::Result;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::client::AdminNotification;
use crate::output::{format_notification, print_warning};

/// Print server pushes until cancelled or the stream ends
pub async fn watch_command(
    mut events: broadcast::Receiver<AdminNotification>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = events.recv() => event,
        };

        match event {
            Ok(event) => println!("{}", format_notification(&event)),
            Err(RecvError::Lagged(missed)) => {
                print_warning(&format!("Missed {} events; run `list` to resync", missed));
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

//! Control-channel runtime
//!
//! Pumps [`ControlMessage`]s over one long-lived sub-channel. Malformed or
//! unknown messages are logged and skipped; only the end of the stream
//! stops the channel.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use cs_protocol::{ControlCodec, ControlMessage};

use crate::error::TransportError;
use crate::mux::SubChannel;

/// Sending half of a running control channel
#[derive(Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<ControlMessage>,
    closed: CancellationToken,
}

impl ControlSender {
    /// Queue a message for the peer
    pub fn send(&self, message: ControlMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::SessionClosed);
        }
        self.tx.send(message).map_err(|_| TransportError::SessionClosed)
    }

    /// Half-close after flushing queued messages
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the channel has stopped
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channel has stopped
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Entry point for control channels
pub struct ControlChannel;

impl ControlChannel {
    /// Attach to a stream; returns the sender and the stream of received messages
    pub fn spawn<S: SubChannel>(
        stream: S,
    ) -> (ControlSender, mpsc::UnboundedReceiver<ControlMessage>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ControlMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let mut messages = FramedRead::new(read_half, ControlCodec::new());
            loop {
                let next = tokio::select! {
                    next = messages.next() => next,
                    _ = reader_closed.cancelled() => break,
                };
                match next {
                    Some(Ok(Ok(message))) => {
                        tracing::debug!("Got control message: {:?}", message);
                        if in_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Err(e))) => tracing::warn!("Discarding control message: {}", e),
                    Some(Err(e)) => {
                        tracing::warn!("Control channel read failed: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            tracing::debug!("Control channel closed");
            reader_closed.cancel();
        });

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, ControlCodec::new());
            loop {
                let message = tokio::select! {
                    biased;
                    message = out_rx.recv() => message,
                    _ = writer_closed.cancelled() => None,
                };
                let Some(message) = message else { break };
                if let Err(e) = sink.send(message).await {
                    tracing::warn!("Control channel write failed: {}", e);
                    writer_closed.cancel();
                    return;
                }
            }
            while let Ok(message) = out_rx.try_recv() {
                if sink.feed(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        (ControlSender { tx: out_tx, closed }, in_rx)
    }
}

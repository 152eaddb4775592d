//! Persistent bidirectional remote-call channel
//!
//! An [`RpcChannel`] runs over one sub-channel byte stream. Both peers may
//! call each other; outstanding calls are kept in a pending map keyed by
//! [`CallId`] and resolved when the matching answer arrives, in any order.
//! When the stream ends every pending call resolves with
//! [`RpcError::Closed`]. Notifications are handled sequentially in the
//! order they arrive.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use cs_protocol::{CallId, RpcCodec, RpcErrorBody, RpcFrame, RpcMessage};

use super::operation::{DeclaredError, Notification, Operation, RpcError};
use super::table::OperationTable;
use crate::mux::SubChannel;

type Reply = Result<Vec<u8>, RpcErrorBody>;

struct Inner {
    label: String,
    outgoing: mpsc::UnboundedSender<RpcFrame>,
    pending: DashMap<CallId, oneshot::Sender<Reply>>,
    next_id: AtomicU32,
    closed: CancellationToken,
}

impl Inner {
    fn next_call_id(&self) -> CallId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != CallId::NOTIFY.as_u32() {
                return CallId::new(id);
            }
        }
    }

    fn shut(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!("Remote-call channel {} closed", self.label);
        }
        self.closed.cancel();
        // Dropping the senders resolves every waiter with Closed
        self.pending.clear();
    }
}

/// Removes a pending entry if the call future is dropped early
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.id);
    }
}

/// Handle to a running remote-call channel
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<Inner>,
}

impl RpcChannel {
    /// Attach the protocol to a byte stream and start pumping
    ///
    /// Incoming calls are answered from `table`.
    pub fn spawn<S>(stream: S, table: Arc<OperationTable>, label: impl Into<String>) -> Self
    where
        S: SubChannel,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            label: label.into(),
            outgoing,
            pending: DashMap::new(),
            next_id: AtomicU32::new(1),
            closed: CancellationToken::new(),
        });

        let (notifications, notifications_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(write_half, outgoing_rx, inner.closed.clone()));
        tokio::spawn(notify_loop(notifications_rx));
        tokio::spawn(read_loop(read_half, table, notifications, Arc::clone(&inner)));

        Self { inner }
    }

    /// Call a remote operation and wait for its answer
    pub async fn call<O: Operation>(&self, args: O::Args) -> Result<O::Output, RpcError<O::Error>> {
        let inner = &*self.inner;
        if inner.closed.is_cancelled() {
            return Err(RpcError::Closed);
        }

        let args = bincode::serialize(&args)
            .map_err(|e| RpcError::failure(format!("cannot encode arguments: {}", e)))?;

        let id = inner.next_call_id();
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);
        let _guard = PendingGuard { inner, id };

        tracing::debug!("{} -> {} {}", inner.label, id, O::NAME);
        let frame = RpcFrame::new(
            id,
            RpcMessage::Call {
                operation: O::NAME.to_string(),
                args,
            },
        );
        if inner.outgoing.send(frame).is_err() {
            return Err(RpcError::Closed);
        }

        let reply = tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| RpcError::Closed)?,
            _ = inner.closed.cancelled() => return Err(RpcError::Closed),
        };

        match reply {
            Ok(raw) => bincode::deserialize(&raw)
                .map_err(|e| RpcError::failure(format!("malformed result of {}: {}", O::NAME, e))),
            Err(RpcErrorBody::Declared { code, message }) => {
                match O::Error::from_wire(&code, &message) {
                    Some(e) => Err(RpcError::Declared(e)),
                    None => Err(RpcError::failure(format!(
                        "undeclared error {} from {}: {}",
                        code,
                        O::NAME,
                        message
                    ))),
                }
            }
            Err(RpcErrorBody::Failure { reason }) => Err(RpcError::Failure { reason }),
        }
    }

    /// Send a one-way notification
    pub fn notify<N: Notification>(&self, args: N::Args) -> Result<(), RpcError<std::convert::Infallible>> {
        if self.inner.closed.is_cancelled() {
            return Err(RpcError::Closed);
        }
        let args = bincode::serialize(&args)
            .map_err(|e| RpcError::failure(format!("cannot encode arguments: {}", e)))?;
        let frame = RpcFrame::new(
            CallId::NOTIFY,
            RpcMessage::Notify {
                operation: N::NAME.to_string(),
                args,
            },
        );
        self.inner.outgoing.send(frame).map_err(|_| RpcError::Closed)
    }

    /// Number of calls awaiting an answer
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stop the channel; queued frames are flushed, then the write side is closed
    pub fn close(&self) {
        self.inner.shut();
    }

    /// Whether the channel has stopped
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the channel has stopped
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }
}

async fn read_loop<R>(
    read_half: R,
    table: Arc<OperationTable>,
    notifications: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    inner: Arc<Inner>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut frames = FramedRead::new(read_half, RpcCodec::new());

    loop {
        let next = tokio::select! {
            next = frames.next() => next,
            _ = inner.closed.cancelled() => break,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                // Framing cannot resynchronise after a bad header
                tracing::warn!("Protocol error on {}: {}", inner.label, e);
                break;
            }
            None => break,
        };

        match frame.message {
            RpcMessage::Call { operation, args } => {
                tracing::debug!("{} <- {} {}", inner.label, frame.call_id, operation);
                let reply = table.dispatch(&operation, args);
                let outgoing = inner.outgoing.clone();
                let call_id = frame.call_id;
                tokio::spawn(async move {
                    let message = match reply.await {
                        Ok(result) => RpcMessage::Answer { result },
                        Err(body) => RpcMessage::Error(body),
                    };
                    let _ = outgoing.send(RpcFrame::new(call_id, message));
                });
            }
            RpcMessage::Notify { operation, args } => {
                tracing::debug!("{} <- notify {}", inner.label, operation);
                if let Some(task) = table.dispatch_notification(&operation, args) {
                    let _ = notifications.send(task);
                }
            }
            RpcMessage::Answer { result } => resolve(&inner, frame.call_id, Ok(result)),
            RpcMessage::Error(body) => resolve(&inner, frame.call_id, Err(body)),
        }
    }

    inner.shut();
}

/// Run notification handlers one at a time, in arrival order
async fn notify_loop(mut tasks: mpsc::UnboundedReceiver<BoxFuture<'static, ()>>) {
    while let Some(task) = tasks.recv().await {
        task.await;
    }
}

fn resolve(inner: &Inner, id: CallId, reply: Reply) {
    match inner.pending.remove(&id) {
        Some((_, waiter)) => {
            let _ = waiter.send(reply);
        }
        None => tracing::warn!("Answer for unknown {} on {}", id, inner.label),
    }
}

async fn write_loop<W>(
    write_half: W,
    mut outgoing: mpsc::UnboundedReceiver<RpcFrame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut sink = FramedWrite::new(write_half, RpcCodec::new());

    loop {
        let frame = tokio::select! {
            biased;
            frame = outgoing.recv() => frame,
            _ = closed.cancelled() => None,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = sink.send(frame).await {
            tracing::warn!("Failed to write frame: {}", e);
            closed.cancel();
            return;
        }
    }

    // Flush what was queued before the close
    while let Ok(frame) = outgoing.try_recv() {
        if sink.feed(frame).await.is_err() {
            break;
        }
    }
    // Half-close: the peer sees EOF but may still deliver what it has in flight
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ops::{GetTerminalInfo, Ping, ShutdownTerminal, TerminalStatusChanged};
    use crate::rpc::{AdminError, HandlerError, TerminalInfo};
    use crate::types::TerminalId;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn pair(left: OperationTable, right: OperationTable) -> (RpcChannel, RpcChannel) {
        let (a, b) = tokio::io::duplex(4096);
        (
            RpcChannel::spawn(a, Arc::new(left), "left"),
            RpcChannel::spawn(b, Arc::new(right), "right"),
        )
    }

    fn server_table(gate: Arc<Notify>) -> OperationTable {
        let mut table = OperationTable::new();
        table.register::<Ping, _, _>(|()| async { Ok(()) }).unwrap();
        table
            .register::<GetTerminalInfo, _, _>(move |id: TerminalId| {
                let gate = Arc::clone(&gate);
                async move {
                    if id.as_u32() == 1 {
                        // Held until the test releases it
                        gate.notified().await;
                    }
                    if id.as_u32() == 7 {
                        panic!("handler bug");
                    }
                    if id.as_u32() > 10 {
                        return Err(HandlerError::Declared(AdminError::NoSuchObject));
                    }
                    Ok(TerminalInfo {
                        name: id.default_name(),
                        online: false,
                    })
                }
            })
            .unwrap();
        table
    }

    #[tokio::test]
    async fn test_call_and_declared_error() {
        let (client, _server) = pair(OperationTable::new(), server_table(Arc::new(Notify::new())));

        client.call::<Ping>(()).await.unwrap();

        let info = client.call::<GetTerminalInfo>(TerminalId::new(4)).await.unwrap();
        assert_eq!(info.name, "PC#4");

        let err = client
            .call::<GetTerminalInfo>(TerminalId::new(99))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Declared(AdminError::NoSuchObject)));
    }

    #[tokio::test]
    async fn test_unknown_operation_is_failure() {
        let (client, _server) = pair(OperationTable::new(), server_table(Arc::new(Notify::new())));
        let err = client
            .call::<ShutdownTerminal>(TerminalId::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Failure { ref reason } if reason == "no such operation"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_internal_error() {
        let (client, _server) = pair(OperationTable::new(), server_table(Arc::new(Notify::new())));
        let err = client
            .call::<GetTerminalInfo>(TerminalId::new(7))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Failure { ref reason } if reason == "internal error"));

        // The channel survives the panic
        client.call::<Ping>(()).await.unwrap();
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_pipelined_calls_complete_out_of_order() {
        let gate = Arc::new(Notify::new());
        let (client, _server) = pair(OperationTable::new(), server_table(Arc::clone(&gate)));

        let slow = {
            let client = client.clone();
            tokio::spawn(async move { client.call::<GetTerminalInfo>(TerminalId::new(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_calls(), 1);

        let fast = client.call::<GetTerminalInfo>(TerminalId::new(2)).await.unwrap();
        assert_eq!(fast.name, "PC#2");
        assert!(!slow.is_finished());

        gate.notify_one();
        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.name, "PC#1");
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_both_sides_can_call() {
        let (left, right) = pair(
            server_table(Arc::new(Notify::new())),
            server_table(Arc::new(Notify::new())),
        );
        left.call::<Ping>(()).await.unwrap();
        right.call::<Ping>(()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_resolves_pending_calls() {
        let gate = Arc::new(Notify::new());
        let (client, server) = pair(OperationTable::new(), server_table(gate));

        let waiting = {
            let client = client.clone();
            tokio::spawn(async move { client.call::<GetTerminalInfo>(TerminalId::new(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.close();
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(RpcError::Closed)));
        client.closed().await;
        assert!(matches!(client.call::<Ping>(()).await, Err(RpcError::Closed)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_notifications_are_delivered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut table = OperationTable::new();
        table
            .register_notification::<TerminalStatusChanged, _, _>(move |args| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(args);
                }
            })
            .unwrap();

        let (admin, server) = pair(table, OperationTable::new());
        server
            .notify::<TerminalStatusChanged>((TerminalId::new(7), true))
            .unwrap();
        assert_eq!(rx.recv().await, Some((TerminalId::new(7), true)));
        drop(admin);
    }

    #[tokio::test]
    async fn test_notifications_keep_their_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut table = OperationTable::new();
        table
            .register_notification::<TerminalStatusChanged, _, _>(move |(id, _): (TerminalId, bool)| {
                let tx = tx.clone();
                async move {
                    // Later notifications finish faster
                    let delay = 20u64.saturating_sub(id.as_u32() as u64);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let _ = tx.send(id.as_u32());
                }
            })
            .unwrap();

        let (_admin, server) = pair(table, OperationTable::new());
        for id in 0..20 {
            server
                .notify::<TerminalStatusChanged>((TerminalId::new(id), true))
                .unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 20 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }
}

//! Sub-channel multiplexing
//!
//! A transport session carries many named sub-channels. Opening side:
//! [`open_channel`] asks a [`SubChannelOpener`] for a stream and only then
//! builds the protocol on it. Accepting side: [`ChannelAcceptors`] maps
//! service kinds to handlers; any name outside the registered set is
//! rejected before a stream is created.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use cs_protocol::{ProtocolError, ServiceKind, ServiceName};

use crate::error::TransportError;

/// Byte stream of one sub-channel
///
/// Reads deliver bytes in arrival order; writes are flushed in order;
/// `shutdown` half-closes the write side.
pub trait SubChannel: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> SubChannel for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased sub-channel stream
pub type BoxedStream = Box<dyn SubChannel>;

/// Something that can open named sub-channels
#[async_trait]
pub trait SubChannelOpener: Send + Sync {
    /// Request a sub-channel for `service`
    async fn open_sub_channel(&self, service: &ServiceName) -> Result<BoxedStream, TransportError>;
}

/// Open a sub-channel and attach a protocol built by `factory`
///
/// `factory` runs only if the channel was opened.
pub async fn open_channel<O, P, F>(
    opener: &O,
    service: ServiceName,
    factory: F,
) -> Result<P, TransportError>
where
    O: SubChannelOpener + ?Sized,
    F: FnOnce(BoxedStream) -> P,
{
    match opener.open_sub_channel(&service).await {
        Ok(stream) => {
            tracing::debug!("Opened sub-channel {}", service);
            Ok(factory(stream))
        }
        Err(e) => {
            tracing::warn!("Failed to open sub-channel {}: {}", service, e);
            Err(e)
        }
    }
}

/// Handler for inbound sub-channels of one kind
pub type AcceptFn<C> = Arc<dyn Fn(C, ServiceName, BoxedStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Accepting-side registry: service kind to handler
pub struct ChannelAcceptors<C> {
    routes: HashMap<ServiceKind, AcceptFn<C>>,
}

impl<C> Clone for ChannelAcceptors<C> {
    fn clone(&self) -> Self {
        Self {
            routes: self.routes.clone(),
        }
    }
}

impl<C> Default for ChannelAcceptors<C> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<C: Send + 'static> ChannelAcceptors<C> {
    /// Empty registry; every request is rejected
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler run once per inbound channel of `kind`
    pub fn accept_channel<F, Fut>(&mut self, kind: ServiceKind, handler: F)
    where
        F: Fn(C, ServiceName, BoxedStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: AcceptFn<C> = Arc::new(move |ctx, service, stream| handler(ctx, service, stream).boxed());
        if self.routes.insert(kind, handler).is_some() {
            tracing::warn!("Replaced acceptor for {:?}", kind);
        }
    }

    /// Check a requested name against the registered services
    pub fn resolve(&self, name: &str) -> Result<(ServiceName, AcceptFn<C>), ProtocolError> {
        let service = ServiceName::parse(name)?;
        match self.routes.get(&service.kind()) {
            Some(handler) => Ok((service, Arc::clone(handler))),
            None => Err(ProtocolError::DisallowedService(name.to_string())),
        }
    }
}

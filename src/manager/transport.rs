use std::sync::Arc;
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::error::{Result, TransportError};
use crate::host_information::HostInformation;
use crate::message::Message;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectionTypes: u8 {
        /// the default connection to a host
        const PERSISTENT = 0x01;
        /// connections opened under an explicit connection name
        const NAMED = 0x02;
        /// short-lived connections for a single invocation
        const INVOCATION = 0x04;
        const ALL = 0x07;
    }
}

/// Receives complete inbound streams from a transport. Implementations must return quickly:
///  this is called on the transport's receive loop.
#[cfg_attr(test, automock)]
pub trait IncomingStreamHandler: Send + Sync + 'static {
    fn on_stream(&self, sender: Arc<HostInformation>, content: Bytes);
}

/// The wire-specific part of a connection manager. The send pipeline, security sessions and
///  inbound dispatch are shared; a transport only moves serialized messages.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// the URI under which remote hosts know this endpoint
    fn local_uri(&self) -> String;

    /// Sends a message's serialized content, returning the number of bytes written. The message
    ///  is always serialized when this is called.
    async fn internal_send(&self, message: &Message) -> Result<usize>;

    async fn start_listening(&self, handler: Arc<dyn IncomingStreamHandler>) -> Result<()>;

    async fn stop_listening(&self) -> Result<()>;

    /// Closes all connections matching the host filter (`None` for all hosts) and the type
    ///  mask, returning the number of connections closed.
    async fn release_connections(&self, host: Option<Arc<HostInformation>>, types: ConnectionTypes, reason: TransportError) -> usize;

    /// final teardown, called exactly once by the connection manager
    async fn internal_dispose(&self, reason: TransportError);
}

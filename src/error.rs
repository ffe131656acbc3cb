use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

/// All failures surfaced by the transport core.
///
/// The enum is `Clone` because a single failure is often reported to several parties: all
///  senders waiting on one security session establishment, or every late caller of a disposed
///  connection manager.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("server {uri} did not reply in time")]
    ServerDidNotReply { uri: String },

    #[error("security session '{name}' failed: {cause}")]
    SecurityFailure { name: String, cause: String },

    #[error("security context '{name}' was not established")]
    SecurityContextNotEstablished { name: String },

    #[error("send queue for {uri} is overloaded (more than {max_items} queued messages)")]
    QueueOverloaded { uri: String, max_items: usize },

    #[error("channel was closed")]
    ChannelClosed,

    #[error("remote host {uri} restarted")]
    ServerRestarted { uri: String },

    #[error("client {uri} did not reconnect within the timeout")]
    ClientDidNotReconnectWithinTimeout { uri: String },

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("protocol desynchronization: {0}")]
    ProtocolDesync(String),

    #[error("connection shut down: {0}")]
    ConnectionShutDown(String),

    #[error("connection to {uri} closed after inactivity timeout")]
    ConnectionClosedAfterTimeout { uri: String },

    #[error("connection manager was disposed: {reason}")]
    Disposed { reason: Arc<TransportError> },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("logic error: {0}")]
    Logic(String),

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("thread pool limit of {max_threads} threads exceeded")]
    ThreadPoolLimitExceeded { max_threads: usize },

    #[error("no service registered under '{0}'")]
    UnknownService(String),

    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),
}

impl TransportError {
    /// Critical failures always destroy the connection they occurred on. Retrying (if at all) is
    ///  the responsibility of the layer above.
    ///
    /// NB: this is a closed set - transport specific failures (e.g. `Io`) are not critical
    pub fn is_critical(&self) -> bool {
        matches!(self,
            TransportError::QueueOverloaded { .. }
            | TransportError::ChannelClosed
            | TransportError::ServerRestarted { .. }
            | TransportError::ClientDidNotReconnectWithinTimeout { .. }
            | TransportError::ConnectionClosed(_)
            | TransportError::ProtocolDesync(_)
            | TransportError::ConnectionShutDown(_)
            | TransportError::ConnectionClosedAfterTimeout { .. }
        )
    }

    pub fn malformed(msg: impl Into<String>) -> TransportError {
        TransportError::MalformedInput(msg.into())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        TransportError::Io(Arc::new(value))
    }
}

impl From<bytes_varint::VarIntError> for TransportError {
    fn from(value: bytes_varint::VarIntError) -> Self {
        TransportError::MalformedInput(value.to_string())
    }
}

impl From<bytes::TryGetError> for TransportError {
    fn from(value: bytes::TryGetError) -> Self {
        TransportError::MalformedInput(value.to_string())
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(value: anyhow::Error) -> Self {
        TransportError::Configuration(format!("{:#}", value))
    }
}

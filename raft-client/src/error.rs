//! Error types exposed by the client.

use std::sync::Arc;

use crate::protocol::ErrorCode;
use crate::Address;

/// The result type returned by all client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// A transport-level failure reported by a [`Transport`](crate::network::Transport)
/// implementation.
///
/// All variants are retriable from the connection manager's point of view: any of them provokes
/// failover to the next candidate server in the current sweep.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    /// The target server refused or could not accept the connection.
    #[error("connection refused by {0}")]
    ConnectionRefused(Address),
    /// The operation did not complete within the transport's deadline.
    #[error("transport operation timed out")]
    Timeout,
    /// The underlying channel was closed while the operation was in flight.
    #[error("channel closed")]
    ChannelClosed,
    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Other(Arc<anyhow::Error>),
}

impl TransportError {
    /// Wrap an arbitrary error as a generic transport failure.
    pub fn other(err: anyhow::Error) -> Self {
        Self::Other(Arc::new(err))
    }
}

/// An error returned through the public submission and lifecycle APIs.
///
/// The inner transport error is reference counted so that a single failure can complete every
/// waiter that piggybacked on the same connect attempt.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientError {
    /// The client has no open session; `open()` must complete first.
    #[error("client is not open")]
    NotOpen,
    /// The client has been closed and accepts no further operations.
    #[error("client is closed")]
    Closed,
    /// The session lease lapsed; all pending operations were abandoned by the cluster.
    #[error("session expired")]
    SessionExpired,
    /// A full sweep of the cluster found no reachable server.
    #[error("no reachable server in the cluster")]
    ConnectFailed,
    /// The cluster rejected the operation with a terminal error code.
    #[error("operation rejected by the cluster: {0:?}")]
    Operation(ErrorCode),
    /// A response arrived that does not match the request that was sent.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The client core task is shutting down.
    #[error("client is shutting down")]
    ShuttingDown,
    /// A transport failure that escaped the failover machinery.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The client was constructed from an invalid configuration.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl ClientError {
    /// Check whether this error indicates the session can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::Closed | Self::ShuttingDown)
    }
}

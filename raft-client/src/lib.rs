//! A fault-tolerant session client for Raft-replicated state machine clusters.
//!
//! The client maintains a single live connection into the cluster, biased toward
//! the last known leader, and layers an ordered submission pipeline and a
//! long-lived session (keep-alives, server-published events) on top of it. The
//! wire transport is pluggable via the [`Transport`] trait; an in-memory
//! implementation for testing lives in the sibling `memnet` crate.

pub mod client;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod network;
pub mod protocol;

use std::fmt;
use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

pub use crate::client::Operation;
pub use crate::client::RaftClient;
pub use crate::client::SessionEvent;
pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::Lifecycle;
pub use crate::error::ClientError;
pub use crate::error::ClientResult;
pub use crate::error::TransportError;
pub use crate::metrics::ClientMetrics;
pub use crate::metrics::SessionInfo;
pub use crate::metrics::Wait;
pub use crate::network::Connection;
pub use crate::network::Transport;

/// A trait defining application specific operation payloads.
///
/// The intention of this trait is that applications which are using this crate define the payload
/// types their state machine accepts, and that their payload types implement this trait.
///
/// ## Note
/// The trait is automatically implemented for any type which satisfies its bounds, so
/// applications should only ever need to derive `Serialize`, `Deserialize`, `Clone` and `Debug`.
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait defining application specific operation response data.
///
/// This is the type returned from applying a command or query to the replicated state machine,
/// and it is also the payload type of server-published session events. The trait is automatically
/// implemented for any type which satisfies its bounds.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// The network location of a Raft server, comparable by value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    /// The host name or IP of the server.
    pub host: String,
    /// The port the server accepts client connections on.
    pub port: u16,
}

impl Address {
    /// Create a new instance.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A trait to summarize a message for logging without dumping full payloads.
pub trait MessageSummary {
    /// Return a brief, log-friendly summary of the message.
    fn summary(&self) -> String;
}

//! Observable client state.
//!
//! The client core publishes a [`ClientMetrics`] snapshot on a `watch` channel every time a
//! user-visible piece of state changes. [`Wait`] wraps the channel with condition helpers so
//! that tests and callers can await a particular state without polling.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::Lifecycle;
use crate::protocol::SessionId;
use crate::Address;

/// A snapshot of the session granted by the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// The cluster-assigned session id.
    pub session_id: SessionId,
    /// The granted session timeout. The keep-alive period is derived from this value.
    pub timeout: Duration,
}

/// A set of metrics describing the current state of the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientMetrics {
    /// The client's stable identifier.
    pub client_id: String,
    /// The lifecycle state of the client.
    pub lifecycle: Lifecycle,
    /// The currently registered session, if any.
    pub session: Option<SessionInfo>,
    /// The last known cluster leader.
    pub leader: Option<Address>,
    /// The last known cluster membership.
    pub members: Vec<Address>,
    /// The highest sequence the client has submitted and received a response for.
    pub acked_sequence: u64,
    /// The highest session-event index delivered to listeners.
    pub event_index: u64,
}

impl ClientMetrics {
    pub(crate) fn new_initial(client_id: String, members: Vec<Address>) -> Self {
        Self {
            client_id,
            lifecycle: Lifecycle::Idle,
            session: None,
            leader: None,
            members,
            acked_sequence: 0,
            event_index: 0,
        }
    }
}

/// Error variants related to metrics waiting.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("client is shut down")]
    Shutdown,
}

/// A wait handle to await a condition on the client's metrics channel.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<ClientMetrics>,
}

impl Wait {
    /// Wait for `func` to return true on the metrics, or until the timeout expires.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<ClientMetrics, WaitError>
    where T: Fn(&ClientMetrics) -> bool {
        let timeout_at = tokio::time::Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }
            let delay = timeout_at.saturating_duration_since(tokio::time::Instant::now());
            match timeout(delay, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(WaitError::Shutdown),
                Err(_) => return Err(WaitError::Timeout(self.timeout, msg.to_string())),
            }
        }
    }

    /// Wait for the client to reach the given lifecycle state.
    pub async fn lifecycle(&self, want: Lifecycle, msg: impl ToString) -> Result<ClientMetrics, WaitError> {
        self.metrics(|m| m.lifecycle == want, msg).await
    }

    /// Wait for the last known leader to become the given value.
    pub async fn leader(&self, want: Option<Address>, msg: impl ToString) -> Result<ClientMetrics, WaitError> {
        self.metrics(|m| m.leader == want, msg).await
    }

    /// Wait for the delivered event index to reach at least the given value.
    pub async fn event_index(&self, want: u64, msg: impl ToString) -> Result<ClientMetrics, WaitError> {
        self.metrics(|m| m.event_index >= want, msg).await
    }

    /// Wait for the acked sequence to reach at least the given value.
    pub async fn acked_sequence(&self, want: u64, msg: impl ToString) -> Result<ClientMetrics, WaitError> {
        self.metrics(|m| m.acked_sequence >= want, msg).await
    }
}

//! Public client interface and data types.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::ClientCore;
use crate::core::Lifecycle;
use crate::error::ClientError;
use crate::error::ClientResult;
use crate::metrics::ClientMetrics;
use crate::metrics::SessionInfo;
use crate::metrics::Wait;
use crate::network::Transport;
use crate::protocol::CommandConsistency;
use crate::protocol::QueryConsistency;
use crate::AppData;
use crate::AppDataResponse;

/// An operation to submit to the replicated state machine.
#[derive(Clone, Debug)]
pub enum Operation<D: AppData> {
    /// A state-mutating command, replicated via the leader.
    Command {
        payload: D,
        consistency: CommandConsistency,
    },
    /// A read-only query; its consistency level decides which replicas may serve it.
    Query {
        payload: D,
        consistency: QueryConsistency,
    },
}

/// A server-published session event as delivered to a subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionEvent<R: AppDataResponse> {
    /// The event's monotone per-session index.
    pub index: u64,
    /// The name the event was published under.
    pub name: String,
    /// The application payload.
    pub payload: R,
}

struct ClientInner<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: Transport<D, R>,
{
    tx_api: mpsc::UnboundedSender<(ClientMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<ClientMetrics>,
    core_handle: Mutex<Option<JoinHandle<ClientResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_t: std::marker::PhantomData<T>,
}

/// The client API.
///
/// This type is the interface to a running client core task. It submits commands and queries
/// to the cluster and manages the session lifecycle on the caller's behalf.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very
/// cheap and helps to facilitate use with async workflows; all clones share one session.
///
/// ### shutting down
/// If any of the interfaces returns a `ClientError::ShuttingDown`, the core task has stopped.
/// Calling `shutdown` terminates the core task and awaits its completion; prefer `close`
/// first for a graceful unregister.
pub struct RaftClient<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: Transport<D, R>,
{
    inner: Arc<ClientInner<D, R, T>>,
}

impl<D, R, T> RaftClient<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: Transport<D, R>,
{
    /// Create and spawn a new client core task.
    ///
    /// ### `config`
    /// The client's runtime config, carrying the bootstrap member list the session will be
    /// established through. See the docs on the `Config` object for more details.
    ///
    /// ### `transport`
    /// An implementation of the `Transport` trait which will be used for connecting to
    /// cluster members and exchanging wire messages with them.
    #[tracing::instrument(level="trace", skip(config, transport), fields(cluster=%config.cluster_name))]
    pub fn new(config: Arc<Config>, transport: Arc<T>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) =
            watch::channel(ClientMetrics::new_initial(config.client_id.clone(), config.members.clone()));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = ClientCore::spawn(config, transport, rx_api, tx_metrics, rx_shutdown);
        let inner = ClientInner {
            tx_api,
            rx_metrics,
            core_handle: Mutex::new(Some(core_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_t: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Open the client, registering a new session with the cluster.
    ///
    /// Idempotent: opening an already open client succeeds immediately, and concurrent
    /// opens share one registration. An open issued while a close is in flight composes
    /// after the close and starts a fresh session.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn open(&self) -> ClientResult<()> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((ClientMsg::Open { tx }, span))
            .map_err(|_| ClientError::ShuttingDown)?;
        rx.await.map_err(|_| ClientError::ShuttingDown).and_then(|res| res)
    }

    /// Close the client, unregistering the session gracefully.
    ///
    /// Waits for the cluster's acknowledgement on a best-effort basis, bounded by the
    /// configured close timeout. A close issued while an open is in flight composes after
    /// the open.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn close(&self) -> ClientResult<()> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((ClientMsg::Close { tx }, span))
            .map_err(|_| ClientError::ShuttingDown)?;
        rx.await.map_err(|_| ClientError::ShuttingDown).and_then(|res| res)
    }

    /// Submit an operation to the cluster and await its result.
    ///
    /// Completions for a session are always delivered in submission order, regardless of
    /// the order in which the cluster resolves them.
    #[tracing::instrument(level = "debug", skip(self, op))]
    pub async fn submit(&self, op: Operation<D>) -> ClientResult<R> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((ClientMsg::Submit { op, tx }, span))
            .map_err(|_| ClientError::ShuttingDown)?;
        rx.await.map_err(|_| ClientError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a command with the given consistency level.
    pub async fn submit_command(&self, payload: D, consistency: CommandConsistency) -> ClientResult<R> {
        self.submit(Operation::Command { payload, consistency }).await
    }

    /// Submit a query with the given consistency level.
    pub async fn submit_query(&self, payload: D, consistency: QueryConsistency) -> ClientResult<R> {
        self.submit(Operation::Query { payload, consistency }).await
    }

    /// Subscribe to session events published under the given name.
    ///
    /// Events arrive in server publication order, without duplicates. The subscription ends
    /// when the session closes or expires.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn on_event(&self, name: impl Into<String> + std::fmt::Debug) -> ClientResult<mpsc::UnboundedReceiver<SessionEvent<R>>> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((ClientMsg::Subscribe { name: name.into(), tx }, span))
            .map_err(|_| ClientError::ShuttingDown)?;
        rx.await.map_err(|_| ClientError::ShuttingDown)
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<ClientMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use raft_client::Lifecycle;
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for the session to be open:
    /// client.wait(Some(timeout)).lifecycle(Lifecycle::Open, "open").await?;
    ///
    /// // wait for the delivered event index to reach 3:
    /// client.wait(Some(timeout)).event_index(3, "events").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(timeout) => timeout,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// The current lifecycle state of the client.
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.rx_metrics.borrow().lifecycle
    }

    /// Check if the client holds an open session.
    pub fn is_open(&self) -> bool {
        self.lifecycle().is_open()
    }

    /// Check if the client has been closed.
    pub fn is_closed(&self) -> bool {
        self.lifecycle().is_closed()
    }

    /// The currently registered session, or `None` when no session is open.
    pub fn session(&self) -> Option<SessionInfo> {
        self.inner.rx_metrics.borrow().session.clone()
    }

    /// Shutdown the client core task without a graceful unregister.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.core_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<D, R, T> Clone for RaftClient<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: Transport<D, R>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A message coming from the client API.
pub(crate) enum ClientMsg<D: AppData, R: AppDataResponse> {
    Open {
        tx: oneshot::Sender<ClientResult<()>>,
    },
    Close {
        tx: oneshot::Sender<ClientResult<()>>,
    },
    Submit {
        op: Operation<D>,
        tx: oneshot::Sender<ClientResult<R>>,
    },
    Subscribe {
        name: String,
        tx: oneshot::Sender<mpsc::UnboundedReceiver<SessionEvent<R>>>,
    },
}

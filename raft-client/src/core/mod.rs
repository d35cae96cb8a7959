//! The core logic of the client.
//!
//! All client state lives on a single spawned task. Public API calls, transport callbacks,
//! keep-alive firings and event deliveries are funneled into it over channels, which is what
//! serializes every user-visible completion and state transition.

mod connection;
mod selector;
mod session;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::client::ClientMsg;
use crate::client::SessionEvent;
use crate::config::Config;
use crate::core::connection::ActiveConnection;
use crate::core::connection::CoreEvent;
use crate::core::connection::Waiter;
use crate::core::selector::AddressSelector;
use crate::core::session::PendingRequest;
use crate::core::session::PendingState;
use crate::core::session::RequestKind;
use crate::core::session::SessionState;
use crate::error::ClientError;
use crate::error::ClientResult;
use crate::metrics::ClientMetrics;
use crate::metrics::SessionInfo;
use crate::network::Transport;
use crate::protocol::ClientRequest;
use crate::protocol::PublishEvent;
use crate::protocol::UnregisterRequest;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;

/// All possible lifecycle states of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lifecycle {
    /// The client has been built but no session has been opened yet.
    Idle,
    /// A session registration is in flight.
    Opening,
    /// A session is registered and the client accepts submissions.
    Open,
    /// A graceful unregister is in flight.
    Closing,
    /// The client has been closed and accepts no further operations.
    Closed,
    /// The session lease lapsed. Terminal for the session; a new `open()` starts a fresh one.
    Expired,
}

impl Lifecycle {
    /// Check if the client currently holds a registered session.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if the client has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// The core type implementing the client protocol.
pub(crate) struct ClientCore<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: Transport<D, R>,
{
    /// This client's runtime config.
    config: Arc<Config>,
    /// The wire transport implementation.
    transport: Arc<T>,

    /// The lifecycle state of the client.
    lifecycle: Lifecycle,

    /// The leader-biased iterator over candidate servers.
    selector: AddressSelector,
    /// The single live connection, if any.
    conn: Option<ActiveConnection<T::Conn>>,
    /// Identity source for connections, used to detect races against stale handles.
    next_conn_id: u64,
    /// Whether a connect sweep is currently underway. While true, no new transport
    /// `connect` is issued; newcomers enqueue on `connect_waiters`.
    connect_in_flight: bool,
    /// The FIFO of work waiting for the in-flight connect to produce a connection.
    connect_waiters: Vec<Waiter>,

    /// The registered session, if any.
    session: Option<SessionState>,
    /// The next sequence to assign. Keep-alives and the closing unregister share this
    /// space with user submissions.
    next_sequence: u64,
    /// The highest sequence which has received a response from the cluster.
    acked_sequence: u64,
    /// The highest state machine index observed in responses, attached to queries.
    response_index: u64,
    /// Requests which have been assigned a sequence and not yet completed, in order.
    ///
    /// Responses may resolve out of order; completions are drained from the front of this
    /// map so callers always observe them in submission order.
    pending: BTreeMap<u64, PendingRequest<D, R>>,

    /// When the next keep-alive fires, if a session is active.
    keepalive_at: Option<Instant>,
    /// The bound on the graceful close currently in progress, if any.
    close_deadline: Option<Instant>,

    /// The highest event index delivered to listeners.
    last_event_index: u64,
    /// Out-of-order events buffered until the gap before them is filled.
    event_buffer: BTreeMap<u64, PublishEvent<R>>,
    /// Event name → live subscriptions.
    subscriptions: HashMap<String, Vec<mpsc::UnboundedSender<SessionEvent<R>>>>,

    /// Callers waiting for the in-flight open.
    open_waiters: Vec<oneshot::Sender<ClientResult<()>>>,
    /// Callers waiting for the in-flight close.
    close_waiters: Vec<oneshot::Sender<ClientResult<()>>>,
    /// Opens queued behind an in-flight close.
    deferred_opens: Vec<oneshot::Sender<ClientResult<()>>>,
    /// Closes queued behind an in-flight open.
    deferred_closes: Vec<oneshot::Sender<ClientResult<()>>>,

    rx_api: mpsc::UnboundedReceiver<(ClientMsg<D, R>, Span)>,
    tx_internal: mpsc::UnboundedSender<CoreEvent<T::Conn, R>>,
    rx_internal: mpsc::UnboundedReceiver<CoreEvent<T::Conn, R>>,
    tx_publish: mpsc::UnboundedSender<PublishEvent<R>>,
    rx_publish: mpsc::UnboundedReceiver<PublishEvent<R>>,
    tx_metrics: watch::Sender<ClientMetrics>,
}

impl<D, R, T> ClientCore<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: Transport<D, R>,
{
    pub(crate) fn spawn(
        config: Arc<Config>,
        transport: Arc<T>,
        rx_api: mpsc::UnboundedReceiver<(ClientMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<ClientMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<ClientResult<()>> {
        let (tx_internal, rx_internal) = mpsc::unbounded_channel();
        let (tx_publish, rx_publish) = mpsc::unbounded_channel();
        let selector = AddressSelector::new(config.members.clone());
        let this = Self {
            config,
            transport,
            lifecycle: Lifecycle::Idle,
            selector,
            conn: None,
            next_conn_id: 1,
            connect_in_flight: false,
            connect_waiters: Vec::new(),
            session: None,
            next_sequence: 1,
            acked_sequence: 0,
            response_index: 0,
            pending: BTreeMap::new(),
            keepalive_at: None,
            close_deadline: None,
            last_event_index: 0,
            event_buffer: BTreeMap::new(),
            subscriptions: HashMap::new(),
            open_waiters: Vec::new(),
            close_waiters: Vec::new(),
            deferred_opens: Vec::new(),
            deferred_closes: Vec::new(),
            rx_api,
            tx_internal,
            rx_internal,
            tx_publish,
            rx_publish,
            tx_metrics,
        };
        tokio::spawn(this.main(rx_shutdown).instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the client core.
    #[tracing::instrument(level="debug", skip(self, rx_shutdown), fields(client_id=%self.config.client_id, cluster=%self.config.cluster_name))]
    async fn main(mut self, rx_shutdown: oneshot::Receiver<()>) -> ClientResult<()> {
        tracing::debug!("client core is initializing");
        // A dropped shutdown sender also means the handle went away; both end the core.
        let mut shutdown = rx_shutdown.fuse();
        loop {
            let timer = sleep_until(self.next_timer());

            tokio::select! {
                msg = self.rx_api.recv() => match msg {
                    Some((msg, span)) => {
                        let _ent = span.enter();
                        self.handle_api_msg(msg);
                    }
                    None => {
                        tracing::debug!("api channel closed");
                        self.shutdown_core();
                        return Ok(());
                    }
                },
                Some(event) = self.rx_internal.recv() => self.handle_core_event(event),
                Some(publish) = self.rx_publish.recv() => {
                    tracing::debug!("recv from connection: {}", publish.summary());
                    self.handle_publish(publish);
                }
                _ = timer => self.handle_timer(),
                _ = &mut shutdown => {
                    tracing::debug!("client core received shutdown signal");
                    self.shutdown_core();
                    return Ok(());
                }
            }
        }
    }

    fn handle_api_msg(&mut self, msg: ClientMsg<D, R>) {
        match msg {
            ClientMsg::Open { tx } => self.handle_open(tx),
            ClientMsg::Close { tx } => self.handle_close(tx),
            ClientMsg::Submit { op, tx } => self.handle_submit(op, tx),
            ClientMsg::Subscribe { name, tx } => self.handle_subscribe(name, tx),
        }
    }

    fn handle_core_event(&mut self, event: CoreEvent<T::Conn, R>) {
        match event {
            CoreEvent::ConnectAttempt { addr, result } => self.handle_connect_attempt(addr, result),
            CoreEvent::RequestOutcome { seq, conn_id, result } => self.handle_request_outcome(seq, conn_id, result),
            CoreEvent::RegisterOutcome { conn_id, result } => self.handle_register_outcome(conn_id, result),
            CoreEvent::ConnectionClosed { conn_id } => self.handle_connection_closed(conn_id),
        }
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Open / close lifecycle.

    #[tracing::instrument(level = "debug", skip(self, tx))]
    fn handle_open(&mut self, tx: oneshot::Sender<ClientResult<()>>) {
        match self.lifecycle {
            Lifecycle::Open => {
                let _ = tx.send(Ok(()));
            }
            Lifecycle::Opening => self.open_waiters.push(tx),
            // An open submitted while a close is in flight composes after the close.
            Lifecycle::Closing => self.deferred_opens.push(tx),
            Lifecycle::Idle | Lifecycle::Closed | Lifecycle::Expired => {
                self.open_waiters.push(tx);
                self.begin_open();
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, tx))]
    fn handle_close(&mut self, tx: oneshot::Sender<ClientResult<()>>) {
        match self.lifecycle {
            Lifecycle::Closed => {
                let _ = tx.send(Ok(()));
            }
            Lifecycle::Closing => self.close_waiters.push(tx),
            // A close submitted while an open is in flight is not permitted to race ahead of it.
            Lifecycle::Opening => self.deferred_closes.push(tx),
            Lifecycle::Idle | Lifecycle::Expired => {
                self.lifecycle = Lifecycle::Closed;
                let _ = tx.send(Ok(()));
                self.publish_metrics();
            }
            Lifecycle::Open => {
                self.close_waiters.push(tx);
                self.begin_close();
            }
        }
    }

    /// Begin registering a fresh session with the cluster.
    fn begin_open(&mut self) {
        tracing::debug!("opening a new session");
        self.lifecycle = Lifecycle::Opening;
        self.session = None;
        self.next_sequence = 1;
        self.acked_sequence = 0;
        self.response_index = 0;
        self.last_event_index = 0;
        self.event_buffer.clear();
        self.publish_metrics();
        self.ensure_dispatch(Waiter::Register);
    }

    /// Fail the in-flight open, returning the client to `Idle`.
    pub(super) fn fail_open(&mut self, err: ClientError) {
        tracing::warn!(error=%err, "session registration failed");
        for tx in self.open_waiters.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
        self.lifecycle = Lifecycle::Idle;
        self.publish_metrics();
        if !self.deferred_closes.is_empty() {
            // Nothing is open anymore; the queued closes complete trivially.
            self.lifecycle = Lifecycle::Closed;
            for tx in self.deferred_closes.drain(..) {
                let _ = tx.send(Ok(()));
            }
            self.publish_metrics();
        }
    }

    /// Begin a graceful close of the open session.
    pub(super) fn begin_close(&mut self) {
        tracing::debug!("closing the session");
        self.lifecycle = Lifecycle::Closing;
        self.close_deadline = Some(Instant::now() + Duration::from_millis(self.config.close_timeout));
        let session_id = match &self.session {
            Some(session) => session.id,
            None => {
                self.finish_close();
                return;
            }
        };
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let request = ClientRequest::Unregister(UnregisterRequest { session_id });
        self.pending.insert(sequence, PendingRequest {
            kind: RequestKind::Unregister,
            tx: None,
            request,
            state: PendingState::Queued,
        });
        self.publish_metrics();
        self.ensure_dispatch(Waiter::Request(sequence));
    }

    /// Complete the close: release all resources and transition to `Closed`.
    pub(super) fn finish_close(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (_seq, mut entry) in pending {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Err(ClientError::Closed));
            }
        }
        self.connect_waiters.clear();
        self.connect_in_flight = false;
        self.subscriptions.clear();
        self.event_buffer.clear();
        if let Some(active) = self.conn.take() {
            Self::spawn_conn_close(active.conn);
        }
        self.session = None;
        self.keepalive_at = None;
        self.close_deadline = None;
        self.lifecycle = Lifecycle::Closed;
        tracing::info!("session closed");
        for tx in self.close_waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
        self.publish_metrics();
        self.run_deferred_opens();
    }

    /// Expire the session: fail everything outstanding and stop accepting submissions.
    pub(super) fn expire_session(&mut self) {
        tracing::warn!("session expired");
        let was_closing = self.lifecycle == Lifecycle::Closing;
        let pending = std::mem::take(&mut self.pending);
        for (_seq, mut entry) in pending {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Err(ClientError::SessionExpired));
            }
        }
        self.connect_waiters.clear();
        self.connect_in_flight = false;
        self.subscriptions.clear();
        self.event_buffer.clear();
        if let Some(active) = self.conn.take() {
            Self::spawn_conn_close(active.conn);
        }
        self.session = None;
        self.keepalive_at = None;
        if was_closing {
            // The close that was in flight completes; there is nothing left to unregister.
            self.close_deadline = None;
            self.lifecycle = Lifecycle::Closed;
            for tx in self.close_waiters.drain(..) {
                let _ = tx.send(Ok(()));
            }
        } else {
            self.lifecycle = Lifecycle::Expired;
        }
        self.publish_metrics();
        self.run_deferred_opens();
    }

    fn run_deferred_opens(&mut self) {
        if !self.deferred_opens.is_empty() {
            let waiters: Vec<_> = self.deferred_opens.drain(..).collect();
            self.open_waiters.extend(waiters);
            self.begin_open();
        }
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Timers.

    fn next_timer(&self) -> Instant {
        let mut at = Instant::now() + Duration::from_secs(86400);
        if let Some(t) = self.keepalive_at {
            if t < at {
                at = t;
            }
        }
        if let Some(t) = self.close_deadline {
            if t < at {
                at = t;
            }
        }
        at
    }

    fn handle_timer(&mut self) {
        let now = Instant::now();
        if let Some(deadline) = self.close_deadline {
            if now >= deadline && self.lifecycle == Lifecycle::Closing {
                tracing::warn!("timed out waiting for unregister acknowledgement");
                self.finish_close();
                return;
            }
        }
        if self.check_expiration(now) {
            return;
        }
        if let Some(at) = self.keepalive_at {
            if now >= at && matches!(self.lifecycle, Lifecycle::Open | Lifecycle::Closing) {
                self.submit_keepalive();
            }
        }
    }

    /// Declare the session expired if no keep-alive has succeeded within the granted timeout.
    pub(super) fn check_expiration(&mut self, now: Instant) -> bool {
        if !matches!(self.lifecycle, Lifecycle::Open | Lifecycle::Closing) {
            return false;
        }
        let expired = match &self.session {
            Some(session) => now.duration_since(session.last_keepalive) > session.timeout,
            None => false,
        };
        if expired {
            self.expire_session();
        }
        expired
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Shutdown.

    fn shutdown_core(&mut self) {
        tracing::debug!("client core is shutting down");
        let pending = std::mem::take(&mut self.pending);
        for (_seq, mut entry) in pending {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Err(ClientError::ShuttingDown));
            }
        }
        for tx in self.open_waiters.drain(..) {
            let _ = tx.send(Err(ClientError::ShuttingDown));
        }
        for tx in self.close_waiters.drain(..) {
            let _ = tx.send(Err(ClientError::ShuttingDown));
        }
        for tx in self.deferred_opens.drain(..) {
            let _ = tx.send(Err(ClientError::ShuttingDown));
        }
        for tx in self.deferred_closes.drain(..) {
            let _ = tx.send(Err(ClientError::ShuttingDown));
        }
        self.connect_waiters.clear();
        self.connect_in_flight = false;
        self.subscriptions.clear();
        if let Some(active) = self.conn.take() {
            Self::spawn_conn_close(active.conn);
        }
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Metrics.

    /// Report a metrics payload on the current state of the client.
    pub(super) fn publish_metrics(&mut self) {
        let res = self.tx_metrics.send(ClientMetrics {
            client_id: self.config.client_id.clone(),
            lifecycle: self.lifecycle,
            session: self.session.as_ref().map(|s| SessionInfo {
                session_id: s.id,
                timeout: s.timeout,
            }),
            leader: self.selector.leader().cloned(),
            members: self.selector.servers().to_vec(),
            acked_sequence: self.acked_sequence,
            event_index: self.last_event_index,
        });
        if let Err(err) = res {
            tracing::error!(error=%err, "error reporting client metrics");
        }
    }
}

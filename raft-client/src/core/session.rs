//! Session ordering: sequence assignment, in-order completion, keep-alives, event delivery.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::client::Operation;
use crate::client::SessionEvent;
use crate::core::connection::CoreEvent;
use crate::core::connection::Waiter;
use crate::core::ClientCore;
use crate::core::Lifecycle;
use crate::error::ClientError;
use crate::error::ClientResult;
use crate::error::TransportError;
use crate::network::Connection;
use crate::network::Transport;
use crate::protocol::ClientRequest;
use crate::protocol::ClientResponse;
use crate::protocol::CommandRequest;
use crate::protocol::ErrorCode;
use crate::protocol::KeepAliveRequest;
use crate::protocol::KeepAliveResponse;
use crate::protocol::OperationResponse;
use crate::protocol::PublishEvent;
use crate::protocol::QueryRequest;
use crate::protocol::RegisterRequest;
use crate::protocol::SessionId;
use crate::protocol::Status;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;

/// The state of the registered session.
pub(super) struct SessionState {
    /// The cluster-assigned session id.
    pub id: SessionId,
    /// The granted session timeout. The cluster's value is authoritative; the keep-alive
    /// period is half of it.
    pub timeout: Duration,
    /// When a keep-alive (or the registration itself) last succeeded. The session expires
    /// once this lags by more than the granted timeout.
    pub last_keepalive: Instant,
}

impl SessionState {
    pub(super) fn keepalive_period(&self) -> Duration {
        self.timeout / 2
    }
}

/// What kind of request a pending entry is, deciding how its completion is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum RequestKind {
    /// A user-submitted command or query.
    Operation,
    /// A session keep-alive; completes internally.
    KeepAlive,
    /// The unregister of a graceful close; completes the close when drained.
    Unregister,
}

/// Where a pending request currently is in its life.
pub(super) enum PendingState<R: AppDataResponse> {
    /// Waiting for a connection.
    Queued,
    /// Dispatched on the connection with the given identity.
    InFlight { conn_id: u64 },
    /// Resolved, but possibly held back until all prior sequences resolve. `None` marks an
    /// internal request with no caller-visible result.
    Done(Option<ClientResult<R>>),
}

/// A submitted request awaiting completion.
pub(super) struct PendingRequest<D: AppData, R: AppDataResponse> {
    pub kind: RequestKind,
    /// The caller's completion slot. `None` for internal requests.
    pub tx: Option<oneshot::Sender<ClientResult<R>>>,
    /// The wire request. Retries reuse it as-is, original sequence included.
    pub request: ClientRequest<D>,
    pub state: PendingState<R>,
}

impl<D, R, T> ClientCore<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: Transport<D, R>,
{
    ///////////////////////////////////////////////////////////////////////////////////////////
    // Submission.

    pub(super) fn handle_submit(&mut self, op: Operation<D>, tx: oneshot::Sender<ClientResult<R>>) {
        match self.lifecycle {
            Lifecycle::Open => {}
            Lifecycle::Closing | Lifecycle::Closed => {
                let _ = tx.send(Err(ClientError::Closed));
                return;
            }
            Lifecycle::Idle | Lifecycle::Opening | Lifecycle::Expired => {
                let _ = tx.send(Err(ClientError::NotOpen));
                return;
            }
        }
        let session_id = match &self.session {
            Some(session) => session.id,
            None => {
                let _ = tx.send(Err(ClientError::NotOpen));
                return;
            }
        };
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let request = match op {
            Operation::Command { payload, consistency } => ClientRequest::Command(CommandRequest {
                session_id,
                sequence,
                consistency,
                payload,
            }),
            Operation::Query { payload, consistency } => ClientRequest::Query(QueryRequest {
                session_id,
                sequence,
                consistency,
                index: self.response_index,
                payload,
            }),
        };
        tracing::debug!("submitting, {}", request.summary());
        self.pending.insert(sequence, PendingRequest {
            kind: RequestKind::Operation,
            tx: Some(tx),
            request,
            state: PendingState::Queued,
        });
        self.ensure_dispatch(Waiter::Request(sequence));
    }

    pub(super) fn handle_subscribe(
        &mut self,
        name: String,
        tx: oneshot::Sender<mpsc::UnboundedReceiver<SessionEvent<R>>>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.subscriptions.entry(name).or_default().push(event_tx);
        let _ = tx.send(event_rx);
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Dispatch.

    pub(super) fn dispatch_request(&mut self, seq: u64, active: (u64, Arc<T::Conn>)) {
        let (conn_id, conn) = active;
        let entry = match self.pending.get_mut(&seq) {
            Some(entry) => entry,
            None => return,
        };
        entry.state = PendingState::InFlight { conn_id };
        let request = entry.request.clone();
        let tx = self.tx_internal.clone();
        tokio::spawn(
            async move {
                let result = conn.send_and_receive(request).await;
                let _ = tx.send(CoreEvent::RequestOutcome { seq, conn_id, result });
            }
            .instrument(tracing::debug_span!("request")),
        );
    }

    pub(super) fn dispatch_register(&mut self, active: (u64, Arc<T::Conn>)) {
        let (conn_id, conn) = active;
        let request = ClientRequest::Register(RegisterRequest {
            client_id: self.config.client_id.clone(),
            timeout: self.config.session_timeout_hint,
        });
        tracing::debug!("registering, {}", request.summary());
        let tx = self.tx_internal.clone();
        tokio::spawn(
            async move {
                let result = conn.send_and_receive(request).await;
                let _ = tx.send(CoreEvent::RegisterOutcome { conn_id, result });
            }
            .instrument(tracing::debug_span!("register")),
        );
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Outcomes.

    pub(super) fn handle_request_outcome(
        &mut self,
        seq: u64,
        conn_id: u64,
        result: Result<ClientResponse<R>, TransportError>,
    ) {
        let entry = match self.pending.get(&seq) {
            Some(entry) => entry,
            None => return,
        };
        // A late outcome from a dispatch this entry no longer owns is ignored; the retry
        // that superseded it will produce its own.
        if !matches!(entry.state, PendingState::InFlight { conn_id: current } if current == conn_id) {
            return;
        }
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(seq, error = %err, "request failed in transport");
                self.requeue(seq, conn_id);
                return;
            }
        };
        match response {
            ClientResponse::Operation(res) => self.handle_operation_response(seq, conn_id, res),
            ClientResponse::KeepAlive(res) => self.handle_keepalive_response(seq, conn_id, res),
            ClientResponse::Unregister(_) => self.complete_request(seq, None),
            _ => self.complete_request(seq, Some(Err(ClientError::Protocol("unexpected response envelope".into())))),
        }
    }

    fn handle_operation_response(&mut self, seq: u64, conn_id: u64, res: OperationResponse<R>) {
        match res.status {
            Status::Ok => {
                self.acked_sequence = self.acked_sequence.max(seq);
                if res.index > self.response_index {
                    self.response_index = res.index;
                }
                let result = match res.result {
                    Some(result) => Ok(result),
                    None => Err(ClientError::Protocol("operation response carried no result".into())),
                };
                self.complete_request(seq, Some(result));
            }
            Status::Error => {
                let code = res.error.unwrap_or(ErrorCode::InternalError);
                if code.is_session_fatal() {
                    self.expire_session();
                    return;
                }
                if code.is_retriable() {
                    tracing::debug!(seq, code = ?code, "retriable operation failure");
                    self.requeue(seq, conn_id);
                    return;
                }
                self.acked_sequence = self.acked_sequence.max(seq);
                self.complete_request(seq, Some(Err(ClientError::Operation(code))));
            }
        }
    }

    fn handle_keepalive_response(&mut self, seq: u64, conn_id: u64, res: KeepAliveResponse) {
        match res.status {
            Status::Ok => {
                self.acked_sequence = self.acked_sequence.max(seq);
                if let Some(session) = &mut self.session {
                    session.last_keepalive = Instant::now();
                }
                self.selector.reset_with(res.leader, res.members);
                self.publish_metrics();
                self.complete_request(seq, None);
            }
            Status::Error => {
                let code = res.error.unwrap_or(ErrorCode::InternalError);
                if code.is_session_fatal() {
                    self.expire_session();
                    return;
                }
                if code.is_retriable() {
                    self.requeue(seq, conn_id);
                    return;
                }
                tracing::warn!(code = ?code, "keep-alive rejected");
                self.complete_request(seq, None);
                self.note_keepalive_failure();
            }
        }
    }

    pub(super) fn handle_register_outcome(&mut self, conn_id: u64, result: Result<ClientResponse<R>, TransportError>) {
        if self.lifecycle != Lifecycle::Opening {
            return;
        }
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "registration failed in transport");
                self.resend(Waiter::Register, conn_id);
                return;
            }
        };
        let res = match response {
            ClientResponse::Register(res) => res,
            _ => {
                self.fail_open(ClientError::Protocol("unexpected registration response".into()));
                return;
            }
        };
        match res.status {
            Status::Ok => {
                let timeout = Duration::from_millis(res.timeout);
                tracing::info!(session_id = res.session_id, timeout = res.timeout, "session registered");
                self.session = Some(SessionState {
                    id: res.session_id,
                    timeout,
                    last_keepalive: Instant::now(),
                });
                self.selector.reset_with(res.leader, res.members);
                self.lifecycle = Lifecycle::Open;
                self.keepalive_at = Some(Instant::now() + timeout / 2);
                for tx in self.open_waiters.drain(..) {
                    let _ = tx.send(Ok(()));
                }
                self.publish_metrics();
                if !self.deferred_closes.is_empty() {
                    let waiters: Vec<_> = self.deferred_closes.drain(..).collect();
                    self.close_waiters.extend(waiters);
                    self.begin_close();
                }
            }
            Status::Error => {
                let code = res.error.unwrap_or(ErrorCode::InternalError);
                if code.is_retriable() {
                    self.resend(Waiter::Register, conn_id);
                    return;
                }
                self.fail_open(ClientError::Operation(code));
            }
        }
    }

    /// Put a request back in the queue and run the failover path for its connection.
    fn requeue(&mut self, seq: u64, conn_id: u64) {
        if let Some(entry) = self.pending.get_mut(&seq) {
            entry.state = PendingState::Queued;
        }
        self.resend(Waiter::Request(seq), conn_id);
    }

    /// Fail a request whose connect sweep found no reachable server.
    pub(super) fn fail_unreachable(&mut self, seq: u64) {
        let kind = match self.pending.get(&seq) {
            Some(entry) => entry.kind,
            None => return,
        };
        match kind {
            RequestKind::Operation => {
                self.complete_request(seq, Some(Err(ClientError::ConnectFailed)));
            }
            RequestKind::KeepAlive => {
                self.pending.remove(&seq);
                self.drain_completions();
                self.note_keepalive_failure();
            }
            RequestKind::Unregister => {
                // Best effort only; the cluster will expire the session on its own.
                self.pending.remove(&seq);
                self.finish_close();
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Ordered completion.

    /// Mark a request resolved and flush whatever is now completable.
    fn complete_request(&mut self, seq: u64, result: Option<ClientResult<R>>) {
        if let Some(entry) = self.pending.get_mut(&seq) {
            entry.state = PendingState::Done(result);
        }
        self.drain_completions();
    }

    /// Fire completion callbacks from the front of the pending map, in sequence order.
    ///
    /// A resolved request behind an unresolved one stays put: submission order equals
    /// completion order no matter how responses interleaved on the wire.
    pub(super) fn drain_completions(&mut self) {
        let mut close_now = false;
        loop {
            let seq = match self.pending.keys().next() {
                Some(seq) => *seq,
                None => break,
            };
            let done = matches!(
                self.pending.get(&seq).map(|entry| &entry.state),
                Some(PendingState::Done(_))
            );
            if !done {
                break;
            }
            let mut entry = self.pending.remove(&seq).expect("entry was just observed in the map");
            if entry.kind == RequestKind::Unregister {
                close_now = true;
            }
            if let PendingState::Done(result) = entry.state {
                if let (Some(tx), Some(result)) = (entry.tx.take(), result) {
                    let _ = tx.send(result);
                }
            }
        }
        self.publish_metrics();
        if close_now {
            self.finish_close();
        }
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Keep-alive.

    /// Submit a keep-alive as an ordinary request sharing the session's sequence space.
    pub(super) fn submit_keepalive(&mut self) {
        let (session_id, period) = match &self.session {
            Some(session) => (session.id, session.keepalive_period()),
            None => return,
        };
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let request = ClientRequest::KeepAlive(KeepAliveRequest {
            session_id,
            command_sequence: self.acked_sequence,
            event_index: self.last_event_index,
        });
        tracing::debug!("submitting, {}", request.summary());
        self.pending.insert(sequence, PendingRequest {
            kind: RequestKind::KeepAlive,
            tx: None,
            request,
            state: PendingState::Queued,
        });
        self.keepalive_at = Some(Instant::now() + period);
        self.ensure_dispatch(Waiter::Request(sequence));
    }

    /// Note a failed keep-alive and expire the session if the lease has lapsed.
    fn note_keepalive_failure(&mut self) {
        self.check_expiration(Instant::now());
    }

    ///////////////////////////////////////////////////////////////////////////////////////////
    // Event delivery.

    /// Handle a server-published session event from the connection.
    pub(super) fn handle_publish(&mut self, event: PublishEvent<R>) {
        let session_id = match &self.session {
            Some(session) => session.id,
            None => return,
        };
        if event.session_id != session_id {
            return;
        }
        if event.event_index <= self.last_event_index {
            tracing::trace!(event_index = event.event_index, "dropping duplicate event");
            return;
        }
        self.event_buffer.insert(event.event_index, event);
        self.drain_events();
    }

    /// Deliver buffered events in index order. A gap blocks delivery until the missing
    /// event arrives via a keep-alive triggered resend.
    fn drain_events(&mut self) {
        let mut delivered = false;
        loop {
            let index = match self.event_buffer.keys().next() {
                Some(index) => *index,
                None => break,
            };
            let gap = self
                .event_buffer
                .get(&index)
                .map(|event| event.previous_index > self.last_event_index)
                .unwrap_or(true);
            if gap {
                break;
            }
            let event = self.event_buffer.remove(&index).expect("event was just observed in the buffer");
            self.last_event_index = event.event_index;
            delivered = true;
            self.deliver_event(event);
        }
        if delivered {
            self.publish_metrics();
        }
    }

    fn deliver_event(&mut self, event: PublishEvent<R>) {
        tracing::debug!("delivering, {}", event.summary());
        if let Some(subscribers) = self.subscriptions.get_mut(&event.name) {
            subscribers.retain(|tx| {
                tx.send(SessionEvent {
                    index: event.event_index,
                    name: event.name.clone(),
                    payload: event.payload.clone(),
                })
                .is_ok()
            });
        }
    }
}

//! Connection management: single live connection, coalesced connects, failover.

use std::sync::Arc;

use tracing_futures::Instrument;

use crate::core::selector::SelectorState;
use crate::core::ClientCore;
use crate::core::Lifecycle;
use crate::error::ClientError;
use crate::error::TransportError;
use crate::network::Connection;
use crate::network::Transport;
use crate::protocol::ClientRequest;
use crate::protocol::ClientResponse;
use crate::protocol::ConnectRequest;
use crate::protocol::ErrorCode;
use crate::protocol::Status;
use crate::Address;
use crate::AppData;
use crate::AppDataResponse;

/// The single live connection, tagged with an identity for race detection.
///
/// Stale callbacks and late request outcomes carry the id of the connection they were
/// produced on; the core only reacts to them if that id still matches the current one.
pub(super) struct ActiveConnection<C> {
    pub id: u64,
    pub conn: Arc<C>,
}

/// Work waiting for a connection.
///
/// While a connect is in flight no new transport `connect` is issued; all newcomers enqueue
/// here and share the outcome of the pending connect.
#[derive(Clone, Copy, Debug)]
pub(super) enum Waiter {
    /// The session registration of an in-flight open.
    Register,
    /// The pending request with this sequence.
    Request(u64),
}

/// Events reported back to the core task by its spawned connect, dispatch and monitor tasks.
pub(super) enum CoreEvent<C, R: AppDataResponse> {
    ConnectAttempt {
        addr: Address,
        result: Result<HandshakeOk<C>, ConnectAttemptError>,
    },
    RequestOutcome {
        seq: u64,
        conn_id: u64,
        result: Result<ClientResponse<R>, TransportError>,
    },
    RegisterOutcome {
        conn_id: u64,
        result: Result<ClientResponse<R>, TransportError>,
    },
    ConnectionClosed {
        conn_id: u64,
    },
}

/// A freshly opened connection that passed the handshake.
pub(super) struct HandshakeOk<C> {
    pub conn: Arc<C>,
    pub leader: Option<Address>,
    pub members: Vec<Address>,
}

/// Why a single connect attempt failed. Any variant moves the sweep to the next candidate.
#[derive(Debug, derive_more::Display, derive_more::From)]
pub(super) enum ConnectAttemptError {
    #[display(fmt = "transport: {}", _0)]
    Transport(TransportError),
    #[display(fmt = "handshake rejected: {:?}", _0)]
    Rejected(Option<ErrorCode>),
    #[display(fmt = "unexpected handshake response")]
    UnexpectedResponse,
}

/// Open a transport connection to one server and run the handshake on it.
async fn connect_and_handshake<D, R, T>(
    transport: Arc<T>,
    addr: Address,
    client_id: String,
) -> Result<HandshakeOk<T::Conn>, ConnectAttemptError>
where
    D: AppData,
    R: AppDataResponse,
    T: Transport<D, R>,
{
    let conn = transport.connect(&addr).await?;
    let req = ClientRequest::Connect(ConnectRequest { client_id });
    let res = match conn.send_and_receive(req).await {
        Ok(res) => res,
        Err(err) => {
            conn.close().await;
            return Err(err.into());
        }
    };
    match res {
        ClientResponse::Connect(res) if res.status == Status::Ok => Ok(HandshakeOk {
            conn: Arc::new(conn),
            leader: res.leader,
            members: res.members,
        }),
        ClientResponse::Connect(res) => {
            conn.close().await;
            Err(ConnectAttemptError::Rejected(res.error))
        }
        _ => {
            conn.close().await;
            Err(ConnectAttemptError::UnexpectedResponse)
        }
    }
}

impl<D, R, T> ClientCore<D, R, T>
where
    D: AppData,
    R: AppDataResponse,
    T: Transport<D, R>,
{
    /// Route the given work to a usable connection, connecting first if need be.
    ///
    /// A selector left in its reset state means the membership view changed since the
    /// current connection was established, so the connection is stale even if it is still
    /// healthy: it is dropped and a fresh connect is started with the new view's leader
    /// bias. Without a connection, work either piggybacks on the in-flight connect or
    /// starts a new sweep.
    pub(super) fn ensure_dispatch(&mut self, waiter: Waiter) {
        if self.selector.state() == SelectorState::Reset && self.conn.is_some() {
            let stale = self.conn.take().expect("conn was just checked to be present");
            tracing::debug!(conn_id = stale.id, "membership view changed, dropping connection");
            Self::spawn_conn_close(stale.conn);
            self.connect_waiters.push(waiter);
            if !self.connect_in_flight {
                self.start_connect();
            }
            return;
        }
        if self.conn.is_some() {
            self.dispatch_on_current(waiter);
            return;
        }
        self.connect_waiters.push(waiter);
        if !self.connect_in_flight {
            self.start_connect();
        }
    }

    /// Dispatch the given work on the current connection.
    pub(super) fn dispatch_on_current(&mut self, waiter: Waiter) {
        let active = match &self.conn {
            Some(active) => (active.id, active.conn.clone()),
            None => {
                self.ensure_dispatch(waiter);
                return;
            }
        };
        match waiter {
            Waiter::Request(seq) => self.dispatch_request(seq, active),
            Waiter::Register => self.dispatch_register(active),
        }
    }

    /// Begin a fresh connect sweep.
    fn start_connect(&mut self) {
        debug_assert!(self.conn.is_none());
        if self.selector.state() != SelectorState::Reset {
            self.selector.reset();
        }
        self.connect_in_flight = true;
        self.connect_next();
    }

    /// Continue the current sweep after a failover, without rebuilding the candidate list.
    ///
    /// This bounds failover per sweep: once the remaining candidates are used up, the sweep
    /// reports exhaustion instead of silently starting over.
    fn continue_connect(&mut self) {
        self.connect_in_flight = true;
        self.connect_next();
    }

    fn connect_next(&mut self) {
        if !self.selector.has_next() {
            self.connect_exhausted();
            return;
        }
        let addr = self.selector.next().expect("selector has a next candidate");
        tracing::debug!(server = %addr, "attempting connection");
        let transport = self.transport.clone();
        let client_id = self.config.client_id.clone();
        let tx = self.tx_internal.clone();
        tokio::spawn(
            async move {
                let result = connect_and_handshake::<D, R, T>(transport, addr.clone(), client_id).await;
                let _ = tx.send(CoreEvent::ConnectAttempt { addr, result });
            }
            .instrument(tracing::debug_span!("connect")),
        );
    }

    pub(super) fn handle_connect_attempt(
        &mut self,
        addr: Address,
        result: Result<HandshakeOk<T::Conn>, ConnectAttemptError>,
    ) {
        if !self.connect_in_flight {
            // The sweep this attempt belonged to has been abandoned.
            if let Ok(hs) = result {
                Self::spawn_conn_close(hs.conn);
            }
            return;
        }
        if self.connect_waiters.is_empty()
            && matches!(self.lifecycle, Lifecycle::Idle | Lifecycle::Closed | Lifecycle::Expired)
        {
            self.connect_in_flight = false;
            if let Ok(hs) = result {
                Self::spawn_conn_close(hs.conn);
            }
            return;
        }
        match result {
            Ok(hs) => self.install_connection(hs),
            Err(err) => {
                tracing::warn!(server = %addr, error = %err, "connect attempt failed");
                self.connect_next();
            }
        }
    }

    /// Adopt a freshly handshaken connection and release the piggybacked waiters onto it.
    fn install_connection(&mut self, hs: HandshakeOk<T::Conn>) {
        self.connect_in_flight = false;
        let id = self.next_conn_id;
        self.next_conn_id += 1;

        // Re-install the inbound event handler on the new connection before anything is
        // dispatched on it, so no publish can slip by unobserved.
        hs.conn.set_publish_handler(self.tx_publish.clone());

        let monitored = hs.conn.clone();
        let tx = self.tx_internal.clone();
        tokio::spawn(
            async move {
                monitored.closed().await;
                let _ = tx.send(CoreEvent::ConnectionClosed { conn_id: id });
            }
            .instrument(tracing::debug_span!("conn-monitor")),
        );

        // Adopting the handshake's view may re-arm the selector's reset latch; requests
        // submitted after this point will migrate to the new leader. The waiters below
        // share this connect's outcome and are dispatched on it directly.
        self.selector.reset_with(hs.leader.clone(), hs.members.clone());
        self.conn = Some(ActiveConnection { id, conn: hs.conn });
        tracing::debug!(conn_id = id, "connection established");
        self.publish_metrics();

        let waiters: Vec<Waiter> = self.connect_waiters.drain(..).collect();
        for waiter in waiters {
            self.dispatch_on_current(waiter);
        }
    }

    /// Complete the pending connect with "no reachable server this sweep".
    fn connect_exhausted(&mut self) {
        tracing::warn!("no reachable server this sweep");
        self.connect_in_flight = false;
        let waiters: Vec<Waiter> = self.connect_waiters.drain(..).collect();
        for waiter in waiters {
            match waiter {
                Waiter::Register => self.fail_open(ClientError::ConnectFailed),
                Waiter::Request(seq) => self.fail_unreachable(seq),
            }
        }
    }

    /// Requeue a request after a retriable failure.
    ///
    /// If the request was sent on what is still the current connection, the failure is
    /// evidence the connection is bad: drop it and move to the next candidate of the sweep.
    /// Otherwise a concurrent reconnect already replaced the connection, so the request
    /// simply goes back through the normal path and reuses whatever is now current.
    pub(super) fn resend(&mut self, waiter: Waiter, conn_id: u64) {
        let is_current = self.conn.as_ref().map(|active| active.id == conn_id).unwrap_or(false);
        if is_current {
            let bad = self.conn.take().expect("conn was just checked to be present");
            tracing::debug!(conn_id = bad.id, "dropping connection after failed request");
            Self::spawn_conn_close(bad.conn);
            self.connect_waiters.push(waiter);
            if !self.connect_in_flight {
                self.continue_connect();
            }
            return;
        }
        self.ensure_dispatch(waiter);
    }

    /// The connection's close callback: forget the handle only if it is still the current one.
    pub(super) fn handle_connection_closed(&mut self, conn_id: u64) {
        if let Some(active) = &self.conn {
            if active.id == conn_id {
                tracing::debug!(conn_id, "connection closed by peer");
                self.conn = None;
            }
        }
    }

    /// Close a connection without blocking the core task.
    pub(super) fn spawn_conn_close(conn: Arc<T::Conn>) {
        tokio::spawn(async move {
            conn.close().await;
        });
    }
}

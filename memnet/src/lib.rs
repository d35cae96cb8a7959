//! An in-memory implementation of the `raft-client` transport.
//!
//! `MemNet` plays the part of an entire Raft cluster inside one process: it hands out
//! connections, designates a leader, registers sessions, applies commands to a small
//! key/value state machine with sequence-based deduplication, and publishes session events.
//! Per-node behaviors can be scripted (refusing connections, swallowing requests) to drive
//! the client through failover, sweep exhaustion and session expiration.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio::time::Duration;

use raft_client::error::TransportError;
use raft_client::network::Connection;
use raft_client::network::Transport;
use raft_client::protocol::ClientRequest;
use raft_client::protocol::ClientResponse;
use raft_client::protocol::ConnectResponse;
use raft_client::protocol::ErrorCode;
use raft_client::protocol::KeepAliveResponse;
use raft_client::protocol::OperationResponse;
use raft_client::protocol::PublishEvent;
use raft_client::protocol::QueryConsistency;
use raft_client::protocol::RegisterResponse;
use raft_client::protocol::SessionId;
use raft_client::protocol::Status;
use raft_client::protocol::UnregisterResponse;
use raft_client::Address;

/// The application payload type served by the simulated state machine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvRequest {
    /// Store a value, returning the previous one.
    Put { key: String, value: String },
    /// Read a value.
    Get { key: String },
}

/// The application response type: the value read, or the value replaced.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvResponse(pub Option<String>);

/// How a simulated node treats inbound work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Serves requests normally.
    Normal,
    /// Refuses new connections and fails in-flight requests.
    Refuse,
    /// Accepts connections and requests but never responds.
    BlackHole,
}

/// The default session timeout granted by the simulated cluster, in milliseconds.
pub const DEFAULT_GRANT_TIMEOUT: u64 = 5000;

#[derive(Clone, Debug)]
struct StoredEvent {
    index: u64,
    previous: u64,
    name: String,
    payload: KvResponse,
}

#[derive(Debug)]
struct ServerSession {
    #[allow(dead_code)]
    client_id: String,
    /// Cached `(index, result)` per command sequence: duplicate delivery is idempotent.
    responses: HashMap<u64, (u64, KvResponse)>,
    events: Vec<StoredEvent>,
    /// The publish channel of the connection the session was last seen on.
    publisher: Option<(u64, mpsc::UnboundedSender<PublishEvent<KvResponse>>)>,
}

#[derive(Debug)]
struct LiveConn {
    id: u64,
    closed: watch::Sender<bool>,
}

#[derive(Debug)]
struct ClusterState {
    members: Vec<Address>,
    leader: Option<Address>,
    behaviors: HashMap<Address, Behavior>,
    grant_timeout: u64,
    next_session_id: SessionId,
    log_index: u64,
    kv: HashMap<String, String>,
    sessions: HashMap<SessionId, ServerSession>,
    conns: Vec<LiveConn>,
    /// `(served-at, sequence)` for every command, in arrival order.
    command_log: Vec<(Address, u64)>,
    /// Artificial serve delays per key, for driving response reordering.
    delays: HashMap<String, Duration>,
}

#[derive(Debug)]
struct NetInner {
    state: Mutex<ClusterState>,
    connect_attempts: AtomicU64,
    conn_ids: AtomicU64,
}

/// A simulated cluster implementing the client's [`Transport`] trait.
#[derive(Clone)]
pub struct MemNet {
    inner: Arc<NetInner>,
}

impl MemNet {
    /// Create a new simulated cluster over the given member addresses, with no leader.
    pub fn new(members: Vec<Address>) -> Self {
        let behaviors = members.iter().cloned().map(|addr| (addr, Behavior::Normal)).collect();
        Self {
            inner: Arc::new(NetInner {
                state: Mutex::new(ClusterState {
                    members,
                    leader: None,
                    behaviors,
                    grant_timeout: DEFAULT_GRANT_TIMEOUT,
                    next_session_id: 1,
                    log_index: 0,
                    kv: HashMap::new(),
                    sessions: HashMap::new(),
                    conns: Vec::new(),
                    command_log: Vec::new(),
                    delays: HashMap::new(),
                }),
                connect_attempts: AtomicU64::new(0),
                conn_ids: AtomicU64::new(1),
            }),
        }
    }

    /// Designate the cluster leader.
    pub fn set_leader(&self, leader: Option<Address>) {
        self.inner.state.lock().unwrap().leader = leader;
    }

    /// Script the behavior of one node.
    pub fn set_behavior(&self, addr: &Address, behavior: Behavior) {
        self.inner.state.lock().unwrap().behaviors.insert(addr.clone(), behavior);
    }

    /// Script the behavior of every node at once.
    pub fn set_all_behaviors(&self, behavior: Behavior) {
        let mut state = self.inner.state.lock().unwrap();
        let members: Vec<Address> = state.members.clone();
        for addr in members {
            state.behaviors.insert(addr, behavior);
        }
    }

    /// Set the session timeout the cluster grants, in milliseconds.
    pub fn set_grant_timeout(&self, millis: u64) {
        self.inner.state.lock().unwrap().grant_timeout = millis;
    }

    /// Add an artificial delay to serving operations on the given key.
    pub fn delay_key(&self, key: &str, delay: Duration) {
        self.inner.state.lock().unwrap().delays.insert(key.to_string(), delay);
    }

    /// How many transport-level connect calls have been issued against this cluster.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Relaxed)
    }

    /// The `(served-at, sequence)` log of every command received, in arrival order.
    pub fn command_log(&self) -> Vec<(Address, u64)> {
        self.inner.state.lock().unwrap().command_log.clone()
    }

    /// The number of currently registered sessions.
    pub fn session_count(&self) -> usize {
        self.inner.state.lock().unwrap().sessions.len()
    }

    /// The number of currently live connections into the cluster.
    pub fn live_connections(&self) -> usize {
        self.inner.state.lock().unwrap().conns.len()
    }

    /// Read a value straight out of the state machine.
    pub fn value(&self, key: &str) -> Option<String> {
        self.inner.state.lock().unwrap().kv.get(key).cloned()
    }

    /// Drop every live connection, as a network partition would.
    pub fn kill_connections(&self) {
        let mut state = self.inner.state.lock().unwrap();
        for conn in state.conns.drain(..) {
            let _ = conn.closed.send(true);
        }
        for session in state.sessions.values_mut() {
            session.publisher = None;
        }
    }

    /// Forget a session server-side; its next request observes `UnknownSession`.
    pub fn forget_session(&self, session_id: SessionId) {
        self.inner.state.lock().unwrap().sessions.remove(&session_id);
    }

    /// Publish a session event, pushing it over the session's live connection if one exists.
    ///
    /// Returns the assigned event index, or `None` if the session is not registered.
    pub fn publish(&self, session_id: SessionId, name: &str, value: Option<String>) -> Option<u64> {
        let mut state = self.inner.state.lock().unwrap();
        let alive: HashSet<u64> = state.conns.iter().map(|conn| conn.id).collect();
        let session = state.sessions.get_mut(&session_id)?;
        let previous = session.events.last().map(|event| event.index).unwrap_or(0);
        let index = previous + 1;
        let event = StoredEvent {
            index,
            previous,
            name: name.to_string(),
            payload: KvResponse(value),
        };
        session.events.push(event.clone());
        if let Some((conn_id, tx)) = &session.publisher {
            if alive.contains(conn_id) {
                let _ = tx.send(PublishEvent {
                    session_id,
                    event_index: event.index,
                    previous_index: event.previous,
                    name: event.name,
                    payload: event.payload,
                });
            }
        }
        Some(index)
    }
}

#[async_trait]
impl Transport<KvRequest, KvResponse> for MemNet {
    type Conn = MemConnection;

    async fn connect(&self, addr: &Address) -> Result<MemConnection, TransportError> {
        self.inner.connect_attempts.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
        let behavior = {
            let state = self.inner.state.lock().unwrap();
            state.behaviors.get(addr).copied().unwrap_or(Behavior::Refuse)
        };
        match behavior {
            Behavior::Refuse => Err(TransportError::ConnectionRefused(addr.clone())),
            Behavior::BlackHole => futures::future::pending().await,
            Behavior::Normal => {
                let id = self.inner.conn_ids.fetch_add(1, Ordering::Relaxed);
                let (closed_tx, closed_rx) = watch::channel(false);
                let mut state = self.inner.state.lock().unwrap();
                state.conns.push(LiveConn { id, closed: closed_tx });
                tracing::debug!(conn_id = id, server = %addr, "memnet connection opened");
                Ok(MemConnection {
                    net: self.inner.clone(),
                    id,
                    addr: addr.clone(),
                    closed_rx,
                    publish: Arc::new(Mutex::new(None)),
                })
            }
        }
    }
}

/// One simulated client connection to one node.
#[derive(Debug)]
pub struct MemConnection {
    net: Arc<NetInner>,
    id: u64,
    addr: Address,
    closed_rx: watch::Receiver<bool>,
    publish: Arc<Mutex<Option<mpsc::UnboundedSender<PublishEvent<KvResponse>>>>>,
}

impl MemConnection {
    async fn serve(&self, req: ClientRequest<KvRequest>) -> Result<ClientResponse<KvResponse>, TransportError> {
        tokio::task::yield_now().await;
        let behavior = {
            let state = self.net.state.lock().unwrap();
            state.behaviors.get(&self.addr).copied().unwrap_or(Behavior::Refuse)
        };
        match behavior {
            Behavior::Refuse => return Err(TransportError::ChannelClosed),
            Behavior::BlackHole => futures::future::pending().await,
            Behavior::Normal => {}
        }
        if let Some(delay) = self.delay_for(&req) {
            sleep(delay).await;
        }
        Ok(self.net.serve_locked(self, req))
    }

    fn delay_for(&self, req: &ClientRequest<KvRequest>) -> Option<Duration> {
        let key = match req {
            ClientRequest::Command(req) => match &req.payload {
                KvRequest::Put { key, .. } => key,
                KvRequest::Get { key } => key,
            },
            ClientRequest::Query(req) => match &req.payload {
                KvRequest::Put { key, .. } => key,
                KvRequest::Get { key } => key,
            },
            _ => return None,
        };
        self.net.state.lock().unwrap().delays.get(key).copied()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Connection<KvRequest, KvResponse> for MemConnection {
    async fn send(&self, req: ClientRequest<KvRequest>) -> Result<(), TransportError> {
        self.send_and_receive(req).await.map(|_| ())
    }

    async fn send_and_receive(
        &self,
        req: ClientRequest<KvRequest>,
    ) -> Result<ClientResponse<KvResponse>, TransportError> {
        let mut closed = self.closed_rx.clone();
        if *closed.borrow() {
            return Err(TransportError::ChannelClosed);
        }
        tokio::select! {
            res = self.serve(req) => res,
            _ = wait_closed(&mut closed) => Err(TransportError::ChannelClosed),
        }
    }

    fn set_publish_handler(&self, tx: mpsc::UnboundedSender<PublishEvent<KvResponse>>) {
        *self.publish.lock().unwrap() = Some(tx);
    }

    async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        wait_closed(&mut rx).await
    }

    async fn close(&self) {
        self.net.close_conn(self.id);
    }
}

impl NetInner {
    fn close_conn(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.conns.iter().position(|conn| conn.id == id) {
            let conn = state.conns.remove(pos);
            let _ = conn.closed.send(true);
            tracing::debug!(conn_id = id, "memnet connection closed");
        }
        for session in state.sessions.values_mut() {
            if session.publisher.as_ref().map(|(conn_id, _)| *conn_id == id).unwrap_or(false) {
                session.publisher = None;
            }
        }
    }

    fn serve_locked(&self, conn: &MemConnection, req: ClientRequest<KvRequest>) -> ClientResponse<KvResponse> {
        let mut state = self.state.lock().unwrap();
        let leader = state.leader.clone();
        let members = state.members.clone();
        let is_leader = leader.as_ref() == Some(&conn.addr);
        let not_leader_code = if leader.is_some() { ErrorCode::NotLeader } else { ErrorCode::NoLeader };

        match req {
            ClientRequest::Connect(_) => ClientResponse::Connect(ConnectResponse {
                status: Status::Ok,
                error: None,
                leader,
                members,
            }),
            ClientRequest::Register(req) => {
                if !is_leader {
                    return ClientResponse::Register(RegisterResponse {
                        status: Status::Error,
                        error: Some(not_leader_code),
                        session_id: 0,
                        timeout: 0,
                        leader,
                        members,
                    });
                }
                let session_id = state.next_session_id;
                state.next_session_id += 1;
                let publisher = conn.publish.lock().unwrap().clone().map(|tx| (conn.id, tx));
                let grant = state.grant_timeout;
                state.sessions.insert(session_id, ServerSession {
                    client_id: req.client_id,
                    responses: HashMap::new(),
                    events: Vec::new(),
                    publisher,
                });
                tracing::debug!(session_id, "memnet session registered");
                ClientResponse::Register(RegisterResponse {
                    status: Status::Ok,
                    error: None,
                    session_id,
                    timeout: grant,
                    leader,
                    members,
                })
            }
            ClientRequest::KeepAlive(req) => {
                if !is_leader {
                    return ClientResponse::KeepAlive(KeepAliveResponse {
                        status: Status::Error,
                        error: Some(not_leader_code),
                        leader,
                        members,
                    });
                }
                let session_id = req.session_id;
                let publisher = conn.publish.lock().unwrap().clone().map(|tx| (conn.id, tx));
                match state.sessions.get_mut(&session_id) {
                    None => ClientResponse::KeepAlive(KeepAliveResponse {
                        status: Status::Error,
                        error: Some(ErrorCode::UnknownSession),
                        leader,
                        members,
                    }),
                    Some(session) => {
                        session.publisher = publisher;
                        if let Some((_, tx)) = &session.publisher {
                            for event in session.events.iter().filter(|event| event.index > req.event_index) {
                                let _ = tx.send(PublishEvent {
                                    session_id,
                                    event_index: event.index,
                                    previous_index: event.previous,
                                    name: event.name.clone(),
                                    payload: event.payload.clone(),
                                });
                            }
                        }
                        ClientResponse::KeepAlive(KeepAliveResponse {
                            status: Status::Ok,
                            error: None,
                            leader,
                            members,
                        })
                    }
                }
            }
            ClientRequest::Unregister(req) => {
                let known = state.sessions.remove(&req.session_id).is_some();
                ClientResponse::Unregister(UnregisterResponse {
                    status: if known { Status::Ok } else { Status::Error },
                    error: if known { None } else { Some(ErrorCode::UnknownSession) },
                })
            }
            ClientRequest::Command(req) => {
                if !is_leader {
                    return operation_error(not_leader_code);
                }
                state.command_log.push((conn.addr.clone(), req.sequence));
                let ClusterState { sessions, kv, log_index, .. } = &mut *state;
                let session = match sessions.get_mut(&req.session_id) {
                    Some(session) => session,
                    None => return operation_error(ErrorCode::UnknownSession),
                };
                let event_index = session.events.last().map(|event| event.index).unwrap_or(0);
                if let Some((index, result)) = session.responses.get(&req.sequence) {
                    // Duplicate delivery: replay the cached response without re-applying.
                    return ClientResponse::Operation(OperationResponse {
                        status: Status::Ok,
                        error: None,
                        index: *index,
                        event_index,
                        result: Some(result.clone()),
                    });
                }
                *log_index += 1;
                let result = match req.payload {
                    KvRequest::Put { key, value } => KvResponse(kv.insert(key, value)),
                    KvRequest::Get { key } => KvResponse(kv.get(&key).cloned()),
                };
                session.responses.insert(req.sequence, (*log_index, result.clone()));
                ClientResponse::Operation(OperationResponse {
                    status: Status::Ok,
                    error: None,
                    index: *log_index,
                    event_index,
                    result: Some(result),
                })
            }
            ClientRequest::Query(req) => {
                let leader_only = matches!(
                    req.consistency,
                    QueryConsistency::Linearizable | QueryConsistency::BoundedLinearizable
                );
                if leader_only && !is_leader {
                    return operation_error(not_leader_code);
                }
                let session = match state.sessions.get(&req.session_id) {
                    Some(session) => session,
                    None => return operation_error(ErrorCode::UnknownSession),
                };
                let event_index = session.events.last().map(|event| event.index).unwrap_or(0);
                match req.payload {
                    KvRequest::Get { key } => ClientResponse::Operation(OperationResponse {
                        status: Status::Ok,
                        error: None,
                        index: state.log_index,
                        event_index,
                        result: Some(KvResponse(state.kv.get(&key).cloned())),
                    }),
                    KvRequest::Put { .. } => operation_error(ErrorCode::QueryError),
                }
            }
        }
    }
}

fn operation_error(code: ErrorCode) -> ClientResponse<KvResponse> {
    ClientResponse::Operation(OperationResponse {
        status: Status::Error,
        error: Some(code),
        index: 0,
        event_index: 0,
        result: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use raft_client::protocol::CommandConsistency;
    use raft_client::protocol::CommandRequest;
    use raft_client::protocol::ConnectRequest;
    use raft_client::protocol::RegisterRequest;

    fn addr(port: u16) -> Address {
        Address::new("localhost", port)
    }

    async fn registered(conn: &MemConnection) -> SessionId {
        let res = conn
            .send_and_receive(ClientRequest::Register(RegisterRequest {
                client_id: "test".into(),
                timeout: 1000,
            }))
            .await
            .unwrap();
        match res {
            ClientResponse::Register(res) => {
                assert_eq!(res.status, Status::Ok);
                res.session_id
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    fn put(session_id: SessionId, sequence: u64, key: &str, value: &str) -> ClientRequest<KvRequest> {
        ClientRequest::Command(CommandRequest {
            session_id,
            sequence,
            consistency: CommandConsistency::Linearizable,
            payload: KvRequest::Put { key: key.into(), value: value.into() },
        })
    }

    #[tokio::test]
    async fn connect_reports_leader_and_members() {
        let net = MemNet::new(vec![addr(1), addr(2)]);
        net.set_leader(Some(addr(2)));
        let conn = net.connect(&addr(1)).await.unwrap();
        let res = conn
            .send_and_receive(ClientRequest::Connect(ConnectRequest { client_id: "test".into() }))
            .await
            .unwrap();
        match res {
            ClientResponse::Connect(res) => {
                assert_eq!(res.status, Status::Ok);
                assert_eq!(res.leader, Some(addr(2)));
                assert_eq!(res.members, vec![addr(1), addr(2)]);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_command_delivery_is_idempotent() {
        let net = MemNet::new(vec![addr(1)]);
        net.set_leader(Some(addr(1)));
        let conn = net.connect(&addr(1)).await.unwrap();
        let session_id = registered(&conn).await;

        let first = conn.send_and_receive(put(session_id, 1, "k", "v1")).await.unwrap();
        // The same sequence again, as a retry after a lost response would deliver it.
        let second = conn.send_and_receive(put(session_id, 1, "k", "v1")).await.unwrap();
        match (first, second) {
            (ClientResponse::Operation(a), ClientResponse::Operation(b)) => {
                assert_eq!(a.index, b.index);
                assert_eq!(a.result, b.result);
            }
            other => panic!("unexpected responses: {:?}", other),
        }
        // Applied exactly once.
        assert_eq!(net.value("k"), Some("v1".to_string()));
        assert_eq!(net.command_log().len(), 2);
    }

    #[tokio::test]
    async fn events_are_indexed_per_session() {
        let net = MemNet::new(vec![addr(1)]);
        net.set_leader(Some(addr(1)));
        let conn = net.connect(&addr(1)).await.unwrap();
        let session_id = registered(&conn).await;

        assert_eq!(net.publish(session_id, "change", Some("a".into())), Some(1));
        assert_eq!(net.publish(session_id, "change", Some("b".into())), Some(2));
        assert_eq!(net.publish(9999, "change", None), None);
    }

    #[tokio::test]
    async fn refused_node_fails_connect() {
        let net = MemNet::new(vec![addr(1)]);
        net.set_behavior(&addr(1), Behavior::Refuse);
        let err = net.connect(&addr(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused(_)));
    }
}

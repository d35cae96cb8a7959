//! Wire messages exchanged between the client and the cluster.

use serde::Deserialize;
use serde::Serialize;

use crate::Address;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;

/// The cluster-assigned identifier of a registered session.
pub type SessionId = u64;

/// The outcome tag carried by every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The request was handled successfully.
    Ok,
    /// The request failed; the response's `error` field selects retry vs propagate.
    Error,
}

/// Protocol error codes returned by the cluster.
///
/// Codes are split into a *retriable* set, which the connection manager absorbs by failing over
/// to another server, and a *terminal* set, which escapes directly to the submitter. The
/// distinguished `UnknownSession` code expires the session as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// A connection could not be established to the target server.
    ConnectError,
    /// The request timed out in transit.
    Timeout,
    /// A generic transport-level failure.
    TransportError,
    /// The underlying channel was closed mid-request.
    ClosedChannel,
    /// The cluster currently has no elected leader.
    NoLeader,
    /// The receiving server is not the leader; retry elsewhere.
    NotLeader,
    /// The receiving server is in a state which cannot serve the request.
    IllegalMemberState,
    /// The command was rejected by the cluster.
    CommandError,
    /// The query was rejected by the cluster.
    QueryError,
    /// The state machine raised an application-level error.
    ApplicationError,
    /// The session referenced by the request is not known to the cluster.
    UnknownSession,
    /// An unclassified server-side failure.
    InternalError,
}

impl ErrorCode {
    /// Check whether a failure with this code should provoke failover and a resend.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ConnectError
                | Self::Timeout
                | Self::TransportError
                | Self::ClosedChannel
                | Self::NoLeader
                | Self::NotLeader
                | Self::IllegalMemberState
        )
    }

    /// Check whether this code is fatal to the session as a whole.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::UnknownSession)
    }
}

/// The consistency level attached to a submitted command.
///
/// All commands are routed to the leader; the levels differ in how events published during
/// application are observed relative to the command's completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandConsistency {
    /// Events published by the command may be observed after its completion.
    Causal,
    /// Events published by the command are sequenced with its completion.
    Sequential,
    /// Full linearizable semantics for the command and its events.
    Linearizable,
}

impl Default for CommandConsistency {
    fn default() -> Self {
        Self::Linearizable
    }
}

/// The consistency level attached to a submitted query.
///
/// Stronger levels pin the query to the leader; weaker levels may execute on followers subject
/// to read-index and sequence constraints enforced server-side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryConsistency {
    /// May read from any server; causally ordered with the session's own commands.
    Causal,
    /// May read from any server; sequentially consistent within the session.
    Sequential,
    /// Served by the leader within a bounded staleness window.
    BoundedLinearizable,
    /// Served by the leader with a read-index round to guard against stale leadership.
    Linearizable,
}

impl Default for QueryConsistency {
    fn default() -> Self {
        Self::Linearizable
    }
}

/// The client → cluster request envelope, framed by the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientRequest<D: AppData> {
    Connect(ConnectRequest),
    Register(RegisterRequest),
    KeepAlive(KeepAliveRequest),
    Unregister(UnregisterRequest),
    #[serde(bound = "D: AppData")]
    Command(CommandRequest<D>),
    #[serde(bound = "D: AppData")]
    Query(QueryRequest<D>),
}

impl<D: AppData> MessageSummary for ClientRequest<D> {
    fn summary(&self) -> String {
        match self {
            Self::Connect(req) => format!("Connect client_id={}", req.client_id),
            Self::Register(req) => format!("Register client_id={}, timeout={}", req.client_id, req.timeout),
            Self::KeepAlive(req) => format!(
                "KeepAlive session={}, command_sequence={}, event_index={}",
                req.session_id, req.command_sequence, req.event_index
            ),
            Self::Unregister(req) => format!("Unregister session={}", req.session_id),
            Self::Command(req) => format!("Command session={}, sequence={}", req.session_id, req.sequence),
            Self::Query(req) => {
                format!("Query session={}, sequence={}, index={}", req.session_id, req.sequence, req.index)
            }
        }
    }
}

/// The cluster → client response envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClientResponse<R: AppDataResponse> {
    Connect(ConnectResponse),
    Register(RegisterResponse),
    KeepAlive(KeepAliveResponse),
    Unregister(UnregisterResponse),
    #[serde(bound = "R: AppDataResponse")]
    Operation(OperationResponse<R>),
}

/// The handshake sent on every freshly opened transport connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// The caller's stable client identifier.
    pub client_id: String,
}

/// The response to a `ConnectRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub status: Status,
    pub error: Option<ErrorCode>,
    /// The server's current belief of the cluster leader, if any.
    pub leader: Option<Address>,
    /// The cluster membership as known to the responding server.
    pub members: Vec<Address>,
}

/// A request to register a new session with the cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// The caller's stable client identifier.
    pub client_id: String,
    /// The session timeout the client would like, in milliseconds. The cluster's granted
    /// value is authoritative.
    pub timeout: u64,
}

/// The response to a `RegisterRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: Status,
    pub error: Option<ErrorCode>,
    /// The cluster-assigned session id.
    pub session_id: SessionId,
    /// The granted session timeout in milliseconds. The client must derive its keep-alive
    /// period from this value, not from its own hint.
    pub timeout: u64,
    pub leader: Option<Address>,
    pub members: Vec<Address>,
}

/// The periodic heartbeat renewing the session lease.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session_id: SessionId,
    /// The highest sequence the client has submitted *and* received a response for.
    pub command_sequence: u64,
    /// Acknowledges the highest session-event index delivered to listeners.
    pub event_index: u64,
}

/// The response to a `KeepAliveRequest`. May carry an updated membership view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub status: Status,
    pub error: Option<ErrorCode>,
    pub leader: Option<Address>,
    pub members: Vec<Address>,
}

/// A request to close a session gracefully.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub session_id: SessionId,
}

/// The response to an `UnregisterRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub status: Status,
    pub error: Option<ErrorCode>,
}

/// A state-mutating operation submitted to the replicated state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandRequest<D: AppData> {
    pub session_id: SessionId,
    /// The session-scoped sequence assigned at submission time. Retries reuse the original
    /// value; the cluster uses it for idempotent deduplication.
    pub sequence: u64,
    pub consistency: CommandConsistency,
    #[serde(bound = "D: AppData")]
    pub payload: D,
}

/// A read-only operation against the replicated state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryRequest<D: AppData> {
    pub session_id: SessionId,
    /// The session-scoped sequence assigned at submission time.
    pub sequence: u64,
    pub consistency: QueryConsistency,
    /// The highest state machine index the client has observed, used server-side for
    /// read-index bookkeeping on the weaker consistency levels.
    pub index: u64,
    #[serde(bound = "D: AppData")]
    pub payload: D,
}

/// The response to a `CommandRequest` or `QueryRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationResponse<R: AppDataResponse> {
    pub status: Status,
    pub error: Option<ErrorCode>,
    /// The state machine index at which the operation was applied or served.
    pub index: u64,
    /// The highest event index published for the session at the time of the response.
    pub event_index: u64,
    #[serde(bound = "R: AppDataResponse")]
    pub result: Option<R>,
}

/// A server-published session event, pushed over the live connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishEvent<R: AppDataResponse> {
    pub session_id: SessionId,
    /// Monotone per-session identifier of this event.
    pub event_index: u64,
    /// The index of the event published immediately before this one. Used to detect gaps.
    pub previous_index: u64,
    /// The event name listeners subscribe on.
    pub name: String,
    #[serde(bound = "R: AppDataResponse")]
    pub payload: R,
}

impl<R: AppDataResponse> MessageSummary for PublishEvent<R> {
    fn summary(&self) -> String {
        format!(
            "Publish session={}, event_index={}, previous_index={}, name={}",
            self.session_id, self.event_index, self.previous_index, self.name
        )
    }
}

//! The client's transport interface and data types.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::ClientRequest;
use crate::protocol::ClientResponse;
use crate::protocol::PublishEvent;
use crate::Address;
use crate::AppData;
use crate::AppDataResponse;

/// A trait defining the interface for the client's wire transport.
///
/// Implementations are expected to frame and serialize [`ClientRequest`] /
/// [`ClientResponse`] envelopes themselves; the client core never touches bytes. The
/// connection manager holds at most one live [`Connection`] at a time and calls
/// `connect` again whenever it fails over.
#[async_trait]
pub trait Transport<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// The transport's connection handle type.
    type Conn: Connection<D, R>;

    /// Open a new connection to the given server.
    ///
    /// Any transport-level failure is reported as a [`TransportError`]; the connection
    /// manager reacts by moving on to the next candidate in the current sweep.
    async fn connect(&self, addr: &Address) -> Result<Self::Conn, TransportError>;
}

/// One live transport session with one server.
///
/// A connection is shared between the client core and its spawned dispatch tasks, so all
/// methods take `&self`. Implementations must deliver responses for concurrently in-flight
/// requests independently; the ordering of completions is the client core's concern, not the
/// connection's.
#[async_trait]
pub trait Connection<D, R>: Send + Sync + 'static
where
    D: AppData,
    R: AppDataResponse,
{
    /// Dispatch a request without waiting for a response.
    async fn send(&self, req: ClientRequest<D>) -> Result<(), TransportError>;

    /// Dispatch a request and await its response.
    async fn send_and_receive(&self, req: ClientRequest<D>) -> Result<ClientResponse<R>, TransportError>;

    /// Install the handler for server-pushed session events.
    ///
    /// The client core re-installs its handler on every freshly opened connection, so an
    /// implementation only ever needs to remember the most recent sender.
    fn set_publish_handler(&self, tx: mpsc::UnboundedSender<PublishEvent<R>>);

    /// Resolve once the connection has been closed, whether locally or by the remote side.
    ///
    /// The client core uses this to observe server-initiated disconnects while no request is
    /// in flight. Must be safe to call concurrently with other methods.
    async fn closed(&self);

    /// Close the connection, releasing any transport resources.
    async fn close(&self);
}

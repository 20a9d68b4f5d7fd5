use crate::transfer::{PeerHandle, Result, TransferHandle};
use async_trait::async_trait;
use derive_more::Display;
use fx_handle::Handle;
#[cfg(test)]
use mockall::automock;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

/// A unique handle identifier of a [PeerConnection].
pub type ConnectionHandle = Handle;

/// A shared reference to a peer connection.
/// Connections are jointly held by the session-wide registry and the transfer-local connection set.
pub type ConnectionRef = Arc<dyn PeerConnection>;

/// The reason why a connection is being disconnected.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    #[display("no error")]
    NoError,
    #[display("self connection")]
    SelfConnection,
    #[display("duplicate peer id")]
    DuplicatePeerId,
    #[display("too many connections")]
    TooManyConnections,
    #[display("banned by ip filter")]
    BannedByIpFilter,
    #[display("transfer finished")]
    TransferFinished,
    #[display("transfer paused")]
    TransferPaused,
    #[display("connect timeout")]
    ConnectTimeout,
    #[display("connect failed")]
    ConnectFailed,
    #[display("endpoint unavailable")]
    EndpointUnavailable,
    #[display("stopping transfer")]
    StoppingTransfer,
}

/// A single live or connecting session with a remote peer.
///
/// The connection itself is implemented by the socket transport and the wire protocol.
/// This core only depends on its lifecycle and endpoint information.
/// Methods take `&self` as connections are shared, implementations are expected to use interior mutability.
#[async_trait]
pub trait PeerConnection: Debug + Send + Sync {
    /// Get the unique handle of the connection.
    fn handle(&self) -> ConnectionHandle;

    /// Get the remote endpoint of the connection.
    fn remote(&self) -> Result<SocketAddr>;

    /// Get the local endpoint of the connection.
    fn local(&self) -> Result<SocketAddr>;

    /// Check if the connection is still being established.
    fn is_connecting(&self) -> bool;

    /// Check if the connection has been initiated by us (outgoing).
    fn is_local(&self) -> bool;

    /// Check if the remote peer is only interested in uploading to us.
    fn upload_only(&self) -> bool;

    /// Get the peer record this connection is bound to, if any.
    fn peer(&self) -> Option<PeerHandle>;

    /// Bind or unbind the connection to a peer record.
    fn set_peer(&self, peer: Option<PeerHandle>);

    /// Execute the periodic maintenance of the connection.
    fn second_tick(&self) -> Result<()>;

    /// Disconnect the connection with the given reason.
    /// This should not call back into the transfer, the caller takes care of the registries.
    fn disconnect(&self, reason: DisconnectReason);

    /// Establish the underlying link with the remote peer.
    async fn connect(&self) -> Result<()>;

    /// Invoked when the connect attempt has completed.
    fn on_connect(&self, result: Result<()>);

    /// Invoked when the connect attempt didn't complete in time.
    fn on_timeout(&self);
}

/// Creates outgoing connections on the session's socket stack.
#[cfg_attr(test, automock)]
pub trait ConnectionFactory: Debug + Send + Sync {
    /// Create a new, not yet connected, connection towards the given address for the given transfer.
    ///
    /// # Arguments
    ///
    /// * `transfer` - The transfer the connection will belong to.
    /// * `addr` - The remote address of the peer.
    ///
    /// # Returns
    ///
    /// It returns the created connection, or an error when the connection couldn't be created.
    fn create(&self, transfer: TransferHandle, addr: SocketAddr) -> Result<ConnectionRef>;
}

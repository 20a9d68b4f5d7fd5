use crate::transfer::{ConnectionHandle, ConnectionRef, PeerConnection};
use bitmask_enum::bitmask;
use derive_more::Display;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

/// The stable handle of a [Peer] record within a peer registry.
/// A handle is only meaningful for the registry which created it.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("peer#{_0}")]
pub struct PeerHandle(usize);

impl PeerHandle {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Get the arena index of the handle.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// The sources from which a peer has been learned.
#[bitmask(u8)]
#[bitmask_config(vec_debug, flags_iter)]
pub enum PeerSource {
    /// The peer connected to us.
    Incoming = 0b0001,
    /// The peer has been announced by a server.
    Server = 0b0010,
    /// The peer has been restored from resume data.
    Resume = 0b0100,
    /// The peer has been added manually.
    Manual = 0b1000,
}

impl Default for PeerSource {
    fn default() -> Self {
        PeerSource::Manual
    }
}

/// The non-owning link between a peer record and its live connection.
#[derive(Debug, Clone)]
struct ConnectionLink {
    handle: ConnectionHandle,
    connection: Weak<dyn PeerConnection>,
}

/// A remote endpoint known to a transfer, independent of whether it is currently connected.
#[derive(Debug, Clone)]
pub struct Peer {
    addr: SocketAddr,
    connection: Option<ConnectionLink>,
    /// The sources this peer has been learned from.
    pub source: PeerSource,
    /// The number of failed connection attempts towards this peer.
    pub failcount: u8,
    /// Indicates if the peer has been banned.
    pub banned: bool,
    /// Indicates if we're able to initiate a connection towards the peer.
    pub connectable: bool,
    /// Indicates if the peer owns all pieces.
    pub seed: bool,
}

impl Peer {
    pub fn new(addr: SocketAddr, source: PeerSource, connectable: bool) -> Self {
        Self {
            addr,
            connection: None,
            source,
            failcount: 0,
            banned: false,
            connectable,
            seed: false,
        }
    }

    /// Get the endpoint of the peer.
    pub fn addr(&self) -> &SocketAddr {
        &self.addr
    }

    /// Get the ip address of the peer.
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Check if the peer currently references a connection.
    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// Get the handle of the connection this peer references.
    pub fn connection_handle(&self) -> Option<ConnectionHandle> {
        self.connection.as_ref().map(|e| e.handle)
    }

    /// Get the connection of the peer, if it's still alive.
    pub fn connection(&self) -> Option<ConnectionRef> {
        self.connection.as_ref().and_then(|e| e.connection.upgrade())
    }

    pub(crate) fn set_connection(&mut self, connection: &ConnectionRef) {
        self.connection = Some(ConnectionLink {
            handle: connection.handle(),
            connection: Arc::downgrade(connection),
        });
    }

    pub(crate) fn clear_connection(&mut self) {
        self.connection = None;
    }
}

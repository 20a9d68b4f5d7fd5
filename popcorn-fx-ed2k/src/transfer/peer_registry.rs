use crate::transfer::{ConnectionHandle, Error, Peer, PeerHandle, Result};
use log::trace;
use std::net::{IpAddr, SocketAddr};

/// The ordered collection of known peers of a single transfer.
///
/// Peer records are stored within an arena and are never removed for the lifetime of the registry,
/// which keeps every [PeerHandle] valid. A separate index keeps the handles sorted by ip address
/// so lookups can make use of a binary search.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
    order: Vec<PeerHandle>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of known peers.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Get the peer record of the given handle.
    pub fn get(&self, handle: &PeerHandle) -> Option<&Peer> {
        self.peers.get(handle.index())
    }

    /// Get the mutable peer record of the given handle.
    pub fn get_mut(&mut self, handle: &PeerHandle) -> Option<&mut Peer> {
        self.peers.get_mut(handle.index())
    }

    /// Look up the peer for the given endpoint.
    ///
    /// When multiple connections per ip are allowed, only the sub-range of the ip is scanned for an exact endpoint match.
    /// Otherwise, the peer is matched on its ip address only.
    ///
    /// # Returns
    ///
    /// It returns the handle of the known peer, or the position at which a new peer should be inserted to preserve the ordering.
    pub fn find(
        &self,
        addr: &SocketAddr,
        multiple_per_ip: bool,
    ) -> std::result::Result<PeerHandle, usize> {
        let ip = addr.ip();
        let lower = self.lower_bound(&ip);

        if multiple_per_ip {
            let upper = self.upper_bound(&ip);
            self.order[lower..upper]
                .iter()
                .find(|handle| self.peers[handle.index()].addr() == addr)
                .copied()
                .ok_or(upper)
        } else {
            self.order
                .get(lower)
                .filter(|handle| self.peers[handle.index()].ip() == ip)
                .copied()
                .ok_or(lower)
        }
    }

    /// Get the peer which currently references the given connection.
    pub fn find_by_connection(&self, connection: &ConnectionHandle) -> Option<PeerHandle> {
        self.order
            .iter()
            .find(|handle| self.peers[handle.index()].connection_handle() == Some(*connection))
            .copied()
    }

    /// Insert a new peer record at the given position of the ordered index.
    /// The position should have been obtained through [PeerRegistry::find].
    ///
    /// # Returns
    ///
    /// It returns the handle of the new peer, or [Error::RegistryAllocationFailed] when no memory could be reserved.
    pub fn insert(&mut self, position: usize, peer: Peer) -> Result<PeerHandle> {
        self.peers
            .try_reserve(1)
            .map_err(|_| Error::RegistryAllocationFailed)?;
        self.order
            .try_reserve(1)
            .map_err(|_| Error::RegistryAllocationFailed)?;

        let position = position.min(self.order.len());
        let handle = PeerHandle::new(self.peers.len());
        trace!("Peer registry is inserting {} ({}) at {}", handle, peer.addr(), position);
        self.peers.push(peer);
        self.order.insert(position, handle);
        Ok(handle)
    }

    /// Get the handles of all peers, ordered by address.
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.order.clone()
    }

    /// Iterate over all peers, ordered by address.
    pub fn iter(&self) -> impl Iterator<Item = (PeerHandle, &Peer)> {
        self.order
            .iter()
            .map(move |handle| (*handle, &self.peers[handle.index()]))
    }

    fn lower_bound(&self, ip: &IpAddr) -> usize {
        self.order
            .partition_point(|handle| self.peers[handle.index()].ip() < *ip)
    }

    fn upper_bound(&self, ip: &IpAddr) -> usize {
        self.order
            .partition_point(|handle| self.peers[handle.index()].ip() <= *ip)
    }
}

use crate::transfer::{
    ConnectionRef, DisconnectReason, Error, Peer, PeerConnection, PeerHandle, PeerRegistry,
    PeerSource, Result, SessionContext, SessionEvent, TransferHandle,
};
use log::{debug, trace, warn};
use std::net::{IpAddr, SocketAddr};

/// The operations a [PeerPolicy] requires from the transfer which owns it.
///
/// All calls are made from the single logical thread which owns the transfer,
/// implementations should never call back into the policy.
pub trait PeerConnector {
    /// Get the handle of the transfer which owns the policy.
    fn transfer(&self) -> TransferHandle;

    /// Get the session context of the transfer.
    fn context(&self) -> &SessionContext;

    /// Check if the transfer owns all of its pieces.
    fn is_finished(&self) -> bool;

    /// Open a new outgoing connection towards the given peer.
    /// The connection is registered within the transfer-local and session-wide connection sets.
    ///
    /// # Returns
    ///
    /// It returns the connection when the connect attempt has been started, else the error.
    /// On failure, all registrations of the connection have been rolled back.
    fn connect_to_peer(&mut self, peer: PeerHandle, addr: SocketAddr) -> Result<ConnectionRef>;

    /// Disconnect the given connection and remove it from the transfer-local and session-wide connection sets.
    fn close_connection(&mut self, connection: &ConnectionRef, reason: DisconnectReason);
}

/// The peer policy of a transfer.
///
/// The policy owns the registry of known peers, decides which connections are admitted
/// and which peer should be connected next.
#[derive(Debug, Default)]
pub struct PeerPolicy {
    peers: PeerRegistry,
}

impl PeerPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the registry of known peers.
    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Get the peer record of the given handle.
    pub fn peer(&self, handle: &PeerHandle) -> Option<&Peer> {
        self.peers.get(handle)
    }

    /// Get the number of known peers.
    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    /// Add the given peer endpoint to the known peers.
    ///
    /// # Arguments
    ///
    /// * `addr` - The endpoint of the peer.
    /// * `source` - The source from which the peer has been learned.
    /// * `connector` - The owning transfer.
    ///
    /// # Returns
    ///
    /// It returns the handle of the existing or new peer record,
    /// or [Error::BlockedPeer] when the address is blocked by the ip filter.
    pub fn add_peer<C: PeerConnector>(
        &mut self,
        addr: SocketAddr,
        source: PeerSource,
        connector: &C,
    ) -> Result<PeerHandle> {
        let ip = addr.ip();
        if connector.context().is_blocked(&ip) {
            debug!(
                "Peer policy of {} rejected peer {}, address is blocked",
                connector.transfer(),
                addr
            );
            Self::notify_blocked(connector, ip);
            return Err(Error::BlockedPeer(ip));
        }

        let multiple_per_ip = connector
            .context()
            .config()
            .allow_multiple_connections_per_ip;
        match self.peers.find(&addr, multiple_per_ip) {
            Ok(handle) => {
                if let Some(peer) = self.peers.get_mut(&handle) {
                    peer.source |= source;
                }
                Ok(handle)
            }
            Err(position) => {
                let handle = self
                    .peers
                    .insert(position, Peer::new(addr, source, true))?;
                trace!(
                    "Peer policy of {} added peer {} ({})",
                    connector.transfer(),
                    addr,
                    handle
                );
                Ok(handle)
            }
        }
    }

    /// Validate a new incoming or outgoing connection and bind it to a peer record.
    ///
    /// When the peer already has a live connection, the conflict is resolved:
    /// cross-matching endpoints are a self connection and both connections are disconnected,
    /// otherwise the connection which is still connecting loses with [DisconnectReason::DuplicatePeerId].
    ///
    /// Every rejection disconnects the new connection and removes it from the connection sets.
    ///
    /// # Returns
    ///
    /// It returns the handle of the peer to which the connection has been bound.
    pub fn new_connection<C: PeerConnector>(
        &mut self,
        connection: &ConnectionRef,
        connector: &mut C,
    ) -> Result<PeerHandle> {
        let remote = match connection.remote() {
            Ok(e) => e,
            Err(e) => {
                debug!(
                    "Peer policy of {} is unable to read remote endpoint of {}, {}",
                    connector.transfer(),
                    connection.handle(),
                    e
                );
                connector.close_connection(connection, DisconnectReason::EndpointUnavailable);
                return Err(e);
            }
        };

        let ip = remote.ip();
        if connector.context().is_blocked(&ip) {
            debug!(
                "Peer policy of {} rejected connection {}, address is blocked",
                connector.transfer(),
                remote
            );
            Self::notify_blocked(connector, ip);
            connector.close_connection(connection, DisconnectReason::BannedByIpFilter);
            return Err(Error::BlockedPeer(ip));
        }

        let (multiple_per_ip, max_peerlist_size) = {
            let config = connector.context().config();
            (
                config.allow_multiple_connections_per_ip,
                config.max_peerlist_size,
            )
        };
        let handle = match self.peers.find(&remote, multiple_per_ip) {
            Ok(handle) => {
                let existing = self.peers.get(&handle).and_then(|e| e.connection());
                match existing {
                    Some(existing) if existing.handle() == connection.handle() => return Ok(handle),
                    Some(existing) => {
                        self.resolve_duplicate(handle, &existing, connection, connector)?
                    }
                    None => {}
                }
                handle
            }
            Err(position) => {
                if self.peers.len() >= max_peerlist_size {
                    debug!(
                        "Peer policy of {} rejected connection {}, peer list limit {} reached",
                        connector.transfer(),
                        remote,
                        max_peerlist_size
                    );
                    connector.close_connection(connection, DisconnectReason::TooManyConnections);
                    return Err(Error::TooManyConnections(max_peerlist_size));
                }

                let source = if connection.is_local() {
                    PeerSource::Manual
                } else {
                    PeerSource::Incoming
                };
                let peer = Peer::new(remote, source, connection.is_local());
                match self.peers.insert(position, peer) {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(
                            "Peer policy of {} failed to admit {}, {}",
                            connector.transfer(),
                            remote,
                            e
                        );
                        connector.close_connection(connection, DisconnectReason::NoError);
                        return Err(e);
                    }
                }
            }
        };

        self.set_connection(handle, connection);
        debug!(
            "Peer policy of {} bound connection {} to {} ({})",
            connector.transfer(),
            connection.handle(),
            handle,
            remote
        );
        Ok(handle)
    }

    /// Handle a closed connection by clearing the back-reference of its peer.
    /// The peer record itself is never removed.
    pub fn connection_closed(&mut self, connection: &dyn PeerConnection) {
        let connection_handle = connection.handle();
        let handle = connection
            .peer()
            .filter(|e| {
                self.peers
                    .get(e)
                    .and_then(|peer| peer.connection_handle())
                    == Some(connection_handle)
            })
            .or_else(|| self.peers.find_by_connection(&connection_handle));

        if let Some(handle) = handle {
            if let Some(peer) = self.peers.get_mut(&handle) {
                trace!("Peer {} ({}) lost connection {}", handle, peer.addr(), connection_handle);
                peer.clear_connection();
            }
        }

        connection.set_peer(None);
    }

    /// Disconnect all peers which are blocked by the current ip filter of the session.
    /// The peer records are kept.
    ///
    /// # Returns
    ///
    /// It returns the number of blocked peers.
    pub fn ip_filter_updated<C: PeerConnector>(&mut self, connector: &mut C) -> usize {
        let mut blocked = 0;

        for handle in self.peers.handles() {
            let (ip, connection) = match self.peers.get(&handle) {
                Some(peer) => (peer.ip(), peer.connection()),
                None => continue,
            };
            if !connector.context().is_blocked(&ip) {
                continue;
            }

            blocked += 1;
            Self::notify_blocked(connector, ip);
            if let Some(connection) = connection {
                debug!(
                    "Peer policy of {} is disconnecting {}, banned by ip filter",
                    connector.transfer(),
                    ip
                );
                self.close_peer_connection(&connection, DisconnectReason::BannedByIpFilter, connector);
            }
        }

        blocked
    }

    /// Bind the given connection to the given peer.
    pub fn set_connection(&mut self, handle: PeerHandle, connection: &ConnectionRef) {
        if let Some(peer) = self.peers.get_mut(&handle) {
            peer.set_connection(connection);
            connection.set_peer(Some(handle));
        }
    }

    /// Try to connect to the first connect candidate.
    ///
    /// # Returns
    ///
    /// It returns true when a connection attempt has been started.
    pub fn connect_one_peer<C: PeerConnector>(&mut self, connector: &mut C) -> bool {
        match self.find_connect_candidate(connector) {
            Some(handle) => self.connect_to_peer(handle, connector),
            None => false,
        }
    }

    /// Open a new outgoing connection towards the given peer.
    /// A peer which already has a connection is left untouched.
    ///
    /// # Returns
    ///
    /// It returns true when the peer now has a new connection.
    pub fn connect_to_peer<C: PeerConnector>(
        &mut self,
        handle: PeerHandle,
        connector: &mut C,
    ) -> bool {
        let addr = match self.peers.get(&handle) {
            Some(peer) if peer.has_connection() => {
                trace!("Peer {} ({}) is already connected", handle, peer.addr());
                return false;
            }
            Some(peer) => *peer.addr(),
            None => return false,
        };

        match connector.connect_to_peer(handle, addr) {
            Ok(connection) => {
                self.set_connection(handle, &connection);
                self.peers
                    .get(&handle)
                    .map(|e| e.has_connection())
                    .unwrap_or(false)
            }
            Err(e) => {
                debug!(
                    "Peer policy of {} failed to connect to {}, {}",
                    connector.transfer(),
                    addr,
                    e
                );
                false
            }
        }
    }

    /// Find the first peer which is a connect candidate.
    /// This is a linear scan from the start of the registry.
    pub fn find_connect_candidate<C: PeerConnector>(&self, connector: &C) -> Option<PeerHandle> {
        self.peers
            .iter()
            .find(|(_, peer)| self.is_connect_candidate(peer, connector))
            .map(|(handle, _)| handle)
    }

    /// Check if we should try to connect to the given peer.
    pub fn is_connect_candidate<C: PeerConnector>(&self, peer: &Peer, connector: &C) -> bool {
        let context = connector.context();
        if peer.has_connection()
            || peer.banned
            || !peer.connectable
            || peer.failcount >= context.config().max_failcount
            || (peer.seed && connector.is_finished())
        {
            return false;
        }

        context.connections().find(peer.addr()).is_none()
    }

    /// Register a failed connection attempt for the peer of the given connection.
    pub fn connect_failed(&mut self, connection: &dyn PeerConnection) {
        let handle = connection
            .peer()
            .or_else(|| self.peers.find_by_connection(&connection.handle()));

        if let Some(peer) = handle.and_then(|e| self.peers.get_mut(&e)) {
            peer.failcount = peer.failcount.saturating_add(1);
            trace!("Peer {} failcount is now {}", peer.addr(), peer.failcount);
        }
    }

    fn resolve_duplicate<C: PeerConnector>(
        &mut self,
        handle: PeerHandle,
        existing: &ConnectionRef,
        connection: &ConnectionRef,
        connector: &mut C,
    ) -> Result<()> {
        let (local, remote) = match (connection.local(), connection.remote()) {
            (Ok(local), Ok(remote)) => (local, remote),
            (Err(e), _) | (_, Err(e)) => {
                connector.close_connection(connection, DisconnectReason::EndpointUnavailable);
                return Err(e);
            }
        };

        let (existing_local, existing_remote) = match (existing.local(), existing.remote()) {
            (Ok(local), Ok(remote)) => (local, remote),
            _ => {
                debug!(
                    "Peer {} connection {} endpoints are unavailable, replacing it",
                    handle,
                    existing.handle()
                );
                self.close_peer_connection(existing, DisconnectReason::EndpointUnavailable, connector);
                return Ok(());
            }
        };

        if existing_remote == local || existing_local == remote {
            debug!(
                "Peer policy of {} detected a self connection on {}",
                connector.transfer(),
                remote
            );
            connector.close_connection(connection, DisconnectReason::SelfConnection);
            self.close_peer_connection(existing, DisconnectReason::SelfConnection, connector);
            return Err(Error::SelfConnection);
        }

        if !existing.is_connecting() {
            debug!(
                "Peer {} already has an established connection, rejecting {}",
                handle,
                connection.handle()
            );
            connector.close_connection(connection, DisconnectReason::DuplicatePeerId);
            return Err(Error::DuplicatePeerId);
        }

        debug!(
            "Peer {} replaces connecting connection {} with {}",
            handle,
            existing.handle(),
            connection.handle()
        );
        self.close_peer_connection(existing, DisconnectReason::DuplicatePeerId, connector);
        Ok(())
    }

    fn close_peer_connection<C: PeerConnector>(
        &mut self,
        connection: &ConnectionRef,
        reason: DisconnectReason,
        connector: &mut C,
    ) {
        connector.close_connection(connection, reason);
        self.connection_closed(connection.as_ref());
    }

    fn notify_blocked<C: PeerConnector>(connector: &C, addr: IpAddr) {
        connector.context().invoke_event(SessionEvent::PeerBlocked {
            transfer: connector.transfer(),
            addr,
        });
    }
}

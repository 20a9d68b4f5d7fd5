use crate::transfer::session_context::SessionCommand;
use crate::transfer::{
    ConnectionHandle, ConnectionRef, DisconnectReason, Error, Md4Hash, PeerConnector, PeerHandle,
    PeerPolicy, PeerSource, PieceIndex, PieceTracker, Result, SessionContext, SessionEvent,
    Storage,
};
use bitmask_enum::bitmask;
use derive_more::Display;
use fx_handle::Handle;
use itertools::Itertools;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The default size of a piece within an ED2K transfer.
pub const PIECE_SIZE: u64 = 9_728_000;

/// A unique handle identifier of a [Transfer].
pub type TransferHandle = Handle;

/// Flags which overlay the state of a [Transfer].
#[bitmask(u8)]
#[bitmask_config(vec_debug, flags_iter)]
pub enum TransferFlags {
    /// Indicates seed mode where all data is already present.
    SeedMode = 0b0001,
    /// The transfer is paused.
    Paused = 0b0010,
    /// The transfer is being removed.
    Aborted = 0b0100,
}

impl Default for TransferFlags {
    fn default() -> Self {
        TransferFlags::none()
    }
}

/// The lifecycle state of a [Transfer].
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum TransferState {
    #[display("initializing")]
    Initializing,
    #[display("downloading")]
    Downloading,
    #[display("finished")]
    Finished,
    #[display("seeding")]
    Seeding,
}

/// The verification result of a piece.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum PieceResult {
    /// The piece passed the hash check.
    #[display("passed")]
    Passed,
    /// The piece could not be written to the storage.
    #[display("disk failure")]
    DiskFailure,
    /// The piece failed the hash check.
    #[display("hash failure")]
    HashFailure,
}

/// The parameters of a new [Transfer].
#[derive(Debug, Clone, PartialEq)]
pub struct TransferParams {
    /// The content hash of the file
    pub file_hash: Md4Hash,
    /// The location of the file data
    pub file_path: PathBuf,
    /// The size of the file in bytes
    pub file_size: u64,
    /// Indicates if all data of the file is already present
    pub seed_mode: bool,
    /// Indicates if adding an already known transfer should fail
    pub duplicate_is_error: bool,
    /// The size of a single piece in bytes
    pub piece_size: u64,
}

impl TransferParams {
    pub fn builder() -> TransferParamsBuilder {
        TransferParamsBuilder::builder()
    }

    /// Get the number of pieces of the file.
    /// Parameters with an invalid piece size have no pieces.
    pub fn num_pieces(&self) -> usize {
        if self.piece_size == 0 {
            return 0;
        }

        self.file_size.div_ceil(self.piece_size) as usize
    }

    /// Verify that the parameters describe a valid transfer.
    pub fn validate(&self) -> Result<()> {
        if self.piece_size == 0 {
            return Err(Error::InvalidTransfer(
                "piece size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TransferParamsBuilder {
    file_hash: Option<Md4Hash>,
    file_path: Option<PathBuf>,
    file_size: Option<u64>,
    seed_mode: bool,
    duplicate_is_error: bool,
    piece_size: Option<u64>,
}

impl TransferParamsBuilder {
    pub fn builder() -> Self {
        Self::default()
    }

    /// Set the content hash of the file.
    pub fn file_hash(&mut self, hash: Md4Hash) -> &mut Self {
        self.file_hash = Some(hash);
        self
    }

    /// Set the location of the file data.
    pub fn file_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.file_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the size of the file in bytes.
    pub fn file_size(&mut self, size: u64) -> &mut Self {
        self.file_size = Some(size);
        self
    }

    pub fn seed_mode(&mut self, seed_mode: bool) -> &mut Self {
        self.seed_mode = seed_mode;
        self
    }

    pub fn duplicate_is_error(&mut self, duplicate_is_error: bool) -> &mut Self {
        self.duplicate_is_error = duplicate_is_error;
        self
    }

    /// Set the size of a piece, this defaults to [PIECE_SIZE].
    pub fn piece_size(&mut self, size: u64) -> &mut Self {
        self.piece_size = Some(size);
        self
    }

    /// Build the transfer parameters.
    ///
    /// # Returns
    ///
    /// It returns an error when the file hash is missing or the piece size is invalid.
    pub fn build(&mut self) -> Result<TransferParams> {
        let file_hash = self
            .file_hash
            .take()
            .ok_or(Error::InvalidTransfer("file hash is required".to_string()))?;
        let params = TransferParams {
            file_hash,
            file_path: self.file_path.take().unwrap_or_default(),
            file_size: self.file_size.take().unwrap_or(0),
            seed_mode: self.seed_mode,
            duplicate_is_error: self.duplicate_is_error,
            piece_size: self.piece_size.take().unwrap_or(PIECE_SIZE),
        };

        params.validate()?;
        Ok(params)
    }
}

/// A snapshot of the state of a [Transfer].
#[derive(Debug, Clone, PartialEq)]
pub struct TransferStatus {
    pub handle: TransferHandle,
    pub hash: Md4Hash,
    pub state: TransferState,
    pub paused: bool,
    pub num_pieces: usize,
    pub num_have: usize,
    /// The number of known peers
    pub num_peers: usize,
    /// The number of live connections of the transfer
    pub num_connections: usize,
    pub hash_failures: usize,
    pub disk_failures: usize,
}

/// A single file transfer which tracks its piece completion and drives the acquisition of peers.
///
/// A transfer is not thread-safe by itself, every operation is expected to be invoked
/// from the single logical thread which owns it, see [crate::transfer::Session].
#[derive(Debug, Display)]
#[display("{handle}")]
pub struct Transfer {
    handle: TransferHandle,
    params: TransferParams,
    state: TransferState,
    flags: TransferFlags,
    context: Arc<SessionContext>,
    policy: PeerPolicy,
    picker: Option<Box<dyn PieceTracker>>,
    storage: Option<Arc<dyn Storage>>,
    /// The transfer-local connection set
    connections: HashMap<ConnectionHandle, ConnectionRef>,
    release_pending: bool,
    hash_failures: usize,
    disk_failures: usize,
}

impl Transfer {
    /// Create a new transfer for the given parameters.
    /// The transfer needs to be started before it tracks any pieces.
    ///
    /// # Returns
    ///
    /// It returns [Error::InvalidTransfer] when the parameters are invalid.
    pub fn new(params: TransferParams, context: Arc<SessionContext>) -> Result<Self> {
        params.validate()?;
        let flags = if params.seed_mode {
            TransferFlags::SeedMode
        } else {
            TransferFlags::none()
        };

        Ok(Self {
            handle: TransferHandle::new(),
            params,
            state: TransferState::Initializing,
            flags,
            context,
            policy: PeerPolicy::new(),
            picker: None,
            storage: None,
            connections: Default::default(),
            release_pending: false,
            hash_failures: 0,
            disk_failures: 0,
        })
    }

    /// Get the unique handle of the transfer.
    pub fn handle(&self) -> TransferHandle {
        self.handle
    }

    /// Get the content hash of the transfer.
    pub fn hash(&self) -> &Md4Hash {
        &self.params.file_hash
    }

    pub fn params(&self) -> &TransferParams {
        &self.params
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn flags(&self) -> TransferFlags {
        self.flags
    }

    /// Get the peer policy of the transfer.
    pub fn policy(&self) -> &PeerPolicy {
        &self.policy
    }

    /// Get the piece tracker of the transfer, if it's still downloading.
    pub fn piece_tracker(&self) -> Option<&dyn PieceTracker> {
        self.picker.as_deref()
    }

    /// Get the mutable piece tracker of the transfer, if it's still downloading.
    pub fn piece_tracker_mut(&mut self) -> Option<&mut (dyn PieceTracker + 'static)> {
        self.picker.as_deref_mut()
    }

    /// Get the total number of pieces.
    pub fn num_pieces(&self) -> usize {
        self.params.num_pieces()
    }

    /// Get the number of owned pieces.
    pub fn num_have(&self) -> usize {
        match &self.picker {
            Some(picker) => picker.num_have(),
            None if self.state == TransferState::Initializing && !self.is_seed_mode() => 0,
            None => self.num_pieces(),
        }
    }

    /// Get the number of live connections of the transfer.
    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    /// Check if the transfer owns all of its pieces.
    pub fn is_seed(&self) -> bool {
        self.num_have() == self.num_pieces()
    }

    /// Check if all wanted pieces have been downloaded.
    /// All pieces of a transfer are wanted, which makes this the same as [Transfer::is_seed].
    pub fn is_finished(&self) -> bool {
        self.is_seed()
    }

    pub fn is_seed_mode(&self) -> bool {
        self.flags.contains(TransferFlags::SeedMode)
    }

    /// Check if the transfer, or the whole session, is paused.
    pub fn is_paused(&self) -> bool {
        self.flags.contains(TransferFlags::Paused) || self.context.is_paused()
    }

    pub fn is_aborted(&self) -> bool {
        self.flags.contains(TransferFlags::Aborted)
    }

    /// Check if a storage release is still in progress.
    pub fn has_pending_release(&self) -> bool {
        self.release_pending
    }

    /// Start the transfer.
    /// A transfer in seed mode starts seeding immediately without tracking any pieces.
    pub fn start(&mut self) -> Result<()> {
        if !self.is_seed_mode() {
            self.picker = Some(self.context.create_piece_tracker());
        }

        self.init()
    }

    fn init(&mut self) -> Result<()> {
        self.storage = Some(self.context.create_storage(&self.params)?);

        let num_pieces = self.num_pieces();
        match self.picker.as_mut() {
            Some(picker) => {
                picker.init(1, 1, num_pieces);
                self.state = TransferState::Downloading;
                if num_pieces == 0 {
                    self.completed();
                }
            }
            None => self.completed(),
        }

        info!(
            "Transfer {} ({}) started with {} pieces, {}",
            self, self.params.file_hash, num_pieces, self.state
        );
        Ok(())
    }

    /// Check if the transfer wants to connect to more peers.
    pub fn want_more_peers(&self) -> bool {
        !self.is_paused() && !self.is_aborted()
    }

    /// Add the given peer endpoint to the known peers of the transfer.
    pub fn add_peer(&mut self, addr: SocketAddr, source: PeerSource) -> Result<PeerHandle> {
        let finished = self.is_finished();
        let links = TransferLinks::new(self.handle, &self.context, &mut self.connections, finished);
        self.policy.add_peer(addr, source, &links)
    }

    /// Attach a new incoming connection to the transfer.
    /// The connection is registered in the transfer-local and session-wide connection sets,
    /// and validated by the peer policy.
    ///
    /// # Returns
    ///
    /// It returns the peer to which the connection has been bound, or the reason why it was rejected.
    /// A rejected connection has been disconnected.
    pub fn attach_connection(&mut self, connection: ConnectionRef) -> Result<PeerHandle> {
        if self.is_aborted() {
            connection.disconnect(DisconnectReason::StoppingTransfer);
            return Err(Error::InvalidHandle(self.handle));
        }
        if self.is_paused() {
            connection.disconnect(DisconnectReason::TransferPaused);
            return Err(Error::TransferPaused(self.handle));
        }

        self.connections
            .insert(connection.handle(), connection.clone());
        self.context.connections().insert(connection.clone());

        let finished = self.is_finished();
        let mut links =
            TransferLinks::new(self.handle, &self.context, &mut self.connections, finished);
        self.policy.new_connection(&connection, &mut links)
    }

    /// Open a new outgoing connection towards the given peer.
    ///
    /// # Returns
    ///
    /// It returns true when the peer's connection slot is now populated.
    pub fn connect_to_peer(&mut self, peer: PeerHandle) -> bool {
        let finished = self.is_finished();
        let mut links =
            TransferLinks::new(self.handle, &self.context, &mut self.connections, finished);
        self.policy.connect_to_peer(peer, &mut links)
    }

    /// Try to connect to the next connect candidate of the peer policy.
    pub fn try_connect_peer(&mut self) -> bool {
        let finished = self.is_finished();
        let mut links =
            TransferLinks::new(self.handle, &self.context, &mut self.connections, finished);
        self.policy.connect_one_peer(&mut links)
    }

    /// Disconnect all peers which are blocked by the ip filter of the session.
    pub fn ip_filter_updated(&mut self) -> usize {
        let finished = self.is_finished();
        let mut links =
            TransferLinks::new(self.handle, &self.context, &mut self.connections, finished);
        self.policy.ip_filter_updated(&mut links)
    }

    /// Handle a connection which has been closed by the transport.
    /// The connection is removed from the transfer-local and session-wide connection sets.
    pub fn connection_closed(&mut self, handle: &ConnectionHandle) {
        match self.connections.get(handle).cloned() {
            Some(connection) => self.unregister_connection(&connection),
            None => {
                self.context.connections().remove(handle);
            }
        }
    }

    /// Handle a failed or timed-out connection attempt.
    pub fn connect_failed(&mut self, handle: &ConnectionHandle, error: &Error) {
        if let Some(connection) = self.connections.get(handle).cloned() {
            debug!("Transfer {} connection {} failed, {}", self, handle, error);
            self.policy.connect_failed(connection.as_ref());
            let reason = match error {
                Error::ConnectTimeout(_) => DisconnectReason::ConnectTimeout,
                _ => DisconnectReason::ConnectFailed,
            };
            self.close_connection(&connection, reason);
        }
    }

    /// Disconnect the given connection and remove it from all connection sets.
    pub fn close_connection(&mut self, connection: &ConnectionRef, reason: DisconnectReason) {
        trace!(
            "Transfer {} is closing connection {}, {}",
            self,
            connection.handle(),
            reason
        );
        connection.disconnect(reason);
        self.unregister_connection(connection);
    }

    /// Process the verification result of the given piece.
    /// Results of pieces which are not finished anymore are ignored.
    pub fn piece_finished(&mut self, index: PieceIndex, result: PieceResult) {
        let is_finished = self
            .picker
            .as_ref()
            .map(|e| e.is_piece_finished(index))
            .unwrap_or(false);
        if !is_finished {
            trace!(
                "Transfer {} ignoring {} of piece {}, piece is not finished",
                self,
                result,
                index
            );
            return;
        }

        match result {
            PieceResult::Passed => self.piece_passed(index),
            PieceResult::HashFailure => self.piece_failed(index),
            PieceResult::DiskFailure => {
                if let Some(picker) = self.picker.as_mut() {
                    picker.restore_piece(index);
                }
                self.restore_piece_state(index);
            }
        }
    }

    /// Mark the given piece as owned.
    /// The transfer finishes when this was the last missing piece.
    pub fn piece_passed(&mut self, index: PieceIndex) {
        let was_finished = self.is_finished();
        self.we_have(index);

        if !was_finished && self.is_finished() {
            self.finished();
        }
    }

    fn we_have(&mut self, index: PieceIndex) {
        if let Some(picker) = self.picker.as_mut() {
            trace!("Transfer {} has piece {}", self.handle, index);
            picker.we_have(index);
        }
    }

    fn piece_failed(&mut self, index: PieceIndex) {
        self.hash_failures += 1;
        debug!("Transfer {} piece {} failed the hash check", self, index);
        if let Some(picker) = self.picker.as_mut() {
            picker.restore_piece(index);
        }
    }

    fn restore_piece_state(&mut self, index: PieceIndex) {
        self.disk_failures += 1;
        warn!(
            "Transfer {} piece {} failed to be written to the storage",
            self, index
        );
    }

    /// Invoked when all pieces of the transfer have been downloaded.
    fn finished(&mut self) {
        info!("Transfer {} has finished", self);
        self.state = TransferState::Finished;

        // the piece tracker should be cleared before any peer is disconnected
        if self.is_seed() {
            self.completed();
        }

        let upload_only = self
            .connections
            .values()
            .filter(|e| e.upload_only())
            .cloned()
            .collect_vec();
        for connection in upload_only {
            self.close_connection(&connection, DisconnectReason::TransferFinished);
        }

        self.context
            .invoke_event(SessionEvent::TransferFinished(self.handle));
        self.release_files();
    }

    /// Invoked when the transfer owns all pieces.
    fn completed(&mut self) {
        self.picker = None;
        self.state = TransferState::Seeding;
        debug!("Transfer {} is seeding", self);
    }

    fn release_files(&mut self) {
        let storage = match self.storage.clone() {
            Some(e) => e,
            None => return,
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(e) => e,
            Err(e) => {
                warn!("Transfer {} is unable to release files, {}", self, e);
                return;
            }
        };

        let transfer = self.handle;
        let sender = self.context.command_sender();
        self.release_pending = true;
        runtime.spawn(async move {
            let result = storage.release_files().await;
            if sender
                .send(SessionCommand::FilesReleased { transfer, result })
                .is_err()
            {
                trace!("Transfer {} files released after session closed", transfer);
            }
        });
    }

    /// Invoked when the storage has released its files.
    pub fn on_files_released(&mut self, result: Result<()>) {
        self.release_pending = false;
        match &result {
            Ok(_) => debug!("Transfer {} files have been released", self),
            Err(e) => warn!("Transfer {} failed to release files, {}", self, e),
        }

        self.context.invoke_event(SessionEvent::FilesReleased {
            transfer: self.handle,
            success: result.is_ok(),
        });
    }

    /// Execute the periodic maintenance of all connections.
    /// A connection which fails its tick is disconnected, the others are not affected.
    pub fn second_tick(&mut self) {
        let failed = self
            .connections
            .values()
            .filter(|connection| match connection.second_tick() {
                Ok(_) => false,
                Err(e) => {
                    debug!(
                        "Transfer {} connection {} tick failed, {}",
                        self.handle,
                        connection.handle(),
                        e
                    );
                    true
                }
            })
            .cloned()
            .collect_vec();

        for connection in failed {
            self.close_connection(&connection, DisconnectReason::NoError);
        }
    }

    /// Pause the transfer, all connections are disconnected.
    pub fn pause(&mut self) {
        if self.flags.contains(TransferFlags::Paused) {
            return;
        }

        self.flags |= TransferFlags::Paused;
        self.disconnect_all(DisconnectReason::TransferPaused);
        debug!("Transfer {} has been paused", self);
    }

    /// Disconnect all connections of the transfer as the session has been paused.
    /// The paused flag of the transfer itself is not changed.
    pub fn session_paused(&mut self) {
        self.disconnect_all(DisconnectReason::TransferPaused);
    }

    /// Resume the transfer.
    pub fn resume(&mut self) {
        self.flags &= !TransferFlags::Paused;
        debug!("Transfer {} has been resumed", self);
    }

    /// Abort the transfer, all connections are disconnected.
    pub fn abort(&mut self) {
        if self.is_aborted() {
            return;
        }

        self.flags |= TransferFlags::Aborted;
        self.disconnect_all(DisconnectReason::StoppingTransfer);
        debug!("Transfer {} has been aborted", self);
    }

    /// Get a snapshot of the state of the transfer.
    pub fn status(&self) -> TransferStatus {
        TransferStatus {
            handle: self.handle,
            hash: self.params.file_hash,
            state: self.state,
            paused: self.is_paused(),
            num_pieces: self.num_pieces(),
            num_have: self.num_have(),
            num_peers: self.policy.num_peers(),
            num_connections: self.connections.len(),
            hash_failures: self.hash_failures,
            disk_failures: self.disk_failures,
        }
    }

    fn disconnect_all(&mut self, reason: DisconnectReason) {
        let connections = self.connections.values().cloned().collect_vec();
        for connection in connections {
            self.close_connection(&connection, reason);
        }
    }

    fn unregister_connection(&mut self, connection: &ConnectionRef) {
        let handle = connection.handle();
        self.connections.remove(&handle);
        self.context.connections().remove(&handle);
        self.policy.connection_closed(connection.as_ref());
    }
}

/// The view on a transfer which is handed to its [PeerPolicy].
struct TransferLinks<'a> {
    transfer: TransferHandle,
    context: &'a SessionContext,
    connections: &'a mut HashMap<ConnectionHandle, ConnectionRef>,
    finished: bool,
}

impl<'a> TransferLinks<'a> {
    fn new(
        transfer: TransferHandle,
        context: &'a SessionContext,
        connections: &'a mut HashMap<ConnectionHandle, ConnectionRef>,
        finished: bool,
    ) -> Self {
        Self {
            transfer,
            context,
            connections,
            finished,
        }
    }

    fn remove(&mut self, connection: &ConnectionRef) {
        let handle = connection.handle();
        self.connections.remove(&handle);
        self.context.connections().remove(&handle);
    }
}

impl PeerConnector for TransferLinks<'_> {
    fn transfer(&self) -> TransferHandle {
        self.transfer
    }

    fn context(&self) -> &SessionContext {
        self.context
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn connect_to_peer(&mut self, peer: PeerHandle, addr: SocketAddr) -> Result<ConnectionRef> {
        let connection = self.context.create_connection(self.transfer, addr)?;

        self.connections
            .insert(connection.handle(), connection.clone());
        self.context.connections().insert(connection.clone());
        connection.set_peer(Some(peer));

        if let Err(e) = self
            .context
            .enqueue_connect(self.transfer, connection.clone())
        {
            debug!(
                "Transfer {} failed to enqueue connection to {}, {}",
                self.transfer, addr, e
            );
            self.remove(&connection);
            connection.set_peer(None);
            connection.disconnect(DisconnectReason::NoError);
            return Err(e);
        }

        trace!(
            "Transfer {} is connecting to {} ({})",
            self.transfer,
            addr,
            connection.handle()
        );
        Ok(connection)
    }

    fn close_connection(&mut self, connection: &ConnectionRef, reason: DisconnectReason) {
        connection.disconnect(reason);
        self.remove(connection);
    }
}

use crate::transfer::session_context::SessionCommand;
use crate::transfer::{
    ConnectionFactory, ConnectionHandle, ConnectionRef, DisconnectReason, Error, IpFilter,
    Md4Hash, PeerHandle, PeerSource, PiecePicker, PieceIndex, PieceResult,
    PieceTrackerFactory, Result, SessionConfig, SessionContext, SessionEvent, StorageFactory,
    Transfer, TransferHandle, TransferParams, TransferStatus,
};
use derive_more::Display;
use fx_callback::{Callback, Subscriber, Subscription};
use fx_handle::Handle;
use log::{debug, info, trace, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// The default piece tracker of a session.
const DEFAULT_PIECE_TRACKER: PieceTrackerFactory = || Box::new(PiecePicker::new());

/// A unique handle identifier of a [Session].
pub type SessionHandle = Handle;

/// The ED2K session which owns the transfers and drives their peer connections.
///
/// All transfer operations are serialized through the session, which makes it the single writer
/// of every transfer, its peer policy and its piece tracker.
#[derive(Debug, Display, Clone)]
#[display("{inner}")]
pub struct Session {
    inner: Arc<InnerSession>,
}

impl Session {
    /// Create a new session builder.
    /// The builder requires a connection factory and a storage factory to be set.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::builder()
    }

    /// Create a new session.
    /// This spawns the main loop of the session on the current tokio runtime.
    pub fn new(
        config: SessionConfig,
        connection_factory: Arc<dyn ConnectionFactory>,
        storage_factory: Arc<dyn StorageFactory>,
        piece_tracker_factory: PieceTrackerFactory,
    ) -> Self {
        let (context, command_receiver) = SessionContext::new(
            config,
            connection_factory,
            storage_factory,
            piece_tracker_factory,
        );
        let inner = Arc::new(InnerSession {
            handle: SessionHandle::new(),
            context: Arc::new(context),
            transfers: Default::default(),
            cancellation_token: Default::default(),
        });

        let main_inner = inner.clone();
        tokio::spawn(async move {
            main_inner.start(command_receiver).await;
        });

        debug!("Created new ed2k session {}", inner.handle);
        Self { inner }
    }

    /// Get the unique handle of the session.
    pub fn handle(&self) -> SessionHandle {
        self.inner.handle
    }

    /// Get the shared context of the session.
    pub fn context(&self) -> &SessionContext {
        &self.inner.context
    }

    /// Add a new transfer to the session.
    ///
    /// # Returns
    ///
    /// It returns the handle of the new transfer, or of the existing transfer with the same hash.
    /// It returns [Error::DuplicateTransfer] instead when the params require it.
    pub async fn add_transfer(&self, params: TransferParams) -> Result<TransferHandle> {
        self.inner.add_transfer(params).await
    }

    /// Remove the given transfer from the session.
    pub async fn remove_transfer(&self, handle: &TransferHandle) -> Result<()> {
        self.inner.remove_transfer(handle).await
    }

    /// Find the handle of the transfer for the given file hash.
    pub async fn find_transfer(&self, hash: &Md4Hash) -> Option<TransferHandle> {
        let transfers = self.inner.transfers.lock().await;
        transfers
            .active
            .iter()
            .find(|e| e.hash() == hash)
            .map(|e| e.handle())
    }

    /// Add the given peer endpoint to a transfer.
    pub async fn add_peer(
        &self,
        handle: &TransferHandle,
        addr: SocketAddr,
        source: PeerSource,
    ) -> Result<PeerHandle> {
        let mut transfers = self.inner.transfers.lock().await;
        let transfer = transfers.find_mut(handle)?;
        transfer.add_peer(addr, source)
    }

    /// Hand a new incoming connection to a transfer.
    /// A refused connection is disconnected.
    pub async fn incoming_connection(
        &self,
        handle: &TransferHandle,
        connection: ConnectionRef,
    ) -> Result<PeerHandle> {
        self.inner.incoming_connection(handle, connection).await
    }

    /// Notify the session that a connection of a transfer has been closed by the transport.
    pub async fn connection_closed(
        &self,
        handle: &TransferHandle,
        connection: &ConnectionHandle,
    ) -> Result<()> {
        let mut transfers = self.inner.transfers.lock().await;
        transfers.find_mut(handle)?.connection_closed(connection);
        Ok(())
    }

    /// Report the verification result of a piece of a transfer.
    pub async fn piece_finished(
        &self,
        handle: &TransferHandle,
        index: PieceIndex,
        result: PieceResult,
    ) -> Result<()> {
        let mut transfers = self.inner.transfers.lock().await;
        transfers.find_mut(handle)?.piece_finished(index, result);
        Ok(())
    }

    /// Mark all blocks of a piece of a transfer as written.
    pub async fn mark_finished(&self, handle: &TransferHandle, index: PieceIndex) -> Result<()> {
        let mut transfers = self.inner.transfers.lock().await;
        if let Some(picker) = transfers.find_mut(handle)?.piece_tracker_mut() {
            picker.mark_finished(index);
        }
        Ok(())
    }

    /// Replace the ip filter of the session.
    /// Peers of all transfers which are blocked by the new filter are disconnected.
    pub async fn set_ip_filter(&self, filter: IpFilter) {
        self.inner.context.set_ip_filter(filter);

        let mut transfers = self.inner.transfers.lock().await;
        for transfer in transfers.active.iter_mut() {
            let blocked = transfer.ip_filter_updated();
            if blocked > 0 {
                debug!("Transfer {} blocked {} peers", transfer, blocked);
            }
        }
    }

    /// Pause the whole session.
    /// All connections of all transfers are disconnected, the paused state of each transfer is kept.
    pub async fn pause(&self) {
        let mut transfers = self.inner.transfers.lock().await;
        self.inner.context.set_paused(true);
        for transfer in transfers.active.iter_mut() {
            transfer.session_paused();
        }
        info!("Session {} has been paused", self);
    }

    /// Resume the whole session.
    pub async fn resume(&self) {
        // serialized with pause
        let _transfers = self.inner.transfers.lock().await;
        self.inner.context.set_paused(false);
        info!("Session {} has been resumed", self);
    }

    /// Pause the given transfer, which disconnects all of its connections.
    pub async fn pause_transfer(&self, handle: &TransferHandle) -> Result<()> {
        let mut transfers = self.inner.transfers.lock().await;
        transfers.find_mut(handle)?.pause();
        Ok(())
    }

    /// Resume the given transfer.
    pub async fn resume_transfer(&self, handle: &TransferHandle) -> Result<()> {
        let mut transfers = self.inner.transfers.lock().await;
        transfers.find_mut(handle)?.resume();
        Ok(())
    }

    /// Get a status snapshot of the given transfer.
    pub async fn transfer_status(&self, handle: &TransferHandle) -> Result<TransferStatus> {
        let transfers = self.inner.transfers.lock().await;
        transfers
            .active
            .iter()
            .find(|e| e.handle() == *handle)
            .map(|e| e.status())
            .ok_or(Error::InvalidHandle(*handle))
    }

    /// Get the status snapshots of all transfers.
    pub async fn transfers(&self) -> Vec<TransferStatus> {
        let transfers = self.inner.transfers.lock().await;
        transfers.active.iter().map(|e| e.status()).collect()
    }

    /// Get the number of live connections across all transfers.
    pub fn num_connections(&self) -> usize {
        self.inner.context.connections().len()
    }

    /// Abort the session.
    /// All transfers are aborted and the main loop is stopped.
    pub async fn abort(&self) {
        self.inner.abort().await
    }
}

impl Callback<SessionEvent> for Session {
    fn subscribe(&self) -> Subscription<SessionEvent> {
        self.inner.context.subscribe()
    }

    fn subscribe_with(&self, subscriber: Subscriber<SessionEvent>) {
        self.inner.context.subscribe_with(subscriber)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // the main loop holds the other reference
        if Arc::strong_count(&self.inner) == 2 {
            self.inner.cancellation_token.cancel();
        }
    }
}

/// The builder for configuring a [Session].
///
/// # Required fields
///
/// - `connection_factory` - The factory of outgoing peer connections.
/// - `storage_factory` - The factory of the transfer storages.
#[derive(Debug, Default)]
pub struct SessionBuilder {
    config: Option<SessionConfig>,
    connection_factory: Option<Arc<dyn ConnectionFactory>>,
    storage_factory: Option<Arc<dyn StorageFactory>>,
    piece_tracker_factory: Option<PieceTrackerFactory>,
}

impl SessionBuilder {
    pub fn builder() -> Self {
        Self::default()
    }

    /// Set the settings of the session.
    pub fn config(&mut self, config: SessionConfig) -> &mut Self {
        self.config = Some(config);
        self
    }

    /// Set the factory which creates the outgoing peer connections.
    pub fn connection_factory(&mut self, factory: Arc<dyn ConnectionFactory>) -> &mut Self {
        self.connection_factory = Some(factory);
        self
    }

    /// Set the factory which creates the storage of each transfer.
    pub fn storage_factory(&mut self, factory: Arc<dyn StorageFactory>) -> &mut Self {
        self.storage_factory = Some(factory);
        self
    }

    /// Set the factory which creates the piece tracker of each downloading transfer.
    pub fn piece_tracker_factory(&mut self, factory: PieceTrackerFactory) -> &mut Self {
        self.piece_tracker_factory = Some(factory);
        self
    }

    /// Create a new session from this builder.
    ///
    /// # Returns
    ///
    /// It returns an error when one of the required fields is not set.
    pub fn build(&mut self) -> Result<Session> {
        let connection_factory = self
            .connection_factory
            .take()
            .ok_or(Error::InvalidSession(
                "connection factory is required".to_string(),
            ))?;
        let storage_factory = self.storage_factory.take().ok_or(Error::InvalidSession(
            "storage factory is required".to_string(),
        ))?;
        let config = self.config.take().unwrap_or_default();
        let piece_tracker_factory = self
            .piece_tracker_factory
            .take()
            .unwrap_or(DEFAULT_PIECE_TRACKER);

        Ok(Session::new(
            config,
            connection_factory,
            storage_factory,
            piece_tracker_factory,
        ))
    }
}

#[derive(Debug, Default)]
struct Transfers {
    /// The active transfers in insertion order
    active: Vec<Transfer>,
    /// The removed transfers which are awaiting their storage release
    releasing: Vec<Transfer>,
    /// The round-robin cursor of the peer connect loop
    cursor: usize,
}

impl Transfers {
    fn find_mut(&mut self, handle: &TransferHandle) -> Result<&mut Transfer> {
        self.active
            .iter_mut()
            .find(|e| e.handle() == *handle)
            .ok_or(Error::InvalidHandle(*handle))
    }
}

#[derive(Debug, Display)]
#[display("{handle}")]
struct InnerSession {
    handle: SessionHandle,
    context: Arc<SessionContext>,
    transfers: Mutex<Transfers>,
    cancellation_token: CancellationToken,
}

impl InnerSession {
    /// Start the main loop of the session.
    async fn start(&self, mut command_receiver: UnboundedReceiver<SessionCommand>) {
        let tick_interval = self.context.config().tick_interval;
        let mut interval = time::interval_at(time::Instant::now() + tick_interval, tick_interval);

        loop {
            select! {
                _ = self.cancellation_token.cancelled() => break,
                Some(command) = command_receiver.recv() => self.handle_command(command).await,
                _ = interval.tick() => self.tick().await,
            }
        }

        debug!("Session {} main loop ended", self);
    }

    async fn handle_command(&self, command: SessionCommand) {
        trace!("Session {} is handling command {:?}", self, command);
        let mut transfers = self.transfers.lock().await;

        match command {
            SessionCommand::ConnectFailed {
                transfer,
                connection,
                error,
            } => match transfers.find_mut(&transfer) {
                Ok(transfer) => transfer.connect_failed(&connection, &error),
                Err(_) => {
                    self.context.connections().remove(&connection);
                }
            },
            SessionCommand::FilesReleased { transfer, result } => {
                if let Ok(e) = transfers.find_mut(&transfer) {
                    e.on_files_released(result);
                    return;
                }

                match transfers
                    .releasing
                    .iter()
                    .position(|e| e.handle() == transfer)
                {
                    Some(position) => {
                        let mut transfer = transfers.releasing.remove(position);
                        transfer.on_files_released(result);
                    }
                    None => warn!(
                        "Session {} received file release of unknown transfer {}",
                        self, transfer
                    ),
                }
            }
        }
    }

    async fn add_transfer(&self, params: TransferParams) -> Result<TransferHandle> {
        if self.context.is_closing() {
            return Err(Error::SessionClosing);
        }

        let mut transfers = self.transfers.lock().await;
        if let Some(transfer) = transfers
            .active
            .iter()
            .find(|e| *e.hash() == params.file_hash)
        {
            if params.duplicate_is_error {
                return Err(Error::DuplicateTransfer(params.file_hash));
            }

            debug!(
                "Session {} already contains transfer {} for {}",
                self, transfer, params.file_hash
            );
            return Ok(transfer.handle());
        }

        let mut transfer = Transfer::new(params, self.context.clone())?;
        transfer.start()?;

        let handle = transfer.handle();
        info!(
            "Session {} added transfer {} ({})",
            self,
            handle,
            transfer.hash()
        );
        transfers.active.push(transfer);
        self.context.invoke_event(SessionEvent::TransferAdded(handle));
        Ok(handle)
    }

    async fn remove_transfer(&self, handle: &TransferHandle) -> Result<()> {
        let mut transfers = self.transfers.lock().await;
        let position = transfers
            .active
            .iter()
            .position(|e| e.handle() == *handle)
            .ok_or(Error::InvalidHandle(*handle))?;

        let mut transfer = transfers.active.remove(position);
        transfer.abort();
        let hash = *transfer.hash();
        if transfer.has_pending_release() {
            trace!(
                "Session {} is parking transfer {} until its files are released",
                self,
                transfer
            );
            transfers.releasing.push(transfer);
        }

        info!("Session {} removed transfer {} ({})", self, handle, hash);
        self.context.invoke_event(SessionEvent::TransferRemoved(hash));
        Ok(())
    }

    async fn incoming_connection(
        &self,
        handle: &TransferHandle,
        connection: ConnectionRef,
    ) -> Result<PeerHandle> {
        let mut transfers = self.transfers.lock().await;
        let transfer = match transfers.find_mut(handle) {
            Ok(e) => e,
            Err(e) => {
                connection.disconnect(DisconnectReason::StoppingTransfer);
                return Err(e);
            }
        };

        let limit = self.context.config().connections_limit;
        if self.context.connections().len() >= limit {
            debug!(
                "Session {} refused connection {}, connection limit {} reached",
                self,
                connection.handle(),
                limit
            );
            connection.disconnect(DisconnectReason::TooManyConnections);
            return Err(Error::TooManyConnections(limit));
        }

        transfer.attach_connection(connection)
    }

    /// Execute the periodic maintenance of all transfers.
    async fn tick(&self) {
        let mut transfers = self.transfers.lock().await;
        for transfer in transfers.active.iter_mut() {
            transfer.second_tick();
        }

        if !self.context.is_closing() {
            self.connect_new_peers(&mut transfers);
        }
    }

    /// Hand out new connection attempts to the transfers in a round-robin order.
    fn connect_new_peers(&self, transfers: &mut Transfers) {
        let config = self.context.config();
        let total = transfers.active.len();
        if total == 0 {
            return;
        }

        let mut max_connections = config.max_connections_per_second;
        let mut steps_since_last_connect = 0;
        loop {
            if max_connections == 0
                || self.context.connect_queue().free_slots() == 0
                || self.context.connections().len() >= config.connections_limit
            {
                break;
            }

            let index = transfers.cursor % total;
            let transfer = &mut transfers.active[index];
            if transfer.want_more_peers() && transfer.try_connect_peer() {
                max_connections -= 1;
                steps_since_last_connect = 0;
            }

            transfers.cursor = (index + 1) % total;
            steps_since_last_connect += 1;
            if steps_since_last_connect > total * 2 {
                break;
            }
        }

        trace!(
            "Session {} handed out {} connection attempts",
            self,
            config.max_connections_per_second - max_connections
        );
    }

    async fn abort(&self) {
        self.context.set_closing();

        {
            let mut transfers = self.transfers.lock().await;
            for transfer in transfers.active.iter_mut() {
                transfer.abort();
            }
        }

        self.cancellation_token.cancel();
        info!("Session {} has been aborted", self);
    }
}

use crate::transfer::{
    ConnectionFactory, ConnectionHandle, ConnectionRef, Error, IpFilter, Md4Hash, PieceTracker,
    PieceTrackerFactory, Result, SessionConfig, Storage, StorageFactory, TransferHandle,
    TransferParams,
};
use derive_more::Display;
use fx_callback::{Callback, MultiThreadedCallback, Subscriber, Subscription};
use log::{debug, trace};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::time;

/// The events which are emitted by a session and its transfers.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum SessionEvent {
    /// Invoked when a peer address has been rejected or disconnected by the ip filter
    #[display("peer {addr} of {transfer} has been blocked")]
    PeerBlocked {
        transfer: TransferHandle,
        addr: IpAddr,
    },
    /// Invoked when a transfer owns all of its pieces
    #[display("transfer {_0} has finished")]
    TransferFinished(TransferHandle),
    /// Invoked when a new transfer has been added to the session
    #[display("transfer {_0} has been added")]
    TransferAdded(TransferHandle),
    /// Invoked when a transfer has been removed from the session
    #[display("transfer {_0} has been removed")]
    TransferRemoved(Md4Hash),
    /// Invoked when the storage of a transfer has released its files
    #[display("files of {transfer} have been released")]
    FilesReleased {
        transfer: TransferHandle,
        success: bool,
    },
}

/// The commands which re-enter the session main loop from asynchronous operations.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionCommand {
    /// The connection attempt of a transfer failed or timed out
    ConnectFailed {
        transfer: TransferHandle,
        connection: ConnectionHandle,
        error: Error,
    },
    /// The storage release of a transfer has completed
    FilesReleased {
        transfer: TransferHandle,
        result: Result<()>,
    },
}

/// The session-wide set of connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionHandle, ConnectionRef>>,
}

impl ConnectionRegistry {
    /// Register the given connection.
    pub fn insert(&self, connection: ConnectionRef) {
        self.lock().insert(connection.handle(), connection);
    }

    /// Remove the given connection from the registry.
    pub fn remove(&self, handle: &ConnectionHandle) -> Option<ConnectionRef> {
        self.lock().remove(handle)
    }

    pub fn contains(&self, handle: &ConnectionHandle) -> bool {
        self.lock().contains_key(handle)
    }

    /// Find the connection of which the remote endpoint matches the given address.
    pub fn find(&self, addr: &SocketAddr) -> Option<ConnectionRef> {
        self.lock()
            .values()
            .find(|e| e.remote().ok().as_ref() == Some(addr))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionHandle, ConnectionRef>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The half-open connection queue which bounds the number of simultaneous connection attempts.
#[derive(Debug)]
pub struct ConnectQueue {
    permits: Arc<Semaphore>,
}

impl ConnectQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Get the number of connection attempts which can still be started.
    pub fn free_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Start a connection attempt which is bounded by the given timeout.
    ///
    /// The connection receives [crate::transfer::PeerConnection::on_connect] when the attempt completes,
    /// or [crate::transfer::PeerConnection::on_timeout] when it didn't complete in time.
    /// A failed attempt is reported back through the given command sender.
    ///
    /// # Returns
    ///
    /// It returns [Error::ConnectEnqueueFailed] when no slot is available or no runtime is present.
    pub(crate) fn enqueue(
        &self,
        transfer: TransferHandle,
        connection: ConnectionRef,
        timeout: Duration,
        sender: UnboundedSender<SessionCommand>,
    ) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::ConnectEnqueueFailed(e.to_string()))?;
        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|e| Error::ConnectEnqueueFailed(e.to_string()))?;

        runtime.spawn(async move {
            let _permit = permit;
            let handle = connection.handle();
            let error = match time::timeout(timeout, connection.connect()).await {
                Ok(result) => {
                    connection.on_connect(result.clone());
                    result.err()
                }
                Err(_) => {
                    connection.on_timeout();
                    Some(Error::ConnectTimeout(timeout))
                }
            };

            if let Some(error) = error {
                debug!("Connection {} of {} failed, {}", handle, transfer, error);
                let _ = sender.send(SessionCommand::ConnectFailed {
                    transfer,
                    connection: handle,
                    error,
                });
            }
        });
        Ok(())
    }

    /// Close the queue, no new connection attempts will be accepted.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// The shared collaborators of a session which are used by all of its transfers.
#[derive(Debug)]
pub struct SessionContext {
    config: SessionConfig,
    ip_filter: RwLock<IpFilter>,
    connections: ConnectionRegistry,
    connect_queue: ConnectQueue,
    connection_factory: Arc<dyn ConnectionFactory>,
    storage_factory: Arc<dyn StorageFactory>,
    piece_tracker_factory: PieceTrackerFactory,
    callbacks: MultiThreadedCallback<SessionEvent>,
    paused: AtomicBool,
    closing: AtomicBool,
    command_sender: UnboundedSender<SessionCommand>,
}

impl SessionContext {
    pub(crate) fn new(
        config: SessionConfig,
        connection_factory: Arc<dyn ConnectionFactory>,
        storage_factory: Arc<dyn StorageFactory>,
        piece_tracker_factory: PieceTrackerFactory,
    ) -> (Self, UnboundedReceiver<SessionCommand>) {
        let (command_sender, command_receiver) = unbounded_channel();
        let connect_queue = ConnectQueue::new(config.half_open_limit);

        (
            Self {
                config,
                ip_filter: Default::default(),
                connections: Default::default(),
                connect_queue,
                connection_factory,
                storage_factory,
                piece_tracker_factory,
                callbacks: MultiThreadedCallback::new(),
                paused: Default::default(),
                closing: Default::default(),
                command_sender,
            },
            command_receiver,
        )
    }

    /// Get the session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get the session-wide connection registry.
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Get the half-open connection queue.
    pub fn connect_queue(&self) -> &ConnectQueue {
        &self.connect_queue
    }

    /// Check if the given address is blocked by the ip filter.
    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.ip_filter
            .read()
            .map(|e| e.blocked(ip))
            .unwrap_or_else(|e| e.into_inner().blocked(ip))
    }

    /// Replace the ip filter of the session.
    pub fn set_ip_filter(&self, filter: IpFilter) {
        match self.ip_filter.write() {
            Ok(mut e) => *e = filter,
            Err(e) => *e.into_inner() = filter,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    /// Check if the session is being aborted.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::Relaxed);
        self.connect_queue.close();
    }

    /// Create a new outgoing connection for the given transfer.
    pub fn create_connection(
        &self,
        transfer: TransferHandle,
        addr: SocketAddr,
    ) -> Result<ConnectionRef> {
        self.connection_factory.create(transfer, addr)
    }

    /// Start the connection attempt of the given connection, bounded by the configured timeout.
    pub fn enqueue_connect(
        &self,
        transfer: TransferHandle,
        connection: ConnectionRef,
    ) -> Result<()> {
        self.connect_queue.enqueue(
            transfer,
            connection,
            self.config.peer_connect_timeout,
            self.command_sender.clone(),
        )
    }

    /// Create the storage of a transfer.
    pub fn create_storage(&self, params: &TransferParams) -> Result<Arc<dyn Storage>> {
        self.storage_factory.create(params)
    }

    /// Create a new piece tracker.
    pub fn create_piece_tracker(&self) -> Box<dyn PieceTracker> {
        (self.piece_tracker_factory)()
    }

    /// Get the sender of the session main loop commands.
    pub(crate) fn command_sender(&self) -> UnboundedSender<SessionCommand> {
        self.command_sender.clone()
    }

    /// Notify all subscribers about the given event.
    pub fn invoke_event(&self, event: SessionEvent) {
        trace!("Session is invoking event {}", event);
        self.callbacks.invoke(event);
    }
}

impl Callback<SessionEvent> for SessionContext {
    fn subscribe(&self) -> Subscription<SessionEvent> {
        self.callbacks.subscribe()
    }

    fn subscribe_with(&self, subscriber: Subscriber<SessionEvent>) {
        self.callbacks.subscribe_with(subscriber)
    }
}

use crate::transfer::session_context::SessionCommand;
use crate::transfer::{
    ConnectionFactory, ConnectionHandle, ConnectionRef, DisconnectReason, Error, PeerConnection,
    PeerHandle, PiecePicker, PieceTracker, PieceTrackerFactory, Result, SessionConfig,
    SessionContext, Storage, StorageFactory, TransferHandle, TransferParams,
};
use async_trait::async_trait;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Config;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::UnboundedReceiver;

static INIT: Once = Once::new();

/// Initializes the logger with the specified log level, or trace when omitted.
#[macro_export]
macro_rules! init_logger {
    ($level:expr) => {
        $crate::testing::init_logger_level($level)
    };
    () => {
        $crate::testing::init_logger_level(log::LevelFilter::Trace)
    };
}

/// Receive a message from the given receiver, or panic if the timeout is reached.
#[macro_export]
macro_rules! recv_timeout {
    ($receiver:expr, $timeout:expr) => {
        $crate::testing::recv_timeout($receiver, $timeout, "expected to receive an instance").await
    };
    ($receiver:expr, $timeout:expr, $message:expr) => {
        $crate::testing::recv_timeout($receiver, $timeout, $message).await
    };
}

/// Initializes the logger with the specified log level.
pub fn init_logger_level(level: LevelFilter) {
    INIT.call_once(|| {
        log4rs::init_config(Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(ConsoleAppender::builder()
                .encoder(Box::new(PatternEncoder::new("\x1B[37m{d(%Y-%m-%d %H:%M:%S%.3f)}\x1B[0m {h({l:>5.5})} \x1B[35m{I:>6.6}\x1B[0m \x1B[37m---\x1B[0m \x1B[37m[{T:>15.15}]\x1B[0m \x1B[36m{t:<60.60}\x1B[0m \x1B[37m:\x1B[0m {m}{n}")))
                .build())))
            .logger(Logger::builder().build("fx_callback", LevelFilter::Info))
            .logger(Logger::builder().build("mio", LevelFilter::Info))
            .logger(Logger::builder().build("tokio", LevelFilter::Info))
            .build(Root::builder().appender("stdout").build(level))
            .unwrap())
            .unwrap();
    })
}

/// Receive a message from the given receiver, or panic if the timeout is reached.
pub async fn recv_timeout<T>(
    receiver: &mut UnboundedReceiver<T>,
    timeout: Duration,
    message: &str,
) -> T {
    select! {
        _ = tokio::time::sleep(timeout) => panic!("receiver timed-out after {}ms, {}", timeout.as_millis(), message),
        result = receiver.recv() => result.expect(message)
    }
}

/// Parse the given socket address.
pub fn addr(value: &str) -> SocketAddr {
    value.parse().expect("expected a valid socket address")
}

/// Create a new session context for testing purposes.
/// The command receiver of the context is discarded.
pub fn new_test_context(config: SessionConfig) -> Arc<SessionContext> {
    let (context, _) = new_test_context_with(
        config,
        Arc::new(TestConnectionFactory::default()),
        default_piece_tracker,
    );
    context
}

/// Create a new session context with the given collaborators for testing purposes.
pub fn new_test_context_with(
    config: SessionConfig,
    connection_factory: Arc<TestConnectionFactory>,
    piece_tracker_factory: PieceTrackerFactory,
) -> (Arc<SessionContext>, UnboundedReceiver<SessionCommand>) {
    let (context, receiver) = SessionContext::new(
        config,
        connection_factory,
        Arc::new(TestStorageFactory::default()),
        piece_tracker_factory,
    );
    (Arc::new(context), receiver)
}

fn default_piece_tracker() -> Box<dyn PieceTracker> {
    Box::new(PiecePicker::new())
}

#[derive(Debug, Default)]
struct TestConnectionState {
    connecting: bool,
    outgoing: bool,
    upload_only: bool,
    peer: Option<PeerHandle>,
    disconnect_reason: Option<DisconnectReason>,
    tick_error: bool,
    ticks: usize,
    connect_delay: Option<Duration>,
    connect_error: Option<Error>,
    connect_result: Option<Result<()>>,
    timed_out: bool,
    local_unavailable: bool,
    remote_unavailable: bool,
}

/// A stateful in-memory peer connection.
#[derive(Debug)]
pub struct TestConnection {
    handle: ConnectionHandle,
    remote: SocketAddr,
    local: SocketAddr,
    state: Mutex<TestConnectionState>,
}

impl TestConnection {
    pub fn new(remote: SocketAddr, local: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            handle: ConnectionHandle::new(),
            remote,
            local,
            state: Mutex::new(TestConnectionState::default()),
        })
    }

    pub fn set_connecting(&self, connecting: bool) {
        self.state.lock().unwrap().connecting = connecting;
    }

    pub fn set_outgoing(&self, outgoing: bool) {
        self.state.lock().unwrap().outgoing = outgoing;
    }

    pub fn set_upload_only(&self, upload_only: bool) {
        self.state.lock().unwrap().upload_only = upload_only;
    }

    pub fn fail_second_tick(&self) {
        self.state.lock().unwrap().tick_error = true;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().unwrap().connect_delay = Some(delay);
    }

    pub fn set_connect_error(&self, error: Error) {
        self.state.lock().unwrap().connect_error = Some(error);
    }

    /// Make the local endpoint of the connection unavailable.
    pub fn fail_local_endpoint(&self) {
        self.state.lock().unwrap().local_unavailable = true;
    }

    /// Make both endpoints of the connection unavailable.
    pub fn fail_endpoints(&self) {
        let mut state = self.state.lock().unwrap();
        state.local_unavailable = true;
        state.remote_unavailable = true;
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.state.lock().unwrap().disconnect_reason
    }

    pub fn ticks(&self) -> usize {
        self.state.lock().unwrap().ticks
    }

    pub fn connect_result(&self) -> Option<Result<()>> {
        self.state.lock().unwrap().connect_result.clone()
    }

    pub fn timed_out(&self) -> bool {
        self.state.lock().unwrap().timed_out
    }
}

#[async_trait]
impl PeerConnection for TestConnection {
    fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    fn remote(&self) -> Result<SocketAddr> {
        if self.state.lock().unwrap().remote_unavailable {
            return Err(Error::Endpoint("transport endpoint is not connected".to_string()));
        }
        Ok(self.remote)
    }

    fn local(&self) -> Result<SocketAddr> {
        if self.state.lock().unwrap().local_unavailable {
            return Err(Error::Endpoint("transport endpoint is not connected".to_string()));
        }
        Ok(self.local)
    }

    fn is_connecting(&self) -> bool {
        self.state.lock().unwrap().connecting
    }

    fn is_local(&self) -> bool {
        self.state.lock().unwrap().outgoing
    }

    fn upload_only(&self) -> bool {
        self.state.lock().unwrap().upload_only
    }

    fn peer(&self) -> Option<PeerHandle> {
        self.state.lock().unwrap().peer
    }

    fn set_peer(&self, peer: Option<PeerHandle>) {
        self.state.lock().unwrap().peer = peer;
    }

    fn second_tick(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ticks += 1;
        if state.tick_error {
            return Err(Error::Io("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn disconnect(&self, reason: DisconnectReason) {
        let mut state = self.state.lock().unwrap();
        state.disconnect_reason = Some(reason);
        state.connecting = false;
    }

    async fn connect(&self) -> Result<()> {
        let (delay, error) = {
            let state = self.state.lock().unwrap();
            (state.connect_delay, state.connect_error.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn on_connect(&self, result: Result<()>) {
        let mut state = self.state.lock().unwrap();
        state.connecting = false;
        state.connect_result = Some(result);
    }

    fn on_timeout(&self) {
        self.state.lock().unwrap().timed_out = true;
    }
}

/// Creates outgoing [TestConnection] instances.
#[derive(Debug)]
pub struct TestConnectionFactory {
    local: SocketAddr,
    connect_delay: Option<Duration>,
    created: Mutex<Vec<Arc<TestConnection>>>,
}

impl TestConnectionFactory {
    pub fn new(connect_delay: Option<Duration>) -> Self {
        Self {
            local: addr("192.168.0.100:50000"),
            connect_delay,
            created: Default::default(),
        }
    }

    /// Get the connections which have been created by this factory.
    pub fn created(&self) -> Vec<Arc<TestConnection>> {
        self.created.lock().unwrap().clone()
    }
}

impl Default for TestConnectionFactory {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ConnectionFactory for TestConnectionFactory {
    fn create(&self, _: TransferHandle, addr: SocketAddr) -> Result<ConnectionRef> {
        let connection = TestConnection::new(addr, self.local);
        connection.set_outgoing(true);
        connection.set_connecting(true);
        if let Some(delay) = self.connect_delay {
            connection.set_connect_delay(delay);
        }

        self.created.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

/// An in-memory storage which counts the number of releases.
#[derive(Debug, Default)]
pub struct TestStorage {
    releases: AtomicUsize,
}

impl TestStorage {
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Storage for TestStorage {
    async fn release_files(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Creates [TestStorage] instances.
#[derive(Debug, Default)]
pub struct TestStorageFactory {
    created: Mutex<Vec<Arc<TestStorage>>>,
}

impl TestStorageFactory {
    pub fn created(&self) -> Vec<Arc<TestStorage>> {
        self.created.lock().unwrap().clone()
    }
}

impl StorageFactory for TestStorageFactory {
    fn create(&self, _: &TransferParams) -> Result<Arc<dyn Storage>> {
        let storage = Arc::new(TestStorage::default());
        self.created.lock().unwrap().push(storage.clone());
        Ok(storage)
    }
}

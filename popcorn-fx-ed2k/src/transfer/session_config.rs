use std::time::Duration;

pub(crate) const DEFAULT_PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(6);
pub(crate) const DEFAULT_MAX_PEERLIST_SIZE: usize = 4000;
pub(crate) const DEFAULT_CONNECTIONS_LIMIT: usize = 200;
pub(crate) const DEFAULT_HALF_OPEN_LIMIT: usize = 8;
pub(crate) const DEFAULT_MAX_FAILCOUNT: u8 = 3;
pub(crate) const DEFAULT_MAX_CONNECTIONS_PER_SECOND: usize = 10;
pub(crate) const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// The settings of a session which are shared by all of its transfers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// The max time a connection attempt is allowed to take.
    pub peer_connect_timeout: Duration,
    /// The max number of peer records a single transfer keeps.
    pub max_peerlist_size: usize,
    /// Indicates if a transfer accepts multiple peers on the same ip address.
    pub allow_multiple_connections_per_ip: bool,
    /// The max number of live connections within the session.
    pub connections_limit: usize,
    /// The max number of connection attempts in progress at the same time.
    pub half_open_limit: usize,
    /// The number of failed connection attempts after which a peer is no longer a connect candidate.
    pub max_failcount: u8,
    /// The max number of connection attempts handed out during a single tick.
    pub max_connections_per_second: usize,
    /// The interval at which the session ticks its transfers.
    pub tick_interval: Duration,
}

impl SessionConfig {
    /// Create a new session configuration builder.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::builder()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    peer_connect_timeout: Option<Duration>,
    max_peerlist_size: Option<usize>,
    allow_multiple_connections_per_ip: Option<bool>,
    connections_limit: Option<usize>,
    half_open_limit: Option<usize>,
    max_failcount: Option<u8>,
    max_connections_per_second: Option<usize>,
    tick_interval: Option<Duration>,
}

impl SessionConfigBuilder {
    /// Create a new session configuration builder.
    pub fn builder() -> Self {
        Self::default()
    }

    /// Set the timeout of peer connection attempts.
    pub fn peer_connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.peer_connect_timeout = Some(timeout);
        self
    }

    /// Set the max number of peers a transfer keeps track of.
    pub fn max_peerlist_size(&mut self, size: usize) -> &mut Self {
        self.max_peerlist_size = Some(size);
        self
    }

    /// Set if multiple peers on the same ip address are allowed.
    pub fn allow_multiple_connections_per_ip(&mut self, allow: bool) -> &mut Self {
        self.allow_multiple_connections_per_ip = Some(allow);
        self
    }

    /// Set the max number of live connections of the session.
    pub fn connections_limit(&mut self, limit: usize) -> &mut Self {
        self.connections_limit = Some(limit);
        self
    }

    /// Set the max number of simultaneous connection attempts.
    pub fn half_open_limit(&mut self, limit: usize) -> &mut Self {
        self.half_open_limit = Some(limit);
        self
    }

    pub fn max_failcount(&mut self, count: u8) -> &mut Self {
        self.max_failcount = Some(count);
        self
    }

    pub fn max_connections_per_second(&mut self, limit: usize) -> &mut Self {
        self.max_connections_per_second = Some(limit);
        self
    }

    /// Set the interval of the session tick.
    pub fn tick_interval(&mut self, interval: Duration) -> &mut Self {
        self.tick_interval = Some(interval);
        self
    }

    /// Build the session configuration.
    pub fn build(&mut self) -> SessionConfig {
        SessionConfig {
            peer_connect_timeout: self
                .peer_connect_timeout
                .take()
                .unwrap_or(DEFAULT_PEER_CONNECT_TIMEOUT),
            max_peerlist_size: self
                .max_peerlist_size
                .take()
                .unwrap_or(DEFAULT_MAX_PEERLIST_SIZE),
            allow_multiple_connections_per_ip: self
                .allow_multiple_connections_per_ip
                .take()
                .unwrap_or(false),
            connections_limit: self
                .connections_limit
                .take()
                .unwrap_or(DEFAULT_CONNECTIONS_LIMIT),
            half_open_limit: self
                .half_open_limit
                .take()
                .unwrap_or(DEFAULT_HALF_OPEN_LIMIT),
            max_failcount: self.max_failcount.take().unwrap_or(DEFAULT_MAX_FAILCOUNT),
            max_connections_per_second: self
                .max_connections_per_second
                .take()
                .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_SECOND),
            tick_interval: self.tick_interval.take().unwrap_or(DEFAULT_TICK_INTERVAL),
        }
    }
}

// MIT License - Copyright (c) 2026 Peter Wright
// Connection configuration

use std::time::Duration;

use crate::constants::*;

/// Output dimming resolution negotiated with `!OM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimMode {
    /// 0-100 percent in 50 hardware steps
    Steps50,
    /// 0-200 native half-percent steps
    Steps200,
}

/// Status reporting style negotiated with `!OM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    /// Outputs report percent values (`A` status lines)
    Percent,
    /// Outputs report native values (`O` status lines)
    Native,
}

/// Configuration for a connection to an LCN-PCHK gateway.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Gateway host name or IP address
    pub host: String,
    /// Gateway TCP port (default: 4114)
    pub port: u16,
    /// Login user name
    pub username: String,
    /// Login password
    pub password: String,
    /// Retries of a correlated exchange after its first transmission
    pub num_retries: u32,
    /// Deadline of each transmission of a correlated exchange
    pub request_timeout: Duration,
    /// Deadline of each serial-number request
    pub serial_timeout: Duration,
    /// Overall deadline for TCP connect and login
    pub connect_timeout: Duration,
    /// Idle window after which a heartbeat probe is sent
    pub heartbeat_interval: Duration,
    /// Silence after a probe that marks the socket as dead
    pub heartbeat_probe_timeout: Duration,
    /// Periodic segment coupler rescan, disabled when `None`
    pub segment_scan_interval: Option<Duration>,
    /// Broadcasts per segment coupler scan
    pub segment_scan_tries: u32,
    /// Reply window per scan broadcast, extended on every reply
    pub segment_scan_timeout: Duration,
    /// Correlator sweep cadence
    pub sweep_interval: Duration,
    /// Longest line accepted in either direction, terminator excluded
    pub max_line_length: usize,
    pub dim_mode: DimMode,
    pub status_mode: StatusMode,
    /// Capacity of the event broadcast channels
    pub event_capacity: usize,
    /// Base delay for exponential backoff in `connect_with_retry`
    pub reconnect_delay: Duration,
    /// Connection attempts after the first in `connect_with_retry` (0 = no retries)
    pub max_connect_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            username: "lcn".to_string(),
            password: "lcn".to_string(),
            num_retries: DEFAULT_NUM_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            serial_timeout: DEFAULT_SERIAL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_probe_timeout: DEFAULT_HEARTBEAT_PROBE_TIMEOUT,
            segment_scan_interval: None,
            segment_scan_tries: DEFAULT_SEGMENT_SCAN_TRIES,
            segment_scan_timeout: DEFAULT_SEGMENT_SCAN_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            dim_mode: DimMode::Steps50,
            status_mode: StatusMode::Native,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            reconnect_delay: Duration::from_secs(10),
            max_connect_retries: 3,
        }
    }
}

impl ConnectionConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    pub(crate) fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for ConnectionConfig.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.config.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    pub fn num_retries(mut self, retries: u32) -> Self {
        self.config.num_retries = retries;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn serial_timeout(mut self, timeout: Duration) -> Self {
        self.config.serial_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn heartbeat_probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_probe_timeout = timeout;
        self
    }

    pub fn segment_scan_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.segment_scan_interval = interval;
        self
    }

    pub fn segment_scan_tries(mut self, tries: u32) -> Self {
        self.config.segment_scan_tries = tries;
        self
    }

    pub fn segment_scan_timeout(mut self, timeout: Duration) -> Self {
        self.config.segment_scan_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn max_line_length(mut self, len: usize) -> Self {
        self.config.max_line_length = len;
        self
    }

    pub fn dim_mode(mut self, mode: DimMode) -> Self {
        self.config.dim_mode = mode;
        self
    }

    pub fn status_mode(mut self, mode: StatusMode) -> Self {
        self.config.status_mode = mode;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn max_connect_retries(mut self, retries: u32) -> Self {
        self.config.max_connect_retries = retries;
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

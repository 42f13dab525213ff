//! Client configuration.

use std::time::Duration;

use crate::parser::{DEFAULT_MAX_COMMAND_LEN, DEFAULT_MAX_FRAME_SIZE, DecodeLimits};

/// Default outgoing/incoming heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_MS: u64 = 1000;

/// Local heartbeat settings advertised in CONNECT.
///
/// `cx` is how often this client promises to send heartbeats and is also
/// the period of the heartbeat task; `cy` is how often it would like to
/// receive them. Both are in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub cx: u64,
    pub cy: u64,
}

impl HeartbeatConfig {
    pub fn new(cx: u64, cy: u64) -> Self {
        Self {
            enabled: true,
            cx,
            cy,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            cx: 0,
            cy: 0,
        }
    }

    /// The `heart-beat` header value, e.g. `"1000,1000"`.
    pub fn header_value(&self) -> String {
        format!("{},{}", self.cx, self.cy)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_MS, DEFAULT_HEARTBEAT_MS)
    }
}

/// Settings for a [`StompClient`](crate::StompClient).
///
/// Built with chained setters:
///
/// ```ignore
/// let config = ClientConfig::new("127.0.0.1:61613")
///     .login("guest")
///     .passcode("guest")
///     .max_reconnect_attempts(5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Broker address (`host:port`) used by the default TCP connector
    pub address: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// Virtual host sent as the `host` header, if any
    pub host: Option<String>,
    pub heartbeat: HeartbeatConfig,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    /// Pause between failed connect attempts. Zero retries immediately.
    pub reconnect_delay: Duration,
    /// Largest inbound body accepted
    pub max_frame_size: usize,
}

impl ClientConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            login: None,
            passcode: None,
            host: None,
            heartbeat: HeartbeatConfig::default(),
            max_reconnect_attempts: None,
            reconnect_delay: Duration::ZERO,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn login(mut self, login: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self
    }

    pub fn passcode(mut self, passcode: impl Into<String>) -> Self {
        self.passcode = Some(passcode.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub(crate) fn decode_limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
            max_frame_size: self.max_frame_size,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:61613")
    }
}

// Connection-level parameters shared by the server and client ends.

use std::time::Duration;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 32 * 1024;

/// Minimum number of ping intervals that must fit inside the ping timeout.
pub const MIN_PINGS_PER_TIMEOUT: u32 = 2;

/// Timeouts and limits for one relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Deadline for writing one frame.
    pub write_timeout: Duration,
    /// Cadence of liveness probes sent by the server.
    pub ping_interval: Duration,
    /// Read silence after which a connection is considered dead.
    pub ping_timeout: Duration,
    /// How long a client waits for the response to one request.
    pub response_timeout: Duration,
    /// Largest accepted message, in bytes.
    pub max_message_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_INTERVAL * 3,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl ConnectionConfig {
    /// Set the ping interval and derive the ping timeout as three intervals.
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = interval * 3;
        self
    }

    /// True when at least two probes are sent per timeout window.
    pub fn has_valid_ping_window(&self) -> bool {
        !self.ping_interval.is_zero()
            && self.ping_timeout >= self.ping_interval * MIN_PINGS_PER_TIMEOUT
    }

    /// Replace an unusable ping timeout with three ping intervals.
    pub fn normalized(mut self) -> Self {
        if !self.has_valid_ping_window() {
            if self.ping_interval.is_zero() {
                self.ping_interval = DEFAULT_PING_INTERVAL;
            }
            self.ping_timeout = self.ping_interval * 3;
        }
        self
    }
}

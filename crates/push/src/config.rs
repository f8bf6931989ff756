// Push engine tuning.

use std::time::Duration;

pub const DEFAULT_COMMAND_BUFFER: usize = 200;
pub const DEFAULT_PAYLOAD_BUFFER: usize = 200;
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfig {
    /// Capacity of every actor command queue.
    pub command_buffer: usize,
    /// Capacity of session outboxes and topic payload queues.
    pub payload_buffer: usize,
    /// How often empty topics are reclaimed.
    pub cleanup_interval: Duration,
    pub broker: BrokerConfig,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            command_buffer: DEFAULT_COMMAND_BUFFER,
            payload_buffer: DEFAULT_PAYLOAD_BUFFER,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            broker: BrokerConfig::default(),
        }
    }
}

/// Two independent switches.
///
/// `enabled` sends every publish to the external transport and re-injects
/// inbound messages for `subjects`. `local_fanout` delivers publishes to
/// local topic workers directly. With the broker disabled, delivery is
/// always local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub local_fanout: bool,
    /// Payload kinds to receive from the broker at startup.
    pub subjects: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, local_fanout: true, subjects: Vec::new() }
    }
}

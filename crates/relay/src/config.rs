// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Connection timing and push engine tuning live in their own
// crates; this module only maps environment variables onto them.

use std::net::SocketAddr;
use std::time::Duration;

use courier_common::config::ConnectionConfig;
use courier_push::{BrokerConfig, PushConfig};
use tracing::warn;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `courier_relay=debug`).
    pub log_filter: String,
    /// Emit logs as JSON lines.
    pub log_json: bool,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    pub connection: ConnectionConfig,
    pub push: PushConfig,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `COURIER_RELAY_HOST` | `0.0.0.0` |
    /// | `COURIER_RELAY_PORT` | `8080` |
    /// | `COURIER_RELAY_LOG_FILTER` | `info` |
    /// | `COURIER_RELAY_LOG_JSON` | `false` |
    /// | `COURIER_RELAY_CORS_ORIGINS` | *(none, mirror request origin)* |
    /// | `COURIER_RELAY_WRITE_TIMEOUT_MS` | `10000` |
    /// | `COURIER_RELAY_PING_INTERVAL_MS` | `20000` |
    /// | `COURIER_RELAY_PING_TIMEOUT_MS` | `3 × ping interval` |
    /// | `COURIER_RELAY_MAX_MESSAGE_BYTES` | `32768` |
    /// | `COURIER_RELAY_COMMAND_BUFFER` | `200` |
    /// | `COURIER_RELAY_PAYLOAD_BUFFER` | `200` |
    /// | `COURIER_RELAY_TOPIC_CLEANUP_SECS` | `86400` |
    /// | `COURIER_RELAY_BROKER_DISABLED` | `false` |
    /// | `COURIER_RELAY_LOCAL_FANOUT` | `true` |
    /// | `COURIER_RELAY_BROKER_SUBJECTS` | *(none)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("COURIER_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "COURIER_RELAY_PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = env("COURIER_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = parse_or(&env, "COURIER_RELAY_LOG_JSON", false);
        let cors_origins = env("COURIER_RELAY_CORS_ORIGINS").ok();

        let defaults = ConnectionConfig::default();
        let ping_interval = Duration::from_millis(parse_or(
            &env,
            "COURIER_RELAY_PING_INTERVAL_MS",
            millis(defaults.ping_interval),
        ))
        .max(Duration::from_millis(1));
        let mut connection = ConnectionConfig {
            write_timeout: Duration::from_millis(parse_or(
                &env,
                "COURIER_RELAY_WRITE_TIMEOUT_MS",
                millis(defaults.write_timeout),
            )),
            max_message_bytes: parse_or(
                &env,
                "COURIER_RELAY_MAX_MESSAGE_BYTES",
                defaults.max_message_bytes,
            ),
            ..defaults
        }
        .with_ping_interval(ping_interval);
        if let Some(timeout) = parse(&env, "COURIER_RELAY_PING_TIMEOUT_MS") {
            connection.ping_timeout = Duration::from_millis(timeout);
        }

        let push_defaults = PushConfig::default();
        let push = PushConfig {
            command_buffer: parse_or(
                &env,
                "COURIER_RELAY_COMMAND_BUFFER",
                push_defaults.command_buffer,
            ),
            payload_buffer: parse_or(
                &env,
                "COURIER_RELAY_PAYLOAD_BUFFER",
                push_defaults.payload_buffer,
            ),
            cleanup_interval: Duration::from_secs(parse_or(
                &env,
                "COURIER_RELAY_TOPIC_CLEANUP_SECS",
                push_defaults.cleanup_interval.as_secs(),
            )),
            broker: BrokerConfig {
                enabled: !parse_or(&env, "COURIER_RELAY_BROKER_DISABLED", false),
                local_fanout: parse_or(&env, "COURIER_RELAY_LOCAL_FANOUT", true),
                subjects: env("COURIER_RELAY_BROKER_SUBJECTS")
                    .map(|raw| split_list(&raw))
                    .unwrap_or_default(),
            },
        };

        Self { listen_addr, log_filter, log_json, cors_origins, connection, push }
    }

    /// Clamp settings that would break the liveness contract. Call once
    /// logging is up so the adjustment is visible.
    pub fn validate(&mut self) {
        if !self.connection.has_valid_ping_window() {
            warn!(
                ping_interval_ms = millis(self.connection.ping_interval),
                ping_timeout_ms = millis(self.connection.ping_timeout),
                "ping timeout shorter than two intervals, using three intervals"
            );
            self.connection = self.connection.normalized();
        }
    }
}

fn parse<F, T>(env: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    parse(env, key).unwrap_or(default)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(ToOwned::to_owned).collect()
}

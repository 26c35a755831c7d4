//! Server configuration.
//!
//! Loaded from environment variables (a `.env` file is honoured) with
//! defaults suitable for local development.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://retroboard.db?mode=rwc";
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Time allowed to read the next pong from the peer.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);
/// Time allowed to write one message to the peer.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_SEND_QUEUE: usize = 256;
pub const DEFAULT_HUB_QUEUE: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Per-connection transport limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_message_bytes: usize,
    pub send_queue: usize,
}

impl ConnectionLimits {
    /// Heartbeat period; always shorter than the read deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            pong_wait: DEFAULT_PONG_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            send_queue: DEFAULT_SEND_QUEUE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub cookie_secure: bool,
    pub session_idle_minutes: i64,
    pub hub_queue: usize,
    pub limits: ConnectionLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_owned(),
            bind_address: DEFAULT_BIND_ADDRESS.to_owned(),
            cookie_secure: true,
            session_idle_minutes: 60,
            hub_queue: DEFAULT_HUB_QUEUE,
            limits: ConnectionLimits::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let limits = ConnectionLimits {
            pong_wait: parse(vars, "WS_PONG_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.limits.pong_wait),
            write_wait: parse(vars, "WS_WRITE_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.limits.write_wait),
            max_message_bytes: parse(vars, "WS_MAX_MESSAGE_BYTES")?
                .unwrap_or(defaults.limits.max_message_bytes),
            send_queue: parse(vars, "WS_SEND_QUEUE")?.unwrap_or(defaults.limits.send_queue),
        };

        if limits.pong_wait.is_zero() {
            return Err(invalid(vars, "WS_PONG_WAIT_SECS"));
        }
        if limits.send_queue == 0 {
            return Err(invalid(vars, "WS_SEND_QUEUE"));
        }

        let hub_queue = parse(vars, "HUB_QUEUE")?.unwrap_or(defaults.hub_queue);
        if hub_queue == 0 {
            return Err(invalid(vars, "HUB_QUEUE"));
        }

        Ok(Self {
            database_url: vars.get("DATABASE_URL").cloned().unwrap_or(defaults.database_url),
            bind_address: vars.get("BIND_ADDRESS").cloned().unwrap_or(defaults.bind_address),
            cookie_secure: parse(vars, "COOKIE_SECURE")?.unwrap_or(defaults.cookie_secure),
            session_idle_minutes: parse(vars, "SESSION_IDLE_MINUTES")?
                .unwrap_or(defaults.session_idle_minutes),
            hub_queue,
            limits,
        })
    }
}

fn parse<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    vars.get(name)
        .map(|value| value.trim().parse().map_err(|_| invalid(vars, name)))
        .transpose()
}

fn invalid(vars: &HashMap<String, String>, name: &'static str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: vars.get(name).cloned().unwrap_or_default(),
    }
}

//! Server configuration
//!
//! Defaults suit a local chat server; each tunable can be overridden
//! through a `CHAT_*` environment variable.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Default per-client mailbox capacity
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Path that accepts the WebSocket upgrade
pub const DEFAULT_UPGRADE_PATH: &str = "/ws";

/// Runtime settings shared by every connection
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listener bind address
    pub addr: String,
    /// Outbound messages buffered per client before new ones are dropped
    pub mailbox_capacity: usize,
    /// Line-protocol read deadline, renewed on every line
    pub idle_timeout: Duration,
    /// Deadline for receiving a complete HTTP request head
    pub handshake_timeout: Duration,
    /// How long a closed mailbox may take to flush on disconnect
    pub drain_grace: Duration,
    /// Largest accepted inbound frame payload
    pub max_frame_len: usize,
    /// Longest accepted line on the line protocol
    pub max_line_len: usize,
    /// Request path that upgrades to the framed protocol
    pub upgrade_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            idle_timeout: Duration::from_secs(30 * 60),
            handshake_timeout: Duration::from_secs(10),
            drain_grace: Duration::from_secs(5),
            max_frame_len: 1 << 20,
            max_line_len: 4096,
            upgrade_path: DEFAULT_UPGRADE_PATH.to_string(),
        }
    }
}

impl ServerConfig {
    /// Build a config from defaults plus `CHAT_*` environment overrides
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config reading overrides through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAT_ADDR") {
            config.addr = addr;
        }
        if let Some(cap) = parse_var::<usize>(&lookup, "CHAT_MAILBOX_CAPACITY")? {
            config.mailbox_capacity = cap;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHAT_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CHAT_HANDSHAKE_TIMEOUT_SECS")? {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(len) = parse_var::<usize>(&lookup, "CHAT_MAX_FRAME_LEN")? {
            config.max_frame_len = len;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if self.mailbox_capacity == 0 {
            return Err(AppError::Config("mailbox capacity must be at least 1".into()));
        }
        if self.idle_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(AppError::Config("timeouts must be non-zero".into()));
        }
        if !self.upgrade_path.starts_with('/') {
            return Err(AppError::Config(format!(
                "upgrade path must start with '/': {}",
                self.upgrade_path
            )));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{key}: invalid value '{raw}'"))),
        None => Ok(None),
    }
}

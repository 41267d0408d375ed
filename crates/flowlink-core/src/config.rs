use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FlowlinkError, Result};

/// Top-level flowlink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub requests: RequestConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Transport settings for the backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket endpoint of the execution backend.
    pub url: String,
    /// Interval between keepalive pings in seconds. Default: 30
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Fixed delay before each reconnection attempt. Default: 3000
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Deadline applied when a request does not specify one. Default: 30
    #[serde(default = "default_request_timeout")]
    pub default_timeout_secs: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Capacity of the engine event bus. Slow subscribers lag past this.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_keepalive_interval() -> u64 { 30 }
fn default_reconnect_delay() -> u64 { 3000 }
fn default_request_timeout() -> u64 { 30 }
fn default_event_capacity() -> usize { 256 }
fn default_log_filter() -> String { "flowlink=info,warn".to_string() }

impl AppConfig {
    /// Config with defaults for everything but the endpoint.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig {
                url: url.into(),
                keepalive_interval_secs: default_keepalive_interval(),
                reconnect_delay_ms: default_reconnect_delay(),
            },
            requests: RequestConfig::default(),
            events: EventsConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowlinkError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn parse(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowlinkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.connection.url.trim().is_empty() {
            return Err(FlowlinkError::Config("connection.url must not be empty".into()));
        }
        if self.connection.keepalive_interval_secs == 0 {
            return Err(FlowlinkError::Config(
                "connection.keepalive_interval_secs must be positive".into(),
            ));
        }
        if self.connection.reconnect_delay_ms == 0 {
            return Err(FlowlinkError::Config(
                "connection.reconnect_delay_ms must be positive".into(),
            ));
        }
        if self.requests.default_timeout_secs == 0 {
            return Err(FlowlinkError::Config(
                "requests.default_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

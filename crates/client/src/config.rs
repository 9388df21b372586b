//! Client configuration.
//!
//! Everything has a default; `from_env` overrides from `CHAT_*` variables.

use std::time::Duration;

use crate::backoff::ReconnectPolicy;

/// Default HTTP API base. The websocket base is derived from it.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api/";

/// Messages requested per history fetch.
pub const DEFAULT_HISTORY_LIMIT: u32 = 30;

/// Handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// HTTP API base, e.g. `https://example.com/api/`
    pub api_base_url: String,
    pub history_limit: u32,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ChatConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// Create config from environment variables.
    ///
    /// Unset variables fall back to defaults; set but unparsable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let policy = defaults.reconnect;

        let api_base_url = lookup("CHAT_API_BASE_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.api_base_url);

        let history_limit =
            parse_var(&lookup, "CHAT_HISTORY_LIMIT")?.unwrap_or(defaults.history_limit);
        let connect_timeout = parse_var::<u64, _>(&lookup, "CHAT_CONNECT_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.connect_timeout);

        let reconnect = ReconnectPolicy {
            base_delay_ms: parse_var(&lookup, "CHAT_RECONNECT_BASE_MS")?
                .unwrap_or(policy.base_delay_ms),
            multiplier: parse_var(&lookup, "CHAT_RECONNECT_FACTOR")?.unwrap_or(policy.multiplier),
            max_delay_ms: parse_var(&lookup, "CHAT_RECONNECT_MAX_MS")?
                .unwrap_or(policy.max_delay_ms),
            max_attempts: parse_var(&lookup, "CHAT_RECONNECT_MAX_ATTEMPTS")?
                .unwrap_or(policy.max_attempts),
        };

        if reconnect.multiplier.is_nan() || reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                name: "CHAT_RECONNECT_FACTOR",
                value: reconnect.multiplier.to_string(),
            });
        }

        Ok(Self {
            api_base_url,
            history_limit,
            connect_timeout,
            reconnect,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
        })
}

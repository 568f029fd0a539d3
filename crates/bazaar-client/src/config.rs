//! HTTP client configuration loaded from environment variables.

use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL of the marketplace REST API.
    /// Env: `API_BASE_URL`
    /// Default: `http://localhost:8080/api`
    pub api_base_url: String,

    /// Timeout for a single request.
    /// Env: `REQUEST_TIMEOUT_SECS`
    /// Default: 15 s
    pub request_timeout: Duration,

    /// Interval between polls of the room and presence feeds.
    /// Env: `FEED_POLL_INTERVAL_MS`
    /// Default: 2000 ms
    pub feed_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".to_string(),
            request_timeout: Duration::from_secs(15),
            feed_poll_interval: Duration::from_millis(2_000),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("API_BASE_URL") {
            let url = url.trim().trim_end_matches('/');
            if url.starts_with("http://") || url.starts_with("https://") {
                config.api_base_url = url.to_string();
            } else {
                tracing::warn!(value = %url, "Invalid API_BASE_URL, using default");
            }
        }

        if let Some(val) = lookup("REQUEST_TIMEOUT_SECS") {
            match val.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.request_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid REQUEST_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("FEED_POLL_INTERVAL_MS") {
            match val.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.feed_poll_interval = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid FEED_POLL_INTERVAL_MS, using default"),
            }
        }

        config
    }
}

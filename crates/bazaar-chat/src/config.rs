//! Chat engine configuration loaded from environment variables.
//!
//! Every setting has a default, so the engine starts with zero
//! configuration. Invalid values are logged and ignored.

use std::str::FromStr;
use std::time::Duration;

use bazaar_shared::constants::{
    DEFAULT_AFFORDANCE_DEBOUNCE_MS, DEFAULT_MARK_SEEN_DEBOUNCE_MS, DEFAULT_PRESENCE_DEBOUNCE_MS,
    DEFAULT_PROFILE_MAX_ATTEMPTS, DEFAULT_PROFILE_RETRY_BACKOFF_MS,
    DEFAULT_SCROLL_AWAY_THRESHOLD_PX, DEFAULT_SCROLL_BOTTOM_THRESHOLD_PX,
    DEFAULT_SEARCH_DEBOUNCE_MS, MAX_IMAGE_SIZE,
};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// Quiet period before a presence flag is published.
    /// Env: `PRESENCE_DEBOUNCE_MS`
    /// Default: 1000 ms
    pub presence_debounce: Duration,

    /// Quiet period before mark-as-seen runs after focus changes.
    /// Env: `MARK_SEEN_DEBOUNCE_MS`
    /// Default: 300 ms
    pub mark_seen_debounce: Duration,

    /// Delay before the "new message" affordance is shown.
    /// Env: `AFFORDANCE_DEBOUNCE_MS`
    /// Default: 150 ms
    pub affordance_debounce: Duration,

    /// Quiet period before a search query is applied.
    /// Env: `SEARCH_DEBOUNCE_MS`
    /// Default: 250 ms
    pub search_debounce: Duration,

    /// Upper bound on profile lookups per user, first attempt included.
    /// Env: `PROFILE_MAX_ATTEMPTS`
    /// Default: 10
    pub profile_max_attempts: u32,

    /// Delay after the first failed profile lookup. Doubles per attempt.
    /// Env: `PROFILE_RETRY_BACKOFF_MS`
    /// Default: 200 ms
    pub profile_retry_backoff: Duration,

    /// Distance from bottom beyond which the user counts as scrolled away.
    /// Env: `SCROLL_AWAY_THRESHOLD_PX`
    /// Default: 20
    pub scroll_away_threshold: f64,

    /// Distance from bottom at or below which the list is back at bottom.
    /// Env: `SCROLL_BOTTOM_THRESHOLD_PX`
    /// Default: 5
    pub scroll_bottom_threshold: f64,

    /// Largest image accepted for upload, in bytes.
    /// Env: `MAX_IMAGE_BYTES`
    /// Default: 10 MiB
    pub max_image_bytes: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            presence_debounce: Duration::from_millis(DEFAULT_PRESENCE_DEBOUNCE_MS),
            mark_seen_debounce: Duration::from_millis(DEFAULT_MARK_SEEN_DEBOUNCE_MS),
            affordance_debounce: Duration::from_millis(DEFAULT_AFFORDANCE_DEBOUNCE_MS),
            search_debounce: Duration::from_millis(DEFAULT_SEARCH_DEBOUNCE_MS),
            profile_max_attempts: DEFAULT_PROFILE_MAX_ATTEMPTS,
            profile_retry_backoff: Duration::from_millis(DEFAULT_PROFILE_RETRY_BACKOFF_MS),
            scroll_away_threshold: DEFAULT_SCROLL_AWAY_THRESHOLD_PX,
            scroll_bottom_threshold: DEFAULT_SCROLL_BOTTOM_THRESHOLD_PX,
            max_image_bytes: MAX_IMAGE_SIZE,
        }
    }
}

impl ChatConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, "PRESENCE_DEBOUNCE_MS") {
            config.presence_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "MARK_SEEN_DEBOUNCE_MS") {
            config.mark_seen_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "AFFORDANCE_DEBOUNCE_MS") {
            config.affordance_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "SEARCH_DEBOUNCE_MS") {
            config.search_debounce = Duration::from_millis(ms);
        }

        match parse::<u32>(&lookup, "PROFILE_MAX_ATTEMPTS") {
            Some(0) => tracing::warn!("PROFILE_MAX_ATTEMPTS must be at least 1, using default"),
            Some(n) => config.profile_max_attempts = n,
            None => {}
        }
        if let Some(ms) = parse::<u64>(&lookup, "PROFILE_RETRY_BACKOFF_MS") {
            config.profile_retry_backoff = Duration::from_millis(ms);
        }

        if let Some(px) = parse::<f64>(&lookup, "SCROLL_AWAY_THRESHOLD_PX") {
            config.scroll_away_threshold = px;
        }
        if let Some(px) = parse::<f64>(&lookup, "SCROLL_BOTTOM_THRESHOLD_PX") {
            config.scroll_bottom_threshold = px;
        }
        if config.scroll_bottom_threshold > config.scroll_away_threshold {
            tracing::warn!(
                away = config.scroll_away_threshold,
                bottom = config.scroll_bottom_threshold,
                "Scroll thresholds inverted, using defaults"
            );
            config.scroll_away_threshold = DEFAULT_SCROLL_AWAY_THRESHOLD_PX;
            config.scroll_bottom_threshold = DEFAULT_SCROLL_BOTTOM_THRESHOLD_PX;
        }

        if let Some(bytes) = parse::<u64>(&lookup, "MAX_IMAGE_BYTES") {
            config.max_image_bytes = bytes;
        }

        config
    }

    /// Retry policy for profile lookups.
    pub fn profile_retry(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.profile_max_attempts)
            .with_initial_backoff(self.profile_retry_backoff)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

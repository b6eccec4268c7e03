use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use log::{info, warn};

use crate::feed::{ClientSettings, ReconnectPolicy};
use crate::volume::RefresherSettings;

// Upstream endpoints
pub const DEFAULT_FEED_URL: &str = "ws://127.0.0.1:9001/feed";
pub const DEFAULT_VOLUME_API_URL: &str = "http://127.0.0.1:8000/api/volume";

// Refresher
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 10;
pub const DEFAULT_REFRESH_CONCURRENCY: usize = 4;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 3;
// A TTL longer than this many refresh intervals serves stale volume.
pub const MAX_TTL_INTERVAL_MULTIPLE: u64 = 6;

// Feed client
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SUBSCRIBE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 15_000;
pub const DEFAULT_DISPATCH_QUEUE_SIZE: usize = 256;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

// Status API
pub const DEFAULT_API_BIND_ADDRESS: &str = "127.0.0.1:3000";

#[derive(Debug, Clone)]
pub struct Config {
    pub feed_url: String,
    pub volume_api_url: String,
    pub watch_codes: Vec<String>,
    pub refresh_interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub refresh_concurrency: usize,
    pub fetch_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub subscribe_timeout_secs: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub dispatch_queue_size: usize,
    pub shutdown_grace_ms: u64,
    pub api_bind_address: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            volume_api_url: DEFAULT_VOLUME_API_URL.to_string(),
            watch_codes: Vec::new(),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            refresh_concurrency: DEFAULT_REFRESH_CONCURRENCY,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            subscribe_timeout_secs: DEFAULT_SUBSCRIBE_TIMEOUT_SECS,
            reconnect_max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            dispatch_queue_size: DEFAULT_DISPATCH_QUEUE_SIZE,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            api_bind_address: DEFAULT_API_BIND_ADDRESS.to_string(),
            log_level: "info".to_string(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has unparsable value {:?}, using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

/// Splits a comma/whitespace separated code list, keeping first occurrences.
pub fn parse_codes(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|c| !c.is_empty() && seen.insert(*c))
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            feed_url: env::var("FEED_URL").unwrap_or(defaults.feed_url),
            volume_api_url: env::var("VOLUME_API_URL").unwrap_or(defaults.volume_api_url),
            watch_codes: env::var("WATCH_CODES")
                .map(|raw| parse_codes(&raw))
                .unwrap_or_default(),
            refresh_interval_secs: env_or("REFRESH_INTERVAL_SECS", defaults.refresh_interval_secs),
            cache_ttl_secs: env_or("CACHE_TTL_SECS", defaults.cache_ttl_secs),
            refresh_concurrency: env_or("REFRESH_CONCURRENCY", defaults.refresh_concurrency),
            fetch_timeout_secs: env_or("FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs),
            connect_timeout_secs: env_or("CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs),
            subscribe_timeout_secs: env_or("SUBSCRIBE_TIMEOUT_SECS", defaults.subscribe_timeout_secs),
            reconnect_max_attempts: env_or("RECONNECT_MAX_ATTEMPTS", defaults.reconnect_max_attempts),
            reconnect_delay_ms: env_or("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            reconnect_max_delay_ms: env_or("RECONNECT_MAX_DELAY_MS", defaults.reconnect_max_delay_ms),
            dispatch_queue_size: env_or("DISPATCH_QUEUE_SIZE", defaults.dispatch_queue_size),
            shutdown_grace_ms: env_or("SHUTDOWN_GRACE_MS", defaults.shutdown_grace_ms),
            api_bind_address: env::var("API_BIND_ADDRESS").unwrap_or(defaults.api_bind_address),
            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.feed_url.starts_with("ws://") || self.feed_url.starts_with("wss://")) {
            return Err(format!("FEED_URL must be a ws:// or wss:// URL, got {}", self.feed_url));
        }

        if !(self.volume_api_url.starts_with("http://") || self.volume_api_url.starts_with("https://")) {
            return Err(format!("VOLUME_API_URL must be an http(s) URL, got {}", self.volume_api_url));
        }

        if self.refresh_interval_secs == 0 {
            return Err("REFRESH_INTERVAL_SECS must be positive".to_string());
        }

        if self.cache_ttl_secs == 0 {
            return Err("CACHE_TTL_SECS must be positive".to_string());
        }

        if self.cache_ttl_secs > self.refresh_interval_secs.saturating_mul(MAX_TTL_INTERVAL_MULTIPLE) {
            return Err(format!(
                "CACHE_TTL_SECS ({}) exceeds {} refresh intervals ({}s)",
                self.cache_ttl_secs,
                MAX_TTL_INTERVAL_MULTIPLE,
                self.refresh_interval_secs.saturating_mul(MAX_TTL_INTERVAL_MULTIPLE)
            ));
        }

        if self.cache_ttl_secs < self.refresh_interval_secs {
            warn!(
                "CACHE_TTL_SECS ({}) is shorter than REFRESH_INTERVAL_SECS ({}); quotes will lose volume between refreshes",
                self.cache_ttl_secs, self.refresh_interval_secs
            );
        }

        if self.refresh_concurrency == 0 {
            return Err("REFRESH_CONCURRENCY must be at least 1".to_string());
        }

        if self.reconnect_max_attempts == 0 {
            return Err("RECONNECT_MAX_ATTEMPTS must be at least 1".to_string());
        }

        if self.reconnect_delay_ms == 0 || self.reconnect_max_delay_ms < self.reconnect_delay_ms {
            return Err("reconnect delays must be positive with RECONNECT_MAX_DELAY_MS >= RECONNECT_DELAY_MS".to_string());
        }

        if self.dispatch_queue_size == 0 {
            return Err("DISPATCH_QUEUE_SIZE must be at least 1".to_string());
        }

        Ok(())
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            subscribe_timeout: Duration::from_secs(self.subscribe_timeout_secs),
            reconnect: ReconnectPolicy::new(
                Duration::from_millis(self.reconnect_delay_ms),
                Duration::from_millis(self.reconnect_max_delay_ms),
                2.0,
                self.reconnect_max_attempts,
            ),
            dispatch_queue_size: self.dispatch_queue_size,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }

    pub fn refresher_settings(&self) -> RefresherSettings {
        RefresherSettings {
            interval: Duration::from_secs(self.refresh_interval_secs),
            ttl: Duration::from_secs(self.cache_ttl_secs),
            concurrency: self.refresh_concurrency,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }

    pub fn log_config(&self) {
        info!("Feed configuration:");
        info!("  Feed URL: {}", self.feed_url);
        info!("  Volume API URL: {}", self.volume_api_url);
        info!("  Watch codes: {:?}", self.watch_codes);
        info!("  Refresh interval: {}s, cache TTL: {}s, concurrency: {}",
              self.refresh_interval_secs, self.cache_ttl_secs, self.refresh_concurrency);
        info!("  Reconnect: {} attempts, {}ms..{}ms",
              self.reconnect_max_attempts, self.reconnect_delay_ms, self.reconnect_max_delay_ms);
        info!("  Status API: {}", self.api_bind_address);
        info!("  Log level: {}", self.log_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.cache_ttl_secs <= config.refresh_interval_secs * MAX_TTL_INTERVAL_MULTIPLE);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.feed_url = "http://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache_ttl_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache_ttl_secs = config.refresh_interval_secs * MAX_TTL_INTERVAL_MULTIPLE + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnect_max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnect_max_delay_ms = config.reconnect_delay_ms - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_codes() {
        assert_eq!(parse_codes("005930, 000660\n035420"), vec!["005930", "000660", "035420"]);
        assert!(parse_codes(" , ").is_empty());
        assert_eq!(parse_codes("A,B,A, B ,C"), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_settings_conversion() {
        let config = Config::default();
        let client = config.client_settings();
        assert_eq!(client.connect_timeout, Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS));
        assert_eq!(client.reconnect.max_attempts, DEFAULT_RECONNECT_MAX_ATTEMPTS);

        let refresher = config.refresher_settings();
        assert_eq!(refresher.ttl, Duration::from_secs(DEFAULT_CACHE_TTL_SECS));
        assert_eq!(refresher.concurrency, DEFAULT_REFRESH_CONCURRENCY);
    }
}

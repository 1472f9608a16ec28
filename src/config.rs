//! Runtime configuration with environment overrides.

use std::time::Duration;

/// Application configuration. Defaults are production values; every
/// operationally interesting knob can be overridden from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Scanner
    pub target_spread_pct: f64,
    pub target_volume: f64,
    pub scan_interval_ms: u64,

    // Stream lifecycle
    pub idle_timeout_ms: u64,
    pub reconnect_delay_ms: u64,

    // Book synchronization
    pub snapshot_depth: u32,
    pub snapshot_backoff_base_ms: u64,
    pub snapshot_backoff_max_ms: u64,
    pub snapshot_backoff_jitter: f64,
    pub max_pending_diffs: usize,

    // HTTP
    pub http_timeout_ms: u64,

    // Market catalog
    pub markets_file: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target_spread_pct: 1.1,
            target_volume: 500.0,
            scan_interval_ms: 1_000,

            idle_timeout_ms: 60_000,
            reconnect_delay_ms: 5_000,

            snapshot_depth: 100,
            // Backoff: 200ms base, 2x doubling, 5s cap, ±50% jitter
            snapshot_backoff_base_ms: 200,
            snapshot_backoff_max_ms: 5_000,
            snapshot_backoff_jitter: 0.5,
            max_pending_diffs: 1_000,

            http_timeout_ms: 10_000,

            markets_file: "markets.json".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("SCANNER_TARGET_SPREAD_PCT") {
            config.target_spread_pct = v.parse().unwrap_or(config.target_spread_pct);
        }
        if let Ok(v) = std::env::var("SCANNER_TARGET_VOLUME") {
            config.target_volume = v.parse().unwrap_or(config.target_volume);
        }
        if let Ok(v) = std::env::var("SCANNER_INTERVAL_MS") {
            config.scan_interval_ms = v.parse().unwrap_or(config.scan_interval_ms);
        }
        if let Ok(v) = std::env::var("STREAM_IDLE_TIMEOUT_MS") {
            config.idle_timeout_ms = v.parse().unwrap_or(config.idle_timeout_ms);
        }
        if let Ok(v) = std::env::var("RECONNECT_DELAY_MS") {
            config.reconnect_delay_ms = v.parse().unwrap_or(config.reconnect_delay_ms);
        }
        if let Ok(v) = std::env::var("SNAPSHOT_DEPTH") {
            config.snapshot_depth = v.parse().unwrap_or(config.snapshot_depth);
        }
        if let Ok(v) = std::env::var("SNAPSHOT_BACKOFF_BASE_MS") {
            config.snapshot_backoff_base_ms = v.parse().unwrap_or(config.snapshot_backoff_base_ms);
        }
        if let Ok(v) = std::env::var("SNAPSHOT_BACKOFF_MAX_MS") {
            config.snapshot_backoff_max_ms = v.parse().unwrap_or(config.snapshot_backoff_max_ms);
        }
        if let Ok(v) = std::env::var("MAX_PENDING_DIFFS") {
            config.max_pending_diffs = v.parse().unwrap_or(config.max_pending_diffs);
        }
        if let Ok(v) = std::env::var("HTTP_TIMEOUT_MS") {
            config.http_timeout_ms = v.parse().unwrap_or(config.http_timeout_ms);
        }
        if let Ok(v) = std::env::var("MARKETS_FILE") {
            config.markets_file = v;
        }

        config
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

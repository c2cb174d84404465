//! Settings and configuration module
//!
//! Provides unified configuration with:
//! - Builder pattern
//! - JSON loading
//! - Per-concern sections with defaults for every tunable

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::modules::pacing::DelayRange;
use crate::modules::proxy::ProxyConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Inclusive hour-of-day window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            (self.start..=self.end).contains(&hour)
        } else {
            hour >= self.start || hour <= self.end
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// First request of an identity waits this long.
    pub bootstrap_delay: DelayRange,
    /// Pause right before each request.
    pub jitter: DelayRange,
    /// Backoff is stretched inside this window.
    pub business_hours: HourWindow,
    pub business_hours_multiplier: DelayRange,
    pub backoff_jitter: DelayRange,
    pub backoff_cap_secs: f64,
    /// Cooldown after an HTTP 429.
    pub rate_limit_cooldown: DelayRange,
    pub decoy_probability: f64,
    /// A decoy burst fires between `decoy_min` and `decoy_limit` requests.
    pub decoy_min: usize,
    pub decoy_limit: usize,
    pub decoy_gap: DelayRange,
    pub decoy_timeout_secs: f64,
    pub sleep_chunk_secs: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            bootstrap_delay: DelayRange::new(1.0, 5.0),
            jitter: DelayRange::new(0.1, 0.8),
            business_hours: HourWindow { start: 9, end: 17 },
            business_hours_multiplier: DelayRange::new(1.5, 2.0),
            backoff_jitter: DelayRange::new(0.0, 2.0),
            backoff_cap_secs: 300.0,
            rate_limit_cooldown: DelayRange::new(30.0, 120.0),
            decoy_probability: 0.1,
            decoy_min: 0,
            decoy_limit: 2,
            decoy_gap: DelayRange::new(0.2, 0.8),
            decoy_timeout_secs: 10.0,
            sleep_chunk_secs: 1.0,
        }
    }
}

impl PacingConfig {
    pub fn sleep_chunk(&self) -> Duration {
        Duration::from_secs_f64(self.sleep_chunk_secs.max(0.001))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Transport failures tolerated per request.
    pub max_retries: u32,
    /// Hard cap on attempts including 429 retries.
    pub attempt_ceiling: u32,
    /// Failed attempt number after which the identity gets a new proxy.
    pub proxy_switch_attempt: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            attempt_ceiling: 8,
            proxy_switch_attempt: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Per-request timeout is drawn from this band.
    pub timeout: DelayRange,
    pub status_retries: u32,
    pub status_backoff_factor: f64,
    pub status_forcelist: Vec<u16>,
    pub pool_max_idle_per_host: usize,
    pub accept_invalid_certs: bool,
    pub random_tls_extension_order: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: DelayRange::new(15.0, 30.0),
            status_retries: 3,
            status_backoff_factor: 2.0,
            status_forcelist: vec![429, 500, 502, 503, 504, 520, 521, 522, 524],
            pool_max_idle_per_host: 20,
            accept_invalid_certs: true,
            random_tls_extension_order: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// redb file; `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    pub session_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            session_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl StorageConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StealthConfig {
    pub proxies: Vec<String>,
    pub proxy_file: Option<PathBuf>,
    pub proxy: ProxyConfig,
    pub pacing: PacingConfig,
    pub retry: RetryConfig,
    pub transport: TransportConfig,
    pub storage: StorageConfig,
}

impl StealthConfig {
    pub fn builder() -> StealthConfigBuilder {
        StealthConfigBuilder::new()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ranges = [
            ("pacing.bootstrap_delay", self.pacing.bootstrap_delay),
            ("pacing.jitter", self.pacing.jitter),
            ("pacing.rate_limit_cooldown", self.pacing.rate_limit_cooldown),
            ("pacing.decoy_gap", self.pacing.decoy_gap),
            ("transport.timeout", self.transport.timeout),
        ];
        for (name, range) in ranges {
            if range.min < 0.0 || range.min > range.max {
                return Err(ConfigError::Invalid(format!(
                    "{name} must satisfy 0 <= min <= max"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.proxy.heal_ratio) {
            return Err(ConfigError::Invalid(
                "proxy.heal_ratio must be within [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pacing.decoy_probability) {
            return Err(ConfigError::Invalid(
                "pacing.decoy_probability must be within [0, 1]".into(),
            ));
        }
        if self.pacing.decoy_min > self.pacing.decoy_limit {
            return Err(ConfigError::Invalid(
                "pacing.decoy_min must not exceed pacing.decoy_limit".into(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Invalid("retry.max_retries must be at least 1".into()));
        }
        if self.retry.attempt_ceiling < self.retry.max_retries {
            return Err(ConfigError::Invalid(
                "retry.attempt_ceiling must be >= retry.max_retries".into(),
            ));
        }
        if self.pacing.business_hours.start > 23 || self.pacing.business_hours.end > 23 {
            return Err(ConfigError::Invalid("pacing.business_hours must use hours 0-23".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StealthConfigBuilder {
    config: StealthConfig,
}

impl StealthConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.proxies = proxies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_proxy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.proxy_file = Some(path.into());
        self
    }

    pub fn with_proxy_config(mut self, config: ProxyConfig) -> Self {
        self.config.proxy = config;
        self
    }

    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.config.pacing = pacing;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.config.transport = transport;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.path = Some(path.into());
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.config.storage.session_ttl_secs = ttl.as_secs();
        self
    }

    pub fn disable_decoys(mut self) -> Self {
        self.config.pacing.decoy_probability = 0.0;
        self
    }

    pub fn build(self) -> Result<StealthConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = StealthConfig::default();
        assert_eq!(config.proxy.quarantine_threshold, 5);
        assert_eq!(config.proxy.problematic_threshold, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.pacing.rate_limit_cooldown, DelayRange::new(30.0, 120.0));
        assert_eq!(config.pacing.backoff_cap_secs, 300.0);
        assert_eq!(config.storage.session_ttl(), Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = StealthConfig::from_json_str(
            r#"{
                "proxies": ["1.2.3.4:8080"],
                "retry": { "max_retries": 5 },
                "pacing": { "jitter": { "min": 0.0, "max": 0.2 } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.attempt_ceiling, 8);
        assert_eq!(config.pacing.jitter.max, 0.2);
        assert_eq!(config.pacing.bootstrap_delay, DelayRange::new(1.0, 5.0));
    }

    #[test]
    fn rejects_inverted_ranges() {
        let err = StealthConfig::from_json_str(r#"{"pacing": {"jitter": {"min": 2, "max": 1}}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(StealthConfig::builder().with_max_retries(0).build().is_err());

        let err = StealthConfig::from_json_str(r#"{"pacing": {"decoy_min": 3}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn decoys_may_be_skipped_by_default() {
        let config = StealthConfig::default();
        assert_eq!(config.pacing.decoy_min, 0);
        assert_eq!(config.pacing.decoy_limit, 2);
    }

    #[test]
    fn business_hours_window() {
        let window = HourWindow { start: 9, end: 17 };
        assert!(window.contains(9) && window.contains(17));
        assert!(!window.contains(18));
        let overnight = HourWindow { start: 22, end: 2 };
        assert!(overnight.contains(23) && overnight.contains(1));
        assert!(!overnight.contains(12));
    }
}

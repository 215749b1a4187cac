//! Configuration for the synchronization core.
//!
//! Every knob has a sensible default and an environment override, and the
//! whole structure is validated once at startup.

use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::models::SyncMode;

/// Retry policy for remote calls that fail transiently
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            jitter_ratio: 0.2,
        }
    }
}

/// Test-mode guard rails: when enabled, only remote playlists whose local
/// name starts with one of the declared prefixes may be mutated.
#[derive(Debug, Clone)]
pub struct TestModeConfig {
    pub enabled: bool,
    pub prefixes: Vec<String>,
}

impl Default for TestModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prefixes: vec![
                "🧪".to_string(),
                "[TEST]".to_string(),
                "SELECTA_TEST_".to_string(),
            ],
        }
    }
}

/// Complete configuration surface of the synchronization core
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_global_sync_concurrency: usize,
    pub max_per_adapter_concurrency: usize,
    pub default_sync_mode: SyncMode,
    pub match_auto_threshold: f64,
    pub match_candidate_threshold: f64,
    pub retry: RetryConfig,
    pub test_mode: TestModeConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_global_sync_concurrency: 2,
            max_per_adapter_concurrency: 1,
            default_sync_mode: SyncMode::FullBidirectional,
            match_auto_threshold: 0.82,
            match_candidate_threshold: 0.60,
            retry: RetryConfig::default(),
            test_mode: TestModeConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("SYNC_GLOBAL_CONCURRENCY")? {
            config.max_global_sync_concurrency = v;
        }
        if let Some(v) = env_parse::<usize>("SYNC_ADAPTER_CONCURRENCY")? {
            config.max_per_adapter_concurrency = v;
        }
        if let Ok(v) = std::env::var("SYNC_DEFAULT_MODE") {
            config.default_sync_mode = v.parse().map_err(|_| SyncError::Config {
                message: format!("SYNC_DEFAULT_MODE: unknown sync mode '{}'", v),
            })?;
        }
        if let Some(v) = env_parse::<f64>("MATCH_AUTO_THRESHOLD")? {
            config.match_auto_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("MATCH_CANDIDATE_THRESHOLD")? {
            config.match_candidate_threshold = v;
        }
        if let Some(v) = env_parse::<u32>("RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<f64>("RETRY_JITTER_RATIO")? {
            config.retry.jitter_ratio = v;
        }
        if let Some(v) = env_parse::<bool>("TEST_MODE_ENABLED")? {
            config.test_mode.enabled = v;
        }
        if let Ok(v) = std::env::var("TEST_PREFIXES") {
            config.test_mode.prefixes = v
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_global_sync_concurrency == 0 {
            return Err(SyncError::Config {
                message: "max_global_sync_concurrency must be at least 1".to_string(),
            });
        }
        if self.max_per_adapter_concurrency == 0 {
            return Err(SyncError::Config {
                message: "max_per_adapter_concurrency must be at least 1".to_string(),
            });
        }
        for (name, value) in [
            ("match_auto_threshold", self.match_auto_threshold),
            ("match_candidate_threshold", self.match_candidate_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(SyncError::Config {
                    message: format!("{} must be within [0, 1], got {}", name, value),
                });
            }
        }
        if self.match_candidate_threshold > self.match_auto_threshold {
            return Err(SyncError::Config {
                message: "match_candidate_threshold must not exceed match_auto_threshold"
                    .to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config {
                message: "retry max_attempts must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(SyncError::Config {
                message: format!(
                    "retry jitter_ratio must be within [0, 1], got {}",
                    self.retry.jitter_ratio
                ),
            });
        }
        if self.test_mode.enabled && self.test_mode.prefixes.is_empty() {
            return Err(SyncError::Config {
                message: "test mode requires at least one playlist name prefix".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| SyncError::Config {
            message: format!("{}: cannot parse '{}'", key, raw),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.max_global_sync_concurrency, 2);
        assert_eq!(config.max_per_adapter_concurrency, 1);
        assert_eq!(config.default_sync_mode, SyncMode::FullBidirectional);
        assert_eq!(config.match_auto_threshold, 0.82);
        assert_eq!(config.match_candidate_threshold, 0.60);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.jitter_ratio, 0.2);
        assert!(!config.test_mode.enabled);
        assert!(config
            .test_mode
            .prefixes
            .contains(&"SELECTA_TEST_".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let config = SyncConfig {
            match_auto_threshold: 0.5,
            match_candidate_threshold: 0.7,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SyncError::Config { .. })
        ));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = SyncConfig {
            max_global_sync_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn env_overrides_are_applied() {
        std::env::set_var("SYNC_GLOBAL_CONCURRENCY", "4");
        std::env::set_var("SYNC_DEFAULT_MODE", "add_only");
        std::env::set_var("TEST_MODE_ENABLED", "true");
        std::env::set_var("TEST_PREFIXES", "QA_, STAGING_");

        let config = SyncConfig::from_env().unwrap();
        assert_eq!(config.max_global_sync_concurrency, 4);
        assert_eq!(config.default_sync_mode, SyncMode::AddOnly);
        assert!(config.test_mode.enabled);
        assert_eq!(config.test_mode.prefixes, vec!["QA_", "STAGING_"]);

        std::env::remove_var("SYNC_GLOBAL_CONCURRENCY");
        std::env::remove_var("SYNC_DEFAULT_MODE");
        std::env::remove_var("TEST_MODE_ENABLED");
        std::env::remove_var("TEST_PREFIXES");
    }

    #[test]
    #[serial]
    fn invalid_env_value_is_reported() {
        std::env::set_var("MATCH_AUTO_THRESHOLD", "not-a-number");
        let result = SyncConfig::from_env();
        std::env::remove_var("MATCH_AUTO_THRESHOLD");
        assert!(matches!(result, Err(SyncError::Config { .. })));
    }
}

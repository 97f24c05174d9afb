//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Rating and trust-state policy
    pub policy: PolicyConfig,
    /// Shared history store access
    pub store: StoreConfig,
    /// Periodic flush/evaluation loop
    pub evaluation: EvaluationConfig,
}

/// Thresholds, periods and history caps driving the trust-state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Length of one observation period (bucket)
    #[serde(with = "humantime_serde")]
    pub observation_period: Duration,
    /// Age a period must reach (measured from its start) before it is rated
    #[serde(with = "humantime_serde")]
    pub rating_mask: Duration,
    /// How long a temporary disable lasts
    #[serde(with = "humantime_serde")]
    pub disabled_period: Duration,
    /// Average rating below which a healthy function overflows
    pub overflow_threshold: f64,
    /// Average rating below which an overflowed function is disabled
    pub disable_threshold: f64,
    /// Ratings needed before any transition is considered
    pub min_observations: usize,
    /// State periods retained per function
    pub max_recorded_states: usize,
    /// Rating periods retained per function
    pub max_recorded_ratings: usize,
    /// Temporary disables allowed before a permanent one.
    /// Defaults to half of `max_recorded_states`.
    pub max_allowed_temporary_disables: Option<usize>,
    /// Judge a recorded state only on ratings gathered since it was entered.
    /// Off by default: every retained rating counts.
    pub judge_since_transition: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            observation_period: Duration::from_secs(10),
            rating_mask: Duration::from_secs(20),
            disabled_period: Duration::from_secs(10 * 60),
            overflow_threshold: 0.8,
            disable_threshold: 0.5,
            min_observations: 3,
            max_recorded_states: 10,
            max_recorded_ratings: 10,
            max_allowed_temporary_disables: None,
            judge_since_transition: false,
        }
    }
}

impl PolicyConfig {
    /// Effective temporary-disable budget
    #[must_use]
    pub fn temporary_disable_budget(&self) -> usize {
        self.max_allowed_temporary_disables
            .unwrap_or(self.max_recorded_states / 2)
    }

    fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.overflow_threshold) || !in_unit(self.disable_threshold) {
            return Err(Error::Config(
                "policy thresholds must lie within [0, 1]".to_string(),
            ));
        }
        if self.disable_threshold >= self.overflow_threshold {
            return Err(Error::Config(format!(
                "disable_threshold ({}) must be below overflow_threshold ({})",
                self.disable_threshold, self.overflow_threshold
            )));
        }
        if self.observation_period.as_millis() == 0 {
            return Err(Error::Config("observation_period must be non-zero".to_string()));
        }
        if self.rating_mask < self.observation_period {
            return Err(Error::Config(
                "rating_mask must cover at least one observation_period".to_string(),
            ));
        }
        if self.max_recorded_states == 0 || self.max_recorded_ratings == 0 {
            return Err(Error::Config("history caps must be non-zero".to_string()));
        }
        if self.min_observations == 0 {
            return Err(Error::Config("min_observations must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Shared history store access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Key namespace, keeps environments apart
    pub namespace: String,
    /// Pooled connections available to one process
    pub max_connections: usize,
    /// Bound on waiting for a pooled connection
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Operations running longer than this are reported as stuck
    #[serde(with = "humantime_serde")]
    pub watchdog_timeout: Duration,
    /// Raw observation entries retained per function
    pub max_recorded_observations: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "function-watcher".to_string(),
            max_connections: 8,
            acquire_timeout: Duration::from_secs(1),
            watchdog_timeout: Duration::from_secs(5),
            max_recorded_observations: 100,
        }
    }
}

/// Periodic flush/evaluation loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Interval between flush + evaluation cycles
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Distinct (function, period) buckets buffered before new ones are dropped
    pub max_buffered_periods: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_buffered_periods: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or describes an inconsistent policy.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // FUNCTION_WATCHER_POLICY__OVERFLOW_THRESHOLD=0.7
        figment = figment.merge(Env::prefixed("FUNCTION_WATCHER_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if self.store.max_connections == 0 {
            return Err(Error::Config("store.max_connections must be non-zero".to_string()));
        }
        if self.store.max_recorded_observations == 0 {
            return Err(Error::Config(
                "store.max_recorded_observations must be non-zero".to_string(),
            ));
        }
        if self.store.namespace.is_empty() {
            return Err(Error::Config("store.namespace must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.policy.temporary_disable_budget(), 5);
        assert_eq!(config.policy.rating_mask, config.policy.observation_period * 2);
        // Every retained rating counts unless the operator opts in
        assert!(!config.policy.judge_since_transition);
    }

    #[test]
    fn explicit_disable_budget_wins() {
        let policy = PolicyConfig {
            max_allowed_temporary_disables: Some(2),
            ..Default::default()
        };
        assert_eq!(policy.temporary_disable_budget(), 2);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.policy.disable_threshold = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("disable_threshold"));
    }

    #[test]
    fn rejects_short_rating_mask() {
        let mut config = Config::default();
        config.policy.rating_mask = Duration::from_secs(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_pool() {
        let mut config = Config::default();
        config.store.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_yaml_with_humantime_durations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watcher.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
policy:
  observation_period: 30s
  rating_mask: 1m
  disabled_period: 15m
  overflow_threshold: 0.7
store:
  namespace: function-watcher-test
  watchdog_timeout: 2s
"#
        )
        .unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.policy.observation_period, Duration::from_secs(30));
        assert_eq!(config.policy.rating_mask, Duration::from_secs(60));
        assert_eq!(config.policy.disabled_period, Duration::from_secs(15 * 60));
        assert!((config.policy.overflow_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.store.namespace, "function-watcher-test");
        assert_eq!(config.store.watchdog_timeout, Duration::from_secs(2));
        // untouched sections keep their defaults
        assert_eq!(config.store.max_connections, 8);
        assert_eq!(config.evaluation.interval, Duration::from_secs(10));
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/watcher.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn load_rejects_invalid_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watcher.yaml");
        std::fs::write(&path, "policy:\n  overflow_threshold: 1.5\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}

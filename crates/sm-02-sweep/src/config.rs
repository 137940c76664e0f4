//! # Subnet Manager Configuration
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes.
//!
//! ## File Format
//!
//! ```toml
//! guid = 0x0002c90300000001
//! priority = 10
//! lmc = 1
//! routing_engine = "minhop"
//! sweep_interval_secs = 10
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use fabric_types::{Guid, SmCandidate, MAX_LMC};
use serde::{Deserialize, Serialize};
use sm_01_routing::{RoutingEngineKind, RoutingOptions};
use thiserror::Error;

/// Highest arbitration priority.
pub const MAX_PRIORITY: u8 = 15;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {error}")]
    Io { path: String, error: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmConfig {
    /// Port GUID this instance arbitrates with.
    pub guid: Guid,
    /// Arbitration priority, 0-15.
    pub priority: u8,

    /// LID mask count for endpoint ports.
    pub lmc: u8,
    /// Apply `lmc` to switch management ports too.
    pub lmc_esp0: bool,

    pub routing_engine: RoutingEngineKind,
    /// Recompute every forwarding entry instead of keeping valid ones.
    pub ignore_existing_lfts: bool,
    /// Spread multi-LID ports across distinct remote systems.
    pub lmc_tracking: bool,

    /// Period of light sweeps; 0 disables them.
    pub sweep_interval_secs: u64,
    /// First heavy-sweep retry delay after a failed sweep.
    pub heavy_retry_base_ms: u64,
    /// Cap on the heavy-sweep retry delay.
    pub heavy_retry_max_ms: u64,
    /// Outstanding work making no progress for this long is abandoned.
    pub transaction_timeout_ms: u64,
    /// Period of master polls while in standby.
    pub polling_interval_secs: u64,
    /// Missed polls tolerated before re-arbitration.
    pub polling_retry_number: u32,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            guid: Guid(1),
            priority: 0,
            lmc: 0,
            lmc_esp0: false,
            routing_engine: RoutingEngineKind::MinHop,
            ignore_existing_lfts: false,
            lmc_tracking: false,
            sweep_interval_secs: 10,
            heavy_retry_base_ms: 1_000,
            heavy_retry_max_ms: 60_000,
            transaction_timeout_ms: 2_000,
            polling_interval_secs: 10,
            polling_retry_number: 4,
        }
    }
}

impl SmConfig {
    /// Create config for testing (short timers, no periodic sweeps).
    pub fn for_testing() -> Self {
        Self {
            guid: Guid(0x10),
            priority: 5,
            sweep_interval_secs: 0,
            heavy_retry_base_ms: 50,
            heavy_retry_max_ms: 400,
            transaction_timeout_ms: 500,
            polling_interval_secs: 1,
            polling_retry_number: 2,
            ..Self::default()
        }
    }

    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.priority > MAX_PRIORITY {
            return Err(ConfigError::Invalid(format!(
                "priority {} exceeds {}",
                self.priority, MAX_PRIORITY
            )));
        }
        if self.lmc > MAX_LMC {
            return Err(ConfigError::Invalid(format!(
                "lmc {} exceeds {}",
                self.lmc, MAX_LMC
            )));
        }
        if self.routing_engine == RoutingEngineKind::Dor && self.lmc_tracking {
            return Err(ConfigError::Invalid(
                "routing_engine = \"dor\" cannot be combined with lmc_tracking".into(),
            ));
        }
        if self.heavy_retry_base_ms == 0 || self.heavy_retry_max_ms < self.heavy_retry_base_ms {
            return Err(ConfigError::Invalid(format!(
                "heavy retry window {}..{} ms is empty",
                self.heavy_retry_base_ms, self.heavy_retry_max_ms
            )));
        }
        if self.transaction_timeout_ms == 0 || self.polling_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "transaction_timeout_ms and polling_interval_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// This instance as an arbitration candidate.
    pub fn candidate(&self) -> SmCandidate {
        SmCandidate::new(self.guid, self.priority)
    }

    pub fn routing_options(&self) -> RoutingOptions {
        RoutingOptions {
            ignore_existing: self.ignore_existing_lfts,
            lmc_tracking: self.lmc_tracking,
        }
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn heavy_retry_base(&self) -> Duration {
        Duration::from_millis(self.heavy_retry_base_ms)
    }

    pub fn heavy_retry_max(&self) -> Duration {
        Duration::from_millis(self.heavy_retry_max_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SmConfig::default().validate().is_ok());
        assert!(SmConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_parse_overrides_only_named_fields() {
        let config = SmConfig::parse(
            r#"
            guid = 42
            priority = 7
            lmc = 2
            routing_engine = "dor"
            sweep_interval_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.guid, Guid(42));
        assert_eq!(config.priority, 7);
        assert_eq!(config.lmc, 2);
        assert_eq!(config.routing_engine, RoutingEngineKind::Dor);
        assert_eq!(config.sweep_interval(), None);
        assert_eq!(config.polling_retry_number, SmConfig::default().polling_retry_number);
    }

    #[test]
    fn test_dor_with_lmc_tracking_rejected() {
        let err = SmConfig::parse("routing_engine = \"dor\"\nlmc_tracking = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        assert!(matches!(
            SmConfig::parse("priority = 16"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(SmConfig::parse("lmc = 8"), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            SmConfig::parse("heavy_retry_base_ms = 500\nheavy_retry_max_ms = 100"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_field_is_parse_error() {
        assert!(matches!(
            SmConfig::parse("sweep_intervall = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = SmConfig::load("/nonexistent/sm.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

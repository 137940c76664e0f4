//! # Subnet Manager Runtime
//!
//! Startup plumbing for the `sm-runtime` binary.
//!
//! ## Startup Sequence
//!
//! 1. Load `SmConfig` from `SM_CONFIG` (defaults when unset)
//! 2. Apply `SM_GUID`, `SM_PRIORITY`, `SM_SWEEP_INTERVAL` overrides
//! 3. Load the fabric description from `SM_FABRIC`
//! 4. Spawn the engine and join the described multicast groups
//! 5. Run until Ctrl+C, then dump forwarding tables

pub mod fabric_file;

use std::env;

use anyhow::{Context, Result};
use fabric_types::Guid;
use sm_02_sweep::SmConfig;
use tracing::info;

pub use fabric_file::FabricFile;

/// Path of the subnet manager config file.
pub const CONFIG_ENV: &str = "SM_CONFIG";
/// Path of the fabric description.
pub const FABRIC_ENV: &str = "SM_FABRIC";

/// Load configuration from the file named by `SM_CONFIG`, then the
/// environment.
pub fn load_config() -> Result<SmConfig> {
    let config = match env::var(CONFIG_ENV) {
        Ok(path) => {
            info!(path = %path, "loading subnet manager config");
            SmConfig::load(&path).with_context(|| format!("loading {}", path))?
        }
        Err(_) => SmConfig::default(),
    };
    let config = apply_overrides(config, |key| env::var(key).ok())?;
    config.validate().context("config after environment overrides")?;
    Ok(config)
}

/// Apply `SM_*` overrides read through `lookup`.
pub fn apply_overrides<F>(mut config: SmConfig, lookup: F) -> Result<SmConfig>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(guid) = lookup("SM_GUID") {
        config.guid = Guid(parse_u64(&guid).with_context(|| format!("SM_GUID={}", guid))?);
    }
    if let Some(priority) = lookup("SM_PRIORITY") {
        config.priority = priority
            .parse()
            .with_context(|| format!("SM_PRIORITY={}", priority))?;
    }
    if let Some(secs) = lookup("SM_SWEEP_INTERVAL") {
        config.sweep_interval_secs = secs
            .parse()
            .with_context(|| format!("SM_SWEEP_INTERVAL={}", secs))?;
    }
    Ok(config)
}

/// Decimal or `0x`-prefixed hex.
fn parse_u64(s: &str) -> Result<u64> {
    let s = s.trim();
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(value)
}

//! Catalog configuration, read from env vars:
//!   SOS_CATALOG_EVENT_BUFFER      : cache event channel capacity (default: 1024)
//!   SOS_CATALOG_SEED_PATH         : optional YAML seed bundle
//!   SOS_CATALOG_EXTREMA_STRATEGY  : auto | batch | per_series (default: auto)
//!   SOS_CATALOG_STATS_INTERVAL_MS : periodic stats log interval (default: 30000)

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CatalogError, Result};
use crate::time_extrema::ExtremaStrategy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub event_buffer: usize,
    pub seed_path: Option<PathBuf>,
    /// `None` probes the store.
    pub extrema_strategy: Option<ExtremaStrategy>,
    pub stats_interval_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            event_buffer: 1024,
            seed_path: None,
            extrema_strategy: None,
            stats_interval_ms: 30_000,
        }
    }
}

impl CatalogConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup("SOS_CATALOG_EVENT_BUFFER") {
            config.event_buffer = parse_number("SOS_CATALOG_EVENT_BUFFER", &v)?;
        }
        if let Some(v) = lookup("SOS_CATALOG_SEED_PATH").filter(|v| !v.is_empty()) {
            config.seed_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SOS_CATALOG_EXTREMA_STRATEGY") {
            config.extrema_strategy = ExtremaStrategy::from_setting(v.trim())?;
        }
        if let Some(v) = lookup("SOS_CATALOG_STATS_INTERVAL_MS") {
            config.stats_interval_ms = parse_number("SOS_CATALOG_STATS_INTERVAL_MS", &v)?;
        }
        if config.event_buffer == 0 {
            return Err(CatalogError::InvalidInput(
                "SOS_CATALOG_EVENT_BUFFER must be at least 1".into(),
            ));
        }
        if config.stats_interval_ms == 0 {
            return Err(CatalogError::InvalidInput(
                "SOS_CATALOG_STATS_INTERVAL_MS must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CatalogError::InvalidInput(format!("{key}: '{value}' is not a number")))
}

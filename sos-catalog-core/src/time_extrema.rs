//! Time extrema aggregation.
//!
//! Incremental path: every inserted observation is folded into the running
//! `(min, max)` of its key. Merging is commutative and idempotent, so batches
//! may be applied in any order.
//!
//! Rebuild path: extrema are recomputed from the store using the strategy
//! selected once from the store's capabilities.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};
use crate::ports::{CatalogStore, StoreCapabilities};
use crate::types::{ObservedTimes, SeriesKey, TimePeriod};

/// Phenomenon-time and result-time bounds for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesExtrema {
    pub phenomenon_time: TimePeriod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_time: Option<TimePeriod>,
}

impl SeriesExtrema {
    pub fn from_times(times: &ObservedTimes) -> Self {
        Self {
            phenomenon_time: times.phenomenon_time.as_period(),
            result_time: times.result_time.map(|t| t.as_period()),
        }
    }

    pub fn merge(&self, other: &SeriesExtrema) -> SeriesExtrema {
        SeriesExtrema {
            phenomenon_time: self.phenomenon_time.merge(&other.phenomenon_time),
            result_time: match (self.result_time, other.result_time) {
                (Some(a), Some(b)) => Some(a.merge(&b)),
                (a, b) => a.or(b),
            },
        }
    }
}

/// Running extrema keyed by series, offering, or anything else ordered.
#[derive(Debug, Clone)]
pub struct TimeExtremaAggregator<K: Ord> {
    extrema: BTreeMap<K, SeriesExtrema>,
}

impl<K: Ord> Default for TimeExtremaAggregator<K> {
    fn default() -> Self {
        Self {
            extrema: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone> TimeExtremaAggregator<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one insert's batch of observation times into `key` and return the
    /// merged phenomenon-time period. `None` only for an empty batch on a key
    /// never observed.
    pub fn update(&mut self, key: &K, batch: &[ObservedTimes]) -> Option<TimePeriod> {
        let incoming = batch
            .iter()
            .map(SeriesExtrema::from_times)
            .reduce(|a, b| a.merge(&b));
        match incoming {
            Some(extrema) => Some(self.merge_extrema(key.clone(), extrema).phenomenon_time),
            None => self.get(key).map(|e| e.phenomenon_time),
        }
    }

    pub fn merge_extrema(&mut self, key: K, incoming: SeriesExtrema) -> SeriesExtrema {
        let merged = match self.extrema.get(&key) {
            Some(existing) => existing.merge(&incoming),
            None => incoming,
        };
        self.extrema.insert(key, merged);
        merged
    }

    pub fn get(&self, key: &K) -> Option<&SeriesExtrema> {
        self.extrema.get(key)
    }

    /// Bounds over every key, `None` when nothing has been observed.
    pub fn overall(&self) -> Option<SeriesExtrema> {
        self.extrema.values().copied().reduce(|a, b| a.merge(&b))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &SeriesExtrema)> {
        self.extrema.iter()
    }

    pub fn len(&self) -> usize {
        self.extrema.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extrema.is_empty()
    }
}

impl<K: Ord + Clone> FromIterator<(K, SeriesExtrema)> for TimeExtremaAggregator<K> {
    fn from_iter<I: IntoIterator<Item = (K, SeriesExtrema)>>(iter: I) -> Self {
        let mut agg = Self::new();
        for (k, e) in iter {
            agg.merge_extrema(k, e);
        }
        agg
    }
}

/// How a full rebuild recomputes extrema from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtremaStrategy {
    /// One aggregate query covering all series.
    Batch,
    /// One aggregate min/max query per series.
    PerSeries,
}

impl ExtremaStrategy {
    pub fn probe(capabilities: &StoreCapabilities) -> Self {
        if capabilities.batch_time_extrema {
            Self::Batch
        } else {
            Self::PerSeries
        }
    }

    pub async fn load(
        &self,
        store: &dyn CatalogStore,
        keys: &[SeriesKey],
    ) -> Result<TimeExtremaAggregator<SeriesKey>> {
        match self {
            Self::Batch => {
                let batch: HashMap<SeriesKey, SeriesExtrema> =
                    store.fetch_time_extrema_batch(keys).await?;
                Ok(batch.into_iter().collect())
            }
            Self::PerSeries => {
                let mut agg = TimeExtremaAggregator::new();
                for key in keys {
                    if let Some(extrema) = store.fetch_time_extrema(key).await? {
                        agg.merge_extrema(key.clone(), extrema);
                    }
                }
                Ok(agg)
            }
        }
    }

    pub fn from_setting(s: &str) -> Result<Option<Self>> {
        match s {
            "auto" => Ok(None),
            "batch" => Ok(Some(Self::Batch)),
            "per_series" => Ok(Some(Self::PerSeries)),
            other => Err(CatalogError::InvalidInput(format!(
                "unknown extrema strategy '{other}' (expected auto, batch or per_series)"
            ))),
        }
    }
}

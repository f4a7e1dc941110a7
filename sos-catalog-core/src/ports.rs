//! Storage port for the catalog core.
//! The core depends only on this trait; `MemoryCatalogStore` implements it
//! in-crate and durable backends live outside the core.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::time_extrema::SeriesExtrema;
use crate::types::*;

pub use crate::error::Result;

/// Optional store features, probed once when the cache loader is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCapabilities {
    /// The store can aggregate min/max times for many series in one query.
    pub batch_time_extrema: bool,
}

/// Durable storage of the catalog.
///
/// Implementations map their own failures to `CatalogError::StoreUnavailable`.
/// All writes are upserts keyed by identifier, so replaying them is safe.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    fn capabilities(&self) -> StoreCapabilities;

    // ── Constellations ──

    async fn find_constellations(
        &self,
        procedure: Option<&str>,
        observable_property: Option<&str>,
        offering: Option<&str>,
    ) -> Result<Vec<ObservationConstellation>>;

    /// Insert or update by `record.id`.
    async fn save_constellation(&self, record: &ObservationConstellation)
        -> Result<ConstellationId>;
    async fn disable_constellation(&self, id: ConstellationId) -> Result<()>;
    async fn reenable_constellation(&self, id: ConstellationId) -> Result<()>;

    // ── Entities ──

    async fn save_procedure(&self, procedure: &Procedure) -> Result<()>;
    async fn disable_procedure(&self, id: &str) -> Result<()>;
    async fn save_observable_property(&self, property: &ObservableProperty) -> Result<()>;
    async fn save_offering(&self, offering: &Offering) -> Result<()>;
    async fn save_feature(&self, feature: &Feature) -> Result<()>;

    // ── Observation times ──

    async fn record_observations(&self, series: &SeriesKey, batch: &[ObservedTimes])
        -> Result<()>;
    async fn delete_series(&self, series: &SeriesKey) -> Result<()>;
    async fn fetch_series_keys(&self) -> Result<Vec<SeriesKey>>;
    async fn fetch_time_extrema(&self, series: &SeriesKey) -> Result<Option<SeriesExtrema>>;
    /// Only called when `capabilities().batch_time_extrema` is set.
    async fn fetch_time_extrema_batch(
        &self,
        series: &[SeriesKey],
    ) -> Result<HashMap<SeriesKey, SeriesExtrema>>;

    // ── Bulk load ──

    async fn fetch_procedures(&self) -> Result<Vec<Procedure>>;
    /// `(child, parent)` pairs.
    async fn fetch_procedure_hierarchy(&self) -> Result<Vec<(String, String)>>;
    async fn fetch_observable_properties(&self) -> Result<Vec<ObservableProperty>>;
    async fn fetch_offerings(&self) -> Result<Vec<Offering>>;
    /// `(offering, procedure)` pairs over non-disabled constellations.
    async fn fetch_offering_membership(&self) -> Result<Vec<(String, String)>>;
    async fn fetch_features(&self) -> Result<Vec<Feature>>;
}

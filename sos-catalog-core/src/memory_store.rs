use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;
use async_trait::async_trait;

use crate::error::{CatalogError, Result};
use crate::ports::{CatalogStore, StoreCapabilities};
use crate::seeds::SeedBundle;
use crate::time_extrema::SeriesExtrema;
use crate::types::*;

#[derive(Default)]
struct MemoryState {
    /// Insertion order is preserved so reloads reproduce registry order.
    constellations: Vec<ObservationConstellation>,
    procedures: BTreeMap<String, Procedure>,
    properties: BTreeMap<String, ObservableProperty>,
    offerings: BTreeMap<String, Offering>,
    features: BTreeMap<String, Feature>,
    observations: BTreeMap<SeriesKey, Vec<ObservedTimes>>,
}

/// In-memory CatalogStore for tests, demos and the daemon.
///
/// `set_available(false)` makes every call fail with `StoreUnavailable`,
/// which is how tests exercise the stale-but-available paths.
pub struct MemoryCatalogStore {
    inner: RwLock<MemoryState>,
    capabilities: StoreCapabilities,
    available: AtomicBool,
    extrema_queries: AtomicUsize,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::with_capabilities(StoreCapabilities {
            batch_time_extrema: true,
        })
    }

    pub fn with_capabilities(capabilities: StoreCapabilities) -> Self {
        Self {
            inner: RwLock::new(MemoryState::default()),
            capabilities,
            available: AtomicBool::new(true),
            extrema_queries: AtomicUsize::new(0),
        }
    }

    /// Build a store pre-populated from a seed bundle.
    pub fn seeded(bundle: &SeedBundle) -> Result<Self> {
        let store = Self::new();
        {
            let mut state = store.write()?;
            for p in &bundle.procedures {
                state.procedures.insert(p.id().to_string(), p.clone());
            }
            for p in &bundle.observable_properties {
                state.properties.insert(p.id().to_string(), p.clone());
            }
            for o in &bundle.offerings {
                state.offerings.insert(o.id().to_string(), o.clone());
            }
            for f in &bundle.features {
                state.features.insert(f.id().to_string(), f.clone());
            }
            for seed in &bundle.constellations {
                let mut c = ObservationConstellation::new(
                    ConstellationKey::new(&seed.procedure, &seed.observable_property, &seed.offering),
                    seed.hidden_child,
                );
                c.observation_type = seed.observation_type;
                state.constellations.push(c);
            }
        }
        Ok(store)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of single-series aggregate queries served so far.
    pub fn extrema_query_count(&self) -> usize {
        self.extrema_queries.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CatalogError::StoreUnavailable(
                "memory store switched off".into(),
            ))
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.ensure_available()?;
        self.inner
            .read()
            .map_err(|e| CatalogError::Internal(anyhow!("Lock: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.ensure_available()?;
        self.inner
            .write()
            .map_err(|e| CatalogError::Internal(anyhow!("Lock: {}", e)))
    }

    fn extrema_of(observations: &[ObservedTimes]) -> Option<SeriesExtrema> {
        observations
            .iter()
            .map(SeriesExtrema::from_times)
            .reduce(|a, b| a.merge(&b))
    }

    fn set_constellation_disabled(&self, id: ConstellationId, disabled: bool) -> Result<()> {
        let mut state = self.write()?;
        let record = state
            .constellations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| CatalogError::NotFound(format!("constellation {id}")))?;
        record.disabled = disabled;
        Ok(())
    }
}

impl Default for MemoryCatalogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn find_constellations(
        &self,
        procedure: Option<&str>,
        observable_property: Option<&str>,
        offering: Option<&str>,
    ) -> Result<Vec<ObservationConstellation>> {
        let state = self.read()?;
        Ok(state
            .constellations
            .iter()
            .filter(|c| c.matches(procedure, observable_property, offering))
            .cloned()
            .collect())
    }

    async fn save_constellation(
        &self,
        record: &ObservationConstellation,
    ) -> Result<ConstellationId> {
        let mut state = self.write()?;
        match state.constellations.iter_mut().find(|c| c.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => state.constellations.push(record.clone()),
        }
        Ok(record.id)
    }

    async fn disable_constellation(&self, id: ConstellationId) -> Result<()> {
        self.set_constellation_disabled(id, true)
    }

    async fn reenable_constellation(&self, id: ConstellationId) -> Result<()> {
        self.set_constellation_disabled(id, false)
    }

    async fn save_procedure(&self, procedure: &Procedure) -> Result<()> {
        let mut state = self.write()?;
        state
            .procedures
            .insert(procedure.id().to_string(), procedure.clone());
        Ok(())
    }

    async fn disable_procedure(&self, id: &str) -> Result<()> {
        let mut state = self.write()?;
        let procedure = state
            .procedures
            .get_mut(id)
            .ok_or_else(|| CatalogError::NotFound(format!("procedure {id}")))?;
        procedure.disabled = true;
        for c in state.constellations.iter_mut().filter(|c| c.procedure == id) {
            c.disabled = true;
        }
        Ok(())
    }

    async fn save_observable_property(&self, property: &ObservableProperty) -> Result<()> {
        let mut state = self.write()?;
        state
            .properties
            .insert(property.id().to_string(), property.clone());
        Ok(())
    }

    async fn save_offering(&self, offering: &Offering) -> Result<()> {
        let mut state = self.write()?;
        state
            .offerings
            .insert(offering.id().to_string(), offering.clone());
        Ok(())
    }

    async fn save_feature(&self, feature: &Feature) -> Result<()> {
        let mut state = self.write()?;
        state
            .features
            .insert(feature.id().to_string(), feature.clone());
        Ok(())
    }

    async fn record_observations(
        &self,
        series: &SeriesKey,
        batch: &[ObservedTimes],
    ) -> Result<()> {
        let mut state = self.write()?;
        state
            .observations
            .entry(series.clone())
            .or_default()
            .extend_from_slice(batch);
        Ok(())
    }

    async fn delete_series(&self, series: &SeriesKey) -> Result<()> {
        let mut state = self.write()?;
        state.observations.remove(series);
        Ok(())
    }

    async fn fetch_series_keys(&self) -> Result<Vec<SeriesKey>> {
        let state = self.read()?;
        Ok(state.observations.keys().cloned().collect())
    }

    async fn fetch_time_extrema(&self, series: &SeriesKey) -> Result<Option<SeriesExtrema>> {
        self.extrema_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.read()?;
        Ok(state
            .observations
            .get(series)
            .and_then(|obs| Self::extrema_of(obs)))
    }

    async fn fetch_time_extrema_batch(
        &self,
        series: &[SeriesKey],
    ) -> Result<HashMap<SeriesKey, SeriesExtrema>> {
        let state = self.read()?;
        Ok(series
            .iter()
            .filter_map(|key| {
                let obs = state.observations.get(key)?;
                Some((key.clone(), Self::extrema_of(obs)?))
            })
            .collect())
    }

    async fn fetch_procedures(&self) -> Result<Vec<Procedure>> {
        let state = self.read()?;
        Ok(state.procedures.values().cloned().collect())
    }

    async fn fetch_procedure_hierarchy(&self) -> Result<Vec<(String, String)>> {
        let state = self.read()?;
        Ok(state
            .procedures
            .values()
            .filter_map(|p| Some((p.id().to_string(), p.parent.clone()?)))
            .collect())
    }

    async fn fetch_observable_properties(&self) -> Result<Vec<ObservableProperty>> {
        let state = self.read()?;
        Ok(state.properties.values().cloned().collect())
    }

    async fn fetch_offerings(&self) -> Result<Vec<Offering>> {
        let state = self.read()?;
        Ok(state.offerings.values().cloned().collect())
    }

    async fn fetch_offering_membership(&self) -> Result<Vec<(String, String)>> {
        let state = self.read()?;
        let mut pairs: Vec<(String, String)> = state
            .constellations
            .iter()
            .filter(|c| !c.disabled)
            .map(|c| (c.offering.clone(), c.procedure.clone()))
            .collect();
        pairs.sort();
        pairs.dedup();
        Ok(pairs)
    }

    async fn fetch_features(&self) -> Result<Vec<Feature>> {
        let state = self.read()?;
        Ok(state.features.values().cloned().collect())
    }
}

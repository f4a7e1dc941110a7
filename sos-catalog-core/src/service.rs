//! CatalogService: the single write path of the catalog core.
//!
//! Every write follows the same sequence while holding the registry lock:
//! validate, mutate the registry, persist, then send its cache event. The
//! lock is released only after the send, so channel order is commit order. A
//! write that fails validation mutates nothing; a write whose persistence
//! fails is reverted in memory and publishes nothing.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cache::ContentCache;
use crate::checker;
use crate::config::CatalogConfig;
use crate::coordinator::{CoordinatorHandle, UpdateCoordinator};
use crate::error::{CatalogError, Result};
use crate::events::{CacheDelta, CacheEvent, CacheEventSender};
use crate::loader::CacheLoader;
use crate::ports::CatalogStore;
use crate::registry::{ConstellationChange, ConstellationRegistry};
use crate::snapshot::ContentSnapshot;
use crate::types::*;

/// A sensor description: the procedure plus everything it publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorRegistration {
    pub procedure: Procedure,
    pub offerings: Vec<Offering>,
    pub observable_properties: Vec<ObservableProperty>,
    /// Assigned to every new constellation right away when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_type: Option<ObservationType>,
}

#[derive(Debug, Clone)]
pub struct SensorInserted {
    pub procedure: String,
    /// One visible constellation per (offering, property).
    pub constellations: Vec<ObservationConstellation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationInsert {
    /// `None` accepts any procedure registered for the property and offering.
    #[serde(default)]
    pub procedure: Option<String>,
    pub observable_property: String,
    pub offering: String,
    pub feature: Feature,
    pub observation_type: ObservationType,
    /// One entry per observation in the insert batch.
    pub times: Vec<ObservedTimes>,
}

#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn CatalogStore>,
    registry: Arc<Mutex<ConstellationRegistry>>,
    cache: Arc<ContentCache>,
    loader: Arc<CacheLoader>,
    events: CacheEventSender,
}

impl CatalogService {
    /// Wire up registry, cache, loader and event channel. The returned
    /// coordinator must be spawned for cache events to be applied.
    pub fn new(store: Arc<dyn CatalogStore>, config: &CatalogConfig) -> (Self, UpdateCoordinator) {
        let registry = Arc::new(Mutex::new(ConstellationRegistry::new()));
        let cache = Arc::new(ContentCache::new());
        let loader = Arc::new(CacheLoader::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&cache),
            config.extrema_strategy,
        ));
        let (events, receiver) = CacheEventSender::channel(config.event_buffer);
        let coordinator = UpdateCoordinator::new(receiver, Arc::clone(&cache), Arc::clone(&loader));
        (
            Self {
                store,
                registry,
                cache,
                loader,
                events,
            },
            coordinator,
        )
    }

    /// `new`, spawn the coordinator and run the initial full load.
    pub async fn start(
        store: Arc<dyn CatalogStore>,
        config: &CatalogConfig,
    ) -> Result<(Self, CoordinatorHandle)> {
        let (service, coordinator) = Self::new(store, config);
        let handle = coordinator.spawn();
        match service.rebuild().await {
            Ok(generation) => {
                tracing::info!(generation, "catalog service started");
                Ok((service, handle))
            }
            Err(e) => {
                handle.shutdown().await;
                Err(e)
            }
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn snapshot(&self) -> Result<Arc<ContentSnapshot>> {
        self.cache.snapshot()
    }

    pub fn events(&self) -> &CacheEventSender {
        &self.events
    }

    /// Registry lookup, disabled constellations excluded.
    pub async fn lookup(
        &self,
        procedure: Option<&str>,
        observable_property: Option<&str>,
        offering: Option<&str>,
    ) -> Vec<ObservationConstellation> {
        let registry = self.registry.lock().await;
        registry
            .lookup(procedure, observable_property, offering)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Wait until every event sent so far has been applied to the cache.
    pub async fn flush(&self) -> Result<u64> {
        self.events.flush().await
    }

    // ── Rebuild ──────────────────────────────────────────────────

    /// Full rebuild now. Fails with `ConcurrentRebuildInProgress` while
    /// another rebuild is running.
    pub async fn rebuild(&self) -> Result<u64> {
        self.loader.rebuild().await
    }

    /// Queue a rebuild on the coordinator; queued requests coalesce.
    pub async fn request_rebuild(&self) -> Result<()> {
        self.events.request_rebuild().await
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Validate `(procedure?, property, offering)` and assert `proposed` as
    /// its observation type. Returns the primary constellation.
    pub async fn check_and_register(
        &self,
        procedure: Option<&str>,
        observable_property: &str,
        offering: &str,
        proposed: ObservationType,
    ) -> Result<ObservationConstellation> {
        let permit = self.events.reserve().await?;
        let mut registry = self.registry.lock().await;

        let outcome = checker::check(
            &mut registry,
            procedure,
            observable_property,
            offering,
            proposed,
        )?;
        self.persist_or_revert(&mut registry, &outcome.changes).await?;

        if !outcome.changes.is_empty() {
            permit.send(CacheEvent::Inserted(CacheDelta {
                procedure: Some(outcome.primary.procedure.clone()),
                observable_property: Some(observable_property.to_string()),
                offering: Some(offering.to_string()),
                constellations: final_states(&outcome.changes),
                ..Default::default()
            }));
        }
        Ok(outcome.primary)
    }

    pub async fn insert_sensor(&self, registration: SensorRegistration) -> Result<SensorInserted> {
        let SensorRegistration {
            procedure,
            offerings,
            observable_properties,
            observation_type,
        } = registration;
        let procedure_id = procedure.id().to_string();
        if procedure_id.is_empty() {
            return Err(CatalogError::InvalidInput("procedure identifier is empty".into()));
        }
        if offerings.is_empty() || observable_properties.is_empty() {
            return Err(CatalogError::InvalidInput(format!(
                "sensor {procedure_id} needs at least one offering and one observable property"
            )));
        }

        let permit = self.events.reserve().await?;
        let mut registry = self.registry.lock().await;

        registry.check_parent_link(&procedure_id, procedure.parent.as_deref())?;
        if let Some(ty) = observation_type {
            // Disabled records count too: the upsert below re-enables them.
            let existing: Vec<ConstellationId> = registry
                .constellations()
                .iter()
                .filter(|c| {
                    c.procedure == procedure_id
                        && offerings.iter().any(|o| o.id() == c.offering)
                        && observable_properties
                            .iter()
                            .any(|q| q.id() == c.observable_property)
                })
                .map(|c| c.id)
                .collect();
            for id in existing {
                registry.validate_type(id, ty)?;
            }
        }

        // Entity records reach the store before memory changes, so a store
        // failure here leaves nothing to undo.
        let properties: Vec<ObservableProperty> = observable_properties
            .iter()
            .map(|p| registry.merged_observable_property(p))
            .collect();
        self.store.save_procedure(&procedure).await?;
        for offering in &offerings {
            self.store.save_offering(offering).await?;
        }
        for property in &properties {
            self.store.save_observable_property(property).await?;
        }

        registry.register_procedure(procedure.clone())?;
        for offering in &offerings {
            registry.register_offering(offering.clone());
        }
        for property in &properties {
            registry.register_observable_property(property.clone());
        }

        let mut changes = Vec::new();
        if let Err(e) = register_constellations(
            &mut registry,
            &procedure_id,
            &offerings,
            &properties,
            observation_type,
            &mut changes,
        ) {
            registry.revert(&changes);
            return Err(e);
        }
        self.persist_or_revert(&mut registry, &changes).await?;

        let constellations: Vec<ObservationConstellation> = offerings
            .iter()
            .flat_map(|o| properties.iter().map(move |q| (o.id(), q.id())))
            .filter_map(|(o, q)| {
                registry
                    .lookup(Some(&procedure_id), Some(q), Some(o))
                    .first()
                    .map(|c| (*c).clone())
            })
            .collect();

        tracing::info!(
            procedure = %procedure_id,
            offerings = offerings.len(),
            properties = properties.len(),
            changes = changes.len(),
            "sensor inserted"
        );
        permit.send(CacheEvent::Inserted(CacheDelta {
            procedure: Some(procedure_id.clone()),
            constellations: final_states(&changes),
            procedures: vec![procedure],
            observable_properties: properties,
            offerings,
            ..Default::default()
        }));
        drop(registry);
        Ok(SensorInserted {
            procedure: procedure_id,
            constellations,
        })
    }

    /// Soft-disable a procedure and all of its constellations. Returns the
    /// number of constellations disabled.
    pub async fn delete_sensor(&self, procedure: &str) -> Result<usize> {
        let permit = self.events.reserve().await?;
        let mut registry = self.registry.lock().await;
        if registry.procedure(procedure).is_none() {
            return Err(CatalogError::NotFound(format!("procedure {procedure}")));
        }

        self.store.disable_procedure(procedure).await?;
        let changes = registry.disable_procedure(procedure)?;

        tracing::info!(procedure, disabled = changes.len(), "sensor deleted");
        permit.send(CacheEvent::Deleted(CacheDelta {
            procedure: Some(procedure.to_string()),
            constellations: final_states(&changes),
            ..Default::default()
        }));
        drop(registry);
        Ok(changes.len())
    }

    /// Check an observation batch against the registry, record its times and
    /// register its feature of interest if new. Returns the constellation the
    /// observation was filed under.
    pub async fn insert_observation(
        &self,
        observation: ObservationInsert,
    ) -> Result<ObservationConstellation> {
        if observation.times.is_empty() {
            return Err(CatalogError::InvalidInput(format!(
                "observation batch for {} in {} carries no times",
                observation.observable_property, observation.offering
            )));
        }
        let permit = self.events.reserve().await?;
        let mut registry = self.registry.lock().await;

        let outcome = checker::check(
            &mut registry,
            observation.procedure.as_deref(),
            &observation.observable_property,
            &observation.offering,
            observation.observation_type,
        )?;
        let changes = outcome.changes;
        let primary = outcome.primary;
        self.persist_or_revert(&mut registry, &changes).await?;

        let feature = &observation.feature;
        let new_feature = registry.feature(feature.id()).is_none();
        let series = SeriesKey::new(
            &primary.procedure,
            &primary.observable_property,
            feature.id(),
            &primary.offering,
        );
        let recorded = self
            .record(new_feature.then_some(feature), &series, &observation.times)
            .await;
        if let Err(e) = recorded {
            tracing::error!(error = %e, series = %series, "recording observation failed; reverting");
            registry.revert(&changes);
            return Err(e);
        }
        if new_feature {
            registry.register_feature(feature.clone());
        }

        tracing::debug!(series = %series, changes = changes.len(), "observation inserted");
        permit.send(CacheEvent::Inserted(CacheDelta {
            procedure: Some(primary.procedure.clone()),
            observable_property: Some(primary.observable_property.clone()),
            offering: Some(primary.offering.clone()),
            series: Some(series),
            observed_times: observation.times,
            constellations: final_states(&changes),
            features: if new_feature {
                vec![observation.feature]
            } else {
                Vec::new()
            },
            ..Default::default()
        }));
        drop(registry);
        Ok(primary)
    }

    /// Remove all stored observation times of a series. Extrema cannot
    /// shrink incrementally, so the cache is rebuilt.
    pub async fn delete_series(&self, series: &SeriesKey) -> Result<()> {
        let permit = self.events.reserve().await?;
        let _registry = self.registry.lock().await;
        self.store.delete_series(series).await?;
        tracing::info!(series = %series, "series deleted");
        permit.send(CacheEvent::Deleted(CacheDelta {
            series: Some(series.clone()),
            ..Default::default()
        }));
        Ok(())
    }

    // ── Persistence ──────────────────────────────────────────────

    async fn persist_or_revert(
        &self,
        registry: &mut ConstellationRegistry,
        changes: &[ConstellationChange],
    ) -> Result<()> {
        if let Err(e) = self.persist(changes).await {
            tracing::error!(error = %e, changes = changes.len(), "persisting constellation changes failed; reverting");
            registry.revert(changes);
            return Err(e);
        }
        Ok(())
    }

    async fn record(
        &self,
        new_feature: Option<&Feature>,
        series: &SeriesKey,
        batch: &[ObservedTimes],
    ) -> Result<()> {
        if let Some(feature) = new_feature {
            self.store.save_feature(feature).await?;
        }
        self.store.record_observations(series, batch).await
    }

    async fn persist(&self, changes: &[ConstellationChange]) -> Result<()> {
        for change in changes {
            let after = &change.after;
            if change.is_disable() {
                self.store.disable_constellation(after.id).await?;
            } else if is_plain_reenable(change) {
                self.store.reenable_constellation(after.id).await?;
            } else {
                self.store.save_constellation(after).await?;
            }
        }
        Ok(())
    }
}

fn register_constellations(
    registry: &mut ConstellationRegistry,
    procedure: &str,
    offerings: &[Offering],
    properties: &[ObservableProperty],
    observation_type: Option<ObservationType>,
    changes: &mut Vec<ConstellationChange>,
) -> Result<()> {
    for offering in offerings {
        for property in properties {
            let upserted =
                registry.upsert(ConstellationKey::new(procedure, property.id(), offering.id()), false);
            let id = upserted.constellation.id;
            changes.extend(upserted.change);
            if let Some(ty) = observation_type {
                changes.extend(registry.set_observation_type(id, ty)?);
            }
            let resolved = registry
                .get(id)
                .and_then(ObservationConstellation::concrete_type);
            changes.extend(checker::expand_hidden_children(
                registry,
                procedure,
                property.id(),
                offering.id(),
                resolved,
            )?);
        }
    }
    Ok(())
}

/// Re-enabled with nothing else touched.
fn is_plain_reenable(change: &ConstellationChange) -> bool {
    change.is_reenable()
        && change.before.as_ref().is_some_and(|before| {
            ObservationConstellation {
                disabled: false,
                ..before.clone()
            } == change.after
        })
}

/// Last state of each touched constellation, in first-touch order.
fn final_states(changes: &[ConstellationChange]) -> Vec<ObservationConstellation> {
    let mut out: Vec<ObservationConstellation> = Vec::new();
    let mut index: HashMap<ConstellationId, usize> = HashMap::new();
    for change in changes {
        match index.get(&change.after.id) {
            Some(&i) => out[i] = change.after.clone(),
            None => {
                index.insert(change.after.id, out.len());
                out.push(change.after.clone());
            }
        }
    }
    out
}

//! CacheLoader: full rebuild of registry and snapshot from the store.
//!
//! A rebuild holds the registry lock for its whole duration, so no write can
//! interleave with the reload. Only one rebuild runs at a time; a second
//! caller gets `ConcurrentRebuildInProgress` and rides on the running one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};

use crate::cache::{CacheState, ContentCache};
use crate::error::{CatalogError, Result};
use crate::ports::CatalogStore;
use crate::registry::ConstellationRegistry;
use crate::snapshot::ContentSnapshot;
use crate::time_extrema::{ExtremaStrategy, TimeExtremaAggregator};
use crate::types::*;

pub struct CacheLoader {
    store: Arc<dyn CatalogStore>,
    registry: Arc<Mutex<ConstellationRegistry>>,
    cache: Arc<ContentCache>,
    strategy: ExtremaStrategy,
    in_flight: watch::Sender<bool>,
}

impl CacheLoader {
    /// The extrema strategy is probed from the store's capabilities here,
    /// once, unless `override_strategy` pins it.
    pub fn new(
        store: Arc<dyn CatalogStore>,
        registry: Arc<Mutex<ConstellationRegistry>>,
        cache: Arc<ContentCache>,
        override_strategy: Option<ExtremaStrategy>,
    ) -> Self {
        let strategy =
            override_strategy.unwrap_or_else(|| ExtremaStrategy::probe(&store.capabilities()));
        tracing::debug!(?strategy, "time extrema strategy selected");
        Self {
            store,
            registry,
            cache,
            strategy,
            in_flight: watch::channel(false).0,
        }
    }

    pub fn strategy(&self) -> ExtremaStrategy {
        self.strategy
    }

    pub fn is_rebuilding(&self) -> bool {
        *self.in_flight.borrow()
    }

    /// Wait until no rebuild is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    /// Reload everything from the store, replace the registry and publish a
    /// fresh snapshot. Returns the published generation.
    ///
    /// On store failure the registry and the published snapshot are left as
    /// they were; a failed first load puts the cache back to `Uninitialized`.
    pub async fn rebuild(&self) -> Result<u64> {
        let acquired = self.in_flight.send_if_modified(|busy| !std::mem::replace(busy, true));
        if !acquired {
            tracing::warn!("full rebuild already running; request coalesced");
            return Err(CatalogError::ConcurrentRebuildInProgress);
        }

        let mut registry = self.registry.lock().await;
        let result = self.rebuild_locked(&mut registry).await;
        // The flag must clear before the lock is released: a write that
        // lands after this point needs a rebuild of its own.
        self.in_flight.send_replace(false);
        drop(registry);
        result
    }

    async fn rebuild_locked(&self, registry: &mut ConstellationRegistry) -> Result<u64> {
        let Some(from) = self.cache.begin_update() else {
            return Err(CatalogError::CacheNotReady(CacheState::Closed));
        };
        let started = Instant::now();

        let (loaded, extrema) = match self.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(error = %e, from = %from, "full cache rebuild failed; keeping previous snapshot");
                self.cache.abort_update();
                return Err(e);
            }
        };

        let built = ContentSnapshot::build(&loaded, extrema, 0);
        *registry = loaded;
        let generation = self
            .cache
            .publish_with(|current| built.clone().with_generation(current.generation() + 1))
            .ok_or(CatalogError::CacheNotReady(CacheState::Closed))?;

        let stats = built.stats();
        tracing::info!(
            generation,
            procedures = stats.procedures,
            offerings = stats.offerings,
            constellations = stats.constellations,
            series = stats.series,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "full cache rebuild complete"
        );
        Ok(generation)
    }

    async fn load(&self) -> Result<(ConstellationRegistry, TimeExtremaAggregator<SeriesKey>)> {
        let store = self.store.as_ref();
        let mut registry = ConstellationRegistry::new();

        let mut procedures: BTreeMap<String, Procedure> = store
            .fetch_procedures()
            .await?
            .into_iter()
            .map(|p| (p.id().to_string(), p))
            .collect();
        for (child, parent) in store.fetch_procedure_hierarchy().await? {
            match procedures.get_mut(&child) {
                Some(p) => p.parent = Some(parent),
                None => tracing::warn!(%child, %parent, "hierarchy link for unknown procedure"),
            }
        }
        for procedure in procedures.into_values() {
            let id = procedure.id().to_string();
            if let Err(e) = registry.register_procedure(procedure.clone()) {
                tracing::warn!(procedure = %id, error = %e, "dropping cyclic parent link");
                registry.register_procedure(Procedure {
                    parent: None,
                    ..procedure
                })?;
            }
        }

        for property in store.fetch_observable_properties().await? {
            registry.register_observable_property(property);
        }
        for offering in store.fetch_offerings().await? {
            registry.register_offering(offering);
        }
        for feature in store.fetch_features().await? {
            registry.register_feature(feature);
        }
        for record in store.find_constellations(None, None, None).await? {
            registry.insert_loaded(record);
        }

        self.check_membership(&registry).await?;

        let keys = store.fetch_series_keys().await?;
        let extrema = self.strategy.load(store, &keys).await?;
        Ok((registry, extrema))
    }

    /// Cross-check the store's own offering membership against what the
    /// loaded constellations imply. Mismatches are logged, not fatal.
    async fn check_membership(&self, registry: &ConstellationRegistry) -> Result<()> {
        let reported: BTreeSet<(String, String)> = self
            .store
            .fetch_offering_membership()
            .await?
            .into_iter()
            .collect();
        let derived: BTreeSet<(String, String)> = registry
            .lookup(None, None, None)
            .into_iter()
            .map(|c| (c.offering.clone(), c.procedure.clone()))
            .collect();
        for (offering, procedure) in reported.symmetric_difference(&derived) {
            tracing::warn!(%offering, %procedure, "offering membership drift between store and constellations");
        }
        Ok(())
    }
}

//! sos-catalog-daemon: runs the catalog core over an in-memory store.
//!
//! Reads config from env vars (see `CatalogConfig::from_env`):
//!   SOS_CATALOG_SEED_PATH         : YAML seed bundle loaded at startup
//!   SOS_CATALOG_EVENT_BUFFER      : cache event channel capacity
//!   SOS_CATALOG_EXTREMA_STRATEGY  : auto | batch | per_series
//!   SOS_CATALOG_STATS_INTERVAL_MS : cache stats log interval

use std::sync::Arc;

use anyhow::Context;
use sos_catalog_core::{CatalogConfig, CatalogService, CatalogStore, MemoryCatalogStore, SeedBundle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sos_catalog_core=debug".into()),
        )
        .init();

    let config = CatalogConfig::from_env().context("invalid catalog configuration")?;
    tracing::info!(?config, "configuration loaded");

    let store = match &config.seed_path {
        Some(path) => {
            let bundle = SeedBundle::load(path)
                .with_context(|| format!("failed to load seed bundle {}", path.display()))?;
            let hash = bundle.compute_hash().context("failed to hash seed bundle")?;
            tracing::info!(
                path = %path.display(),
                %hash,
                procedures = bundle.procedures.len(),
                constellations = bundle.constellations.len(),
                "seed bundle loaded"
            );
            MemoryCatalogStore::seeded(&bundle).context("failed to seed memory store")?
        }
        None => {
            tracing::info!("no seed bundle configured; starting empty");
            MemoryCatalogStore::new()
        }
    };
    let store: Arc<dyn CatalogStore> = Arc::new(store);

    let (service, coordinator) = CatalogService::start(store, &config)
        .await
        .context("initial cache load failed")?;

    let mut stats_timer = tokio::time::interval(config.stats_interval());
    // Skip the first immediate tick
    stats_timer.tick().await;

    loop {
        tokio::select! {
            _ = stats_timer.tick() => match service.cache().stats() {
                Ok(stats) => tracing::info!(
                    generation = stats.generation,
                    procedures = stats.procedures,
                    offerings = stats.offerings,
                    observable_properties = stats.observable_properties,
                    features = stats.features,
                    constellations = stats.constellations,
                    series = stats.series,
                    "content cache stats"
                ),
                Err(e) => tracing::warn!(error = %e, "content cache stats unavailable"),
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    tracing::info!("shutting down");
    service.cache().close();
    coordinator.shutdown().await;
    Ok(())
}

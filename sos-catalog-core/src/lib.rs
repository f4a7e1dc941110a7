//! Catalog core of a Sensor Observation Service.
//!
//! Maintains the registry of observation constellations (procedure,
//! observable property, offering and the observation type fixed for them),
//! validates incoming data against it, and serves a read-optimized content
//! snapshot that is rebuilt or patched as the catalog changes.
//!
//! # Architecture
//!
//! - [`ConstellationRegistry`] is the in-memory source of truth. Mutations
//!   return before/after change records.
//! - [`checker::check`] validates a data insert and assigns observation types,
//!   all or nothing.
//! - [`CatalogService`] is the single write path: registry lock, check,
//!   persist through [`CatalogStore`], then a [`CacheEvent`].
//! - [`UpdateCoordinator`] consumes events in order and publishes new
//!   [`ContentSnapshot`]s, by patch or by full [`CacheLoader`] rebuild.
//! - Readers call [`ContentCache::snapshot`]; it never blocks.

pub mod cache;
pub mod checker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod loader;
pub mod memory_store;
pub mod ports;
pub mod registry;
pub mod seeds;
pub mod service;
pub mod snapshot;
pub mod time_extrema;
pub mod types;

pub use cache::{CacheState, ContentCache};
pub use config::CatalogConfig;
pub use coordinator::{CoordinatorHandle, UpdateCoordinator};
pub use error::{CatalogError, Result};
pub use events::{CacheDelta, CacheEvent, CacheEventSender};
pub use loader::CacheLoader;
pub use memory_store::MemoryCatalogStore;
pub use ports::{CatalogStore, StoreCapabilities};
pub use registry::{ConstellationChange, ConstellationRegistry};
pub use seeds::SeedBundle;
pub use service::{CatalogService, ObservationInsert, SensorInserted, SensorRegistration};
pub use snapshot::{CacheStats, ContentSnapshot};
pub use time_extrema::{ExtremaStrategy, SeriesExtrema, TimeExtremaAggregator};
pub use types::*;

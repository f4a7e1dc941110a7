//! UpdateCoordinator: background task that turns cache events into
//! published snapshots.
//!
//! Key properties:
//! - Events are applied in channel order, one at a time
//! - Ordinary inserts become an additive patch of the current snapshot
//! - Deletions, drift and explicit requests become one full rebuild
//! - Rebuild requests already queued behind a rebuild are absorbed into it

use std::sync::Arc;

use tokio::sync::{mpsc::error::TryRecvError, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::ContentCache;
use crate::error::CatalogError;
use crate::events::{CacheDelta, CacheEvent, CacheEventReceiver};
use crate::loader::CacheLoader;

pub struct UpdateCoordinator {
    receiver: CacheEventReceiver,
    cache: Arc<ContentCache>,
    loader: Arc<CacheLoader>,
}

/// Handle to a spawned coordinator. Dropping it leaves the task running
/// until every event sender is gone.
pub struct CoordinatorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Stop after the event currently being applied and wait for the task.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.join.await {
            error!(error = %e, "update coordinator task failed");
        }
    }
}

impl UpdateCoordinator {
    pub fn new(
        receiver: CacheEventReceiver,
        cache: Arc<ContentCache>,
        loader: Arc<CacheLoader>,
    ) -> Self {
        Self {
            receiver,
            cache,
            loader,
        }
    }

    pub fn spawn(self) -> CoordinatorHandle {
        let (tx, rx) = oneshot::channel();
        CoordinatorHandle {
            shutdown: Some(tx),
            join: tokio::spawn(self.run(rx)),
        }
    }

    /// Run until `shutdown` fires or every sender has been dropped.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        info!("update coordinator started");
        let mut detached = false;
        loop {
            tokio::select! {
                biased;
                signal = &mut shutdown, if !detached => {
                    if signal.is_ok() {
                        info!("update coordinator shutting down");
                        break;
                    }
                    // Handle dropped without a shutdown; keep draining events.
                    detached = true;
                }
                event = self.receiver.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        info!("cache event channel closed; update coordinator stopping");
                        break;
                    }
                },
            }
        }
    }

    async fn handle(&mut self, event: CacheEvent) {
        match event {
            CacheEvent::Inserted(delta) => self.apply_insert(delta).await,
            CacheEvent::Deleted(delta) => {
                debug!(
                    procedure = delta.procedure.as_deref().unwrap_or("-"),
                    series = %delta.series.as_ref().map(ToString::to_string).unwrap_or_default(),
                    "deletion event; full rebuild"
                );
                self.coalesced_rebuild().await;
            }
            CacheEvent::RebuildRequested => self.coalesced_rebuild().await,
            CacheEvent::Flush(reply) => {
                let _ = reply.send(self.cache.generation());
            }
        }
    }

    async fn apply_insert(&mut self, delta: CacheDelta) {
        if delta.is_empty() {
            return;
        }
        if !self.cache.state().is_serving() {
            // The pending full load reads the store after this write landed.
            debug!(state = %self.cache.state(), "cache not serving; insert left to the full load");
            return;
        }
        let Ok(current) = self.cache.snapshot() else {
            return;
        };
        if !current.can_patch(&delta) {
            warn!(
                procedure = delta.procedure.as_deref().unwrap_or("-"),
                property = delta.observable_property.as_deref().unwrap_or("-"),
                offering = delta.offering.as_deref().unwrap_or("-"),
                "delta cannot be patched into current snapshot; full rebuild"
            );
            self.coalesced_rebuild().await;
            return;
        }
        drop(current);

        if self.cache.begin_update().is_none() {
            return;
        }
        if let Some(generation) = self.cache.publish_with(|current| current.patched(&delta)) {
            debug!(
                generation,
                constellations = delta.constellations.len(),
                series = delta.series.is_some(),
                "incremental snapshot patch published"
            );
        }
    }

    /// Absorb everything already queued, run one rebuild, then answer any
    /// flushes that were waiting behind it.
    async fn coalesced_rebuild(&mut self) {
        let mut absorbed = 0usize;
        let mut flushes = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(CacheEvent::Flush(reply)) => flushes.push(reply),
                // Writers persist before they send, so a reload already
                // covers every queued change.
                Ok(_) => absorbed += 1,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        if absorbed > 0 {
            debug!(absorbed, "queued cache events folded into one rebuild");
        }

        match self.loader.rebuild().await {
            Ok(generation) => debug!(generation, "coordinator rebuild complete"),
            Err(CatalogError::ConcurrentRebuildInProgress) => {
                debug!("rebuild already running; coordinator request coalesced");
                self.loader.wait_idle().await;
            }
            Err(e) => error!(error = %e, "coordinator rebuild failed; previous snapshot kept"),
        }

        let generation = self.cache.generation();
        for reply in flushes {
            let _ = reply.send(generation);
        }
    }
}

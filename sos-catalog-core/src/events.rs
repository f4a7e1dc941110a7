//! Cache events: the explicit channel from the write path to the update
//! coordinator. Channel order is publication order; nothing is dropped.

use tokio::sync::{mpsc, oneshot};

use crate::error::{CatalogError, Result};
use crate::types::*;

/// What a write touched. Identifier fields describe the affected subgraph;
/// the record vectors carry the post-write state so the coordinator can
/// patch the snapshot without reading the registry.
#[derive(Debug, Clone, Default)]
pub struct CacheDelta {
    pub procedure: Option<String>,
    pub observable_property: Option<String>,
    pub offering: Option<String>,
    pub series: Option<SeriesKey>,
    /// Every timestamp of the insert batch, folded into `series` extrema.
    pub observed_times: Vec<ObservedTimes>,
    pub constellations: Vec<ObservationConstellation>,
    pub procedures: Vec<Procedure>,
    pub observable_properties: Vec<ObservableProperty>,
    pub offerings: Vec<Offering>,
    pub features: Vec<Feature>,
}

impl CacheDelta {
    pub fn is_empty(&self) -> bool {
        self.procedure.is_none()
            && self.observable_property.is_none()
            && self.offering.is_none()
            && self.series.is_none()
            && self.constellations.is_empty()
            && self.procedures.is_empty()
            && self.observable_properties.is_empty()
            && self.offerings.is_empty()
            && self.features.is_empty()
    }
}

#[derive(Debug)]
pub enum CacheEvent {
    Inserted(CacheDelta),
    Deleted(CacheDelta),
    RebuildRequested,
    /// Answered with the snapshot generation once every earlier event has
    /// been applied.
    Flush(oneshot::Sender<u64>),
}

/// Receiver end of the cache event channel, owned by the coordinator.
pub type CacheEventReceiver = mpsc::Receiver<CacheEvent>;

/// Cloneable sending half handed to every writer.
#[derive(Debug, Clone)]
pub struct CacheEventSender {
    sender: mpsc::Sender<CacheEvent>,
}

impl CacheEventSender {
    pub fn channel(buffer: usize) -> (Self, CacheEventReceiver) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        (Self { sender }, receiver)
    }

    /// Waits for channel capacity rather than dropping the event.
    pub async fn send(&self, event: CacheEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|_| CatalogError::CoordinatorStopped)
    }

    pub async fn request_rebuild(&self) -> Result<()> {
        self.send(CacheEvent::RebuildRequested).await
    }

    /// Reserve channel capacity up front. Writers take the permit before the
    /// registry lock so a full channel never stalls a lock holder.
    pub async fn reserve(&self) -> Result<CacheEventPermit<'_>> {
        let permit = self
            .sender
            .reserve()
            .await
            .map_err(|_| CatalogError::CoordinatorStopped)?;
        Ok(CacheEventPermit { permit })
    }

    /// Wait until the coordinator has processed everything sent before this
    /// call; returns the snapshot generation at that point.
    pub async fn flush(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(CacheEvent::Flush(tx)).await?;
        rx.await.map_err(|_| CatalogError::CoordinatorStopped)
    }
}

/// Reserved slot in the event channel. Dropping it unused frees the slot.
pub struct CacheEventPermit<'a> {
    permit: mpsc::Permit<'a, CacheEvent>,
}

impl CacheEventPermit<'_> {
    pub fn send(self, event: CacheEvent) {
        self.permit.send(event);
    }
}

//! ContentCache: holder of the current published snapshot.
//!
//! * Readers are wait-free: `snapshot()` is an `ArcSwap` load plus a state check.
//! * Publication is a single pointer swap; a reader that already holds an
//!   `Arc<ContentSnapshot>` keeps a consistent view until it drops it.
//! * Only the loader (full rebuild) and the update coordinator publish.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::error::{CatalogError, Result};
use crate::snapshot::{CacheStats, ContentSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CacheState {
    Uninitialized = 0,
    Loading = 1,
    Ready = 2,
    Updating = 3,
    Closed = 4,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Updating => "updating",
            Self::Closed => "closed",
        }
    }

    /// Whether reads are served in this state.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::Updating)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Loading,
            2 => Self::Ready,
            3 => Self::Updating,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Low byte holds the `CacheState`, the rest counts updates in flight, so a
/// state change and the count it depends on move in one atomic step.
const STATE_BITS: u32 = 8;
const STATE_MASK: usize = (1 << STATE_BITS) - 1;

fn pack(state: CacheState, updates: usize) -> usize {
    (updates << STATE_BITS) | state as usize
}

fn unpack(word: usize) -> (CacheState, usize) {
    (
        CacheState::from_u8((word & STATE_MASK) as u8),
        word >> STATE_BITS,
    )
}

pub struct ContentCache {
    snap: ArcSwap<ContentSnapshot>,
    status: AtomicUsize,
}

impl ContentCache {
    pub fn new() -> Self {
        Self {
            snap: ArcSwap::from_pointee(ContentSnapshot::empty()),
            status: AtomicUsize::new(pack(CacheState::Uninitialized, 0)),
        }
    }

    pub fn state(&self) -> CacheState {
        unpack(self.status.load(Ordering::Acquire)).0
    }

    /// Current snapshot. Fails with `CacheNotReady` before the first
    /// successful load and after `close()`.
    pub fn snapshot(&self) -> Result<Arc<ContentSnapshot>> {
        let state = self.state();
        if !state.is_serving() {
            return Err(CatalogError::CacheNotReady(state));
        }
        Ok(self.snap.load_full())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        Ok(self.snapshot()?.stats())
    }

    /// Generation of the snapshot currently published, served or not.
    pub fn generation(&self) -> u64 {
        self.snap.load().generation()
    }

    /// Mark the start of a full load (first build) or an update (later ones).
    /// Returns the state that was left, or `None` when the cache is closed.
    /// Every `Some` must be matched by one `publish_with` or `abort_update`.
    pub(crate) fn begin_update(&self) -> Option<CacheState> {
        let previous = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (state, updates) = unpack(word);
                let to = match state {
                    CacheState::Closed => return None,
                    CacheState::Uninitialized | CacheState::Loading => CacheState::Loading,
                    CacheState::Ready | CacheState::Updating => CacheState::Updating,
                };
                Some(pack(to, updates + 1))
            })
            .ok()?;
        Some(unpack(previous).0)
    }

    /// Derive the next snapshot from the current one and swap it in. `next`
    /// is retried if another publisher got there first, so it always sees the
    /// latest snapshot. The cache settles to `Ready` once no other update is
    /// in flight. Returns the published generation, or `None` once closed.
    pub(crate) fn publish_with<F>(&self, mut next: F) -> Option<u64>
    where
        F: FnMut(&ContentSnapshot) -> ContentSnapshot,
    {
        if self.state() == CacheState::Closed {
            tracing::debug!("cache closed; snapshot dropped");
            return None;
        }
        let mut generation = 0;
        let previous = self.snap.rcu(|current| {
            let snapshot = next(current.as_ref());
            generation = snapshot.generation();
            Arc::new(snapshot)
        });
        self.finish_update(|_, remaining| {
            if remaining == 0 {
                CacheState::Ready
            } else {
                CacheState::Updating
            }
        });
        tracing::debug!(
            previous = previous.generation(),
            generation,
            "content snapshot published"
        );
        Some(generation)
    }

    /// An update failed. Once no other update is in flight, go back to
    /// serving the previous snapshot, or to `Uninitialized` if nothing was
    /// ever published.
    pub(crate) fn abort_update(&self) {
        self.finish_update(|state, remaining| match state {
            _ if remaining > 0 => state,
            CacheState::Loading => CacheState::Uninitialized,
            CacheState::Updating => CacheState::Ready,
            other => other,
        });
    }

    fn finish_update(&self, settle: impl Fn(CacheState, usize) -> CacheState) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (state, updates) = unpack(word);
                if state == CacheState::Closed {
                    return None;
                }
                let remaining = updates.saturating_sub(1);
                Some(pack(settle(state, remaining), remaining))
            });
    }

    pub fn close(&self) {
        let (previous, _) = unpack(
            self.status
                .swap(pack(CacheState::Closed, 0), Ordering::AcqRel),
        );
        if previous != CacheState::Closed {
            tracing::info!(previous = %previous, "content cache closed");
        }
    }
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new()
    }
}

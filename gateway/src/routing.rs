//! Global routing state shared by the prober, the accept path and the
//! workers.
//!
//! Two atomics carry the whole protocol: the index of the current primary
//! (-1 when none is known) and a monotonically increasing epoch that is
//! bumped on every change of that index, including transitions into and
//! out of "none". An accept that samples (index, epoch) binds the
//! resulting connection to that epoch; a later publication makes the
//! connection stale and workers tear it down on their next observation.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// No primary is currently known.
pub const NO_PRIMARY: i32 = -1;

/// Atomic (primary index, epoch) pair.
///
/// The index is stored with Release ordering before the epoch bump; the
/// accept path loads the index with Acquire, which makes the epoch read
/// from the same sample consistent with it. The epoch itself only needs
/// relaxed ordering because it is always observed after a fresh load of
/// the index.
#[derive(Debug)]
pub struct RoutingState {
    primary: AtomicI32,
    epoch: AtomicU64,
}

impl RoutingState {
    pub const fn new() -> Self {
        Self {
            primary: AtomicI32::new(NO_PRIMARY),
            epoch: AtomicU64::new(0),
        }
    }

    /// Publish a new primary index. Returns the new epoch if the index
    /// actually changed, `None` if the publication was a no-op.
    pub fn publish(&self, primary: Option<usize>) -> Option<u64> {
        let new = primary.map(|i| i as i32).unwrap_or(NO_PRIMARY);
        let cur = self.primary.load(Ordering::Relaxed);
        if new == cur {
            return None;
        }
        self.primary.store(new, Ordering::Release);
        Some(self.epoch.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Sample the routing state once: (primary index, epoch).
    pub fn sample(&self) -> (i32, u64) {
        let primary = self.primary.load(Ordering::Acquire);
        let epoch = self.epoch.load(Ordering::Relaxed);
        (primary, epoch)
    }

    /// Current primary index, if any.
    pub fn primary(&self) -> Option<usize> {
        let idx = self.primary.load(Ordering::Acquire);
        (idx >= 0).then_some(idx as usize)
    }

    /// Current epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }
}

impl Default for RoutingState {
    fn default() -> Self {
        Self::new()
    }
}

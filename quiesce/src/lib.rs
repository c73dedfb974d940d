// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Quiescent-state based grace-period tracking.
//!
//! Worker threads register a [`Reader`] and announce a quiescent point once
//! per loop iteration (or park themselves [`Reader::offline`] for long
//! sleeps).  A reclaimer calls [`Registry::synchronize`] after unpublishing a
//! resource: when it returns, every registered reader has either passed a
//! quiescent point or is offline, so no reader can still hold a reference
//! obtained before the unpublish.  This is a deliberate reimplementation of
//! the userspace-RCU QSBR discipline with plain epochs: no read-side cost
//! beyond one relaxed store per iteration, all waiting on the reclaimer side.

#![deny(clippy::all, clippy::pedantic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

/// Counter value meaning "this reader is offline".
const OFFLINE: u64 = 0;

/// How long the reclaimer naps between polls of reader epochs.
const SYNC_POLL: Duration = Duration::from_micros(50);

#[derive(Debug)]
struct Slot {
    /// Epoch last observed by this reader; [`OFFLINE`] while parked.
    epoch: CachePadded<AtomicU64>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Global epoch. Starts at 1 so that [`OFFLINE`] is never a valid epoch.
    global: AtomicU64,
    readers: Mutex<Vec<Arc<Slot>>>,
}

/// Shared registry of data-plane readers.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

assert_impl_all!(Registry: Send, Sync);
assert_impl_all!(Reader: Send);

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        let inner = Inner {
            global: AtomicU64::new(1),
            readers: Mutex::new(Vec::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Register the calling thread as a reader, initially online.
    #[must_use]
    pub fn register(&self) -> Reader {
        let slot = Arc::new(Slot {
            epoch: CachePadded::new(AtomicU64::new(
                self.inner.global.load(Ordering::SeqCst),
            )),
        });
        self.inner.readers.lock().push(slot.clone());
        Reader {
            slot,
            inner: self.inner.clone(),
        }
    }

    /// Wait for a full grace period.
    ///
    /// On return, every reader registered before the call has either passed a
    /// quiescent point after the call began or is offline.  Must not be
    /// called from a registered reader that is online: that would wait for
    /// its own quiescent point and never return.
    pub fn synchronize(&self) {
        let target = self.inner.global.fetch_add(1, Ordering::SeqCst) + 1;
        let readers: Vec<Arc<Slot>> = self.inner.readers.lock().clone();
        for slot in readers {
            loop {
                let seen = slot.epoch.load(Ordering::SeqCst);
                if seen == OFFLINE || seen >= target {
                    break;
                }
                std::thread::sleep(SYNC_POLL);
            }
        }
    }

    /// Number of currently registered readers. Test and diagnostics use only.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.inner.readers.lock().len()
    }
}

/// A registered reader thread.  Dropping the handle deregisters the thread.
#[derive(Debug)]
pub struct Reader {
    slot: Arc<Slot>,
    inner: Arc<Inner>,
}

impl Reader {
    /// Announce a quiescent point: the thread holds no references to
    /// quiesce-protected state at this instant.
    #[inline]
    pub fn quiescent(&self) {
        self.slot
            .epoch
            .store(self.inner.global.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    /// Park the reader: treated as permanently quiescent until
    /// [`Reader::online`].  Use around coarse sleeps so reclaimers need not
    /// wait for the wakeup.
    pub fn offline(&self) {
        self.slot.epoch.store(OFFLINE, Ordering::SeqCst);
    }

    /// Resume participation after [`Reader::offline`].
    pub fn online(&self) {
        self.quiescent();
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        // a reclaimer may have snapshotted this slot already; park it so a
        // concurrent synchronize() never waits on a gone thread
        self.slot.epoch.store(OFFLINE, Ordering::SeqCst);
        let mut readers = self.inner.readers.lock();
        readers.retain(|slot| !Arc::ptr_eq(slot, &self.slot));
    }
}

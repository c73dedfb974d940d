// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-core forwarding state.
//!
//! One [`CoreState`] per worker core, allocated at engine construction and
//! reused across reassignment. The queue slot tables are the only state the
//! control plane mutates while a worker may be reading them; publication and
//! observation of a slot go through explicit fences (see [`PollSlot`]).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering, fence};

use bitmask::SharedBitmask;
use parking_lot::Mutex;
use power::{RateStats, SleepGovernor};

use crate::burst::PktBurst;
use crate::{
    CryptoEngine, Direction, MAX_RX_QUEUE_PER_CORE, MAX_TX_QUEUE_PER_CORE, NO_OWNER, PortId,
};

/// Load scoring weights: prefer a core's primary hyperthread for receive and
/// its secondary for transmit, and heavily penalize crossing NUMA sockets.
pub(crate) const HT_PENALTY: usize = 1;
pub(crate) const NUMA_PENALTY: usize = 10;
pub(crate) const CRYPTO_PENALTY: usize = 1;

/// Topology of one worker core.
#[derive(Debug, Clone, Copy)]
pub struct CoreSpec {
    /// NUMA socket the core belongs to.
    pub socket: u8,
    /// Whether this is the primary hyperthread of its physical core.
    pub primary: bool,
}

/// One entry of a core's rx or tx queue table.
///
/// A slot is free while `port` reads [`NO_OWNER`]. Publication stores the
/// queue identity first, then issues a release fence, then stores the owner
/// port; readers load the port, and only after an acquire fence trust the
/// rest of the slot. `ring` indexes the port's shared-ring table (tx only).
#[derive(Debug)]
pub(crate) struct PollSlot {
    pub(crate) port: AtomicU16,
    pub(crate) queue: AtomicU16,
    pub(crate) ring: AtomicU16,
    pub(crate) governor: SleepGovernor,
    pub(crate) packets: AtomicU64,
    pub(crate) rate: RateStats,
}

impl PollSlot {
    fn new() -> Self {
        Self {
            port: AtomicU16::new(NO_OWNER),
            queue: AtomicU16::new(0),
            ring: AtomicU16::new(0),
            governor: SleepGovernor::new(),
            packets: AtomicU64::new(0),
            rate: RateStats::new(),
        }
    }
}

pub(crate) struct CoreState<P> {
    pub(crate) id: usize,
    pub(crate) socket: u8,
    pub(crate) primary: bool,
    /// Direct-path hardware tx queue owned by this core (queue 0 is the
    /// control path's).
    pub(crate) tx_qid: u16,
    pub(crate) rx: [PollSlot; MAX_RX_QUEUE_PER_CORE],
    pub(crate) tx: [PollSlot; MAX_TX_QUEUE_PER_CORE],
    /// Per-transmit-slot staging buffers, indexed like `tx` and retained
    /// across loop iterations. A live entry is only touched by the owning
    /// worker; the control plane drains freed ones after a grace period.
    pub(crate) tx_pending: [Mutex<PktBurst<P>>; MAX_TX_QUEUE_PER_CORE],
    /// High-water marks: workers scan `0..high`, slots above have never been
    /// used.
    pub(crate) rx_high: AtomicUsize,
    pub(crate) tx_high: AtomicUsize,
    pub(crate) num_rx: AtomicUsize,
    pub(crate) num_tx: AtomicUsize,
    /// Ports this core forwards for.
    pub(crate) ports: SharedBitmask,
    pub(crate) crypto: Mutex<Vec<Arc<dyn CryptoEngine>>>,
    pub(crate) crypto_count: AtomicUsize,
    pub(crate) crypto_gov: SleepGovernor,
    pub(crate) running: AtomicBool,
}

impl<P> CoreState<P> {
    pub(crate) fn new(id: usize, spec: CoreSpec) -> Self {
        Self {
            id,
            socket: spec.socket,
            primary: spec.primary,
            tx_qid: u16::try_from(id + 1).unwrap_or(u16::MAX),
            rx: std::array::from_fn(|_| PollSlot::new()),
            tx: std::array::from_fn(|_| PollSlot::new()),
            tx_pending: std::array::from_fn(|_| Mutex::new(PktBurst::new())),
            rx_high: AtomicUsize::new(0),
            tx_high: AtomicUsize::new(0),
            num_rx: AtomicUsize::new(0),
            num_tx: AtomicUsize::new(0),
            ports: SharedBitmask::new(),
            crypto: Mutex::new(Vec::new()),
            crypto_count: AtomicUsize::new(0),
            crypto_gov: SleepGovernor::new(),
            running: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn load(&self) -> (usize, usize, usize) {
        (
            self.num_rx.load(Ordering::Relaxed),
            self.num_tx.load(Ordering::Relaxed),
            self.crypto_count.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn has_work(&self) -> bool {
        self.num_rx.load(Ordering::Relaxed) > 0
            || self.num_tx.load(Ordering::Relaxed) > 0
            || self.crypto_count.load(Ordering::Relaxed) > 0
    }

    /// Placement score of this core for one more `dir` queue on `socket`.
    /// Lower is better.
    pub(crate) fn score(&self, socket: u8, dir: Direction) -> usize {
        let mut score = self.num_rx.load(Ordering::Relaxed)
            + self.num_tx.load(Ordering::Relaxed)
            + self.crypto_count.load(Ordering::Relaxed) * CRYPTO_PENALTY;
        let wrong_thread = match dir {
            Direction::Rx => !self.primary,
            Direction::Tx => self.primary,
        };
        if wrong_thread {
            score += HT_PENALTY;
        }
        if self.socket != socket {
            score += NUMA_PENALTY;
        }
        score
    }

    /// Attach `(port, queue)` to this core's `dir` table, reusing a vacated
    /// slot before growing the high-water mark. Returns the slot index.
    ///
    /// # Panics
    /// When the fixed table is exhausted: continuing would corrupt unrelated
    /// slots, so this is fatal.
    pub(crate) fn attach(&self, dir: Direction, port: PortId, queue: u16, ring: u16) -> usize {
        let (slots, high, num): (&[PollSlot], &AtomicUsize, &AtomicUsize) = match dir {
            Direction::Rx => (&self.rx, &self.rx_high, &self.num_rx),
            Direction::Tx => (&self.tx, &self.tx_high, &self.num_tx),
        };
        let mark = high.load(Ordering::Relaxed);
        let idx = (0..mark)
            .find(|i| slots[*i].port.load(Ordering::Relaxed) == NO_OWNER)
            .unwrap_or_else(|| {
                assert!(
                    mark < slots.len(),
                    "core {}: {dir} queue table exhausted",
                    self.id
                );
                high.store(mark + 1, Ordering::Relaxed);
                mark
            });
        let slot = &slots[idx];
        slot.governor.reset();
        slot.rate.reset();
        slot.packets.store(0, Ordering::Relaxed);
        slot.queue.store(queue, Ordering::Relaxed);
        slot.ring.store(ring, Ordering::Relaxed);
        // slot contents must be visible before the owner port publishes it
        fence(Ordering::Release);
        slot.port.store(port, Ordering::Relaxed);
        num.fetch_add(1, Ordering::Relaxed);
        self.ports.set(port as usize);
        idx
    }

    /// Free every slot owned by `port` in both directions and drop the
    /// port-membership bit. Returns the number of slots freed. The freed
    /// slots stay untouched until a grace period has passed.
    pub(crate) fn detach_port(&self, port: PortId) -> usize {
        let mut removed = 0;
        let tables: [(&[PollSlot], &AtomicUsize, &AtomicUsize); 2] = [
            (&self.rx, &self.rx_high, &self.num_rx),
            (&self.tx, &self.tx_high, &self.num_tx),
        ];
        for (slots, high, num) in tables {
            let mark = high.load(Ordering::Relaxed);
            for slot in &slots[..mark] {
                if slot.port.load(Ordering::Relaxed) == port {
                    slot.port.store(NO_OWNER, Ordering::Relaxed);
                    num.fetch_sub(1, Ordering::Relaxed);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            self.ports.clear(port as usize);
        }
        removed
    }

    /// Free the tx slots owned by `port`, keeping its rx assignments.
    pub(crate) fn detach_tx(&self, port: PortId) -> usize {
        let mark = self.tx_high.load(Ordering::Relaxed);
        let mut removed = 0;
        for slot in &self.tx[..mark] {
            if slot.port.load(Ordering::Relaxed) == port {
                slot.port.store(NO_OWNER, Ordering::Relaxed);
                self.num_tx.fetch_sub(1, Ordering::Relaxed);
                removed += 1;
            }
        }
        if removed > 0 && !self.references(port) {
            self.ports.clear(port as usize);
        }
        removed
    }

    /// Free a single tx slot by index (partial-assignment rollback).
    pub(crate) fn detach_tx_slot(&self, idx: usize) {
        let port = self.tx[idx].port.swap(NO_OWNER, Ordering::Relaxed);
        if port == NO_OWNER {
            return;
        }
        self.num_tx.fetch_sub(1, Ordering::Relaxed);
        if !self.references(port) {
            self.ports.clear(port as usize);
        }
    }

    fn references(&self, port: PortId) -> bool {
        let rx_mark = self.rx_high.load(Ordering::Relaxed);
        let tx_mark = self.tx_high.load(Ordering::Relaxed);
        self.rx[..rx_mark]
            .iter()
            .chain(&self.tx[..tx_mark])
            .any(|slot| slot.port.load(Ordering::Relaxed) == port)
    }

    /// Drop retained staging packets targeting `port`. Returns the count.
    /// Only called after a grace period, so the owning worker cannot be
    /// mid-flush.
    pub(crate) fn drain_pending(&self, port: PortId) -> usize {
        let mut drained = 0;
        for pending in &self.tx_pending {
            let mut burst = pending.lock();
            if burst.target_port() == port {
                drained += burst.discard();
            }
        }
        drained
    }
}

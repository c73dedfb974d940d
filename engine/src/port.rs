// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-port resources: static configuration, enabled-queue tracking, shared
//! transmit rings, scheduler attachment, and drop accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::{ArcSwap, ArcSwapOption};
use bitmask::{BITMASK_BITS, Bitmask};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::{MAX_QUEUES_PER_PORT, PktScheduler};

/// Static and administratively mutable configuration of one port.
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// NUMA socket of the device.
    pub socket: u8,
    /// Hardware receive / transmit queue counts.
    pub n_rxq: u16,
    pub n_txq: u16,
    /// Cores permitted to poll this port's receive / transmit queues.
    pub rx_affinity: Bitmask,
    pub tx_affinity: Bitmask,
    /// Poll the transmit path even with nothing buffered. Needed by
    /// link-aggregation control protocols that run off the transmit ring.
    pub tx_always: bool,
}

impl PortConfig {
    /// Configuration with all cores permitted and no transmit-poll
    /// requirement.
    #[must_use]
    pub fn new(socket: u8, n_rxq: u16, n_txq: u16) -> Self {
        let all = Bitmask::first_n(BITMASK_BITS);
        Self {
            socket,
            n_rxq,
            n_txq,
            rx_affinity: all,
            tx_affinity: all,
            tx_always: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DropCounters {
    /// Packets dropped because the hardware queue was full (or the port was
    /// inactive on the direct path).
    pub(crate) full_hwq: AtomicU64,
    /// Packets dropped because a shared software ring was full (or the port
    /// was inactive on the ring path).
    pub(crate) full_txring: AtomicU64,
}

pub(crate) struct PortSlot<P> {
    pub(crate) config: Mutex<PortConfig>,
    /// Whether the port currently has queue assignments.
    pub(crate) is_assigned: AtomicBool,
    /// Direct fast path: every worker writes to its own hardware queue.
    /// Decided at assignment time.
    pub(crate) directpath: AtomicBool,
    pub(crate) tx_always: AtomicBool,
    /// Administrative request to transmit through the shared rings even when
    /// the direct path would be available (bonding and friends own the
    /// device queue). Takes effect immediately on a live port.
    pub(crate) tx_thread: AtomicBool,
    /// Per-queue enable bits reported by the device, one per queue id.
    pub(crate) enabled_rxq: AtomicU64,
    pub(crate) enabled_txq: AtomicU64,
    /// Shared software transmit rings, one per assigned tx queue. Empty on
    /// direct-path or unassigned ports. Replaced wholesale on (un)assignment,
    /// after the grace period on teardown.
    pub(crate) rings: ArcSwap<Vec<Arc<ArrayQueue<P>>>>,
    pub(crate) scheduler: ArcSwapOption<Box<dyn PktScheduler<P>>>,
    pub(crate) drops: DropCounters,
}

/// Enable bits covering queue ids `0..n`.
pub(crate) fn queue_mask(n: u16) -> u64 {
    match usize::from(n) {
        0 => 0,
        n if n >= MAX_QUEUES_PER_PORT => u64::MAX,
        n => (1u64 << n) - 1,
    }
}

impl<P> PortSlot<P> {
    pub(crate) fn new(config: PortConfig) -> Self {
        assert!(
            usize::from(config.n_rxq.max(config.n_txq)) <= MAX_QUEUES_PER_PORT,
            "port exceeds {MAX_QUEUES_PER_PORT} queues"
        );
        let tx_always = config.tx_always;
        let enabled_rxq = AtomicU64::new(queue_mask(config.n_rxq));
        let enabled_txq = AtomicU64::new(queue_mask(config.n_txq));
        Self {
            config: Mutex::new(config),
            is_assigned: AtomicBool::new(false),
            directpath: AtomicBool::new(false),
            tx_always: AtomicBool::new(tx_always),
            tx_thread: AtomicBool::new(false),
            enabled_rxq,
            enabled_txq,
            rings: ArcSwap::from_pointee(Vec::new()),
            scheduler: ArcSwapOption::empty(),
            drops: DropCounters::default(),
        }
    }

    pub(crate) fn assigned(&self) -> bool {
        self.is_assigned.load(Ordering::Relaxed)
    }

    pub(crate) fn is_directpath(&self) -> bool {
        self.directpath.load(Ordering::Relaxed)
    }

    pub(crate) fn tx_always(&self) -> bool {
        self.tx_always.load(Ordering::Relaxed)
    }

    /// Enabled queue ids of one direction, ascending, clipped to the
    /// configured count.
    pub(crate) fn enabled_queues(&self, mask: &AtomicU64, count: u16) -> Vec<u16> {
        let bits = mask.load(Ordering::Relaxed);
        (0..count.min(u16::try_from(MAX_QUEUES_PER_PORT).unwrap_or(u16::MAX)))
            .filter(|q| bits & (1u64 << q) != 0)
            .collect()
    }

    /// Drain and drop everything left in the shared rings, then drop the
    /// rings themselves. Only called after a grace period, so no worker can
    /// still hold one.
    pub(crate) fn reclaim_rings(&self) -> usize {
        let rings = self.rings.swap(Arc::new(Vec::new()));
        let mut drained = 0;
        for ring in rings.iter() {
            while ring.pop().is_some() {
                drained += 1;
            }
        }
        drained
    }
}

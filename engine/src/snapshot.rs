// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Observability snapshots.
//!
//! Lock-free sampling of worker state for the JSON reporting surface. The
//! result is approximate under concurrent mutation by design: counters and
//! slots are read individually, never under a lock the data plane would
//! have to take.

use std::sync::atomic::{Ordering, fence};

use serde::Serialize;

use crate::worker::{CoreState, PollSlot};
use crate::{AssignError, Direction, Engine, NO_OWNER, PacketHandler, PortDriver, PortId};

#[derive(Debug, Serialize)]
pub struct QueueSnapshot {
    pub port: PortId,
    pub queue: u16,
    pub packets: u64,
    pub rate_pps: u64,
    pub nap_us: u32,
}

#[derive(Debug, Serialize)]
pub struct CoreSnapshot {
    pub core: usize,
    pub socket: u8,
    pub running: bool,
    pub crypto_engines: usize,
    pub rx: Vec<QueueSnapshot>,
    pub tx: Vec<QueueSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct DropSnapshot {
    pub port: PortId,
    pub full_hwq: u64,
    pub full_txring: u64,
}

/// Configured affinity plus the cores actually polling the port.
#[derive(Debug, Serialize)]
pub struct PortAffinity {
    pub port: PortId,
    pub rx_affinity: String,
    pub tx_affinity: String,
    pub rx_cores: Vec<usize>,
    pub tx_cores: Vec<usize>,
}

fn sample_slots(slots: &[PollSlot], high: usize) -> Vec<QueueSnapshot> {
    let mut out = Vec::new();
    for slot in &slots[..high] {
        let port = slot.port.load(Ordering::Relaxed);
        if port == NO_OWNER {
            continue;
        }
        fence(Ordering::Acquire);
        let packets = slot.packets.load(Ordering::Relaxed);
        slot.rate.scale(packets);
        out.push(QueueSnapshot {
            port,
            queue: slot.queue.load(Ordering::Relaxed),
            packets,
            rate_pps: slot.rate.rate(),
            nap_us: slot.governor.nap_us(),
        });
    }
    out
}

fn sample_core<P>(core: &CoreState<P>) -> CoreSnapshot {
    CoreSnapshot {
        core: core.id,
        socket: core.socket,
        running: core.is_running(),
        crypto_engines: core.crypto_count.load(Ordering::Relaxed),
        rx: sample_slots(&core.rx, core.rx_high.load(Ordering::Relaxed)),
        tx: sample_slots(&core.tx, core.tx_high.load(Ordering::Relaxed)),
    }
}

impl<P, D, H> Engine<P, D, H>
where
    P: Send + 'static,
    D: PortDriver<P> + 'static,
    H: PacketHandler<P> + 'static,
{
    /// Sample every core's assignment, counters, rates, and nap intervals.
    #[must_use]
    pub fn core_snapshots(&self) -> Vec<CoreSnapshot> {
        self.shared.cores.iter().map(sample_core).collect()
    }

    /// Per-port drop counters.
    #[must_use]
    pub fn drop_snapshots(&self) -> Vec<DropSnapshot> {
        self.shared
            .ports
            .iter()
            .enumerate()
            .map(|(port, slot)| DropSnapshot {
                port: u16::try_from(port).unwrap_or(u16::MAX),
                full_hwq: slot.drops.full_hwq.load(Ordering::Relaxed),
                full_txring: slot.drops.full_txring.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Affinity report for one port: the configured masks next to the cores
    /// actually polling it.
    pub fn port_affinity(&self, port: PortId) -> Result<PortAffinity, AssignError> {
        let slot = self.shared.port_slot(port)?;
        let (rx_affinity, tx_affinity) = {
            let cfg = slot.config.lock();
            (cfg.rx_affinity.to_string(), cfg.tx_affinity.to_string())
        };
        let mut rx_cores: Vec<usize> = self.rx_owners(port).into_iter().map(|(c, _)| c).collect();
        let mut tx_cores: Vec<usize> = self.tx_owners(port).into_iter().map(|(c, _)| c).collect();
        rx_cores.dedup();
        tx_cores.dedup();
        Ok(PortAffinity {
            port,
            rx_affinity,
            tx_affinity,
            rx_cores,
            tx_cores,
        })
    }

    /// The whole observability surface as one JSON document.
    #[must_use]
    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "cores": self.core_snapshots(),
            "drops": self.drop_snapshots(),
            "active_ports": self.active_mask().to_string(),
        })
    }

    /// Queue counts of one direction across all cores; diagnostics use.
    #[must_use]
    pub fn total_assigned(&self, dir: Direction) -> usize {
        self.shared
            .cores
            .iter()
            .map(|core| match dir {
                Direction::Rx => core.num_rx.load(Ordering::Relaxed),
                Direction::Tx => core.num_tx.load(Ordering::Relaxed),
            })
            .sum()
    }
}

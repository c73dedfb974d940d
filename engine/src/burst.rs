// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-core packet burst buffers and the transmit paths built on them.
//!
//! A [`PktBurst`] stages outbound packets for exactly one target at a time.
//! Staging for a different target force-flushes first. A full buffer is
//! flushed best-effort: if the sink accepts nothing the whole burst is
//! dropped and counted, if it accepts a partial count the remainder stays
//! staged at the front in its original order. A force flush (target change,
//! end-of-pass output drain, core shutdown) always drops whatever the sink
//! refuses, since forcing means we cannot wait.
//!
//! Two sinks exist. The device transmit queue is fed from the per-transmit-
//! slot staging buffers, which are retained across loop iterations so a
//! congested device only costs latency, not packets. The port's shared
//! software rings are fed in bursts from the worker output buffer, which is
//! force-drained at the end of every pass.

use std::sync::atomic::Ordering;

use arrayvec::ArrayVec;
use crossbeam::queue::ArrayQueue;
use tracing::trace;

use crate::mask::PortMasks;
use crate::port::PortSlot;
use crate::worker::CoreState;
use crate::{
    AssignError, CTL_TX_QUEUE, Engine, NO_OWNER, PacketHandler, PacketOutput, PortDriver, PortId,
    TX_PKT_BURST,
};

pub(crate) struct PktBurst<P> {
    pub(crate) port: PortId,
    /// Device queue id, or the ring index when the target is a shared ring.
    pub(crate) queue: u16,
    pub(crate) pkts: ArrayVec<P, TX_PKT_BURST>,
}

impl<P> PktBurst<P> {
    pub(crate) fn new() -> Self {
        Self {
            port: NO_OWNER,
            queue: 0,
            pkts: ArrayVec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pkts.len()
    }

    pub(crate) fn target_port(&self) -> PortId {
        self.port
    }

    /// Drop everything staged and forget the target. Returns the count.
    pub(crate) fn discard(&mut self) -> usize {
        let dropped = self.pkts.len();
        self.pkts.clear();
        self.port = NO_OWNER;
        dropped
    }

    #[cfg(test)]
    pub(crate) fn staged(&self) -> (PortId, u16, usize) {
        (self.port, self.queue, self.pkts.len())
    }

    /// Stage one packet for the device queue `(port, queue)`, flushing as
    /// needed. The caller has already checked the active mask.
    pub(crate) fn stage<D: PortDriver<P>>(
        &mut self,
        driver: &D,
        ports: &[PortSlot<P>],
        port: PortId,
        queue: u16,
        pkt: P,
    ) {
        if !self.pkts.is_empty() && (self.port != port || self.queue != queue) {
            // one target at a time
            self.flush(driver, ports, true);
        }
        self.port = port;
        self.queue = queue;
        if self.pkts.is_full() {
            self.flush(driver, ports, false);
        }
        // a flush always leaves room: best-effort either drops everything or
        // hands at least one packet to the sink
        debug_assert!(!self.pkts.is_full());
        self.pkts.push(pkt);
    }

    /// Hand the staged burst to the device.
    pub(crate) fn flush<D: PortDriver<P>>(
        &mut self,
        driver: &D,
        ports: &[PortSlot<P>],
        force: bool,
    ) {
        if self.pkts.is_empty() {
            return;
        }
        let staged = self.pkts.len();
        let accepted = driver.tx_burst(self.port, self.queue, &mut self.pkts);
        debug_assert_eq!(self.pkts.len(), staged - accepted);
        self.settle(ports, force, accepted, false);
    }

    /// Enqueue the staged burst onto a shared ring.
    pub(crate) fn flush_ring(&mut self, ring: &ArrayQueue<P>, ports: &[PortSlot<P>], force: bool) {
        if self.pkts.is_empty() {
            return;
        }
        let staged = self.pkts.len();
        let mut accepted = 0;
        while accepted < staged {
            let pkt = self.pkts.remove(0);
            match ring.push(pkt) {
                Ok(()) => accepted += 1,
                Err(pkt) => {
                    self.pkts.insert(0, pkt);
                    break;
                }
            }
        }
        self.settle(ports, force, accepted, true);
    }

    /// Stage one packet of worker output. `lane` is the core's own device
    /// queue on direct-path ports and the ring index otherwise.
    pub(crate) fn stage_output<D: PortDriver<P>>(
        &mut self,
        driver: &D,
        ports: &[PortSlot<P>],
        port: PortId,
        lane: u16,
        pkt: P,
    ) {
        if !self.pkts.is_empty() && (self.port != port || self.queue != lane) {
            self.flush_output(driver, ports, true);
        }
        self.port = port;
        self.queue = lane;
        if self.pkts.is_full() {
            self.flush_output(driver, ports, false);
        }
        debug_assert!(!self.pkts.is_full());
        self.pkts.push(pkt);
    }

    /// Flush worker output to whichever sink the target port uses.
    pub(crate) fn flush_output<D: PortDriver<P>>(
        &mut self,
        driver: &D,
        ports: &[PortSlot<P>],
        force: bool,
    ) {
        if self.pkts.is_empty() {
            return;
        }
        let Some(slot) = ports.get(self.port as usize) else {
            self.pkts.clear();
            return;
        };
        if slot.is_directpath() {
            self.flush(driver, ports, force);
            return;
        }
        let rings = slot.rings.load();
        if let Some(ring) = rings.get(self.queue as usize) {
            self.flush_ring(ring, ports, force);
        } else {
            // rings reclaimed under us; nowhere left to put these
            let dropped = self.discard();
            slot.drops
                .full_txring
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
    }

    /// Apply the flush outcome: `force` drops any refused remainder;
    /// best-effort retains a partially-refused remainder at the front but
    /// drops the whole burst on a zero accept.
    fn settle(&mut self, ports: &[PortSlot<P>], force: bool, accepted: usize, to_ring: bool) {
        if self.pkts.is_empty() {
            return;
        }
        if force || accepted == 0 {
            let dropped = self.pkts.len();
            self.pkts.clear();
            if let Some(slot) = ports.get(self.port as usize) {
                let counter = if to_ring {
                    &slot.drops.full_txring
                } else {
                    &slot.drops.full_hwq
                };
                counter.fetch_add(dropped as u64, Ordering::Relaxed);
            }
            trace!(port = self.port, queue = self.queue, dropped, to_ring, "tx burst dropped");
        }
    }
}

/// Packet sink for the forwarding loop's processing stage: everything goes
/// through the per-core output burst buffer, targeting the core's own
/// hardware queue on direct-path ports and one of the port's shared rings
/// otherwise.
pub(crate) struct WorkerOutput<'a, P, D> {
    pub(crate) driver: &'a D,
    pub(crate) ports: &'a [PortSlot<P>],
    pub(crate) masks: &'a PortMasks,
    pub(crate) core: &'a CoreState<P>,
    pub(crate) burst: &'a mut PktBurst<P>,
}

impl<P, D: PortDriver<P>> PacketOutput<P> for WorkerOutput<'_, P, D> {
    fn output(&mut self, port: PortId, pkt: P) {
        let Some(slot) = self.ports.get(port as usize) else {
            return;
        };
        if !self.masks.active.is_set(port as usize) {
            // inactive counts like a full queue on whichever path applies
            let counter = if slot.is_directpath() {
                &slot.drops.full_hwq
            } else {
                &slot.drops.full_txring
            };
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let lane = if slot.is_directpath() {
            self.core.tx_qid
        } else {
            let rings = slot.rings.load();
            if rings.is_empty() {
                slot.drops.full_txring.fetch_add(1, Ordering::Relaxed);
                return;
            }
            u16::try_from(self.core.id % rings.len()).unwrap_or(0)
        };
        self.burst
            .stage_output(self.driver, self.ports, port, lane, pkt);
    }
}

impl<P, D, H> Engine<P, D, H>
where
    P: Send + 'static,
    D: PortDriver<P> + 'static,
    H: PacketHandler<P> + 'static,
{
    /// Send one packet from a control (non-worker) context.
    ///
    /// There is no burst buffer here: direct-path ports get a single send on
    /// the control hardware queue under a mutex (several control threads may
    /// share it), shared-path ports get a single ring enqueue. Inactive
    /// ports drop and count exactly like the worker path.
    pub fn output(&self, port: PortId, pkt: P) {
        let Ok(slot) = self.shared.port_slot(port) else {
            return;
        };
        if !self.shared.masks.active.is_set(port as usize) {
            let counter = if slot.is_directpath() {
                &slot.drops.full_hwq
            } else {
                &slot.drops.full_txring
            };
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if slot.is_directpath() {
            let _serialized = self.shared.ctl_tx.lock();
            let mut one: ArrayVec<P, TX_PKT_BURST> = ArrayVec::new();
            one.push(pkt);
            if self.shared.driver.tx_burst(port, CTL_TX_QUEUE, &mut one) == 0 {
                slot.drops.full_hwq.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        let rings = slot.rings.load();
        let rejected = match rings.first() {
            Some(ring) => ring.push(pkt).is_err(),
            None => true,
        };
        if rejected {
            slot.drops.full_txring.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// [`Engine::output`] over a batch.
    pub fn output_burst(&self, port: PortId, pkts: impl IntoIterator<Item = P>) {
        for pkt in pkts {
            self.output(port, pkt);
        }
    }

    /// Drop counters of one port: `(full_hwq, full_txring)`.
    pub fn port_drops(&self, port: PortId) -> Result<(u64, u64), AssignError> {
        let slot = self.shared.port_slot(port)?;
        Ok((
            slot.drops.full_hwq.load(Ordering::Relaxed),
            slot.drops.full_txring.load(Ordering::Relaxed),
        ))
    }
}

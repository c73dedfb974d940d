// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Queue assignment: placing a port's enabled queues onto worker cores.
//!
//! Candidate cores are scored by current load with hyperthread-direction and
//! NUMA penalties; the walk starts at a round-robin cursor so equal scores
//! spread instead of piling onto core 0. Each chosen core is removed from
//! the candidate mask and the mask is refilled from the port affinity once
//! exhausted, giving every permitted core one queue before any gets two.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bitmask::{BITMASK_BITS, Bitmask};
use crossbeam::queue::ArrayQueue;
use tracing::{debug, info};

use crate::worker::CoreState;
use crate::{
    AssignError, Control, Direction, Engine, MAX_QUEUES_PER_PORT, PKT_RING_SIZE, PacketHandler,
    PortConfig, PortDriver, PortId,
};

/// Minimum-score core in `allowed`, visited in wrapping order from the
/// shared cursor; first visited wins ties. Advances the cursor past the
/// chosen core. `None` only for an empty candidate mask.
pub(crate) fn next_available<P>(
    ctl: &mut Control,
    cores: &[CoreState<P>],
    allowed: &Bitmask,
    socket: u8,
    dir: Direction,
) -> Option<usize> {
    let first = allowed.next_set_wrapping(ctl.rr_cursor)?;
    let mut best = first;
    let mut best_score = cores[first].score(socket, dir);
    let mut bit = first;
    loop {
        bit = allowed.next_set_wrapping(bit + 1)?;
        if bit == first {
            break;
        }
        let score = cores[bit].score(socket, dir);
        if score < best_score {
            best = bit;
            best_score = score;
        }
    }
    ctl.rr_cursor = (best + 1) % BITMASK_BITS;
    Some(best)
}

impl<P, D, H> Engine<P, D, H>
where
    P: Send + 'static,
    D: PortDriver<P> + 'static,
    H: PacketHandler<P> + 'static,
{
    /// Assign every enabled queue of `port` to a worker core and start the
    /// cores that received work.
    ///
    /// Receive queues are placed first. Transmit queues are only placed (and
    /// shared rings only created) when the direct path is unavailable: the
    /// direct path needs one hardware tx queue per core plus the control
    /// queue, and is disabled whenever a software scheduler is attached,
    /// because scheduling must consume from a single point. Any failure
    /// rolls the port back to fully unassigned.
    pub fn assign_queues(&self, port: PortId) -> Result<(), AssignError> {
        let shared = &self.shared;
        let mut ctl = shared.control.lock();
        let pslot = shared.port_slot(port)?;
        if pslot.assigned() {
            return Err(AssignError::AlreadyAssigned(port));
        }
        let cfg = pslot.config.lock().clone();
        let online = Bitmask::first_n(shared.cores.len());
        let rxqs = pslot.enabled_queues(&pslot.enabled_rxq, cfg.n_rxq);
        let txqs = pslot.enabled_queues(&pslot.enabled_txq, cfg.n_txq);

        let rx_affinity = cfg.rx_affinity.and(&online);
        let mut allowed = rx_affinity;
        for &queue in &rxqs {
            if allowed.is_empty() {
                allowed = rx_affinity;
            }
            let Some(core) = next_available(&mut ctl, &shared.cores, &allowed, cfg.socket, Direction::Rx)
            else {
                self.abort_assign(port);
                return Err(AssignError::NoCore {
                    port,
                    dir: Direction::Rx,
                    queue,
                });
            };
            allowed.clear(core);
            shared.cores[core].attach(Direction::Rx, port, queue, 0);
            debug!(port, queue, core, "rx queue assigned");
        }

        // one tx queue per worker plus the control queue makes the direct
        // path possible; an attached scheduler or a requested transmit
        // thread forces the shared rings
        let percoreq = txqs.len() >= shared.cores.len() + 1;
        let directpath = percoreq
            && pslot.scheduler.load().is_none()
            && !pslot.tx_thread.load(Ordering::Relaxed);
        pslot.directpath.store(directpath, Ordering::Relaxed);
        pslot.tx_always.store(cfg.tx_always, Ordering::Relaxed);
        if !directpath {
            match self.attach_tx_queues(&mut ctl, port, &cfg, &txqs) {
                Ok(rings) => pslot.rings.store(Arc::new(rings)),
                Err(err) => {
                    self.abort_assign(port);
                    return Err(err);
                }
            }
        }
        pslot.is_assigned.store(true, Ordering::Relaxed);
        for core in 0..shared.cores.len() {
            self.start_core(core);
        }
        drop(ctl);
        self.notify_core_set();
        info!(
            port,
            rx = rxqs.len(),
            tx = txqs.len(),
            directpath,
            "port queues assigned"
        );
        Ok(())
    }

    /// Place the port's transmit queues onto cores and build one shared ring
    /// per queue. On failure every slot attached here is freed again, rx
    /// assignments untouched; the rings were never published, so no grace
    /// period is needed.
    fn attach_tx_queues(
        &self,
        ctl: &mut Control,
        port: PortId,
        cfg: &PortConfig,
        txqs: &[u16],
    ) -> Result<Vec<Arc<ArrayQueue<P>>>, AssignError> {
        let shared = &self.shared;
        let online = Bitmask::first_n(shared.cores.len());
        let tx_affinity = cfg.tx_affinity.and(&online);
        let mut rings = Vec::with_capacity(txqs.len());
        let mut attached: Vec<(usize, usize)> = Vec::with_capacity(txqs.len());
        let mut allowed = tx_affinity;
        for (ring, &queue) in txqs.iter().enumerate() {
            if allowed.is_empty() {
                allowed = tx_affinity;
            }
            let Some(core) =
                next_available(ctl, &shared.cores, &allowed, cfg.socket, Direction::Tx)
            else {
                for (core, slot) in attached {
                    shared.cores[core].detach_tx_slot(slot);
                }
                return Err(AssignError::NoCore {
                    port,
                    dir: Direction::Tx,
                    queue,
                });
            };
            allowed.clear(core);
            let ring_idx = u16::try_from(ring).unwrap_or(u16::MAX);
            let slot = shared.cores[core].attach(Direction::Tx, port, queue, ring_idx);
            attached.push((core, slot));
            rings.push(Arc::new(ArrayQueue::new(PKT_RING_SIZE)));
            debug!(port, queue, core, ring, "tx queue assigned");
        }
        Ok(rings)
    }

    /// Undo a partial assignment: free every slot that references the port
    /// and wait out a grace period so running workers are done with them.
    /// Rings are not yet published at this point, but a worker may have
    /// staged packets for the port already.
    fn abort_assign(&self, port: PortId) {
        for core in &self.shared.cores {
            core.detach_port(port);
        }
        self.shared.quiesce.synchronize();
        for core in &self.shared.cores {
            core.drain_pending(port);
        }
        debug!(port, "assignment rolled back");
    }

    /// Release every queue of `port`, reclaim its rings after a grace
    /// period, and stop workers left with no work. A port with no
    /// assignments is left untouched.
    pub fn unassign_queues(&self, port: PortId) -> Result<(), AssignError> {
        let shared = &self.shared;
        let ctl = shared.control.lock();
        let pslot = shared.port_slot(port)?;
        if !pslot.assigned() {
            return Ok(());
        }
        let mut freed = 0;
        for core in &shared.cores {
            freed += core.detach_port(port);
        }
        pslot.is_assigned.store(false, Ordering::Relaxed);
        pslot.directpath.store(false, Ordering::Relaxed);
        // no worker may be mid-iteration over the freed slots or rings
        // before we drain and drop them
        shared.quiesce.synchronize();
        let mut drained = pslot.reclaim_rings();
        for core in &shared.cores {
            drained += core.drain_pending(port);
        }
        for core in 0..shared.cores.len() {
            if !shared.cores[core].has_work() {
                self.stop_core(core);
            }
        }
        drop(ctl);
        self.notify_core_set();
        info!(port, freed, drained, "port queues unassigned");
        Ok(())
    }

    /// Replace the port's rx/tx affinity masks, reassigning its queues when
    /// they are currently assigned.
    pub fn set_affinity(
        &self,
        port: PortId,
        rx_mask: Bitmask,
        tx_mask: Bitmask,
    ) -> Result<(), AssignError> {
        let was_assigned = self.shared.port_slot(port)?.assigned();
        if was_assigned {
            self.unassign_queues(port)?;
        }
        {
            let pslot = self.shared.port_slot(port)?;
            let mut cfg = pslot.config.lock();
            cfg.rx_affinity = rx_mask;
            cfg.tx_affinity = tx_mask;
        }
        if was_assigned {
            self.assign_queues(port)?;
        }
        Ok(())
    }

    /// Reconfigure the device's queue counts through the driver. The port
    /// must be quiesced; the enabled-queue masks are reset to cover the new
    /// counts.
    pub fn reconfigure_queues(
        &self,
        port: PortId,
        n_rxq: u16,
        n_txq: u16,
    ) -> Result<(), AssignError> {
        let _ctl = self.shared.control.lock();
        let pslot = self.shared.port_slot(port)?;
        if pslot.assigned() {
            return Err(AssignError::NotQuiesced(port));
        }
        self.shared.driver.reconfigure(port, n_rxq, n_txq)?;
        {
            let mut cfg = pslot.config.lock();
            cfg.n_rxq = n_rxq;
            cfg.n_txq = n_txq;
        }
        pslot
            .enabled_rxq
            .store(crate::port::queue_mask(n_rxq), Ordering::Relaxed);
        pslot
            .enabled_txq
            .store(crate::port::queue_mask(n_txq), Ordering::Relaxed);
        info!(port, n_rxq, n_txq, "port queues reconfigured");
        Ok(())
    }

    /// Track a device queue-state event. Takes effect at the next
    /// assignment of the port.
    pub fn set_queue_state(
        &self,
        port: PortId,
        dir: Direction,
        queue: u16,
        enabled: bool,
    ) -> Result<(), AssignError> {
        let pslot = self.shared.port_slot(port)?;
        let mask = match dir {
            Direction::Rx => &pslot.enabled_rxq,
            Direction::Tx => &pslot.enabled_txq,
        };
        if usize::from(queue) >= MAX_QUEUES_PER_PORT {
            return Err(AssignError::BadQueue { port, queue });
        }
        let bit = 1u64 << queue;
        if enabled {
            mask.fetch_or(bit, Ordering::Relaxed);
        } else {
            mask.fetch_and(!bit, Ordering::Relaxed);
        }
        debug!(port, %dir, queue, enabled, "queue state changed");
        Ok(())
    }

    /// Route the port's transmit path through the shared rings even when the
    /// direct path would be available. On an assigned direct-path port the
    /// switch happens live: ring consumers are attached and the rings
    /// published before the transmit mode flips, so worker output always
    /// finds a consumer.
    pub fn enable_transmit_thread(&self, port: PortId) -> Result<(), AssignError> {
        let shared = &self.shared;
        let mut ctl = shared.control.lock();
        let pslot = shared.port_slot(port)?;
        pslot.tx_thread.store(true, Ordering::Relaxed);
        if !pslot.assigned() || !pslot.is_directpath() {
            return Ok(());
        }
        let cfg = pslot.config.lock().clone();
        let txqs = pslot.enabled_queues(&pslot.enabled_txq, cfg.n_txq);
        let rings = self.attach_tx_queues(&mut ctl, port, &cfg, &txqs)?;
        pslot.rings.store(Arc::new(rings));
        pslot.directpath.store(false, Ordering::Relaxed);
        for core in 0..shared.cores.len() {
            self.start_core(core);
        }
        drop(ctl);
        self.notify_core_set();
        info!(port, tx = txqs.len(), "transmit thread enabled");
        Ok(())
    }

    /// Undo [`Engine::enable_transmit_thread`]. An assigned port returns to
    /// the direct path live when nothing else (scheduler, queue shortage)
    /// keeps it on the rings: new output bypasses the rings first, then the
    /// ring consumers are retired and leftovers drained after a grace
    /// period.
    pub fn disable_transmit_thread(&self, port: PortId) -> Result<(), AssignError> {
        let shared = &self.shared;
        let ctl = shared.control.lock();
        let pslot = shared.port_slot(port)?;
        pslot.tx_thread.store(false, Ordering::Relaxed);
        if !pslot.assigned() || pslot.is_directpath() {
            return Ok(());
        }
        let cfg = pslot.config.lock().clone();
        let txqs = pslot.enabled_queues(&pslot.enabled_txq, cfg.n_txq);
        let percoreq = txqs.len() >= shared.cores.len() + 1;
        if !percoreq || pslot.scheduler.load().is_some() {
            // the rings stay mandatory for this port
            return Ok(());
        }
        pslot.directpath.store(true, Ordering::Relaxed);
        let mut freed = 0;
        for core in &shared.cores {
            freed += core.detach_tx(port);
        }
        shared.quiesce.synchronize();
        let mut drained = pslot.reclaim_rings();
        for core in &shared.cores {
            drained += core.drain_pending(port);
        }
        for core in 0..shared.cores.len() {
            if !shared.cores[core].has_work() {
                self.stop_core(core);
            }
        }
        drop(ctl);
        self.notify_core_set();
        info!(port, freed, drained, "transmit thread disabled");
        Ok(())
    }

    /// Attach or detach the software packet scheduler consuming the port's
    /// transmit path. Scheduling needs the shared rings, so a port currently
    /// assigned on the direct path must be quiesced first; a shared-path or
    /// unassigned port takes the change immediately.
    pub fn set_scheduler(
        &self,
        port: PortId,
        scheduler: Option<Box<dyn crate::PktScheduler<P>>>,
    ) -> Result<(), AssignError> {
        let _ctl = self.shared.control.lock();
        let pslot = self.shared.port_slot(port)?;
        if pslot.assigned() && pslot.is_directpath() {
            return Err(AssignError::NotQuiesced(port));
        }
        pslot.scheduler.store(scheduler.map(Arc::new));
        Ok(())
    }

    /// Cores and queue ids currently polling the port's receive queues.
    #[must_use]
    pub fn rx_owners(&self, port: PortId) -> Vec<(usize, u16)> {
        self.owners(port, Direction::Rx)
    }

    /// Cores and queue ids currently owning the port's transmit queues.
    #[must_use]
    pub fn tx_owners(&self, port: PortId) -> Vec<(usize, u16)> {
        self.owners(port, Direction::Tx)
    }

    fn owners(&self, port: PortId, dir: Direction) -> Vec<(usize, u16)> {
        let mut out = Vec::new();
        for core in &self.shared.cores {
            let (slots, high) = match dir {
                Direction::Rx => (&core.rx[..], core.rx_high.load(Ordering::Relaxed)),
                Direction::Tx => (&core.tx[..], core.tx_high.load(Ordering::Relaxed)),
            };
            for slot in &slots[..high] {
                if slot.port.load(Ordering::Relaxed) == port {
                    std::sync::atomic::fence(Ordering::Acquire);
                    out.push((core.id, slot.queue.load(Ordering::Relaxed)));
                }
            }
        }
        out
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The per-core forwarding loop and its power state machine.
//!
//! Each pass runs `idle_thresh` inner poll sequences (receive, crypto,
//! transmit) inside a read-side section, force-drains the burst buffer, and
//! recomputes the power state from the governors:
//!
//! * `Poll` — work is flowing, stay in the tight loop.
//! * `Powersave(us)` — queues are quiet, nap for the minimum recommended
//!   interval across active queues.
//! * `Idle` — every owned port is link-down; park offline for coarse sleeps
//!   so reclamation never waits on this core.
//! * `Exit` — nothing assigned at all; the loop returns and the core is
//!   available for a future restart.

use std::sync::atomic::{Ordering, fence};
use std::time::Duration;

use power::{IDLE_SLEEP, NAP_MAX_US, PowerProfile};
use quiesce::Reader;
use tracing::debug;

use crate::burst::{PktBurst, WorkerOutput};
use crate::worker::{CoreState, PollSlot};
use crate::{
    CRYPTO_PKT_BURST, NO_OWNER, PacketHandler, PortDriver, RX_PKT_BURST, SCHED_PKT_BURST, Shared,
    TX_PKT_BURST,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Poll,
    Powersave(u32),
    Idle,
    Exit,
}

/// Granularity at which long sleeps recheck the stop flag.
const SLEEP_CHUNK: Duration = Duration::from_millis(50);

#[derive(Default)]
struct LoadSummary {
    min_us: Option<u32>,
    /// Any slot owned at all.
    owned: bool,
    /// Any owned port in the active mask.
    active: bool,
    /// Any owned, inactive port whose link is nevertheless up.
    linkup: bool,
}

impl LoadSummary {
    fn observe(
        &mut self,
        slots: &[PollSlot],
        high: usize,
        masks: &crate::mask::PortMasks,
        profile: &PowerProfile,
    ) {
        for slot in &slots[..high] {
            let port = slot.port.load(Ordering::Relaxed);
            if port == NO_OWNER {
                continue;
            }
            fence(Ordering::Acquire);
            self.owned = true;
            if masks.active.is_set(port as usize) {
                self.active = true;
                let us = slot.governor.interval(profile);
                self.min_us = Some(self.min_us.map_or(us, |cur| cur.min(us)));
            } else if masks.linkup.is_set(port as usize) {
                self.linkup = true;
            }
        }
    }
}

/// Pure function from observed load to the next power state.
pub(crate) fn next_state<P, D, H>(
    shared: &Shared<P, D, H>,
    core: &CoreState<P>,
    profile: &PowerProfile,
) -> LoopState {
    if !core.has_work() {
        return LoopState::Exit;
    }
    let mut load = LoadSummary::default();
    load.observe(
        &core.rx,
        core.rx_high.load(Ordering::Relaxed),
        &shared.masks,
        profile,
    );
    load.observe(
        &core.tx,
        core.tx_high.load(Ordering::Relaxed),
        &shared.masks,
        profile,
    );
    if core.crypto_count.load(Ordering::Relaxed) > 0 {
        load.active = true;
        let us = core.crypto_gov.interval(profile);
        load.min_us = Some(load.min_us.map_or(us, |cur| cur.min(us)));
    }
    if !load.active {
        if load.owned && !load.linkup {
            // every owned port is link-down
            return LoopState::Idle;
        }
        // owned ports are up but administratively out of the poll set
        return LoopState::Powersave(NAP_MAX_US);
    }
    let min_us = load.min_us.unwrap_or(0);
    if min_us < profile.min_sleep_us {
        LoopState::Poll
    } else {
        LoopState::Powersave(min_us.min(NAP_MAX_US))
    }
}

fn poll_rx<P, D, H>(
    shared: &Shared<P, D, H>,
    core: &CoreState<P>,
    burst: &mut PktBurst<P>,
    rx_buf: &mut Vec<P>,
) where
    P: Send,
    D: PortDriver<P>,
    H: PacketHandler<P>,
{
    let high = core.rx_high.load(Ordering::Relaxed);
    for slot in &core.rx[..high] {
        let port = slot.port.load(Ordering::Relaxed);
        if port == NO_OWNER {
            continue;
        }
        fence(Ordering::Acquire);
        let queue = slot.queue.load(Ordering::Relaxed);
        if !shared.masks.active.is_set(port as usize) {
            continue;
        }
        shared.driver.rx_burst(port, queue, rx_buf, RX_PKT_BURST);
        let count = rx_buf.len();
        slot.governor.update(count);
        if count == 0 {
            continue;
        }
        slot.packets.fetch_add(count as u64, Ordering::Relaxed);
        let mut out = WorkerOutput {
            driver: &shared.driver,
            ports: &shared.ports,
            masks: &shared.masks,
            core,
            burst,
        };
        for pkt in rx_buf.drain(..) {
            shared.handler.process(port, pkt, &mut out);
        }
    }
}

fn poll_crypto<P>(core: &CoreState<P>) {
    if core.crypto_count.load(Ordering::Relaxed) == 0 {
        return;
    }
    let engines = core.crypto.lock();
    let mut completed = 0;
    for engine in engines.iter() {
        completed += engine.poll(CRYPTO_PKT_BURST);
    }
    core.crypto_gov.update(completed);
}

fn poll_tx<P, D, H>(shared: &Shared<P, D, H>, core: &CoreState<P>)
where
    P: Send,
    D: PortDriver<P>,
    H: PacketHandler<P>,
{
    let high = core.tx_high.load(Ordering::Relaxed);
    for (i, slot) in core.tx[..high].iter().enumerate() {
        let port = slot.port.load(Ordering::Relaxed);
        if port == NO_OWNER {
            continue;
        }
        fence(Ordering::Acquire);
        let queue = slot.queue.load(Ordering::Relaxed);
        let ring_idx = slot.ring.load(Ordering::Relaxed) as usize;
        if !shared.masks.active.is_set(port as usize) {
            continue;
        }
        let Some(pslot) = shared.ports.get(port as usize) else {
            continue;
        };
        let rings = pslot.rings.load();
        let Some(ring) = rings.get(ring_idx) else {
            continue;
        };
        let scheduler = pslot.scheduler.load();
        // software scheduling consumes from a single point: ring 0
        let routed = scheduler.is_some() && ring_idx == 0;
        let max = if routed { SCHED_PKT_BURST } else { TX_PKT_BURST };
        let mut pulled: Vec<P> = Vec::with_capacity(max);
        while pulled.len() < max {
            match ring.pop() {
                Some(pkt) => pulled.push(pkt),
                None => break,
            }
        }
        let count = pulled.len();
        slot.governor.update(count);
        // the slot's staging buffer persists across iterations: a congested
        // device keeps its refused remainder for the next pass
        let mut pending = core.tx_pending[i].lock();
        if count > 0 {
            slot.packets.fetch_add(count as u64, Ordering::Relaxed);
            let to_send = match (&*scheduler, routed) {
                (Some(sched), true) => sched.schedule(port, queue, pulled, TX_PKT_BURST),
                _ => pulled,
            };
            for pkt in to_send {
                pending.stage(&shared.driver, &shared.ports, port, queue, pkt);
            }
        }
        if !pending.is_empty() {
            pending.flush(&shared.driver, &shared.ports, false);
        } else if pslot.tx_always() {
            // give transmit-poll devices an empty burst to run on
            let mut none = arrayvec::ArrayVec::new();
            let _ = shared.driver.tx_burst(port, queue, &mut none);
        }
    }
}

/// Coarse offline sleep; wakes early when the core is told to stop.
fn idle_nap<P>(core: &CoreState<P>, reader: &Reader) {
    reader.offline();
    let mut remaining = IDLE_SLEEP;
    while !remaining.is_zero() && core.running.load(Ordering::SeqCst) {
        let chunk = remaining.min(SLEEP_CHUNK);
        std::thread::sleep(chunk);
        remaining -= chunk;
    }
    reader.online();
}

/// Body of one worker thread.
pub(crate) fn run<P, D, H>(shared: &Shared<P, D, H>, core: &CoreState<P>)
where
    P: Send + 'static,
    D: PortDriver<P>,
    H: PacketHandler<P>,
{
    let reader = shared.quiesce.register();
    let mut burst = PktBurst::new();
    let mut rx_buf: Vec<P> = Vec::with_capacity(RX_PKT_BURST);
    debug!(core = core.id, "forwarding loop running");
    loop {
        let profile = shared.profile.load_full();
        match next_state(shared, core, &profile) {
            LoopState::Exit => {
                // clear the run flag ourselves, then recheck: work assigned
                // between the state computation and the store would otherwise
                // be orphaned by a starter that still saw the flag set
                core.running.store(false, Ordering::SeqCst);
                if core.has_work() && !core.running.swap(true, Ordering::SeqCst) {
                    continue;
                }
                break;
            }
            LoopState::Idle => idle_nap(core, &reader),
            LoopState::Powersave(us) => {
                reader.quiescent();
                std::thread::sleep(Duration::from_micros(u64::from(us)));
            }
            LoopState::Poll => reader.quiescent(),
        }
        if !core.running.load(Ordering::SeqCst) {
            break;
        }
        // amortize state recomputation across several poll sequences
        for _ in 0..profile.idle_thresh.max(1) {
            poll_rx(shared, core, &mut burst, &mut rx_buf);
            poll_crypto(core);
            poll_tx(shared, core);
        }
        // packets generated outside the tx loop (e.g. by processing a
        // receive burst on a direct-path port) must not sit across a sleep
        burst.flush_output(&shared.driver, &shared.ports, true);
    }
    burst.flush_output(&shared.driver, &shared.ports, true);
    for pending in &core.tx_pending {
        pending.lock().flush(&shared.driver, &shared.ports, true);
    }
    debug!(core = core.id, "forwarding loop exited");
}

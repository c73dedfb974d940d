// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! End-to-end engine behavior over a scripted test driver.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use fastpath_engine::{
    AssignError, Bitmask, CoreSpec, CryptoEngine, Direction, DriverError, Engine, PacketHandler,
    PacketOutput, PktScheduler, PortConfig, PortDriver, PortId, PowerProfile, TX_PKT_BURST,
};
use parking_lot::Mutex;
use tracing_test::traced_test;

type Pkt = u32;

#[derive(Default)]
struct DriverState {
    rx: Mutex<HashMap<(PortId, u16), VecDeque<Pkt>>>,
    sent: Mutex<Vec<(PortId, u16, Pkt)>>,
    /// Scripted per-call acceptance caps; exhausted means accept everything.
    accepts: Mutex<VecDeque<usize>>,
    empty_polls: Mutex<Vec<(PortId, u16)>>,
    reconfigured: Mutex<Vec<(PortId, u16, u16)>>,
}

#[derive(Clone, Default)]
struct TestDriver {
    state: Arc<DriverState>,
}

impl TestDriver {
    fn seed_rx(&self, port: PortId, queue: u16, pkts: impl IntoIterator<Item = Pkt>) {
        self.state
            .rx
            .lock()
            .entry((port, queue))
            .or_default()
            .extend(pkts);
    }

    fn sent(&self) -> Vec<(PortId, u16, Pkt)> {
        self.state.sent.lock().clone()
    }

    fn script_accepts(&self, caps: impl IntoIterator<Item = usize>) {
        self.state.accepts.lock().extend(caps);
    }

    fn empty_polls(&self) -> usize {
        self.state.empty_polls.lock().len()
    }
}

impl PortDriver<Pkt> for TestDriver {
    fn rx_burst(&self, port: PortId, queue: u16, buf: &mut Vec<Pkt>, max: usize) {
        let mut rx = self.state.rx.lock();
        if let Some(pending) = rx.get_mut(&(port, queue)) {
            while buf.len() < max {
                match pending.pop_front() {
                    Some(pkt) => buf.push(pkt),
                    None => break,
                }
            }
        }
    }

    fn tx_burst(&self, port: PortId, queue: u16, pkts: &mut ArrayVec<Pkt, TX_PKT_BURST>) -> usize {
        if pkts.is_empty() {
            self.state.empty_polls.lock().push((port, queue));
            return 0;
        }
        let cap = match self.state.accepts.lock().pop_front() {
            Some(cap) => cap.min(pkts.len()),
            None => pkts.len(),
        };
        let mut sent = self.state.sent.lock();
        for pkt in pkts.drain(..cap) {
            sent.push((port, queue, pkt));
        }
        cap
    }

    fn reconfigure(&self, port: PortId, n_rxq: u16, n_txq: u16) -> Result<(), DriverError> {
        self.state.reconfigured.lock().push((port, n_rxq, n_txq));
        Ok(())
    }
}

/// Forwards every packet to a fixed output port.
struct EchoHandler {
    to: PortId,
}

impl PacketHandler<Pkt> for EchoHandler {
    fn process(&self, _port: PortId, pkt: Pkt, out: &mut dyn PacketOutput<Pkt>) {
        out.output(self.to, pkt);
    }
}

struct TestCrypto;

impl CryptoEngine for TestCrypto {
    fn socket(&self) -> u8 {
        0
    }

    fn poll(&self, _max: usize) -> usize {
        0
    }
}

/// Pass-through scheduler recording every batch it is offered.
struct RecordingSched {
    calls: Arc<Mutex<Vec<(PortId, u16, usize)>>>,
}

impl PktScheduler<Pkt> for RecordingSched {
    fn schedule(&self, port: PortId, queue: u16, pkts: Vec<Pkt>, max_out: usize) -> Vec<Pkt> {
        self.calls.lock().push((port, queue, pkts.len()));
        pkts.into_iter().take(max_out).collect()
    }
}

fn cores(n: usize) -> Vec<CoreSpec> {
    (0..n)
        .map(|_| CoreSpec {
            socket: 0,
            primary: true,
        })
        .collect()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn active_mask_follows_link_and_poll() {
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 1, 1)],
        PowerProfile::balanced(),
    );
    // poll-enabled by default, link starts down
    assert!(engine.poll_mask().is_set(0));
    assert!(!engine.active_mask().is_set(0));

    engine.link_up(0).unwrap();
    assert!(engine.active_mask().is_set(0));

    engine.link_down(0).unwrap();
    assert!(!engine.active_mask().is_set(0));
    assert!(engine.poll_mask().is_set(0), "link events leave poll alone");

    engine.link_up(0).unwrap();
    engine.disable_poll(0).unwrap();
    assert!(!engine.active_mask().is_set(0));
    assert!(engine.linkup_mask().is_set(0));
    engine.enable_poll(0).unwrap();
    assert_eq!(
        engine.active_mask(),
        engine.poll_mask().and(&engine.linkup_mask())
    );
    engine.shutdown();
}

#[test]
fn assign_partitions_enabled_queues() {
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(2),
        vec![PortConfig::new(0, 3, 2)],
        PowerProfile::balanced(),
    );
    engine.assign_queues(0).unwrap();
    let mut rx: Vec<u16> = engine.rx_owners(0).into_iter().map(|(_, q)| q).collect();
    rx.sort_unstable();
    assert_eq!(rx, vec![0, 1, 2], "every enabled rx queue owned exactly once");
    let mut tx: Vec<u16> = engine.tx_owners(0).into_iter().map(|(_, q)| q).collect();
    tx.sort_unstable();
    assert_eq!(tx, vec![0, 1]);
    assert_eq!(engine.total_assigned(Direction::Rx), 3);
    assert_eq!(engine.total_assigned(Direction::Tx), 2);

    assert_eq!(engine.assign_queues(0), Err(AssignError::AlreadyAssigned(0)));
    engine.shutdown();
}

#[test]
fn unassign_restores_core_counts() {
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(2),
        vec![PortConfig::new(0, 4, 2)],
        PowerProfile::balanced(),
    );
    engine.assign_queues(0).unwrap();
    engine.unassign_queues(0).unwrap();
    for core in 0..2 {
        assert_eq!(engine.core_load(core), Some((0, 0, 0)));
    }
    assert!(engine.forwarding_cores().is_empty());
    // a second unassign is a no-op
    engine.unassign_queues(0).unwrap();
    // and the port can be assigned again
    engine.assign_queues(0).unwrap();
    assert_eq!(engine.total_assigned(Direction::Rx), 4);
    engine.shutdown();
}

#[test]
fn equal_scores_distribute_round_robin() {
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(2),
        vec![PortConfig::new(0, 4, 0)],
        PowerProfile::balanced(),
    );
    engine.assign_queues(0).unwrap();
    let owners = engine.rx_owners(0);
    assert_eq!(owners.len(), 4);
    let on_core0 = owners.iter().filter(|(c, _)| *c == 0).count();
    let on_core1 = owners.iter().filter(|(c, _)| *c == 1).count();
    assert_eq!((on_core0, on_core1), (2, 2));
    engine.shutdown();
}

#[test]
fn failed_tx_assignment_rolls_back_rx() {
    let mut cfg = PortConfig::new(0, 2, 1);
    cfg.tx_affinity = Bitmask::new();
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(2),
        vec![cfg],
        PowerProfile::balanced(),
    );
    let err = engine.assign_queues(0).unwrap_err();
    assert_eq!(
        err,
        AssignError::NoCore {
            port: 0,
            dir: Direction::Tx,
            queue: 0
        }
    );
    assert_eq!(engine.total_assigned(Direction::Rx), 0);
    assert_eq!(engine.total_assigned(Direction::Tx), 0);
    assert!(engine.rx_owners(0).is_empty());

    // widening the affinity makes the same port assignable
    engine
        .set_affinity(0, Bitmask::first_n(2), Bitmask::first_n(2))
        .unwrap();
    engine.assign_queues(0).unwrap();
    assert_eq!(engine.total_assigned(Direction::Rx), 2);
    engine.shutdown();
}

#[test]
fn crypto_assignment_starts_and_stops_idle_core() {
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(1),
        Vec::new(),
        PowerProfile::balanced(),
    );
    assert!(!engine.core_running(0));
    let core = engine.assign_crypto_engine(Arc::new(TestCrypto)).unwrap();
    assert_eq!(core, 0);
    assert!(engine.core_running(0));
    assert_eq!(engine.core_load(0), Some((0, 0, 1)));

    engine.unassign_crypto_engine(0).unwrap();
    assert!(!engine.core_running(0));
    assert_eq!(engine.core_load(0), Some((0, 0, 0)));
    engine.shutdown();
}

#[test]
fn sticky_crypto_mask_restricts_placement() {
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(2),
        Vec::new(),
        PowerProfile::balanced(),
    );
    let mut only_one = Bitmask::new();
    only_one.set(1);
    engine.set_crypto_cores(Some(only_one));
    assert_eq!(engine.assign_crypto_engine(Arc::new(TestCrypto)), Ok(1));
    assert_eq!(engine.assign_crypto_engine(Arc::new(TestCrypto)), Ok(1));
    engine.set_crypto_cores(Some(Bitmask::new()));
    assert_eq!(
        engine.assign_crypto_engine(Arc::new(TestCrypto)),
        Err(AssignError::NoCryptoCore)
    );
    engine.shutdown();
}

#[traced_test]
#[test]
fn packets_flow_rx_to_tx_over_shared_rings() {
    let driver = TestDriver::default();
    let engine = Engine::new(
        driver.clone(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 1, 1)],
        PowerProfile::balanced(),
    );
    driver.seed_rx(0, 0, 1..=10);
    engine.link_up(0).unwrap();
    engine.assign_queues(0).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || driver.sent().len() == 10),
        "expected 10 transmitted packets, saw {:?}",
        driver.sent()
    );
    let sent = driver.sent();
    assert!(sent.iter().all(|(port, queue, _)| *port == 0 && *queue == 0));
    let payloads: Vec<Pkt> = sent.iter().map(|(_, _, p)| *p).collect();
    assert_eq!(payloads, (1..=10).collect::<Vec<Pkt>>());

    engine.unassign_queues(0).unwrap();
    assert!(!engine.core_running(0));
    engine.shutdown();
}

#[traced_test]
#[test]
fn refused_tx_remainder_is_retried_not_dropped() {
    let driver = TestDriver::default();
    let engine = Engine::new(
        driver.clone(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 1, 1)],
        PowerProfile::balanced(),
    );
    // the device accepts three packets of the first burst, then everything
    driver.script_accepts([3]);
    driver.seed_rx(0, 0, 1..=10);
    engine.link_up(0).unwrap();
    engine.assign_queues(0).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || driver.sent().len() == 10),
        "refused packets must be retried on later passes, saw {:?}",
        driver.sent()
    );
    let payloads: Vec<Pkt> = driver.sent().iter().map(|(_, _, p)| *p).collect();
    assert_eq!(payloads, (1..=10).collect::<Vec<Pkt>>(), "order preserved");
    assert_eq!(engine.port_drops(0).unwrap(), (0, 0));
    engine.shutdown();
}

#[traced_test]
#[test]
fn transmit_thread_toggles_live_port() {
    let driver = TestDriver::default();
    let engine = Engine::new(
        driver.clone(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 1, 2)],
        PowerProfile::balanced(),
    );
    engine.link_up(0).unwrap();
    engine.assign_queues(0).unwrap();
    // two tx queues for one core: direct path, no ring consumers
    assert!(engine.tx_owners(0).is_empty());

    engine.enable_transmit_thread(0).unwrap();
    assert_eq!(engine.tx_owners(0).len(), 2, "rings attached on the live port");
    driver.seed_rx(0, 0, 1..=4);
    assert!(wait_until(Duration::from_secs(5), || driver.sent().len() == 4));

    engine.disable_transmit_thread(0).unwrap();
    assert!(engine.tx_owners(0).is_empty(), "ring consumers retired");
    driver.seed_rx(0, 0, 5..=8);
    assert!(wait_until(Duration::from_secs(5), || driver.sent().len() == 8));
    // back on the direct path: the worker writes its own hardware queue
    let tail = driver.sent()[4..].to_vec();
    assert!(tail.iter().all(|(_, queue, _)| *queue == 1));
    assert_eq!(engine.port_drops(0).unwrap(), (0, 0));
    engine.shutdown();
}

#[test]
fn transmit_thread_flag_applies_at_assignment() {
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 1, 2)],
        PowerProfile::balanced(),
    );
    // requested while unassigned: honored when the queues are placed
    engine.enable_transmit_thread(0).unwrap();
    engine.assign_queues(0).unwrap();
    assert_eq!(engine.tx_owners(0).len(), 2);
    engine.shutdown();
}

#[traced_test]
#[test]
fn worker_restarts_across_rapid_reassignment() {
    let driver = TestDriver::default();
    let engine = Engine::new(
        driver.clone(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 1, 1)],
        PowerProfile::low_latency(),
    );
    engine.link_up(0).unwrap();
    // exercise the window between a loop deciding to exit and the run flag
    // clearing, which used to leave a freshly assigned core without a worker
    for _ in 0..20 {
        engine.assign_queues(0).unwrap();
        engine.unassign_queues(0).unwrap();
    }
    engine.assign_queues(0).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || engine.core_running(0)),
        "a core with work must end up running"
    );
    driver.seed_rx(0, 0, 1..=5);
    assert!(wait_until(Duration::from_secs(5), || driver.sent().len() == 5));
    engine.shutdown();
}

#[traced_test]
#[test]
fn scheduler_routes_shared_ring_consumption() {
    let driver = TestDriver::default();
    let calls: Arc<Mutex<Vec<(PortId, u16, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let engine = Engine::new(
        driver.clone(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 1, 1)],
        PowerProfile::balanced(),
    );
    engine
        .set_scheduler(0, Some(Box::new(RecordingSched { calls: calls.clone() })))
        .unwrap();
    driver.seed_rx(0, 0, 1..=5);
    engine.link_up(0).unwrap();
    engine.assign_queues(0).unwrap();

    assert!(wait_until(Duration::from_secs(5), || driver.sent().len() == 5));
    let calls = calls.lock();
    assert!(!calls.is_empty(), "every transmitted packet went through the scheduler");
    assert!(calls.iter().all(|(port, queue, _)| *port == 0 && *queue == 0));
    assert_eq!(calls.iter().map(|(_, _, n)| n).sum::<usize>(), 5);
    engine.shutdown();
}

#[test]
fn transmit_poll_ports_get_empty_bursts() {
    let driver = TestDriver::default();
    let mut cfg = PortConfig::new(0, 1, 1);
    cfg.tx_always = true;
    let engine = Engine::new(
        driver.clone(),
        EchoHandler { to: 0 },
        cores(1),
        vec![cfg],
        PowerProfile::balanced(),
    );
    engine.link_up(0).unwrap();
    engine.assign_queues(0).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || driver.empty_polls() > 0),
        "an idle transmit-poll port must still see transmit bursts"
    );
    assert!(driver.sent().is_empty());
    engine.shutdown();
}

#[test]
fn output_to_inactive_port_counts_drop() {
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 1, 1)],
        PowerProfile::balanced(),
    );
    // link down: shared-path accounting
    engine.output(0, 7);
    assert_eq!(engine.port_drops(0).unwrap(), (0, 1));
    // active but unassigned: no rings to enqueue onto
    engine.link_up(0).unwrap();
    engine.output_burst(0, [8, 9]);
    assert_eq!(engine.port_drops(0).unwrap(), (0, 3));
    engine.shutdown();
}

#[test]
fn reconfigure_requires_quiesced_port() {
    let driver = TestDriver::default();
    let engine = Engine::new(
        driver.clone(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 1, 1)],
        PowerProfile::balanced(),
    );
    engine.assign_queues(0).unwrap();
    assert_eq!(
        engine.reconfigure_queues(0, 2, 2),
        Err(AssignError::NotQuiesced(0))
    );
    engine.unassign_queues(0).unwrap();
    engine.reconfigure_queues(0, 2, 2).unwrap();
    assert_eq!(driver.state.reconfigured.lock().as_slice(), &[(0, 2, 2)]);
    engine.assign_queues(0).unwrap();
    assert_eq!(engine.total_assigned(Direction::Rx), 2);
    engine.shutdown();
}

#[test]
fn disabled_queue_is_skipped_at_assignment() {
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 4, 0)],
        PowerProfile::balanced(),
    );
    engine
        .set_queue_state(0, Direction::Rx, 2, false)
        .unwrap();
    engine.assign_queues(0).unwrap();
    let mut queues: Vec<u16> = engine.rx_owners(0).into_iter().map(|(_, q)| q).collect();
    queues.sort_unstable();
    assert_eq!(queues, vec![0, 1, 3]);
    // queue ids beyond the tracked range are rejected, not folded in
    assert_eq!(
        engine.set_queue_state(0, Direction::Rx, 64, false),
        Err(AssignError::BadQueue { port: 0, queue: 64 })
    );
    engine.shutdown();
}

#[test]
fn core_set_observer_fires_asynchronously() {
    let seen: Arc<Mutex<Vec<Bitmask>>> = Arc::new(Mutex::new(Vec::new()));
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(1),
        vec![PortConfig::new(0, 1, 0)],
        PowerProfile::balanced(),
    );
    let sink = seen.clone();
    engine.set_core_set_observer(move |set| sink.lock().push(set));
    engine.assign_queues(0).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        seen.lock().iter().any(|set| set.is_set(0))
    }));
    engine.unassign_queues(0).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        seen.lock().last().is_some_and(Bitmask::is_empty)
    }));
    engine.shutdown();
}

#[test]
fn snapshot_reports_assignment_shape() {
    let engine = Engine::new(
        TestDriver::default(),
        EchoHandler { to: 0 },
        cores(2),
        vec![PortConfig::new(0, 2, 1)],
        PowerProfile::balanced(),
    );
    engine.assign_queues(0).unwrap();
    let snaps = engine.core_snapshots();
    assert_eq!(snaps.len(), 2);
    let rx_total: usize = snaps.iter().map(|core| core.rx.len()).sum();
    let tx_total: usize = snaps.iter().map(|core| core.tx.len()).sum();
    assert_eq!((rx_total, tx_total), (2, 1));

    let affinity = engine.port_affinity(0).unwrap();
    assert_eq!(affinity.rx_cores.len(), 2);
    assert_eq!(affinity.tx_cores.len(), 1);

    let json = engine.snapshot_json();
    assert_eq!(json["cores"].as_array().map(Vec::len), Some(2));
    assert!(json["drops"][0]["full_hwq"].is_u64());
    engine.shutdown();
}

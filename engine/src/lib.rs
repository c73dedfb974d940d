// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Multi-core forwarding engine.
//!
//! Distributes the receive and transmit queues of a set of ports across
//! worker cores, batches packets between receive, processing, and transmit
//! stages, and adapts each core's polling behavior to load and link state.
//! Device access, packet processing, and software scheduling are consumed
//! through narrow traits ([`PortDriver`], [`PacketHandler`], [`PktScheduler`],
//! [`CryptoEngine`]); the engine owns only the placement, buffering, and
//! core-scheduling machinery.
//!
//! Control-plane mutation (assignment, mask updates, crypto placement) runs
//! on the caller's thread and never assumes mutual exclusion with workers:
//! per-iteration fields are read through atomics, slot publication is fenced,
//! and reclamation waits out a grace period through [`quiesce`].

#![deny(clippy::all)]

mod assign;
mod burst;
mod crypto;
mod fwd;
mod lifecycle;
mod mask;
mod port;
mod snapshot;
mod worker;

use std::fmt::{self, Display};
use std::sync::Arc;
use std::thread::JoinHandle;

use arc_swap::ArcSwap;
use arrayvec::ArrayVec;
use parking_lot::Mutex;
use quiesce::Registry;

pub use bitmask::Bitmask;
pub use power::PowerProfile;

pub use crate::fwd::LoopState;
pub use crate::port::PortConfig;
pub use crate::snapshot::{CoreSnapshot, DropSnapshot, PortAffinity, QueueSnapshot};
pub use crate::worker::CoreSpec;

use crate::mask::PortMasks;
use crate::port::PortSlot;
use crate::worker::CoreState;

/// Port slot capacity of one engine instance.
pub const MAX_PORTS: usize = 256;
/// Hardware/logical queue ids per port tracked by the enabled-queue masks.
pub const MAX_QUEUES_PER_PORT: usize = 64;
/// Fixed per-core queue slot tables.
pub const MAX_RX_QUEUE_PER_CORE: usize = 16;
pub const MAX_TX_QUEUE_PER_CORE: usize = 16;

/// Burst bounds.
pub const RX_PKT_BURST: usize = 32;
pub const TX_PKT_BURST: usize = 32;
/// Larger pull when a software scheduler routes the queue, so it has a
/// meaningful batch to pick from.
pub const SCHED_PKT_BURST: usize = 64;
pub const CRYPTO_PKT_BURST: usize = 32;

/// Capacity of one shared software transmit ring.
pub const PKT_RING_SIZE: usize = 4096;

/// Owner-port value marking a per-core queue slot as free.
pub const NO_OWNER: PortId = PortId::MAX;

/// Hardware transmit queue reserved for control-path (non-worker) senders
/// on direct-path ports.
pub const CTL_TX_QUEUE: u16 = 0;

pub type PortId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "rx"),
            Direction::Tx => write!(f, "tx"),
        }
    }
}

/// Error from the device reconfiguration primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device error: {0}")]
pub struct DriverError(pub String);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AssignError {
    #[error("port {0} out of range")]
    BadPort(PortId),
    #[error("core {0} out of range")]
    BadCore(usize),
    #[error("port {0} already has queue assignments")]
    AlreadyAssigned(PortId),
    #[error("port {port}: no usable core for {dir} queue {queue}")]
    NoCore {
        port: PortId,
        dir: Direction,
        queue: u16,
    },
    #[error("port {port}: queue {queue} out of range")]
    BadQueue { port: PortId, queue: u16 },
    #[error("no usable crypto core")]
    NoCryptoCore,
    #[error("port {0} must be quiesced first")]
    NotQuiesced(PortId),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Device access used by the engine.
///
/// `tx_burst` transmits from the front of `pkts`, removing the packets it
/// accepts (and taking ownership of them) and returning their count. A full
/// hardware queue shows up as a zero or partial accept; the engine never
/// retries synchronously.
pub trait PortDriver<P>: Send + Sync {
    /// Poll one receive queue, appending at most `max` packets to `buf`.
    fn rx_burst(&self, port: PortId, queue: u16, buf: &mut Vec<P>, max: usize);

    /// Transmit a burst; remove and own the accepted prefix of `pkts`,
    /// return the accepted count. Called with an empty burst to give
    /// transmit-poll devices a chance to run their state machines.
    fn tx_burst(&self, port: PortId, queue: u16, pkts: &mut ArrayVec<P, TX_PKT_BURST>) -> usize;

    /// Stop, reconfigure, and restart a port's hardware queues. Only called
    /// while the port has no queue assignments.
    fn reconfigure(&self, port: PortId, n_rxq: u16, n_txq: u16) -> Result<(), DriverError>;
}

/// Per-packet processing pipeline. May emit packets through `out`; must not
/// block indefinitely.
pub trait PacketHandler<P>: Send + Sync {
    fn process(&self, port: PortId, pkt: P, out: &mut dyn PacketOutput<P>);
}

/// Sink handed to [`PacketHandler::process`]; the worker implementation
/// stages into the per-core burst buffer, the control-path implementation
/// falls back to single sends.
pub trait PacketOutput<P> {
    fn output(&mut self, port: PortId, pkt: P);
}

/// Software packet scheduler (QoS) attached to a port. Pure and non-blocking:
/// takes a dequeued batch, returns at most `max_out` packets to transmit now.
pub trait PktScheduler<P>: Send + Sync {
    fn schedule(&self, port: PortId, queue: u16, pkts: Vec<P>, max_out: usize) -> Vec<P>;
}

/// One cryptographic offload engine bound to a worker core.
pub trait CryptoEngine: Send + Sync {
    /// NUMA socket of the underlying device.
    fn socket(&self) -> u8;
    /// Poll for completed work; returns the number of finished operations.
    fn poll(&self, max: usize) -> usize;
}

pub(crate) type CoreSetObserver = Box<dyn Fn(Bitmask) + Send + Sync>;

pub(crate) struct Control {
    /// Round-robin start position for candidate core walks.
    pub(crate) rr_cursor: usize,
    /// Administrator-pinned crypto core set; `None` means auto-probe on
    /// every crypto assignment.
    pub(crate) crypto_cores: Option<Bitmask>,
}

pub(crate) struct Shared<P, D, H> {
    pub(crate) driver: D,
    pub(crate) handler: H,
    pub(crate) cores: Vec<CoreState<P>>,
    pub(crate) ports: Vec<PortSlot<P>>,
    pub(crate) masks: PortMasks,
    pub(crate) profile: ArcSwap<PowerProfile>,
    pub(crate) quiesce: Registry,
    pub(crate) control: Mutex<Control>,
    pub(crate) workers: Mutex<Vec<Option<JoinHandle<()>>>>,
    /// Serializes control-path transmit fallback (multiple non-worker
    /// threads may share the single control queue).
    pub(crate) ctl_tx: Mutex<()>,
    pub(crate) observer: Mutex<Option<CoreSetObserver>>,
    pub(crate) notify_tx: Mutex<Option<crossbeam::channel::Sender<()>>>,
    pub(crate) notifier: Mutex<Option<JoinHandle<()>>>,
}

impl<P, D, H> Shared<P, D, H> {
    pub(crate) fn port_slot(&self, port: PortId) -> Result<&PortSlot<P>, AssignError> {
        self.ports.get(port as usize).ok_or(AssignError::BadPort(port))
    }
}

/// The forwarding engine. Cheap to clone; all state is shared.
pub struct Engine<P, D, H> {
    pub(crate) shared: Arc<Shared<P, D, H>>,
}

impl<P, D, H> Clone for Engine<P, D, H> {
    fn clone(&self) -> Self {
        Engine {
            shared: self.shared.clone(),
        }
    }
}

impl<P, D, H> Engine<P, D, H>
where
    P: Send + 'static,
    D: PortDriver<P> + 'static,
    H: PacketHandler<P> + 'static,
{
    /// Build an engine over `cores` worker cores and `ports` port slots.
    ///
    /// Ports start administratively poll-enabled with their links down; no
    /// queues are assigned and no workers run until [`Engine::assign_queues`].
    ///
    /// # Panics
    /// On an empty core set or more than [`MAX_PORTS`] ports: fixed-capacity
    /// resources are sized here, and exhausting them is a configuration error
    /// caught before any packet is accepted.
    pub fn new(
        driver: D,
        handler: H,
        cores: Vec<CoreSpec>,
        ports: Vec<PortConfig>,
        profile: PowerProfile,
    ) -> Self {
        assert!(!cores.is_empty(), "at least one worker core required");
        assert!(
            ports.len() <= MAX_PORTS,
            "{} ports exceeds the {MAX_PORTS} port slots",
            ports.len()
        );
        let n_ports = ports.len();
        let cores: Vec<CoreState<P>> = cores
            .into_iter()
            .enumerate()
            .map(|(id, spec)| CoreState::new(id, spec))
            .collect();
        let n_cores = cores.len();
        let masks = PortMasks::new();
        // admin-enabled by default; links come up via link_up()
        for port in 0..n_ports {
            masks.poll.set(port);
        }
        let shared = Arc::new(Shared {
            driver,
            handler,
            cores,
            ports: ports.into_iter().map(PortSlot::new).collect(),
            masks,
            profile: ArcSwap::from_pointee(profile),
            quiesce: Registry::new(),
            control: Mutex::new(Control {
                rr_cursor: 0,
                crypto_cores: None,
            }),
            workers: Mutex::new((0..n_cores).map(|_| None).collect()),
            ctl_tx: Mutex::new(()),
            observer: Mutex::new(None),
            notify_tx: Mutex::new(None),
            notifier: Mutex::new(None),
        });
        let engine = Engine { shared };
        engine.spawn_notifier();
        engine
    }

    /// Install the collaborator informed (asynchronously) whenever the set
    /// of forwarding cores changes, e.g. a cgroup/affinity shield.
    pub fn set_core_set_observer(&self, observer: impl Fn(Bitmask) + Send + Sync + 'static) {
        *self.shared.observer.lock() = Some(Box::new(observer));
    }

    /// Pin crypto engine placement to `mask` ("sticky"), or restore
    /// auto-probing with `None`.
    pub fn set_crypto_cores(&self, mask: Option<Bitmask>) {
        self.shared.control.lock().crypto_cores = mask;
    }

    /// Swap the power profile; workers pick it up on their next pass.
    pub fn set_power_profile(&self, profile: PowerProfile) {
        self.shared.profile.store(Arc::new(profile));
    }

    #[must_use]
    pub fn core_count(&self) -> usize {
        self.shared.cores.len()
    }

    #[must_use]
    pub fn port_count(&self) -> usize {
        self.shared.ports.len()
    }

    /// Whether a worker core currently runs its forwarding loop.
    #[must_use]
    pub fn core_running(&self, core: usize) -> bool {
        self.shared
            .cores
            .get(core)
            .is_some_and(CoreState::is_running)
    }

    /// Current (rx queues, tx queues, crypto engines) load of one core.
    #[must_use]
    pub fn core_load(&self, core: usize) -> Option<(usize, usize, usize)> {
        self.shared.cores.get(core).map(CoreState::load)
    }
}

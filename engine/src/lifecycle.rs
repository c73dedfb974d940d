// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Worker and notifier thread lifecycle.
//!
//! Workers are started per core when queue or crypto assignment gives them
//! work and stopped cooperatively: `stop_core` clears the run flag and
//! joins, and is only reached for cores that are no longer receiving new
//! work (unassignment plus a grace period come first). Core-set changes are
//! pushed to the external observer from a dedicated event thread, never
//! inline, so worker-affecting operations never block on an external
//! process.

use std::sync::atomic::Ordering;
use std::thread;

use bitmask::Bitmask;
use tracing::{debug, info, warn};

use crate::{Engine, PacketHandler, PortDriver, Shared, fwd};

fn forwarding_set<P, D, H>(shared: &Shared<P, D, H>) -> Bitmask {
    shared
        .cores
        .iter()
        .enumerate()
        .filter(|(_, core)| core.has_work() || core.is_running())
        .map(|(id, _)| id)
        .collect()
}

impl<P, D, H> Engine<P, D, H>
where
    P: Send + 'static,
    D: PortDriver<P> + 'static,
    H: PacketHandler<P> + 'static,
{
    /// Launch the forwarding loop of `core` if it has work and is not
    /// already running.
    ///
    /// # Panics
    /// When the operating system refuses to spawn the thread; this happens
    /// before the core can have accepted any packets.
    pub(crate) fn start_core(&self, core: usize) {
        let state = &self.shared.cores[core];
        if !state.has_work() {
            return;
        }
        if state.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.shared.workers.lock();
        // reap a loop that exited on its own
        if let Some(done) = workers[core].take() {
            let _ = done.join();
        }
        let shared = self.shared.clone();
        // the loop clears the run flag itself before returning, so a starter
        // never observes a stale "running" for a loop that has already exited
        let handle = thread::Builder::new()
            .name(format!("fwd/{core}"))
            .spawn(move || fwd::run(&shared, &shared.cores[core]))
            .unwrap_or_else(|err| panic!("spawning worker for core {core}: {err}"));
        workers[core] = Some(handle);
        info!(core, "worker started");
    }

    /// Stop and join the forwarding loop of `core`.
    pub(crate) fn stop_core(&self, core: usize) {
        let state = &self.shared.cores[core];
        state.running.store(false, Ordering::SeqCst);
        let handle = self.shared.workers.lock()[core].take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(core, "worker panicked");
            } else {
                info!(core, "worker stopped");
            }
        }
    }

    pub(crate) fn spawn_notifier(&self) {
        let (tx, rx) = crossbeam::channel::unbounded::<()>();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("fwd/notify".to_string())
            .spawn(move || {
                // registered so shutdown can account for this thread, but
                // parked offline: it never touches reclaimed state
                let reader = shared.quiesce.register();
                reader.offline();
                while rx.recv().is_ok() {
                    let set = forwarding_set(&shared);
                    debug!(cores = %set, "forwarding core set changed");
                    if let Some(observer) = shared.observer.lock().as_ref() {
                        observer(set);
                    }
                }
                drop(reader);
            })
            .unwrap_or_else(|err| panic!("spawning core-set notifier: {err}"));
        *self.shared.notify_tx.lock() = Some(tx);
        *self.shared.notifier.lock() = Some(handle);
    }

    /// Queue an asynchronous core-set notification.
    pub(crate) fn notify_core_set(&self) {
        if let Some(tx) = self.shared.notify_tx.lock().as_ref() {
            let _ = tx.send(());
        }
    }

    /// Current forwarding core set: cores with work or still running.
    #[must_use]
    pub fn forwarding_cores(&self) -> Bitmask {
        forwarding_set(&self.shared)
    }

    /// Tear the engine down: unassign every port, stop every worker, and
    /// retire the notifier thread.
    pub fn shutdown(&self) {
        for port in 0..self.shared.ports.len() {
            let port = u16::try_from(port).unwrap_or(u16::MAX);
            if let Err(err) = self.unassign_queues(port) {
                warn!(port, %err, "unassign during shutdown failed");
            }
        }
        for core in 0..self.shared.cores.len() {
            self.stop_core(core);
        }
        // closing the channel ends the notifier loop; it deregisters its
        // grace-period reader on the way out
        self.shared.notify_tx.lock().take();
        let notifier = self.shared.notifier.lock().take();
        if let Some(handle) = notifier {
            let _ = handle.join();
        }
        info!("engine shut down");
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Crypto engine placement.
//!
//! Offload engines go to the least-loaded permitted core, scored like a
//! transmit queue. The permitted set is either pinned by the administrator
//! ("sticky", see [`Engine::set_crypto_cores`]) or probed on every request
//! as the complement of the currently-forwarding cores, falling back to all
//! cores when everything is forwarding.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use bitmask::Bitmask;
use tracing::{debug, info};

use crate::assign::next_available;
use crate::{AssignError, Control, CryptoEngine, Direction, Engine, PacketHandler, PortDriver};

impl<P, D, H> Engine<P, D, H>
where
    P: Send + 'static,
    D: PortDriver<P> + 'static,
    H: PacketHandler<P> + 'static,
{
    fn permitted_crypto_cores(&self, ctl: &Control) -> Bitmask {
        let online = Bitmask::first_n(self.shared.cores.len());
        if let Some(sticky) = &ctl.crypto_cores {
            return sticky.and(&online);
        }
        let idle: Bitmask = self
            .shared
            .cores
            .iter()
            .enumerate()
            .filter(|(_, core)| {
                core.num_rx.load(Ordering::Relaxed) == 0
                    && core.num_tx.load(Ordering::Relaxed) == 0
            })
            .map(|(id, _)| id)
            .collect();
        if idle.is_empty() { online } else { idle }
    }

    /// Bind a crypto engine to the least-loaded permitted core, starting
    /// the core when it was not running. Returns the chosen core.
    pub fn assign_crypto_engine(
        &self,
        engine: Arc<dyn CryptoEngine>,
    ) -> Result<usize, AssignError> {
        let mut ctl = self.shared.control.lock();
        let permitted = self.permitted_crypto_cores(&ctl);
        let socket = engine.socket();
        let Some(chosen) = next_available(
            &mut ctl,
            &self.shared.cores,
            &permitted,
            socket,
            Direction::Tx,
        ) else {
            return Err(AssignError::NoCryptoCore);
        };
        let core = &self.shared.cores[chosen];
        core.crypto.lock().push(engine);
        core.crypto_count.fetch_add(1, Ordering::Relaxed);
        core.crypto_gov.reset();
        self.start_core(chosen);
        drop(ctl);
        self.notify_core_set();
        info!(core = chosen, "crypto engine assigned");
        Ok(chosen)
    }

    /// Detach one crypto engine from `core`, stopping the core when it is
    /// left with neither queues nor a crypto role.
    pub fn unassign_crypto_engine(&self, core: usize) -> Result<(), AssignError> {
        let ctl = self.shared.control.lock();
        let state = self
            .shared
            .cores
            .get(core)
            .ok_or(AssignError::BadCore(core))?;
        let detached = state.crypto.lock().pop();
        if detached.is_none() {
            debug!(core, "no crypto engine to unassign");
            return Ok(());
        }
        state.crypto_count.fetch_sub(1, Ordering::Relaxed);
        if !state.has_work() {
            self.stop_core(core);
        }
        drop(ctl);
        self.notify_core_set();
        info!(core, "crypto engine unassigned");
        Ok(())
    }
}

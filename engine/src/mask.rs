// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Process-wide port masks.
//!
//! `active = poll ∩ linkup` after every update; the active mask gates all
//! data-plane activity on a port and is consulted by every worker every
//! iteration.

use bitmask::{Bitmask, SharedBitmask};
use tracing::debug;

use crate::{AssignError, Engine, PacketHandler, PortDriver, PortId};

pub(crate) struct PortMasks {
    /// Administratively eligible for polling.
    pub(crate) poll: SharedBitmask,
    /// Link reported up by the device.
    pub(crate) linkup: SharedBitmask,
    /// `poll ∩ linkup`; the only mask the data plane tests.
    pub(crate) active: SharedBitmask,
}

impl PortMasks {
    pub(crate) fn new() -> Self {
        Self {
            poll: SharedBitmask::new(),
            linkup: SharedBitmask::new(),
            active: SharedBitmask::new(),
        }
    }

    pub(crate) fn recompute(&self) {
        self.active.store(self.poll.load().and(&self.linkup.load()));
    }
}

impl<P, D, H> Engine<P, D, H>
where
    P: Send + 'static,
    D: PortDriver<P> + 'static,
    H: PacketHandler<P> + 'static,
{
    fn set_mask_bit(&self, port: PortId, poll_side: bool, on: bool) -> Result<(), AssignError> {
        self.shared.port_slot(port)?;
        let _ctl = self.shared.control.lock();
        let masks = &self.shared.masks;
        let mask = if poll_side { &masks.poll } else { &masks.linkup };
        if on {
            mask.set(port as usize);
        } else {
            mask.clear(port as usize);
        }
        masks.recompute();
        debug!(port, active = %masks.active.load(), "port masks updated");
        Ok(())
    }

    /// Make the port administratively eligible for polling.
    pub fn enable_poll(&self, port: PortId) -> Result<(), AssignError> {
        self.set_mask_bit(port, true, true)
    }

    /// Administratively stop all polling of the port. Assignments stay in
    /// place; workers simply skip the port.
    pub fn disable_poll(&self, port: PortId) -> Result<(), AssignError> {
        self.set_mask_bit(port, true, false)
    }

    /// Record a device link-up event.
    pub fn link_up(&self, port: PortId) -> Result<(), AssignError> {
        self.set_mask_bit(port, false, true)
    }

    /// Record a device link-down event.
    pub fn link_down(&self, port: PortId) -> Result<(), AssignError> {
        self.set_mask_bit(port, false, false)
    }

    #[must_use]
    pub fn poll_mask(&self) -> Bitmask {
        self.shared.masks.poll.load()
    }

    #[must_use]
    pub fn linkup_mask(&self) -> Bitmask {
        self.shared.masks.linkup.load()
    }

    #[must_use]
    pub fn active_mask(&self) -> Bitmask {
        self.shared.masks.active.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_is_poll_and_linkup() {
        let masks = PortMasks::new();
        masks.poll.set(1);
        masks.poll.set(2);
        masks.linkup.set(2);
        masks.linkup.set(3);
        masks.recompute();
        let active = masks.active.load();
        assert_eq!(active, masks.poll.load().and(&masks.linkup.load()));
        assert!(active.is_set(2));
        assert!(!active.is_set(1));
        assert!(!active.is_set(3));
    }
}

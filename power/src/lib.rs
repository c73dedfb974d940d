// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Power management for busy-poll worker cores.
//!
//! Each polled queue carries a [`SleepGovernor`] fed with the packet count of
//! every burst.  From the recent activity the governor recommends a nap
//! interval in microseconds; the forwarding loop takes the minimum across a
//! core's queues and maps it to a power state (tight poll, microsleep, or
//! long idle).  The mapping thresholds come from the active [`PowerProfile`].

#![deny(clippy::all, clippy::pedantic)]

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Upper bound on any recommended nap. Also the interval used when a core
/// owns only ports that are administratively out of the poll set.
pub const NAP_MAX_US: u32 = 250_000;

/// Coarse sleep used by the idle state (all owned ports link-down). The
/// sleeping core is parked offline for grace-period purposes; this period
/// bounds how stale its view may get before it rechecks link state.
pub const IDLE_SLEEP: Duration = Duration::from_secs(2);

/// Tuning knobs for the sleep state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PowerProfile {
    pub name: &'static str,
    /// Inner poll repetitions per state recomputation, and the number of
    /// consecutive empty polls before a queue's nap starts ramping.
    pub idle_thresh: u32,
    /// Recommended naps below this floor mean "keep polling".
    pub min_sleep_us: u32,
    /// Nap ramp cap for a single queue.
    pub max_sleep_us: u32,
}

impl PowerProfile {
    /// Default trade-off: short ramped naps once a queue has gone quiet.
    #[must_use]
    pub const fn balanced() -> Self {
        Self {
            name: "balanced",
            idle_thresh: 10,
            min_sleep_us: 10,
            max_sleep_us: 1_000,
        }
    }

    /// Never sleep while any queue is assigned and active.
    #[must_use]
    pub const fn low_latency() -> Self {
        Self {
            name: "low-latency",
            idle_thresh: 100,
            min_sleep_us: 1,
            max_sleep_us: 0,
        }
    }

    /// Aggressive sleeping for lightly loaded systems.
    #[must_use]
    pub const fn power_save() -> Self {
        Self {
            name: "power-save",
            idle_thresh: 4,
            min_sleep_us: 1,
            max_sleep_us: 100_000,
        }
    }
}

impl Default for PowerProfile {
    fn default() -> Self {
        Self::balanced()
    }
}

/// Per-queue activity tracker yielding a recommended nap interval.
///
/// Updated only by the owning worker; read by the control plane for
/// snapshots, hence the atomics.
#[derive(Debug, Default)]
pub struct SleepGovernor {
    /// Current recommended nap in microseconds.
    nap_us: AtomicU32,
    /// Consecutive empty polls since the last packet.
    idle_polls: AtomicU32,
}

impl SleepGovernor {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nap_us: AtomicU32::new(0),
            idle_polls: AtomicU32::new(0),
        }
    }

    /// Record the outcome of one poll of the governed queue.
    #[inline]
    pub fn update(&self, packets: usize) {
        if packets > 0 {
            self.nap_us.store(0, Ordering::Relaxed);
            self.idle_polls.store(0, Ordering::Relaxed);
        } else {
            let idle = self.idle_polls.load(Ordering::Relaxed);
            self.idle_polls.store(idle.saturating_add(1), Ordering::Relaxed);
        }
    }

    /// Recommended nap under `profile`, ramping the interval while the queue
    /// stays quiet: nothing until `idle_thresh` empty polls, then the profile
    /// floor, doubling per recomputation up to the profile cap.
    #[must_use]
    pub fn interval(&self, profile: &PowerProfile) -> u32 {
        let nap = self.nap_us.load(Ordering::Relaxed);
        if self.idle_polls.load(Ordering::Relaxed) < profile.idle_thresh {
            return nap;
        }
        let next = if nap == 0 {
            profile.min_sleep_us.min(profile.max_sleep_us)
        } else {
            nap.saturating_mul(2).min(profile.max_sleep_us)
        };
        self.nap_us.store(next, Ordering::Relaxed);
        next
    }

    /// Current nap without recomputation (snapshot use).
    #[must_use]
    pub fn nap_us(&self) -> u32 {
        self.nap_us.load(Ordering::Relaxed)
    }

    /// Forget all history (slot reuse on reassignment).
    pub fn reset(&self) {
        self.nap_us.store(0, Ordering::Relaxed);
        self.idle_polls.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct RateWindow {
    last_time: Instant,
    last_packets: u64,
}

/// Packets-per-second estimate over successive scaling calls.
///
/// The cumulative packet counter lives with the queue slot; callers feed its
/// current value to [`RateStats::scale`] periodically (the snapshot path does
/// this).  Concurrent mutation makes the estimate approximate by design.
#[derive(Debug)]
pub struct RateStats {
    window: Mutex<RateWindow>,
    packet_rate: AtomicU64,
}

impl Default for RateStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RateStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: Mutex::new(RateWindow {
                last_time: Instant::now(),
                last_packets: 0,
            }),
            packet_rate: AtomicU64::new(0),
        }
    }

    /// Restart the measurement window (slot reuse on reassignment).
    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.last_time = Instant::now();
        window.last_packets = 0;
        self.packet_rate.store(0, Ordering::Relaxed);
    }

    /// Fold the current cumulative `packets` count into the rate estimate.
    /// Windows shorter than 10ms are skipped to keep the estimate stable.
    pub fn scale(&self, packets: u64) {
        let mut window = self.window.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(window.last_time);
        if elapsed < Duration::from_millis(10) {
            return;
        }
        let delta = packets.saturating_sub(window.last_packets);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let rate = delta.saturating_mul(1_000_000) / micros.max(1);
        self.packet_rate.store(rate, Ordering::Relaxed);
        window.last_time = now;
        window.last_packets = packets;
    }

    /// Most recent packets-per-second estimate.
    #[must_use]
    pub fn rate(&self) -> u64 {
        self.packet_rate.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn governor_stays_awake_under_load() {
        let gov = SleepGovernor::new();
        let profile = PowerProfile::balanced();
        for _ in 0..100 {
            gov.update(32);
        }
        assert_eq!(gov.interval(&profile), 0);
    }

    #[test]
    fn governor_ramps_when_idle() {
        let gov = SleepGovernor::new();
        let profile = PowerProfile::balanced();
        for _ in 0..profile.idle_thresh {
            gov.update(0);
        }
        let first = gov.interval(&profile);
        assert_eq!(first, profile.min_sleep_us);
        let second = gov.interval(&profile);
        assert_eq!(second, profile.min_sleep_us * 2);
        // ramp is capped
        for _ in 0..32 {
            gov.update(0);
            let _ = gov.interval(&profile);
        }
        assert_eq!(gov.interval(&profile), profile.max_sleep_us);
    }

    #[test]
    fn governor_resets_on_traffic() {
        let gov = SleepGovernor::new();
        let profile = PowerProfile::balanced();
        for _ in 0..profile.idle_thresh + 5 {
            gov.update(0);
        }
        assert!(gov.interval(&profile) > 0);
        gov.update(1);
        assert_eq!(gov.interval(&profile), 0);
        assert_eq!(gov.nap_us(), 0);
    }

    #[test]
    fn low_latency_profile_never_naps() {
        let gov = SleepGovernor::new();
        let profile = PowerProfile::low_latency();
        for _ in 0..10_000 {
            gov.update(0);
            let nap = gov.interval(&profile);
            // stays below the poll floor, so the core keeps polling
            assert!(nap < profile.min_sleep_us);
        }
    }

    #[test]
    fn rate_stats_window() {
        let stats = RateStats::new();
        assert_eq!(stats.rate(), 0);
        std::thread::sleep(Duration::from_millis(20));
        stats.scale(1_000);
        let rate = stats.rate();
        assert!(rate > 0);
        // immediate rescale is a no-op (window too short)
        stats.scale(2_000);
        assert_eq!(stats.rate(), rate);
    }

    #[test]
    fn rate_stats_reset() {
        let stats = RateStats::new();
        std::thread::sleep(Duration::from_millis(15));
        stats.scale(500);
        stats.reset();
        assert_eq!(stats.rate(), 0);
    }
}

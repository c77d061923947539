//! Hang monitor
//!
//! Each worker owns a [`MonitorSlot`] and triggers it before and after every
//! dispatch. The monitor thread checks every slot once per interval; a slot
//! whose version has not moved while a destination is recorded means the
//! worker is stuck in one callback. Detection only: the callback keeps running.

use std::sync::atomic::{AtomicU32, Ordering};
use types::Handle;

/// A worker seen inside the same dispatch for a whole interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall {
    pub source: Handle,
    pub destination: Handle,
    pub version: u32,
}

impl Stall {
    pub fn describe(&self) -> String {
        format!(
            "A message from [ {} ] to [ {} ] maybe in an endless loop (version = {})",
            self.source, self.destination, self.version
        )
    }
}

/// Per-worker progress record
#[derive(Debug, Default)]
pub struct MonitorSlot {
    version: AtomicU32,
    check_version: AtomicU32,
    source: AtomicU32,
    destination: AtomicU32,
}

impl MonitorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the dispatch now starting, or `(NONE, NONE)` once it ends
    pub fn trigger(&self, source: Handle, destination: Handle) {
        self.source.store(source.raw(), Ordering::Relaxed);
        self.destination.store(destination.raw(), Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Release);
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Compare against the previous check; called only by the monitor thread
    pub fn check(&self) -> Option<Stall> {
        let version = self.version.load(Ordering::Acquire);
        if version == self.check_version.load(Ordering::Relaxed) {
            let destination = self.destination.load(Ordering::Relaxed);
            if destination != 0 {
                return Some(Stall {
                    source: Handle::from_raw(self.source.load(Ordering::Relaxed)),
                    destination: Handle::from_raw(destination),
                    version,
                });
            }
        } else {
            self.check_version.store(version, Ordering::Relaxed);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_is_not_a_stall() {
        let slot = MonitorSlot::new();
        slot.trigger(Handle::from_raw(1), Handle::from_raw(2));
        assert_eq!(slot.check(), None);
        slot.trigger(Handle::NONE, Handle::NONE);
        assert_eq!(slot.check(), None);
    }

    #[test]
    fn test_idle_worker_is_not_a_stall() {
        let slot = MonitorSlot::new();
        slot.trigger(Handle::from_raw(1), Handle::from_raw(2));
        slot.trigger(Handle::NONE, Handle::NONE);
        assert_eq!(slot.check(), None);
        assert_eq!(slot.check(), None);
    }

    #[test]
    fn test_stuck_dispatch_detected_on_second_check() {
        let slot = MonitorSlot::new();
        slot.trigger(Handle::from_raw(0x0100_0001), Handle::from_raw(0x0100_0009));
        assert_eq!(slot.check(), None);

        let stall = slot.check().unwrap();
        assert_eq!(stall.destination, Handle::from_raw(0x0100_0009));
        assert_eq!(stall.version, 1);
        assert_eq!(
            stall.describe(),
            "A message from [ :01000001 ] to [ :01000009 ] maybe in an endless loop (version = 1)"
        );

        // Reported again every interval while it stays stuck
        assert!(slot.check().is_some());
    }
}

//! Runtime counters
//!
//! Lock-free counters updated on the hot paths and read as a
//! [`MetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Node-wide counters
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub services_launched: AtomicU64,
    pub launch_failures: AtomicU64,
    pub services_released: AtomicU64,
    pub messages_dispatched: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub messages_retained: AtomicU64,
    pub send_failures: AtomicU64,

    // Diagnostics
    pub overload_events: AtomicU64,
    pub endless_detections: AtomicU64,
}

/// Point-in-time copy of [`RuntimeMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub services_launched: u64,
    pub launch_failures: u64,
    pub services_released: u64,
    pub messages_dispatched: u64,
    pub messages_dropped: u64,
    pub messages_retained: u64,
    pub send_failures: u64,
    pub overload_events: u64,
    pub endless_detections: u64,
}

impl RuntimeMetrics {
    pub fn record_launch(&self, success: bool) {
        if success {
            self.services_launched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.launch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_release(&self) {
        self.services_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self, retained: bool) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
        if retained {
            self.messages_retained.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_drop(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overload(&self) {
        self.overload_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endless(&self) {
        self.endless_detections.fetch_add(1, Ordering::Relaxed);
    }

    /// Services currently alive according to the counters
    pub fn live_services(&self) -> u64 {
        let launched = self.services_launched.load(Ordering::Relaxed);
        launched.saturating_sub(self.services_released.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            services_launched: self.services_launched.load(Ordering::Relaxed),
            launch_failures: self.launch_failures.load(Ordering::Relaxed),
            services_released: self.services_released.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            messages_retained: self.messages_retained.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            overload_events: self.overload_events.load(Ordering::Relaxed),
            endless_detections: self.endless_detections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let metrics = RuntimeMetrics::default();
        metrics.record_launch(true);
        metrics.record_launch(true);
        metrics.record_launch(false);
        metrics.record_release();
        metrics.record_dispatch(false);
        metrics.record_dispatch(true);
        metrics.record_drop();

        let snap = metrics.snapshot();
        assert_eq!(snap.services_launched, 2);
        assert_eq!(snap.launch_failures, 1);
        assert_eq!(snap.messages_dispatched, 2);
        assert_eq!(snap.messages_retained, 1);
        assert_eq!(snap.messages_dropped, 1);
        assert_eq!(metrics.live_services(), 1);
    }
}

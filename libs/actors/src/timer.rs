//! Timer seam
//!
//! Times are in hundredths of a second since the timer was created. The
//! timer thread calls [`Timer::update`] every tick and turns each expired
//! entry into a `RESPONSE` message for `(handle, session)`.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;
use types::Handle;

/// An expired timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub handle: Handle,
    pub session: i32,
}

/// Source of delayed responses
pub trait Timer: Send + Sync {
    /// Deliver a response to `(handle, session)` after `delay` hundredths
    fn schedule(&self, handle: Handle, session: i32, delay: u32);

    /// Pop every entry that is due
    fn update(&self) -> Vec<Expired>;

    /// Hundredths of a second since start
    fn now(&self) -> u64;

    /// Wall-clock start, unix seconds
    fn start_time(&self) -> u64;
}

/// Binary-heap timer
pub struct TimerQueue {
    heap: Mutex<TimerHeap>,
    origin: Instant,
    start_time: u64,
}

#[derive(Default)]
struct TimerHeap {
    entries: BinaryHeap<Reverse<(u64, u64, u32, i32)>>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(TimerHeap::default()),
            origin: Instant::now(),
            start_time: chrono::Utc::now().timestamp().max(0) as u64,
        }
    }

    pub fn pending(&self) -> usize {
        self.heap.lock().entries.len()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for TimerQueue {
    fn schedule(&self, handle: Handle, session: i32, delay: u32) {
        let expire = self.now() + delay as u64;
        let mut heap = self.heap.lock();
        // Sequence keeps equal deadlines in scheduling order
        let seq = heap.seq;
        heap.seq += 1;
        heap.entries
            .push(Reverse((expire, seq, handle.raw(), session)));
    }

    fn update(&self) -> Vec<Expired> {
        let now = self.now();
        let mut heap = self.heap.lock();
        let mut expired = Vec::new();
        while let Some(Reverse((expire, _, handle, session))) = heap.entries.peek().copied() {
            if expire > now {
                break;
            }
            heap.entries.pop();
            expired.push(Expired {
                handle: Handle::from_raw(handle),
                session,
            });
        }
        expired
    }

    fn now(&self) -> u64 {
        (self.origin.elapsed().as_millis() / 10) as u64
    }

    fn start_time(&self) -> u64 {
        self.start_time
    }
}

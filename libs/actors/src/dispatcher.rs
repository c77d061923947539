//! Dispatcher and worker pool
//!
//! Workers pull mailboxes off the global queue and drain a weight-dependent
//! number of messages per turn. Alongside the workers run one timer thread,
//! one socket thread and one monitor thread; all of them stop once the node
//! has no live services left.

use crate::error::{Result, RuntimeError};
use crate::mailbox::Mailbox;
use crate::monitor::MonitorSlot;
use crate::runtime::{set_thread_role, Runtime, ThreadRole};
use crate::socket::SocketPoll;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use types::Handle;

/// Timer thread tick
pub const TIMER_TICK: Duration = Duration::from_micros(2500);

/// Upper bound on one monitor sleep, so shutdown is noticed promptly
const MONITOR_STEP: Duration = Duration::from_millis(100);

/// How many messages a worker takes from a mailbox per turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weight {
    /// Exactly one message
    Single,
    /// `backlog >> k` messages, at least one
    Fraction(u32),
}

impl Weight {
    pub fn from_config(weight: i32) -> Self {
        if weight < 0 {
            Weight::Single
        } else {
            Weight::Fraction(weight as u32)
        }
    }

    /// Turn length for a backlog measured right after the first pop
    pub fn batch(self, backlog: usize) -> usize {
        match self {
            Weight::Single => 1,
            Weight::Fraction(k) => backlog.checked_shr(k).unwrap_or(0).max(1),
        }
    }
}

/// Sleep/wakeup coordination for the workers
#[derive(Debug)]
pub struct WorkerPool {
    count: usize,
    sleeping: AtomicUsize,
    quit: AtomicBool,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl WorkerPool {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            sleeping: AtomicUsize::new(0),
            quit: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn sleeping(&self) -> usize {
        self.sleeping.load(Ordering::Acquire)
    }

    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::Acquire)
    }

    /// Park the calling worker until woken or shut down
    ///
    /// Spurious wakeups are fine: the worker re-checks the global queue.
    pub fn sleep(&self) {
        let mut guard = self.mutex.lock();
        self.sleeping.fetch_add(1, Ordering::AcqRel);
        if !self.is_quit() {
            self.cond.wait(&mut guard);
        }
        self.sleeping.fetch_sub(1, Ordering::AcqRel);
    }

    /// Wake one worker if at least `count - busy` are asleep
    pub fn wakeup(&self, busy: usize) {
        if self.sleeping() >= self.count.saturating_sub(busy) {
            self.cond.notify_one();
        }
    }

    pub fn shutdown(&self) {
        let _guard = self.mutex.lock();
        self.quit.store(true, Ordering::Release);
        self.cond.notify_all();
    }
}

/// Run one scheduling turn
///
/// Takes the mailbox the worker already holds, or the next one from the global
/// queue, and returns the mailbox for the next turn (`None` when there is no
/// work). A held mailbox is requeued only if another mailbox is waiting.
pub fn dispatch(
    rt: &Runtime,
    slot: &MonitorSlot,
    held: Option<Arc<Mailbox>>,
    weight: Weight,
) -> Option<Arc<Mailbox>> {
    let mailbox = match held {
        Some(mailbox) => mailbox,
        None => rt.global().pop()?,
    };

    let handle = mailbox.handle();
    let ctx = match rt.registry().grab(handle) {
        Some(ctx) => ctx,
        None => {
            // Owner is gone: drain if it was released, otherwise leave it queued
            mailbox.release(|msg| rt.drop_message(handle, msg));
            return rt.global().pop();
        }
    };

    let mut n = 1;
    let mut i = 0;
    while i < n {
        let msg = match mailbox.pop() {
            Some(msg) => msg,
            None => return rt.global().pop(),
        };
        if i == 0 {
            n = weight.batch(mailbox.len() + 1);
        }

        if let Some(len) = mailbox.take_overload() {
            rt.metrics().record_overload();
            warn!("Service {} may overload, queue length {}", handle, len);
            rt.report(
                Some(&*ctx),
                &format!("May overload, message queue length = {}", len),
            );
        }

        slot.trigger(msg.source, handle);
        rt.dispatch_message(&ctx, msg);
        slot.trigger(Handle::NONE, Handle::NONE);
        i += 1;
    }

    match rt.global().pop() {
        Some(next) => {
            rt.global().push(mailbox);
            Some(next)
        }
        None => Some(mailbox),
    }
}

fn worker_loop(rt: Arc<Runtime>, pool: Arc<WorkerPool>, slot: Arc<MonitorSlot>, weight: Weight) {
    set_thread_role(ThreadRole::Worker);
    let mut held = None;
    while !pool.is_quit() {
        held = dispatch(&rt, &slot, held, weight);
        if held.is_none() {
            pool.sleep();
        }
    }
}

fn should_stop(rt: &Runtime, pool: &WorkerPool) -> bool {
    rt.live_services() == 0 || pool.is_quit()
}

fn timer_loop(rt: Arc<Runtime>, pool: Arc<WorkerPool>) {
    set_thread_role(ThreadRole::Timer);
    loop {
        rt.update_timers();
        if should_stop(&rt, &pool) {
            break;
        }
        pool.wakeup(pool.count().saturating_sub(1));
        thread::sleep(TIMER_TICK);
        if rt.take_log_reopen() {
            rt.signal_logger_reopen();
        }
    }

    // Wake the socket thread, then the workers
    rt.socket().exit();
    pool.shutdown();
    debug!("Timer thread exiting");
}

fn socket_loop(rt: Arc<Runtime>, pool: Arc<WorkerPool>) {
    set_thread_role(ThreadRole::Socket);
    loop {
        match rt.socket().poll() {
            SocketPoll::Exit => break,
            SocketPoll::Idle => {
                if should_stop(&rt, &pool) {
                    break;
                }
            }
            SocketPoll::Message {
                destination,
                message,
            } => {
                if let Err(e) = rt.push(destination, message) {
                    debug!("Socket event dropped: {}", e);
                }
                pool.wakeup(0);
            }
        }
    }
    debug!("Socket thread exiting");
}

fn monitor_loop(rt: Arc<Runtime>, pool: Arc<WorkerPool>, slots: Vec<Arc<MonitorSlot>>) {
    set_thread_role(ThreadRole::Monitor);
    let interval = Duration::from_millis(rt.config().monitor_interval_ms);
    let step = interval.min(MONITOR_STEP);
    let steps = (interval.as_millis() / step.as_millis().max(1)).max(1);

    'outer: loop {
        if should_stop(&rt, &pool) {
            break;
        }
        for slot in &slots {
            if let Some(stall) = slot.check() {
                rt.flag_endless(stall);
            }
        }
        for _ in 0..steps {
            if should_stop(&rt, &pool) {
                break 'outer;
            }
            thread::sleep(step);
        }
    }
    debug!("Monitor thread exiting");
}

fn spawn<F>(name: String, handles: &mut Vec<(String, JoinHandle<()>)>, f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| RuntimeError::thread(name.clone(), e))?;
    handles.push((name, handle));
    Ok(())
}

fn join_all(handles: Vec<(String, JoinHandle<()>)>) {
    for (name, handle) in handles {
        if handle.join().is_err() {
            error!("Thread {} panicked", name);
        }
    }
}

/// Spawn the monitor, timer, socket and worker threads and wait for them
pub(crate) fn run_threads(rt: &Arc<Runtime>) -> Result<()> {
    let count = rt.config().thread;
    let pool = Arc::new(WorkerPool::new(count));
    let slots: Vec<Arc<MonitorSlot>> = (0..count).map(|_| Arc::new(MonitorSlot::new())).collect();
    let mut handles = Vec::with_capacity(count + 3);

    info!("Starting {} workers", count);
    let spawned = (|| -> Result<()> {
        let (r, p, s) = (Arc::clone(rt), Arc::clone(&pool), slots.clone());
        spawn("hive-monitor".to_string(), &mut handles, move || monitor_loop(r, p, s))?;

        let (r, p) = (Arc::clone(rt), Arc::clone(&pool));
        spawn("hive-timer".to_string(), &mut handles, move || timer_loop(r, p))?;

        let (r, p) = (Arc::clone(rt), Arc::clone(&pool));
        spawn("hive-socket".to_string(), &mut handles, move || socket_loop(r, p))?;

        for (i, slot) in slots.iter().enumerate() {
            let weight = Weight::from_config(rt.config().weight_for(i));
            let (r, p, s) = (Arc::clone(rt), Arc::clone(&pool), Arc::clone(slot));
            spawn(format!("hive-worker-{}", i), &mut handles, move || {
                worker_loop(r, p, s, weight)
            })?;
        }
        Ok(())
    })();

    if let Err(e) = spawned {
        error!("{}", e);
        rt.socket().exit();
        pool.shutdown();
        join_all(handles);
        return Err(e);
    }

    join_all(handles);
    info!("All workers stopped");
    Ok(())
}

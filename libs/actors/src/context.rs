//! Service contexts
//!
//! A [`ServiceContext`] owns one service instance, its callback and its
//! mailbox. Its lifetime is governed by an explicit reference count that
//! starts at two (registry slot plus creator); the transition to zero tears the
//! service down exactly once. Memory itself is reclaimed by `Arc` when the last
//! holder goes away.

use crate::error::Result;
use crate::mailbox::Mailbox;
use crate::module::ServiceInstance;
use crate::runtime::{set_current_handle, Runtime};
use crate::service_log::ServiceLog;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace};
use types::{Handle, Message, MessageType, Payload};

/// Reference point for dispatch-time accounting
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn micros_since_epoch() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}

/// Who owns a payload once the callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The framework drops the payload
    Release,
    /// The callback moved the payload out, e.g. to forward it
    Retain,
}

/// Message callback; the closure's captures are the service's userdata
pub type Callback = Box<dyn FnMut(&ServiceContext, &mut Message) -> Disposition + Send>;

/// Runtime-side state of one service
pub struct ServiceContext {
    handle: AtomicU32,
    module_name: String,
    instance: Box<dyn ServiceInstance>,
    callback: Mutex<Option<Callback>>,
    mailbox: OnceCell<Arc<Mailbox>>,
    log: Mutex<Option<ServiceLog>>,
    refs: AtomicI32,
    init: AtomicBool,
    endless: AtomicBool,
    reserved: AtomicBool,
    session: AtomicI32,
    message_count: AtomicU64,
    cpu_cost_us: AtomicU64,
    cpu_start_us: AtomicU64,
    profile: bool,
    runtime: Weak<Runtime>,
}

/// Next session id, wrapping to 1 and never yielding 0 or a negative value
fn next_session(current: i32) -> i32 {
    if current <= 0 || current == i32::MAX {
        1
    } else {
        current + 1
    }
}

impl ServiceContext {
    pub(crate) fn new(
        module_name: impl Into<String>,
        instance: Box<dyn ServiceInstance>,
        profile: bool,
        runtime: Weak<Runtime>,
    ) -> Self {
        Self {
            handle: AtomicU32::new(0),
            module_name: module_name.into(),
            instance,
            callback: Mutex::new(None),
            mailbox: OnceCell::new(),
            log: Mutex::new(None),
            refs: AtomicI32::new(2),
            init: AtomicBool::new(false),
            endless: AtomicBool::new(false),
            reserved: AtomicBool::new(false),
            session: AtomicI32::new(0),
            message_count: AtomicU64::new(0),
            cpu_cost_us: AtomicU64::new(0),
            cpu_start_us: AtomicU64::new(0),
            profile,
            runtime,
        }
    }

    pub fn handle(&self) -> Handle {
        Handle::from_raw(self.handle.load(Ordering::Acquire))
    }

    /// Set by the registry under its write lock
    pub(crate) fn set_handle(&self, handle: Handle) {
        self.handle.store(handle.raw(), Ordering::Release);
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn instance(&self) -> &dyn ServiceInstance {
        self.instance.as_ref()
    }

    pub(crate) fn attach_mailbox(&self, mailbox: Arc<Mailbox>) {
        if self.mailbox.set(mailbox).is_err() {
            debug!("Mailbox for {} already attached", self.handle());
        }
    }

    pub fn mailbox(&self) -> Option<&Arc<Mailbox>> {
        self.mailbox.get()
    }

    pub fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.upgrade()
    }

    /// Install (or replace) the message callback
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(&ServiceContext, &mut Message) -> Disposition + Send + 'static,
    {
        *self.callback.lock() = Some(Box::new(callback));
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.init.load(Ordering::Acquire)
    }

    pub(crate) fn mark_initialized(&self) {
        self.init.store(true, Ordering::Release);
    }

    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Take an extra reference; pair with [`ServiceContext::release`]
    ///
    /// Fails once the count has reached zero, so a torn-down service stays dead.
    pub fn grab(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .is_ok()
    }

    /// Take a reference that does not keep the node alive
    ///
    /// Only the first reserve leaves the live-service count.
    pub fn reserve(&self) -> bool {
        if !self.grab() {
            return false;
        }
        if !self.reserved.swap(true, Ordering::AcqRel) {
            if let Some(rt) = self.runtime.upgrade() {
                rt.service_exit();
            }
        }
        true
    }

    /// Drop a reference; returns true if this call destroyed the service
    pub fn release(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "service {} released below zero", self.handle());
        if prev == 1 {
            self.teardown();
            true
        } else {
            false
        }
    }

    fn teardown(&self) {
        let handle = self.handle();
        debug!("Releasing service {} ({})", handle, self.module_name);

        if let Some(log) = self.log.lock().take() {
            log.close(handle);
        }
        self.instance.release();
        // Drops closure captures, including any Arc back to this context
        self.callback.lock().take();
        if let Some(mailbox) = self.mailbox.get() {
            mailbox.mark_release();
        }

        if let Some(rt) = self.runtime.upgrade() {
            rt.metrics().record_release();
            if !self.reserved.load(Ordering::Acquire) {
                rt.service_exit();
            }
        }
    }

    /// Allocate a session id for a request
    pub fn new_session(&self) -> i32 {
        match self
            .session
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| Some(next_session(s)))
        {
            Ok(prev) | Err(prev) => next_session(prev),
        }
    }

    pub fn is_endless(&self) -> bool {
        self.endless.load(Ordering::Acquire)
    }

    pub(crate) fn mark_endless(&self) {
        self.endless.store(true, Ordering::Release);
    }

    /// Read and clear the endless flag
    pub fn take_endless(&self) -> bool {
        self.endless.swap(false, Ordering::AcqRel)
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    /// Accumulated time inside the callback, in seconds
    pub fn cpu_cost(&self) -> f64 {
        self.cpu_cost_us.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Seconds spent in the dispatch currently running, zero when idle
    pub fn current_dispatch_time(&self) -> f64 {
        let start = self.cpu_start_us.load(Ordering::Relaxed);
        if !self.profile || start == 0 {
            return 0.0;
        }
        micros_since_epoch().saturating_sub(start) as f64 / 1_000_000.0
    }

    pub fn queue_len(&self) -> usize {
        self.mailbox().map(|mb| mb.len()).unwrap_or(0)
    }

    pub fn is_logging(&self) -> bool {
        self.log.lock().is_some()
    }

    /// Install a log sink; returns false if one is already open
    pub(crate) fn open_log(&self, log: ServiceLog) -> bool {
        let mut slot = self.log.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(log);
        true
    }

    pub(crate) fn close_log(&self) -> bool {
        match self.log.lock().take() {
            Some(log) => {
                log.close(self.handle());
                true
            }
            None => false,
        }
    }

    /// Run the callback for one message
    ///
    /// The callback is taken out of its slot for the call so no lock is held
    /// while it runs; it is put back unless the call installed a replacement.
    pub(crate) fn invoke(&self, mut msg: Message) -> Disposition {
        set_current_handle(self.handle());

        if let Some(log) = self.log.lock().as_mut() {
            log.output(&msg);
        }
        self.message_count.fetch_add(1, Ordering::Relaxed);

        let mut callback = self.callback.lock().take();
        let disposition = match callback.as_mut() {
            Some(cb) => {
                if self.profile {
                    let start = micros_since_epoch();
                    self.cpu_start_us.store(start.max(1), Ordering::Relaxed);
                    let disposition = cb(self, &mut msg);
                    let cost = micros_since_epoch().saturating_sub(start);
                    self.cpu_cost_us.fetch_add(cost, Ordering::Relaxed);
                    self.cpu_start_us.store(0, Ordering::Relaxed);
                    disposition
                } else {
                    cb(self, &mut msg)
                }
            }
            None => {
                trace!("No callback on {}, dropping message", self.handle());
                Disposition::Release
            }
        };

        if let Some(cb) = callback {
            let mut slot = self.callback.lock();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
        disposition
    }

    fn runtime_or_exited(&self) -> Result<Arc<Runtime>> {
        self.runtime
            .upgrade()
            .ok_or_else(|| crate::error::RuntimeError::service_exited(self.handle()))
    }

    /// Send from this service
    pub fn send(
        &self,
        destination: Handle,
        ty: MessageType,
        session: i32,
        payload: impl Into<Payload>,
    ) -> Result<i32> {
        let rt = self.runtime_or_exited()?;
        rt.send(Some(self), Handle::NONE, destination, ty, session, payload.into())
    }

    /// Send with a freshly allocated session; returns the session
    pub fn request(
        &self,
        destination: Handle,
        ty: MessageType,
        payload: impl Into<Payload>,
    ) -> Result<i32> {
        let rt = self.runtime_or_exited()?;
        rt.send_request(self, destination, ty, payload.into())
    }

    /// Send to a `:hex` or `.name` address
    pub fn send_name(
        &self,
        address: &str,
        ty: MessageType,
        session: i32,
        payload: impl Into<Payload>,
    ) -> Result<i32> {
        let rt = self.runtime_or_exited()?;
        rt.send_name(Some(self), Handle::NONE, address, ty, session, payload.into())
    }

    /// Run a text command on behalf of this service
    pub fn command(&self, name: &str, param: Option<&str>) -> Option<String> {
        let rt = self.runtime.upgrade()?;
        crate::command::execute(&rt, self, name, param)
    }

    /// Report a line to the logger service
    pub fn report(&self, text: impl AsRef<str>) {
        if let Some(rt) = self.runtime.upgrade() {
            rt.report(Some(self), text.as_ref());
        }
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("handle", &self.handle())
            .field("module", &self.module_name)
            .field("refs", &self.refs())
            .field("init", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingInstance {
        released: Arc<AtomicUsize>,
    }

    impl ServiceInstance for CountingInstance {
        fn init(&self, _ctx: &Arc<ServiceContext>, _params: Option<&str>) -> anyhow::Result<()> {
            Ok(())
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn detached(released: &Arc<AtomicUsize>) -> ServiceContext {
        ServiceContext::new(
            "counting",
            Box::new(CountingInstance {
                released: Arc::clone(released),
            }),
            true,
            Weak::new(),
        )
    }

    fn text(session: i32) -> Message {
        Message::new(Handle::from_raw(2), session, MessageType::TEXT, Payload::from("x")).unwrap()
    }

    #[test]
    fn test_session_wraps_to_one() {
        assert_eq!(next_session(0), 1);
        assert_eq!(next_session(41), 42);
        assert_eq!(next_session(i32::MAX), 1);
        assert_eq!(next_session(-5), 1);

        let released = Arc::new(AtomicUsize::new(0));
        let ctx = detached(&released);
        assert_eq!(ctx.new_session(), 1);
        assert_eq!(ctx.new_session(), 2);
        ctx.session.store(i32::MAX, Ordering::SeqCst);
        assert_eq!(ctx.new_session(), 1);
    }

    #[test]
    fn test_destroyed_once_when_count_hits_zero() {
        let released = Arc::new(AtomicUsize::new(0));
        let ctx = detached(&released);

        for _ in 0..10 {
            assert!(ctx.grab());
        }
        for _ in 0..10 {
            assert!(!ctx.release());
        }
        assert_eq!(released.load(Ordering::SeqCst), 0);

        assert!(!ctx.release());
        assert!(ctx.release());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.refs(), 0);
    }

    #[test]
    fn test_dead_context_cannot_be_grabbed() {
        let released = Arc::new(AtomicUsize::new(0));
        let ctx = detached(&released);
        assert!(!ctx.release());
        assert!(ctx.release());

        assert!(!ctx.grab());
        assert!(!ctx.reserve());
        assert_eq!(ctx.refs(), 0);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_grab_release() {
        let released = Arc::new(AtomicUsize::new(0));
        let ctx = Arc::new(detached(&released));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(ctx.grab());
                        assert!(!ctx.release());
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(ctx.refs(), 2);
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invoke_counts_and_restores_callback() {
        let released = Arc::new(AtomicUsize::new(0));
        let ctx = detached(&released);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        ctx.set_callback(move |_ctx, msg| {
            seen_cb.fetch_add(msg.session as usize, Ordering::SeqCst);
            Disposition::Release
        });

        assert_eq!(ctx.invoke(text(3)), Disposition::Release);
        assert_eq!(ctx.invoke(text(4)), Disposition::Release);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(ctx.message_count(), 2);
        assert!(ctx.has_callback());
        assert!(ctx.cpu_cost() >= 0.0);
    }

    #[test]
    fn test_callback_can_replace_itself() {
        let released = Arc::new(AtomicUsize::new(0));
        let ctx = detached(&released);
        ctx.set_callback(|ctx, msg| {
            ctx.set_callback(|_ctx, msg| {
                msg.take_payload();
                Disposition::Retain
            });
            assert_eq!(msg.payload.to_text(), "x");
            Disposition::Release
        });

        assert_eq!(ctx.invoke(text(1)), Disposition::Release);
        assert_eq!(ctx.invoke(text(2)), Disposition::Retain);
    }

    #[test]
    fn test_endless_flag_read_and_clear() {
        let released = Arc::new(AtomicUsize::new(0));
        let ctx = detached(&released);
        assert!(!ctx.take_endless());
        ctx.mark_endless();
        assert!(ctx.is_endless());
        assert!(ctx.take_endless());
        assert!(!ctx.is_endless());
    }
}

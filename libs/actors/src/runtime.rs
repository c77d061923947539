//! Runtime
//!
//! One explicitly constructed object owns everything a node shares: the
//! handle registry, the global queue, the module table, the environment, the
//! timer and socket collaborators and the live-service counter. Contexts keep a
//! weak reference back to it.

use crate::command::{self, split_command};
use crate::context::{Disposition, ServiceContext};
use crate::dispatcher;
use crate::env::EnvTable;
use crate::error::{Result, RuntimeError};
use crate::logger::{LoggerModule, LOGGER_MODULE};
use crate::mailbox::{GlobalQueue, Mailbox};
use crate::metrics::RuntimeMetrics;
use crate::module::{Module, ModuleRegistry};
use crate::monitor::Stall;
use crate::registry::HandleRegistry;
use crate::socket::{ChannelPoller, SocketPoller};
use crate::timer::{Timer, TimerQueue};
use node_config::RuntimeConfig;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use types::{Handle, Message, MessageType, Payload};

/// Name the logger service is bound to
pub const LOGGER_NAME: &str = "logger";

/// Kind of runtime thread, reported when no service is being dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    Main,
    Worker,
    Socket,
    Timer,
    Monitor,
}

impl ThreadRole {
    /// Negative tag distinguishing a role from a handle
    pub fn tag(self) -> i64 {
        match self {
            ThreadRole::Main => -1,
            ThreadRole::Worker => -2,
            ThreadRole::Socket => -3,
            ThreadRole::Timer => -4,
            ThreadRole::Monitor => -5,
        }
    }
}

thread_local! {
    static CURRENT: Cell<i64> = const { Cell::new(-1) };
}

pub(crate) fn set_thread_role(role: ThreadRole) {
    CURRENT.with(|c| c.set(role.tag()));
}

pub(crate) fn set_current_handle(handle: Handle) {
    CURRENT.with(|c| c.set(handle.raw() as i64));
}

/// Handle being dispatched on this thread, or the thread's negative role tag
pub fn current_handle() -> i64 {
    CURRENT.with(|c| c.get())
}

/// Service last dispatched on this thread
pub fn current_service() -> Option<Handle> {
    match current_handle() {
        raw if raw > 0 => Some(Handle::from_raw(raw as u32)),
        _ => None,
    }
}

/// Node runtime
pub struct Runtime {
    config: RuntimeConfig,
    registry: HandleRegistry,
    global: Arc<GlobalQueue>,
    modules: ModuleRegistry,
    env: EnvTable,
    timer: Box<dyn Timer>,
    socket: Box<dyn SocketPoller>,
    live: AtomicUsize,
    monitor_exit: AtomicU32,
    log_reopen: AtomicBool,
    metrics: RuntimeMetrics,
}

/// Builder for [`Runtime`]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    modules: Vec<Arc<dyn Module>>,
    timer: Option<Box<dyn Timer>>,
    socket: Option<Box<dyn SocketPoller>>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            modules: Vec::new(),
            timer: None,
            socket: None,
        }
    }

    pub fn module(mut self, module: impl Module + 'static) -> Self {
        self.modules.push(Arc::new(module));
        self
    }

    pub fn timer(mut self, timer: impl Timer + 'static) -> Self {
        self.timer = Some(Box::new(timer));
        self
    }

    pub fn socket(mut self, socket: impl SocketPoller + 'static) -> Self {
        self.socket = Some(Box::new(socket));
        self
    }

    pub fn build(self) -> Result<Arc<Runtime>> {
        self.config
            .validate()
            .map_err(|e| RuntimeError::configuration(format!("{:#}", e)))?;

        let modules = ModuleRegistry::new();
        for module in self.modules {
            let name = module.name().to_string();
            if !modules.register(module) {
                warn!("Duplicate module {} ignored", name);
            }
        }
        if !modules.contains(LOGGER_MODULE) {
            modules.register(Arc::new(LoggerModule));
        }

        let env = EnvTable::new();
        for (key, value) in self.config.env_table() {
            env.set(&key, &value);
        }

        info!(
            "Runtime built: harbor {}, {} workers, modules {:?}",
            self.config.harbor,
            self.config.thread,
            modules.names()
        );

        Ok(Arc::new(Runtime {
            registry: HandleRegistry::new(self.config.harbor),
            global: GlobalQueue::new(),
            modules,
            env,
            timer: self.timer.unwrap_or_else(|| Box::new(TimerQueue::new())),
            socket: self
                .socket
                .unwrap_or_else(|| Box::new(ChannelPoller::new())),
            live: AtomicUsize::new(0),
            monitor_exit: AtomicU32::new(0),
            log_reopen: AtomicBool::new(false),
            metrics: RuntimeMetrics::default(),
            config: self.config,
        }))
    }
}

impl Runtime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn harbor(&self) -> u8 {
        self.config.harbor
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn global(&self) -> &Arc<GlobalQueue> {
        &self.global
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn env(&self) -> &EnvTable {
        &self.env
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn timer(&self) -> &dyn Timer {
        self.timer.as_ref()
    }

    pub fn socket(&self) -> &dyn SocketPoller {
        self.socket.as_ref()
    }

    /// Services launched and not yet released (reserved ones excluded)
    pub fn live_services(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn service_exit(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Service notified when another service exits
    pub fn monitor_exit(&self) -> Handle {
        Handle::from_raw(self.monitor_exit.load(Ordering::Acquire))
    }

    pub fn set_monitor_exit(&self, handle: Handle) {
        self.monitor_exit.store(handle.raw(), Ordering::Release);
    }

    /// Create, register and initialize a service
    ///
    /// The new mailbox stays hidden from the dispatcher until init returns, so
    /// messages the service sends itself during init wait safely.
    pub fn launch(
        self: &Arc<Self>,
        module_name: &str,
        params: Option<&str>,
    ) -> Result<Arc<ServiceContext>> {
        let module = self.modules.query(module_name).ok_or_else(|| {
            self.metrics.record_launch(false);
            RuntimeError::module_not_found(module_name)
        })?;
        let instance = module.create().ok_or_else(|| {
            self.metrics.record_launch(false);
            RuntimeError::instance_create(module_name)
        })?;

        let ctx = Arc::new(ServiceContext::new(
            module_name,
            instance,
            self.config.profile,
            Arc::downgrade(self),
        ));
        let handle = self.registry.register(Arc::clone(&ctx));
        let mailbox = Mailbox::new(handle, &self.global);
        ctx.attach_mailbox(Arc::clone(&mailbox));
        self.live.fetch_add(1, Ordering::AcqRel);

        self.report(
            Some(&*ctx),
            &format!("LAUNCH {} {}", module_name, params.unwrap_or("")),
        );

        match ctx.instance().init(&ctx, params) {
            Ok(()) => {
                let destroyed = ctx.release();
                if !destroyed {
                    ctx.mark_initialized();
                }
                self.global.push(mailbox);
                if destroyed {
                    self.metrics.record_launch(false);
                    return Err(RuntimeError::service_exited(handle));
                }
                self.metrics.record_launch(true);
                info!("Launched {} as {}", module_name, handle);
                Ok(ctx)
            }
            Err(e) => {
                warn!("Failed to launch {} ({}): {:#}", module_name, handle, e);
                self.report(Some(&*ctx), &format!("FAILED launch {}", module_name));
                self.metrics.record_launch(false);

                ctx.release();
                self.registry.retire(handle);
                mailbox.release(|msg| self.drop_message(handle, msg));
                Err(RuntimeError::init_failed(module_name, handle, e))
            }
        }
    }

    /// Dispose of a message whose destination is gone, telling its sender
    pub(crate) fn drop_message(&self, dead: Handle, msg: Message) {
        self.metrics.record_drop();
        if msg.source.is_none() {
            return;
        }
        let reply = Message::signal(dead, msg.session, MessageType::ERROR);
        if let Err(e) = self.push(msg.source, reply) {
            debug!("Error reply from {} not delivered: {}", dead, e);
        }
    }

    /// Enqueue a prepared message
    pub fn push(&self, destination: Handle, msg: Message) -> Result<()> {
        let ctx = self
            .registry
            .grab(destination)
            .ok_or_else(|| RuntimeError::unknown_destination(destination))?;
        match ctx.mailbox() {
            Some(mailbox) => {
                mailbox.push(msg);
                Ok(())
            }
            None => Err(RuntimeError::unknown_destination(destination)),
        }
    }

    /// Send a message; returns the session
    ///
    /// A `NONE` source means "from `ctx`". Sending to `NONE` is a no-op.
    pub fn send(
        &self,
        ctx: Option<&ServiceContext>,
        source: Handle,
        destination: Handle,
        ty: MessageType,
        session: i32,
        payload: Payload,
    ) -> Result<i32> {
        let len = payload.len();
        let source = match (source.is_none(), ctx) {
            (true, Some(ctx)) => ctx.handle(),
            _ => source,
        };

        let msg = Message::new(source, session, ty, payload).map_err(|_| {
            self.metrics.record_send_failure();
            self.report(ctx, &format!("The message to {} is too large", destination));
            RuntimeError::message_too_large(destination, len)
        })?;

        if destination.is_none() {
            return Ok(session);
        }
        if destination.harbor() != self.harbor() {
            self.metrics.record_send_failure();
            return Err(RuntimeError::remote_unsupported(destination));
        }

        self.push(destination, msg).map_err(|e| {
            self.metrics.record_send_failure();
            e
        })?;
        Ok(session)
    }

    /// Send with a freshly allocated session from `ctx`
    pub fn send_request(
        &self,
        ctx: &ServiceContext,
        destination: Handle,
        ty: MessageType,
        payload: Payload,
    ) -> Result<i32> {
        let session = ctx.new_session();
        self.send(Some(ctx), Handle::NONE, destination, ty, session, payload)
    }

    /// Send to a `:hex` or `.name` address
    pub fn send_name(
        &self,
        ctx: Option<&ServiceContext>,
        source: Handle,
        address: &str,
        ty: MessageType,
        session: i32,
        payload: Payload,
    ) -> Result<i32> {
        let destination = if address.starts_with(':') {
            address
                .parse::<Handle>()
                .map_err(|_| RuntimeError::unknown_name(address))?
        } else if let Some(name) = address.strip_prefix('.') {
            match self.registry.find_by_name(name) {
                h if h.is_none() => {
                    self.metrics.record_send_failure();
                    self.report(ctx, &format!("Drop message to {}", address));
                    return Err(RuntimeError::unknown_name(address));
                }
                h => h,
            }
        } else {
            self.metrics.record_send_failure();
            return Err(RuntimeError::remote_unsupported(address));
        };
        self.send(ctx, source, destination, ty, session, payload)
    }

    /// Resolve `:hex` or `.name`; `NONE` when unknown
    pub fn query_name(&self, ctx: Option<&ServiceContext>, name: &str) -> Handle {
        match name.as_bytes().first() {
            Some(b':') => name.parse().unwrap_or(Handle::NONE),
            Some(b'.') => self.registry.find_by_name(&name[1..]),
            _ => {
                self.report(ctx, &format!("Don't support query global name {}", name));
                Handle::NONE
            }
        }
    }

    /// Report a line: traced, and forwarded to `.logger` when one is bound
    pub fn report(&self, ctx: Option<&ServiceContext>, text: &str) {
        let source = ctx.map(|c| c.handle()).unwrap_or(Handle::NONE);
        debug!(target: "hive::report", "[{}] {}", source, text);

        let logger = self.registry.find_by_name(LOGGER_NAME);
        if logger.is_none() {
            return;
        }
        if let Ok(msg) = Message::new(source, 0, MessageType::TEXT, Payload::from(text)) {
            let _ = self.push(logger, msg);
        }
    }

    /// Run a text command on behalf of `ctx`
    pub fn command(
        self: &Arc<Self>,
        ctx: &ServiceContext,
        name: &str,
        param: Option<&str>,
    ) -> Option<String> {
        command::execute(self, ctx, name, param)
    }

    /// Deliver one message to `ctx`'s callback
    pub(crate) fn dispatch_message(&self, ctx: &ServiceContext, msg: Message) {
        let disposition = ctx.invoke(msg);
        self.metrics
            .record_dispatch(disposition == Disposition::Retain);
    }

    /// Synchronously deliver everything queued for `ctx`
    pub fn dispatch_all(&self, ctx: &ServiceContext) {
        if let Some(mailbox) = ctx.mailbox() {
            while let Some(msg) = mailbox.pop() {
                self.dispatch_message(ctx, msg);
            }
        }
    }

    /// Schedule a `RESPONSE` to `ctx` after `delay` hundredths; returns the session
    pub fn timeout(&self, ctx: &ServiceContext, delay: i32) -> i32 {
        let session = ctx.new_session();
        if delay <= 0 {
            let msg = Message::signal(Handle::NONE, session, MessageType::RESPONSE);
            if let Err(e) = self.push(ctx.handle(), msg) {
                debug!("Immediate timeout not delivered: {}", e);
            }
        } else {
            self.timer.schedule(ctx.handle(), session, delay as u32);
        }
        session
    }

    /// Push responses for every expired timeout
    pub(crate) fn update_timers(&self) {
        for expired in self.timer.update() {
            let msg = Message::signal(Handle::NONE, expired.session, MessageType::RESPONSE);
            if let Err(e) = self.push(expired.handle, msg) {
                debug!("Timeout for {} dropped: {}", expired.handle, e);
            }
        }
    }

    /// Flag a stalled destination and report it
    pub(crate) fn flag_endless(&self, stall: Stall) {
        if let Some(ctx) = self.registry.grab(stall.destination) {
            ctx.mark_endless();
        }
        self.metrics.record_endless();
        let text = stall.describe();
        warn!("{}", text);
        self.report(None, &text);
    }

    /// Ask the logger to reopen its file on the next timer tick
    pub fn request_log_reopen(&self) {
        self.log_reopen.store(true, Ordering::Release);
    }

    pub(crate) fn take_log_reopen(&self) -> bool {
        self.log_reopen.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn signal_logger_reopen(&self) {
        let logger = self.registry.find_by_name(LOGGER_NAME);
        if logger.is_none() {
            return;
        }
        let msg = Message::signal(Handle::NONE, 0, MessageType::SYSTEM);
        if let Err(e) = self.push(logger, msg) {
            debug!("Logger reopen not delivered: {}", e);
        }
    }

    /// Launch the logger and bootstrap services, then run until every
    /// service has exited
    pub fn start(self: &Arc<Self>) -> Result<()> {
        set_thread_role(ThreadRole::Main);

        let logservice = self.config.logservice.clone();
        let logger = self
            .launch(&logservice, self.config.logger.as_deref())
            .map_err(|e| {
                RuntimeError::bootstrap(format!("Can't launch {} service: {}", logservice, e))
            })?;
        if self.registry.find_by_name(LOGGER_NAME).is_none() {
            self.registry.bind_name(logger.handle(), LOGGER_NAME);
        }

        self.bootstrap(&logger)?;
        self.run()
    }

    fn bootstrap(self: &Arc<Self>, logger: &ServiceContext) -> Result<()> {
        let cmdline = self.config.bootstrap.trim();
        let (name, args) = split_command(cmdline);
        if let Err(e) = self.launch(name, args) {
            self.report(None, &format!("Bootstrap error : {}", cmdline));
            self.dispatch_all(logger);
            return Err(RuntimeError::bootstrap(format!("{}: {}", cmdline, e)));
        }
        Ok(())
    }

    /// Run the worker, timer, socket and monitor threads until the live
    /// service count drops to zero
    pub fn run(self: &Arc<Self>) -> Result<()> {
        dispatcher::run_threads(self)
    }

    /// Retire every service; `run` returns once they are gone
    pub fn abort(&self) {
        info!("Aborting: retiring {} services", self.registry.len());
        self.registry.retire_all();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("harbor", &self.harbor())
            .field("live", &self.live_services())
            .field("registry", &self.registry)
            .field("global", &self.global)
            .finish()
    }
}

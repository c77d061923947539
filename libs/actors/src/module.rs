//! Service modules
//!
//! A [`Module`] is a named factory for service instances. Modules are
//! registered with the runtime up front; `LAUNCH` and bootstrap resolve them by
//! name.

use crate::context::ServiceContext;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Factory for one kind of service
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Create a fresh instance, or `None` to decline the launch
    fn create(&self) -> Option<Box<dyn ServiceInstance>>;
}

/// A live service's state, owned by its context
///
/// `init` normally installs the message callback with
/// [`ServiceContext::set_callback`]. `signal` may be called from any thread
/// while the callback runs.
pub trait ServiceInstance: Send + Sync {
    fn init(&self, ctx: &Arc<ServiceContext>, params: Option<&str>) -> anyhow::Result<()>;

    /// Called once when the service is destroyed
    fn release(&self) {}

    fn signal(&self, _code: i32) {}
}

type InitFn = dyn Fn(&Arc<ServiceContext>, Option<&str>) -> anyhow::Result<()> + Send + Sync;

/// Module built from an init closure
///
/// ```rust
/// use actors::{Disposition, FnModule};
///
/// let echo = FnModule::new("echo", |ctx, _params| {
///     ctx.set_callback(|_ctx, _msg| Disposition::Release);
///     Ok(())
/// });
/// ```
pub struct FnModule {
    name: String,
    init: Arc<InitFn>,
}

impl FnModule {
    pub fn new<F>(name: impl Into<String>, init: F) -> Self
    where
        F: Fn(&Arc<ServiceContext>, Option<&str>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            init: Arc::new(init),
        }
    }
}

impl Module for FnModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self) -> Option<Box<dyn ServiceInstance>> {
        Some(Box::new(FnInstance {
            init: Arc::clone(&self.init),
        }))
    }
}

struct FnInstance {
    init: Arc<InitFn>,
}

impl ServiceInstance for FnInstance {
    fn init(&self, ctx: &Arc<ServiceContext>, params: Option<&str>) -> anyhow::Result<()> {
        (self.init)(ctx, params)
    }
}

/// Name-keyed module table
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<dyn Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module; returns false if the name is taken
    pub fn register(&self, module: Arc<dyn Module>) -> bool {
        let mut modules = self.modules.write();
        let name = module.name().to_string();
        if modules.contains_key(&name) {
            return false;
        }
        debug!("Registering module: {}", name);
        modules.insert(name, module);
        true
    }

    pub fn query(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

//! Handle Registry
//!
//! Maps handles to live service contexts and keeps a sorted name table for
//! binary-search lookup. One reader/writer lock guards both tables: lookups
//! share it, create/retire/bind take it exclusively.

use crate::context::ServiceContext;
use parking_lot::RwLock;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;
use types::{Handle, HANDLE_MASK};

const DEFAULT_SLOT_SIZE: usize = 4;

/// A name bound to a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameBinding {
    pub name: String,
    pub handle: Handle,
}

struct Slots {
    handle_index: u32,
    slots: Vec<Option<Arc<ServiceContext>>>,
    names: Vec<NameBinding>,
}

impl Slots {
    fn hash(&self, handle: Handle) -> usize {
        handle.local() as usize & (self.slots.len() - 1)
    }

    fn lookup(&self, handle: Handle) -> Option<&Arc<ServiceContext>> {
        self.slots[self.hash(handle)]
            .as_ref()
            .filter(|ctx| ctx.handle() == handle)
    }

    fn find_name(&self, name: &str) -> Result<usize, usize> {
        self.names.binary_search_by(|b| b.name.as_str().cmp(name))
    }
}

/// Handle-to-context table plus the name table
pub struct HandleRegistry {
    harbor: u32,
    inner: RwLock<Slots>,
}

/// Counted reference to a context, released on drop
pub struct ContextRef {
    ctx: Arc<ServiceContext>,
}

impl ContextRef {
    /// Wrap a context whose count was already incremented
    pub(crate) fn adopt(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub fn arc(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }
}

impl Deref for ContextRef {
    type Target = ServiceContext;

    fn deref(&self) -> &ServiceContext {
        &self.ctx
    }
}

impl Drop for ContextRef {
    fn drop(&mut self) {
        self.ctx.release();
    }
}

impl HandleRegistry {
    pub fn new(harbor: u8) -> Self {
        let mut slots = Vec::with_capacity(DEFAULT_SLOT_SIZE);
        slots.resize_with(DEFAULT_SLOT_SIZE, || None);
        Self {
            harbor: Handle::harbor_prefix(harbor),
            inner: RwLock::new(Slots {
                handle_index: 1,
                slots,
                names: Vec::with_capacity(2),
            }),
        }
    }

    /// Assign a handle to `ctx` and store it
    ///
    /// Probes from a cursor that only moves forward, so a retired handle is
    /// not handed out again until the local space wraps.
    pub fn register(&self, ctx: Arc<ServiceContext>) -> Handle {
        let mut s = self.inner.write();
        loop {
            let size = s.slots.len();
            for i in 0..size as u32 {
                let local = s.handle_index.wrapping_add(i) & HANDLE_MASK;
                if local == 0 {
                    continue;
                }
                let hash = local as usize & (size - 1);
                if s.slots[hash].is_none() {
                    let handle = Handle::from_raw(local | self.harbor);
                    ctx.set_handle(handle);
                    s.slots[hash] = Some(ctx);
                    s.handle_index = local.wrapping_add(1);
                    return handle;
                }
            }

            let new_size = size * 2;
            debug_assert!(new_size - 1 <= HANDLE_MASK as usize);
            let mut slots = Vec::with_capacity(new_size);
            slots.resize_with(new_size, || None);
            for ctx in s.slots.drain(..).flatten() {
                let hash = ctx.handle().local() as usize & (new_size - 1);
                debug_assert!(slots[hash].is_none());
                slots[hash] = Some(ctx);
            }
            debug!("Handle table grown to {} slots", new_size);
            s.slots = slots;
        }
    }

    /// Remove `handle` and any names bound to it, then drop the registry's
    /// reference outside the lock
    pub fn retire(&self, handle: Handle) -> bool {
        let removed = {
            let mut s = self.inner.write();
            let hash = s.hash(handle);
            let matches = s.slots[hash]
                .as_ref()
                .is_some_and(|ctx| ctx.handle() == handle);
            if matches {
                s.names.retain(|b| b.handle != handle);
                s.slots[hash].take()
            } else {
                None
            }
        };

        match removed {
            Some(ctx) => {
                debug!("Retired {}", handle);
                ctx.release();
                true
            }
            None => false,
        }
    }

    /// Retire every live handle, rescanning until none remain
    pub fn retire_all(&self) {
        loop {
            let handles = self.handles();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                self.retire(handle);
            }
        }
    }

    /// Look up a live context and take a reference on it
    pub fn grab(&self, handle: Handle) -> Option<ContextRef> {
        let s = self.inner.read();
        s.lookup(handle)
            .filter(|ctx| ctx.grab())
            .map(|ctx| ContextRef::adopt(Arc::clone(ctx)))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.inner.read().lookup(handle).is_some()
    }

    /// Bind `name` to `handle`; `None` if the name is already taken
    pub fn bind_name(&self, handle: Handle, name: &str) -> Option<String> {
        let mut s = self.inner.write();
        match s.find_name(name) {
            Ok(_) => None,
            Err(pos) => {
                s.names.insert(
                    pos,
                    NameBinding {
                        name: name.to_string(),
                        handle,
                    },
                );
                Some(name.to_string())
            }
        }
    }

    /// Handle bound to `name`, or [`Handle::NONE`]
    pub fn find_by_name(&self, name: &str) -> Handle {
        let s = self.inner.read();
        match s.find_name(name) {
            Ok(pos) => s.names[pos].handle,
            Err(_) => Handle::NONE,
        }
    }

    /// Snapshot of the name table in lookup order
    pub fn names(&self) -> Vec<NameBinding> {
        self.inner.read().names.clone()
    }

    /// Live handles in slot order
    pub fn handles(&self) -> Vec<Handle> {
        self.inner
            .read()
            .slots
            .iter()
            .flatten()
            .map(|ctx| ctx.handle())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("harbor", &(self.harbor >> types::HANDLE_REMOTE_SHIFT))
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ServiceInstance;
    use proptest::prelude::*;
    use std::sync::Weak;

    struct Idle;

    impl ServiceInstance for Idle {
        fn init(&self, _ctx: &Arc<ServiceContext>, _params: Option<&str>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn context() -> Arc<ServiceContext> {
        Arc::new(ServiceContext::new("idle", Box::new(Idle), false, Weak::new()))
    }

    #[test]
    fn test_register_carries_harbor_and_skips_zero() {
        let registry = HandleRegistry::new(2);
        let ctx = context();
        let handle = registry.register(Arc::clone(&ctx));

        assert_eq!(handle.harbor(), 2);
        assert_eq!(handle.local(), 1);
        assert_eq!(ctx.handle(), handle);
        assert!(registry.contains(handle));
    }

    #[test]
    fn test_grows_and_keeps_every_handle() {
        let registry = HandleRegistry::new(1);
        let handles: Vec<Handle> = (0..40).map(|_| registry.register(context())).collect();

        assert_eq!(registry.len(), 40);
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.local(), i as u32 + 1);
            let ctx = registry.grab(*handle).unwrap();
            assert_eq!(ctx.handle(), *handle);
        }
    }

    #[test]
    fn test_retired_handle_not_reused_immediately() {
        let registry = HandleRegistry::new(1);
        let a = registry.register(context());
        assert!(registry.retire(a));
        assert!(!registry.retire(a));
        assert!(registry.grab(a).is_none());

        let b = registry.register(context());
        assert_ne!(a, b);
    }

    #[test]
    fn test_grab_holds_context_across_retire() {
        let registry = HandleRegistry::new(1);
        let ctx = context();
        let handle = registry.register(Arc::clone(&ctx));
        // Creator reference
        assert!(!ctx.release());

        let held = registry.grab(handle).unwrap();
        assert_eq!(ctx.refs(), 2);
        assert!(registry.retire(handle));
        assert_eq!(held.refs(), 1);

        drop(held);
        assert_eq!(ctx.refs(), 0);
    }

    #[test]
    fn test_name_binding() {
        let registry = HandleRegistry::new(1);
        let a = registry.register(context());
        let b = registry.register(context());

        assert_eq!(registry.bind_name(a, "foo"), Some("foo".to_string()));
        assert_eq!(registry.find_by_name("foo"), a);
        assert_eq!(registry.bind_name(b, "foo"), None);
        assert_eq!(registry.find_by_name("foo"), a);
        assert_eq!(registry.find_by_name("bar"), Handle::NONE);
    }

    #[test]
    fn test_retire_removes_names() {
        let registry = HandleRegistry::new(1);
        let a = registry.register(context());
        let b = registry.register(context());
        registry.bind_name(a, ".foo");
        registry.bind_name(a, "alias");
        registry.bind_name(b, "keep");

        registry.retire(a);
        assert_eq!(registry.find_by_name(".foo"), Handle::NONE);
        assert_eq!(registry.find_by_name("alias"), Handle::NONE);
        assert_eq!(registry.find_by_name("keep"), b);
    }

    #[test]
    fn test_retire_all() {
        let registry = HandleRegistry::new(1);
        for _ in 0..9 {
            let ctx = context();
            registry.register(Arc::clone(&ctx));
            ctx.release();
        }
        registry.retire_all();
        assert!(registry.is_empty());
        assert!(registry.handles().is_empty());
    }

    proptest! {
        #[test]
        fn prop_names_stay_sorted(names in proptest::collection::vec("[a-z]{1,6}", 1..40)) {
            let registry = HandleRegistry::new(1);
            let handle = registry.register(context());
            for name in &names {
                registry.bind_name(handle, name);
            }

            let table = registry.names();
            prop_assert!(table.windows(2).all(|w| w[0].name < w[1].name));
            for name in &names {
                prop_assert_eq!(registry.find_by_name(name), handle);
            }
        }
    }
}

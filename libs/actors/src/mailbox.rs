//! Per-service mailboxes and the global run queue
//!
//! A [`Mailbox`] is a growable ring of messages owned by one service. While a
//! mailbox has pending work it sits in the [`GlobalQueue`] exactly once; the
//! `in_global` flag enforces that, and a worker that pops a mailbox keeps it
//! unlinked for its whole turn, which is what serializes a service's callbacks.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;
use types::{Handle, Message};

/// Initial ring capacity
pub const MAILBOX_INITIAL_CAPACITY: usize = 64;

/// Backlog length that first triggers an overload report
pub const MAILBOX_OVERLOAD_THRESHOLD: usize = 1024;

struct Ring {
    slots: Vec<Option<Message>>,
    head: usize,
    tail: usize,
    in_global: bool,
    release: bool,
    overload: usize,
    overload_threshold: usize,
}

impl Ring {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(MAILBOX_INITIAL_CAPACITY);
        slots.resize_with(MAILBOX_INITIAL_CAPACITY, || None);
        Self {
            slots,
            head: 0,
            tail: 0,
            // Hidden until the owning service finishes init
            in_global: true,
            release: false,
            overload: 0,
            overload_threshold: MAILBOX_OVERLOAD_THRESHOLD,
        }
    }

    fn len(&self) -> usize {
        let cap = self.slots.len();
        if self.head <= self.tail {
            self.tail - self.head
        } else {
            self.tail + cap - self.head
        }
    }

    /// Double capacity, compacting live entries to the front
    fn expand(&mut self) {
        let cap = self.slots.len();
        let mut slots = Vec::with_capacity(cap * 2);
        for i in 0..cap {
            slots.push(self.slots[(self.head + i) % cap].take());
        }
        slots.resize_with(cap * 2, || None);
        self.slots = slots;
        self.head = 0;
        self.tail = cap;
    }

    fn push(&mut self, msg: Message) {
        let cap = self.slots.len();
        self.slots[self.tail] = Some(msg);
        self.tail = (self.tail + 1) % cap;
        if self.head == self.tail {
            self.expand();
        }
    }

    fn pop(&mut self) -> Option<Message> {
        if self.head == self.tail {
            // Drained: the next push must relink us
            self.overload_threshold = MAILBOX_OVERLOAD_THRESHOLD;
            self.in_global = false;
            return None;
        }

        let cap = self.slots.len();
        let msg = self.slots[self.head].take();
        self.head = (self.head + 1) % cap;

        let len = self.len();
        while len > self.overload_threshold {
            self.overload = len;
            self.overload_threshold *= 2;
        }
        msg
    }
}

/// Message queue of one service
pub struct Mailbox {
    handle: Handle,
    /// The queue owns linked mailboxes, so the way back is weak
    global: Weak<GlobalQueue>,
    ring: Mutex<Ring>,
    /// Set while linked into the global queue; only touched under its lock
    linked: AtomicBool,
}

impl Mailbox {
    /// Create a mailbox that the dispatcher cannot see until it is pushed
    /// with [`GlobalQueue::push`]
    pub fn new(handle: Handle, global: &Arc<GlobalQueue>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            global: Arc::downgrade(global),
            ring: Mutex::new(Ring::new()),
            linked: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Append a message, linking the mailbox into the global queue if it
    /// was idle
    pub fn push(self: &Arc<Self>, msg: Message) {
        let mut ring = self.ring.lock();
        ring.push(msg);
        if !ring.in_global {
            ring.in_global = true;
            self.link();
        }
    }

    /// Dequeue the head message
    ///
    /// A pop that finds the mailbox empty clears the in-global flag.
    pub fn pop(&self) -> Option<Message> {
        self.ring.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }

    /// Backlog recorded at the last threshold crossing, cleared on read
    pub fn take_overload(&self) -> Option<usize> {
        let mut ring = self.ring.lock();
        match ring.overload {
            0 => None,
            n => {
                ring.overload = 0;
                Some(n)
            }
        }
    }

    pub fn is_marked_for_release(&self) -> bool {
        self.ring.lock().release
    }

    /// Flag the mailbox for drain-and-free, linking it so a worker finds it
    pub fn mark_release(self: &Arc<Self>) {
        let mut ring = self.ring.lock();
        debug_assert!(!ring.release, "mailbox {} released twice", self.handle);
        ring.release = true;
        if !ring.in_global {
            ring.in_global = true;
            self.link();
        }
    }

    fn link(self: &Arc<Self>) {
        match self.global.upgrade() {
            Some(global) => global.push(Arc::clone(self)),
            None => trace!("Global queue gone, {} stays unlinked", self.handle),
        }
    }

    /// Drain a released mailbox through `drop_fn`, or put it back on the
    /// global queue when its owner has not released it yet
    ///
    /// Returns true when the mailbox was drained.
    pub fn release<F>(self: &Arc<Self>, mut drop_fn: F) -> bool
    where
        F: FnMut(Message),
    {
        let released = self.ring.lock().release;
        if released {
            while let Some(msg) = self.pop() {
                drop_fn(msg);
            }
            true
        } else {
            self.link();
            false
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("handle", &self.handle)
            .field("len", &self.len())
            .finish()
    }
}

/// FIFO of mailboxes with pending work
#[derive(Default)]
pub struct GlobalQueue {
    queue: Mutex<VecDeque<Arc<Mailbox>>>,
}

impl GlobalQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, mailbox: Arc<Mailbox>) {
        let mut queue = self.queue.lock();
        let was_linked = mailbox.linked.swap(true, Ordering::Relaxed);
        debug_assert!(!was_linked, "mailbox {} linked twice", mailbox.handle);
        queue.push_back(mailbox);
    }

    pub fn pop(&self) -> Option<Arc<Mailbox>> {
        let mut queue = self.queue.lock();
        let mailbox = queue.pop_front()?;
        mailbox.linked.store(false, Ordering::Relaxed);
        Some(mailbox)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Number of times `handle`'s mailbox is currently linked
    pub fn occurrences(&self, handle: Handle) -> usize {
        self.queue
            .lock()
            .iter()
            .filter(|mb| mb.handle == handle)
            .count()
    }
}

impl std::fmt::Debug for GlobalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalQueue")
            .field("len", &self.len())
            .finish()
    }
}

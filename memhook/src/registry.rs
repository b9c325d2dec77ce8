//! Process-wide subscriber table.
//!
//! Subscribing swaps in a new table; firing clones the current one and walks it with no lock
//! held, so a callback may subscribe, unsubscribe or trigger further events freely.
//!
//! Building a new table allocates, and an allocation may map memory through a shim that
//! fires into this same table. Table changes therefore run under the hook lock, where such
//! nested events are dropped instead of waiting on the table mutex.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::warn;

use crate::event::{EventCategory, MemEvent};
use crate::guard::HOOK_LOCK;

pub type Callback = Arc<dyn Fn(&MemEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    categories: EventCategory,
    callback: Callback,
}

pub struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<Arc<Vec<Subscriber>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Arc::new(Vec::new())),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Subscriber>> {
        Arc::clone(&self.subscribers.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn subscribe(&self, categories: EventCategory, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _guard = HOOK_LOCK.lock();
        let mut table = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = Vec::clone(&table);
        next.push(Subscriber { id, categories, callback });
        *table = Arc::new(next);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let _guard = HOOK_LOCK.lock();
        let mut table = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if !table.iter().any(|s| s.id == id) {
            return false;
        }
        let next: Vec<Subscriber> = table.iter().filter(|s| s.id != id).cloned().collect();
        *table = Arc::new(next);
        true
    }

    /// Deliver `event` to every subscriber whose mask intersects its category, in
    /// registration order. A panicking callback is logged and skipped.
    ///
    /// Returns the number of callbacks that ran to completion.
    pub fn fire(&self, event: &MemEvent) -> usize {
        let category = event.category();
        let mut delivered = 0;
        for sub in self.snapshot().iter().filter(|s| s.categories.intersects(category)) {
            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(event))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!("memory event subscriber {:?} panicked on {:?}", sub.id, event),
            }
        }
        delivered
    }

    /// Union of every subscriber's mask.
    pub fn interest(&self) -> EventCategory {
        self.snapshot()
            .iter()
            .fold(EventCategory::empty(), |acc, s| acc | s.categories)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

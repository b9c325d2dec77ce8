//! Reentrant mutual exclusion for the event path.
//!
//! An intercepted call made from inside an event callback (a subscriber that allocates, a
//! logger that maps a buffer) comes back through a shim on the same thread. The lock lets
//! that thread in again and tells it so, so the nested shim can skip firing.

use std::sync::{Condvar, Mutex};

/// Identity of the calling thread.
///
/// `std::thread::current()` may allocate on first use, which would re-enter the shims this
/// lock protects; `pthread_self` never does.
#[inline]
fn current_thread() -> libc::pthread_t {
    unsafe { libc::pthread_self() }
}

#[derive(Debug)]
struct Owner {
    thread: Option<libc::pthread_t>,
    depth: usize,
}

/// Owner + depth counter over a plain mutex and condition variable.
#[derive(Debug)]
pub struct ReentrantLock {
    state: Mutex<Owner>,
    released: Condvar,
}

impl Default for ReentrantLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ReentrantLock {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(Owner { thread: None, depth: 0 }),
            released: Condvar::new(),
        }
    }

    /// Block until the lock is free or already ours.
    pub fn lock(&self) -> ReentrantGuard<'_> {
        let me = current_thread();
        let mut owner = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match owner.thread {
                Some(t) if unsafe { libc::pthread_equal(t, me) } != 0 => {
                    owner.depth += 1;
                    return ReentrantGuard { lock: self, nested: true };
                }
                None => {
                    owner.thread = Some(me);
                    owner.depth = 1;
                    return ReentrantGuard { lock: self, nested: false };
                }
                Some(_) => {
                    owner = self.released.wait(owner).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    /// Take the lock only if that needs no waiting.
    pub fn try_lock(&self) -> Option<ReentrantGuard<'_>> {
        let me = current_thread();
        let mut owner = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match owner.thread {
            Some(t) if unsafe { libc::pthread_equal(t, me) } != 0 => {
                owner.depth += 1;
                Some(ReentrantGuard { lock: self, nested: true })
            }
            None => {
                owner.thread = Some(me);
                owner.depth = 1;
                Some(ReentrantGuard { lock: self, nested: false })
            }
            Some(_) => None,
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        let owner = self.state.lock().unwrap_or_else(|e| e.into_inner());
        owner
            .thread
            .is_some_and(|t| unsafe { libc::pthread_equal(t, current_thread()) } != 0)
    }

    fn unlock(&self) {
        let mut owner = self.state.lock().unwrap_or_else(|e| e.into_inner());
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            drop(owner);
            self.released.notify_one();
        }
    }
}

/// Held for as long as the event path runs; releases one level on drop.
#[must_use]
#[derive(Debug)]
pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
    nested: bool,
}

impl ReentrantGuard<'_> {
    /// True when this thread already held the lock, i.e. the caller is running inside an
    /// event callback.
    pub fn is_nested(&self) -> bool {
        self.nested
    }
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// The lock shared by every shim and by installation.
pub(crate) static HOOK_LOCK: ReentrantLock = ReentrantLock::new();

//! Helpers shared by the integration tests.
//!
//! Every test binary is one process with one hook mode, and tests in it run on parallel
//! threads. Events fire on the thread that made the call, so a [`Recorder`] keeps only the
//! events of the thread that created it.

#![allow(dead_code)]

pub mod scenarios;

use std::sync::{Arc, Mutex, Once};

use memhook::{Config, EventCategory, InstallReport, MemEvent, SubscriptionId};

static INIT: Once = Once::new();

/// Fix the process configuration (first caller wins) and install hooks for `events`.
pub fn install(config: Config, events: EventCategory) -> InstallReport {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        memhook::configure(config).expect("configured before any installation");
    });
    memhook::install(events).expect("hooks installed")
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub fn set_errno(value: i32) {
    unsafe { *libc::__errno_location() = value };
}

pub fn map_anon(len: usize) -> *mut libc::c_void {
    let p = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(p, libc::MAP_FAILED);
    p
}

/// Records the events fired on the creating thread until dropped.
pub struct Recorder {
    id: SubscriptionId,
    events: Arc<Mutex<Vec<MemEvent>>>,
}

impl Recorder {
    pub fn start(categories: EventCategory) -> Self {
        let events = Arc::new(Mutex::new(Vec::with_capacity(1024)));
        let sink = Arc::clone(&events);
        let me = unsafe { libc::pthread_self() };
        let id = memhook::subscribe(categories, move |e: &MemEvent| {
            if unsafe { libc::pthread_equal(libc::pthread_self(), me) } == 0 {
                return;
            }
            // Reading the log allocates; a mapping made by that read must not deadlock here.
            if let Ok(mut log) = sink.try_lock() {
                log.push(*e);
            }
        });
        Self { id, events }
    }

    pub fn events(&self) -> Vec<MemEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Recorded events touching `[address, address + length)`.
    pub fn touching(&self, address: usize, length: usize) -> Vec<MemEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.address() < address + length && address < e.address() + e.length().max(1))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        memhook::unsubscribe(self.id);
    }
}

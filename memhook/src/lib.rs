//! memhook: notification of every change to the process address space.
//!
//! The memory-management entry points (`mmap`, `munmap`, `mremap`, `shmat`, `shmdt`, `sbrk`,
//! `brk`, `madvise`) are redirected to shims that run the real call and then report what it
//! did to the subscribers of the matching [`EventCategory`]. A registration cache typically
//! subscribes to [`EventCategory::VM_UNMAPPED`] only.
//!
//! ```no_run
//! use memhook::EventCategory;
//!
//! memhook::subscribe(EventCategory::VM_UNMAPPED, |event| {
//!     let (address, length, _) = event.triple();
//!     println!("unmapped {:#x}+{:#x}", address, length);
//! });
//! memhook::install(EventCategory::VM_UNMAPPED)?;
//! # Ok::<(), memhook::InstallError>(())
//! ```
//!
//! Entry points are redirected in one of two ways, picked once per process (see
//! [`effective_mode`]): by rewriting the relocation slots through which modules call them, or
//! by overwriting their first instructions.

#[cfg(not(target_os = "linux"))]
compile_error!("memhook supports Linux only");

pub mod config;
pub mod error;
pub mod event;
pub mod guard;
pub mod installer;
pub mod mode;
pub mod registry;
mod shims;

use std::sync::Arc;

pub use config::{configure, Config};
pub use error::{ConfigError, InstallError, Result};
pub use event::{EventCategory, MemEvent};
pub use installer::{hook_descriptors, install, installed_events, HookDescriptor, InstallReport, Mechanism};
pub use mode::{effective_mode, HookMode};
pub use registry::SubscriptionId;

/// Call `callback` for every event whose category intersects `categories`.
///
/// Callbacks run synchronously on the thread that made the call, after the call completed.
/// Memory operations made from inside a callback are not reported.
pub fn subscribe<F>(categories: EventCategory, callback: F) -> SubscriptionId
where
    F: Fn(&MemEvent) + Send + Sync + 'static,
{
    registry::registry().subscribe(categories, Arc::new(callback))
}

/// Returns false if `id` was not subscribed.
pub fn unsubscribe(id: SubscriptionId) -> bool {
    registry::registry().unsubscribe(id)
}

//! memhook-intercept: code patching and relocation rebinding used by memhook.
//!
//! Two ways of redirecting a function are provided:
//!
//! * [`Interceptor::replace`] overwrites the first instructions of the target with a jump and
//!   hands back a trampoline that still runs the original code.
//! * [`module::rebind_symbol`] rewrites the relocation slots (`.got` / `.got.plt`) through which
//!   every loaded module calls the target, leaving the code untouched.

pub mod arch;
pub mod code;
pub mod interceptor;
pub mod module;
pub mod types;

pub use interceptor::Interceptor;
pub use types::{HookError, Mapping, ModuleInfo, Result, SlotPatch};

/// Process-global lock for tests that modify executable code.
///
/// Patching the same function from two tests at once crashes the test binary.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _ = env_logger::builder().is_test(true).try_init();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

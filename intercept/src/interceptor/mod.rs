use crate::types::{HookError, Result};
use core::ffi::c_void;
use std::collections::HashMap;
use std::sync::Mutex;

#[cfg(target_arch = "aarch64")]
mod replace_arm64;

#[cfg(target_arch = "x86_64")]
mod replace_x86_64;

struct ReplacementEntry {
    /// First overwritten byte; differs from the function address when an `endbr64` was skipped.
    site: usize,
    original_bytes: Vec<u8>,
    trampoline: usize,
}

/// Redirects functions by rewriting their first instructions.
///
/// A replaced function jumps straight to its replacement. The trampoline returned by
/// [`replace`](Self::replace) runs the overwritten instructions, relocated, and continues in
/// the original body, so the replacement can still reach the real implementation.
pub struct Interceptor {
    replace_map: Mutex<HashMap<usize, ReplacementEntry>>,
}

impl Interceptor {
    pub fn obtain() -> &'static Interceptor {
        static INSTANCE: std::sync::OnceLock<Interceptor> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(|| Interceptor {
            replace_map: Mutex::new(HashMap::new()),
        })
    }

    /// Redirect `function` to `replacement`; returns the trampoline to the original code.
    ///
    /// # Safety
    /// `function` must be the entry of a function in mapped code and `replacement` a function
    /// with the same signature. Callers must not be executing inside the first instructions
    /// of `function` while it is patched.
    pub unsafe fn replace(&self, function: *mut c_void, replacement: *const c_void) -> Result<*const c_void> {
        let key = function as usize;
        let mut map = self.replace_map.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&key) {
            return Err(HookError::AlreadyPatched(key));
        }

        #[cfg(target_arch = "aarch64")]
        let entry = replace_arm64::replace(function as usize, replacement as usize)?;
        #[cfg(target_arch = "x86_64")]
        let entry = replace_x86_64::replace(function as usize, replacement as usize)?;
        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
        let entry: ReplacementEntry = {
            let _ = replacement;
            return Err(HookError::Unsupported);
        };

        log::debug!(
            "replaced {:#x}: {} bytes at {:#x}, trampoline {:#x}",
            key,
            entry.original_bytes.len(),
            entry.site,
            entry.trampoline
        );
        let trampoline = entry.trampoline as *const c_void;
        map.insert(key, entry);
        Ok(trampoline)
    }

    /// Put the original instructions of `function` back.
    ///
    /// The trampoline stays mapped, since a thread may still be running through it.
    ///
    /// # Safety
    /// No thread may be executing the patched bytes.
    pub unsafe fn revert(&self, function: *mut c_void) -> Result<()> {
        let mut map = self.replace_map.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = map.remove(&(function as usize)) else {
            return Ok(());
        };
        crate::code::patcher::patch_code(entry.site as *mut u8, &entry.original_bytes)
    }

    pub fn is_replaced(&self, function: *const c_void) -> bool {
        self.replace_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&(function as usize))
    }
}

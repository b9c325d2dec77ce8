//! Loaded-module introspection: symbol lookup, relocation slot rebinding and the address
//! space map.

#[cfg(not(target_os = "linux"))]
use crate::types::{HookError, Mapping, ModuleInfo, Result, SlotPatch};

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(not(target_os = "linux"))]
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    Vec::new()
}

#[cfg(not(target_os = "linux"))]
pub fn find_global_export_by_name(symbol: &str) -> Result<usize> {
    Err(HookError::SymbolNotFound(symbol.to_string()))
}

#[cfg(not(target_os = "linux"))]
pub fn read_mappings() -> Vec<Mapping> {
    Vec::new()
}

#[cfg(not(target_os = "linux"))]
pub fn find_mapping(_addr: usize) -> Option<Mapping> {
    None
}

/// # Safety
/// Not supported on this platform.
#[cfg(not(target_os = "linux"))]
pub unsafe fn rebind_symbol(_names: &[&str], _replacement: usize) -> Result<Vec<SlotPatch>> {
    Err(HookError::Unsupported)
}

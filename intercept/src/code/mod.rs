//! Executable memory: allocation of trampoline slabs, patching of live code and cache
//! maintenance.

pub mod allocator;
pub mod cache;
pub mod patcher;

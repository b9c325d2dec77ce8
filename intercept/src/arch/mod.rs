//! Instruction-set specific pieces: decoders, relocators and code writers.
//!
//! Everything that depends on instruction length or alignment is reachable through the
//! small surface at the bottom of this file, so callers never look at opcodes themselves.

#[cfg(target_arch = "aarch64")]
pub mod arm64;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

use crate::types::{HookError, Result};

/// Whether functions can be redirected by rewriting their first instructions.
pub const INLINE_PATCHING: bool = cfg!(any(target_arch = "x86_64", target_arch = "aarch64"));

/// A branch to itself (`jmp $` / `b .`).
///
/// Written over the head of a patch site before the rest of the sequence, so a thread that
/// enters the function mid-update spins for a moment instead of executing a torn sequence.
#[cfg(target_arch = "x86_64")]
pub const PARK_INSN: &[u8] = &[0xEB, 0xFE];

#[cfg(target_arch = "aarch64")]
pub const PARK_INSN: &[u8] = &[0x00, 0x00, 0x00, 0x14];

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const PARK_INSN: &[u8] = &[];

/// Number of bytes that must be overwritten at `code` to fit a redirect of `redirect_len`
/// bytes without leaving a partial instruction behind.
///
/// Fails when the function ends (return, trap, unconditional jump) before `redirect_len`
/// bytes are covered.
///
/// # Safety
/// `code` must point to readable instructions.
pub unsafe fn patch_length(code: *const u8, redirect_len: usize) -> Result<usize> {
    #[cfg(target_arch = "x86_64")]
    {
        let covered = x86_64::relocator::can_relocate(code, redirect_len);
        if covered < redirect_len {
            return Err(HookError::Relocation(code as usize));
        }
        Ok(covered)
    }

    #[cfg(target_arch = "aarch64")]
    {
        let n = redirect_len.div_ceil(4);
        if arm64::relocator::can_relocate(code as *const u32, n) < n {
            return Err(HookError::Relocation(code as usize));
        }
        Ok(n * 4)
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = (code, redirect_len);
        Err(HookError::Unsupported)
    }
}

use core::sync::atomic::{fence, AtomicU64, AtomicUsize, Ordering};

use crate::arch::PARK_INSN;
use crate::code::cache::invalidate_icache;
use crate::module;
use crate::types::{HookError, Result};

#[inline]
fn debug_enabled() -> bool {
    std::env::var_os("MEMHOOK_HOOK_DEBUG").is_some()
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn page_span(addr: usize, len: usize) -> (usize, usize) {
    let page = page_size();
    let start = addr & !(page - 1);
    let end = (addr + len + page - 1) & !(page - 1);
    (start, end - start)
}

/// Current protection of the page holding `addr`, read from the kernel's view of the address
/// space.
fn current_protection(addr: usize) -> Option<i32> {
    module::find_mapping(addr).map(|m| m.prot)
}

fn within_word(addr: usize, len: usize) -> bool {
    (addr & 7) + len <= 8
}

/// Store `bytes` with one aligned 64-bit store when they fit inside a single aligned word.
///
/// Returns false when the range straddles a word boundary.
unsafe fn store_within_word(addr: *mut u8, bytes: &[u8]) -> bool {
    if !within_word(addr as usize, bytes.len()) {
        return false;
    }
    let word_addr = (addr as usize) & !7;
    let shift = (addr as usize) - word_addr;
    let word = &*(word_addr as *const AtomicU64);
    let mut value = word.load(Ordering::Relaxed).to_le_bytes();
    value[shift..shift + bytes.len()].copy_from_slice(bytes);
    word.store(u64::from_le_bytes(value), Ordering::Release);
    true
}

/// Write `bytes` over live code with no thread ever executing a torn sequence.
///
/// * Patches that fit in one aligned word go out as a single atomic store.
/// * Longer patches first park the head with a branch-to-self, then write the tail, then
///   replace the park with the real head. A thread entering mid-update spins on the park
///   until the head lands.
///
/// The park itself must land in one store, so a longer patch whose first two bytes straddle
/// a word boundary (the last byte of a word, on x86-64) is refused with
/// [`HookError::Misaligned`]. Instructions on arm64 are word aligned and never hit this.
///
/// The pages are made RWX for the duration and their previous protection restored.
///
/// # Safety
/// `addr` must point to `bytes.len()` bytes of mapped code. Threads may be executing the
/// surrounding code but not the middle of the overwritten instructions.
pub unsafe fn patch_code(addr: *mut u8, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let park = PARK_INSN.len().min(bytes.len());
    if park > 0 && !within_word(addr as usize, bytes.len()) && !within_word(addr as usize, park) {
        return Err(HookError::Misaligned(addr as usize));
    }

    let (page_start, map_size) = page_span(addr as usize, bytes.len());
    let restore = current_protection(addr as usize).unwrap_or(libc::PROT_READ | libc::PROT_EXEC);

    if libc::mprotect(
        page_start as *mut libc::c_void,
        map_size,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    ) != 0
    {
        return Err(HookError::protection(page_start, map_size));
    }

    if PARK_INSN.is_empty() {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr, bytes.len());
    } else if !store_within_word(addr, bytes) {
        let (head, tail) = bytes.split_at(park);

        store_within_word(addr, &PARK_INSN[..park]);
        fence(Ordering::SeqCst);
        invalidate_icache(addr, park);

        core::ptr::copy_nonoverlapping(tail.as_ptr(), addr.add(park), tail.len());
        fence(Ordering::SeqCst);
        invalidate_icache(addr.add(park), tail.len());

        // Same span as the park.
        store_within_word(addr, head);
        fence(Ordering::SeqCst);
    }

    if libc::mprotect(page_start as *mut libc::c_void, map_size, restore) != 0 && debug_enabled() {
        log::debug!(
            "patcher: could not restore protection {:#x} on {:#x}+{:#x}",
            restore,
            page_start,
            map_size
        );
    }

    // Whole pages, after restoring protection, so neighbouring patches on the same page
    // never see stale lines.
    invalidate_icache(page_start as *mut u8, map_size);
    Ok(())
}

/// Atomically replace the pointer stored in a relocation slot, returning the old value.
///
/// Slots in `.got` are often read-only after relocation processing (RELRO); the page is
/// made writable for the store and its protection restored afterwards.
///
/// # Safety
/// `slot` must be an aligned, mapped pointer-sized relocation slot.
pub unsafe fn write_slot(slot: *mut usize, value: usize) -> Result<usize> {
    let addr = slot as usize;
    let prot = current_protection(addr).unwrap_or(libc::PROT_READ);
    let writable = prot & libc::PROT_WRITE != 0;
    let (page_start, map_size) = page_span(addr, core::mem::size_of::<usize>());

    if !writable
        && libc::mprotect(page_start as *mut libc::c_void, map_size, prot | libc::PROT_WRITE) != 0
    {
        return Err(HookError::protection(page_start, map_size));
    }

    let previous = (*(slot as *const AtomicUsize)).swap(value, Ordering::AcqRel);

    if !writable && libc::mprotect(page_start as *mut libc::c_void, map_size, prot) != 0 && debug_enabled() {
        log::debug!("patcher: slot page {:#x} left writable", page_start);
    }
    Ok(previous)
}

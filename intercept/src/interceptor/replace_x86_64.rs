use super::ReplacementEntry;
use crate::arch::patch_length;
use crate::arch::x86_64::relocator::{is_endbr64, X86_64Relocator};
use crate::arch::x86_64::writer::{X86_64Writer, ENDBR64, JMP_FAR_LEN, JMP_NEAR_LEN};
use crate::code::allocator::CodeAllocator;
use crate::code::patcher::patch_code;
use crate::types::Result;

/// Maximum distance for which a `jmp rel32` is guaranteed to reach (±2 GiB).
const NEAR_RANGE: usize = 0x7FFF_0000;

/// Longest patch: a far jump plus the tail of the instruction it lands in the middle of.
const MAX_PATCH: usize = JMP_FAR_LEN + 15;

pub(super) unsafe fn replace(function: usize, replacement: usize) -> Result<ReplacementEntry> {
    // Keep the landing pad so the function stays a valid indirect-branch target.
    let site = if is_endbr64(function as *const u8) { function + ENDBR64.len() } else { function };
    let site_pc = site as u64;

    let mut alloc = CodeAllocator::default();
    let slice = alloc.alloc_near(site as *const u8, NEAR_RANGE).or_else(|_| alloc.alloc_any())?;

    let slab_near = X86_64Writer::near_reachable(site_pc, slice.pc as u64)
        && X86_64Writer::near_reachable(site_pc, slice.pc as u64 + slice.size as u64);
    let replacement_near = X86_64Writer::near_reachable(site_pc, replacement as u64);
    let redirect_len = if replacement_near || slab_near { JMP_NEAR_LEN } else { JMP_FAR_LEN };

    let covered = match patch_length(site as *const u8, redirect_len) {
        Ok(n) => n,
        Err(e) => {
            alloc.free(slice);
            return Err(e);
        }
    };

    // Trampoline: endbr64, relocated prologue, jump back. A relay to a far replacement
    // follows it when the slab is near enough for the short redirect.
    let mut w = X86_64Writer::new(slice.data, slice.size, slice.pc as u64);
    w.put_bytes(&ENDBR64);
    let mut r = X86_64Relocator::new(site as *const u8, site_pc);
    // Instruction boundaries are already known; this can still fail on a displacement that
    // no longer fits from the slab.
    if let Err(e) = r.relocate_bytes(&mut w, covered) {
        alloc.free(slice);
        return Err(e);
    }
    w.put_jmp_address(site_pc + covered as u64);

    let redirect_target = if replacement_near || !slab_near {
        replacement as u64
    } else {
        let relay = w.pc();
        w.put_jmp_far(replacement as u64);
        relay
    };
    alloc.make_executable(&slice)?;

    let mut stub = [0u8; MAX_PATCH];
    let mut s = X86_64Writer::new(stub.as_mut_ptr(), stub.len(), site_pc);
    if redirect_len == JMP_NEAR_LEN {
        s.put_jmp_near(redirect_target);
    } else {
        s.put_jmp_far(redirect_target);
    }
    s.put_nop_n(covered - s.offset());

    let original_bytes = core::slice::from_raw_parts(site as *const u8, covered).to_vec();
    if let Err(e) = patch_code(site as *mut u8, &stub[..covered]) {
        alloc.free(slice);
        return Err(e);
    }

    Ok(ReplacementEntry { site, original_bytes, trampoline: slice.pc as usize })
}

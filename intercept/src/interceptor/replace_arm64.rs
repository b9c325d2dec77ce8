use super::ReplacementEntry;
use crate::arch::arm64::relocator::Arm64Relocator;
use crate::arch::arm64::writer::{Arm64Writer, BRANCH_ABS_LEN};
use crate::arch::patch_length;
use crate::code::allocator::CodeAllocator;
use crate::code::patcher::patch_code;
use crate::types::Result;

/// Reach of a plain `b` (±128 MiB), less a page of slack for the slab itself.
const B_RANGE: usize = (128 << 20) - 0x1000;

pub(super) unsafe fn replace(function: usize, replacement: usize) -> Result<ReplacementEntry> {
    let site_pc = function as u64;

    let mut alloc = CodeAllocator::default();
    let slice = alloc.alloc_near(function as *const u8, B_RANGE).or_else(|_| alloc.alloc_any())?;
    let slab_near = Arm64Writer::b_reachable(site_pc, slice.pc as u64)
        && Arm64Writer::b_reachable(site_pc, slice.pc as u64 + slice.size as u64);
    let replacement_near = Arm64Writer::b_reachable(site_pc, replacement as u64);

    // One `b` when the replacement or a relay is in reach, `ldr x16; br x16; .quad` otherwise.
    let redirect_len = if replacement_near || slab_near { 4 } else { BRANCH_ABS_LEN };
    let n = match patch_length(function as *const u8, redirect_len) {
        Ok(len) => len / 4,
        Err(e) => {
            alloc.free(slice);
            return Err(e);
        }
    };

    let mut w = Arm64Writer::new(slice.data, slice.size, slice.pc as u64);
    let mut r = Arm64Relocator::new(function as *const u32, site_pc);
    if let Err(e) = r.relocate_insns(&mut w, n) {
        alloc.free(slice);
        return Err(e);
    }
    w.put_branch_address(site_pc + (n as u64) * 4);

    let redirect_target = if replacement_near || !slab_near {
        replacement as u64
    } else {
        let relay = w.pc();
        w.put_branch_address(replacement as u64);
        relay
    };
    alloc.make_executable(&slice)?;

    let mut stub = [0u32; BRANCH_ABS_LEN / 4];
    let mut s = Arm64Writer::new(stub.as_mut_ptr() as *mut u8, BRANCH_ABS_LEN, site_pc);
    if n == 1 {
        s.put_b_rel(redirect_target as i64 - site_pc as i64);
    } else {
        s.put_branch_address(redirect_target);
    }
    let len = n * 4;
    let stub_bytes = core::slice::from_raw_parts(stub.as_ptr() as *const u8, len);

    let original_bytes = core::slice::from_raw_parts(function as *const u8, len).to_vec();
    if let Err(e) = patch_code(function as *mut u8, stub_bytes) {
        alloc.free(slice);
        return Err(e);
    }

    Ok(ReplacementEntry { site: function, original_bytes, trampoline: slice.pc as usize })
}

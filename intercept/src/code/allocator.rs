use crate::module;
use crate::types::{HookError, Result};

/// A block of memory that will hold generated code.
///
/// `data` is where the code is written and `pc` is where it runs; on Linux they coincide.
#[derive(Debug)]
pub struct CodeSlice {
    pub data: *mut u8,
    pub pc: *const u8,
    pub size: usize,
}

unsafe impl Send for CodeSlice {}
unsafe impl Sync for CodeSlice {}

#[derive(Debug)]
pub struct CodeAllocator {
    slab_size: usize,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self { slab_size: page_size() }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Map `len` bytes RW at exactly `addr`, refusing to clobber an existing mapping.
///
/// Kernels older than 4.17 ignore `MAP_FIXED_NOREPLACE` and treat the address as a hint, so
/// the returned address is checked and a misplaced mapping released.
#[cfg(target_os = "linux")]
unsafe fn map_fixed_noreplace(addr: usize, len: usize) -> Option<*mut u8> {
    let ptr = libc::mmap(
        addr as *mut libc::c_void,
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        return None;
    }
    if ptr as usize != addr {
        libc::munmap(ptr, len);
        return None;
    }
    Some(ptr as *mut u8)
}

/// Candidate start of a `need`-byte slab inside the free gap `[gap_start, gap_end)`, as close
/// to `near` as the gap allows.
fn place_in_gap(near: usize, gap_start: usize, gap_end: usize, need: usize, page: usize) -> Option<usize> {
    let gap_start = (gap_start + page - 1) & !(page - 1);
    let gap_end = gap_end & !(page - 1);
    if gap_end <= gap_start || gap_end - gap_start < need {
        return None;
    }
    Some(near.clamp(gap_start, gap_end - need) & !(page - 1))
}

impl CodeAllocator {
    pub fn new(slab_size: usize) -> Self {
        let page = page_size();
        Self { slab_size: slab_size.max(page).next_multiple_of(page) }
    }

    /// Allocate a slab whose every byte lies within `max_distance` of `near`.
    ///
    /// Walks the gaps between existing mappings nearest first. Unlike [`alloc_any`] this never
    /// falls back to an arbitrary address, since callers rely on the distance to encode
    /// short branches.
    ///
    /// [`alloc_any`]: Self::alloc_any
    pub fn alloc_near(&mut self, near: *const u8, max_distance: usize) -> Result<CodeSlice> {
        #[cfg(target_os = "linux")]
        unsafe {
            let near_u = near as usize;
            let page = page_size();
            let need = self.slab_size;
            let win_start = near_u.saturating_sub(max_distance).max(page);
            let win_end = near_u.saturating_add(max_distance).saturating_sub(need);

            let maps = module::read_mappings();
            let mut gaps: Vec<(usize, usize)> = Vec::new();
            let mut prev_end = win_start;
            for m in &maps {
                if m.start > prev_end {
                    gaps.push((prev_end, m.start.min(win_end + need)));
                }
                prev_end = prev_end.max(m.end);
                if prev_end >= win_end + need {
                    break;
                }
            }
            if prev_end < win_end + need {
                gaps.push((prev_end, win_end + need));
            }

            let mut candidates: Vec<usize> = gaps
                .iter()
                .filter_map(|&(s, e)| place_in_gap(near_u, s, e, need, page))
                .filter(|&c| c >= win_start && c <= win_end)
                .collect();
            candidates.sort_by_key(|&c| c.abs_diff(near_u));

            for candidate in candidates {
                if let Some(ptr) = map_fixed_noreplace(candidate, need) {
                    log::debug!("code slab at {:#x} for target {:#x}", candidate, near_u);
                    return Ok(CodeSlice { data: ptr, pc: ptr, size: need });
                }
            }
            Err(HookError::AllocationFailed)
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = (near, max_distance);
            Err(HookError::Unsupported)
        }
    }

    pub fn alloc_any(&mut self) -> Result<CodeSlice> {
        #[cfg(target_os = "linux")]
        unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                self.slab_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(HookError::AllocationFailed);
            }
            Ok(CodeSlice {
                data: ptr as *mut u8,
                pc: ptr as *const u8,
                size: self.slab_size,
            })
        }

        #[cfg(not(target_os = "linux"))]
        {
            Err(HookError::Unsupported)
        }
    }

    /// Flip a slab from RW to RX once its code is written.
    ///
    /// # Safety
    /// `slice` must come from this allocator and nothing may be executing in it.
    pub unsafe fn make_executable(&self, slice: &CodeSlice) -> Result<()> {
        if libc::mprotect(
            slice.data as *mut libc::c_void,
            slice.size,
            libc::PROT_READ | libc::PROT_EXEC,
        ) != 0
        {
            return Err(HookError::protection(slice.data as usize, slice.size));
        }
        crate::code::cache::invalidate_icache(slice.data, slice.size);
        Ok(())
    }

    /// Return a slab that was never made reachable.
    ///
    /// # Safety
    /// No code may jump into `slice`.
    pub unsafe fn free(&self, slice: CodeSlice) {
        libc::munmap(slice.data as *mut libc::c_void, slice.size);
    }
}

/// Make freshly written instructions visible to instruction fetch.
///
/// AArch64 instruction and data caches are not coherent, so code written through the data
/// side must be cleaned to the point of unification and the matching I-cache lines
/// invalidated. x86_64 keeps them coherent and needs nothing.
///
/// # Safety
/// `addr` must point to at least `size` bytes of mapped memory.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        extern "C" {
            fn __clear_cache(beg: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(addr as *mut libc::c_void, addr.add(size) as *mut libc::c_void);
    }

    #[cfg(not(all(target_os = "linux", target_arch = "aarch64")))]
    {
        let _ = (addr, size);
    }
}

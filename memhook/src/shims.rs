//! Replacements for the intercepted entry points.
//!
//! Every shim calls the real implementation first, then reports what changed. The real call
//! goes through the address the installer stored for it: the resolved symbol under
//! relocation patching, the trampoline under instruction patching. Until that address is
//! stored (a call racing with installation) the shim issues the system call itself.

use core::ffi::{c_char, c_int, c_void};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::cell::Cell;

use libc::{off_t, size_t};

use crate::event::MemEvent;
use crate::guard::HOOK_LOCK;
use crate::registry::registry;

/// Address of the real implementation of one entry point; 0 until installed.
#[derive(Debug)]
pub(crate) struct Original(AtomicUsize);

impl Original {
    const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub(crate) fn set(&self, address: usize) {
        self.0.store(address, Ordering::Release);
    }

    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

pub(crate) struct Originals {
    pub mmap: Original,
    pub munmap: Original,
    pub mremap: Original,
    pub shmat: Original,
    pub shmdt: Original,
    pub sbrk: Original,
    pub brk: Original,
    pub madvise: Original,
    pub dlopen: Original,
}

pub(crate) static ORIGINALS: Originals = Originals {
    mmap: Original::new(),
    munmap: Original::new(),
    mremap: Original::new(),
    shmat: Original::new(),
    shmdt: Original::new(),
    sbrk: Original::new(),
    brk: Original::new(),
    madvise: Original::new(),
    dlopen: Original::new(),
};

type MmapFn = unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void;
type MunmapFn = unsafe extern "C" fn(*mut c_void, size_t) -> c_int;
type MremapFn = unsafe extern "C" fn(*mut c_void, size_t, size_t, c_int, ...) -> *mut c_void;
type ShmatFn = unsafe extern "C" fn(c_int, *const c_void, c_int) -> *mut c_void;
type ShmdtFn = unsafe extern "C" fn(*const c_void) -> c_int;
type SbrkFn = unsafe extern "C" fn(libc::intptr_t) -> *mut c_void;
type BrkFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type MadviseFn = unsafe extern "C" fn(*mut c_void, size_t, c_int) -> c_int;
type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;

thread_local! {
    // glibc's sbrk moves the break through brk; the outer sbrk shim reports the change.
    static IN_SBRK: Cell<bool> = const { Cell::new(false) };
}

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(value: c_int) {
    unsafe { *libc::__errno_location() = value };
}

/// Keeps `errno` as the real call left it, whatever the event path does to it.
struct ErrnoGuard(c_int);

impl ErrnoGuard {
    fn save() -> Self {
        Self(errno())
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        set_errno(self.0);
    }
}

/// Fire `events` unless this thread is already inside the event path.
fn dispatch(events: &[MemEvent]) {
    let guard = HOOK_LOCK.lock();
    if guard.is_nested() {
        return;
    }
    let registry = registry();
    for event in events {
        registry.fire(event);
    }
}

/// Current program break, straight from the kernel.
pub(crate) fn current_break() -> usize {
    unsafe { libc::syscall(libc::SYS_brk, 0usize) as usize }
}

fn page_align(len: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
    (len + page - 1) & !(page - 1)
}

unsafe fn real_mmap(addr: *mut c_void, length: size_t, prot: c_int, flags: c_int, fd: c_int, offset: off_t) -> *mut c_void {
    match ORIGINALS.mmap.get() {
        0 => libc::syscall(libc::SYS_mmap, addr, length, prot, flags, fd, offset) as *mut c_void,
        f => core::mem::transmute::<usize, MmapFn>(f)(addr, length, prot, flags, fd, offset),
    }
}

unsafe fn real_munmap(addr: *mut c_void, length: size_t) -> c_int {
    match ORIGINALS.munmap.get() {
        0 => libc::syscall(libc::SYS_munmap, addr, length) as c_int,
        f => core::mem::transmute::<usize, MunmapFn>(f)(addr, length),
    }
}

unsafe fn real_mremap(old: *mut c_void, old_size: size_t, new_size: size_t, flags: c_int, new_address: *mut c_void) -> *mut c_void {
    match ORIGINALS.mremap.get() {
        0 => libc::syscall(libc::SYS_mremap, old, old_size, new_size, flags, new_address) as *mut c_void,
        f => core::mem::transmute::<usize, MremapFn>(f)(old, old_size, new_size, flags, new_address),
    }
}

unsafe fn real_shmat(shmid: c_int, shmaddr: *const c_void, shmflg: c_int) -> *mut c_void {
    match ORIGINALS.shmat.get() {
        0 => libc::syscall(libc::SYS_shmat, shmid, shmaddr, shmflg) as *mut c_void,
        f => core::mem::transmute::<usize, ShmatFn>(f)(shmid, shmaddr, shmflg),
    }
}

unsafe fn real_shmdt(shmaddr: *const c_void) -> c_int {
    match ORIGINALS.shmdt.get() {
        0 => libc::syscall(libc::SYS_shmdt, shmaddr) as c_int,
        f => core::mem::transmute::<usize, ShmdtFn>(f)(shmaddr),
    }
}

unsafe fn real_brk(addr: *mut c_void) -> c_int {
    match ORIGINALS.brk.get() {
        0 => {
            let new = libc::syscall(libc::SYS_brk, addr) as usize;
            if new < addr as usize {
                set_errno(libc::ENOMEM);
                -1
            } else {
                0
            }
        }
        f => core::mem::transmute::<usize, BrkFn>(f)(addr),
    }
}

unsafe fn real_sbrk(increment: libc::intptr_t) -> *mut c_void {
    match ORIGINALS.sbrk.get() {
        0 => {
            let old = current_break();
            let want = old.wrapping_add_signed(increment);
            if increment == 0 || libc::syscall(libc::SYS_brk, want) as usize == want {
                old as *mut c_void
            } else {
                set_errno(libc::ENOMEM);
                usize::MAX as *mut c_void
            }
        }
        f => core::mem::transmute::<usize, SbrkFn>(f)(increment),
    }
}

unsafe fn real_madvise(addr: *mut c_void, length: size_t, advice: c_int) -> c_int {
    match ORIGINALS.madvise.get() {
        0 => libc::syscall(libc::SYS_madvise, addr, length, advice) as c_int,
        f => core::mem::transmute::<usize, MadviseFn>(f)(addr, length, advice),
    }
}

pub(crate) unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let result = real_mmap(addr, length, prot, flags, fd, offset);
    if result == libc::MAP_FAILED {
        return result;
    }
    let _errno = ErrnoGuard::save();
    let address = result as usize;
    let mapped = [
        MemEvent::Mmap { address, length, prot, flags, fd, offset: offset as i64 },
        MemEvent::VmMapped { address, length },
    ];
    if flags & libc::MAP_FIXED != 0 {
        dispatch(&[MemEvent::VmUnmapped { address, length }, mapped[0], mapped[1]]);
    } else {
        dispatch(&mapped);
    }
    result
}

pub(crate) unsafe extern "C" fn munmap(addr: *mut c_void, length: size_t) -> c_int {
    let result = real_munmap(addr, length);
    if result != 0 {
        return result;
    }
    let _errno = ErrnoGuard::save();
    let address = addr as usize;
    dispatch(&[
        MemEvent::Munmap { address, length },
        MemEvent::VmUnmapped { address, length },
    ]);
    result
}

/// Aggregate events for a successful remap of `[old, old+old_len)` to `[new, new+new_len)`.
///
/// A move unmaps the whole old range and maps the whole new one. In place, only the
/// difference is reported: a shrink unmaps the tail, a grow maps the extension.
pub(crate) fn remap_vm_events(old: usize, old_len: usize, new: usize, new_len: usize) -> [Option<MemEvent>; 2] {
    if new != old {
        [
            Some(MemEvent::VmUnmapped { address: old, length: old_len }),
            Some(MemEvent::VmMapped { address: new, length: new_len }),
        ]
    } else if new_len < old_len {
        [Some(MemEvent::VmUnmapped { address: old + new_len, length: old_len - new_len }), None]
    } else if new_len > old_len {
        [Some(MemEvent::VmMapped { address: old + old_len, length: new_len - old_len }), None]
    } else {
        [None, None]
    }
}

/// `mremap(old, old_size, new_size, flags, ...)`. The optional fifth argument is only read
/// by the kernel when `MREMAP_FIXED` is set; it is always forwarded.
pub(crate) unsafe extern "C" fn mremap(
    old_address: *mut c_void,
    old_size: size_t,
    new_size: size_t,
    flags: c_int,
    new_address: *mut c_void,
) -> *mut c_void {
    let result = real_mremap(old_address, old_size, new_size, flags, new_address);
    if result == libc::MAP_FAILED {
        return result;
    }
    let _errno = ErrnoGuard::save();
    let (old, new) = (old_address as usize, result as usize);
    let [a, b] = remap_vm_events(old, old_size, new, new_size);
    let remap = MemEvent::Mremap { old_address: old, old_length: old_size, new_address: new, new_length: new_size };
    match (a, b) {
        (Some(a), Some(b)) => dispatch(&[remap, a, b]),
        (Some(a), None) => dispatch(&[remap, a]),
        _ => dispatch(&[remap]),
    }
    result
}

/// Size of an attached segment. The segment may already be marked for removal, or the caller
/// may lack permission to stat it; the address space map still knows the attachment.
pub(crate) fn segment_length(shmid: c_int, address: usize) -> Option<usize> {
    let mut ds: libc::shmid_ds = unsafe { core::mem::zeroed() };
    if unsafe { libc::shmctl(shmid, libc::IPC_STAT, &mut ds) } == 0 {
        return Some(page_align(ds.shm_segsz as usize));
    }
    let guard = HOOK_LOCK.lock();
    if guard.is_nested() {
        return None;
    }
    memhook_intercept::module::find_mapping(address).map(|m| m.end - address)
}

pub(crate) unsafe extern "C" fn shmat(shmid: c_int, shmaddr: *const c_void, shmflg: c_int) -> *mut c_void {
    let result = real_shmat(shmid, shmaddr, shmflg);
    if result as isize == -1 {
        return result;
    }
    let _errno = ErrnoGuard::save();
    let address = result as usize;
    let Some(length) = segment_length(shmid, address) else {
        return result;
    };
    let attached = [
        MemEvent::Shmat { address, length, shmid, shmflg },
        MemEvent::VmMapped { address, length },
    ];
    if !shmaddr.is_null() && shmflg & libc::SHM_REMAP != 0 {
        dispatch(&[MemEvent::VmUnmapped { address, length }, attached[0], attached[1]]);
    } else {
        dispatch(&attached);
    }
    result
}

pub(crate) unsafe extern "C" fn shmdt(shmaddr: *const c_void) -> c_int {
    let address = shmaddr as usize;
    // Look the segment up while it is still attached; the lookup's own allocations must
    // not be reported.
    let length = {
        let _errno = ErrnoGuard::save();
        let guard = HOOK_LOCK.lock();
        if guard.is_nested() {
            None
        } else {
            memhook_intercept::module::find_mapping(address).map(|m| m.end - address)
        }
    };

    let result = real_shmdt(shmaddr);
    if result != 0 {
        return result;
    }
    if let Some(length) = length {
        let _errno = ErrnoGuard::save();
        dispatch(&[
            MemEvent::Shmdt { address, length },
            MemEvent::VmUnmapped { address, length },
        ]);
    }
    result
}

/// VM event for a break moving from `old` to `new`.
pub(crate) fn break_vm_event(old: usize, new: usize) -> Option<MemEvent> {
    match new.cmp(&old) {
        core::cmp::Ordering::Greater => Some(MemEvent::VmMapped { address: old, length: new - old }),
        core::cmp::Ordering::Less => Some(MemEvent::VmUnmapped { address: new, length: old - new }),
        core::cmp::Ordering::Equal => None,
    }
}

pub(crate) unsafe extern "C" fn sbrk(increment: libc::intptr_t) -> *mut c_void {
    if increment == 0 {
        return real_sbrk(0);
    }
    let old_break = current_break();
    IN_SBRK.with(|f| f.set(true));
    let result = real_sbrk(increment);
    IN_SBRK.with(|f| f.set(false));
    if result as isize == -1 {
        return result;
    }
    let _errno = ErrnoGuard::save();
    let new_break = current_break();
    let sbrk = MemEvent::Sbrk { increment, old_break, new_break };
    match break_vm_event(old_break, new_break) {
        Some(vm) => dispatch(&[sbrk, vm]),
        None => dispatch(&[sbrk]),
    }
    result
}

pub(crate) unsafe extern "C" fn brk(addr: *mut c_void) -> c_int {
    if IN_SBRK.with(|f| f.get()) {
        return real_brk(addr);
    }
    let old_break = current_break();
    let result = real_brk(addr);
    if result != 0 {
        return result;
    }
    let _errno = ErrnoGuard::save();
    let new_break = current_break();
    if let Some(vm) = break_vm_event(old_break, new_break) {
        dispatch(&[MemEvent::Brk { old_break, new_break }, vm]);
    }
    result
}

/// Advice after which the kernel may drop the pages' contents.
fn discards_pages(advice: c_int) -> bool {
    matches!(advice, libc::MADV_DONTNEED | libc::MADV_REMOVE | libc::MADV_FREE)
}

pub(crate) unsafe extern "C" fn madvise(addr: *mut c_void, length: size_t, advice: c_int) -> c_int {
    let result = real_madvise(addr, length, advice);
    if result != 0 {
        return result;
    }
    let _errno = ErrnoGuard::save();
    let address = addr as usize;
    let advise = MemEvent::Madvise { address, length, advice };
    if discards_pages(advice) {
        dispatch(&[advise, MemEvent::VmUnmapped { address, length }]);
    } else {
        dispatch(&[advise]);
    }
    result
}

/// Relocation mode only: patch the slots of whatever the call just loaded.
pub(crate) unsafe extern "C" fn dlopen(filename: *const c_char, flag: c_int) -> *mut c_void {
    let real = match ORIGINALS.dlopen.get() {
        0 => return core::ptr::null_mut(),
        f => core::mem::transmute::<usize, DlopenFn>(f),
    };
    let handle = real(filename, flag);
    if handle.is_null() {
        return handle;
    }
    let _errno = ErrnoGuard::save();
    let guard = HOOK_LOCK.lock();
    if !guard.is_nested() {
        crate::installer::rebind_loaded_modules();
    }
    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_length_falls_back_to_the_address_space_map() {
        let page = page_align(1);
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                4 * page,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(base, libc::MAP_FAILED);
        let middle = base as usize + page;
        assert_eq!(unsafe { libc::mprotect(middle as *mut c_void, 2 * page, libc::PROT_READ) }, 0);

        assert_eq!(segment_length(-1, middle), Some(2 * page));
        assert_eq!(segment_length(-1, middle + page), Some(page));
        assert_eq!(segment_length(-1, 0x1000), None);

        unsafe { libc::munmap(base, 4 * page) };
    }

    #[test]
    fn moved_remap_unmaps_old_then_maps_new() {
        assert_eq!(
            remap_vm_events(0x1000, 0x1000, 0x8000, 0x2000),
            [
                Some(MemEvent::VmUnmapped { address: 0x1000, length: 0x1000 }),
                Some(MemEvent::VmMapped { address: 0x8000, length: 0x2000 }),
            ]
        );
    }

    #[test]
    fn in_place_remap_reports_only_the_difference() {
        assert_eq!(
            remap_vm_events(0x1000, 0x3000, 0x1000, 0x1000),
            [Some(MemEvent::VmUnmapped { address: 0x2000, length: 0x2000 }), None]
        );
        assert_eq!(
            remap_vm_events(0x1000, 0x1000, 0x1000, 0x4000),
            [Some(MemEvent::VmMapped { address: 0x2000, length: 0x3000 }), None]
        );
        assert_eq!(remap_vm_events(0x1000, 0x1000, 0x1000, 0x1000), [None, None]);
    }

    #[test]
    fn break_moves_map_to_vm_events() {
        assert_eq!(break_vm_event(0x1000, 0x3000), Some(MemEvent::VmMapped { address: 0x1000, length: 0x2000 }));
        assert_eq!(break_vm_event(0x3000, 0x2000), Some(MemEvent::VmUnmapped { address: 0x2000, length: 0x1000 }));
        assert_eq!(break_vm_event(0x3000, 0x3000), None);
    }

    #[test]
    fn shim_called_before_install_falls_back_to_syscall() {
        unsafe {
            set_errno(0);
            let p = mmap(
                core::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(p, libc::MAP_FAILED);
            assert_eq!(munmap(p, 4096), 0);

            assert_eq!(munmap(8usize as *mut c_void, 4096), -1);
            assert_eq!(errno(), libc::EINVAL);
        }
    }

    #[test]
    fn discarding_advice_is_recognised() {
        assert!(discards_pages(libc::MADV_DONTNEED));
        assert!(discards_pages(libc::MADV_FREE));
        assert!(!discards_pages(libc::MADV_WILLNEED));
    }
}

//! Redirects the memory-mapping entry points to the shims.
//!
//! Installation is additive: each call hooks the entry points needed for the requested
//! categories that are not hooked yet and leaves the rest alone. A hook, once in place, stays
//! for the life of the process.

use core::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use memhook_intercept::{module, HookError, Interceptor};

use crate::config;
use crate::error::{InstallError, Result};
use crate::event::{EventCategory, MemEvent};
use crate::guard::{ReentrantGuard, HOOK_LOCK};
use crate::mode::{effective_mode, HookMode};
use crate::registry::registry;
use crate::shims::{self, Original, ORIGINALS};

/// One interceptable entry point.
pub(crate) struct EntryPoint {
    pub name: &'static str,
    /// Other names resolving to the same implementation; relocation slots may use either.
    pub aliases: &'static [&'static str],
    /// Categories whose events this entry point produces.
    pub categories: EventCategory,
    pub shim: fn() -> usize,
    pub original: &'static Original,
}

const VM: EventCategory = EventCategory::VM;

pub(crate) static ENTRY_POINTS: [EntryPoint; 8] = [
    EntryPoint {
        name: "mmap",
        aliases: &["mmap64"],
        categories: EventCategory::MMAP.union(VM),
        shim: || shims::mmap as usize,
        original: &ORIGINALS.mmap,
    },
    EntryPoint {
        name: "munmap",
        aliases: &[],
        categories: EventCategory::MUNMAP.union(EventCategory::VM_UNMAPPED),
        shim: || shims::munmap as usize,
        original: &ORIGINALS.munmap,
    },
    EntryPoint {
        name: "mremap",
        aliases: &[],
        categories: EventCategory::MREMAP.union(VM),
        shim: || shims::mremap as usize,
        original: &ORIGINALS.mremap,
    },
    EntryPoint {
        name: "shmat",
        aliases: &[],
        categories: EventCategory::SHMAT.union(VM),
        shim: || shims::shmat as usize,
        original: &ORIGINALS.shmat,
    },
    EntryPoint {
        name: "shmdt",
        aliases: &[],
        categories: EventCategory::SHMDT.union(EventCategory::VM_UNMAPPED),
        shim: || shims::shmdt as usize,
        original: &ORIGINALS.shmdt,
    },
    EntryPoint {
        name: "sbrk",
        aliases: &[],
        categories: EventCategory::SBRK.union(VM),
        shim: || shims::sbrk as usize,
        original: &ORIGINALS.sbrk,
    },
    EntryPoint {
        name: "brk",
        aliases: &[],
        categories: EventCategory::BRK.union(VM),
        shim: || shims::brk as usize,
        original: &ORIGINALS.brk,
    },
    EntryPoint {
        name: "madvise",
        aliases: &[],
        categories: EventCategory::MADVISE.union(EventCategory::VM_UNMAPPED),
        shim: || shims::madvise as usize,
        original: &ORIGINALS.madvise,
    },
];

static DLOPEN: EntryPoint = EntryPoint {
    name: "dlopen",
    aliases: &[],
    categories: EventCategory::empty(),
    shim: || shims::dlopen as usize,
    original: &ORIGINALS.dlopen,
};

/// How a hook was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// Relocation slots rewritten in the modules loaded at the time.
    Reloc { slots: usize },
    /// Entry instructions overwritten; `trampoline` runs the original code.
    Bistro { trampoline: usize },
}

/// A hook in place. Never changes once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDescriptor {
    pub symbol: &'static str,
    /// Resolved address of the real implementation.
    pub target: usize,
    pub shim: usize,
    pub mechanism: Mechanism,
}

/// Result of a successful [`install`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub mode: HookMode,
    /// Categories covered after this call, including earlier installations.
    pub installed: EventCategory,
    /// Entry points hooked by this call.
    pub newly_hooked: Vec<&'static str>,
}

/// Redirects one entry point to its shim.
pub(crate) trait PatchMechanism: Sync {
    fn mode(&self) -> HookMode;

    /// Make `entry` call its shim and store the address the shim must call instead.
    ///
    /// # Safety
    /// `target` must be the resolved address of `entry`.
    unsafe fn apply(&self, entry: &EntryPoint, target: usize) -> std::result::Result<HookDescriptor, HookError>;
}

struct RelocPatch;

impl RelocPatch {
    unsafe fn rebind(entry: &EntryPoint) -> std::result::Result<usize, HookError> {
        let names: Vec<&str> = std::iter::once(entry.name).chain(entry.aliases.iter().copied()).collect();
        match module::rebind_symbol(&names, (entry.shim)()) {
            Ok(patched) => Ok(patched.len()),
            // Nothing loaded calls it yet; modules loaded later are patched from the dlopen shim.
            Err(HookError::NoRelocationSlot(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl PatchMechanism for RelocPatch {
    fn mode(&self) -> HookMode {
        HookMode::Reloc
    }

    unsafe fn apply(&self, entry: &EntryPoint, target: usize) -> std::result::Result<HookDescriptor, HookError> {
        // The first patched slot may be called right away.
        entry.original.set(target);
        let slots = Self::rebind(entry)?;
        Ok(HookDescriptor {
            symbol: entry.name,
            target,
            shim: (entry.shim)(),
            mechanism: Mechanism::Reloc { slots },
        })
    }
}

struct BistroPatch;

impl PatchMechanism for BistroPatch {
    fn mode(&self) -> HookMode {
        HookMode::Bistro
    }

    unsafe fn apply(&self, entry: &EntryPoint, target: usize) -> std::result::Result<HookDescriptor, HookError> {
        let shim = (entry.shim)();
        let trampoline =
            Interceptor::obtain().replace(target as *mut c_void, shim as *const c_void)? as usize;
        entry.original.set(trampoline);
        Ok(HookDescriptor {
            symbol: entry.name,
            target,
            shim,
            mechanism: Mechanism::Bistro { trampoline },
        })
    }
}

fn mechanism_for(mode: HookMode) -> &'static dyn PatchMechanism {
    match mode {
        HookMode::Bistro => &BistroPatch,
        HookMode::Reloc | HookMode::Auto => &RelocPatch,
    }
}

#[derive(Default)]
struct InstallState {
    hooks: Vec<HookDescriptor>,
    dlopen_hooked: bool,
}

impl InstallState {
    fn is_hooked(&self, name: &str) -> bool {
        self.hooks.iter().any(|h| h.symbol == name)
    }

    /// Categories every producing entry point of which is hooked.
    fn covered(&self) -> EventCategory {
        EventCategory::all()
            .iter()
            .filter(|&category| {
                ENTRY_POINTS
                    .iter()
                    .filter(|e| e.categories.contains(category))
                    .all(|e| self.is_hooked(e.name))
            })
            .fold(EventCategory::empty(), |acc, c| acc | c)
    }
}

static STATE: Mutex<InstallState> = Mutex::new(InstallState { hooks: Vec::new(), dlopen_hooked: false });

/// The install state together with the hook lock, always taken in that order.
///
/// Anything done with the state may allocate, and an allocation may reach a shim that waits
/// for the hook lock. Holding the hook lock first turns that into a nested, silent call.
struct LockedState {
    state: MutexGuard<'static, InstallState>,
    _hook: ReentrantGuard<'static>,
}

impl Deref for LockedState {
    type Target = InstallState;

    fn deref(&self) -> &InstallState {
        &self.state
    }
}

impl DerefMut for LockedState {
    fn deref_mut(&mut self) -> &mut InstallState {
        &mut self.state
    }
}

fn state() -> LockedState {
    let hook = HOOK_LOCK.lock();
    LockedState {
        state: STATE.lock().unwrap_or_else(|e| e.into_inner()),
        _hook: hook,
    }
}

/// Hook every entry point needed to report `events`.
///
/// Entry points already hooked are skipped, so repeated and overlapping calls are cheap. When
/// some entry point cannot be hooked the others still are, and the error reports what is
/// covered.
pub fn install(events: EventCategory) -> Result<InstallReport> {
    let config = config::current();
    let mode = effective_mode();
    let mechanism = mechanism_for(mode);

    let (installed, newly_hooked, failures) = {
        // Shims reached from this thread while patching see a nested guard and stay quiet.
        let mut state = state();
        let mut newly_hooked = Vec::new();
        let mut failures = Vec::new();

        for entry in ENTRY_POINTS.iter().filter(|e| e.categories.intersects(events)) {
            if state.is_hooked(entry.name) {
                continue;
            }
            match hook(mechanism, entry) {
                Ok(descriptor) => {
                    debug!("hooked {} ({:?})", entry.name, descriptor.mechanism);
                    state.hooks.push(descriptor);
                    newly_hooked.push(entry.name);
                }
                Err(e) => {
                    warn!("cannot hook {} in {} mode: {}", entry.name, mechanism.mode(), e);
                    failures.push((entry.name, e));
                }
            }
        }

        if mode == HookMode::Reloc && config.reloc_hook_dlopen && !state.dlopen_hooked {
            match hook(mechanism, &DLOPEN) {
                Ok(descriptor) => {
                    state.hooks.push(descriptor);
                    state.dlopen_hooked = true;
                }
                Err(e) => warn!("modules loaded later will not be patched: {}", e),
            }
        }

        (state.covered(), newly_hooked, failures)
    };

    info!(
        "memory hooks ({} mode): requested {:?}, installed {:?}, {} new",
        mode,
        events,
        installed,
        newly_hooked.len()
    );

    if !failures.is_empty() {
        return Err(InstallError::Partial { covered: installed & events, failures });
    }

    if config.verify_install && !newly_hooked.is_empty() {
        let missing = verify(events & installed);
        if !missing.is_empty() {
            warn!("installed hooks produced no event for {:?}", missing);
            return Err(InstallError::Verification { missing });
        }
    }

    Ok(InstallReport { mode, installed, newly_hooked })
}

fn hook(mechanism: &dyn PatchMechanism, entry: &EntryPoint) -> std::result::Result<HookDescriptor, HookError> {
    let target = module::find_global_export_by_name(entry.name)?;
    unsafe { mechanism.apply(entry, target) }
}

/// Patch the relocation slots of modules loaded since the hooks were installed.
///
/// Called from the dlopen shim with the hook lock held; taking it again here only nests.
pub(crate) fn rebind_loaded_modules() {
    let state = state();
    for entry in ENTRY_POINTS.iter().chain(std::iter::once(&DLOPEN)) {
        if !state.is_hooked(entry.name) {
            continue;
        }
        match unsafe { RelocPatch::rebind(entry) } {
            Ok(0) => {}
            Ok(n) => debug!("patched {} new slot(s) for {}", n, entry.name),
            Err(e) => warn!("cannot patch new slots for {}: {}", entry.name, e),
        }
    }
}

/// Categories for which every producing entry point is hooked.
pub fn installed_events() -> EventCategory {
    state().covered()
}

/// Every hook in place, in installation order.
pub fn hook_descriptors() -> Vec<HookDescriptor> {
    state().hooks.clone()
}

/// Exercise the hooked entry points and return the categories that produced no event.
///
/// Operations the process cannot perform at all (no SysV shared memory, say) are not
/// counted as missing.
fn verify(expected: EventCategory) -> EventCategory {
    let seen = Arc::new(AtomicU32::new(0));
    let sink = Arc::clone(&seen);
    let me = unsafe { libc::pthread_self() };
    let id = registry().subscribe(
        expected,
        Arc::new(move |e: &MemEvent| {
            if unsafe { libc::pthread_equal(libc::pthread_self(), me) } != 0 {
                sink.fetch_or(e.category().bits(), Ordering::Relaxed);
            }
        }),
    );

    let exercised = unsafe { exercise(expected) };

    registry().unsubscribe(id);
    (expected & exercised) - EventCategory::from_bits_truncate(seen.load(Ordering::Relaxed))
}

/// Run one successful call per requested operation; returns the categories those calls
/// should have produced.
unsafe fn exercise(categories: EventCategory) -> EventCategory {
    let page = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let anon = |len: usize| {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    let mut done = EventCategory::empty();

    if categories.intersects(EventCategory::MMAP | EventCategory::MUNMAP | VM) {
        let p = anon(page);
        if p != libc::MAP_FAILED {
            done |= EventCategory::MMAP | EventCategory::VM_MAPPED;
            if libc::munmap(p, page) == 0 {
                done |= EventCategory::MUNMAP | EventCategory::VM_UNMAPPED;
            }
        }
    }

    if categories.intersects(EventCategory::MREMAP) {
        let p = anon(page);
        if p != libc::MAP_FAILED {
            let q = libc::mremap(p, page, 2 * page, libc::MREMAP_MAYMOVE);
            if q == libc::MAP_FAILED {
                libc::munmap(p, page);
            } else {
                done |= EventCategory::MREMAP;
                libc::munmap(q, 2 * page);
            }
        }
    }

    if categories.intersects(EventCategory::MADVISE) {
        let p = anon(page);
        if p != libc::MAP_FAILED {
            if libc::madvise(p, page, libc::MADV_DONTNEED) == 0 {
                done |= EventCategory::MADVISE;
            }
            libc::munmap(p, page);
        }
    }

    if categories.intersects(EventCategory::SHMAT | EventCategory::SHMDT) {
        let id = libc::shmget(libc::IPC_PRIVATE, page, libc::IPC_CREAT | 0o600);
        if id >= 0 {
            let p = libc::shmat(id, core::ptr::null(), 0);
            if p as isize != -1 {
                done |= EventCategory::SHMAT;
                if libc::shmdt(p) == 0 {
                    done |= EventCategory::SHMDT;
                }
            }
            libc::shmctl(id, libc::IPC_RMID, core::ptr::null_mut());
        }
    }

    if categories.intersects(EventCategory::SBRK | EventCategory::BRK) {
        let base = libc::sbrk(page as libc::intptr_t);
        if base as isize != -1 {
            done |= EventCategory::SBRK;
            let top = (base as usize + page) as *mut c_void;
            // Give the page back only if nothing else moved the break meanwhile.
            if libc::sbrk(0) == top && libc::brk(base) == 0 {
                done |= EventCategory::BRK;
            }
        }
    }

    done
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_category_has_a_producer() {
        for category in EventCategory::all().iter() {
            assert!(
                ENTRY_POINTS.iter().any(|e| e.categories.contains(category)),
                "{:?} has no entry point",
                category
            );
        }
    }

    #[test]
    fn coverage_requires_every_producer() {
        let mut state = InstallState::default();
        let dummy = |symbol: &'static str| HookDescriptor { symbol, target: 0, shim: 0, mechanism: Mechanism::Reloc { slots: 0 } };
        state.hooks.push(dummy("munmap"));
        assert_eq!(state.covered(), EventCategory::MUNMAP);

        for name in ["mmap", "mremap", "shmat", "shmdt", "sbrk", "brk"] {
            state.hooks.push(dummy(name));
        }
        assert!(!state.covered().contains(EventCategory::VM_UNMAPPED));
        assert!(state.covered().contains(EventCategory::VM_MAPPED));

        state.hooks.push(dummy("madvise"));
        assert_eq!(state.covered(), EventCategory::all());
    }

    #[test]
    fn state_queries_wait_for_the_hook_lock() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = thread::spawn(move || {
            let _g = HOOK_LOCK.lock();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        held_rx.recv().unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let reader = thread::spawn(move || {
            let hooks = hook_descriptors();
            let events = installed_events();
            done_tx.send((hooks.len(), events)).unwrap();
        });

        // Queries never hold the state lock while waiting for the hook lock.
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(STATE.try_lock().is_ok());

        release_tx.send(()).unwrap();
        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        holder.join().unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn mechanism_follows_mode() {
        assert_eq!(mechanism_for(HookMode::Reloc).mode(), HookMode::Reloc);
        assert_eq!(mechanism_for(HookMode::Bistro).mode(), HookMode::Bistro);
    }

    #[test]
    fn shims_are_distinct() {
        let mut shims: Vec<usize> = ENTRY_POINTS.iter().map(|e| (e.shim)()).collect();
        shims.push((DLOPEN.shim)());
        shims.sort_unstable();
        shims.dedup();
        assert_eq!(shims.len(), ENTRY_POINTS.len() + 1);
    }
}

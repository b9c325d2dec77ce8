//! Behaviour every hook mode must show. Each mode's test binary calls these after
//! configuring itself.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use memhook::{EventCategory, MemEvent};

use super::{errno, map_anon, page_size, set_errno, Recorder};

pub fn map_then_unmap_reports_exact_ranges() {
    let rec = Recorder::start(EventCategory::MMAP | EventCategory::MUNMAP);

    let a = map_anon(4096) as usize;
    let mapped = rec.touching(a, 4096);
    assert_eq!(mapped.len(), 1, "{:?}", mapped);
    assert_eq!(mapped[0].triple(), (a, 4096, EventCategory::MMAP));

    rec.clear();
    assert_eq!(unsafe { libc::munmap(a as *mut libc::c_void, 4096) }, 0);
    let unmapped = rec.touching(a, 4096);
    assert_eq!(unmapped, vec![MemEvent::Munmap { address: a, length: 4096 }]);
}

pub fn aggregate_events_follow_map_and_unmap() {
    let rec = Recorder::start(EventCategory::VM);
    let len = 2 * page_size();
    let a = map_anon(len) as usize;
    assert_eq!(unsafe { libc::munmap(a as *mut libc::c_void, len) }, 0);
    assert_eq!(
        rec.touching(a, len),
        vec![
            MemEvent::VmMapped { address: a, length: len },
            MemEvent::VmUnmapped { address: a, length: len },
        ]
    );
}

pub fn failed_calls_fire_nothing_and_keep_errno() {
    let rec = Recorder::start(EventCategory::MMAP | EventCategory::MUNMAP | EventCategory::VM);

    // Not anonymous, and no file.
    let p = unsafe {
        libc::mmap(std::ptr::null_mut(), 4096, libc::PROT_READ, libc::MAP_PRIVATE, -1, 0)
    };
    assert_eq!(p, libc::MAP_FAILED);
    assert_eq!(errno(), libc::EBADF);

    // Misaligned.
    assert_eq!(unsafe { libc::munmap(1usize as *mut libc::c_void, 4096) }, -1);
    assert_eq!(errno(), libc::EINVAL);

    let events = rec.events();
    assert!(
        !events.iter().any(|e| matches!(e, MemEvent::Mmap { flags, .. } if *flags == libc::MAP_PRIVATE)),
        "{:?}",
        events
    );
    assert!(rec.touching(0, 4096).is_empty(), "{:?}", events);
}

pub fn successful_call_leaves_errno_alone() {
    let _rec = Recorder::start(EventCategory::MUNMAP | EventCategory::VM);
    let a = map_anon(4096);
    set_errno(12345);
    assert_eq!(unsafe { libc::munmap(a, 4096) }, 0);
    assert_eq!(errno(), 12345);
}

pub fn callback_mapping_memory_is_not_reentered() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let me = unsafe { libc::pthread_self() };
    let id = memhook::subscribe(EventCategory::MUNMAP, move |_| {
        if unsafe { libc::pthread_equal(libc::pthread_self(), me) } == 0 {
            return;
        }
        counter.fetch_add(1, Ordering::SeqCst);
        let inner = map_anon(4096);
        unsafe { libc::munmap(inner, 4096) };
    });

    let a = map_anon(4096);
    assert_eq!(unsafe { libc::munmap(a, 4096) }, 0);
    memhook::unsubscribe(id);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

pub fn concurrent_threads_see_their_own_events() {
    let handles: Vec<_> = (0..2)
        .map(|t| {
            thread::spawn(move || {
                let page = page_size();
                let rec = Recorder::start(EventCategory::MUNMAP | EventCategory::MADVISE);
                let mut expected = Vec::new();
                for _ in 0..50 {
                    let p = map_anon(page);
                    if t == 0 {
                        assert_eq!(unsafe { libc::munmap(p, page) }, 0);
                        expected.push(MemEvent::Munmap { address: p as usize, length: page });
                    } else {
                        assert_eq!(unsafe { libc::madvise(p, page, libc::MADV_WILLNEED) }, 0);
                        expected.push(MemEvent::Madvise {
                            address: p as usize,
                            length: page,
                            advice: libc::MADV_WILLNEED,
                        });
                        unsafe { libc::munmap(p, page) };
                    }
                }
                let seen: Vec<MemEvent> = rec
                    .events()
                    .into_iter()
                    .filter(|e| if t == 0 { matches!(e, MemEvent::Munmap { .. }) } else { matches!(e, MemEvent::Madvise { .. }) })
                    .collect();
                for e in &expected {
                    assert!(seen.contains(e), "thread {} missed {:?}", t, e);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

pub fn relocating_remap_unmaps_old_then_maps_new() {
    let page = page_size();
    let a = map_anon(page) as usize;
    let b = map_anon(2 * page) as usize;

    let rec = Recorder::start(EventCategory::VM | EventCategory::MREMAP);
    let moved = unsafe {
        libc::mremap(
            a as *mut libc::c_void,
            page,
            2 * page,
            libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
            b as *mut libc::c_void,
        )
    };
    assert_eq!(moved as usize, b);

    let events = rec.events();
    let remap = MemEvent::Mremap { old_address: a, old_length: page, new_address: b, new_length: 2 * page };
    let vm: Vec<MemEvent> = events.iter().copied().filter(|e| e.category().intersects(EventCategory::VM)).collect();
    assert!(events.contains(&remap), "{:?}", events);
    assert_eq!(
        vm,
        vec![
            MemEvent::VmUnmapped { address: a, length: page },
            MemEvent::VmMapped { address: b, length: 2 * page },
        ]
    );

    unsafe { libc::munmap(b as *mut libc::c_void, 2 * page) };
}

pub fn in_place_shrink_unmaps_the_tail() {
    let page = page_size();
    let a = map_anon(3 * page) as usize;

    let rec = Recorder::start(EventCategory::VM_UNMAPPED);
    let p = unsafe { libc::mremap(a as *mut libc::c_void, 3 * page, page, 0) };
    assert_eq!(p as usize, a);
    assert_eq!(
        rec.touching(a, 3 * page),
        vec![MemEvent::VmUnmapped { address: a + page, length: 2 * page }]
    );

    unsafe { libc::munmap(p, page) };
}

pub fn discarding_advice_unmaps() {
    let page = page_size();
    let a = map_anon(page);
    let rec = Recorder::start(EventCategory::MADVISE | EventCategory::VM_UNMAPPED);
    assert_eq!(unsafe { libc::madvise(a, page, libc::MADV_DONTNEED) }, 0);
    let address = a as usize;
    assert_eq!(
        rec.touching(address, page),
        vec![
            MemEvent::Madvise { address, length: page, advice: libc::MADV_DONTNEED },
            MemEvent::VmUnmapped { address, length: page },
        ]
    );
    unsafe { libc::munmap(a, page) };
}

pub fn fixed_map_replaces_then_maps() {
    let page = page_size();
    let a = map_anon(page);
    let rec = Recorder::start(EventCategory::VM);
    let p = unsafe {
        libc::mmap(
            a,
            page,
            libc::PROT_READ,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    assert_eq!(p, a);
    let address = a as usize;
    assert_eq!(
        rec.touching(address, page),
        vec![
            MemEvent::VmUnmapped { address, length: page },
            MemEvent::VmMapped { address, length: page },
        ]
    );
    unsafe { libc::munmap(a, page) };
}

pub fn shared_memory_attach_and_detach() {
    let page = page_size();
    let id = unsafe { libc::shmget(libc::IPC_PRIVATE, page, libc::IPC_CREAT | 0o600) };
    if id < 0 {
        eprintln!("SysV shared memory unavailable, skipping");
        return;
    }
    let rec = Recorder::start(EventCategory::SHMAT | EventCategory::SHMDT);
    let p = unsafe { libc::shmat(id, std::ptr::null(), 0) };
    assert_ne!(p as isize, -1);
    assert_eq!(unsafe { libc::shmdt(p) }, 0);
    unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) };

    let address = p as usize;
    assert_eq!(
        rec.touching(address, page),
        vec![
            MemEvent::Shmat { address, length: page, shmid: id, shmflg: 0 },
            MemEvent::Shmdt { address, length: page },
        ]
    );
}

pub fn heap_shrink_reports_exactly_the_released_bytes() {
    let page = page_size();
    let base = unsafe { libc::sbrk(2 * page as libc::intptr_t) };
    assert_ne!(base as isize, -1);
    let top = base as usize + 2 * page;
    if unsafe { libc::sbrk(0) } as usize != top {
        eprintln!("program break moved concurrently, skipping");
        return;
    }

    let rec = Recorder::start(EventCategory::VM_UNMAPPED | EventCategory::SBRK);
    let old = unsafe { libc::sbrk(-(page as libc::intptr_t)) };
    assert_eq!(old as usize, top);

    let unmapped: Vec<MemEvent> = rec
        .events()
        .into_iter()
        .filter(|e| e.category() == EventCategory::VM_UNMAPPED)
        .collect();
    assert_eq!(unmapped, vec![MemEvent::VmUnmapped { address: top - page, length: page }]);
    assert!(rec.events().contains(&MemEvent::Sbrk {
        increment: -(page as isize),
        old_break: top,
        new_break: top - page,
    }));

    if unsafe { libc::sbrk(0) } as usize == top - page {
        unsafe { libc::brk(base) };
    }
}

pub fn zero_increment_is_silent() {
    let rec = Recorder::start(EventCategory::SBRK | EventCategory::BRK | EventCategory::VM);
    let now = unsafe { libc::sbrk(0) };
    assert_ne!(now as isize, -1);
    assert_eq!(unsafe { libc::brk(now) }, 0);
    let events = rec.events();
    assert!(
        !events.iter().any(|e| matches!(e, MemEvent::Sbrk { .. } | MemEvent::Brk { .. })),
        "{:?}",
        events
    );
}

pub fn install_twice_changes_nothing() {
    let mask = EventCategory::MUNMAP | EventCategory::MADVISE;
    let first = memhook::install(mask).expect("installed");
    let before: Vec<_> = memhook::hook_descriptors()
        .into_iter()
        .filter(|h| ["munmap", "madvise"].contains(&h.symbol))
        .collect();

    let second = memhook::install(mask).expect("installed again");
    let after: Vec<_> = memhook::hook_descriptors()
        .into_iter()
        .filter(|h| ["munmap", "madvise"].contains(&h.symbol))
        .collect();

    assert_eq!(before.len(), 2);
    assert_eq!(before, after);
    assert!(second.newly_hooked.is_empty());
    assert!(first.installed.contains(mask));
    assert!(memhook::installed_events().contains(mask));
}

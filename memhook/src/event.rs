use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// What a subscriber wants to hear about.
    ///
    /// The per-operation categories mirror the intercepted entry points. `VM_MAPPED` and
    /// `VM_UNMAPPED` summarise them by effect on the address space, which is all a
    /// registration cache needs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventCategory: u32 {
        const MMAP = 1 << 0;
        const MUNMAP = 1 << 1;
        const MREMAP = 1 << 2;
        const SHMAT = 1 << 3;
        const SHMDT = 1 << 4;
        const SBRK = 1 << 5;
        const BRK = 1 << 6;
        const MADVISE = 1 << 7;
        const VM_MAPPED = 1 << 16;
        const VM_UNMAPPED = 1 << 17;
    }
}

impl EventCategory {
    /// The two aggregate categories.
    pub const VM: Self = Self::VM_MAPPED.union(Self::VM_UNMAPPED);
}

/// One change to the address space, reported after the real operation succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemEvent {
    Mmap {
        address: usize,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    },
    Munmap {
        address: usize,
        length: usize,
    },
    Mremap {
        old_address: usize,
        old_length: usize,
        new_address: usize,
        new_length: usize,
    },
    Shmat {
        address: usize,
        length: usize,
        shmid: i32,
        shmflg: i32,
    },
    Shmdt {
        address: usize,
        length: usize,
    },
    /// `increment` is the argument; the affected range lies between the two breaks.
    Sbrk {
        increment: isize,
        old_break: usize,
        new_break: usize,
    },
    Brk {
        old_break: usize,
        new_break: usize,
    },
    Madvise {
        address: usize,
        length: usize,
        advice: i32,
    },
    VmMapped {
        address: usize,
        length: usize,
    },
    VmUnmapped {
        address: usize,
        length: usize,
    },
}

impl MemEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            MemEvent::Mmap { .. } => EventCategory::MMAP,
            MemEvent::Munmap { .. } => EventCategory::MUNMAP,
            MemEvent::Mremap { .. } => EventCategory::MREMAP,
            MemEvent::Shmat { .. } => EventCategory::SHMAT,
            MemEvent::Shmdt { .. } => EventCategory::SHMDT,
            MemEvent::Sbrk { .. } => EventCategory::SBRK,
            MemEvent::Brk { .. } => EventCategory::BRK,
            MemEvent::Madvise { .. } => EventCategory::MADVISE,
            MemEvent::VmMapped { .. } => EventCategory::VM_MAPPED,
            MemEvent::VmUnmapped { .. } => EventCategory::VM_UNMAPPED,
        }
    }

    /// Start of the affected range. For a remap this is the new location; for a break
    /// change it is the lower of the two breaks.
    pub fn address(&self) -> usize {
        match *self {
            MemEvent::Mmap { address, .. }
            | MemEvent::Munmap { address, .. }
            | MemEvent::Shmat { address, .. }
            | MemEvent::Shmdt { address, .. }
            | MemEvent::Madvise { address, .. }
            | MemEvent::VmMapped { address, .. }
            | MemEvent::VmUnmapped { address, .. } => address,
            MemEvent::Mremap { new_address, .. } => new_address,
            MemEvent::Sbrk { old_break, new_break, .. } | MemEvent::Brk { old_break, new_break } => {
                old_break.min(new_break)
            }
        }
    }

    pub fn length(&self) -> usize {
        match *self {
            MemEvent::Mmap { length, .. }
            | MemEvent::Munmap { length, .. }
            | MemEvent::Shmat { length, .. }
            | MemEvent::Shmdt { length, .. }
            | MemEvent::Madvise { length, .. }
            | MemEvent::VmMapped { length, .. }
            | MemEvent::VmUnmapped { length, .. } => length,
            MemEvent::Mremap { new_length, .. } => new_length,
            MemEvent::Sbrk { old_break, new_break, .. } | MemEvent::Brk { old_break, new_break } => {
                old_break.abs_diff(new_break)
            }
        }
    }

    /// `(address, length, category)`.
    pub fn triple(&self) -> (usize, usize, EventCategory) {
        (self.address(), self.length(), self.category())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_events_cover_the_delta_in_either_direction() {
        let grow = MemEvent::Brk { old_break: 0x1000, new_break: 0x3000 };
        assert_eq!(grow.triple(), (0x1000, 0x2000, EventCategory::BRK));

        let shrink = MemEvent::Sbrk { increment: -0x800, old_break: 0x3000, new_break: 0x2800 };
        assert_eq!(shrink.triple(), (0x2800, 0x800, EventCategory::SBRK));
    }

    #[test]
    fn remap_reports_new_range() {
        let e = MemEvent::Mremap { old_address: 0x1000, old_length: 0x1000, new_address: 0x9000, new_length: 0x2000 };
        assert_eq!(e.triple(), (0x9000, 0x2000, EventCategory::MREMAP));
    }

    #[test]
    fn aggregate_mask_intersects_only_vm_events() {
        let unmapped = MemEvent::VmUnmapped { address: 0, length: 1 };
        let munmap = MemEvent::Munmap { address: 0, length: 1 };
        assert!(EventCategory::VM.intersects(unmapped.category()));
        assert!(!EventCategory::VM.intersects(munmap.category()));
    }
}

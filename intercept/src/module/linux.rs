use crate::code::patcher;
use crate::types::{HookError, Mapping, ModuleInfo, Result, SlotPatch};
use core::ffi::c_void;
use std::ffi::CStr;

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

unsafe fn module_path(info: &libc::dl_phdr_info) -> String {
    if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
        // Empty name is the main executable.
        match std::fs::read_link("/proc/self/exe") {
            Ok(p) => p.to_string_lossy().into_owned(),
            Err(_) => String::new(),
        }
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    }
}

/// Enumerate all loaded shared objects via `dl_iterate_phdr`.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let modules = &mut *(data as *mut Vec<ModuleInfo>);
        let info = &*info;
        let path = module_path(info);

        let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let mut lo = u64::MAX;
        let mut hi = 0u64;
        for phdr in phdrs.iter().filter(|p| p.p_type == libc::PT_LOAD && p.p_memsz > 0) {
            lo = lo.min(phdr.p_vaddr);
            hi = hi.max(phdr.p_vaddr + phdr.p_memsz);
        }
        let (base, size) = if lo == u64::MAX {
            (info.dlpi_addr as usize, 0)
        } else {
            ((info.dlpi_addr + lo) as usize, (hi - lo) as usize)
        };

        let name = if path.is_empty() { String::from("[unknown]") } else { basename(&path).to_string() };
        modules.push(ModuleInfo { name, path, base_address: base, size });
        0
    }

    let mut modules: Vec<ModuleInfo> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut modules as *mut Vec<ModuleInfo> as *mut c_void);
    }
    modules
}

/// Resolve a symbol the way an undefined reference in the main program would, using
/// `dlsym(RTLD_DEFAULT, ...)`.
pub fn find_global_export_by_name(symbol: &str) -> Result<usize> {
    let cstr = std::ffi::CString::new(symbol).map_err(|_| HookError::SymbolNotFound(symbol.to_string()))?;
    let p = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cstr.as_ptr()) };
    if p.is_null() {
        Err(HookError::SymbolNotFound(symbol.to_string()))
    } else {
        Ok(p as usize)
    }
}

fn parse_maps_line(line: &str) -> Option<Mapping> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    let perms = fields.next()?.as_bytes();
    if perms.len() < 4 {
        return None;
    }
    let mut prot = libc::PROT_NONE;
    if perms[0] == b'r' {
        prot |= libc::PROT_READ;
    }
    if perms[1] == b'w' {
        prot |= libc::PROT_WRITE;
    }
    if perms[2] == b'x' {
        prot |= libc::PROT_EXEC;
    }
    let shared = perms[3] == b's';
    // offset, device, inode
    let path = fields.nth(3).map(|p| {
        let rest: Vec<&str> = core::iter::once(p).chain(fields).collect();
        rest.join(" ")
    });
    Some(Mapping { start, end, prot, shared, path })
}

/// Snapshot of `/proc/self/maps`, sorted by address.
pub fn read_mappings() -> Vec<Mapping> {
    match std::fs::read_to_string("/proc/self/maps") {
        Ok(maps) => maps.lines().filter_map(parse_maps_line).collect(),
        Err(_) => Vec::new(),
    }
}

/// The mapping containing `addr`, if any.
pub fn find_mapping(addr: usize) -> Option<Mapping> {
    read_mappings().into_iter().find(|m| m.contains(addr))
}

mod elf {
    pub const DT_NULL: i64 = 0;
    pub const DT_PLTRELSZ: i64 = 2;
    pub const DT_STRTAB: i64 = 5;
    pub const DT_SYMTAB: i64 = 6;
    pub const DT_RELA: i64 = 7;
    pub const DT_RELASZ: i64 = 8;
    pub const DT_JMPREL: i64 = 23;

    #[cfg(target_arch = "x86_64")]
    pub const SLOT_RELOCS: [u32; 3] = [7, 6, 1]; // JUMP_SLOT, GLOB_DAT, 64
    #[cfg(target_arch = "aarch64")]
    pub const SLOT_RELOCS: [u32; 3] = [1026, 1025, 257]; // JUMP_SLOT, GLOB_DAT, ABS64
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub const SLOT_RELOCS: [u32; 0] = [];

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Dyn {
        pub d_tag: i64,
        pub d_val: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Rela {
        pub r_offset: u64,
        pub r_info: u64,
        pub r_addend: i64,
    }

    impl Elf64Rela {
        pub fn sym(&self) -> usize {
            (self.r_info >> 32) as usize
        }

        pub fn kind(&self) -> u32 {
            (self.r_info & 0xffff_ffff) as u32
        }
    }
}

/// Addresses of every relocation slot, in every loaded module, that binds one of `names`.
unsafe fn collect_slots(names: &[&str]) -> Vec<usize> {
    struct Ctx<'a> {
        names: &'a [&'a str],
        slots: Vec<usize>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let ctx = &mut *(data as *mut Ctx);
        let info = &*info;
        let base = info.dlpi_addr;

        let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let Some(dynamic) = phdrs.iter().find(|p| p.p_type == libc::PT_DYNAMIC) else {
            return 0;
        };

        let mut jmprel = (0u64, 0usize);
        let mut rela = (0u64, 0usize);
        let mut symtab = 0u64;
        let mut strtab = 0u64;
        let mut entry = (base + dynamic.p_vaddr) as *const elf::Elf64Dyn;
        while (*entry).d_tag != elf::DT_NULL {
            let e = *entry;
            match e.d_tag {
                elf::DT_JMPREL => jmprel.0 = e.d_val,
                elf::DT_PLTRELSZ => jmprel.1 = e.d_val as usize,
                elf::DT_RELA => rela.0 = e.d_val,
                elf::DT_RELASZ => rela.1 = e.d_val as usize,
                elf::DT_SYMTAB => symtab = e.d_val,
                elf::DT_STRTAB => strtab = e.d_val,
                _ => {}
            }
            entry = entry.add(1);
        }
        if symtab == 0 || strtab == 0 {
            return 0;
        }

        // glibc relocates d_ptr entries in place; the vDSO and some loaders leave them as
        // link-time offsets.
        let adjusted = symtab > base || strtab > base;
        let resolve = |val: u64| if adjusted { val } else { base + val };
        let symtab = resolve(symtab) as *const elf::Elf64Sym;
        let strtab = resolve(strtab) as *const libc::c_char;

        for (table, bytes) in [jmprel, rela] {
            if table == 0 || bytes == 0 {
                continue;
            }
            let relocs = core::slice::from_raw_parts(
                resolve(table) as *const elf::Elf64Rela,
                bytes / core::mem::size_of::<elf::Elf64Rela>(),
            );
            for r in relocs {
                if !elf::SLOT_RELOCS.contains(&r.kind()) || r.sym() == 0 {
                    continue;
                }
                let sym = &*symtab.add(r.sym());
                let name = CStr::from_ptr(strtab.add(sym.st_name as usize)).to_bytes();
                if ctx.names.iter().any(|n| n.as_bytes() == name) {
                    ctx.slots.push((base + r.r_offset) as usize);
                }
            }
        }
        0
    }

    let mut ctx = Ctx { names, slots: Vec::new() };
    libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    ctx.slots.sort_unstable();
    ctx.slots.dedup();
    ctx.slots
}

/// Point every relocation slot bound to one of `names` at `replacement`.
///
/// `names` lists a symbol and its aliases (`mmap`, `mmap64`). Matching is by symbol name
/// rather than by slot value, so lazily bound slots that still hold a PLT stub are caught too.
/// Slots that already hold `replacement` are left alone, which makes repeated calls only
/// pick up modules loaded since the last one.
///
/// Returns the slots written with their previous values, or
/// [`HookError::NoRelocationSlot`] when no loaded module references any of the names.
///
/// # Safety
/// `replacement` must be a function with the same signature as the symbol.
pub unsafe fn rebind_symbol(names: &[&str], replacement: usize) -> Result<Vec<SlotPatch>> {
    let slots = collect_slots(names);
    if slots.is_empty() {
        return Err(HookError::NoRelocationSlot(names.first().copied().unwrap_or_default().to_string()));
    }

    let mut patched = Vec::new();
    for slot in slots {
        let current = core::ptr::read_volatile(slot as *const usize);
        if current == replacement {
            continue;
        }
        let previous = patcher::write_slot(slot as *mut usize, replacement)?;
        patched.push(SlotPatch { slot, previous });
    }
    Ok(patched)
}

use crate::arch::x86_64::writer::{Reg, X86_64Writer, JMP_FAR_LEN};
use crate::types::{HookError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// Position independent, copied verbatim.
    Plain,
    /// ModRM addresses `[rip + disp32]`; `disp_at` is the offset of the displacement.
    RipRelative { disp_at: usize },
    /// `jmp rel8` / `jmp rel32`.
    Jump { target: u64 },
    /// `jcc rel8` / `jcc rel32`.
    CondJump { cc: u8, target: u64 },
    /// `call rel32`.
    Call { target: u64 },
    /// Indirect `jmp` through a register or memory operand; flow does not continue past it.
    IndirectJump { disp_at: Option<usize> },
    /// `loop*` / `jcxz`: short-only branches with no long form to rewrite into.
    ShortOnly,
    /// `ret`, `int3`, `ud2`, `hlt`.
    Terminator,
}

#[derive(Debug, Clone, Copy)]
struct Insn {
    len: usize,
    kind: Kind,
}

impl Insn {
    fn ends_flow(&self) -> bool {
        matches!(
            self.kind,
            Kind::Terminator | Kind::Jump { .. } | Kind::IndirectJump { .. }
        )
    }
}

struct Cursor {
    code: *const u8,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> u8 {
        unsafe { self.code.add(self.pos).read() }
    }

    fn next(&mut self) -> u8 {
        let b = self.peek();
        self.pos += 1;
        b
    }

    fn i8(&mut self) -> i64 {
        self.next() as i8 as i64
    }

    fn i32(&mut self) -> i64 {
        let v = unsafe { (self.code.add(self.pos) as *const i32).read_unaligned() };
        self.pos += 4;
        v as i64
    }

    /// Consume ModRM, SIB and displacement. Returns the ModRM byte and, for
    /// `[rip + disp32]`, the offset of the displacement.
    fn modrm(&mut self) -> (u8, Option<usize>) {
        let modrm = self.next();
        let md = modrm >> 6;
        let rm = modrm & 7;
        if md == 3 {
            return (modrm, None);
        }
        if md == 0 && rm == 5 {
            let at = self.pos;
            self.pos += 4;
            return (modrm, Some(at));
        }
        if rm == 4 {
            let sib = self.next();
            if md == 0 && sib & 7 == 5 {
                self.pos += 4;
            }
        }
        match md {
            1 => self.pos += 1,
            2 => self.pos += 4,
            _ => {}
        }
        (modrm, None)
    }
}

/// One-byte opcodes followed by a ModRM byte.
fn has_modrm(op: u8) -> bool {
    matches!(op,
        0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B |
        0x20..=0x23 | 0x28..=0x2B | 0x30..=0x33 | 0x38..=0x3B |
        0x63 | 0x69 | 0x6B | 0x80..=0x8F | 0xC0 | 0xC1 | 0xC6 | 0xC7 |
        0xD0..=0xD3 | 0xD8..=0xDF | 0xF6 | 0xF7 | 0xFE | 0xFF)
}

/// Immediate size of a one-byte opcode; `op16` is the 0x66 prefix, `w` is REX.W.
fn imm_size(op: u8, modrm: u8, op16: bool, w: bool) -> usize {
    let z = if op16 { 2 } else { 4 };
    match op {
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1,
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => z,
        0x68 | 0x69 | 0x81 | 0xA9 | 0xC7 => z,
        0x6A | 0x6B | 0x80 | 0x82 | 0x83 | 0xA8 | 0xC0 | 0xC1 | 0xC6 | 0xCD => 1,
        0xB0..=0xB7 | 0xE4..=0xE7 => 1,
        0xB8..=0xBF => {
            if w {
                8
            } else {
                z
            }
        }
        0xA0..=0xA3 => 8,
        0xC2 => 2,
        0xC8 => 3,
        // test r/m, imm lives in group 3 (/0 and /1)
        0xF6 if (modrm >> 3) & 7 <= 1 => 1,
        0xF7 if (modrm >> 3) & 7 <= 1 => z,
        _ => 0,
    }
}

/// Two-byte (0F xx) opcodes without ModRM.
fn two_byte_has_modrm(op: u8) -> bool {
    !matches!(op, 0x05..=0x09 | 0x0B | 0x0E | 0x30..=0x37 | 0x77 | 0x80..=0x8F | 0xA0 | 0xA1 | 0xA2 | 0xA8 | 0xA9 | 0xAA | 0xC8..=0xCF)
}

fn two_byte_imm_size(op: u8) -> usize {
    match op {
        0x70..=0x73 | 0xA4 | 0xAC | 0xBA | 0xC2 | 0xC4..=0xC6 => 1,
        _ => 0,
    }
}

fn with_modrm(c: &mut Cursor, imm: usize) -> Kind {
    let (_, rip) = c.modrm();
    c.pos += imm;
    match rip {
        Some(disp_at) => Kind::RipRelative { disp_at },
        None => Kind::Plain,
    }
}

/// Decode the instruction at `code`, which will run at `pc`.
///
/// Covers what appears in function prologues and syscall wrappers: legacy and REX
/// prefixes, one/two/three byte opcode maps, VEX, ModRM/SIB/displacement and immediates.
fn decode(code: *const u8, pc: u64) -> Insn {
    let mut c = Cursor { code, pos: 0 };

    let mut op16 = false;
    loop {
        match c.peek() {
            0x66 => {
                op16 = true;
                c.pos += 1;
            }
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x67 | 0xF0 | 0xF2 | 0xF3 => c.pos += 1,
            _ => break,
        }
    }

    let mut w = false;
    if c.peek() & 0xF0 == 0x40 {
        w = c.next() & 0x08 != 0;
    }

    let at = |c: &Cursor, rel: i64| (pc as i64 + c.pos as i64 + rel) as u64;

    let op = c.next();
    let kind = match op {
        0xC3 => Kind::Terminator,
        0xC2 => {
            c.pos += 2;
            Kind::Terminator
        }
        0xCC | 0xF4 => Kind::Terminator,
        0xEB => {
            let rel = c.i8();
            Kind::Jump { target: at(&c, rel) }
        }
        0xE9 => {
            let rel = c.i32();
            Kind::Jump { target: at(&c, rel) }
        }
        0xE8 => {
            let rel = c.i32();
            Kind::Call { target: at(&c, rel) }
        }
        0x70..=0x7F => {
            let rel = c.i8();
            Kind::CondJump { cc: op & 0x0F, target: at(&c, rel) }
        }
        0xE0..=0xE3 => {
            c.pos += 1;
            Kind::ShortOnly
        }
        // VEX, two-byte form: C5 <payload> <opcode> ModRM, map 0F.
        0xC5 => {
            c.pos += 1;
            let _ = c.next();
            with_modrm(&mut c, 0)
        }
        // VEX, three-byte form: C4 <map> <payload> <opcode> ModRM.
        0xC4 => {
            let map = c.next() & 0x1F;
            c.pos += 1;
            let _ = c.next();
            with_modrm(&mut c, if map == 3 { 1 } else { 0 })
        }
        0x0F => {
            let op2 = c.next();
            match op2 {
                0x0B => Kind::Terminator,
                0x80..=0x8F => {
                    let rel = c.i32();
                    Kind::CondJump { cc: op2 & 0x0F, target: at(&c, rel) }
                }
                0x38 => {
                    let _ = c.next();
                    with_modrm(&mut c, 0)
                }
                0x3A => {
                    let _ = c.next();
                    with_modrm(&mut c, 1)
                }
                _ if two_byte_has_modrm(op2) => with_modrm(&mut c, two_byte_imm_size(op2)),
                _ => Kind::Plain,
            }
        }
        0xFF => {
            let (modrm, rip) = c.modrm();
            match ((modrm >> 3) & 7, rip) {
                (4 | 5, _) => Kind::IndirectJump { disp_at: rip },
                (_, Some(disp_at)) => Kind::RipRelative { disp_at },
                (_, None) => Kind::Plain,
            }
        }
        _ if has_modrm(op) => {
            let (modrm, rip) = c.modrm();
            c.pos += imm_size(op, modrm, op16, w);
            match rip {
                Some(disp_at) => Kind::RipRelative { disp_at },
                None => Kind::Plain,
            }
        }
        _ => {
            c.pos += imm_size(op, 0, op16, w);
            Kind::Plain
        }
    };

    Insn { len: c.pos, kind }
}

/// Returns true if the bytes at `p` are `endbr64`.
pub fn is_endbr64(p: *const u8) -> bool {
    let bytes = unsafe { core::ptr::read_unaligned(p as *const [u8; 4]) };
    bytes == crate::arch::x86_64::writer::ENDBR64
}

/// How many bytes starting at `code` can be moved, stopping once `min_bytes` are covered or
/// at the first instruction that cannot be moved or ends the function.
pub fn can_relocate(code: *const u8, min_bytes: usize) -> usize {
    let mut offset = 0;
    while offset < min_bytes {
        let insn = decode(unsafe { code.add(offset) }, offset as u64);
        match insn.kind {
            Kind::Terminator | Kind::ShortOnly => return offset,
            _ => offset += insn.len,
        }
        if insn.ends_flow() && offset < min_bytes {
            return offset;
        }
    }
    offset
}

/// Copies whole instructions from a function prologue into a trampoline, fixing up
/// everything that is addressed relative to the instruction pointer.
pub struct X86_64Relocator {
    input: *const u8,
    input_pc: u64,
}

impl X86_64Relocator {
    pub fn new(input: *const u8, input_pc: u64) -> Self {
        Self { input, input_pc }
    }

    /// Relocate at least `min_bytes` of instructions into `writer`; returns the number of
    /// source bytes consumed.
    ///
    /// # Safety
    /// `input` must point to readable code and `writer` must have room for the output.
    pub unsafe fn relocate_bytes(&mut self, writer: &mut X86_64Writer, min_bytes: usize) -> Result<usize> {
        let fail = || HookError::Relocation(self.input_pc as usize);
        let mut offset = 0usize;

        while offset < min_bytes {
            let src = self.input.add(offset);
            let src_pc = self.input_pc + offset as u64;
            let insn = decode(src, src_pc);
            let bytes = core::slice::from_raw_parts(src, insn.len);

            match insn.kind {
                Kind::Terminator | Kind::ShortOnly => return Err(fail()),
                Kind::Plain => writer.put_bytes(bytes),
                Kind::RipRelative { disp_at } | Kind::IndirectJump { disp_at: Some(disp_at) } => {
                    let old = i32::from_le_bytes([
                        bytes[disp_at],
                        bytes[disp_at + 1],
                        bytes[disp_at + 2],
                        bytes[disp_at + 3],
                    ]) as i64;
                    let target = src_pc as i64 + insn.len as i64 + old;
                    let disp = target - (writer.pc() as i64 + insn.len as i64);
                    let disp = i32::try_from(disp).map_err(|_| fail())?;
                    let mut moved = bytes.to_vec();
                    moved[disp_at..disp_at + 4].copy_from_slice(&disp.to_le_bytes());
                    writer.put_bytes(&moved);
                }
                Kind::IndirectJump { disp_at: None } => writer.put_bytes(bytes),
                Kind::Jump { target } => writer.put_jmp_address(target),
                Kind::CondJump { cc, target } => {
                    // Inverted short jcc over an absolute jump to the original target.
                    writer.put_jcc_short(cc ^ 1, JMP_FAR_LEN as i8);
                    writer.put_jmp_far(target);
                }
                Kind::Call { target } => {
                    if target == src_pc + insn.len as u64 {
                        // call $+5 pushes its own address; keep pushing the original one.
                        writer.put_mov_reg_imm64(Reg::R11, target);
                        writer.put_push_reg(Reg::R11);
                    } else {
                        writer.put_mov_reg_imm64(Reg::R11, target);
                        writer.put_call_reg(Reg::R11);
                    }
                }
            }

            offset += insn.len;
            if insn.ends_flow() && offset < min_bytes {
                return Err(fail());
            }
        }

        Ok(offset)
    }
}

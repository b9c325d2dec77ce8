use crate::arch::arm64::writer::{Arm64Writer, Reg};
use crate::types::{HookError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsnKind {
    Other,
    B,
    BL,
    /// B.cond, CBZ/CBNZ (imm19) and TBZ/TBNZ (imm14).
    CondBranch { imm14: bool },
    Adr,
    Adrp,
    LdrLiteral { load: LiteralLoad },
    /// PRFM (literal): a hint, dropped when moved.
    Prefetch,
    /// SIMD/FP literal loads have no scratch-register equivalent.
    SimdLiteral,
    /// RET, BRK, UDF.
    Terminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiteralLoad {
    W,
    X,
    Sw,
}

fn insn_kind(insn: u32) -> InsnKind {
    match insn & 0xFC00_0000 {
        0x1400_0000 => return InsnKind::B,
        0x9400_0000 => return InsnKind::BL,
        _ => {}
    }
    if (insn & 0xFF00_0010) == 0x5400_0000 {
        return InsnKind::CondBranch { imm14: false };
    }
    match insn & 0x7E00_0000 {
        0x3400_0000 => return InsnKind::CondBranch { imm14: false },
        0x3600_0000 => return InsnKind::CondBranch { imm14: true },
        _ => {}
    }
    match insn & 0x9F00_0000 {
        0x1000_0000 => return InsnKind::Adr,
        0x9000_0000 => return InsnKind::Adrp,
        _ => {}
    }
    if (insn & 0x3B00_0000) == 0x1800_0000 {
        if insn & (1 << 26) != 0 {
            return InsnKind::SimdLiteral;
        }
        return match insn >> 30 {
            0 => InsnKind::LdrLiteral { load: LiteralLoad::W },
            1 => InsnKind::LdrLiteral { load: LiteralLoad::X },
            2 => InsnKind::LdrLiteral { load: LiteralLoad::Sw },
            _ => InsnKind::Prefetch,
        };
    }
    if (insn & 0xFFFF_FC1F) == 0xD65F_0000
        || (insn & 0xFFE0_001F) == 0xD420_0000
        || (insn & 0xFFFF_0000) == 0
    {
        return InsnKind::Terminator;
    }
    InsnKind::Other
}

fn sign_extend(value: i64, bits: u32) -> i64 {
    let shift = 64 - bits;
    (value << shift) >> shift
}

fn offset_imm26(insn: u32) -> i64 {
    sign_extend((insn & 0x03FF_FFFF) as i64, 26) << 2
}

fn offset_imm19(insn: u32) -> i64 {
    sign_extend(((insn >> 5) & 0x7FFFF) as i64, 19) << 2
}

fn offset_imm14(insn: u32) -> i64 {
    sign_extend(((insn >> 5) & 0x3FFF) as i64, 14) << 2
}

fn offset_adr(insn: u32) -> i64 {
    let immlo = ((insn >> 29) & 0x3) as i64;
    let immhi = ((insn >> 5) & 0x7FFFF) as i64;
    sign_extend((immhi << 2) | immlo, 21)
}

fn rd(insn: u32) -> u32 {
    insn & 0x1F
}

fn at(pc: u64, offset: i64) -> u64 {
    (pc as i64).wrapping_add(offset) as u64
}

/// Rewrites the branch offset of a conditional branch to `+8`.
fn retarget_plus_8(insn: u32, imm14: bool) -> u32 {
    if imm14 {
        (insn & !(0x3FFF << 5)) | (2 << 5)
    } else {
        (insn & !(0x7FFFF << 5)) | (2 << 5)
    }
}

/// Number of instructions (up to `n`) at `code` that can be moved to another address.
pub fn can_relocate(code: *const u32, n: usize) -> usize {
    let mut count = 0;
    while count < n {
        let insn = unsafe { code.add(count).read() };
        match insn_kind(insn) {
            InsnKind::Terminator | InsnKind::SimdLiteral => return count,
            InsnKind::B => return count + 1,
            _ => count += 1,
        }
    }
    count
}

/// Moves instructions from a function prologue into a trampoline, rewriting every
/// pc-relative form into one that computes the same address from its new location.
pub struct Arm64Relocator {
    input: *const u32,
    input_pc: u64,
}

impl Arm64Relocator {
    pub fn new(input: *const u32, input_pc: u64) -> Self {
        Self { input, input_pc }
    }

    /// Relocate exactly `n` instructions into `writer`.
    ///
    /// # Safety
    /// `input` must point to `n` readable instructions and `writer` must have room for the
    /// expanded sequence (at most 24 bytes per instruction).
    pub unsafe fn relocate_insns(&mut self, writer: &mut Arm64Writer, n: usize) -> Result<()> {
        let fail = HookError::Relocation(self.input_pc as usize);
        for i in 0..n {
            let insn = self.input.add(i).read();
            let pc = self.input_pc + (i as u64) * 4;
            match insn_kind(insn) {
                InsnKind::Other => writer.put_u32(insn),
                InsnKind::Terminator | InsnKind::SimdLiteral => return Err(fail),
                InsnKind::B => {
                    if i + 1 < n {
                        return Err(fail);
                    }
                    writer.put_branch_address(at(pc, offset_imm26(insn)));
                }
                InsnKind::BL => {
                    writer.put_mov_imm64(Reg::X16, at(pc, offset_imm26(insn)));
                    writer.put_blr_reg(Reg::X16);
                }
                InsnKind::CondBranch { imm14 } => {
                    let offset = if imm14 { offset_imm14(insn) } else { offset_imm19(insn) };
                    writer.put_u32(retarget_plus_8(insn, imm14));
                    writer.put_b_rel(20);
                    writer.put_branch_address(at(pc, offset));
                }
                InsnKind::Adr => writer.put_mov_imm64_rd(rd(insn), at(pc, offset_adr(insn))),
                InsnKind::Adrp => {
                    let page = (pc & !0xFFF) as i64;
                    let value = page.wrapping_add(offset_adr(insn) << 12) as u64;
                    writer.put_mov_imm64_rd(rd(insn), value);
                }
                InsnKind::LdrLiteral { load } => {
                    let address = at(pc, offset_imm19(insn));
                    let rt = rd(insn);
                    let x16 = (Reg::X16 as u32) << 5;
                    writer.put_mov_imm64(Reg::X16, address);
                    writer.put_u32(
                        match load {
                            LiteralLoad::X => 0xF940_0000,
                            LiteralLoad::W => 0xB940_0000,
                            LiteralLoad::Sw => 0xB980_0000,
                        } | x16
                            | rt,
                    );
                }
                InsnKind::Prefetch => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOP: u32 = 0xD503_201F;
    const RET: u32 = 0xD65F_03C0;

    fn relocate(code: &[u32], pc: u64, out_pc: u64) -> Result<Vec<u32>> {
        let mut out = [0u32; 64];
        unsafe {
            let mut w = Arm64Writer::new(out.as_mut_ptr() as *mut u8, 256, out_pc);
            Arm64Relocator::new(code.as_ptr(), pc).relocate_insns(&mut w, code.len())?;
            Ok(out[..w.offset() / 4].to_vec())
        }
    }

    #[test]
    fn classifies_instruction_forms() {
        assert_eq!(insn_kind(0x1400_0004), InsnKind::B);
        assert_eq!(insn_kind(0x9400_0004), InsnKind::BL);
        assert_eq!(insn_kind(0x5400_0040), InsnKind::CondBranch { imm14: false }); // b.eq
        assert_eq!(insn_kind(0xB400_0040), InsnKind::CondBranch { imm14: false }); // cbz x0
        assert_eq!(insn_kind(0x3600_0040), InsnKind::CondBranch { imm14: true }); // tbz w0
        assert_eq!(insn_kind(0x9000_0010), InsnKind::Adrp);
        assert_eq!(insn_kind(0x1000_0010), InsnKind::Adr);
        assert_eq!(insn_kind(0x5800_0050), InsnKind::LdrLiteral { load: LiteralLoad::X });
        assert_eq!(insn_kind(0x1C00_0040), InsnKind::SimdLiteral);
        assert_eq!(insn_kind(RET), InsnKind::Terminator);
        assert_eq!(insn_kind(NOP), InsnKind::Other);
    }

    #[test]
    fn can_relocate_stops_at_return() {
        let code = [NOP, NOP, RET, NOP];
        assert_eq!(can_relocate(code.as_ptr(), 4), 2);
        assert_eq!(can_relocate(code.as_ptr(), 2), 2);
    }

    #[test]
    fn plain_instructions_are_copied() {
        let code = [NOP, 0xD280_0120, NOP, NOP]; // mov x0, #9
        assert_eq!(relocate(&code, 0x1000, 0x9000).unwrap(), code.to_vec());
    }

    #[test]
    fn adrp_becomes_absolute_page() {
        // adrp x16, #1 page
        let code = [0xB000_0010];
        let out = relocate(&code, 0x1234, 0x8000_0000).unwrap();
        // 0x1000 + 0x1000 = 0x2000 -> movz x16, #0x2000
        assert_eq!(out, vec![0xD284_0010]);
    }

    #[test]
    fn conditional_branch_keeps_target() {
        // cbz x0, +0x40
        let code = [0xB400_0200];
        let out = relocate(&code, 0x1000, 0x9000).unwrap();
        assert_eq!(out[0], 0xB400_0040);
        assert_eq!(out[1], 0x1400_0005);
        assert_eq!(out[2], 0x5800_0050);
        assert_eq!(out[3], 0xD61F_0200);
        assert_eq!((out[4] as u64) | ((out[5] as u64) << 32), 0x1040);
    }

    #[test]
    fn literal_load_goes_through_scratch_register() {
        // ldr x1, #8
        let code = [0x5800_0041];
        let out = relocate(&code, 0x1000, 0x9000).unwrap();
        assert_eq!(out, vec![0xD282_0110, 0xF940_0201]);
    }

    #[test]
    fn return_in_prologue_is_rejected() {
        assert_eq!(relocate(&[NOP, RET], 0x1000, 0x9000), Err(HookError::Relocation(0x1000)));
    }
}

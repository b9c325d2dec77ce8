/// General purpose registers usable as instruction operands.
///
/// Only the intra-procedure scratch registers and a handful of argument registers are ever
/// named by generated code; relocated instructions keep whatever register they encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X16 = 16,
    X17 = 17,
    X30 = 30,
}

/// `ldr x16, #8; br x16; .quad target`
pub const BRANCH_ABS_LEN: usize = 16;

/// `ldr x16, #8`
const LDR_X16_LITERAL_8: u32 = 0x5800_0050;

#[derive(Debug)]
pub struct Arm64Writer {
    base: *mut u32,
    code: *mut u32,
    pc: u64,
    size: usize,
}

impl Arm64Writer {
    /// # Safety
    /// `buffer` must be 4-byte aligned and valid for writes of `size` bytes.
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: u64) -> Self {
        Self {
            base: buffer as *mut u32,
            code: buffer as *mut u32,
            pc,
            size,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        (self.code as usize).saturating_sub(self.base as usize)
    }

    fn can_write(&self, bytes: usize) -> bool {
        self.offset() + bytes <= self.size
    }

    pub unsafe fn put_u32(&mut self, insn: u32) {
        debug_assert!(self.can_write(4));
        self.code.write(insn);
        self.code = self.code.add(1);
        self.pc = self.pc.wrapping_add(4);
    }

    pub unsafe fn put_u64(&mut self, value: u64) {
        self.put_u32(value as u32);
        self.put_u32((value >> 32) as u32);
    }

    pub unsafe fn put_br_reg(&mut self, reg: Reg) {
        self.put_u32(0xD61F_0000 | ((reg as u32) << 5));
    }

    pub unsafe fn put_blr_reg(&mut self, reg: Reg) {
        self.put_u32(0xD63F_0000 | ((reg as u32) << 5));
    }

    pub unsafe fn put_nop(&mut self) {
        self.put_u32(0xD503_201F);
    }

    /// Unconditional `b` by `delta` bytes from this instruction.
    pub unsafe fn put_b_rel(&mut self, delta: i64) {
        let imm26 = ((delta >> 2) as u32) & 0x03FF_FFFF;
        self.put_u32(0x1400_0000 | imm26);
    }

    /// Whether a plain `b` placed at `from` reaches `to` (±128 MiB).
    pub fn b_reachable(from: u64, to: u64) -> bool {
        let delta = to as i64 - from as i64;
        delta % 4 == 0 && (-(1i64 << 27)..(1i64 << 27)).contains(&delta)
    }

    /// Branch to an absolute address through x16: `ldr x16, #8; br x16; .quad target`.
    pub unsafe fn put_branch_address(&mut self, target: u64) {
        self.put_u32(LDR_X16_LITERAL_8);
        self.put_br_reg(Reg::X16);
        self.put_u64(target);
    }

    /// Load a 64-bit immediate with `movz` + up to three `movk`, skipping zero halfwords.
    /// Zero is a single `movz` of the top halfword.
    pub unsafe fn put_mov_imm64(&mut self, reg: Reg, value: u64) {
        self.put_mov_imm64_rd(reg as u32, value);
    }

    /// As [`put_mov_imm64`](Self::put_mov_imm64) for a raw register number taken from a
    /// relocated instruction.
    pub unsafe fn put_mov_imm64_rd(&mut self, rd: u32, value: u64) {
        let rd = rd & 0x1F;
        let mut first = true;
        for hw in 0..4u32 {
            let imm16 = ((value >> (hw * 16)) & 0xFFFF) as u32;
            if imm16 == 0 && !(first && hw == 3) {
                continue;
            }
            let base = if first { 0xD280_0000 } else { 0xF280_0000 };
            self.put_u32(base | (hw << 21) | (imm16 << 5) | rd);
            first = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble_at(pc: u64, f: impl FnOnce(&mut Arm64Writer)) -> Vec<u32> {
        let mut buf = [0u32; 16];
        unsafe {
            let mut w = Arm64Writer::new(buf.as_mut_ptr() as *mut u8, 64, pc);
            f(&mut w);
            buf[..w.offset() / 4].to_vec()
        }
    }

    #[test]
    fn branch_address_is_ldr_br_literal() {
        let code = assemble_at(0x1000, |w| unsafe { w.put_branch_address(0x1122_3344_5566_7788) });
        assert_eq!(code.len() * 4, BRANCH_ABS_LEN);
        assert_eq!(code[0], 0x5800_0050);
        assert_eq!(code[1], 0xD61F_0200);
        assert_eq!(code[2], 0x5566_7788);
        assert_eq!(code[3], 0x1122_3344);
    }

    #[test]
    fn mov_imm64_skips_zero_halfwords() {
        let code = assemble_at(0, |w| unsafe { w.put_mov_imm64(Reg::X16, 0x0000_7F00_0000_1234) });
        // movz x16, #0x1234 ; movk x16, #0x7f00, lsl #32
        assert_eq!(code, vec![0xD282_4690, 0xF2CF_E010]);

        let zero = assemble_at(0, |w| unsafe { w.put_mov_imm64(Reg::X0, 0) });
        assert_eq!(zero, vec![0xD2E0_0000]);
    }

    #[test]
    fn b_rel_encodes_backward_branch() {
        let code = assemble_at(0x1000, |w| unsafe { w.put_b_rel(-8) });
        assert_eq!(code, vec![0x17FF_FFFE]);
        assert!(Arm64Writer::b_reachable(0x1000, 0x1000 + (1 << 26)));
        assert!(!Arm64Writer::b_reachable(0x1000, 0x1000 + (1 << 28)));
    }
}

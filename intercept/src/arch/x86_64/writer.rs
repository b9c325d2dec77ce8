#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
}

impl Reg {
    #[inline]
    fn low_bits(self) -> u8 {
        (self as u8) & 7
    }

    /// Needs REX.B to be addressed.
    #[inline]
    fn needs_rex_b(self) -> bool {
        (self as u8) >= 8
    }
}

/// Length of `jmp rel32`.
pub const JMP_NEAR_LEN: usize = 5;

/// Length of `jmp [rip+2]; ud2; .quad target`.
pub const JMP_FAR_LEN: usize = 16;

/// `endbr64`, the landing pad required for indirect branches under CET.
pub const ENDBR64: [u8; 4] = [0xF3, 0x0F, 0x1E, 0xFA];

/// Emits x86_64 machine code into a caller-provided buffer.
///
/// `pc` is the address the emitted code will run at, which may differ from the buffer when
/// code is assembled on the stack and copied into place later.
#[derive(Debug)]
pub struct X86_64Writer {
    start: *mut u8,
    cursor: *mut u8,
    capacity: usize,
    pc: u64,
}

impl X86_64Writer {
    /// # Safety
    /// `buffer` must be valid for writes of `capacity` bytes.
    pub unsafe fn new(buffer: *mut u8, capacity: usize, pc: u64) -> Self {
        Self { start: buffer, cursor: buffer, capacity, pc }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        self.cursor as usize - self.start as usize
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.offset()
    }

    unsafe fn byte(&mut self, b: u8) {
        debug_assert!(self.remaining() >= 1);
        self.cursor.write(b);
        self.cursor = self.cursor.add(1);
        self.pc = self.pc.wrapping_add(1);
    }

    pub unsafe fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.remaining() >= bytes.len());
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.cursor, bytes.len());
        self.cursor = self.cursor.add(bytes.len());
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }

    /// Displacement from the end of a 4-byte field starting at the current pc.
    fn rel32_to(&self, target: u64) -> Option<i32> {
        let rel = target as i64 - (self.pc as i64 + 4);
        i32::try_from(rel).ok()
    }

    /// `jmp rel32`. The caller must know the target is within ±2 GiB.
    pub unsafe fn put_jmp_near(&mut self, target: u64) {
        self.byte(0xE9);
        let rel = self.rel32_to(target).unwrap_or_default();
        self.put_bytes(&rel.to_le_bytes());
    }

    /// `jmp [rip+2]; ud2; .quad target`
    pub unsafe fn put_jmp_far(&mut self, target: u64) {
        self.put_bytes(&[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0F, 0x0B]);
        self.put_bytes(&target.to_le_bytes());
    }

    /// Near jump when `target` is reachable from here, far jump otherwise.
    pub unsafe fn put_jmp_address(&mut self, target: u64) {
        if Self::near_reachable(self.pc, target) {
            self.put_jmp_near(target);
        } else {
            self.put_jmp_far(target);
        }
    }

    /// Whether a `jmp rel32` placed at `from` can reach `to`.
    pub fn near_reachable(from: u64, to: u64) -> bool {
        let rel = to as i64 - (from as i64 + JMP_NEAR_LEN as i64);
        i32::try_from(rel).is_ok()
    }

    /// `jcc rel8` with condition `cc` (low nibble of the 0x70 opcode family).
    pub unsafe fn put_jcc_short(&mut self, cc: u8, rel: i8) {
        self.byte(0x70 | (cc & 0x0F));
        self.byte(rel as u8);
    }

    /// `mov reg, imm64`
    pub unsafe fn put_mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        self.byte(if reg.needs_rex_b() { 0x49 } else { 0x48 });
        self.byte(0xB8 + reg.low_bits());
        self.put_bytes(&imm.to_le_bytes());
    }

    /// `push reg`
    pub unsafe fn put_push_reg(&mut self, reg: Reg) {
        if reg.needs_rex_b() {
            self.byte(0x41);
        }
        self.byte(0x50 + reg.low_bits());
    }

    /// `call reg`
    pub unsafe fn put_call_reg(&mut self, reg: Reg) {
        if reg.needs_rex_b() {
            self.byte(0x41);
        }
        self.byte(0xFF);
        self.byte(0xD0 | reg.low_bits());
    }

    /// Pad with the recommended multi-byte NOP forms.
    pub unsafe fn put_nop_n(&mut self, n: usize) {
        const NOPS: [&[u8]; 9] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0F, 0x1F, 0x00],
            &[0x0F, 0x1F, 0x40, 0x00],
            &[0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];
        let mut left = n;
        while left > 0 {
            let chunk = left.min(NOPS.len());
            self.put_bytes(NOPS[chunk - 1]);
            left -= chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble_at(pc: u64, f: impl FnOnce(&mut X86_64Writer)) -> Vec<u8> {
        let mut buf = [0u8; 64];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), pc);
            f(&mut w);
            buf[..w.offset()].to_vec()
        }
    }

    fn assemble(f: impl FnOnce(&mut X86_64Writer)) -> Vec<u8> {
        assemble_at(0x1000, f)
    }

    #[test]
    fn jmp_near_encodes_relative_displacement() {
        let bytes = assemble(|w| unsafe { w.put_jmp_near(0x1100) });
        // 0x1100 - (0x1000 + 5) = 0xFB
        assert_eq!(bytes, [0xE9, 0xFB, 0x00, 0x00, 0x00]);

        let back = assemble(|w| unsafe { w.put_jmp_near(0x1000) });
        assert_eq!(back, [0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn jmp_far_embeds_absolute_target() {
        let bytes = assemble(|w| unsafe { w.put_jmp_far(0x7fff_1234_5678) });
        assert_eq!(bytes.len(), JMP_FAR_LEN);
        assert_eq!(&bytes[..8], &[0xFF, 0x25, 0x02, 0x00, 0x00, 0x00, 0x0F, 0x0B]);
        assert_eq!(u64::from_le_bytes(bytes[8..].try_into().unwrap()), 0x7fff_1234_5678);
    }

    #[test]
    fn jmp_address_picks_encoding_by_distance() {
        assert_eq!(assemble(|w| unsafe { w.put_jmp_address(0x2000) }).len(), JMP_NEAR_LEN);
        assert_eq!(
            assemble(|w| unsafe { w.put_jmp_address(0x7f00_0000_0000) }).len(),
            JMP_FAR_LEN
        );
    }

    #[test]
    fn mov_imm64_and_call_through_r11() {
        let bytes = assemble(|w| unsafe {
            w.put_mov_reg_imm64(Reg::R11, 0x1122_3344_5566_7788);
            w.put_call_reg(Reg::R11);
        });
        assert_eq!(&bytes[..2], &[0x49, 0xBB]);
        assert_eq!(u64::from_le_bytes(bytes[2..10].try_into().unwrap()), 0x1122_3344_5566_7788);
        assert_eq!(&bytes[10..], &[0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn push_low_and_extended_registers() {
        assert_eq!(assemble(|w| unsafe { w.put_push_reg(Reg::RBP) }), [0x55]);
        assert_eq!(assemble(|w| unsafe { w.put_push_reg(Reg::R11) }), [0x41, 0x53]);
    }

    #[test]
    fn nop_padding_has_exact_length() {
        for n in 0..=20 {
            assert_eq!(assemble(|w| unsafe { w.put_nop_n(n) }).len(), n);
        }
    }

    #[test]
    fn jcc_short_keeps_condition() {
        assert_eq!(assemble(|w| unsafe { w.put_jcc_short(0x5, 16) }), [0x75, 0x10]);
    }
}

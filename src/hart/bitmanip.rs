//! Bit-manipulation extensions: Zba, Zbb, Zbc, Zbe, Zbf, Zbm, Zbp, Zbr,
//! Zbs and the Zbt ternary forms. Each group is gated by its enable flag;
//! a disabled group decodes but raises illegal-instruction.

use super::Hart;
use crate::{Trap, Xlen};

fn grev64(mut x: u64, shamt: u64) -> u64 {
    if shamt & 1 != 0 {
        x = ((x & 0x5555_5555_5555_5555) << 1) | ((x & 0xAAAA_AAAA_AAAA_AAAA) >> 1);
    }
    if shamt & 2 != 0 {
        x = ((x & 0x3333_3333_3333_3333) << 2) | ((x & 0xCCCC_CCCC_CCCC_CCCC) >> 2);
    }
    if shamt & 4 != 0 {
        x = ((x & 0x0F0F_0F0F_0F0F_0F0F) << 4) | ((x & 0xF0F0_F0F0_F0F0_F0F0) >> 4);
    }
    if shamt & 8 != 0 {
        x = ((x & 0x00FF_00FF_00FF_00FF) << 8) | ((x & 0xFF00_FF00_FF00_FF00) >> 8);
    }
    if shamt & 16 != 0 {
        x = ((x & 0x0000_FFFF_0000_FFFF) << 16) | ((x & 0xFFFF_0000_FFFF_0000) >> 16);
    }
    if shamt & 32 != 0 {
        x = x.rotate_left(32);
    }
    x
}

fn gorc64(mut x: u64, shamt: u64) -> u64 {
    if shamt & 1 != 0 {
        x |= ((x & 0x5555_5555_5555_5555) << 1) | ((x & 0xAAAA_AAAA_AAAA_AAAA) >> 1);
    }
    if shamt & 2 != 0 {
        x |= ((x & 0x3333_3333_3333_3333) << 2) | ((x & 0xCCCC_CCCC_CCCC_CCCC) >> 2);
    }
    if shamt & 4 != 0 {
        x |= ((x & 0x0F0F_0F0F_0F0F_0F0F) << 4) | ((x & 0xF0F0_F0F0_F0F0_F0F0) >> 4);
    }
    if shamt & 8 != 0 {
        x |= ((x & 0x00FF_00FF_00FF_00FF) << 8) | ((x & 0xFF00_FF00_FF00_FF00) >> 8);
    }
    if shamt & 16 != 0 {
        x |= ((x & 0x0000_FFFF_0000_FFFF) << 16) | ((x & 0xFFFF_0000_FFFF_0000) >> 16);
    }
    if shamt & 32 != 0 {
        x |= (x << 32) | (x >> 32);
    }
    x
}

fn shfl_stage64(src: u64, mask_l: u64, mask_r: u64, n: u32) -> u64 {
    let x = src & !(mask_l | mask_r);
    x | ((src << n) & mask_l) | ((src >> n) & mask_r)
}

fn shfl64(mut x: u64, shamt: u64) -> u64 {
    if shamt & 16 != 0 {
        x = shfl_stage64(x, 0x0000_FFFF_0000_0000, 0x0000_0000_FFFF_0000, 16);
    }
    if shamt & 8 != 0 {
        x = shfl_stage64(x, 0x00FF_0000_00FF_0000, 0x0000_FF00_0000_FF00, 8);
    }
    if shamt & 4 != 0 {
        x = shfl_stage64(x, 0x0F00_0F00_0F00_0F00, 0x00F0_00F0_00F0_00F0, 4);
    }
    if shamt & 2 != 0 {
        x = shfl_stage64(x, 0x3030_3030_3030_3030, 0x0C0C_0C0C_0C0C_0C0C, 2);
    }
    if shamt & 1 != 0 {
        x = shfl_stage64(x, 0x4444_4444_4444_4444, 0x2222_2222_2222_2222, 1);
    }
    x
}

fn unshfl64(mut x: u64, shamt: u64) -> u64 {
    if shamt & 1 != 0 {
        x = shfl_stage64(x, 0x4444_4444_4444_4444, 0x2222_2222_2222_2222, 1);
    }
    if shamt & 2 != 0 {
        x = shfl_stage64(x, 0x3030_3030_3030_3030, 0x0C0C_0C0C_0C0C_0C0C, 2);
    }
    if shamt & 4 != 0 {
        x = shfl_stage64(x, 0x0F00_0F00_0F00_0F00, 0x00F0_00F0_00F0_00F0, 4);
    }
    if shamt & 8 != 0 {
        x = shfl_stage64(x, 0x00FF_0000_00FF_0000, 0x0000_FF00_0000_FF00, 8);
    }
    if shamt & 16 != 0 {
        x = shfl_stage64(x, 0x0000_FFFF_0000_0000, 0x0000_0000_FFFF_0000, 16);
    }
    x
}

fn clmul(a: u64, b: u64, width: u32) -> u64 {
    let mut r = 0u64;
    for i in 0..width {
        if b >> i & 1 != 0 {
            r ^= a.wrapping_shl(i);
        }
    }
    r
}

fn clmulh(a: u64, b: u64, width: u32) -> u64 {
    let mut r = 0u64;
    for i in 1..width {
        if b >> i & 1 != 0 {
            r ^= a >> (width - i);
        }
    }
    r
}

fn clmulr(a: u64, b: u64, width: u32) -> u64 {
    let mut r = 0u64;
    for i in 0..width {
        if b >> i & 1 != 0 {
            r ^= a >> (width - i - 1);
        }
    }
    r
}

fn crc32(mut x: u64, nbits: u32, poly: u64) -> u64 {
    for _ in 0..nbits {
        x = (x >> 1) ^ (poly & 0u64.wrapping_sub(x & 1));
    }
    x
}

/// pext: gather the bits of `a` selected by `mask` into the low bits.
fn bcompress(a: u64, mask: u64) -> u64 {
    let mut r = 0u64;
    let mut j = 0;
    for i in 0..64 {
        if mask >> i & 1 != 0 {
            if a >> i & 1 != 0 {
                r |= 1 << j;
            }
            j += 1;
        }
    }
    r
}

/// pdep: scatter the low bits of `a` to the positions selected by `mask`.
fn bdecompress(a: u64, mask: u64) -> u64 {
    let mut r = 0u64;
    let mut j = 0;
    for i in 0..64 {
        if mask >> i & 1 != 0 {
            if a >> j & 1 != 0 {
                r |= 1 << i;
            }
            j += 1;
        }
    }
    r
}

/// Crossbar permutation: each `chunk`-bit slice of `b` indexes a chunk of
/// `a`; out-of-range indices produce zero.
fn xperm(a: u64, b: u64, chunk: u32, width_bits: u32) -> u64 {
    let mut r = 0u64;
    let mask = (1u64 << chunk) - 1;
    let mut i = 0;
    while i < width_bits {
        let index = (b >> i) & mask;
        let src = index * chunk as u64;
        if src < width_bits as u64 {
            r |= ((a >> src) & mask) << i;
        }
        i += chunk;
    }
    r
}

/// 8x8 bit-matrix transpose of a 64-bit value.
fn bmat_transpose(a: u64) -> u64 {
    let mut r = 0u64;
    for i in 0..8 {
        for j in 0..8 {
            if a >> (i * 8 + j) & 1 != 0 {
                r |= 1 << (j * 8 + i);
            }
        }
    }
    r
}

fn bmator(a: u64, b: u64) -> u64 {
    let bt = bmat_transpose(b);
    let mut r = 0u64;
    for i in 0..8 {
        let row = (a >> (i * 8)) & 0xFF;
        for j in 0..8 {
            let col = (bt >> (j * 8)) & 0xFF;
            if row & col != 0 {
                r |= 1 << (i * 8 + j);
            }
        }
    }
    r
}

fn bmatxor(a: u64, b: u64) -> u64 {
    let bt = bmat_transpose(b);
    let mut r = 0u64;
    for i in 0..8 {
        let row = (a >> (i * 8)) & 0xFF;
        for j in 0..8 {
            let col = (bt >> (j * 8)) & 0xFF;
            if ((row & col).count_ones() & 1) != 0 {
                r |= 1 << (i * 8 + j);
            }
        }
    }
    r
}

impl Hart {
    fn width(&self) -> u32 {
        self.xlen().bits()
    }

    fn zb32(&self) -> bool {
        self.xlen() == Xlen::Rv32
    }

    /// Reg-reg bit-manipulation in OP space. `a`/`b` are the canonical
    /// register values; RV32 semantics operate on the low 32 bits.
    pub(crate) fn zb_reg(
        &mut self,
        funct3: u32,
        funct7: u32,
        a: u64,
        b: u64,
        insn: u32,
    ) -> Result<u64, Trap> {
        let illegal = || Trap::IllegalInstruction(insn as u64);
        let w = self.width();
        let shamt = b & self.xlen().shift_mask();
        let gate = |ok: bool, v: u64| if ok { Ok(v) } else { Err(illegal()) };
        match (funct3, funct7) {
            // Zba
            (2, 0x10) => gate(self.zba, (a << 1).wrapping_add(b)),
            (4, 0x10) => gate(self.zba, (a << 2).wrapping_add(b)),
            (6, 0x10) => gate(self.zba, (a << 3).wrapping_add(b)),
            // Zbb logic-with-negate
            (7, 0x20) => gate(self.zbb || self.zbp, a & !b),
            (6, 0x20) => gate(self.zbb || self.zbp, a | !b),
            (4, 0x20) => gate(self.zbb || self.zbp, !(a ^ b)),
            // Zbb min/max
            (4, 0x05) => gate(self.zbb, ((a as i64) < (b as i64)).then_some(a).unwrap_or(b)),
            (5, 0x05) => gate(self.zbb, a.min(b)),
            (6, 0x05) => gate(self.zbb, ((a as i64) > (b as i64)).then_some(a).unwrap_or(b)),
            (7, 0x05) => gate(self.zbb, a.max(b)),
            // Zbb/Zbp rotates
            (1, 0x30) => gate(self.zbb || self.zbp, self.rotate_left(a, shamt)),
            (5, 0x30) => gate(self.zbb || self.zbp, self.rotate_right(a, shamt)),
            // Zbc carry-less multiply
            (1, 0x05) => gate(self.zbc, self.canon(clmul(a, b, w))),
            (3, 0x05) => gate(self.zbc, clmulh(self.low(a), self.low(b), w)),
            (2, 0x05) => gate(self.zbc, clmulr(self.low(a), self.low(b), w)),
            // Zbs single-bit ops
            (1, 0x14) => gate(self.zbs, a | (1 << shamt)),
            (1, 0x24) => gate(self.zbs, a & !(1 << shamt)),
            (1, 0x34) => gate(self.zbs, a ^ (1 << shamt)),
            (5, 0x24) => gate(self.zbs, (a >> shamt) & 1),
            // Zbp generalized reverse/or-combine
            (5, 0x34) => gate(self.zbp || self.zbb, self.grev(a, shamt)),
            (5, 0x14) => gate(self.zbp || self.zbb, self.gorc(a, shamt)),
            // Zbp shuffle
            (1, 0x04) => gate(self.zbp, self.shfl(a, b)),
            (5, 0x04) => gate(self.zbp, self.unshfl(a, b)),
            // Zbp pack
            (4, 0x04) => gate(self.zbp || self.zbb, self.pack(a, b)),
            (4, 0x24) => gate(self.zbp, self.packu(a, b)),
            (7, 0x04) => gate(self.zbp || self.zbb, ((b & 0xFF) << 8) | (a & 0xFF)),
            // Zbp crossbar permutation
            (2, 0x14) => gate(self.zbp, self.canon(xperm(self.low(a), self.low(b), 4, w))),
            (4, 0x14) => gate(self.zbp, self.canon(xperm(self.low(a), self.low(b), 8, w))),
            (6, 0x14) => gate(self.zbp, self.canon(xperm(self.low(a), self.low(b), 16, w))),
            // Zbe
            (6, 0x04) => gate(self.zbe, self.canon(bcompress(self.low(a), self.low(b)))),
            (6, 0x24) => gate(self.zbe, self.canon(bdecompress(self.low(a), self.low(b)))),
            // Zbf bit-field place
            (7, 0x24) => gate(self.zbf, self.bfp(a, b)),
            // Zbm (RV64 only)
            (3, 0x04) if !self.zb32() => gate(self.zbm, bmator(a, b)),
            (3, 0x24) if !self.zb32() => gate(self.zbm, bmatxor(a, b)),
            _ => Err(illegal()),
        }
    }

    /// Immediate bit-manipulation in OP-IMM shift space (funct3 1 and 5,
    /// funct7 with the RV64 shamt bit already masked off).
    pub(crate) fn zb_imm(
        &mut self,
        funct3: u32,
        funct7: u32,
        shamt: u64,
        a: u64,
        insn: u32,
    ) -> Result<u64, Trap> {
        let illegal = || Trap::IllegalInstruction(insn as u64);
        let gate = |ok: bool, v: u64| if ok { Ok(v) } else { Err(illegal()) };
        match (funct3, funct7) {
            // Unary group: rs2 field selects the operation.
            (1, 0x30) => {
                let sel = shamt;
                match sel {
                    0 => gate(self.zbb, self.count_leading_zeros(a)),
                    1 => gate(self.zbb, self.count_trailing_zeros(a)),
                    2 => gate(self.zbb, self.low(a).count_ones() as u64),
                    3 if !self.zb32() => gate(self.zbm, bmat_transpose(a)),
                    4 => gate(self.zbb, a as i8 as i64 as u64),
                    5 => gate(self.zbb, a as i16 as i64 as u64),
                    0x10..=0x13 => {
                        let nbits = 8 << (sel - 0x10);
                        if self.zb32() && nbits > 32 {
                            return Err(illegal());
                        }
                        gate(self.zbr, crc32(self.low(a), nbits, 0xEDB8_8320))
                    }
                    0x18..=0x1B => {
                        let nbits = 8 << (sel - 0x18);
                        if self.zb32() && nbits > 32 {
                            return Err(illegal());
                        }
                        gate(self.zbr, crc32(self.low(a), nbits, 0x82F6_3B78))
                    }
                    _ => Err(illegal()),
                }
            }
            (5, 0x30) => gate(self.zbb || self.zbp, self.rotate_right(a, shamt)),
            (1, 0x14) => gate(self.zbs, a | (1 << shamt)),
            (1, 0x24) => gate(self.zbs, a & !(1 << shamt)),
            (1, 0x34) => gate(self.zbs, a ^ (1 << shamt)),
            (5, 0x24) => gate(self.zbs, (a >> shamt) & 1),
            (5, 0x14) => gate(self.zbp || self.zbb, self.gorc(a, shamt)),
            (5, 0x34) => gate(self.zbp || self.zbb, self.grev(a, shamt)),
            (1, 0x04) => gate(self.zbp, self.shfl(a, shamt)),
            (5, 0x04) => gate(self.zbp, self.unshfl(a, shamt)),
            _ => Err(illegal()),
        }
    }

    /// Word-width bit-manipulation in OP-32 (RV64 only).
    pub(crate) fn zb_reg32(
        &mut self,
        funct3: u32,
        funct7: u32,
        a: u64,
        b: u64,
        insn: u32,
    ) -> Result<u64, Trap> {
        let illegal = || Trap::IllegalInstruction(insn as u64);
        let gate = |ok: bool, v: u64| if ok { Ok(v) } else { Err(illegal()) };
        let sext = |v: u32| v as i32 as i64 as u64;
        let a32 = a as u32;
        let b32 = b as u32;
        let shamt = b & 0x1F;
        let uw = a as u32 as u64;
        match (funct3, funct7) {
            // Zba word forms
            (0, 0x04) => gate(self.zba, uw.wrapping_add(b)),
            (2, 0x10) => gate(self.zba, (uw << 1).wrapping_add(b)),
            (4, 0x10) => gate(self.zba, (uw << 2).wrapping_add(b)),
            (6, 0x10) => gate(self.zba, (uw << 3).wrapping_add(b)),
            // Zbb rotates
            (1, 0x30) => gate(self.zbb || self.zbp, sext(a32.rotate_left(shamt as u32))),
            (5, 0x30) => gate(self.zbb || self.zbp, sext(a32.rotate_right(shamt as u32))),
            // Zbp word forms
            (4, 0x04) => gate(
                self.zbp || self.zbb,
                sext(((b32 & 0xFFFF) << 16) | (a32 & 0xFFFF)),
            ),
            (4, 0x24) => gate(self.zbp, sext(((b32 >> 16) << 16) | (a32 >> 16))),
            (5, 0x34) => gate(self.zbp, sext(grev64(a32 as u64, shamt & 0x1F) as u32)),
            (5, 0x14) => gate(self.zbp, sext(gorc64(a32 as u64, shamt & 0x1F) as u32)),
            (1, 0x04) => gate(self.zbp, sext(shfl64(a32 as u64, b & 0xF) as u32)),
            (5, 0x04) => gate(self.zbp, sext(unshfl64(a32 as u64, b & 0xF) as u32)),
            _ => Err(illegal()),
        }
    }

    /// Word-width immediate bit-manipulation in OP-IMM-32 (RV64 only).
    pub(crate) fn zb_imm32(
        &mut self,
        funct3: u32,
        funct7: u32,
        imm: i64,
        a: u64,
        insn: u32,
    ) -> Result<u64, Trap> {
        let illegal = || Trap::IllegalInstruction(insn as u64);
        let gate = |ok: bool, v: u64| if ok { Ok(v) } else { Err(illegal()) };
        let sext = |v: u32| v as i32 as i64 as u64;
        let a32 = a as u32;
        let shamt5 = (imm as u64) & 0x1F;
        match (funct3, funct7 & !1) {
            // slli.uw takes the full 6-bit shamt.
            (1, 0x04) => gate(self.zba, ((a as u32 as u64) << ((imm as u64) & 0x3F))),
            (1, 0x30) => {
                // Unary word group.
                match shamt5 {
                    0 => gate(self.zbb, a32.leading_zeros() as u64),
                    1 => gate(self.zbb, a32.trailing_zeros() as u64),
                    2 => gate(self.zbb, a32.count_ones() as u64),
                    _ => Err(illegal()),
                }
            }
            (5, 0x30) => gate(self.zbb || self.zbp, sext(a32.rotate_right(shamt5 as u32))),
            (5, 0x34) => gate(self.zbp, sext(grev64(a32 as u64, shamt5) as u32)),
            (5, 0x14) => gate(self.zbp, sext(gorc64(a32 as u64, shamt5) as u32)),
            _ => Err(illegal()),
        }
    }

    /// Zbt: cmix, cmov, fsl, fsr.
    pub(crate) fn zb_ternary(
        &mut self,
        funct3: u32,
        funct2: u32,
        a: u64,
        b: u64,
        c: u64,
        insn: u32,
    ) -> Result<u64, Trap> {
        match (funct3, funct2) {
            (1, 3) => Ok((a & b) | (c & !b)),
            (5, 3) => Ok(if b != 0 { a } else { c }),
            (1, 2) => Ok(self.funnel_shift_left(a, c, b)),
            (5, 2) => Ok(self.funnel_shift_right(a, c, b)),
            _ => Err(Trap::IllegalInstruction(insn as u64)),
        }
    }

    pub(crate) fn funnel_shift_left(&self, a: u64, c: u64, shamt: u64) -> u64 {
        let w = self.width() as u64;
        let mut shamt = shamt & (2 * w - 1);
        let (mut hi, mut lo) = (self.low(a), self.low(c));
        if shamt >= w {
            std::mem::swap(&mut hi, &mut lo);
            shamt -= w;
        }
        let v = if shamt == 0 {
            hi
        } else {
            (hi << shamt) | (lo >> (w - shamt))
        };
        self.canon(v)
    }

    pub(crate) fn funnel_shift_right(&self, a: u64, c: u64, shamt: u64) -> u64 {
        let w = self.width() as u64;
        let mut shamt = shamt & (2 * w - 1);
        let (mut lo, mut hi) = (self.low(a), self.low(c));
        if shamt >= w {
            std::mem::swap(&mut lo, &mut hi);
            shamt -= w;
        }
        let v = if shamt == 0 {
            lo
        } else {
            (lo >> shamt) | (hi << (w - shamt))
        };
        self.canon(v)
    }

    // Width helpers: `low` truncates to the operating width (zero-extended in
    // the u64 carrier), `canon` restores the canonical sign-extended form.

    fn low(&self, v: u64) -> u64 {
        match self.xlen() {
            Xlen::Rv32 => v as u32 as u64,
            Xlen::Rv64 => v,
        }
    }

    fn canon(&self, v: u64) -> u64 {
        self.xlen().canonicalize(v)
    }

    fn rotate_left(&self, a: u64, shamt: u64) -> u64 {
        match self.xlen() {
            Xlen::Rv32 => self.canon((a as u32).rotate_left(shamt as u32) as u64),
            Xlen::Rv64 => a.rotate_left(shamt as u32),
        }
    }

    fn rotate_right(&self, a: u64, shamt: u64) -> u64 {
        match self.xlen() {
            Xlen::Rv32 => self.canon((a as u32).rotate_right(shamt as u32) as u64),
            Xlen::Rv64 => a.rotate_right(shamt as u32),
        }
    }

    fn count_leading_zeros(&self, a: u64) -> u64 {
        match self.xlen() {
            Xlen::Rv32 => (a as u32).leading_zeros() as u64,
            Xlen::Rv64 => a.leading_zeros() as u64,
        }
    }

    fn count_trailing_zeros(&self, a: u64) -> u64 {
        match self.xlen() {
            Xlen::Rv32 => (a as u32).trailing_zeros() as u64,
            Xlen::Rv64 => a.trailing_zeros() as u64,
        }
    }

    fn grev(&self, a: u64, shamt: u64) -> u64 {
        match self.xlen() {
            Xlen::Rv32 => self.canon(grev64(a as u32 as u64, shamt & 0x1F) as u32 as u64),
            Xlen::Rv64 => grev64(a, shamt),
        }
    }

    fn gorc(&self, a: u64, shamt: u64) -> u64 {
        match self.xlen() {
            Xlen::Rv32 => self.canon(gorc64(a as u32 as u64, shamt & 0x1F) as u32 as u64),
            Xlen::Rv64 => gorc64(a, shamt),
        }
    }

    fn shfl(&self, a: u64, b: u64) -> u64 {
        match self.xlen() {
            Xlen::Rv32 => self.canon(shfl64(a as u32 as u64, b & 0xF) as u32 as u64),
            Xlen::Rv64 => shfl64(a, b & 0x1F),
        }
    }

    fn unshfl(&self, a: u64, b: u64) -> u64 {
        match self.xlen() {
            Xlen::Rv32 => self.canon(unshfl64(a as u32 as u64, b & 0xF) as u32 as u64),
            Xlen::Rv64 => unshfl64(a, b & 0x1F),
        }
    }

    fn pack(&self, a: u64, b: u64) -> u64 {
        let half = self.width() as u64 / 2;
        let mask = (1u64 << half) - 1;
        self.canon(((b & mask) << half) | (a & mask))
    }

    fn packu(&self, a: u64, b: u64) -> u64 {
        let half = self.width() as u64 / 2;
        let hi = |v: u64| (self.low(v) >> half) & ((1u64 << half) - 1);
        self.canon((hi(b) << half) | hi(a))
    }

    /// Zbf bit-field place: cfg in the upper half of rs2 gives offset and
    /// length; the low bits of rs2 are placed into rs1 at that field.
    fn bfp(&self, a: u64, b: u64) -> u64 {
        let w = self.width() as u64;
        let cfg = self.low(b) >> (w / 2);
        let mut len = (cfg >> 8) & (w / 2 - 1);
        if len == 0 {
            len = w / 2;
        }
        let off = cfg & (w - 1);
        let mask = if len >= 64 { u64::MAX } else { (1u64 << len) - 1 };
        let mask = mask.wrapping_shl(off as u32);
        let data = self.low(b).wrapping_shl(off as u32);
        self.canon((data & mask) | (self.low(a) & !mask))
    }
}

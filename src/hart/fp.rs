//! F and D extensions: IEEE-754 arithmetic through soft-float, NaN boxing of
//! single-precision values in the 64-bit register file, rounding-mode
//! resolution, and accrued-flag bookkeeping in fcsr.

use simple_soft_float::{FPState, RoundingMode, StatusFlags, F32, F64};

use super::{Hart, LoadEntry};
use crate::memory::Memory;
use crate::{Trap, Xlen};

const CANONICAL_NAN_32: u32 = 0x7FC0_0000;
const CANONICAL_NAN_64: u64 = 0x7FF8_0000_0000_0000;
const NAN_BOX: u64 = 0xFFFF_FFFF_0000_0000;

mod fflags {
    pub const NX: u64 = 1 << 0;
    pub const UF: u64 = 1 << 1;
    pub const OF: u64 = 1 << 2;
    pub const DZ: u64 = 1 << 3;
    pub const NV: u64 = 1 << 4;
}

fn flags_to_bits(state: &FPState) -> u64 {
    let flags = state.status_flags;
    let mut bits = 0;
    if flags.contains(StatusFlags::INVALID_OPERATION) {
        bits |= fflags::NV;
    }
    if flags.contains(StatusFlags::DIVISION_BY_ZERO) {
        bits |= fflags::DZ;
    }
    if flags.contains(StatusFlags::OVERFLOW) {
        bits |= fflags::OF;
    }
    if flags.contains(StatusFlags::UNDERFLOW) {
        bits |= fflags::UF;
    }
    if flags.contains(StatusFlags::INEXACT) {
        bits |= fflags::NX;
    }
    bits
}

fn is_signaling_nan32(bits: u32) -> bool {
    let exp = bits & 0x7F80_0000;
    let frac = bits & 0x007F_FFFF;
    exp == 0x7F80_0000 && frac != 0 && frac & 0x0040_0000 == 0
}

fn is_signaling_nan64(bits: u64) -> bool {
    let exp = bits & 0x7FF0_0000_0000_0000;
    let frac = bits & 0x000F_FFFF_FFFF_FFFF;
    exp == 0x7FF0_0000_0000_0000 && frac != 0 && frac & 0x0008_0000_0000_0000 == 0
}

/// The ten-bit class mask of FCLASS.
fn fclass32(bits: u32) -> u64 {
    let sign = bits >> 31;
    let exp = (bits >> 23) & 0xFF;
    let frac = bits & 0x007F_FFFF;
    classify(sign as u64, exp == 0xFF, exp == 0, frac == 0, frac & 0x0040_0000 != 0)
}

fn fclass64(bits: u64) -> u64 {
    let sign = bits >> 63;
    let exp = (bits >> 52) & 0x7FF;
    let frac = bits & 0x000F_FFFF_FFFF_FFFF;
    classify(
        sign,
        exp == 0x7FF,
        exp == 0,
        frac == 0,
        frac & 0x0008_0000_0000_0000 != 0,
    )
}

fn classify(sign: u64, exp_max: bool, exp_zero: bool, frac_zero: bool, quiet: bool) -> u64 {
    if exp_max {
        if frac_zero {
            if sign == 0 {
                1 << 7
            } else {
                1 << 0
            }
        } else if quiet {
            1 << 9
        } else {
            1 << 8
        }
    } else if exp_zero {
        if frac_zero {
            if sign == 0 {
                1 << 4
            } else {
                1 << 3
            }
        } else if sign == 0 {
            1 << 5
        } else {
            1 << 2
        }
    } else if sign == 0 {
        1 << 6
    } else {
        1 << 1
    }
}

impl Hart {
    /// Unbox a single-precision value: a 64-bit slot whose upper half is not
    /// all-ones reads as the canonical NaN.
    fn read_f32_bits(&self, ix: u8) -> u32 {
        let raw = self.read_freg(ix);
        if raw & NAN_BOX == NAN_BOX {
            raw as u32
        } else {
            CANONICAL_NAN_32
        }
    }

    fn write_f32_bits(&mut self, ix: u8, bits: u32) {
        self.write_freg(ix, NAN_BOX | bits as u64);
    }

    /// Resolve the effective rounding mode: the instruction field, or
    /// fcsr.frm when the field is DYN (7). Reserved encodings are illegal.
    fn rounding_mode(&self, rm_field: u32, insn: u32) -> Result<RoundingMode, Trap> {
        let rm = if rm_field == 7 {
            (self.fcsr_value() >> 5) & 0x7
        } else {
            rm_field as u64
        };
        match rm {
            0 => Ok(RoundingMode::TiesToEven),
            1 => Ok(RoundingMode::TowardZero),
            2 => Ok(RoundingMode::TowardNegative),
            3 => Ok(RoundingMode::TowardPositive),
            4 => Ok(RoundingMode::TiesToAway),
            _ => Err(Trap::IllegalInstruction(insn as u64)),
        }
    }

    fn require_fp(&self, insn: u32) -> Result<(), Trap> {
        if self.fp_enabled() {
            Ok(())
        } else {
            Err(Trap::IllegalInstruction(insn as u64))
        }
    }

    fn require_fmt(&self, double: bool, insn: u32) -> Result<(), Trap> {
        let ok = if double {
            self.rvd_enabled()
        } else {
            self.rvf_enabled()
        };
        if ok {
            Ok(())
        } else {
            Err(Trap::IllegalInstruction(insn as u64))
        }
    }

    pub(crate) fn fp_load(
        &mut self,
        mem: &mut Memory,
        rd: u8,
        rs1: u8,
        imm: i64,
        funct3: u32,
        insn: u32,
    ) -> Result<(), Trap> {
        self.require_fp(insn)?;
        self.require_fmt(funct3 == 3, insn)?;
        self.check_reg(rs1)?;
        let addr = self.xlen().mask_address(self.read_reg(rs1).wrapping_add(imm as u64));
        let size = if funct3 == 2 { 4 } else { 8 };
        let paddr = self.prepare_load(mem, addr, size, false, Trap::LoadAddressMisaligned)?;
        let raw = mem
            .read(paddr, size)
            .map_err(|_| Trap::LoadAccessFault(addr))?;
        let prev = self.read_freg(rd);
        if size == 4 {
            self.write_f32_bits(rd, raw as u32);
        } else {
            self.write_freg(rd, raw);
        }
        if self.load_queue_enabled() {
            self.push_load_queue(LoadEntry {
                size,
                addr: paddr,
                reg: rd,
                prev_value: prev,
                tag: self.instruction_count(),
                valid: true,
                fp: true,
            });
        }
        Ok(())
    }

    pub(crate) fn fp_store(
        &mut self,
        mem: &mut Memory,
        rs1: u8,
        rs2: u8,
        imm: i64,
        funct3: u32,
        insn: u32,
    ) -> Result<(), Trap> {
        self.require_fp(insn)?;
        self.require_fmt(funct3 == 3, insn)?;
        self.check_reg(rs1)?;
        let addr = self.xlen().mask_address(self.read_reg(rs1).wrapping_add(imm as u64));
        let raw = self.read_freg(rs2);
        if funct3 == 2 {
            self.store(mem, addr, 4, raw & 0xFFFF_FFFF)
        } else {
            self.store(mem, addr, 8, raw)
        }
    }

    pub(crate) fn execute_fp_op(
        &mut self,
        rd: u8,
        rs1: u8,
        rs2: u8,
        funct7: u32,
        rm: u32,
        insn: u32,
    ) -> Result<(), Trap> {
        self.require_fp(insn)?;
        let illegal = || Trap::IllegalInstruction(insn as u64);
        // fmt is a two-bit field; only S (00) and D (01) are implemented.
        if funct7 & 0b10 != 0 {
            return Err(illegal());
        }
        let double = funct7 & 1 == 1;
        let group = funct7 >> 2;

        match group {
            // fadd/fsub/fmul/fdiv
            0x00 | 0x01 | 0x02 | 0x03 => {
                self.require_fmt(double, insn)?;
                let mode = self.rounding_mode(rm, insn)?;
                let mut state = FPState::default();
                if double {
                    let a = F64::from_bits(self.read_freg(rs1));
                    let b = F64::from_bits(self.read_freg(rs2));
                    let r = match group {
                        0x00 => a.add(&b, Some(mode), Some(&mut state)),
                        0x01 => a.sub(&b, Some(mode), Some(&mut state)),
                        0x02 => a.mul(&b, Some(mode), Some(&mut state)),
                        _ => a.div(&b, Some(mode), Some(&mut state)),
                    };
                    self.accrue_fp_flags(flags_to_bits(&state));
                    self.write_freg(rd, r.into_bits());
                } else {
                    let a = F32::from_bits(self.read_f32_bits(rs1));
                    let b = F32::from_bits(self.read_f32_bits(rs2));
                    let r = match group {
                        0x00 => a.add(&b, Some(mode), Some(&mut state)),
                        0x01 => a.sub(&b, Some(mode), Some(&mut state)),
                        0x02 => a.mul(&b, Some(mode), Some(&mut state)),
                        _ => a.div(&b, Some(mode), Some(&mut state)),
                    };
                    self.accrue_fp_flags(flags_to_bits(&state));
                    self.write_f32_bits(rd, r.into_bits());
                }
                Ok(())
            }
            // fsqrt
            0x0B => {
                self.require_fmt(double, insn)?;
                let mode = self.rounding_mode(rm, insn)?;
                let mut state = FPState::default();
                if double {
                    let a = F64::from_bits(self.read_freg(rs1));
                    let r = a.sqrt(Some(mode), Some(&mut state));
                    self.accrue_fp_flags(flags_to_bits(&state));
                    self.write_freg(rd, r.into_bits());
                } else {
                    let a = F32::from_bits(self.read_f32_bits(rs1));
                    let r = a.sqrt(Some(mode), Some(&mut state));
                    self.accrue_fp_flags(flags_to_bits(&state));
                    self.write_f32_bits(rd, r.into_bits());
                }
                Ok(())
            }
            // fsgnj/fsgnjn/fsgnjx
            0x04 => {
                self.require_fmt(double, insn)?;
                if double {
                    let a = self.read_freg(rs1);
                    let b = self.read_freg(rs2);
                    let sign = 1u64 << 63;
                    let r = match rm {
                        0 => (a & !sign) | (b & sign),
                        1 => (a & !sign) | (!b & sign),
                        2 => a ^ (b & sign),
                        _ => return Err(illegal()),
                    };
                    self.write_freg(rd, r);
                } else {
                    let a = self.read_f32_bits(rs1);
                    let b = self.read_f32_bits(rs2);
                    let sign = 1u32 << 31;
                    let r = match rm {
                        0 => (a & !sign) | (b & sign),
                        1 => (a & !sign) | (!b & sign),
                        2 => a ^ (b & sign),
                        _ => return Err(illegal()),
                    };
                    self.write_f32_bits(rd, r);
                }
                Ok(())
            }
            // fmin/fmax
            0x05 => {
                self.require_fmt(double, insn)?;
                match rm {
                    0 | 1 => {}
                    _ => return Err(illegal()),
                }
                if double {
                    self.min_max_f64(rd, rs1, rs2, rm == 0);
                } else {
                    self.min_max_f32(rd, rs1, rs2, rm == 0);
                }
                Ok(())
            }
            // fcvt.s.d / fcvt.d.s
            0x08 => {
                if !self.rvd_enabled() {
                    return Err(illegal());
                }
                let mode = self.rounding_mode(rm, insn)?;
                let mut state = FPState::default();
                if double {
                    // fcvt.d.s
                    if rs2 != 0 {
                        return Err(illegal());
                    }
                    let a = F32::from_bits(self.read_f32_bits(rs1));
                    let r = F64::convert_from_float(&a, Some(mode), Some(&mut state));
                    self.accrue_fp_flags(flags_to_bits(&state));
                    self.write_freg(rd, r.into_bits());
                } else {
                    // fcvt.s.d
                    if rs2 != 1 {
                        return Err(illegal());
                    }
                    let a = F64::from_bits(self.read_freg(rs1));
                    let r = F32::convert_from_float(&a, Some(mode), Some(&mut state));
                    self.accrue_fp_flags(flags_to_bits(&state));
                    self.write_f32_bits(rd, r.into_bits());
                }
                Ok(())
            }
            // feq/flt/fle
            0x14 => {
                self.require_fmt(double, insn)?;
                self.check_reg(rd)?;
                let mut state = FPState::default();
                let ordering = if double {
                    let a = F64::from_bits(self.read_freg(rs1));
                    let b = F64::from_bits(self.read_freg(rs2));
                    if rm == 2 {
                        a.compare_quiet(&b, Some(&mut state))
                    } else {
                        a.compare_signaling(&b, Some(&mut state))
                    }
                } else {
                    let a = F32::from_bits(self.read_f32_bits(rs1));
                    let b = F32::from_bits(self.read_f32_bits(rs2));
                    if rm == 2 {
                        a.compare_quiet(&b, Some(&mut state))
                    } else {
                        a.compare_signaling(&b, Some(&mut state))
                    }
                };
                self.accrue_fp_flags(flags_to_bits(&state));
                use std::cmp::Ordering;
                let result = match rm {
                    2 => ordering == Some(Ordering::Equal),
                    1 => ordering == Some(Ordering::Less),
                    0 => matches!(ordering, Some(Ordering::Less) | Some(Ordering::Equal)),
                    _ => return Err(illegal()),
                };
                self.write_reg(rd, result as u64);
                Ok(())
            }
            // fcvt.w[u]/l[u] from float
            0x18 => {
                self.require_fmt(double, insn)?;
                self.check_reg(rd)?;
                self.fp_to_int(rd, rs1, rs2, double, rm, insn)
            }
            // fcvt float from w[u]/l[u]
            0x1A => {
                self.require_fmt(double, insn)?;
                self.int_to_fp(rd, rs1, rs2, double, rm, insn)
            }
            // fmv.x.w / fclass
            0x1C => {
                self.require_fmt(double, insn)?;
                self.check_reg(rd)?;
                match rm {
                    0 => {
                        if double {
                            if self.xlen() == Xlen::Rv32 {
                                return Err(illegal());
                            }
                            let v = self.read_freg(rs1);
                            self.write_reg(rd, v);
                        } else {
                            let v = self.read_freg(rs1) as u32;
                            self.write_reg(rd, v as i32 as i64 as u64);
                        }
                    }
                    1 => {
                        let class = if double {
                            fclass64(self.read_freg(rs1))
                        } else {
                            fclass32(self.read_f32_bits(rs1))
                        };
                        self.write_reg(rd, class);
                    }
                    _ => return Err(illegal()),
                }
                Ok(())
            }
            // fmv.w.x / fmv.d.x
            0x1E => {
                self.require_fmt(double, insn)?;
                if rm != 0 {
                    return Err(illegal());
                }
                let v = self.read_reg(rs1);
                if double {
                    if self.xlen() == Xlen::Rv32 {
                        return Err(illegal());
                    }
                    self.write_freg(rd, v);
                } else {
                    self.write_f32_bits(rd, v as u32);
                }
                Ok(())
            }
            _ => Err(illegal()),
        }
    }

    fn fp_to_int(
        &mut self,
        rd: u8,
        rs1: u8,
        selector: u8,
        double: bool,
        rm: u32,
        insn: u32,
    ) -> Result<(), Trap> {
        let illegal = || Trap::IllegalInstruction(insn as u64);
        if selector >= 2 && self.xlen() == Xlen::Rv32 {
            return Err(illegal());
        }
        let mode = self.rounding_mode(rm, insn)?;
        let mut state = FPState::default();
        let (negative, is_nan): (bool, bool);
        let value: Option<u64> = if double {
            let bits = self.read_freg(rs1);
            negative = bits >> 63 != 0;
            is_nan = bits & 0x7FF0_0000_0000_0000 == 0x7FF0_0000_0000_0000
                && bits & 0x000F_FFFF_FFFF_FFFF != 0;
            let a = F64::from_bits(bits);
            match selector {
                0 => a.to_i32(true, Some(mode), Some(&mut state)).map(|v| v as i64 as u64),
                1 => a.to_u32(true, Some(mode), Some(&mut state)).map(|v| v as i32 as i64 as u64),
                2 => a.to_i64(true, Some(mode), Some(&mut state)).map(|v| v as u64),
                3 => a.to_u64(true, Some(mode), Some(&mut state)),
                _ => return Err(illegal()),
            }
        } else {
            let bits = self.read_f32_bits(rs1);
            negative = bits >> 31 != 0;
            is_nan = bits & 0x7F80_0000 == 0x7F80_0000 && bits & 0x007F_FFFF != 0;
            let a = F32::from_bits(bits);
            match selector {
                0 => a.to_i32(true, Some(mode), Some(&mut state)).map(|v| v as i64 as u64),
                1 => a.to_u32(true, Some(mode), Some(&mut state)).map(|v| v as i32 as i64 as u64),
                2 => a.to_i64(true, Some(mode), Some(&mut state)).map(|v| v as u64),
                3 => a.to_u64(true, Some(mode), Some(&mut state)),
                _ => return Err(illegal()),
            }
        };
        self.accrue_fp_flags(flags_to_bits(&state));
        // Out-of-range and NaN saturate per the RISC-V conversion tables.
        let result = value.unwrap_or_else(|| match selector {
            0 => {
                if is_nan || !negative {
                    i32::MAX as i64 as u64
                } else {
                    i32::MIN as i64 as u64
                }
            }
            1 => {
                if is_nan || !negative {
                    u32::MAX as i32 as i64 as u64
                } else {
                    0
                }
            }
            2 => {
                if is_nan || !negative {
                    i64::MAX as u64
                } else {
                    i64::MIN as u64
                }
            }
            _ => {
                if is_nan || !negative {
                    u64::MAX
                } else {
                    0
                }
            }
        });
        self.write_reg(rd, result);
        Ok(())
    }

    fn int_to_fp(
        &mut self,
        rd: u8,
        rs1: u8,
        selector: u8,
        double: bool,
        rm: u32,
        insn: u32,
    ) -> Result<(), Trap> {
        let illegal = || Trap::IllegalInstruction(insn as u64);
        if selector >= 2 && self.xlen() == Xlen::Rv32 {
            return Err(illegal());
        }
        self.check_reg(rs1)?;
        let mode = self.rounding_mode(rm, insn)?;
        let mut state = FPState::default();
        let v = self.read_reg(rs1);
        if double {
            let r = match selector {
                0 => F64::from_i32(v as i32, Some(mode), Some(&mut state)),
                1 => F64::from_u32(v as u32, Some(mode), Some(&mut state)),
                2 => F64::from_i64(v as i64, Some(mode), Some(&mut state)),
                3 => F64::from_u64(v, Some(mode), Some(&mut state)),
                _ => return Err(illegal()),
            };
            self.accrue_fp_flags(flags_to_bits(&state));
            self.write_freg(rd, r.into_bits());
        } else {
            let r = match selector {
                0 => F32::from_i32(v as i32, Some(mode), Some(&mut state)),
                1 => F32::from_u32(v as u32, Some(mode), Some(&mut state)),
                2 => F32::from_i64(v as i64, Some(mode), Some(&mut state)),
                3 => F32::from_u64(v, Some(mode), Some(&mut state)),
                _ => return Err(illegal()),
            };
            self.accrue_fp_flags(flags_to_bits(&state));
            self.write_f32_bits(rd, r.into_bits());
        }
        Ok(())
    }

    fn min_max_f32(&mut self, rd: u8, rs1: u8, rs2: u8, is_min: bool) {
        let a_bits = self.read_f32_bits(rs1);
        let b_bits = self.read_f32_bits(rs2);
        let a = f32::from_bits(a_bits);
        let b = f32::from_bits(b_bits);
        let mut flags = 0;
        if is_signaling_nan32(a_bits) || is_signaling_nan32(b_bits) {
            flags |= fflags::NV;
        }
        let result = if a.is_nan() && b.is_nan() {
            CANONICAL_NAN_32
        } else if a.is_nan() {
            b_bits
        } else if b.is_nan() {
            a_bits
        } else if a == 0.0 && b == 0.0 {
            // min(+0, -0) is -0; max(+0, -0) is +0.
            if is_min {
                a_bits | b_bits
            } else {
                a_bits & b_bits
            }
        } else if (is_min && a < b) || (!is_min && a > b) {
            a_bits
        } else {
            b_bits
        };
        self.write_f32_bits(rd, result);
        self.accrue_fp_flags(flags);
    }

    fn min_max_f64(&mut self, rd: u8, rs1: u8, rs2: u8, is_min: bool) {
        let a_bits = self.read_freg(rs1);
        let b_bits = self.read_freg(rs2);
        let a = f64::from_bits(a_bits);
        let b = f64::from_bits(b_bits);
        let mut flags = 0;
        if is_signaling_nan64(a_bits) || is_signaling_nan64(b_bits) {
            flags |= fflags::NV;
        }
        let result = if a.is_nan() && b.is_nan() {
            CANONICAL_NAN_64
        } else if a.is_nan() {
            b_bits
        } else if b.is_nan() {
            a_bits
        } else if a == 0.0 && b == 0.0 {
            if is_min {
                a_bits | b_bits
            } else {
                a_bits & b_bits
            }
        } else if (is_min && a < b) || (!is_min && a > b) {
            a_bits
        } else {
            b_bits
        };
        self.write_freg(rd, result);
        self.accrue_fp_flags(flags);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn execute_fp_fma(
        &mut self,
        which: u8,
        rd: u8,
        rs1: u8,
        rs2: u8,
        rs3: u8,
        fmt: u32,
        rm: u32,
        insn: u32,
    ) -> Result<(), Trap> {
        self.require_fp(insn)?;
        let double = match fmt {
            0 => false,
            1 => true,
            _ => return Err(Trap::IllegalInstruction(insn as u64)),
        };
        self.require_fmt(double, insn)?;
        let mode = self.rounding_mode(rm, insn)?;
        let mut state = FPState::default();
        if double {
            let mut a = F64::from_bits(self.read_freg(rs1));
            let b = F64::from_bits(self.read_freg(rs2));
            let mut c = F64::from_bits(self.read_freg(rs3));
            // fmsub negates the addend; fnmadd/fnmsub negate the product.
            if which == 1 || which == 3 {
                c.toggle_sign();
            }
            if which == 2 || which == 3 {
                a.toggle_sign();
            }
            let r = a.fused_mul_add(&b, &c, Some(mode), Some(&mut state));
            self.accrue_fp_flags(flags_to_bits(&state));
            self.write_freg(rd, r.into_bits());
        } else {
            let mut a = F32::from_bits(self.read_f32_bits(rs1));
            let b = F32::from_bits(self.read_f32_bits(rs2));
            let mut c = F32::from_bits(self.read_f32_bits(rs3));
            if which == 1 || which == 3 {
                c.toggle_sign();
            }
            if which == 2 || which == 3 {
                a.toggle_sign();
            }
            let r = a.fused_mul_add(&b, &c, Some(mode), Some(&mut state));
            self.accrue_fp_flags(flags_to_bits(&state));
            self.write_f32_bits(rd, r.into_bits());
        }
        Ok(())
    }
}

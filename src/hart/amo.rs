//! A extension: load-reserved / store-conditional and the AMO
//! read-modify-write operations. Reservations live in [`Memory`] at cache
//! line granularity so stores from any hart invalidate them.

use super::Hart;
use crate::memory::Memory;
use crate::mmu::AccessType;
use crate::pmp::PmpAccess;
use crate::{Trap, Xlen};

impl Hart {
    pub(crate) fn execute_amo(
        &mut self,
        mem: &mut Memory,
        rd: u8,
        rs1: u8,
        rs2: u8,
        funct3: u32,
        funct5: u32,
        insn: u32,
    ) -> Result<Option<u64>, Trap> {
        let illegal = || Trap::IllegalInstruction(insn as u64);
        if !self.rva_enabled() {
            return Err(illegal());
        }
        self.check_reg(rd)?;
        self.check_reg(rs1)?;
        self.check_reg(rs2)?;
        let size: u32 = match funct3 {
            2 => 4,
            3 if self.xlen() == Xlen::Rv64 => 8,
            _ => return Err(illegal()),
        };
        let addr = self.xlen().mask_address(self.read_reg(rs1));

        match funct5 {
            // LR
            0b00010 => {
                if rs2 != 0 {
                    return Err(illegal());
                }
                if addr % size as u64 != 0 {
                    return Err(self.misaligned_amo_cause(addr, false));
                }
                let paddr = self.amo_translate(mem, addr, size, false)?;
                let raw = mem
                    .read(paddr, size)
                    .map_err(|_| Trap::LoadAccessFault(addr))?;
                let value = if size == 4 {
                    raw as u32 as i32 as i64 as u64
                } else {
                    raw
                };
                self.write_reg(rd, value);
                mem.reserve(self.hart_ix(), paddr);
                Ok(None)
            }
            // SC
            0b00011 => {
                if addr % size as u64 != 0 {
                    return Err(self.misaligned_amo_cause(addr, true));
                }
                let paddr = self.amo_translate(mem, addr, size, true)?;
                if mem.has_reservation(self.hart_ix(), paddr) {
                    let value = self.read_reg(rs2);
                    self.store(mem, addr, size, value)?;
                    self.write_reg(rd, 0);
                } else {
                    self.write_reg(rd, 1);
                }
                // The reservation is consumed whether or not the store won.
                mem.invalidate_lr(self.hart_ix());
                Ok(None)
            }
            // AMO*
            _ => {
                if addr % size as u64 != 0 {
                    return Err(self.misaligned_amo_cause(addr, true));
                }
                let paddr = self.amo_translate(mem, addr, size, true)?;
                let raw = mem
                    .read(paddr, size)
                    .map_err(|_| Trap::LoadAccessFault(addr))?;
                let old = if size == 4 {
                    raw as u32 as i32 as i64 as u64
                } else {
                    raw
                };
                let operand = self.read_reg(rs2);
                let new = Self::amo_compute(funct5, old, operand, size).ok_or_else(illegal)?;
                self.store(mem, addr, size, new)?;
                self.write_reg(rd, old);
                Ok(None)
            }
        }
    }

    /// Translation plus the PMP and DCCM policy checks shared by all atomic
    /// forms.
    fn amo_translate(
        &mut self,
        mem: &mut Memory,
        vaddr: u64,
        size: u32,
        is_store: bool,
    ) -> Result<u64, Trap> {
        let access = if is_store {
            AccessType::Store
        } else {
            AccessType::Load
        };
        let paddr = self.translate_data(mem, vaddr, access)?;
        let pmp_kind = if is_store {
            PmpAccess::Write
        } else {
            PmpAccess::Read
        };
        let fault = |addr| {
            if is_store {
                Trap::StoreAccessFault(addr)
            } else {
                Trap::LoadAccessFault(addr)
            }
        };
        if !self.pmp_check(paddr, size as u64, pmp_kind, self.effective_data_mode()) {
            return Err(fault(vaddr));
        }
        if self.amo_in_dccm_only() && !mem.pma(paddr).dccm {
            return Err(fault(vaddr));
        }
        Ok(paddr)
    }

    /// Cause raised by a misaligned atomic, selected by configuration.
    fn misaligned_amo_cause(&self, addr: u64, is_store: bool) -> Trap {
        match (self.misal_atomic_access_fault(), is_store) {
            (true, true) => Trap::StoreAccessFault(addr),
            (true, false) => Trap::LoadAccessFault(addr),
            (false, true) => Trap::StoreAddressMisaligned(addr),
            (false, false) => Trap::LoadAddressMisaligned(addr),
        }
    }

    fn amo_compute(funct5: u32, old: u64, operand: u64, size: u32) -> Option<u64> {
        let value = if size == 4 {
            let old32 = old as u32;
            let op32 = operand as u32;
            let v = match funct5 {
                0b00001 => op32,
                0b00000 => old32.wrapping_add(op32),
                0b00100 => old32 ^ op32,
                0b01000 => old32 | op32,
                0b01100 => old32 & op32,
                0b10000 => (old32 as i32).min(op32 as i32) as u32,
                0b10100 => (old32 as i32).max(op32 as i32) as u32,
                0b11000 => old32.min(op32),
                0b11100 => old32.max(op32),
                _ => return None,
            };
            v as u64
        } else {
            match funct5 {
                0b00001 => operand,
                0b00000 => old.wrapping_add(operand),
                0b00100 => old ^ operand,
                0b01000 => old | operand,
                0b01100 => old & operand,
                0b10000 => (old as i64).min(operand as i64) as u64,
                0b10100 => (old as i64).max(operand as i64) as u64,
                0b11000 => old.min(operand),
                0b11100 => old.max(operand),
                _ => return None,
            }
        };
        Some(value)
    }
}

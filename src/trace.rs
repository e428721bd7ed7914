//! Per-retired-instruction trace records: tag, PC, raw instruction word,
//! mnemonic, and the register/CSR/memory deltas of that instruction.

use std::fmt;

use crate::csr::CsrNumber;
use crate::hart::Hart;

const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub tag: u64,
    pub pc: u64,
    pub insn: u32,
    pub mnemonic: &'static str,
    pub int_reg: Option<(u8, u64)>,
    pub fp_reg: Option<(u8, u64)>,
    pub csrs: Vec<(CsrNumber, u64)>,
    pub mem: Vec<(u64, u32, u64)>,
    pub trap: Option<u64>,
    abi_names: bool,
}

impl TraceRecord {
    pub(crate) fn from_hart(hart: &Hart) -> Self {
        let change = hart.change_record();
        let (insn, op) = hart.last_instruction();
        TraceRecord {
            tag: hart.trace_tag(),
            pc: hart.current_pc(),
            insn,
            mnemonic: op.map(|o| o.mnemonic()).unwrap_or("?"),
            int_reg: change.int_reg,
            fp_reg: change.fp_reg,
            csrs: change.csrs.clone(),
            mem: change.mem.clone(),
            trap: change.has_trap.then_some(change.trap_cause),
            abi_names: hart.abi_names(),
        }
    }

    fn reg_name(&self, ix: u8) -> String {
        if self.abi_names {
            ABI_NAMES[ix as usize & 31].to_string()
        } else {
            format!("x{ix}")
        }
    }
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {:#010x} {:#010x} {}",
            self.tag, self.pc, self.insn, self.mnemonic
        )?;
        if let Some((ix, value)) = self.int_reg {
            write!(f, " {}={:#x}", self.reg_name(ix), value)?;
        }
        if let Some((ix, value)) = self.fp_reg {
            write!(f, " f{ix}={value:#x}")?;
        }
        for (number, value) in &self.csrs {
            write!(f, " c{number:#05x}={value:#x}")?;
        }
        for (addr, size, value) in &self.mem {
            write!(f, " [{addr:#x}]{size}={value:#x}")?;
        }
        if let Some(cause) = self.trap {
            write!(f, " trap={cause}")?;
        }
        Ok(())
    }
}

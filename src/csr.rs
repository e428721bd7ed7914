//! Control and status registers.
//!
//! Each implemented CSR carries its reset value, a write mask (bits writable
//! by CSR instructions), a poke mask (bits writable through the debug
//! interface), and its access constraints. Privilege and read-only rules
//! derive from the CSR address per the privileged spec: bits \[9:8\] encode
//! the minimum privilege, bits \[11:10\] == 0b11 marks read-only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::triggers::Triggers;
use crate::{Mode, Trap, Xlen};

pub type CsrNumber = u16;

// Unprivileged floating-point CSRs.
pub const CSR_FFLAGS: CsrNumber = 0x001;
pub const CSR_FRM: CsrNumber = 0x002;
pub const CSR_FCSR: CsrNumber = 0x003;

// Unprivileged counters.
pub const CSR_CYCLE: CsrNumber = 0xC00;
pub const CSR_TIME: CsrNumber = 0xC01;
pub const CSR_INSTRET: CsrNumber = 0xC02;
pub const CSR_HPMCOUNTER3: CsrNumber = 0xC03;
pub const CSR_HPMCOUNTER31: CsrNumber = 0xC1F;
pub const CSR_CYCLEH: CsrNumber = 0xC80;
pub const CSR_TIMEH: CsrNumber = 0xC81;
pub const CSR_INSTRETH: CsrNumber = 0xC82;
pub const CSR_HPMCOUNTER3H: CsrNumber = 0xC83;
pub const CSR_HPMCOUNTER31H: CsrNumber = 0xC9F;

// User trap CSRs (N extension).
pub const CSR_USTATUS: CsrNumber = 0x000;
pub const CSR_UIE: CsrNumber = 0x004;
pub const CSR_UTVEC: CsrNumber = 0x005;
pub const CSR_USCRATCH: CsrNumber = 0x040;
pub const CSR_UEPC: CsrNumber = 0x041;
pub const CSR_UCAUSE: CsrNumber = 0x042;
pub const CSR_UTVAL: CsrNumber = 0x043;
pub const CSR_UIP: CsrNumber = 0x044;

// Supervisor CSRs.
pub const CSR_SSTATUS: CsrNumber = 0x100;
pub const CSR_SIE: CsrNumber = 0x104;
pub const CSR_STVEC: CsrNumber = 0x105;
pub const CSR_SCOUNTEREN: CsrNumber = 0x106;
pub const CSR_SSCRATCH: CsrNumber = 0x140;
pub const CSR_SEPC: CsrNumber = 0x141;
pub const CSR_SCAUSE: CsrNumber = 0x142;
pub const CSR_STVAL: CsrNumber = 0x143;
pub const CSR_SIP: CsrNumber = 0x144;
pub const CSR_SATP: CsrNumber = 0x180;
pub const CSR_SEDELEG: CsrNumber = 0x102;
pub const CSR_SIDELEG: CsrNumber = 0x103;

// Machine trap setup / handling.
pub const CSR_MSTATUS: CsrNumber = 0x300;
pub const CSR_MISA: CsrNumber = 0x301;
pub const CSR_MEDELEG: CsrNumber = 0x302;
pub const CSR_MIDELEG: CsrNumber = 0x303;
pub const CSR_MIE: CsrNumber = 0x304;
pub const CSR_MTVEC: CsrNumber = 0x305;
pub const CSR_MCOUNTEREN: CsrNumber = 0x306;
pub const CSR_MCOUNTINHIBIT: CsrNumber = 0x320;
pub const CSR_MHPMEVENT3: CsrNumber = 0x323;
pub const CSR_MHPMEVENT31: CsrNumber = 0x33F;
pub const CSR_MSCRATCH: CsrNumber = 0x340;
pub const CSR_MEPC: CsrNumber = 0x341;
pub const CSR_MCAUSE: CsrNumber = 0x342;
pub const CSR_MTVAL: CsrNumber = 0x343;
pub const CSR_MIP: CsrNumber = 0x344;

// PMP.
pub const CSR_PMPCFG0: CsrNumber = 0x3A0;
pub const CSR_PMPCFG1: CsrNumber = 0x3A1;
pub const CSR_PMPCFG2: CsrNumber = 0x3A2;
pub const CSR_PMPCFG3: CsrNumber = 0x3A3;
pub const CSR_PMPADDR0: CsrNumber = 0x3B0;
pub const CSR_PMPADDR15: CsrNumber = 0x3BF;

// Machine counters.
pub const CSR_MCYCLE: CsrNumber = 0xB00;
pub const CSR_MINSTRET: CsrNumber = 0xB02;
pub const CSR_MHPMCOUNTER3: CsrNumber = 0xB03;
pub const CSR_MHPMCOUNTER31: CsrNumber = 0xB1F;
pub const CSR_MCYCLEH: CsrNumber = 0xB80;
pub const CSR_MINSTRETH: CsrNumber = 0xB82;
pub const CSR_MHPMCOUNTER3H: CsrNumber = 0xB83;
pub const CSR_MHPMCOUNTER31H: CsrNumber = 0xB9F;

// Machine information (read-only).
pub const CSR_MVENDORID: CsrNumber = 0xF11;
pub const CSR_MARCHID: CsrNumber = 0xF12;
pub const CSR_MIMPID: CsrNumber = 0xF13;
pub const CSR_MHARTID: CsrNumber = 0xF14;

// Debug / triggers.
pub const CSR_TSELECT: CsrNumber = 0x7A0;
pub const CSR_TDATA1: CsrNumber = 0x7A1;
pub const CSR_TDATA2: CsrNumber = 0x7A2;
pub const CSR_TDATA3: CsrNumber = 0x7A3;
pub const CSR_DCSR: CsrNumber = 0x7B0;
pub const CSR_DPC: CsrNumber = 0x7B1;
pub const CSR_DSCRATCH: CsrNumber = 0x7B2;

// Vendor CSRs.
/// Bit-per-hart start gate, shared among the harts of a system.
pub const CSR_MHARTSTART: CsrNumber = 0x7FC;
/// Secondary cause of the most recent trap.
pub const CSR_MSCAUSE: CsrNumber = 0x7FF;
/// Captured address of an imprecise data error; locked until cleared.
pub const CSR_MDSEAC: CsrNumber = 0xFC0;
/// Writing unlocks mdseac.
pub const CSR_MDEAU: CsrNumber = 0xBC0;

const PMPADDR_NAMES: [&str; 16] = [
    "pmpaddr0",
    "pmpaddr1",
    "pmpaddr2",
    "pmpaddr3",
    "pmpaddr4",
    "pmpaddr5",
    "pmpaddr6",
    "pmpaddr7",
    "pmpaddr8",
    "pmpaddr9",
    "pmpaddr10",
    "pmpaddr11",
    "pmpaddr12",
    "pmpaddr13",
    "pmpaddr14",
    "pmpaddr15",
];

const MHPMCOUNTER_NAMES: [&str; 29] = [
    "mhpmcounter3",
    "mhpmcounter4",
    "mhpmcounter5",
    "mhpmcounter6",
    "mhpmcounter7",
    "mhpmcounter8",
    "mhpmcounter9",
    "mhpmcounter10",
    "mhpmcounter11",
    "mhpmcounter12",
    "mhpmcounter13",
    "mhpmcounter14",
    "mhpmcounter15",
    "mhpmcounter16",
    "mhpmcounter17",
    "mhpmcounter18",
    "mhpmcounter19",
    "mhpmcounter20",
    "mhpmcounter21",
    "mhpmcounter22",
    "mhpmcounter23",
    "mhpmcounter24",
    "mhpmcounter25",
    "mhpmcounter26",
    "mhpmcounter27",
    "mhpmcounter28",
    "mhpmcounter29",
    "mhpmcounter30",
    "mhpmcounter31",
];

const MHPMEVENT_NAMES: [&str; 29] = [
    "mhpmevent3",
    "mhpmevent4",
    "mhpmevent5",
    "mhpmevent6",
    "mhpmevent7",
    "mhpmevent8",
    "mhpmevent9",
    "mhpmevent10",
    "mhpmevent11",
    "mhpmevent12",
    "mhpmevent13",
    "mhpmevent14",
    "mhpmevent15",
    "mhpmevent16",
    "mhpmevent17",
    "mhpmevent18",
    "mhpmevent19",
    "mhpmevent20",
    "mhpmevent21",
    "mhpmevent22",
    "mhpmevent23",
    "mhpmevent24",
    "mhpmevent25",
    "mhpmevent26",
    "mhpmevent27",
    "mhpmevent28",
    "mhpmevent29",
    "mhpmevent30",
    "mhpmevent31",
];

/// sstatus view of mstatus: SIE, SPIE, SPP, FS, SUM, MXR.
const SSTATUS_MASK: u64 = (1 << 1) | (1 << 5) | (1 << 8) | (3 << 13) | (1 << 18) | (1 << 19);
/// ustatus view of mstatus: UIE, UPIE.
const USTATUS_MASK: u64 = (1 << 0) | (1 << 4);
/// User interrupt bits: USIP, UTIP, UEIP.
const U_INTERRUPT_MASK: u64 = (1 << 0) | (1 << 4) | (1 << 8);
/// Supervisor interrupt bits: SSIP, STIP, SEIP.
const S_INTERRUPT_MASK: u64 = (1 << 1) | (1 << 5) | (1 << 9);

#[derive(Debug, Clone)]
struct Csr {
    name: &'static str,
    value: u64,
    reset: u64,
    write_mask: u64,
    poke_mask: u64,
    shared: bool,
}

/// Pool backing CSRs declared shared, aliased between harts that are tied
/// together.
pub type SharedCsrPool = Arc<Mutex<HashMap<CsrNumber, u64>>>;

pub struct CsrFile {
    regs: Vec<Option<Csr>>,
    xlen: Xlen,
    pub triggers: Triggers,
    shared_pool: Option<SharedCsrPool>,
    /// While set, writes to mdseac are dropped (cleared by an mdeau write).
    mdseac_locked: bool,
}

impl CsrFile {
    pub fn new(xlen: Xlen) -> Self {
        let mut file = CsrFile {
            regs: vec![None; 4096],
            xlen,
            triggers: Triggers::new(),
            shared_pool: None,
            mdseac_locked: false,
        };
        file.define_all();
        file
    }

    fn full(&self) -> u64 {
        match self.xlen {
            Xlen::Rv32 => 0xFFFF_FFFF,
            Xlen::Rv64 => u64::MAX,
        }
    }

    fn define(&mut self, number: CsrNumber, name: &'static str, reset: u64, write_mask: u64) {
        self.define_full(number, name, reset, write_mask, write_mask | reset, false);
    }

    fn define_full(
        &mut self,
        number: CsrNumber,
        name: &'static str,
        reset: u64,
        write_mask: u64,
        poke_mask: u64,
        shared: bool,
    ) {
        self.regs[number as usize] = Some(Csr {
            name,
            value: reset,
            reset,
            write_mask,
            poke_mask: poke_mask | write_mask,
            shared,
        });
    }

    fn define_all(&mut self) {
        let full = self.full();
        let pc_mask = full & !1;

        // Floating point.
        self.define(CSR_FFLAGS, "fflags", 0, 0x1F);
        self.define(CSR_FRM, "frm", 0, 0x7);
        self.define(CSR_FCSR, "fcsr", 0, 0xFF);

        // Machine trap setup. mstatus reset leaves MPP at machine.
        let mstatus_mask = (1 << 1)
            | (1 << 3)
            | (1 << 5)
            | (1 << 7)
            | (1 << 8)
            | (3 << 11)
            | (3 << 13)
            | (1 << 17)
            | (1 << 18)
            | (1 << 19)
            | (1 << 20)
            | (1 << 21)
            | (1 << 22);
        self.define_full(CSR_MSTATUS, "mstatus", 0x1800, mstatus_mask, full, false);
        self.define(CSR_MISA, "misa", 0, 0);
        self.define(CSR_MEDELEG, "medeleg", 0, 0xF7FF);
        self.define(CSR_MIDELEG, "mideleg", 0, S_INTERRUPT_MASK);
        self.define(CSR_MIE, "mie", 0, 0xBBB);
        self.define(CSR_MTVEC, "mtvec", 0, full & !0b10);
        self.define(CSR_MCOUNTEREN, "mcounteren", 0, 0xFFFF_FFFF);
        self.define(CSR_MCOUNTINHIBIT, "mcountinhibit", 0, 0xFFFF_FFFD);
        self.define(CSR_MSCRATCH, "mscratch", 0, full);
        self.define(CSR_MEPC, "mepc", 0, pc_mask);
        self.define(CSR_MCAUSE, "mcause", 0, full);
        self.define(CSR_MTVAL, "mtval", 0, full);
        // CSR instructions reach only the supervisor software bits of mip;
        // the other bits move through the poke/interrupt paths.
        self.define_full(CSR_MIP, "mip", 0, S_INTERRUPT_MASK, 0xFFF, false);

        // User trap registers (N extension). ustatus/uie/uip are views.
        self.define(CSR_USTATUS, "ustatus", 0, USTATUS_MASK);
        self.define(CSR_UIE, "uie", 0, U_INTERRUPT_MASK);
        self.define(CSR_UTVEC, "utvec", 0, full & !0b10);
        self.define(CSR_USCRATCH, "uscratch", 0, full);
        self.define(CSR_UEPC, "uepc", 0, pc_mask);
        self.define(CSR_UCAUSE, "ucause", 0, full);
        self.define(CSR_UTVAL, "utval", 0, full);
        self.define(CSR_UIP, "uip", 0, 1 << 0);

        // Supervisor. sstatus/sie/sip are views, storage lives in the m regs.
        self.define(CSR_SSTATUS, "sstatus", 0, SSTATUS_MASK);
        self.define(CSR_SEDELEG, "sedeleg", 0, 0x1FF);
        self.define(CSR_SIDELEG, "sideleg", 0, S_INTERRUPT_MASK);
        self.define(CSR_SIE, "sie", 0, S_INTERRUPT_MASK);
        self.define(CSR_STVEC, "stvec", 0, full & !0b10);
        self.define(CSR_SCOUNTEREN, "scounteren", 0, 0xFFFF_FFFF);
        self.define(CSR_SSCRATCH, "sscratch", 0, full);
        self.define(CSR_SEPC, "sepc", 0, pc_mask);
        self.define(CSR_SCAUSE, "scause", 0, full);
        self.define(CSR_STVAL, "stval", 0, full);
        self.define(CSR_SIP, "sip", 0, 1 << 1);
        self.define(CSR_SATP, "satp", 0, full);

        // PMP: four config registers on RV32, the even pair on RV64.
        match self.xlen {
            Xlen::Rv32 => {
                self.define(CSR_PMPCFG0, "pmpcfg0", 0, 0xFFFF_FFFF);
                self.define(CSR_PMPCFG1, "pmpcfg1", 0, 0xFFFF_FFFF);
                self.define(CSR_PMPCFG2, "pmpcfg2", 0, 0xFFFF_FFFF);
                self.define(CSR_PMPCFG3, "pmpcfg3", 0, 0xFFFF_FFFF);
            }
            Xlen::Rv64 => {
                self.define(CSR_PMPCFG0, "pmpcfg0", 0, u64::MAX);
                self.define(CSR_PMPCFG2, "pmpcfg2", 0, u64::MAX);
            }
        }
        let addr_mask = match self.xlen {
            Xlen::Rv32 => 0xFFFF_FFFF,
            Xlen::Rv64 => (1u64 << 54) - 1,
        };
        for i in 0..16u16 {
            self.define(CSR_PMPADDR0 + i, PMPADDR_NAMES[i as usize], 0, addr_mask);
        }

        // Counters. Storage is the full 64-bit count; the RV32 *h registers
        // view the upper half.
        self.define(CSR_MCYCLE, "mcycle", 0, full);
        self.define(CSR_MINSTRET, "minstret", 0, full);
        for i in 3..=31u16 {
            self.define(
                CSR_MHPMCOUNTER3 + (i - 3),
                MHPMCOUNTER_NAMES[(i - 3) as usize],
                0,
                full,
            );
            self.define(
                CSR_MHPMEVENT3 + (i - 3),
                MHPMEVENT_NAMES[(i - 3) as usize],
                0,
                full,
            );
        }
        if self.xlen == Xlen::Rv32 {
            self.define(CSR_MCYCLEH, "mcycleh", 0, 0xFFFF_FFFF);
            self.define(CSR_MINSTRETH, "minstreth", 0, 0xFFFF_FFFF);
            for i in 3..=31u16 {
                self.define(
                    CSR_MHPMCOUNTER3H + (i - 3),
                    MHPMCOUNTER_NAMES[(i - 3) as usize],
                    0,
                    0xFFFF_FFFF,
                );
            }
        }
        // Read-only user shadows of the machine counters. time has real
        // storage refreshed from the CLINT through the poke interface.
        self.define(CSR_CYCLE, "cycle", 0, 0);
        self.define_full(CSR_TIME, "time", 0, 0, u64::MAX, false);
        self.define(CSR_INSTRET, "instret", 0, 0);
        for i in 3..=31u16 {
            self.define(
                CSR_HPMCOUNTER3 + (i - 3),
                MHPMCOUNTER_NAMES[(i - 3) as usize],
                0,
                0,
            );
        }
        if self.xlen == Xlen::Rv32 {
            self.define(CSR_CYCLEH, "cycleh", 0, 0);
            self.define(CSR_TIMEH, "timeh", 0, 0);
            self.define(CSR_INSTRETH, "instreth", 0, 0);
        }

        // Machine information: read-only to software, poke-writable so the
        // hart can install its identity at construction.
        self.define_full(CSR_MVENDORID, "mvendorid", 0, 0, u64::MAX, false);
        self.define_full(CSR_MARCHID, "marchid", 0, 0, u64::MAX, false);
        self.define_full(CSR_MIMPID, "mimpid", 0, 0, u64::MAX, false);
        self.define_full(CSR_MHARTID, "mhartid", 0, 0, u64::MAX, false);

        // Debug / triggers. Trigger data words live in the trigger module;
        // these entries exist for the access checks.
        self.define(CSR_TSELECT, "tselect", 0, full);
        self.define(CSR_TDATA1, "tdata1", 0, full);
        self.define(CSR_TDATA2, "tdata2", 0, full);
        self.define(CSR_TDATA3, "tdata3", 0, full);
        let dcsr_mask = (1 << 15) | (1 << 13) | (1 << 12) | (1 << 2) | 0b11;
        self.define_full(CSR_DCSR, "dcsr", 0x4000_0003, dcsr_mask, 0xFFFF_FFFF, false);
        self.define(CSR_DPC, "dpc", 0, pc_mask);
        self.define(CSR_DSCRATCH, "dscratch", 0, full);

        // Vendor registers.
        self.define_full(CSR_MHARTSTART, "mhartstart", 1, full, full, true);
        self.define(CSR_MSCAUSE, "mscause", 0, full);
        self.define_full(CSR_MDSEAC, "mdseac", 0, 0, full, false);
        self.define(CSR_MDEAU, "mdeau", 0, full);
    }

    /// Attach the shared pool backing CSRs declared shared, aliasing them
    /// with every other hart attached to the same pool.
    pub fn tie_shared(&mut self, pool: SharedCsrPool) {
        {
            let mut map = pool.lock().unwrap();
            for (num, csr) in self.regs.iter().enumerate() {
                if let Some(csr) = csr {
                    if csr.shared {
                        map.entry(num as CsrNumber).or_insert(csr.reset);
                    }
                }
            }
        }
        self.shared_pool = Some(pool);
    }

    pub fn name(&self, number: CsrNumber) -> Option<&'static str> {
        self.regs[number as usize].as_ref().map(|c| c.name)
    }

    pub fn is_implemented(&self, number: CsrNumber) -> bool {
        self.regs[number as usize].is_some()
    }

    fn required_privilege(number: CsrNumber) -> u16 {
        (number >> 8) & 0x3
    }

    fn is_read_only(number: CsrNumber) -> bool {
        (number >> 10) & 0x3 == 0x3
    }

    fn check_access(&self, number: CsrNumber, mode: Mode) -> Result<(), Trap> {
        if !self.is_implemented(number) {
            return Err(Trap::IllegalInstruction(0));
        }
        if mode.privilege_level() < Self::required_privilege(number) {
            return Err(Trap::IllegalInstruction(0));
        }
        Ok(())
    }

    fn raw(&self, number: CsrNumber) -> u64 {
        let csr = self.regs[number as usize].as_ref().unwrap();
        if csr.shared {
            if let Some(pool) = &self.shared_pool {
                if let Some(v) = pool.lock().unwrap().get(&number) {
                    return *v;
                }
            }
        }
        csr.value
    }

    fn set_raw(&mut self, number: CsrNumber, value: u64) {
        let shared = self.regs[number as usize].as_ref().unwrap().shared;
        if shared {
            if let Some(pool) = &self.shared_pool {
                pool.lock().unwrap().insert(number, value);
                return;
            }
        }
        self.regs[number as usize].as_mut().unwrap().value = value;
    }

    /// Counter-enable gate for the user shadows (cycle/time/instret/hpm).
    fn counter_allowed(&self, number: CsrNumber, mode: Mode) -> bool {
        let bit = match number {
            CSR_CYCLE | CSR_CYCLEH => 0,
            CSR_TIME | CSR_TIMEH => 1,
            CSR_INSTRET | CSR_INSTRETH => 2,
            CSR_HPMCOUNTER3..=CSR_HPMCOUNTER31 => (number - CSR_HPMCOUNTER3 + 3) as u32,
            CSR_HPMCOUNTER3H..=CSR_HPMCOUNTER31H => (number - CSR_HPMCOUNTER3H + 3) as u32,
            _ => return true,
        };
        if mode == Mode::Machine {
            return true;
        }
        if self.raw(CSR_MCOUNTEREN) >> bit & 1 == 0 {
            return false;
        }
        if mode == Mode::User && self.is_implemented(CSR_SCOUNTEREN) {
            return self.raw(CSR_SCOUNTEREN) >> bit & 1 == 1;
        }
        true
    }

    /// CSR-instruction read.
    pub fn read(&self, number: CsrNumber, mode: Mode) -> Result<u64, Trap> {
        self.check_access(number, mode)?;
        if !self.counter_allowed(number, mode) {
            return Err(Trap::IllegalInstruction(0));
        }
        Ok(self.read_unchecked(number))
    }

    fn read_unchecked(&self, number: CsrNumber) -> u64 {
        let value = match number {
            CSR_SSTATUS => self.raw(CSR_MSTATUS) & SSTATUS_MASK,
            CSR_SIE => self.raw(CSR_MIE) & S_INTERRUPT_MASK,
            CSR_SIP => self.raw(CSR_MIP) & S_INTERRUPT_MASK,
            CSR_USTATUS => self.raw(CSR_MSTATUS) & USTATUS_MASK,
            CSR_UIE => self.raw(CSR_MIE) & U_INTERRUPT_MASK,
            CSR_UIP => self.raw(CSR_MIP) & U_INTERRUPT_MASK,
            CSR_FFLAGS => self.raw(CSR_FCSR) & 0x1F,
            CSR_FRM => (self.raw(CSR_FCSR) >> 5) & 0x7,
            CSR_CYCLE => self.raw(CSR_MCYCLE),
            CSR_INSTRET => self.raw(CSR_MINSTRET),
            CSR_HPMCOUNTER3..=CSR_HPMCOUNTER31 => {
                self.raw(CSR_MHPMCOUNTER3 + (number - CSR_HPMCOUNTER3))
            }
            CSR_CYCLEH => self.raw(CSR_MCYCLE) >> 32,
            CSR_TIMEH => self.raw(CSR_TIME) >> 32,
            CSR_INSTRETH => self.raw(CSR_MINSTRET) >> 32,
            CSR_HPMCOUNTER3H..=CSR_HPMCOUNTER31H => {
                self.raw(CSR_MHPMCOUNTER3 + (number - CSR_HPMCOUNTER3H)) >> 32
            }
            CSR_MCYCLEH => self.raw(CSR_MCYCLE) >> 32,
            CSR_MINSTRETH => self.raw(CSR_MINSTRET) >> 32,
            CSR_MHPMCOUNTER3H..=CSR_MHPMCOUNTER31H => {
                self.raw(CSR_MHPMCOUNTER3 + (number - CSR_MHPMCOUNTER3H)) >> 32
            }
            CSR_TSELECT => self.triggers.tselect(),
            CSR_TDATA1 => self.triggers.data1(),
            CSR_TDATA2 => self.triggers.data2(),
            CSR_TDATA3 => self.triggers.data3(),
            _ => self.raw(number),
        };
        self.xlen.csr_view(value)
    }

    /// CSR-instruction write. Bits outside the write mask are dropped
    /// silently; read-only and under-privileged writes raise.
    pub fn write(&mut self, number: CsrNumber, value: u64, mode: Mode) -> Result<(), Trap> {
        self.check_access(number, mode)?;
        if Self::is_read_only(number) {
            return Err(Trap::IllegalInstruction(0));
        }
        match number {
            CSR_SSTATUS => {
                let old = self.raw(CSR_MSTATUS);
                self.set_raw(CSR_MSTATUS, (old & !SSTATUS_MASK) | (value & SSTATUS_MASK));
            }
            CSR_SIE => {
                let old = self.raw(CSR_MIE);
                self.set_raw(
                    CSR_MIE,
                    (old & !S_INTERRUPT_MASK) | (value & S_INTERRUPT_MASK),
                );
            }
            CSR_SIP => {
                // Only SSIP is software-writable from supervisor level.
                let old = self.raw(CSR_MIP);
                self.set_raw(CSR_MIP, (old & !(1 << 1)) | (value & (1 << 1)));
            }
            CSR_USTATUS => {
                let old = self.raw(CSR_MSTATUS);
                self.set_raw(CSR_MSTATUS, (old & !USTATUS_MASK) | (value & USTATUS_MASK));
            }
            CSR_UIE => {
                let old = self.raw(CSR_MIE);
                self.set_raw(
                    CSR_MIE,
                    (old & !U_INTERRUPT_MASK) | (value & U_INTERRUPT_MASK),
                );
            }
            CSR_UIP => {
                let old = self.raw(CSR_MIP);
                self.set_raw(CSR_MIP, (old & !(1 << 0)) | (value & (1 << 0)));
            }
            CSR_FFLAGS => {
                let old = self.raw(CSR_FCSR);
                self.set_raw(CSR_FCSR, (old & !0x1F) | (value & 0x1F));
            }
            CSR_FRM => {
                let old = self.raw(CSR_FCSR);
                self.set_raw(CSR_FCSR, (old & !0xE0) | ((value & 0x7) << 5));
            }
            CSR_TSELECT => self.triggers.set_tselect(value),
            CSR_TDATA1 => self.triggers.set_data1(value, self.xlen),
            CSR_TDATA2 => self.triggers.set_data2(value),
            CSR_TDATA3 => self.triggers.set_data3(value),
            CSR_MCYCLEH => {
                let old = self.raw(CSR_MCYCLE);
                self.set_raw(CSR_MCYCLE, (old & 0xFFFF_FFFF) | (value << 32));
            }
            CSR_MINSTRETH => {
                let old = self.raw(CSR_MINSTRET);
                self.set_raw(CSR_MINSTRET, (old & 0xFFFF_FFFF) | (value << 32));
            }
            CSR_MHPMCOUNTER3H..=CSR_MHPMCOUNTER31H if self.xlen == Xlen::Rv32 => {
                let base = CSR_MHPMCOUNTER3 + (number - CSR_MHPMCOUNTER3H);
                let old = self.raw(base);
                self.set_raw(base, (old & 0xFFFF_FFFF) | (value << 32));
            }
            CSR_MDEAU => {
                // Writing mdeau unlocks mdseac for the next capture.
                self.mdseac_locked = false;
            }
            _ => {
                let mask = self.regs[number as usize].as_ref().unwrap().write_mask;
                let old = self.raw(number);
                self.set_raw(number, (old & !mask) | (value & mask));
            }
        }
        Ok(())
    }

    /// Debug-interface read: no privilege or counter-enable checks.
    pub fn peek(&self, number: CsrNumber) -> Option<u64> {
        if !self.is_implemented(number) {
            return None;
        }
        Some(self.read_unchecked(number))
    }

    /// Debug-interface write through the poke mask. Routes the same views as
    /// [`CsrFile::write`], bypassing privilege and read-only rules.
    pub fn poke(&mut self, number: CsrNumber, value: u64) -> bool {
        if !self.is_implemented(number) {
            return false;
        }
        match number {
            CSR_SSTATUS | CSR_SIE | CSR_SIP | CSR_FFLAGS | CSR_FRM | CSR_TSELECT | CSR_TDATA1
            | CSR_TDATA2 | CSR_TDATA3 | CSR_MCYCLEH | CSR_MINSTRETH => {
                // Views share the masked-write routing.
                let _ = self.write(number, value, Mode::Machine);
            }
            CSR_MDSEAC => {
                if !self.mdseac_locked {
                    self.set_raw(CSR_MDSEAC, value);
                    self.mdseac_locked = true;
                }
            }
            _ => {
                let mask = self.regs[number as usize].as_ref().unwrap().poke_mask;
                let old = self.raw(number);
                self.set_raw(number, (old & !mask) | (value & mask));
            }
        }
        true
    }

    /// Overwrite a CSR ignoring every mask: used for trap delivery and for
    /// configuration-time values (misa, mhartid).
    pub fn write_raw(&mut self, number: CsrNumber, value: u64) {
        if self.is_implemented(number) {
            self.set_raw(number, value);
        }
    }

    /// Set or clear a bit of mip from hardware (CLINT mailboxes, alarm).
    pub fn set_mip_bit(&mut self, bit: u32, pending: bool) {
        let old = self.raw(CSR_MIP);
        let new = if pending {
            old | (1 << bit)
        } else {
            old & !(1 << bit)
        };
        if new != old {
            self.set_raw(CSR_MIP, new);
        }
    }

    /// Capture an imprecise data-error address. Returns false if a previous
    /// capture is still locked.
    pub fn capture_mdseac(&mut self, addr: u64) -> bool {
        if self.mdseac_locked {
            return false;
        }
        self.set_raw(CSR_MDSEAC, addr);
        self.mdseac_locked = true;
        true
    }

    /// Advance the performance counters after one retired instruction,
    /// honoring mcountinhibit and the mhpmevent selectors (event 1 counts
    /// retired instructions, event 2 counts cycles).
    pub fn advance_counters(&mut self) {
        let inhibit = self.raw(CSR_MCOUNTINHIBIT);
        if inhibit & 1 == 0 {
            let v = self.raw(CSR_MCYCLE).wrapping_add(1);
            self.set_raw(CSR_MCYCLE, v);
        }
        if inhibit >> 2 & 1 == 0 {
            let v = self.raw(CSR_MINSTRET).wrapping_add(1);
            self.set_raw(CSR_MINSTRET, v);
        }
        for i in 3..=31u16 {
            if inhibit >> i & 1 != 0 {
                continue;
            }
            let event = self.raw(CSR_MHPMEVENT3 + (i - 3));
            if event == 1 || event == 2 {
                let num = CSR_MHPMCOUNTER3 + (i - 3);
                let v = self.raw(num).wrapping_add(1);
                self.set_raw(num, v);
            }
        }
    }

    /// Gather the PMP configuration images for the protection manager.
    pub fn pmp_images(&self) -> ([u8; 16], [u64; 16]) {
        let mut cfg = [0u8; 16];
        match self.xlen {
            Xlen::Rv32 => {
                for reg in 0..4u16 {
                    let v = self.raw(CSR_PMPCFG0 + reg);
                    for b in 0..4 {
                        cfg[(reg * 4 + b) as usize] = (v >> (8 * b)) as u8;
                    }
                }
            }
            Xlen::Rv64 => {
                for (slot, reg) in [CSR_PMPCFG0, CSR_PMPCFG2].iter().enumerate() {
                    let v = self.raw(*reg);
                    for b in 0..8 {
                        cfg[slot * 8 + b] = (v >> (8 * b)) as u8;
                    }
                }
            }
        }
        let mut addrs = [0u64; 16];
        for (i, slot) in addrs.iter_mut().enumerate() {
            *slot = self.raw(CSR_PMPADDR0 + i as u16);
        }
        (cfg, addrs)
    }

    /// Reset every implemented CSR to its reset value.
    pub fn reset(&mut self) {
        for csr in self.regs.iter_mut().flatten() {
            csr.value = csr.reset;
        }
        if let Some(pool) = &self.shared_pool {
            let mut map = pool.lock().unwrap();
            for (num, csr) in self.regs.iter().enumerate() {
                if let Some(csr) = csr {
                    if csr.shared {
                        map.insert(num as CsrNumber, csr.reset);
                    }
                }
            }
        }
        self.mdseac_locked = false;
        self.triggers = Triggers::new();
    }

    /// Implemented CSRs and their current values; used by snapshots.
    pub fn export(&self) -> HashMap<CsrNumber, u64> {
        let mut map = HashMap::new();
        for (num, csr) in self.regs.iter().enumerate() {
            if csr.is_some() {
                let num = num as CsrNumber;
                map.insert(num, self.read_unchecked(num));
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> CsrFile {
        CsrFile::new(Xlen::Rv64)
    }

    #[test]
    fn privilege_gates_access() {
        let csrs = file();
        assert!(csrs.read(CSR_MSTATUS, Mode::Machine).is_ok());
        assert!(csrs.read(CSR_MSTATUS, Mode::Supervisor).is_err());
        assert!(csrs.read(CSR_SSCRATCH, Mode::Supervisor).is_ok());
        assert!(csrs.read(CSR_SSCRATCH, Mode::User).is_err());
    }

    #[test]
    fn read_only_rejects_writes_but_allows_poke() {
        let mut csrs = file();
        assert!(csrs.write(CSR_MHARTID, 5, Mode::Machine).is_err());
        assert!(csrs.poke(CSR_MHARTID, 5));
        assert_eq!(csrs.peek(CSR_MHARTID), Some(5));
    }

    #[test]
    fn write_mask_drops_bits_silently() {
        let mut csrs = file();
        // mepc bit 0 is not writable.
        csrs.write(CSR_MEPC, 0x1001, Mode::Machine).unwrap();
        assert_eq!(csrs.peek(CSR_MEPC), Some(0x1000));
        // mtvec bit 1 is reserved.
        csrs.write(CSR_MTVEC, 0x8000_0003, Mode::Machine).unwrap();
        assert_eq!(csrs.peek(CSR_MTVEC), Some(0x8000_0001));
    }

    #[test]
    fn unimplemented_csr_is_illegal() {
        let mut csrs = file();
        assert!(csrs.read(0x5C0, Mode::Machine).is_err());
        assert!(csrs.write(0x5C0, 1, Mode::Machine).is_err());
        assert_eq!(csrs.peek(0x5C0), None);
    }

    #[test]
    fn sstatus_is_masked_view_of_mstatus() {
        let mut csrs = file();
        csrs.write(CSR_MSTATUS, (1 << 1) | (1 << 3) | (1 << 18), Mode::Machine)
            .unwrap();
        let sstatus = csrs.read(CSR_SSTATUS, Mode::Supervisor).unwrap();
        assert_eq!(sstatus, (1 << 1) | (1 << 18)); // MIE hidden
        csrs.write(CSR_SSTATUS, 0, Mode::Supervisor).unwrap();
        // MIE survives an sstatus write.
        assert_ne!(csrs.peek(CSR_MSTATUS).unwrap() & (1 << 3), 0);
        assert_eq!(csrs.peek(CSR_MSTATUS).unwrap() & (1 << 1), 0);
    }

    #[test]
    fn fflags_and_frm_are_fcsr_fields() {
        let mut csrs = file();
        csrs.write(CSR_FCSR, 0b101_11011, Mode::Machine).unwrap();
        assert_eq!(csrs.read(CSR_FFLAGS, Mode::User).unwrap(), 0b11011);
        assert_eq!(csrs.read(CSR_FRM, Mode::User).unwrap(), 0b101);
        csrs.write(CSR_FRM, 0b010, Mode::User).unwrap();
        assert_eq!(csrs.read(CSR_FCSR, Mode::User).unwrap(), 0b010_11011);
    }

    #[test]
    fn counter_enable_gates_user_reads() {
        let mut csrs = file();
        csrs.write_raw(CSR_MCYCLE, 1234);
        assert!(csrs.read(CSR_CYCLE, Mode::User).is_err());
        csrs.write(CSR_MCOUNTEREN, 1, Mode::Machine).unwrap();
        csrs.write(CSR_SCOUNTEREN, 1, Mode::Supervisor).unwrap();
        assert_eq!(csrs.read(CSR_CYCLE, Mode::User).unwrap(), 1234);
    }

    #[test]
    fn advance_counters_honors_inhibit() {
        let mut csrs = file();
        csrs.advance_counters();
        assert_eq!(csrs.peek(CSR_MCYCLE), Some(1));
        assert_eq!(csrs.peek(CSR_MINSTRET), Some(1));
        csrs.write(CSR_MCOUNTINHIBIT, 0b101, Mode::Machine).unwrap();
        csrs.advance_counters();
        assert_eq!(csrs.peek(CSR_MCYCLE), Some(1));
        assert_eq!(csrs.peek(CSR_MINSTRET), Some(1));
    }

    #[test]
    fn hpm_counter_counts_selected_event() {
        let mut csrs = file();
        csrs.write(CSR_MHPMEVENT3, 1, Mode::Machine).unwrap();
        csrs.advance_counters();
        csrs.advance_counters();
        assert_eq!(csrs.peek(CSR_MHPMCOUNTER3), Some(2));
        // Unselected counter stays at zero.
        assert_eq!(csrs.peek(CSR_MHPMCOUNTER3 + 1), Some(0));
    }

    #[test]
    fn mdseac_locks_until_mdeau_write() {
        let mut csrs = file();
        assert!(csrs.capture_mdseac(0x1000));
        assert!(!csrs.capture_mdseac(0x2000));
        assert_eq!(csrs.peek(CSR_MDSEAC), Some(0x1000));
        csrs.write(CSR_MDEAU, 0, Mode::Machine).unwrap();
        assert!(csrs.capture_mdseac(0x2000));
        assert_eq!(csrs.peek(CSR_MDSEAC), Some(0x2000));
    }

    #[test]
    fn shared_csr_aliases_through_pool() {
        let pool: SharedCsrPool = Arc::new(Mutex::new(HashMap::new()));
        let mut a = CsrFile::new(Xlen::Rv64);
        let mut b = CsrFile::new(Xlen::Rv64);
        a.tie_shared(pool.clone());
        b.tie_shared(pool);
        a.write(CSR_MHARTSTART, 0b11, Mode::Machine).unwrap();
        assert_eq!(b.peek(CSR_MHARTSTART), Some(0b11));
    }

    #[test]
    fn rv32_counter_halves() {
        let mut csrs = CsrFile::new(Xlen::Rv32);
        csrs.write_raw(CSR_MCYCLE, 0x1_2345_6789);
        assert_eq!(csrs.peek(CSR_MCYCLE), Some(0x2345_6789));
        assert_eq!(csrs.peek(CSR_MCYCLEH), Some(1));
        csrs.write(CSR_MCYCLEH, 7, Mode::Machine).unwrap();
        assert_eq!(csrs.peek(CSR_MCYCLEH), Some(7));
    }

    #[test]
    fn mip_csr_write_reaches_only_supervisor_bits() {
        let mut csrs = file();
        csrs.write(CSR_MIP, 0xFFF, Mode::Machine).unwrap();
        assert_eq!(csrs.peek(CSR_MIP), Some(S_INTERRUPT_MASK));
        csrs.set_mip_bit(7, true);
        assert_eq!(csrs.peek(CSR_MIP), Some(S_INTERRUPT_MASK | (1 << 7)));
        csrs.set_mip_bit(7, false);
        assert_eq!(csrs.peek(CSR_MIP), Some(S_INTERRUPT_MASK));
    }
}

//! The per-hart execution engine: fetch-decode-execute, precise trap
//! delivery, interrupts, debug mode, and the peek/poke surface consumed by
//! loaders, drivers and debuggers.

mod amo;
mod bitmanip;
mod execute;
mod fp;
mod lsq;

use std::io::Write;
use std::sync::Arc;

use crate::clint::Clint;
use crate::csr::{
    CsrFile, CsrNumber, SharedCsrPool, CSR_DCSR, CSR_DPC, CSR_FCSR, CSR_FFLAGS, CSR_FRM,
    CSR_MCAUSE, CSR_MEDELEG, CSR_MEPC, CSR_MHARTID, CSR_MIDELEG, CSR_MIE, CSR_MIP, CSR_MISA,
    CSR_MSCAUSE, CSR_MSTATUS, CSR_MTVAL, CSR_MTVEC, CSR_PMPADDR0, CSR_PMPADDR15, CSR_PMPCFG0,
    CSR_PMPCFG3, CSR_SATP, CSR_SCAUSE, CSR_SEDELEG, CSR_SEPC, CSR_SIDELEG, CSR_SIE, CSR_SIP,
    CSR_SSTATUS, CSR_STVAL, CSR_STVEC, CSR_UCAUSE, CSR_UEPC, CSR_UIE, CSR_UIP, CSR_USTATUS,
    CSR_UTVAL, CSR_UTVEC,
};
use crate::decoder::{self, Op};
use crate::memory::{Memory, MemoryError};
use crate::mmu::{self, AccessType, Tlb};
use crate::pmp::{PmpAccess, PmpManager};
use crate::syscall::{Syscall, SyscallMode};
use crate::triggers::{TriggerAction, TriggerEvent, TriggerTiming};
use crate::{Mode, Trap, Xlen};

pub use lsq::{LoadEntry, StoreEntry};

/// Decode cache size (power of 2 for fast modulo)
const DECODE_CACHE_SIZE: usize = 256;
const DECODE_CACHE_MASK: usize = DECODE_CACHE_SIZE - 1;

/// Consecutive illegal-instruction traps before `run` gives up.
const TRAP_LOOP_LIMIT: u32 = 64;

/// Event that terminates the current step from inside the execution path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    /// A store hit the `tohost` address.
    Stop { addr: u64, value: u64 },
    /// The program issued an exit system call.
    Exit { code: u64 },
}

/// Why `run` / `until_address` returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Stopped { addr: u64, value: u64 },
    Exited { code: u64 },
    LimitReached { pc: u64 },
    TrapLoop { pc: u64 },
    TargetReached { pc: u64 },
}

/// Changes made by the execution of one instruction. Drives trace records
/// and the what-if interface.
#[derive(Debug, Clone, Default)]
pub struct ChangeRecord {
    pub new_pc: u64,
    pub has_trap: bool,
    pub trap_cause: u64,
    pub int_reg: Option<(u8, u64)>,
    pub fp_reg: Option<(u8, u64)>,
    pub csrs: Vec<(CsrNumber, u64)>,
    pub mem: Vec<(u64, u32, u64)>,
}

/// One staged write, captured so a precise trap can unwind the instruction.
enum UndoOp {
    IntReg(u8, u64),
    FpReg(u8, u64),
    Csr(CsrNumber, u64),
    Trigger(usize, u64, u64, u64),
    Mem { addr: u64, size: u32, prev: u64 },
    Mode(Mode),
}

/// Debug-mode entry causes (dcsr.cause encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCause {
    Ebreak = 1,
    Trigger = 2,
    HaltRequest = 3,
    Step = 4,
}

pub struct Hart {
    hart_ix: usize,
    xlen: Xlen,

    regs: [u64; 32],
    fregs: [u64; 32],
    pc: u64,
    curr_pc: u64,
    mode: Mode,
    last_mode: Mode,

    // Cached mstatus fields, kept coherent on every mstatus write or poke.
    mstatus_mpp: Mode,
    mstatus_mprv: bool,
    mstatus_fs: u64,
    fcsr: u64,

    pub(crate) csrs: CsrFile,
    pmp: PmpManager,
    tlb: Tlb,
    decode_cache: Vec<Option<(u64, u32, Op)>>,

    // Counters.
    inst_counter: u64,
    retired_insts: u64,
    cycle_count: u64,
    exception_count: u64,
    interrupt_count: u64,
    inst_count_limit: u64,
    consecutive_illegal: u32,

    // Per-instruction trap flags, cleared at each instruction boundary.
    has_exception: bool,
    csr_exception: bool,
    trigger_tripped: bool,
    trigger_debug_request: bool,
    last_insn_raw: u32,
    last_op: Option<Op>,

    // NMI and debug state.
    nmi_pending: bool,
    nmi_cause: u64,
    nmi_pc: u64,
    debug_mode: bool,
    debug_step_mode: bool,
    debug_rom_addr: Option<u64>,

    // Addresses with driver-visible semantics.
    reset_pc: u64,
    stop_addr: Option<u64>,
    to_host: Option<u64>,
    con_io: Option<u64>,
    started: bool,

    // Extension enables.
    rvm: bool,
    rva: bool,
    rvc: bool,
    rvd: bool,
    rve: bool,
    rvf: bool,
    rvs: bool,
    rvu: bool,
    rvn: bool,
    pub(crate) zba: bool,
    pub(crate) zbb: bool,
    pub(crate) zbc: bool,
    pub(crate) zbe: bool,
    pub(crate) zbf: bool,
    pub(crate) zbm: bool,
    pub(crate) zbp: bool,
    pub(crate) zbr: bool,
    pub(crate) zbs: bool,
    pub(crate) zbt: bool,

    // Feature switches.
    enable_triggers: bool,
    enable_counters: bool,
    fast_interrupt_base: Option<u64>,
    misal_data_ok: bool,
    misal_atomic_is_access_fault: bool,
    amo_in_dccm_only: bool,
    abi_names: bool,
    trace_ld_st: bool,
    csr_trace: bool,
    store_error_rollback: bool,
    load_error_rollback: bool,

    // CLINT and the periodic alarm.
    clint: Option<Arc<Clint>>,
    alarm_interval: u64,
    alarm_limit: u64,
    alarm_pending: bool,

    // Load/store queues for imprecise exceptions.
    load_queue: Vec<LoadEntry>,
    store_queue: Vec<StoreEntry>,
    max_load_queue: usize,
    load_queue_enabled: bool,

    // Per-instruction staged-write log and the resulting change record.
    undo: Vec<UndoOp>,
    change: ChangeRecord,
    pending_stop: Option<StopEvent>,

    syscall: Syscall,
    console: Option<Box<dyn Write + Send>>,
    trace_sink: Option<Box<dyn Write + Send>>,
}

impl Hart {
    pub fn new(hart_ix: usize, xlen: Xlen) -> Self {
        let mut hart = Hart {
            hart_ix,
            xlen,
            regs: [0; 32],
            fregs: [0; 32],
            pc: 0,
            curr_pc: 0,
            mode: Mode::Machine,
            last_mode: Mode::Machine,
            mstatus_mpp: Mode::Machine,
            mstatus_mprv: false,
            mstatus_fs: 0,
            fcsr: 0,
            csrs: CsrFile::new(xlen),
            pmp: PmpManager::new(),
            tlb: Tlb::new(),
            decode_cache: vec![None; DECODE_CACHE_SIZE],
            inst_counter: 0,
            retired_insts: 0,
            cycle_count: 0,
            exception_count: 0,
            interrupt_count: 0,
            inst_count_limit: u64::MAX,
            consecutive_illegal: 0,
            has_exception: false,
            csr_exception: false,
            trigger_tripped: false,
            trigger_debug_request: false,
            last_insn_raw: 0,
            last_op: None,
            nmi_pending: false,
            nmi_cause: 0,
            nmi_pc: 0,
            debug_mode: false,
            debug_step_mode: false,
            debug_rom_addr: None,
            reset_pc: 0,
            stop_addr: None,
            to_host: None,
            con_io: None,
            started: hart_ix == 0,
            rvm: true,
            rva: true,
            rvc: true,
            rvd: false,
            rve: false,
            rvf: false,
            rvs: false,
            rvu: false,
            rvn: false,
            zba: false,
            zbb: false,
            zbc: false,
            zbe: false,
            zbf: false,
            zbm: false,
            zbp: false,
            zbr: false,
            zbs: false,
            zbt: false,
            enable_triggers: true,
            enable_counters: true,
            fast_interrupt_base: None,
            misal_data_ok: true,
            misal_atomic_is_access_fault: true,
            amo_in_dccm_only: false,
            abi_names: false,
            trace_ld_st: false,
            csr_trace: false,
            store_error_rollback: false,
            load_error_rollback: false,
            clint: None,
            alarm_interval: 0,
            alarm_limit: u64::MAX,
            alarm_pending: false,
            load_queue: Vec::new(),
            store_queue: Vec::new(),
            max_load_queue: 16,
            load_queue_enabled: false,
            undo: Vec::new(),
            change: ChangeRecord::default(),
            pending_stop: None,
            syscall: Syscall::new(),
            console: None,
            trace_sink: None,
        };
        hart.csrs.poke(CSR_MHARTID, hart_ix as u64);
        hart.update_misa();
        hart.update_mstatus_cache();
        hart
    }

    // --- Configuration surface -------------------------------------------

    pub fn hart_ix(&self) -> usize {
        self.hart_ix
    }

    pub fn xlen(&self) -> Xlen {
        self.xlen
    }

    pub fn set_reset_pc(&mut self, pc: u64) {
        self.reset_pc = pc;
    }

    pub fn set_nmi_pc(&mut self, pc: u64) {
        self.nmi_pc = pc;
    }

    pub fn set_stop_address(&mut self, addr: u64) {
        self.stop_addr = Some(addr);
    }

    pub fn set_tohost_address(&mut self, addr: u64) {
        self.to_host = Some(addr);
    }

    pub fn tohost_address(&self) -> Option<u64> {
        self.to_host
    }

    pub fn set_console_io_address(&mut self, addr: u64) {
        self.con_io = Some(addr);
    }

    pub fn set_console(&mut self, sink: Box<dyn Write + Send>) {
        self.console = Some(sink);
    }

    pub fn set_trace_sink(&mut self, sink: Box<dyn Write + Send>) {
        self.trace_sink = Some(sink);
    }

    pub fn attach_clint(&mut self, clint: Arc<Clint>) {
        self.clint = Some(clint);
    }

    pub fn set_alarm_interval(&mut self, interval: u64) {
        self.alarm_interval = interval;
        self.alarm_limit = if interval == 0 {
            u64::MAX
        } else {
            self.inst_counter + interval
        };
    }

    pub fn set_instruction_count_limit(&mut self, limit: u64) {
        self.inst_count_limit = limit;
    }

    pub fn set_pmp_grain(&mut self, grain: u64) {
        self.pmp.set_grain(grain);
    }

    pub fn set_syscall_mode(&mut self, mode: Option<SyscallMode>) {
        self.syscall.mode = mode;
    }

    pub fn enable_triggers(&mut self, flag: bool) {
        self.enable_triggers = flag;
    }

    pub fn enable_performance_counters(&mut self, flag: bool) {
        self.enable_counters = flag;
    }

    pub fn enable_fast_interrupts(&mut self, base: Option<u64>) {
        self.fast_interrupt_base = base;
    }

    pub fn enable_misaligned_data(&mut self, flag: bool) {
        self.misal_data_ok = flag;
    }

    pub fn misaligned_atomic_causes_access_fault(&mut self, flag: bool) {
        self.misal_atomic_is_access_fault = flag;
    }

    pub fn enable_amo_in_dccm_only(&mut self, flag: bool) {
        self.amo_in_dccm_only = flag;
    }

    pub fn enable_abi_names(&mut self, flag: bool) {
        self.abi_names = flag;
    }

    pub fn abi_names(&self) -> bool {
        self.abi_names
    }

    pub fn enable_trace_load_store(&mut self, flag: bool) {
        self.trace_ld_st = flag;
    }

    pub fn enable_csr_trace(&mut self, flag: bool) {
        self.csr_trace = flag;
    }

    pub fn enable_store_error_rollback(&mut self, flag: bool) {
        self.store_error_rollback = flag;
    }

    pub fn enable_load_error_rollback(&mut self, flag: bool) {
        self.load_error_rollback = flag;
    }

    pub fn enable_bench_load_exceptions(&mut self, flag: bool) {
        self.load_queue_enabled = flag;
    }

    pub fn set_load_queue_size(&mut self, size: usize) {
        self.max_load_queue = size;
    }

    pub fn set_debug_rom_address(&mut self, addr: u64) {
        self.debug_rom_addr = Some(addr);
    }

    pub fn tie_shared_csrs(&mut self, pool: SharedCsrPool) {
        self.csrs.tie_shared(pool);
    }

    pub fn enable_extension(&mut self, letter: char, flag: bool) {
        match letter {
            'a' => self.rva = flag,
            'c' => self.rvc = flag,
            'd' => self.rvd = flag,
            'e' => self.rve = flag,
            'f' => self.rvf = flag,
            'm' => self.rvm = flag,
            's' => self.rvs = flag,
            'u' => self.rvu = flag,
            'n' => self.rvn = flag,
            _ => {}
        }
        self.update_misa();
    }

    pub fn enable_zb_extension(&mut self, name: &str, flag: bool) {
        match name {
            "zba" => self.zba = flag,
            "zbb" => self.zbb = flag,
            "zbc" => self.zbc = flag,
            "zbe" => self.zbe = flag,
            "zbf" => self.zbf = flag,
            "zbm" => self.zbm = flag,
            "zbp" => self.zbp = flag,
            "zbr" => self.zbr = flag,
            "zbs" => self.zbs = flag,
            "zbt" => self.zbt = flag,
            _ => {}
        }
    }

    fn update_misa(&mut self) {
        let mut value = 1 << 8; // I
        if self.rva {
            value |= 1 << 0;
        }
        if self.rvc {
            value |= 1 << 2;
        }
        if self.rvd {
            value |= 1 << 3;
        }
        if self.rve {
            value |= 1 << 4;
        }
        if self.rvf {
            value |= 1 << 5;
        }
        if self.rvm {
            value |= 1 << 12;
        }
        if self.rvn {
            value |= 1 << 13;
        }
        if self.rvs {
            value |= 1 << 18;
        }
        if self.rvu {
            value |= 1 << 20;
        }
        let mxl = match self.xlen {
            Xlen::Rv32 => 1u64 << 30,
            Xlen::Rv64 => 2u64 << 62,
        };
        self.csrs.write_raw(CSR_MISA, mxl | value);
    }

    // --- Lifecycle --------------------------------------------------------

    /// Force the hart to its reset state. `reset_memory_mapped_regs` also
    /// zeroes the memory-mapped-register regions.
    pub fn reset(&mut self, mem: &mut Memory, reset_memory_mapped_regs: bool) {
        self.regs = [0; 32];
        self.fregs = [0; 32];
        self.pc = self.reset_pc;
        self.curr_pc = self.reset_pc;
        self.mode = Mode::Machine;
        self.last_mode = Mode::Machine;
        self.csrs.reset();
        self.csrs.poke(CSR_MHARTID, self.hart_ix as u64);
        self.update_misa();
        self.update_mstatus_cache();
        self.fcsr = 0;
        self.tlb.flush();
        self.decode_cache = vec![None; DECODE_CACHE_SIZE];
        self.inst_counter = 0;
        self.retired_insts = 0;
        self.cycle_count = 0;
        self.exception_count = 0;
        self.interrupt_count = 0;
        self.consecutive_illegal = 0;
        self.nmi_pending = false;
        self.debug_mode = false;
        self.debug_step_mode = false;
        self.load_queue.clear();
        self.store_queue.clear();
        self.pending_stop = None;
        self.alarm_pending = false;
        self.update_memory_protection();
        mem.invalidate_lr(self.hart_ix);
        if reset_memory_mapped_regs {
            mem.reset_mmrs();
        }
        log::debug!("hart {}: reset, pc={:#x}", self.hart_ix, self.pc);
    }

    pub fn set_started(&mut self, flag: bool) {
        self.started = flag;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    // --- State access -----------------------------------------------------

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = self.xlen.mask_address(pc) & !1;
    }

    pub fn current_pc(&self) -> u64 {
        self.curr_pc
    }

    pub fn privilege_mode(&self) -> Mode {
        self.mode
    }

    pub fn last_privilege_mode(&self) -> Mode {
        self.last_mode
    }

    pub fn in_debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub fn instruction_count(&self) -> u64 {
        self.inst_counter
    }

    pub fn retired_instruction_count(&self) -> u64 {
        self.retired_insts
    }

    pub fn exception_count(&self) -> u64 {
        self.exception_count
    }

    pub fn interrupt_count(&self) -> u64 {
        self.interrupt_count
    }

    pub fn trap_count(&self) -> u64 {
        self.exception_count + self.interrupt_count
    }

    pub fn change_record(&self) -> &ChangeRecord {
        &self.change
    }

    pub fn peek_int_reg(&self, ix: usize) -> Option<u64> {
        self.regs.get(ix).map(|&v| self.xlen.csr_view(v))
    }

    pub fn poke_int_reg(&mut self, ix: usize, value: u64) -> bool {
        if ix == 0 || ix >= 32 || (self.rve && ix >= 16) {
            return false;
        }
        self.regs[ix] = self.xlen.canonicalize(value);
        true
    }

    pub fn peek_fp_reg(&self, ix: usize) -> Option<u64> {
        if self.rvf || self.rvd {
            self.fregs.get(ix).copied()
        } else {
            None
        }
    }

    pub fn poke_fp_reg(&mut self, ix: usize, value: u64) -> bool {
        if (self.rvf || self.rvd) && ix < 32 {
            self.fregs[ix] = value;
            true
        } else {
            false
        }
    }

    pub fn peek_csr(&self, number: CsrNumber) -> Option<u64> {
        self.csrs.peek(number)
    }

    /// Implemented CSRs with current values; used by snapshots.
    pub fn export_csrs(&self) -> std::collections::HashMap<CsrNumber, u64> {
        self.csrs.export()
    }

    /// Force the privilege mode (snapshot restore / debugger).
    pub fn set_privilege_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn poke_csr(&mut self, number: CsrNumber, value: u64) -> bool {
        let ok = self.csrs.poke(number, value);
        if ok {
            self.csr_side_effects(number);
        }
        ok
    }

    pub fn peek_memory(&self, mem: &Memory, addr: u64, size: u32) -> Option<u64> {
        mem.peek(addr, size)
    }

    pub fn poke_memory(&self, mem: &mut Memory, addr: u64, size: u32, value: u64) -> bool {
        mem.poke(addr, size, value)
    }

    pub fn peek_trigger(&self, ix: usize) -> Option<(u64, u64, u64)> {
        self.csrs.triggers.peek(ix)
    }

    pub fn poke_trigger(&mut self, ix: usize, d1: u64, d2: u64, d3: u64) -> bool {
        self.csrs.triggers.poke(ix, d1, d2, d3)
    }

    // --- Register helpers (staged writes) ---------------------------------

    pub(crate) fn read_reg(&self, ix: u8) -> u64 {
        if ix == 0 {
            0
        } else {
            self.regs[ix as usize]
        }
    }

    pub(crate) fn write_reg(&mut self, ix: u8, value: u64) {
        if ix == 0 {
            return;
        }
        let value = self.xlen.canonicalize(value);
        self.undo.push(UndoOp::IntReg(ix, self.regs[ix as usize]));
        self.regs[ix as usize] = value;
        self.change.int_reg = Some((ix, value));
    }

    pub(crate) fn read_freg(&self, ix: u8) -> u64 {
        self.fregs[ix as usize]
    }

    pub(crate) fn write_freg(&mut self, ix: u8, value: u64) {
        self.undo.push(UndoOp::FpReg(ix, self.fregs[ix as usize]));
        self.fregs[ix as usize] = value;
        self.change.fp_reg = Some((ix, value));
        self.mark_fs_dirty();
    }

    /// Check a register index against the E-extension register file.
    pub(crate) fn check_reg(&self, ix: u8) -> Result<(), Trap> {
        if self.rve && ix >= 16 {
            Err(Trap::IllegalInstruction(0))
        } else {
            Ok(())
        }
    }

    fn backing_csr(number: CsrNumber) -> CsrNumber {
        match number {
            CSR_SSTATUS | CSR_USTATUS => CSR_MSTATUS,
            CSR_SIE | CSR_UIE => CSR_MIE,
            CSR_SIP | CSR_UIP => CSR_MIP,
            CSR_FFLAGS | CSR_FRM => CSR_FCSR,
            other => other,
        }
    }

    /// CSR write from instruction context: staged for rollback, side effects
    /// fired on success.
    pub(crate) fn write_csr_staged(
        &mut self,
        number: CsrNumber,
        value: u64,
    ) -> Result<(), Trap> {
        use crate::csr::{CSR_TDATA1, CSR_TDATA2, CSR_TDATA3, CSR_TSELECT};
        match number {
            CSR_TSELECT | CSR_TDATA1 | CSR_TDATA2 | CSR_TDATA3 => {
                let ix = self.csrs.triggers.tselect() as usize;
                if let Some((d1, d2, d3)) = self.csrs.triggers.peek(ix) {
                    self.undo.push(UndoOp::Trigger(ix, d1, d2, d3));
                }
            }
            _ => {
                let backing = Self::backing_csr(number);
                if let Some(old) = self.csrs.peek(backing) {
                    self.undo.push(UndoOp::Csr(backing, old));
                }
            }
        }
        self.csrs.write(number, value, self.mode).map_err(|_| {
            self.csr_exception = true;
            Trap::IllegalInstruction(0)
        })?;
        self.csr_side_effects(number);
        if self.csr_trace || self.trace_sink.is_some() {
            if let Some(now) = self.csrs.peek(Self::backing_csr(number)) {
                self.change.csrs.push((number, now));
            }
        }
        Ok(())
    }

    /// React to a CSR update: refresh caches and derived structures.
    fn csr_side_effects(&mut self, number: CsrNumber) {
        match number {
            CSR_MSTATUS | CSR_SSTATUS | CSR_USTATUS => self.update_mstatus_cache(),
            CSR_FCSR | CSR_FFLAGS | CSR_FRM => {
                self.fcsr = self.csrs.peek(CSR_FCSR).unwrap_or(0);
            }
            CSR_SATP => self.update_address_translation(),
            CSR_PMPCFG0..=CSR_PMPCFG3 | CSR_PMPADDR0..=CSR_PMPADDR15 => {
                self.update_memory_protection()
            }
            _ => {}
        }
    }

    fn update_mstatus_cache(&mut self) {
        let m = self.csrs.peek(CSR_MSTATUS).unwrap_or(0);
        self.mstatus_mpp = Mode::from_mpp(m >> 11);
        self.mstatus_mprv = m >> 17 & 1 != 0;
        self.mstatus_fs = (m >> 13) & 3;
    }

    fn update_address_translation(&mut self) {
        self.tlb.flush();
        self.decode_cache = vec![None; DECODE_CACHE_SIZE];
    }

    fn update_memory_protection(&mut self) {
        let (cfg, addrs) = self.csrs.pmp_images();
        self.pmp.update(&cfg, &addrs, self.xlen);
    }

    pub(crate) fn mark_fs_dirty(&mut self) {
        let m = self.csrs.peek(CSR_MSTATUS).unwrap_or(0);
        self.csrs.write_raw(CSR_MSTATUS, m | (3 << 13));
        self.mstatus_fs = 3;
    }

    pub(crate) fn fp_enabled(&self) -> bool {
        (self.rvf || self.rvd) && self.mstatus_fs != 0
    }

    pub(crate) fn rvd_enabled(&self) -> bool {
        self.rvd
    }

    pub(crate) fn rvf_enabled(&self) -> bool {
        self.rvf
    }

    pub(crate) fn rva_enabled(&self) -> bool {
        self.rva
    }

    pub(crate) fn rvm_enabled(&self) -> bool {
        self.rvm
    }

    pub(crate) fn fcsr_value(&self) -> u64 {
        self.fcsr
    }

    /// OR newly accrued FP flags into fcsr (staged).
    pub(crate) fn accrue_fp_flags(&mut self, flags: u64) {
        if flags == 0 {
            return;
        }
        let old = self.csrs.peek(CSR_FCSR).unwrap_or(0);
        self.undo.push(UndoOp::Csr(CSR_FCSR, old));
        self.csrs.write_raw(CSR_FCSR, old | flags);
        self.fcsr = old | flags;
    }

    // --- Memory access ----------------------------------------------------

    /// Effective privilege for data accesses: MPRV redirects machine-mode
    /// loads and stores to the privilege in mstatus.MPP.
    pub(crate) fn effective_data_mode(&self) -> Mode {
        if self.mstatus_mprv && self.mode == Mode::Machine {
            self.mstatus_mpp
        } else {
            self.mode
        }
    }

    pub(crate) fn translate_data(
        &mut self,
        mem: &mut Memory,
        vaddr: u64,
        access: AccessType,
    ) -> Result<u64, Trap> {
        let mode = if self.rvs {
            self.effective_data_mode()
        } else {
            Mode::Machine
        };
        let satp = self.csrs.peek(CSR_SATP).unwrap_or(0);
        let mstatus = self.csrs.peek(CSR_MSTATUS).unwrap_or(0);
        mmu::translate(mem, &mut self.tlb, mode, self.xlen, satp, mstatus, vaddr, access)
    }

    fn translate_fetch(&mut self, mem: &mut Memory, vaddr: u64) -> Result<u64, Trap> {
        let mode = if self.rvs { self.mode } else { Mode::Machine };
        let satp = self.csrs.peek(CSR_SATP).unwrap_or(0);
        let mstatus = self.csrs.peek(CSR_MSTATUS).unwrap_or(0);
        mmu::translate(
            mem,
            &mut self.tlb,
            mode,
            self.xlen,
            satp,
            mstatus,
            vaddr,
            AccessType::Instruction,
        )
    }

    pub(crate) fn pmp_check(
        &self,
        paddr: u64,
        size: u64,
        access: PmpAccess,
        mode: Mode,
    ) -> bool {
        self.pmp.access_ok(paddr, size, access, mode)
    }

    fn map_load_error(err: MemoryError, vaddr: u64) -> Trap {
        match err {
            MemoryError::Unmapped(_) | MemoryError::OutOfBounds { .. } | MemoryError::Denied { .. } => {
                Trap::LoadAccessFault(vaddr)
            }
        }
    }

    fn map_store_error(err: MemoryError, vaddr: u64) -> Trap {
        match err {
            MemoryError::Unmapped(_) | MemoryError::OutOfBounds { .. } | MemoryError::Denied { .. } => {
                Trap::StoreAccessFault(vaddr)
            }
        }
    }

    /// Shared front half of loads and AMO reads: alignment, triggers,
    /// translation and PMP. Returns the physical address.
    pub(crate) fn prepare_load(
        &mut self,
        mem: &mut Memory,
        vaddr: u64,
        size: u32,
        require_aligned: bool,
        misaligned_trap: impl Fn(u64) -> Trap,
    ) -> Result<u64, Trap> {
        if vaddr % size as u64 != 0 && (require_aligned || !self.misal_data_ok) {
            return Err(misaligned_trap(vaddr));
        }
        if let Some(action) = self.trigger_check(TriggerEvent::LoadAddress, vaddr) {
            return Err(self.trigger_trap(action, vaddr));
        }
        let paddr = self.translate_data(mem, vaddr, AccessType::Load)?;
        // Misaligned accesses crossing a page must translate contiguously.
        if (vaddr & 0xFFF) + size as u64 > 0x1000 {
            let last = self.translate_data(mem, vaddr + size as u64 - 1, AccessType::Load)?;
            if last != paddr + size as u64 - 1 {
                return Err(Trap::LoadAccessFault(vaddr));
            }
        }
        if !self.pmp_check(paddr, size as u64, PmpAccess::Read, self.effective_data_mode()) {
            return Err(Trap::LoadAccessFault(vaddr));
        }
        Ok(paddr)
    }

    /// Architectural load: full check sequence, destination write, and load
    /// queue capture.
    pub(crate) fn load(
        &mut self,
        mem: &mut Memory,
        rd: u8,
        vaddr: u64,
        size: u32,
        signed: bool,
    ) -> Result<(), Trap> {
        self.check_reg(rd)?;
        let paddr = self.prepare_load(mem, vaddr, size, false, Trap::LoadAddressMisaligned)?;
        let raw = match &self.clint {
            Some(clint) if clint.contains(paddr) => clint.load(paddr, size),
            _ => mem
                .read(paddr, size)
                .map_err(|e| Self::map_load_error(e, vaddr))?,
        };
        let value = if signed {
            match size {
                1 => raw as u8 as i8 as i64 as u64,
                2 => raw as u16 as i16 as i64 as u64,
                4 => raw as u32 as i32 as i64 as u64,
                _ => raw,
            }
        } else {
            raw
        };
        if let Some(action) = self.trigger_check(TriggerEvent::LoadData, value) {
            return Err(self.trigger_trap(action, vaddr));
        }
        let prev = self.read_reg(rd);
        self.write_reg(rd, value);
        if self.load_queue_enabled {
            self.push_load_queue(LoadEntry {
                size,
                addr: paddr,
                reg: rd,
                prev_value: prev,
                tag: self.inst_counter,
                valid: true,
                fp: false,
            });
        }
        if self.trace_ld_st {
            self.change.mem.push((paddr, size, raw));
        }
        Ok(())
    }

    /// Architectural store: checks, special windows (CLINT, tohost, console
    /// I/O), rollback capture, then the masked memory write.
    pub(crate) fn store(
        &mut self,
        mem: &mut Memory,
        vaddr: u64,
        size: u32,
        value: u64,
    ) -> Result<(), Trap> {
        if vaddr % size as u64 != 0 && !self.misal_data_ok {
            return Err(Trap::StoreAddressMisaligned(vaddr));
        }
        if let Some(action) = self.trigger_check(TriggerEvent::StoreAddress, vaddr) {
            return Err(self.trigger_trap(action, vaddr));
        }
        if let Some(action) = self.trigger_check(TriggerEvent::StoreData, value) {
            return Err(self.trigger_trap(action, vaddr));
        }
        let paddr = self.translate_data(mem, vaddr, AccessType::Store)?;
        if (vaddr & 0xFFF) + size as u64 > 0x1000 {
            let last = self.translate_data(mem, vaddr + size as u64 - 1, AccessType::Store)?;
            if last != paddr + size as u64 - 1 {
                return Err(Trap::StoreAccessFault(vaddr));
            }
        }
        if !self.pmp_check(paddr, size as u64, PmpAccess::Write, self.effective_data_mode()) {
            return Err(Trap::StoreAccessFault(vaddr));
        }

        // Console I/O: a byte written here goes to the console, not memory.
        if Some(paddr) == self.con_io {
            if let Some(console) = &mut self.console {
                let _ = console.write_all(&[value as u8]);
            }
            return Ok(());
        }

        // CLINT mailboxes.
        if let Some(clint) = &self.clint {
            if clint.contains(paddr) {
                clint.store(paddr, size, value);
                return Ok(());
            }
        }

        let prev = mem.peek(paddr, size).unwrap_or(0);
        mem.write(paddr, size, value)
            .map_err(|e| Self::map_store_error(e, vaddr))?;
        self.undo.push(UndoOp::Mem { addr: paddr, size, prev });
        self.invalidate_decode_cache_range(paddr, size);
        self.store_queue_capture(paddr, size, value, prev);
        self.change.mem.push((paddr, size, value));

        if Some(paddr) == self.to_host {
            self.pending_stop = Some(StopEvent::Stop { addr: paddr, value });
        }
        Ok(())
    }

    // --- Decode cache -----------------------------------------------------

    fn decode_cached(&mut self, pc: u64, raw: u32) -> Op {
        let ix = ((pc >> 1) as usize) & DECODE_CACHE_MASK;
        if let Some((cached_pc, cached_raw, op)) = self.decode_cache[ix] {
            if cached_pc == pc && cached_raw == raw {
                return op;
            }
        }
        let op = decoder::decode(raw);
        self.decode_cache[ix] = Some((pc, raw, op));
        op
    }

    fn invalidate_decode_cache_range(&mut self, addr: u64, size: u32) {
        let lo = addr & !1;
        let mut a = lo;
        while a < addr + size as u64 {
            let ix = ((a >> 1) as usize) & DECODE_CACHE_MASK;
            if let Some((pc, _, _)) = self.decode_cache[ix] {
                if pc + 4 > addr && pc < addr + size as u64 {
                    self.decode_cache[ix] = None;
                }
            }
            a += 2;
        }
    }

    pub(crate) fn flush_decode_cache(&mut self) {
        self.decode_cache = vec![None; DECODE_CACHE_SIZE];
    }

    pub(crate) fn flush_tlb(&mut self, vaddr: Option<u64>, asid: Option<u64>) {
        match (vaddr, asid) {
            (Some(va), _) => self.tlb.flush_va(va),
            (None, Some(asid)) => self.tlb.flush_asid(asid),
            (None, None) => self.tlb.flush(),
        }
    }

    // --- Triggers ---------------------------------------------------------

    fn trigger_check(&mut self, event: TriggerEvent, value: u64) -> Option<TriggerAction> {
        if !self.enable_triggers || self.debug_mode {
            return None;
        }
        self.csrs
            .triggers
            .evaluate(event, value, TriggerTiming::Before, self.mode, self.xlen)
    }

    fn trigger_check_after(&mut self, event: TriggerEvent, value: u64) -> Option<TriggerAction> {
        if !self.enable_triggers || self.debug_mode {
            return None;
        }
        self.csrs
            .triggers
            .evaluate(event, value, TriggerTiming::After, self.mode, self.xlen)
    }

    /// Convert a tripped trigger into the trap to raise. When the trigger
    /// asks for debug entry, the exception path diverts there instead of
    /// delivering the breakpoint.
    fn trigger_trap(&mut self, action: TriggerAction, value: u64) -> Trap {
        self.trigger_tripped = true;
        if action == TriggerAction::EnterDebug {
            self.trigger_debug_request = true;
        }
        Trap::Breakpoint(value)
    }

    // --- Interrupts -------------------------------------------------------

    /// Highest-priority deliverable interrupt, or `None`. Priority follows
    /// the privileged spec: MEI, MSI, MTI, SEI, SSI, STI.
    fn pending_interrupt(&self) -> Option<Trap> {
        let mstatus = self.csrs.peek(CSR_MSTATUS).unwrap_or(0);
        let mip = self.csrs.peek(CSR_MIP).unwrap_or(0);
        let mie = self.csrs.peek(CSR_MIE).unwrap_or(0);
        let mideleg = self.csrs.peek(CSR_MIDELEG).unwrap_or(0);

        let m_pending = (mip & mie) & !mideleg;
        let s_pending = (mip & mie) & mideleg;

        let m_enabled = match self.mode {
            Mode::Machine => mstatus >> 3 & 1 == 1,
            _ => true,
        };
        if m_enabled {
            if m_pending >> 11 & 1 != 0 {
                return Some(Trap::MachineExternalInterrupt);
            }
            if m_pending >> 3 & 1 != 0 {
                return Some(Trap::MachineSoftwareInterrupt);
            }
            if m_pending >> 7 & 1 != 0 {
                return Some(Trap::MachineTimerInterrupt);
            }
        }

        let s_enabled = match self.mode {
            Mode::Machine => false,
            Mode::Supervisor => mstatus >> 1 & 1 == 1,
            Mode::User => true,
        };
        if s_enabled {
            if s_pending >> 9 & 1 != 0 {
                return Some(Trap::SupervisorExternalInterrupt);
            }
            if s_pending >> 1 & 1 != 0 {
                return Some(Trap::SupervisorSoftwareInterrupt);
            }
            if s_pending >> 5 & 1 != 0 {
                return Some(Trap::SupervisorTimerInterrupt);
            }
        }
        None
    }

    pub fn is_interrupt_possible(&self) -> bool {
        !self.debug_mode && self.pending_interrupt().is_some()
    }

    /// Post a non-maskable interrupt.
    pub fn post_nmi(&mut self, cause: u64) {
        // Nested NMI overwrites the recorded cause.
        self.nmi_pending = true;
        self.nmi_cause = cause;
    }

    fn take_nmi(&mut self) {
        self.nmi_pending = false;
        self.interrupt_count += 1;
        let mstatus = self.csrs.peek(CSR_MSTATUS).unwrap_or(0);
        let mie = mstatus >> 3 & 1;
        let mut new_status = (mstatus & !(1 << 7)) | (mie << 7);
        new_status &= !(1 << 3);
        new_status = (new_status & !(0b11 << 11)) | (self.mode.to_mpp() << 11);
        self.csrs.write_raw(CSR_MSTATUS, new_status);
        self.update_mstatus_cache();
        self.csrs.write_raw(CSR_MEPC, self.pc & !1);
        self.csrs
            .write_raw(CSR_MCAUSE, (1 << (self.xlen.bits() - 1)) | self.nmi_cause);
        self.csrs.write_raw(CSR_MTVAL, 0);
        self.mode = Mode::Machine;
        self.pc = self.nmi_pc;
        log::trace!("hart {}: NMI taken, pc={:#x}", self.hart_ix, self.pc);
    }

    // --- Trap delivery ----------------------------------------------------

    /// Deliver `trap` precisely: pick the destination privilege through the
    /// delegation registers, record epc/cause/tval and the secondary cause,
    /// push the status stack, and vector the PC.
    fn take_trap(&mut self, mem: &mut Memory, trap: &Trap, epc: u64, sec_cause: u64) {
        let interrupt = trap.is_interrupt();
        let cause = trap.cause();
        let bit = 1u64 << cause.min(63);

        let medeleg = self.csrs.peek(CSR_MEDELEG).unwrap_or(0);
        let mideleg = self.csrs.peek(CSR_MIDELEG).unwrap_or(0);
        let deleg = if interrupt { mideleg } else { medeleg };

        let mut target = Mode::Machine;
        if self.rvs && self.mode != Mode::Machine && deleg & bit != 0 {
            target = Mode::Supervisor;
            // N extension: a supervisor may push the trap further down.
            if self.rvn && self.mode == Mode::User {
                let sdeleg = if interrupt {
                    self.csrs.peek(CSR_SIDELEG).unwrap_or(0)
                } else {
                    self.csrs.peek(CSR_SEDELEG).unwrap_or(0)
                };
                if sdeleg & bit != 0 {
                    target = Mode::User;
                }
            }
        } else if self.rvn && !self.rvs && self.mode == Mode::User && deleg & bit != 0 {
            target = Mode::User;
        }

        let cause_value = if interrupt {
            (1u64 << (self.xlen.bits() - 1)) | cause
        } else {
            cause
        };
        let tval = trap.tval();

        let (epc_csr, cause_csr, tval_csr, tvec_csr) = match target {
            Mode::Machine => (CSR_MEPC, CSR_MCAUSE, CSR_MTVAL, CSR_MTVEC),
            Mode::Supervisor => (CSR_SEPC, CSR_SCAUSE, CSR_STVAL, CSR_STVEC),
            Mode::User => (CSR_UEPC, CSR_UCAUSE, CSR_UTVAL, CSR_UTVEC),
        };
        self.csrs.write_raw(epc_csr, epc & !1);
        self.csrs.write_raw(cause_csr, cause_value);
        self.csrs.write_raw(tval_csr, tval);
        self.csrs.write_raw(CSR_MSCAUSE, sec_cause);
        self.change.csrs.push((epc_csr, epc & !1));
        self.change.csrs.push((cause_csr, cause_value));
        self.change.csrs.push((tval_csr, tval));

        let mut mstatus = self.csrs.peek(CSR_MSTATUS).unwrap_or(0);
        match target {
            Mode::Machine => {
                let mie = mstatus >> 3 & 1;
                mstatus = (mstatus & !(1 << 7)) | (mie << 7); // MPIE <= MIE
                mstatus &= !(1 << 3); // MIE <= 0
                mstatus = (mstatus & !(0b11 << 11)) | (self.mode.to_mpp() << 11);
            }
            Mode::Supervisor => {
                let sie = mstatus >> 1 & 1;
                mstatus = (mstatus & !(1 << 5)) | (sie << 5); // SPIE <= SIE
                mstatus &= !(1 << 1); // SIE <= 0
                let spp = if self.mode == Mode::Supervisor { 1 } else { 0 };
                mstatus = (mstatus & !(1 << 8)) | (spp << 8);
            }
            Mode::User => {
                let uie = mstatus & 1;
                mstatus = (mstatus & !(1 << 4)) | (uie << 4); // UPIE <= UIE
                mstatus &= !1; // UIE <= 0
            }
        }
        self.csrs.write_raw(CSR_MSTATUS, mstatus);
        self.update_mstatus_cache();
        self.change.csrs.push((CSR_MSTATUS, mstatus));

        self.mode = target;

        // Fast interrupts bypass the vector table: the handler address is
        // read from a per-cause entry table.
        if interrupt && target == Mode::Machine {
            if let Some(base) = self.fast_interrupt_base {
                let width = self.xlen.bits() as u64 / 8;
                if let Some(handler) = mem.peek(base + cause * width, width as u32) {
                    self.pc = self.xlen.mask_address(handler) & !1;
                    log::trace!(
                        "hart {}: fast interrupt {cause} -> {:#x}",
                        self.hart_ix,
                        self.pc
                    );
                    return;
                }
            }
        }

        let tvec = self.csrs.peek(tvec_csr).unwrap_or(0);
        let base = tvec & !0b11;
        let vectored = tvec & 0b11 == 1;
        self.pc = if interrupt && vectored {
            base.wrapping_add(4 * cause)
        } else {
            base
        };
        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "hart {}: trap {trap:?} -> {target:?}, pc={:#x}",
                self.hart_ix,
                self.pc
            );
        }
    }

    /// Handle a synchronous exception raised mid-instruction: unwind staged
    /// writes, then deliver. A trigger asking for debug entry diverts there
    /// instead of delivering the breakpoint.
    fn take_exception(&mut self, mem: &mut Memory, trap: Trap) {
        self.rollback(mem);
        if self.trigger_debug_request {
            self.trigger_debug_request = false;
            self.enter_debug_mode(DebugCause::Trigger, self.curr_pc);
            return;
        }
        self.has_exception = true;
        self.exception_count += 1;
        // Faulting instructions count as attempts (they tag the load queue
        // and bound run limits) without retiring.
        self.inst_counter += 1;
        self.change.has_trap = true;
        self.change.trap_cause = trap.cause();
        if matches!(trap, Trap::IllegalInstruction(_)) {
            self.consecutive_illegal += 1;
        } else {
            self.consecutive_illegal = 0;
        }
        let sec = 0;
        self.take_trap(mem, &trap, self.curr_pc, sec);
    }

    /// Replay the staged-write log in reverse, undoing every register, CSR
    /// and memory effect of the current instruction.
    fn rollback(&mut self, mem: &mut Memory) {
        while let Some(op) = self.undo.pop() {
            match op {
                UndoOp::IntReg(ix, old) => self.regs[ix as usize] = old,
                UndoOp::FpReg(ix, old) => self.fregs[ix as usize] = old,
                UndoOp::Csr(number, old) => {
                    self.csrs.write_raw(number, old);
                    self.csr_side_effects(number);
                }
                UndoOp::Trigger(ix, d1, d2, d3) => {
                    self.csrs.triggers.poke(ix, d1, d2, d3);
                }
                UndoOp::Mem { addr, size, prev } => {
                    mem.poke(addr, size, prev);
                    self.store_queue_discard(addr, size);
                }
                UndoOp::Mode(old) => self.mode = old,
            }
        }
        // Loads staged this instruction are gone too.
        let tag = self.inst_counter;
        self.load_queue.retain(|e| e.tag != tag);
        self.change.int_reg = None;
        self.change.fp_reg = None;
        self.change.csrs.clear();
        self.change.mem.clear();
    }

    pub(crate) fn record_mode_change(&mut self, old: Mode) {
        self.undo.push(UndoOp::Mode(old));
    }

    // --- Debug mode -------------------------------------------------------

    pub fn enter_debug_mode(&mut self, cause: DebugCause, pc: u64) {
        let dcsr = self.csrs.peek(CSR_DCSR).unwrap_or(0);
        let dcsr = (dcsr & !(0b111 << 6) & !0b11)
            | ((cause as u64 & 0b111) << 6)
            | (self.mode.to_mpp() & 0b11);
        self.csrs.poke(CSR_DCSR, dcsr);
        self.csrs.poke(CSR_DPC, pc);
        self.debug_mode = true;
        self.mode = Mode::Machine;
        if let Some(rom) = self.debug_rom_addr {
            self.pc = rom;
        }
        log::debug!("hart {}: debug entry, cause {:?}", self.hart_ix, cause);
    }

    pub fn exit_debug_mode(&mut self) {
        let dcsr = self.csrs.peek(CSR_DCSR).unwrap_or(0);
        self.mode = Mode::from_mpp(dcsr & 0b11);
        self.pc = self.csrs.peek(CSR_DPC).unwrap_or(self.pc);
        self.debug_mode = false;
        self.debug_step_mode = dcsr >> 2 & 1 != 0;
    }

    pub(crate) fn dret(&mut self) -> Result<u64, Trap> {
        if !self.debug_mode {
            return Err(Trap::IllegalInstruction(0));
        }
        self.exit_debug_mode();
        Ok(self.pc)
    }

    pub(crate) fn handle_ebreak(&mut self) -> Result<Option<u64>, Trap> {
        if self.debug_mode {
            // No recursion: park back at the debug ROM.
            return Ok(Some(self.debug_rom_addr.unwrap_or(self.curr_pc)));
        }
        let dcsr = self.csrs.peek(CSR_DCSR).unwrap_or(0);
        let enter = match self.mode {
            Mode::Machine => dcsr >> 15 & 1 != 0,
            Mode::Supervisor => dcsr >> 13 & 1 != 0,
            Mode::User => dcsr >> 12 & 1 != 0,
        };
        if enter {
            self.enter_debug_mode(DebugCause::Ebreak, self.curr_pc);
            Ok(Some(self.pc))
        } else {
            Err(Trap::Breakpoint(self.curr_pc))
        }
    }

    // --- Fetch ------------------------------------------------------------

    /// Fetch the instruction at `curr_pc`: returns the (possibly expanded)
    /// 32-bit word, the raw fetched bits, and the instruction length.
    fn fetch(&mut self, mem: &mut Memory) -> Result<(u32, u32, u8), Trap> {
        let pc = self.curr_pc;
        let align = if self.rvc { 1 } else { 3 };
        if pc & align != 0 {
            return Err(Trap::InstructionAddressMisaligned(pc));
        }
        let pa = self.translate_fetch(mem, pc)?;
        if !self.pmp_check(pa, 2, PmpAccess::Exec, self.mode) {
            return Err(Trap::InstructionAccessFault(pc));
        }
        let low = mem
            .fetch16(pa)
            .map_err(|_| Trap::InstructionAccessFault(pc))?;
        if low & 0x3 != 0x3 {
            if !self.rvc {
                return Err(Trap::IllegalInstruction(low as u64));
            }
            let insn = decoder::expand_compressed(low, self.xlen)?;
            return Ok((insn, low as u32, 2));
        }
        let pc_hi = pc.wrapping_add(2);
        let pa_hi = self.translate_fetch(mem, pc_hi)?;
        if !self.pmp_check(pa_hi, 2, PmpAccess::Exec, self.mode) {
            return Err(Trap::InstructionAccessFault(pc_hi));
        }
        let high = mem
            .fetch16(pa_hi)
            .map_err(|_| Trap::InstructionAccessFault(pc_hi))?;
        let word = (low as u32) | ((high as u32) << 16);
        Ok((word, word, 4))
    }

    /// Jump/branch target alignment per the C-extension setting.
    pub(crate) fn check_target_alignment(&self, target: u64) -> Result<(), Trap> {
        let align = if self.rvc { 1 } else { 3 };
        if target & align != 0 {
            Err(Trap::InstructionAddressMisaligned(target))
        } else {
            Ok(())
        }
    }

    // --- The step loop ----------------------------------------------------

    fn begin_instruction(&mut self) {
        self.undo.clear();
        self.change = ChangeRecord::default();
        self.has_exception = false;
        self.csr_exception = false;
        self.trigger_tripped = false;
        self.trigger_debug_request = false;
        self.csrs.triggers.begin_instruction();
    }

    /// Periodic maintenance: timers tick and the CLINT mailboxes are folded
    /// into mip. Suspended while in debug mode.
    fn periodic_maintenance(&mut self) {
        if self.debug_mode {
            return;
        }
        self.cycle_count += 1;
        if self.alarm_interval != 0 && self.inst_counter >= self.alarm_limit {
            self.alarm_pending = true;
            self.alarm_limit = self.inst_counter + self.alarm_interval;
        }
        if let Some(clint) = &self.clint {
            clint.tick();
            let (soft, timer) = clint.pending(self.hart_ix);
            self.csrs.set_mip_bit(3, soft);
            self.csrs.set_mip_bit(7, timer || self.alarm_pending);
        } else if self.alarm_interval != 0 {
            self.csrs.set_mip_bit(7, self.alarm_pending);
        }
    }

    /// Execute exactly one instruction (or deliver one interrupt). Returns a
    /// stop event raised by this step, if any.
    pub fn single_step(&mut self, mem: &mut Memory) -> Option<StopEvent> {
        if !self.started {
            return None;
        }
        self.begin_instruction();
        self.periodic_maintenance();

        if !self.debug_mode {
            if self.nmi_pending {
                self.take_nmi();
                return None;
            }
            if let Some(interrupt) = self.pending_interrupt() {
                self.interrupt_count += 1;
                if matches!(interrupt, Trap::MachineTimerInterrupt) {
                    self.alarm_pending = false;
                }
                self.change.has_trap = true;
                self.change.trap_cause = interrupt.cause();
                self.take_trap(mem, &interrupt, self.pc, 0);
                return None;
            }
        }

        self.curr_pc = self.pc;
        self.last_mode = self.mode;

        let (insn, raw, len) = match self.fetch(mem) {
            Ok(f) => f,
            Err(trap) => {
                self.take_exception(mem, trap);
                return self.pending_stop.take();
            }
        };

        // Execute triggers, before timing.
        if let Some(action) = self.trigger_check(TriggerEvent::InstAddress, self.curr_pc) {
            let trap = self.trigger_trap(action, self.curr_pc);
            self.take_exception(mem, trap);
            return self.pending_stop.take();
        }
        if let Some(action) = self.trigger_check(TriggerEvent::InstOpcode, insn as u64) {
            let trap = self.trigger_trap(action, insn as u64);
            self.take_exception(mem, trap);
            return self.pending_stop.take();
        }

        let op = self.decode_cached(self.curr_pc, insn);
        self.last_insn_raw = raw;
        self.last_op = Some(op);

        match self.execute(mem, op, insn, len as u64) {
            Ok(next_pc) => {
                self.pc = next_pc.unwrap_or_else(|| self.curr_pc.wrapping_add(len as u64));
                // Execute triggers, after timing, then icount.
                let after = self
                    .trigger_check_after(TriggerEvent::InstAddress, self.curr_pc)
                    .or_else(|| self.trigger_check_after(TriggerEvent::InstOpcode, insn as u64))
                    .or_else(|| {
                        if self.enable_triggers && !self.debug_mode {
                            self.csrs.triggers.evaluate_icount(self.mode, self.xlen)
                        } else {
                            None
                        }
                    });
                match after {
                    Some(TriggerAction::RaiseBreak) => {
                        self.trigger_tripped = true;
                        self.pc = self.curr_pc;
                        self.take_exception(mem, Trap::Breakpoint(self.curr_pc));
                        return self.pending_stop.take();
                    }
                    Some(TriggerAction::EnterDebug) => {
                        self.trigger_tripped = true;
                        self.enter_debug_mode(DebugCause::Trigger, self.pc);
                    }
                    None => {}
                }
                self.retire();
            }
            Err(trap) => {
                self.take_exception(mem, trap);
            }
        }

        // A completed step in step mode lands back in debug mode.
        if self.debug_step_mode && !self.debug_mode {
            self.debug_step_mode = false;
            self.enter_debug_mode(DebugCause::Step, self.pc);
        }

        self.pending_stop.take()
    }

    fn retire(&mut self) {
        self.inst_counter += 1;
        self.retired_insts += 1;
        self.consecutive_illegal = 0;
        if self.enable_counters && !self.debug_mode {
            self.csrs.advance_counters();
        }
        self.change.new_pc = self.pc;
        if self.trace_sink.is_some() {
            self.emit_trace();
        }
    }

    fn emit_trace(&mut self) {
        let record = crate::trace::TraceRecord::from_hart(self);
        if let Some(sink) = &mut self.trace_sink {
            let _ = writeln!(sink, "{record}");
        }
    }

    pub(crate) fn trace_tag(&self) -> u64 {
        self.retired_insts
    }

    pub(crate) fn last_instruction(&self) -> (u32, Option<Op>) {
        (self.last_insn_raw, self.last_op)
    }

    pub(crate) fn set_pending_exit(&mut self, code: u64) {
        self.pending_stop = Some(StopEvent::Exit { code });
    }

    pub(crate) fn rvs(&self) -> bool {
        self.rvs
    }

    pub(crate) fn amo_in_dccm_only(&self) -> bool {
        self.amo_in_dccm_only
    }

    pub(crate) fn load_queue_enabled(&self) -> bool {
        self.load_queue_enabled
    }

    pub(crate) fn misal_atomic_access_fault(&self) -> bool {
        self.misal_atomic_is_access_fault
    }

    pub(crate) fn rvu(&self) -> bool {
        self.rvu
    }

    pub(crate) fn rvn(&self) -> bool {
        self.rvn
    }

    pub(crate) fn clint_handle(&self) -> Option<Arc<Clint>> {
        self.clint.clone()
    }

    pub(crate) fn note_csr_exception(&mut self) {
        self.csr_exception = true;
    }

    pub(crate) fn syscall_enabled(&self) -> bool {
        self.syscall.mode.is_some()
    }

    pub(crate) fn emulate_syscall(
        &mut self,
        mem: &mut Memory,
        num: u64,
        args: [u64; 4],
    ) -> crate::syscall::SyscallOutcome {
        let time = self.inst_counter;
        let console: Option<&mut (dyn Write + Send)> = match self.console.as_mut() {
            Some(sink) => Some(sink.as_mut()),
            None => None,
        };
        self.syscall.emulate(num, args, mem, console, time)
    }

    pub(crate) fn peek_mstatus(&self) -> u64 {
        self.csrs.peek(CSR_MSTATUS).unwrap_or(0)
    }

    /// Stage the current mstatus for rollback before an xRET mutates it.
    pub(crate) fn stage_csr_restore_point(&mut self) {
        let old = self.peek_mstatus();
        self.undo.push(UndoOp::Csr(CSR_MSTATUS, old));
    }

    pub(crate) fn commit_mstatus(&mut self, value: u64) {
        self.csrs.write_raw(CSR_MSTATUS, value);
        self.update_mstatus_cache();
        self.change.csrs.push((CSR_MSTATUS, value));
    }

    pub(crate) fn set_mode_internal(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Run until a stop condition: a `tohost` store, an exit system call,
    /// the stop address, the retired-instruction limit, or a trap loop.
    pub fn run(&mut self, mem: &mut Memory) -> RunOutcome {
        loop {
            if let Some(outcome) = self.run_once(mem, None) {
                return outcome;
            }
        }
    }

    /// Run until `target` is reached (or another stop condition fires).
    pub fn until_address(&mut self, mem: &mut Memory, target: u64) -> RunOutcome {
        loop {
            if let Some(outcome) = self.run_once(mem, Some(target)) {
                return outcome;
            }
        }
    }

    fn run_once(&mut self, mem: &mut Memory, target: Option<u64>) -> Option<RunOutcome> {
        if let Some(event) = self.single_step(mem) {
            return Some(match event {
                StopEvent::Stop { addr, value } => RunOutcome::Stopped { addr, value },
                StopEvent::Exit { code } => RunOutcome::Exited { code },
            });
        }
        if Some(self.pc) == target {
            return Some(RunOutcome::TargetReached { pc: self.pc });
        }
        if Some(self.pc) == self.stop_addr {
            return Some(RunOutcome::Stopped {
                addr: self.pc,
                value: 0,
            });
        }
        if self.consecutive_illegal >= TRAP_LOOP_LIMIT {
            return Some(RunOutcome::TrapLoop { pc: self.pc });
        }
        if self.inst_counter >= self.inst_count_limit {
            return Some(RunOutcome::LimitReached { pc: self.pc });
        }
        None
    }

    /// Request a halt into debug mode from the external debugger.
    pub fn request_halt(&mut self) {
        if !self.debug_mode {
            self.enter_debug_mode(DebugCause::HaltRequest, self.pc);
        }
    }

    /// Execute `insn` as if it were fetched at `pc`, record the changes it
    /// would make, then unwind everything. No architectural state commits.
    pub fn what_if_single_step(
        &mut self,
        mem: &mut Memory,
        pc: u64,
        insn: u32,
        record: &mut ChangeRecord,
    ) -> bool {
        let saved_pc = self.pc;
        let saved_curr = self.curr_pc;
        let saved_mode = self.mode;
        let saved_reservation = mem.reservation(self.hart_ix);
        let store_queue_len = self.store_queue.len();

        self.begin_instruction();
        self.curr_pc = pc;
        let op = decoder::decode(insn);
        let ok = match self.execute(mem, op, insn, 4) {
            Ok(next) => {
                self.change.new_pc = next.unwrap_or(pc.wrapping_add(4));
                true
            }
            Err(trap) => {
                self.change.has_trap = true;
                self.change.trap_cause = trap.cause();
                false
            }
        };
        *record = self.change.clone();

        self.rollback(mem);
        self.store_queue.truncate(store_queue_len);
        mem.restore_reservation(self.hart_ix, saved_reservation);
        self.mode = saved_mode;
        self.pc = saved_pc;
        self.curr_pc = saved_curr;
        self.pending_stop = None;
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::{CSR_DCSR, CSR_MCAUSE, CSR_MEPC, CSR_MIE, CSR_MIP, CSR_MSTATUS, CSR_MTVEC};

    const RESET_PC: u64 = 0x8000_0000;

    fn setup() -> (Hart, Memory) {
        let mut mem = Memory::with_ram(1, RESET_PC, 0x1_0000);
        let mut hart = Hart::new(0, Xlen::Rv64);
        hart.set_reset_pc(RESET_PC);
        hart.reset(&mut mem, false);
        assert!(hart.poke_csr(CSR_MTVEC, RESET_PC + 0x100));
        (hart, mem)
    }

    fn nop() -> u32 {
        0x0000_0013
    }

    #[test]
    fn interrupt_priority_mei_before_msi_before_mti() {
        let (mut hart, mut mem) = setup();
        mem.poke(RESET_PC, 4, nop() as u64);
        hart.poke_csr(CSR_MIE, (1 << 3) | (1 << 7) | (1 << 11));
        hart.poke_csr(CSR_MIP, (1 << 3) | (1 << 7) | (1 << 11));
        let mstatus = hart.peek_csr(CSR_MSTATUS).unwrap() | (1 << 3);
        hart.poke_csr(CSR_MSTATUS, mstatus);
        hart.single_step(&mut mem);
        assert_eq!(hart.peek_csr(CSR_MCAUSE), Some((1 << 63) | 11));
        // Clear MEIP: next delivery is the software interrupt.
        hart.poke_csr(CSR_MIP, (1 << 3) | (1 << 7));
        let mstatus = hart.peek_csr(CSR_MSTATUS).unwrap() | (1 << 3);
        hart.poke_csr(CSR_MSTATUS, mstatus);
        hart.single_step(&mut mem);
        assert_eq!(hart.peek_csr(CSR_MCAUSE), Some((1 << 63) | 3));
        hart.poke_csr(CSR_MIP, 1 << 7);
        let mstatus = hart.peek_csr(CSR_MSTATUS).unwrap() | (1 << 3);
        hart.poke_csr(CSR_MSTATUS, mstatus);
        hart.single_step(&mut mem);
        assert_eq!(hart.peek_csr(CSR_MCAUSE), Some((1 << 63) | 7));
    }

    #[test]
    fn interrupts_masked_when_mie_clear_in_machine_mode() {
        let (mut hart, mut mem) = setup();
        mem.poke(RESET_PC, 4, nop() as u64);
        hart.poke_csr(CSR_MIE, 1 << 3);
        hart.poke_csr(CSR_MIP, 1 << 3);
        // mstatus.MIE stays 0.
        assert!(!hart.is_interrupt_possible());
        hart.single_step(&mut mem);
        // The nop retired instead of an interrupt being delivered.
        assert_eq!(hart.retired_instruction_count(), 1);
        assert_eq!(hart.pc(), RESET_PC + 4);
    }

    #[test]
    fn mret_restores_interrupt_enable_and_pc() {
        let (mut hart, mut mem) = setup();
        // Take an ECALL, then MRET from the handler.
        let mstatus = hart.peek_csr(CSR_MSTATUS).unwrap() | (1 << 3);
        hart.poke_csr(CSR_MSTATUS, mstatus);
        mem.poke(RESET_PC, 4, 0x0000_0073);
        mem.poke(RESET_PC + 0x100, 4, 0x3020_0073);
        hart.single_step(&mut mem);
        assert_eq!(hart.peek_csr(CSR_MEPC), Some(RESET_PC));
        assert_eq!(hart.peek_csr(CSR_MSTATUS).unwrap() >> 3 & 1, 0);
        hart.single_step(&mut mem);
        // Back at the ECALL with MIE restored from MPIE.
        assert_eq!(hart.pc(), RESET_PC);
        assert_eq!(hart.peek_csr(CSR_MSTATUS).unwrap() >> 3 & 1, 1);
    }

    #[test]
    fn nmi_overrides_pending_interrupts() {
        let (mut hart, mut mem) = setup();
        hart.set_nmi_pc(RESET_PC + 0x200);
        hart.poke_csr(CSR_MIE, 1 << 11);
        hart.poke_csr(CSR_MIP, 1 << 11);
        let mstatus = hart.peek_csr(CSR_MSTATUS).unwrap() | (1 << 3);
        hart.poke_csr(CSR_MSTATUS, mstatus);
        hart.post_nmi(5);
        hart.single_step(&mut mem);
        assert_eq!(hart.pc(), RESET_PC + 0x200);
        assert_eq!(hart.peek_csr(CSR_MCAUSE), Some((1 << 63) | 5));
        assert_eq!(hart.peek_csr(CSR_MEPC), Some(RESET_PC));
    }

    #[test]
    fn ebreak_enters_debug_mode_when_dcsr_allows() {
        let (mut hart, mut mem) = setup();
        let dcsr = hart.peek_csr(CSR_DCSR).unwrap() | (1 << 15);
        hart.poke_csr(CSR_DCSR, dcsr);
        hart.set_debug_rom_address(RESET_PC + 0x800);
        mem.poke(RESET_PC, 4, 0x0010_0073);
        hart.single_step(&mut mem);
        assert!(hart.in_debug_mode());
        assert_eq!(hart.pc(), RESET_PC + 0x800);
        assert_eq!(hart.peek_csr(crate::csr::CSR_DPC), Some(RESET_PC));
        // dcsr.cause records the ebreak entry.
        assert_eq!(hart.peek_csr(CSR_DCSR).unwrap() >> 6 & 0b111, 1);
    }

    #[test]
    fn step_mode_returns_to_debug_after_one_instruction() {
        let (mut hart, mut mem) = setup();
        mem.poke(RESET_PC, 4, nop() as u64);
        hart.request_halt();
        assert!(hart.in_debug_mode());
        let dcsr = hart.peek_csr(CSR_DCSR).unwrap() | (1 << 2);
        hart.poke_csr(CSR_DCSR, dcsr);
        hart.exit_debug_mode();
        assert!(!hart.in_debug_mode());
        hart.single_step(&mut mem);
        // One instruction retired, then straight back into debug mode.
        assert_eq!(hart.retired_instruction_count(), 1);
        assert!(hart.in_debug_mode());
        assert_eq!(hart.peek_csr(crate::csr::CSR_DPC), Some(RESET_PC + 4));
    }

    #[test]
    fn load_queue_entries_bounded_and_removable() {
        let (mut hart, mut mem) = setup();
        hart.enable_bench_load_exceptions(true);
        hart.set_load_queue_size(2);
        // Three loads: the oldest entry is dropped.
        hart.poke_int_reg(1, RESET_PC + 0x1000);
        for i in 0..3u64 {
            let insn = (((8 * i as u32) & 0xFFF) << 20) | (1 << 15) | (3 << 12) | (5 << 7) | 0x03;
            mem.poke(RESET_PC + 4 * i, 4, insn as u64);
            hart.single_step(&mut mem);
        }
        assert_eq!(hart.load_queue_len(), 2);
        let (found, count) = hart.apply_load_finished(RESET_PC + 0x1008, 1);
        assert!(found);
        assert_eq!(count, 1);
        assert_eq!(hart.load_queue_len(), 1);
    }

    #[test]
    fn imprecise_load_exception_rolls_back_register() {
        let (mut hart, mut mem) = setup();
        hart.enable_bench_load_exceptions(true);
        hart.enable_load_error_rollback(true);
        mem.poke(RESET_PC + 0x1000, 8, 0x1234);
        hart.poke_int_reg(1, RESET_PC + 0x1000);
        hart.poke_int_reg(5, 0x77);
        // ld x5, 0(x1)
        let insn = (1 << 15) | (3 << 12) | (5 << 7) | 0x03;
        mem.poke(RESET_PC, 4, insn as u64);
        hart.single_step(&mut mem);
        assert_eq!(hart.peek_int_reg(5), Some(0x1234));
        let (found, count) = hart.apply_load_exception(&mut mem, RESET_PC + 0x1000, 0);
        assert!(found);
        assert_eq!(count, 1);
        // The destination reverted and the fault was delivered.
        assert_eq!(hart.peek_int_reg(5), Some(0x77));
        assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(5));
        assert_eq!(hart.peek_csr(crate::csr::CSR_MDSEAC), Some(RESET_PC + 0x1000));
    }

    #[test]
    fn imprecise_store_exception_matches_unique_address() {
        let (mut hart, mut mem) = setup();
        hart.enable_bench_load_exceptions(true);
        hart.enable_store_error_rollback(true);
        hart.poke_int_reg(1, RESET_PC + 0x2000);
        hart.poke_int_reg(2, 0xBEEF);
        // sd x2, 0(x1)
        let insn = (2 << 20) | (1 << 15) | (3 << 12) | 0x23;
        mem.poke(RESET_PC, 4, insn as u64);
        hart.single_step(&mut mem);
        assert_eq!(mem.peek(RESET_PC + 0x2000, 8), Some(0xBEEF));
        let (found, count) = hart.apply_store_exception(&mut mem, RESET_PC + 0x2000);
        assert!(found);
        assert_eq!(count, 1);
        // Rollback restored the previous memory contents.
        assert_eq!(mem.peek(RESET_PC + 0x2000, 8), Some(0));
        assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(7));
        // No match a second time.
        let (found, count) = hart.apply_store_exception(&mut mem, RESET_PC + 0x2000);
        assert!(!found);
        assert_eq!(count, 0);
    }
}

//! End-to-end scenarios: single instructions stepped from reset, trap
//! delivery, LR/SC across harts, paging faults, and snapshot round-trips.

use riscv_sim::csr::{
    CSR_FCSR, CSR_MCAUSE, CSR_MEDELEG, CSR_MEPC, CSR_MIE, CSR_MSTATUS, CSR_MTVAL, CSR_MTVEC,
    CSR_SATP, CSR_SCAUSE, CSR_SEPC, CSR_STVAL, CSR_STVEC,
};
use riscv_sim::hart::{Hart, RunOutcome};
use riscv_sim::memory::Memory;
use riscv_sim::syscall::SyscallMode;
use riscv_sim::system::System;
use riscv_sim::{Mode, Xlen};

const RESET_PC: u64 = 0x8000_0000;
const RAM_SIZE: usize = 0x10_0000;

fn encode_i(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (((imm as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn encode_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn encode_s(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    let imm11_5 = (imm >> 5) & 0x7F;
    let imm4_0 = imm & 0x1F;
    (imm11_5 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (imm4_0 << 7) | 0x23
}

fn encode_amo(funct5: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32) -> u32 {
    encode_r(funct5 << 2, rs2, rs1, funct3, rd, 0x2F)
}

fn encode_csr(csr: u32, rs1: u32, funct3: u32, rd: u32) -> u32 {
    (csr << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | 0x73
}

fn setup(xlen: Xlen) -> (Hart, Memory) {
    let mut mem = Memory::with_ram(1, RESET_PC, RAM_SIZE);
    let mut hart = Hart::new(0, xlen);
    hart.set_reset_pc(RESET_PC);
    hart.reset(&mut mem, false);
    (hart, mem)
}

fn write_program(mem: &mut Memory, insns: &[u32]) {
    for (i, insn) in insns.iter().enumerate() {
        mem.poke(RESET_PC + 4 * i as u64, 4, *insn as u64);
    }
}

#[test]
fn addi_x1_x0_7_from_reset() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    write_program(&mut mem, &[0x0070_0093]);
    assert_eq!(hart.peek_int_reg(1), Some(0));
    hart.single_step(&mut mem);
    assert_eq!(hart.pc(), 0x8000_0004);
    assert_eq!(hart.peek_int_reg(1), Some(7));
    assert_eq!(hart.peek_int_reg(0), Some(0));
}

#[test]
fn lui_addi_sign_extends_on_rv64() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    write_program(&mut mem, &[0xABCD_E137, 0xFFF1_0113]);
    hart.single_step(&mut mem);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_int_reg(2), Some(0xFFFF_FFFF_ABCD_DFFF));
}

#[test]
fn lui_addi_stays_32_bit_on_rv32() {
    let (mut hart, mut mem) = setup(Xlen::Rv32);
    write_program(&mut mem, &[0xABCD_E137, 0xFFF1_0113]);
    hart.single_step(&mut mem);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_int_reg(2), Some(0xABCD_DFFF));
}

#[test]
fn lr_sc_round_trip_single_hart() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    let addr = RESET_PC + 0x1000;
    mem.poke(addr, 4, 0x1111_1111);
    hart.poke_int_reg(1, addr);
    hart.poke_int_reg(2, 0x2222_2222);
    write_program(
        &mut mem,
        &[
            encode_amo(0b00010, 0, 1, 2, 3), // lr.w x3, (x1)
            encode_amo(0b00011, 2, 1, 2, 4), // sc.w x4, x2, (x1)
        ],
    );
    hart.single_step(&mut mem);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_int_reg(3), Some(0x1111_1111));
    assert_eq!(hart.peek_int_reg(4), Some(0));
    assert_eq!(mem.peek(addr, 4), Some(0x2222_2222));
}

#[test]
fn sc_fails_after_store_from_other_hart() {
    let mut sys = System::new(2, 1, Xlen::Rv64, Memory::with_ram(2, RESET_PC, RAM_SIZE));
    let addr = RESET_PC + 0x1000;
    sys.memory_mut().poke(addr, 4, 0x1111_1111);

    // Hart A: LR.W then SC.W; hart B: an ordinary store to the same line.
    let lr = encode_amo(0b00010, 0, 1, 2, 3);
    let sc = encode_amo(0b00011, 2, 1, 2, 4);
    let sw = encode_s(0, 2, 1, 2);
    {
        let (hart0, mem) = sys.hart_and_memory(0).unwrap();
        hart0.set_reset_pc(RESET_PC);
        hart0.reset(mem, false);
        hart0.poke_int_reg(1, addr);
        hart0.poke_int_reg(2, 0x2222_2222);
        mem.poke(RESET_PC, 4, lr as u64);
        mem.poke(RESET_PC + 4, 4, sc as u64);
        mem.poke(RESET_PC + 0x100, 4, sw as u64);
    }
    {
        let (hart1, mem) = sys.hart_and_memory(1).unwrap();
        hart1.set_reset_pc(RESET_PC + 0x100);
        hart1.reset(mem, false);
        hart1.poke_int_reg(1, addr);
        hart1.poke_int_reg(2, 0x3333_3333);
        hart1.set_started(true);
    }

    sys.step_hart(0); // LR
    // Start hart 1 through the shared gate, then let it store.
    sys.hart_mut(0).unwrap().poke_csr(riscv_sim::csr::CSR_MHARTSTART, 0b11);
    sys.step_hart(1); // SW invalidates the reservation
    sys.step_hart(0); // SC

    assert_eq!(sys.hart(0).unwrap().peek_int_reg(4), Some(1));
    assert_eq!(sys.memory().peek(addr, 4), Some(0x3333_3333));
}

#[test]
fn sc_fails_after_intervening_store_same_hart() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    let addr = RESET_PC + 0x1000;
    hart.poke_int_reg(1, addr);
    hart.poke_int_reg(2, 0x2222_2222);
    write_program(
        &mut mem,
        &[
            encode_amo(0b00010, 0, 1, 2, 3), // lr.w
            encode_s(4, 2, 1, 2),            // sw x2, 4(x1) - same line
            encode_amo(0b00011, 2, 1, 2, 4), // sc.w
        ],
    );
    for _ in 0..3 {
        hart.single_step(&mut mem);
    }
    assert_eq!(hart.peek_int_reg(4), Some(1));
    // The SC wrote nothing.
    assert_eq!(mem.peek(addr, 4), Some(0));
}

#[test]
fn ecall_from_machine_mode() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.poke_csr(CSR_MTVEC, 0x8000_4000);
    // MIE set so we can observe MPIE capture it.
    hart.poke_csr(CSR_MSTATUS, 0x1800 | (1 << 3));
    write_program(&mut mem, &[0x0000_0073]);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(11));
    assert_eq!(hart.peek_csr(CSR_MEPC), Some(RESET_PC));
    let mstatus = hart.peek_csr(CSR_MSTATUS).unwrap();
    assert_eq!(mstatus >> 7 & 1, 1); // MPIE <= old MIE
    assert_eq!(mstatus >> 3 & 1, 0); // MIE cleared
    assert_eq!(hart.pc(), 0x8000_4000);
}

#[test]
fn ecall_cause_per_privilege_level() {
    for (mode, cause) in [
        (Mode::User, 8u64),
        (Mode::Supervisor, 9),
        (Mode::Machine, 11),
    ] {
        let (mut hart, mut mem) = setup(Xlen::Rv64);
        hart.enable_extension('s', true);
        hart.enable_extension('u', true);
        hart.poke_csr(CSR_MTVEC, 0x8000_4000);
        hart.set_privilege_mode(mode);
        write_program(&mut mem, &[0x0000_0073]);
        hart.single_step(&mut mem);
        assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(cause));
        // Traps land in machine mode without delegation.
        assert_eq!(hart.privilege_mode(), Mode::Machine);
    }
}

#[test]
fn load_page_fault_delegated_to_supervisor() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.enable_extension('s', true);
    hart.enable_extension('u', true);

    // Sv39 table mapping the code page VA=PA with R+X; everything else
    // invalid. Root at RESET_PC + 0x10000.
    let root = RESET_PC + 0x1_0000;
    let l1 = root + 0x1000;
    let l0 = root + 0x2000;
    let vpn2 = (RESET_PC >> 30) & 0x1FF;
    mem.poke(root + vpn2 * 8, 8, ((l1 >> 12) << 10) | 1);
    mem.poke(l1, 8, ((l0 >> 12) << 10) | 1);
    // Leaf: V|R|X|A for the code page.
    mem.poke(l0, 8, ((RESET_PC >> 12) << 10) | (1 << 6) | 0b1011 | 0);

    hart.poke_csr(CSR_SATP, (8 << 60) | (root >> 12));
    hart.poke_csr(CSR_MEDELEG, 1 << 13);
    hart.poke_csr(CSR_STVEC, RESET_PC + 0x40);
    hart.set_privilege_mode(Mode::Supervisor);

    // LW x5, 0(x1) with x1 pointing at an unmapped VA.
    let va = 0x4000_0000u64;
    hart.poke_int_reg(1, va);
    hart.poke_int_reg(5, 0xAAAA);
    write_program(&mut mem, &[encode_i(0, 1, 2, 5, 0x03)]);
    hart.single_step(&mut mem);

    assert_eq!(hart.peek_csr(CSR_SCAUSE), Some(13));
    assert_eq!(hart.peek_csr(CSR_STVAL), Some(va));
    assert_eq!(hart.peek_csr(CSR_SEPC), Some(RESET_PC));
    assert_eq!(hart.peek_int_reg(5), Some(0xAAAA));
    assert_eq!(hart.privilege_mode(), Mode::Supervisor);
    assert_eq!(hart.pc(), RESET_PC + 0x40);
}

#[test]
fn x0_stays_zero() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    // ADDI x0, x0, 123 retires but writes nothing.
    write_program(&mut mem, &[encode_i(123, 0, 0, 0, 0x13)]);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_int_reg(0), Some(0));
    assert!(!hart.poke_int_reg(0, 5));
    assert_eq!(hart.peek_int_reg(0), Some(0));
}

#[test]
fn nan_box_invariant_after_single_precision_write() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.enable_extension('f', true);
    hart.enable_extension('d', true);
    // mstatus.FS on.
    let mstatus = hart.peek_csr(CSR_MSTATUS).unwrap() | (1 << 13);
    hart.poke_csr(CSR_MSTATUS, mstatus);
    hart.poke_int_reg(1, 0x4049_0FDB); // pi as f32 bits
    // fmv.w.x f2, x1
    write_program(&mut mem, &[encode_r(0x78, 0, 1, 0, 2, 0x53)]);
    hart.single_step(&mut mem);
    let f2 = hart.peek_fp_reg(2).unwrap();
    assert_eq!(f2 >> 32, 0xFFFF_FFFF);
    assert_eq!(f2 as u32, 0x4049_0FDB);
    // FS marked dirty.
    assert_eq!(hart.peek_csr(CSR_MSTATUS).unwrap() >> 13 & 3, 3);
}

#[test]
fn fp_dyn_rounding_with_frm_7_is_illegal() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.enable_extension('f', true);
    let mstatus = hart.peek_csr(CSR_MSTATUS).unwrap() | (1 << 13);
    hart.poke_csr(CSR_MSTATUS, mstatus);
    hart.poke_csr(CSR_FCSR, 0b111 << 5);
    hart.poke_csr(CSR_MTVEC, 0x8000_4000);
    // fadd.s f1, f2, f3 with rm=DYN(7)
    write_program(&mut mem, &[encode_r(0x00, 3, 2, 7, 1, 0x53)]);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(2));
}

#[test]
fn csrrw_to_read_only_rolls_back_rd() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.poke_csr(CSR_MTVEC, 0x8000_4000);
    hart.poke_int_reg(5, 0xDEAD);
    // csrrw x5, mhartid, x6 - mhartid is read-only.
    write_program(&mut mem, &[encode_csr(0xF14, 6, 1, 5)]);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(2));
    assert_eq!(hart.peek_int_reg(5), Some(0xDEAD));
    assert_eq!(hart.pc(), 0x8000_4000);
}

#[test]
fn misaligned_fetch_without_c_extension() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.enable_extension('c', false);
    hart.poke_csr(CSR_MTVEC, 0x8000_4000);
    hart.set_pc(RESET_PC + 2);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(0));
    assert_eq!(hart.peek_csr(CSR_MTVAL), Some(RESET_PC + 2));
}

#[test]
fn load_crossing_into_unmapped_page_faults() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.poke_csr(CSR_MTVEC, 0x8000_4000);
    // LH at the very last byte of RAM straddles the region end.
    let last = RESET_PC + RAM_SIZE as u64 - 1;
    hart.poke_int_reg(1, last);
    write_program(&mut mem, &[encode_i(0, 1, 1, 5, 0x03)]);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(5));
    assert_eq!(hart.peek_csr(CSR_MTVAL), Some(last));
}

#[test]
fn misaligned_amo_cause_selection() {
    for (access_fault, cause) in [(true, 7u64), (false, 6)] {
        let (mut hart, mut mem) = setup(Xlen::Rv64);
        hart.poke_csr(CSR_MTVEC, 0x8000_4000);
        hart.misaligned_atomic_causes_access_fault(access_fault);
        hart.poke_int_reg(1, RESET_PC + 0x1002);
        // amoadd.w x3, x2, (x1)
        write_program(&mut mem, &[encode_amo(0b00000, 2, 1, 2, 3)]);
        hart.single_step(&mut mem);
        assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(cause));
    }
}

#[test]
fn wfi_retires_as_nop_with_interrupts_disabled() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    write_program(&mut mem, &[0x1050_0073]);
    hart.single_step(&mut mem);
    assert_eq!(hart.pc(), RESET_PC + 4);
    assert_eq!(hart.retired_instruction_count(), 1);
}

#[test]
fn rvc_expansion_matches_expanded_execution() {
    // c.addi x11, 1 (0x0585) against its 32-bit expansion.
    let (mut hart_c, mut mem_c) = setup(Xlen::Rv64);
    hart_c.poke_int_reg(11, 41);
    mem_c.poke(RESET_PC, 2, 0x0585);
    hart_c.single_step(&mut mem_c);

    let (mut hart_w, mut mem_w) = setup(Xlen::Rv64);
    hart_w.poke_int_reg(11, 41);
    write_program(&mut mem_w, &[encode_i(1, 11, 0, 11, 0x13)]);
    hart_w.single_step(&mut mem_w);

    assert_eq!(hart_c.peek_int_reg(11), hart_w.peek_int_reg(11));
    assert_eq!(hart_c.pc(), RESET_PC + 2);
    assert_eq!(hart_w.pc(), RESET_PC + 4);
}

#[test]
fn store_to_tohost_stops_run() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    let tohost = RESET_PC + 0x2000;
    hart.set_tohost_address(tohost);
    hart.poke_int_reg(1, tohost);
    hart.poke_int_reg(2, 0x5555);
    write_program(&mut mem, &[encode_s(0, 2, 1, 3)]);
    let outcome = hart.run(&mut mem);
    assert_eq!(
        outcome,
        RunOutcome::Stopped {
            addr: tohost,
            value: 0x5555
        }
    );
}

#[test]
fn exit_ecall_stops_run_with_code() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.set_syscall_mode(Some(SyscallMode::Newlib));
    hart.poke_int_reg(17, 93); // a7 = exit
    hart.poke_int_reg(10, 7); // a0 = code
    write_program(&mut mem, &[0x0000_0073]);
    let outcome = hart.run(&mut mem);
    assert_eq!(outcome, RunOutcome::Exited { code: 7 });
}

#[test]
fn instruction_limit_reached() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.set_instruction_count_limit(3);
    // A jump to itself spins forever; the limit terminates the run.
    mem.poke(RESET_PC, 4, 0x0000_006F);
    let outcome = hart.run(&mut mem);
    assert!(matches!(outcome, RunOutcome::LimitReached { .. }));
}

#[test]
fn repeated_illegal_instructions_report_trap_loop() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    // Trap vector points at an illegal instruction word (all zeros region).
    hart.poke_csr(CSR_MTVEC, RESET_PC + 0x100);
    mem.poke(RESET_PC, 4, 0);
    let outcome = hart.run(&mut mem);
    assert!(matches!(outcome, RunOutcome::TrapLoop { .. }));
}

#[test]
fn until_address_reports_target() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    write_program(
        &mut mem,
        &[encode_i(1, 0, 0, 1, 0x13), encode_i(2, 0, 0, 2, 0x13)],
    );
    let outcome = hart.until_address(&mut mem, RESET_PC + 8);
    assert_eq!(outcome, RunOutcome::TargetReached { pc: RESET_PC + 8 });
    assert_eq!(hart.peek_int_reg(2), Some(2));
}

#[test]
fn clint_msip_mailbox_raises_software_interrupt() {
    let mut sys = System::new(1, 1, Xlen::Rv64, Memory::with_ram(1, RESET_PC, RAM_SIZE));
    sys.clint().set_window(0x0200_0000, 0x0201_0000);
    {
        let (hart, mem) = sys.hart_and_memory(0).unwrap();
        hart.set_reset_pc(RESET_PC);
        hart.reset(mem, false);
        hart.poke_csr(CSR_MTVEC, RESET_PC + 0x100);
        hart.poke_csr(CSR_MIE, 1 << 3);
        let mstatus = hart.peek_csr(CSR_MSTATUS).unwrap() | (1 << 3);
        hart.poke_csr(CSR_MSTATUS, mstatus);
        write_program(mem, &[encode_i(0, 0, 0, 0, 0x13); 1]);
    }
    // Post the software interrupt through the mailbox, then step.
    sys.clint().store(0x0200_0000, 4, 1);
    sys.step_hart(0);
    let hart = sys.hart(0).unwrap();
    let cause = hart.peek_csr(CSR_MCAUSE).unwrap();
    assert_eq!(cause, (1 << 63) | 3);
    assert_eq!(hart.pc(), RESET_PC + 0x100);
}

#[test]
fn alarm_interval_raises_timer_interrupt() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.poke_csr(CSR_MTVEC, RESET_PC + 0x100);
    hart.poke_csr(CSR_MIE, 1 << 7);
    let mstatus = hart.peek_csr(CSR_MSTATUS).unwrap() | (1 << 3);
    hart.poke_csr(CSR_MSTATUS, mstatus);
    hart.set_alarm_interval(2);
    for i in 0..16 {
        mem.poke(RESET_PC + 4 * i, 4, encode_i(0, 0, 0, 0, 0x13) as u64);
    }
    let mut took_interrupt = false;
    for _ in 0..8 {
        hart.single_step(&mut mem);
        if hart.peek_csr(CSR_MCAUSE) == Some((1 << 63) | 7) {
            took_interrupt = true;
            break;
        }
    }
    assert!(took_interrupt);
    assert_eq!(hart.pc(), RESET_PC + 0x100);
}

#[test]
fn load_address_trigger_raises_breakpoint() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.poke_csr(CSR_MTVEC, RESET_PC + 0x100);
    let watch = RESET_PC + 0x3000;
    // mcontrol trigger: type=2, load bit, m bit, exact match.
    let data1 = (2u64 << 60) | (1 << 6) | 1;
    assert!(hart.poke_trigger(0, data1, watch, 0));
    hart.poke_int_reg(1, watch);
    hart.poke_int_reg(5, 0x77);
    write_program(&mut mem, &[encode_i(0, 1, 2, 5, 0x03)]);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(3));
    // The load never reached the register file.
    assert_eq!(hart.peek_int_reg(5), Some(0x77));
}

#[test]
fn decode_cache_refills_after_overwrite() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    // Execute ADDI x1,x0,1; loop back to the same PC with JAL; by then the
    // first slot has been overwritten with ADDI x1,x0,2.
    write_program(
        &mut mem,
        &[
            encode_i(1, 0, 0, 1, 0x13),
            encode_s(0, 2, 3, 2), // sw x2, 0(x3): overwrite slot 0
            0x0000_0000,          // placeholder, replaced below
        ],
    );
    hart.poke_int_reg(3, RESET_PC);
    hart.poke_int_reg(2, encode_i(2, 0, 0, 1, 0x13) as u64);
    // jal x0, -8 back to RESET_PC
    let jal_back = {
        let imm = -8i32;
        let imm20 = ((imm >> 20) & 1) as u32;
        let imm10_1 = ((imm >> 1) & 0x3FF) as u32;
        let imm11 = ((imm >> 11) & 1) as u32;
        let imm19_12 = ((imm >> 12) & 0xFF) as u32;
        (imm20 << 31) | (imm19_12 << 12) | (imm11 << 20) | (imm10_1 << 21) | 0x6F
    };
    mem.poke(RESET_PC + 8, 4, jal_back as u64);

    hart.single_step(&mut mem); // addi 1
    assert_eq!(hart.peek_int_reg(1), Some(1));
    hart.single_step(&mut mem); // sw overwrites slot 0
    hart.single_step(&mut mem); // jal back
    hart.single_step(&mut mem); // re-fetch: new addi
    assert_eq!(hart.peek_int_reg(1), Some(2));
}

#[test]
fn snapshot_round_trip_reproduces_state() {
    let dir = tempfile::tempdir().unwrap();
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.poke_int_reg(31, RESET_PC + 0x2000);
    write_program(
        &mut mem,
        &[
            encode_i(5, 0, 0, 1, 0x13),    // addi x1, x0, 5
            encode_r(0, 1, 1, 0, 2, 0x33), // add x2, x1, x1
            encode_s(0, 2, 31, 2),         // sw x2, 0(x31)
            encode_i(9, 0, 0, 4, 0x13),    // addi x4, x0, 9
        ],
    );
    hart.single_step(&mut mem);
    hart.single_step(&mut mem);
    hart.single_step(&mut mem);

    hart.save_snapshot(&mem, dir.path()).unwrap();

    let mut mem2 = Memory::with_ram(1, RESET_PC, RAM_SIZE);
    let mut hart2 = Hart::new(0, Xlen::Rv64);
    hart2.set_reset_pc(RESET_PC);
    hart2.reset(&mut mem2, false);
    hart2.load_snapshot(&mut mem2, dir.path()).unwrap();

    assert_eq!(hart2.pc(), hart.pc());
    assert_eq!(hart2.peek_int_reg(1), hart.peek_int_reg(1));
    assert_eq!(hart2.peek_int_reg(2), hart.peek_int_reg(2));
    assert_eq!(mem2.peek(RESET_PC + 0x2000, 4), Some(10));

    // Both continue identically.
    hart.single_step(&mut mem);
    hart2.single_step(&mut mem2);
    assert_eq!(hart2.pc(), hart.pc());
    assert_eq!(hart2.peek_int_reg(4), hart.peek_int_reg(4));
}

#[test]
fn what_if_single_step_commits_nothing() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    let mut record = riscv_sim::hart::ChangeRecord::default();
    let insn = encode_i(42, 0, 0, 6, 0x13); // addi x6, x0, 42
    let ok = hart.what_if_single_step(&mut mem, RESET_PC, insn, &mut record);
    assert!(ok);
    assert_eq!(record.int_reg, Some((6, 42)));
    assert_eq!(record.new_pc, RESET_PC + 4);
    assert_eq!(hart.peek_int_reg(6), Some(0));
    assert_eq!(hart.pc(), RESET_PC);
}

#[test]
fn precise_trap_preserves_memory_and_registers() {
    let (mut hart, mut mem) = setup(Xlen::Rv64);
    hart.poke_csr(CSR_MTVEC, RESET_PC + 0x100);
    // Store to an unmapped address: nothing commits except trap CSRs.
    hart.poke_int_reg(1, 0x10);
    hart.poke_int_reg(2, 0x99);
    let before_x2 = hart.peek_int_reg(2);
    write_program(&mut mem, &[encode_s(0, 2, 1, 3)]);
    hart.single_step(&mut mem);
    assert_eq!(hart.peek_csr(CSR_MCAUSE), Some(7));
    assert_eq!(hart.peek_csr(CSR_MTVAL), Some(0x10));
    assert_eq!(hart.peek_int_reg(2), before_x2);
    assert_eq!(hart.retired_instruction_count(), 0);
}

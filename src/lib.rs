pub mod clint;
pub mod csr;
pub mod decoder;
pub mod hart;
pub mod memory;
pub mod mmu;
pub mod pmp;
pub mod snapshot;
pub mod syscall;
pub mod system;
pub mod trace;
pub mod triggers;

use serde::{Deserialize, Serialize};

pub use hart::{Hart, RunOutcome, StopEvent};
pub use memory::{Memory, MemoryError, Pma};
pub use system::System;

/// Base integer register width of a hart.
///
/// Registers are stored as `u64` regardless; this selector governs every
/// width-dependent contract: shift-amount masks, sign extension of 32-bit
/// results, rejection of RV64-only encodings, and SATP mode decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    /// Register width in bits.
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// Mask applied to register-sourced shift amounts (0x1F or 0x3F).
    pub fn shift_mask(self) -> u64 {
        match self {
            Xlen::Rv32 => 0x1F,
            Xlen::Rv64 => 0x3F,
        }
    }

    /// Truncate a value to the register width, sign-extending into the upper
    /// bits of the u64 carrier so signed comparisons keep working.
    pub fn canonicalize(self, value: u64) -> u64 {
        match self {
            Xlen::Rv32 => value as u32 as i32 as i64 as u64,
            Xlen::Rv64 => value,
        }
    }

    /// The value as seen by an MXLEN-bit CSR read.
    pub fn csr_view(self, value: u64) -> u64 {
        match self {
            Xlen::Rv32 => value & 0xFFFF_FFFF,
            Xlen::Rv64 => value,
        }
    }

    /// Truncate a register value to a physical/virtual address of the base
    /// width. Addresses are unsigned: the RV32 form zero-extends.
    pub fn mask_address(self, value: u64) -> u64 {
        match self {
            Xlen::Rv32 => value as u32 as u64,
            Xlen::Rv64 => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mode {
    User,
    Supervisor,
    Machine,
}

impl Mode {
    /// Encode privilege mode into the MPP/SPP field encoding.
    pub fn to_mpp(self) -> u64 {
        match self {
            Mode::User => 0b00,
            Mode::Supervisor => 0b01,
            Mode::Machine => 0b11,
        }
    }

    /// Decode MPP/SPP field into a privilege mode.
    pub fn from_mpp(bits: u64) -> Mode {
        match bits & 0b11 {
            0b00 => Mode::User,
            0b01 => Mode::Supervisor,
            // 0b10 is reserved; treat as Machine for WARL coercion.
            _ => Mode::Machine,
        }
    }

    /// Numeric privilege level used in CSR access bounds checks.
    pub fn privilege_level(self) -> u16 {
        match self {
            Mode::User => 0,
            Mode::Supervisor => 1,
            Mode::Machine => 3,
        }
    }
}

/// Architectural trap: synchronous exceptions and asynchronous interrupts.
///
/// These are modeled outcomes, never engine errors. Payloads carry the value
/// destined for `xtval` (faulting address, or offending instruction bits for
/// illegal-instruction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Trap {
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    IllegalInstruction(u64),
    Breakpoint(u64),
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAddressMisaligned(u64),
    StoreAccessFault(u64),
    EnvironmentCallFromU,
    EnvironmentCallFromS,
    EnvironmentCallFromM,
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StorePageFault(u64),

    SupervisorSoftwareInterrupt,
    MachineSoftwareInterrupt,
    SupervisorTimerInterrupt,
    MachineTimerInterrupt,
    SupervisorExternalInterrupt,
    MachineExternalInterrupt,
}

impl Trap {
    /// True for the asynchronous (interrupt) variants.
    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            Trap::SupervisorSoftwareInterrupt
                | Trap::MachineSoftwareInterrupt
                | Trap::SupervisorTimerInterrupt
                | Trap::MachineTimerInterrupt
                | Trap::SupervisorExternalInterrupt
                | Trap::MachineExternalInterrupt
        )
    }

    /// Cause number written to the low bits of `xcause`.
    pub fn cause(&self) -> u64 {
        match self {
            Trap::InstructionAddressMisaligned(_) => 0,
            Trap::InstructionAccessFault(_) => 1,
            Trap::IllegalInstruction(_) => 2,
            Trap::Breakpoint(_) => 3,
            Trap::LoadAddressMisaligned(_) => 4,
            Trap::LoadAccessFault(_) => 5,
            Trap::StoreAddressMisaligned(_) => 6,
            Trap::StoreAccessFault(_) => 7,
            Trap::EnvironmentCallFromU => 8,
            Trap::EnvironmentCallFromS => 9,
            Trap::EnvironmentCallFromM => 11,
            Trap::InstructionPageFault(_) => 12,
            Trap::LoadPageFault(_) => 13,
            Trap::StorePageFault(_) => 15,

            Trap::SupervisorSoftwareInterrupt => 1,
            Trap::MachineSoftwareInterrupt => 3,
            Trap::SupervisorTimerInterrupt => 5,
            Trap::MachineTimerInterrupt => 7,
            Trap::SupervisorExternalInterrupt => 9,
            Trap::MachineExternalInterrupt => 11,
        }
    }

    /// Value written to `xtval` on delivery.
    pub fn tval(&self) -> u64 {
        match *self {
            Trap::InstructionAddressMisaligned(v)
            | Trap::InstructionAccessFault(v)
            | Trap::IllegalInstruction(v)
            | Trap::Breakpoint(v)
            | Trap::LoadAddressMisaligned(v)
            | Trap::LoadAccessFault(v)
            | Trap::StoreAddressMisaligned(v)
            | Trap::StoreAccessFault(v)
            | Trap::InstructionPageFault(v)
            | Trap::LoadPageFault(v)
            | Trap::StorePageFault(v) => v,
            _ => 0,
        }
    }
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Trap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_mpp_round_trip() {
        for mode in [Mode::User, Mode::Supervisor, Mode::Machine] {
            assert_eq!(Mode::from_mpp(mode.to_mpp()), mode);
        }
        // Reserved encoding coerces to Machine.
        assert_eq!(Mode::from_mpp(0b10), Mode::Machine);
    }

    #[test]
    fn trap_cause_numbers_match_privileged_spec() {
        assert_eq!(Trap::IllegalInstruction(0).cause(), 2);
        assert_eq!(Trap::EnvironmentCallFromM.cause(), 11);
        assert_eq!(Trap::LoadPageFault(0).cause(), 13);
        assert_eq!(Trap::MachineTimerInterrupt.cause(), 7);
        assert!(Trap::MachineTimerInterrupt.is_interrupt());
        assert!(!Trap::Breakpoint(0).is_interrupt());
    }

    #[test]
    fn xlen_canonicalize_sign_extends_on_rv32() {
        assert_eq!(Xlen::Rv32.canonicalize(0xABCD_DFFF), 0xFFFF_FFFF_ABCD_DFFF);
        assert_eq!(Xlen::Rv64.canonicalize(0xABCD_DFFF), 0xABCD_DFFF);
        assert_eq!(Xlen::Rv32.shift_mask(), 0x1F);
        assert_eq!(Xlen::Rv64.shift_mask(), 0x3F);
    }
}

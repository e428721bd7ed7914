//! Virtual memory: Sv32/Sv39/Sv48 page-table walker and a direct-mapped TLB.

use crate::memory::Memory;
use crate::{Mode, Trap, Xlen};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessType {
    Instruction,
    Load,
    Store,
}

const PAGE_SIZE: u64 = 4096;
const MAX_LEVELS: usize = 4;

/// TLB size (power of 2 for fast modulo)
const TLB_SIZE: usize = 64;
const TLB_MASK: usize = TLB_SIZE - 1;

pub const PERM_R: u8 = 1 << 0;
pub const PERM_W: u8 = 1 << 1;
pub const PERM_X: u8 = 1 << 2;
pub const PERM_U: u8 = 1 << 3;
pub const PERM_A: u8 = 1 << 4;
pub const PERM_D: u8 = 1 << 5;
pub const PERM_G: u8 = 1 << 6;

/// Compact TLB entry: virtual page number, physical page number, ASID and
/// packed permission bits.
#[derive(Clone, Copy, Debug)]
pub struct TlbEntry {
    pub vpn: u64,
    pub ppn: u64,
    pub asid: u16,
    pub perm: u8,
    pub valid: bool,
}

impl TlbEntry {
    pub const EMPTY: Self = Self {
        vpn: 0,
        ppn: 0,
        asid: 0,
        perm: 0,
        valid: false,
    };

    #[inline(always)]
    pub const fn r(&self) -> bool {
        self.perm & PERM_R != 0
    }

    #[inline(always)]
    pub const fn w(&self) -> bool {
        self.perm & PERM_W != 0
    }

    #[inline(always)]
    pub const fn x(&self) -> bool {
        self.perm & PERM_X != 0
    }

    #[inline(always)]
    pub const fn u(&self) -> bool {
        self.perm & PERM_U != 0
    }

    #[inline(always)]
    pub const fn d(&self) -> bool {
        self.perm & PERM_D != 0
    }

    #[inline(always)]
    pub const fn global(&self) -> bool {
        self.perm & PERM_G != 0
    }
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Direct-mapped TLB, one per hart.
pub struct Tlb {
    entries: [TlbEntry; TLB_SIZE],
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: [TlbEntry::EMPTY; TLB_SIZE],
        }
    }

    /// Flush everything (SFENCE.VMA with rs1=x0, rs2=x0).
    pub fn flush(&mut self) {
        for entry in &mut self.entries {
            entry.valid = false;
        }
    }

    /// Flush by ASID (SFENCE.VMA with rs2!=x0). Global mappings survive.
    pub fn flush_asid(&mut self, asid: u64) {
        let asid16 = asid as u16;
        for entry in &mut self.entries {
            if !entry.global() && entry.asid == asid16 {
                entry.valid = false;
            }
        }
    }

    /// Flush one virtual address (SFENCE.VMA with rs1!=x0).
    pub fn flush_va(&mut self, va: u64) {
        let vpn = va >> 12;
        let entry = &mut self.entries[(vpn as usize) & TLB_MASK];
        if entry.vpn == vpn {
            entry.valid = false;
        }
    }

    #[inline(always)]
    fn lookup(&self, vpn: u64, asid: u64) -> Option<&TlbEntry> {
        let entry = &self.entries[(vpn as usize) & TLB_MASK];
        if entry.valid && entry.vpn == vpn && (entry.global() || entry.asid == asid as u16) {
            Some(entry)
        } else {
            None
        }
    }

    #[inline(always)]
    fn insert(&mut self, entry: TlbEntry) {
        self.entries[(entry.vpn as usize) & TLB_MASK] = entry;
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

struct WalkParams {
    levels: usize,
    va_bits: u64,
    pte_size: u64,
    ppn_mask: u64,
    vpn_bits: u64,
}

fn walk_params(satp: u64, xlen: Xlen) -> Option<WalkParams> {
    match xlen {
        Xlen::Rv32 => {
            // SATP.MODE is bit 31: 0 = Bare, 1 = Sv32.
            if satp >> 31 & 1 == 0 {
                return None;
            }
            Some(WalkParams {
                levels: 2,
                va_bits: 32,
                pte_size: 4,
                ppn_mask: (1 << 22) - 1,
                vpn_bits: 10,
            })
        }
        Xlen::Rv64 => match (satp >> 60) & 0xF {
            8 => Some(WalkParams {
                levels: 3,
                va_bits: 39,
                pte_size: 8,
                ppn_mask: 0xFFF_FFFF_FFFF,
                vpn_bits: 9,
            }),
            9 => Some(WalkParams {
                levels: 4,
                va_bits: 48,
                pte_size: 8,
                ppn_mask: 0xFFF_FFFF_FFFF,
                vpn_bits: 9,
            }),
            _ => None,
        },
    }
}

/// Translate a virtual address for the given *effective* privilege mode.
///
/// The caller resolves MPRV before calling: with `mstatus.mprv` set and the
/// hart in machine mode, loads and stores translate as `mstatus.mpp`.
/// Machine mode and Bare SATP pass addresses through. A/D bits are set in the
/// in-memory PTE on the walk; a store through a clean TLB entry re-walks so
/// the D bit lands in memory.
pub fn translate(
    mem: &mut Memory,
    tlb: &mut Tlb,
    mode: Mode,
    xlen: Xlen,
    satp: u64,
    mstatus: u64,
    addr: u64,
    access_type: AccessType,
) -> Result<u64, Trap> {
    if mode == Mode::Machine {
        return Ok(addr);
    }

    let Some(params) = walk_params(satp, xlen) else {
        return Ok(addr);
    };

    let current_asid = match xlen {
        Xlen::Rv32 => (satp >> 22) & 0x1FF,
        Xlen::Rv64 => (satp >> 44) & 0xFFFF,
    };

    // Canonical-form check of the virtual address (RV64 only; Sv32 VAs use
    // the full 32 bits).
    if xlen == Xlen::Rv64 {
        let sign_bit = params.va_bits - 1;
        let upper_mask = !((1u64 << params.va_bits) - 1);
        let expected_upper = if (addr >> sign_bit) & 1 == 1 {
            upper_mask
        } else {
            0
        };
        if (addr & upper_mask) != expected_upper {
            return Err(page_fault(access_type, addr));
        }
    }

    let vpn_full_mask = (1u64 << (params.vpn_bits * params.levels as u64)) - 1;
    let vpn_full = (addr >> 12) & vpn_full_mask;

    // TLB hit path. A store through an entry without D falls through to the
    // walk so the in-memory PTE picks up the dirty bit.
    if let Some(entry) = tlb.lookup(vpn_full, current_asid) {
        let needs_dirty = access_type == AccessType::Store && !entry.d();
        if !needs_dirty {
            if check_permission(mode, mstatus, entry, access_type) {
                return Ok((entry.ppn << 12) | (addr & 0xFFF));
            }
            return Err(page_fault(access_type, addr));
        }
    }

    // Page table walk.
    let mut vpn = [0u64; MAX_LEVELS];
    for (level, slot) in vpn.iter_mut().enumerate().take(params.levels) {
        *slot = (addr >> (12 + params.vpn_bits * level as u64)) & ((1 << params.vpn_bits) - 1);
    }

    let root_ppn = match xlen {
        Xlen::Rv32 => satp & ((1u64 << 22) - 1),
        Xlen::Rv64 => satp & ((1u64 << 44) - 1),
    };
    let mut table = root_ppn * PAGE_SIZE;

    for i in (0..params.levels).rev() {
        let pte_addr = table + vpn[i] * params.pte_size;
        let pte = match mem.read(pte_addr, params.pte_size as u32) {
            Ok(v) => v,
            Err(_) => return Err(access_fault(access_type, addr)),
        };

        let v = pte & 1;
        let r = (pte >> 1) & 1;
        let w = (pte >> 2) & 1;
        let x = (pte >> 3) & 1;

        if v == 0 || (r == 0 && w == 1) {
            return Err(page_fault(access_type, addr));
        }

        // Pointer to the next level when R=X=0.
        if r == 0 && x == 0 {
            if i == 0 {
                return Err(page_fault(access_type, addr));
            }
            table = ((pte >> 10) & params.ppn_mask) * PAGE_SIZE;
            continue;
        }

        let mut perm: u8 = 0;
        if r != 0 {
            perm |= PERM_R;
        }
        if w != 0 {
            perm |= PERM_W;
        }
        if x != 0 {
            perm |= PERM_X;
        }
        if (pte >> 4) & 1 != 0 {
            perm |= PERM_U;
        }
        if (pte >> 5) & 1 != 0 {
            perm |= PERM_G;
        }
        if (pte >> 6) & 1 != 0 {
            perm |= PERM_A;
        }
        if (pte >> 7) & 1 != 0 {
            perm |= PERM_D;
        }

        let mut entry = TlbEntry {
            vpn: vpn_full,
            ppn: (pte >> 10) & params.ppn_mask,
            asid: current_asid as u16,
            perm,
            valid: true,
        };

        if !check_permission(mode, mstatus, &entry, access_type) {
            return Err(page_fault(access_type, addr));
        }

        // Superpage alignment: low PPN parts must be zero.
        if i > 0 {
            let ppn_low_mask = (1u64 << (params.vpn_bits * i as u64)) - 1;
            if entry.ppn & ppn_low_mask != 0 {
                return Err(page_fault(access_type, addr));
            }
        }

        // A set on any access, D on store; written back to the PTE.
        let mut new_pte = pte;
        if entry.perm & PERM_A == 0 {
            new_pte |= 1 << 6;
            entry.perm |= PERM_A;
        }
        if access_type == AccessType::Store && !entry.d() {
            new_pte |= 1 << 7;
            entry.perm |= PERM_D;
        }
        if new_pte != pte && mem.write(pte_addr, params.pte_size as u32, new_pte).is_err() {
            return Err(access_fault(access_type, addr));
        }

        // On superpages, low PPN parts come from the VA.
        let vpn_low_mask = (1u64 << (params.vpn_bits * i as u64)) - 1;
        let result_ppn = (entry.ppn & !vpn_low_mask) | ((addr >> 12) & vpn_low_mask);
        entry.ppn = result_ppn;
        tlb.insert(entry);

        return Ok((result_ppn << 12) | (addr & 0xFFF));
    }

    Err(page_fault(access_type, addr))
}

#[inline(always)]
fn check_permission(mode: Mode, mstatus: u64, entry: &TlbEntry, access_type: AccessType) -> bool {
    let mxr = (mstatus >> 19) & 1;
    let sum = (mstatus >> 18) & 1;

    match mode {
        Mode::Supervisor => {
            if entry.u() {
                if access_type == AccessType::Instruction {
                    return false;
                }
                if sum == 0 {
                    return false;
                }
            }
        }
        Mode::User => {
            if !entry.u() {
                return false;
            }
        }
        Mode::Machine => {}
    }

    match access_type {
        AccessType::Instruction => entry.x(),
        AccessType::Store => entry.w(),
        AccessType::Load => entry.r() || (mxr == 1 && entry.x()),
    }
}

#[inline]
fn page_fault(access_type: AccessType, addr: u64) -> Trap {
    match access_type {
        AccessType::Instruction => Trap::InstructionPageFault(addr),
        AccessType::Load => Trap::LoadPageFault(addr),
        AccessType::Store => Trap::StorePageFault(addr),
    }
}

#[inline]
fn access_fault(access_type: AccessType, addr: u64) -> Trap {
    match access_type {
        AccessType::Instruction => Trap::InstructionAccessFault(addr),
        AccessType::Load => Trap::LoadAccessFault(addr),
        AccessType::Store => Trap::StoreAccessFault(addr),
    }
}

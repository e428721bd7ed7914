//! Physical memory: a set of byte-addressable regions with physical memory
//! attributes, masked memory-mapped registers, and per-hart LR reservations.

use std::collections::HashMap;

use thiserror::Error;

/// Reservation granule for LR/SC, in bytes (one cache line).
pub const LR_GRANULE: u64 = 64;

/// Physical memory attributes of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pma {
    pub read: bool,
    pub write: bool,
    pub fetch: bool,
    pub io: bool,
    pub cacheable: bool,
    pub iccm: bool,
    pub dccm: bool,
    pub mem_mapped: bool,
}

impl Pma {
    /// Ordinary RAM: readable, writable, fetchable, cacheable.
    pub fn ram() -> Self {
        Pma {
            read: true,
            write: true,
            fetch: true,
            io: false,
            cacheable: true,
            iccm: false,
            dccm: false,
            mem_mapped: false,
        }
    }

    /// Uncached device window: data access only.
    pub fn io() -> Self {
        Pma {
            read: true,
            write: true,
            fetch: false,
            io: true,
            cacheable: false,
            iccm: false,
            dccm: false,
            mem_mapped: false,
        }
    }

    /// Instruction closely-coupled memory: fetch and data reads.
    pub fn iccm() -> Self {
        Pma {
            read: true,
            write: false,
            fetch: true,
            io: false,
            cacheable: false,
            iccm: true,
            dccm: false,
            mem_mapped: false,
        }
    }

    /// Data closely-coupled memory: data access, no fetch.
    pub fn dccm() -> Self {
        Pma {
            read: true,
            write: true,
            fetch: false,
            io: false,
            cacheable: false,
            iccm: false,
            dccm: true,
            mem_mapped: false,
        }
    }

    /// Memory-mapped register window: 4-byte data access, write-masked.
    pub fn mmr() -> Self {
        Pma {
            read: true,
            write: true,
            fetch: false,
            io: true,
            cacheable: false,
            iccm: false,
            dccm: false,
            mem_mapped: true,
        }
    }

    /// Attributes of an unmapped address: everything denied.
    pub fn none() -> Self {
        Pma {
            read: false,
            write: false,
            fetch: false,
            io: false,
            cacheable: false,
            iccm: false,
            dccm: false,
            mem_mapped: false,
        }
    }
}

/// Access kind carried in [`MemoryError::Denied`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Fetch => "fetch",
        })
    }
}

/// Failure kinds for physical memory access. The hart maps these onto
/// access-fault traps; peek/poke callers see them directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("no region maps physical address {0:#x}")]
    Unmapped(u64),
    #[error("{size}-byte access at {addr:#x} crosses a region boundary")]
    OutOfBounds { addr: u64, size: u32 },
    #[error("{kind} access denied at {addr:#x}")]
    Denied { addr: u64, kind: AccessKind },
}

struct Region {
    base: u64,
    data: Vec<u8>,
    pma: Pma,
    /// Per-word write masks for memory-mapped registers, keyed by the
    /// word-aligned address. A store writes `(old & !mask) | (new & mask)`.
    mmr_masks: HashMap<u64, u32>,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn contains(&self, addr: u64, size: u64) -> bool {
        addr >= self.base && addr + size <= self.end()
    }
}

/// Flat physical address space assembled from attribute-tagged regions.
///
/// LR reservations are owned here (indexed by hart) so that a store from any
/// hart invalidates overlapping reservations, per the A-extension contract.
pub struct Memory {
    regions: Vec<Region>,
    reservations: Vec<Option<u64>>,
}

impl Memory {
    /// An empty address space for `hart_count` harts; add regions with
    /// [`Memory::define_region`].
    pub fn new(hart_count: usize) -> Self {
        Memory {
            regions: Vec::new(),
            reservations: vec![None; hart_count.max(1)],
        }
    }

    /// Convenience constructor: one RAM region at `base` of `size` bytes.
    pub fn with_ram(hart_count: usize, base: u64, size: usize) -> Self {
        let mut mem = Memory::new(hart_count);
        mem.define_region(base, size, Pma::ram());
        mem
    }

    /// Map a new region. Regions must not overlap: the first matching region
    /// wins on lookup, so an overlapping region would be shadowed silently.
    /// Callers set up the address map once at construction.
    pub fn define_region(&mut self, base: u64, size: usize, pma: Pma) {
        self.regions.push(Region {
            base,
            data: vec![0; size],
            pma,
            mmr_masks: HashMap::new(),
        });
    }

    /// Register the write mask of a memory-mapped register word.
    /// Only meaningful inside a region with the `mem_mapped` attribute.
    pub fn define_mmr_mask(&mut self, addr: u64, mask: u32) {
        let word = addr & !3;
        if let Some(ix) = self.region_index(word, 4) {
            self.regions[ix].mmr_masks.insert(word, mask);
        }
    }

    /// Attributes at `addr`, or all-denied if unmapped.
    pub fn pma(&self, addr: u64) -> Pma {
        self.region_index(addr, 1)
            .map(|ix| self.regions[ix].pma)
            .unwrap_or_else(Pma::none)
    }

    fn region_index(&self, addr: u64, size: u64) -> Option<usize> {
        self.regions.iter().position(|r| r.contains(addr, size))
    }

    fn locate(&self, addr: u64, size: u64) -> Result<usize, MemoryError> {
        match self.region_index(addr, size) {
            Some(ix) => Ok(ix),
            None => {
                // Distinguish "nothing there" from "access straddles the end".
                if self.region_index(addr, 1).is_some() {
                    Err(MemoryError::OutOfBounds {
                        addr,
                        size: size as u32,
                    })
                } else {
                    Err(MemoryError::Unmapped(addr))
                }
            }
        }
    }

    fn read_int(&self, addr: u64, size: u64, kind: AccessKind) -> Result<u64, MemoryError> {
        let ix = self.locate(addr, size)?;
        let region = &self.regions[ix];
        let ok = match kind {
            AccessKind::Read => region.pma.read,
            AccessKind::Fetch => region.pma.fetch,
            AccessKind::Write => region.pma.write,
        };
        if !ok {
            return Err(MemoryError::Denied { addr, kind });
        }
        let off = (addr - region.base) as usize;
        let mut value = 0u64;
        for i in (0..size as usize).rev() {
            value = (value << 8) | region.data[off + i] as u64;
        }
        Ok(value)
    }

    fn write_int(&mut self, addr: u64, size: u64, value: u64) -> Result<(), MemoryError> {
        let ix = self.locate(addr, size)?;
        if !self.regions[ix].pma.write {
            return Err(MemoryError::Denied {
                addr,
                kind: AccessKind::Write,
            });
        }
        let mut value = value;
        if self.regions[ix].pma.mem_mapped {
            // Memory-mapped registers only accept naturally aligned word
            // stores; narrower or wider accesses fault.
            if size != 4 || addr & 3 != 0 {
                return Err(MemoryError::Denied {
                    addr,
                    kind: AccessKind::Write,
                });
            }
            let mask = *self.regions[ix].mmr_masks.get(&addr).unwrap_or(&0);
            let old = self.read_int(addr, 4, AccessKind::Read)? as u32;
            value = ((old & !mask) | (value as u32 & mask)) as u64;
        }
        let region = &mut self.regions[ix];
        let off = (addr - region.base) as usize;
        for i in 0..size as usize {
            region.data[off + i] = (value >> (8 * i)) as u8;
        }
        self.invalidate_overlapping_reservations(addr, size);
        Ok(())
    }

    pub fn read8(&self, addr: u64) -> Result<u8, MemoryError> {
        Ok(self.read_int(addr, 1, AccessKind::Read)? as u8)
    }

    pub fn read16(&self, addr: u64) -> Result<u16, MemoryError> {
        Ok(self.read_int(addr, 2, AccessKind::Read)? as u16)
    }

    pub fn read32(&self, addr: u64) -> Result<u32, MemoryError> {
        Ok(self.read_int(addr, 4, AccessKind::Read)? as u32)
    }

    pub fn read64(&self, addr: u64) -> Result<u64, MemoryError> {
        self.read_int(addr, 8, AccessKind::Read)
    }

    /// Instruction fetch of one 16-bit parcel.
    pub fn fetch16(&self, addr: u64) -> Result<u16, MemoryError> {
        Ok(self.read_int(addr, 2, AccessKind::Fetch)? as u16)
    }

    pub fn write8(&mut self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write_int(addr, 1, value as u64)
    }

    pub fn write16(&mut self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write_int(addr, 2, value as u64)
    }

    pub fn write32(&mut self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write_int(addr, 4, value as u64)
    }

    pub fn write64(&mut self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write_int(addr, 8, value)
    }

    /// Width-dispatched read used by the page-table walker and snapshots.
    pub fn read(&self, addr: u64, size: u32) -> Result<u64, MemoryError> {
        self.read_int(addr, size as u64, AccessKind::Read)
    }

    /// Width-dispatched write used by the page-table walker.
    pub fn write(&mut self, addr: u64, size: u32, value: u64) -> Result<(), MemoryError> {
        self.write_int(addr, size as u64, value)
    }

    /// Debug read bypassing attributes. Returns `None` if unmapped.
    pub fn peek(&self, addr: u64, size: u32) -> Option<u64> {
        let ix = self.region_index(addr, size as u64)?;
        let region = &self.regions[ix];
        let off = (addr - region.base) as usize;
        let mut value = 0u64;
        for i in (0..size as usize).rev() {
            value = (value << 8) | region.data[off + i] as u64;
        }
        Some(value)
    }

    /// Debug write bypassing attributes and MMR masks. Returns false if
    /// unmapped. Does not disturb reservations.
    pub fn poke(&mut self, addr: u64, size: u32, value: u64) -> bool {
        let Some(ix) = self.region_index(addr, size as u64) else {
            return false;
        };
        let region = &mut self.regions[ix];
        let off = (addr - region.base) as usize;
        for i in 0..size as usize {
            region.data[off + i] = (value >> (8 * i)) as u8;
        }
        true
    }

    /// Bulk poke used by loaders and snapshot restore.
    pub fn load_bytes(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        let ix = self.locate(addr, bytes.len() as u64)?;
        let region = &mut self.regions[ix];
        let off = (addr - region.base) as usize;
        region.data[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    // --- LR/SC reservations -----------------------------------------------

    fn granule(addr: u64) -> u64 {
        addr & !(LR_GRANULE - 1)
    }

    fn invalidate_overlapping_reservations(&mut self, addr: u64, size: u64) {
        let lo = Self::granule(addr);
        let hi = Self::granule(addr + size - 1);
        for res in self.reservations.iter_mut() {
            if let Some(g) = *res {
                if g == lo || g == hi {
                    *res = None;
                }
            }
        }
    }

    /// Record a reservation for `hart` at the granule containing `addr`.
    pub fn reserve(&mut self, hart: usize, addr: u64) {
        if let Some(slot) = self.reservations.get_mut(hart) {
            *slot = Some(Self::granule(addr));
        }
    }

    /// Drop any reservation held by `hart`.
    pub fn invalidate_lr(&mut self, hart: usize) {
        if let Some(slot) = self.reservations.get_mut(hart) {
            *slot = None;
        }
    }

    /// True if `hart` still holds a reservation covering `addr`.
    pub fn has_reservation(&self, hart: usize, addr: u64) -> bool {
        self.reservations.get(hart).copied().flatten() == Some(Self::granule(addr))
    }

    /// Current reservation granule of `hart`, if any.
    pub fn reservation(&self, hart: usize) -> Option<u64> {
        self.reservations.get(hart).copied().flatten()
    }

    /// Restore a previously captured reservation (what-if unwinding).
    pub fn restore_reservation(&mut self, hart: usize, reservation: Option<u64>) {
        if let Some(slot) = self.reservations.get_mut(hart) {
            *slot = reservation;
        }
    }

    /// Zero the contents of every region (snapshot restore).
    pub fn zero_all(&mut self) {
        for region in &mut self.regions {
            region.data.fill(0);
        }
    }

    /// Zero every memory-mapped-register region (reset with
    /// `reset_memory_mapped_regs`).
    pub fn reset_mmrs(&mut self) {
        for region in &mut self.regions {
            if region.pma.mem_mapped {
                region.data.fill(0);
            }
        }
    }

    /// Iterate mapped regions as `(base, bytes)`; used by snapshots.
    pub fn regions(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.regions.iter().map(|r| (r.base, r.data.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram() -> Memory {
        Memory::with_ram(2, 0x8000_0000, 0x1_0000)
    }

    #[test]
    fn read_write_round_trip_all_widths() {
        let mut mem = ram();
        mem.write8(0x8000_0000, 0xAB).unwrap();
        assert_eq!(mem.read8(0x8000_0000).unwrap(), 0xAB);
        mem.write16(0x8000_0010, 0xBEEF).unwrap();
        assert_eq!(mem.read16(0x8000_0010).unwrap(), 0xBEEF);
        mem.write32(0x8000_0020, 0xDEAD_BEEF).unwrap();
        assert_eq!(mem.read32(0x8000_0020).unwrap(), 0xDEAD_BEEF);
        mem.write64(0x8000_0030, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(mem.read64(0x8000_0030).unwrap(), 0x0123_4567_89AB_CDEF);
        // Little-endian byte order.
        assert_eq!(mem.read8(0x8000_0030).unwrap(), 0xEF);
    }

    #[test]
    fn unmapped_and_straddling_accesses_report_distinct_kinds() {
        let mem = ram();
        assert_eq!(mem.read32(0x1000), Err(MemoryError::Unmapped(0x1000)));
        let last = 0x8000_0000 + 0x1_0000 - 2;
        assert_eq!(
            mem.read32(last),
            Err(MemoryError::OutOfBounds {
                addr: last,
                size: 4
            })
        );
    }

    #[test]
    fn iccm_denies_data_write() {
        let mut mem = Memory::new(1);
        mem.define_region(0x4000, 0x1000, Pma::iccm());
        assert_eq!(
            mem.write32(0x4000, 1),
            Err(MemoryError::Denied {
                addr: 0x4000,
                kind: AccessKind::Write
            })
        );
        // Fetch from ICCM is fine.
        mem.poke(0x4000, 4, 0x1234_5678);
        assert_eq!(mem.fetch16(0x4000).unwrap(), 0x5678);
    }

    #[test]
    fn mmr_write_mask_applies() {
        let mut mem = Memory::new(1);
        mem.define_region(0x2000_0000, 0x100, Pma::mmr());
        mem.define_mmr_mask(0x2000_0004, 0x0000_FF00);
        mem.poke(0x2000_0004, 4, 0x1111_1111);
        mem.write32(0x2000_0004, 0xFFFF_FFFF).unwrap();
        assert_eq!(mem.read32(0x2000_0004).unwrap(), 0x1111_FF11);
        // Sub-word store to an MMR region faults.
        assert!(mem.write8(0x2000_0004, 0).is_err());
    }

    #[test]
    fn store_from_any_hart_invalidates_reservation() {
        let mut mem = ram();
        mem.reserve(0, 0x8000_1000);
        assert!(mem.has_reservation(0, 0x8000_1000));
        // Same granule, different offset.
        assert!(mem.has_reservation(0, 0x8000_1004));
        mem.write32(0x8000_1008, 7).unwrap();
        assert!(!mem.has_reservation(0, 0x8000_1000));

        mem.reserve(1, 0x8000_2000);
        mem.write8(0x8000_2000 + LR_GRANULE, 1).unwrap();
        assert!(mem.has_reservation(1, 0x8000_2000));
        mem.invalidate_lr(1);
        assert!(!mem.has_reservation(1, 0x8000_2000));
    }

    #[test]
    fn poke_does_not_touch_reservations() {
        let mut mem = ram();
        mem.reserve(0, 0x8000_1000);
        mem.poke(0x8000_1000, 4, 0xFFFF_FFFF);
        assert!(mem.has_reservation(0, 0x8000_1000));
    }
}

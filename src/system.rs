//! A system: the shared memory, the CLINT, and an ordered set of harts
//! indexed 0 to cores × harts-per-core - 1.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clint::Clint;
use crate::csr::{SharedCsrPool, CSR_MHARTSTART};
use crate::hart::{Hart, RunOutcome, StopEvent};
use crate::memory::Memory;
use crate::Xlen;

pub struct System {
    memory: Memory,
    harts: Vec<Hart>,
    clint: Arc<Clint>,
    harts_per_core: usize,
}

impl System {
    /// Build a system of `core_count` cores with `harts_per_core` harts
    /// each, all sharing `memory`. Hart 0 starts running at reset; the
    /// others wait for their bit in the shared `mhartstart` register.
    pub fn new(core_count: usize, harts_per_core: usize, xlen: Xlen, memory: Memory) -> Self {
        let count = (core_count * harts_per_core).max(1);
        let clint = Arc::new(Clint::new(count));
        let shared: SharedCsrPool = Arc::new(Mutex::new(HashMap::new()));
        let mut harts = Vec::with_capacity(count);
        for ix in 0..count {
            let mut hart = Hart::new(ix, xlen);
            hart.attach_clint(clint.clone());
            hart.tie_shared_csrs(shared.clone());
            hart.set_started(ix == 0);
            harts.push(hart);
        }
        System {
            memory,
            harts,
            clint,
            harts_per_core,
        }
    }

    pub fn hart_count(&self) -> usize {
        self.harts.len()
    }

    pub fn core_count(&self) -> usize {
        self.harts.len() / self.harts_per_core
    }

    pub fn harts_per_core(&self) -> usize {
        self.harts_per_core
    }

    /// The ith hart, or `None` when out of bounds.
    pub fn hart(&self, ix: usize) -> Option<&Hart> {
        self.harts.get(ix)
    }

    pub fn hart_mut(&mut self, ix: usize) -> Option<&mut Hart> {
        self.harts.get_mut(ix)
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn clint(&self) -> &Arc<Clint> {
        &self.clint
    }

    /// Propagate the shared `mhartstart` bits into per-hart started flags.
    /// Hart 0 is always running.
    fn sync_started_flags(&mut self) {
        let gate = self.harts[0].peek_csr(CSR_MHARTSTART).unwrap_or(1);
        for (ix, hart) in self.harts.iter_mut().enumerate() {
            let started = ix == 0 || gate >> ix & 1 == 1;
            hart.set_started(started);
        }
    }

    /// Step one hart by one instruction. Returns the stop event if that
    /// step raised one, or `None` (including for an out-of-range index or a
    /// hart that has not been started).
    pub fn step_hart(&mut self, ix: usize) -> Option<StopEvent> {
        self.sync_started_flags();
        let hart = self.harts.get_mut(ix)?;
        hart.single_step(&mut self.memory)
    }

    /// Run one hart to a stop condition.
    pub fn run_hart(&mut self, ix: usize) -> Option<RunOutcome> {
        self.sync_started_flags();
        let hart = self.harts.get_mut(ix)?;
        Some(hart.run(&mut self.memory))
    }

    /// Split borrow for callers that need a hart and the memory together.
    pub fn hart_and_memory(&mut self, ix: usize) -> Option<(&mut Hart, &mut Memory)> {
        let memory = &mut self.memory;
        self.harts.get_mut(ix).map(|hart| (hart, memory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mode;

    fn system(harts: usize) -> System {
        let memory = Memory::with_ram(harts, 0x8000_0000, 0x1_0000);
        System::new(harts, 1, Xlen::Rv64, memory)
    }

    #[test]
    fn hart_indexing() {
        let sys = system(3);
        assert_eq!(sys.hart_count(), 3);
        assert!(sys.hart(2).is_some());
        assert!(sys.hart(3).is_none());
        assert_eq!(sys.hart(1).unwrap().hart_ix(), 1);
    }

    #[test]
    fn only_hart_zero_started_at_reset() {
        let mut sys = system(2);
        sys.sync_started_flags();
        assert!(sys.hart(0).unwrap().is_started());
        assert!(!sys.hart(1).unwrap().is_started());
    }

    #[test]
    fn mhartstart_write_starts_secondary_hart() {
        let mut sys = system(2);
        // Hart 0 writes the start bit for hart 1 in the shared register.
        let (hart0, _) = sys.hart_and_memory(0).unwrap();
        assert!(hart0.privilege_mode() == Mode::Machine);
        hart0.poke_csr(CSR_MHARTSTART, 0b11);
        sys.sync_started_flags();
        assert!(sys.hart(1).unwrap().is_started());
        // The shared pool aliases the register into hart 1 as well.
        assert_eq!(sys.hart(1).unwrap().peek_csr(CSR_MHARTSTART), Some(0b11));
    }
}

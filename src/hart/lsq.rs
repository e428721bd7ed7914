//! Load/store queue: bounded records of in-flight memory operations used by
//! the test-bench interface to inject imprecise exceptions and to complete
//! non-blocking loads.

use super::Hart;
use crate::memory::Memory;
use crate::Trap;

/// An in-flight load: enough to undo the destination write if the load is
/// later reported as failed.
#[derive(Debug, Clone, Copy)]
pub struct LoadEntry {
    pub size: u32,
    pub addr: u64,
    pub reg: u8,
    pub prev_value: u64,
    pub tag: u64,
    pub valid: bool,
    pub fp: bool,
}

/// A buffered store: previous memory contents for rollback.
#[derive(Debug, Clone, Copy)]
pub struct StoreEntry {
    pub size: u32,
    pub addr: u64,
    pub new_value: u64,
    pub prev_value: u64,
}

const MAX_STORE_QUEUE: usize = 16;

impl Hart {
    pub(crate) fn push_load_queue(&mut self, entry: LoadEntry) {
        if self.load_queue.len() >= self.max_load_queue {
            self.load_queue.remove(0);
        }
        self.load_queue.push(entry);
    }

    pub(crate) fn store_queue_capture(&mut self, addr: u64, size: u32, value: u64, prev: u64) {
        if !self.load_queue_enabled && !self.store_error_rollback {
            return;
        }
        if self.store_queue.len() >= MAX_STORE_QUEUE {
            self.store_queue.remove(0);
        }
        self.store_queue.push(StoreEntry {
            size,
            addr,
            new_value: value,
            prev_value: prev,
        });
    }

    /// Remove the youngest store-buffer entry for `addr` (instruction
    /// rollback path).
    pub(crate) fn store_queue_discard(&mut self, addr: u64, size: u32) {
        if let Some(pos) = self
            .store_queue
            .iter()
            .rposition(|e| e.addr == addr && e.size == size)
        {
            self.store_queue.remove(pos);
        }
    }

    pub fn load_queue_len(&self) -> usize {
        self.load_queue.len()
    }

    /// Apply an imprecise store exception at `addr`. Returns true iff the
    /// address matches exactly one store-buffer entry; the match count comes
    /// back either way. On a unique match the address is captured in mdseac
    /// and a store-access-fault is delivered; with store-error rollback the
    /// buffered store is undone first.
    pub fn apply_store_exception(&mut self, mem: &mut Memory, addr: u64) -> (bool, usize) {
        let matches: Vec<usize> = self
            .store_queue
            .iter()
            .enumerate()
            .filter(|(_, e)| e.addr == addr)
            .map(|(i, _)| i)
            .collect();
        let count = matches.len();
        if count != 1 {
            return (false, count);
        }
        let ix = matches[0];
        let entry = self.store_queue.remove(ix);
        if self.store_error_rollback {
            mem.poke(entry.addr, entry.size, entry.prev_value);
        }
        self.csrs.capture_mdseac(addr);
        self.take_trap(mem, &Trap::StoreAccessFault(addr), self.pc, 0);
        (true, 1)
    }

    /// Apply an imprecise load exception at `addr` with the given tag.
    /// On a unique match the destination register write is undone (when
    /// load-error rollback is enabled and no younger load overwrote it) and
    /// a load-access-fault is delivered.
    pub fn apply_load_exception(&mut self, mem: &mut Memory, addr: u64, tag: u64) -> (bool, usize) {
        let matches: Vec<usize> = self
            .load_queue
            .iter()
            .enumerate()
            .filter(|(_, e)| e.valid && e.addr == addr && e.tag == tag)
            .map(|(i, _)| i)
            .collect();
        let count = matches.len();
        if count != 1 {
            return (false, count);
        }
        let ix = matches[0];
        let entry = self.load_queue.remove(ix);
        if self.load_error_rollback {
            // A younger queued load of the same register owns the current
            // value; in that chain the older value is unrecoverable and the
            // younger entries are invalidated instead.
            let younger_same_reg = self.load_queue[ix..]
                .iter()
                .any(|e| e.valid && e.reg == entry.reg && e.fp == entry.fp);
            if younger_same_reg {
                for e in self.load_queue[ix..].iter_mut() {
                    if e.valid && e.reg == entry.reg && e.fp == entry.fp {
                        e.valid = false;
                    }
                }
            } else if entry.fp {
                self.fregs[entry.reg as usize] = entry.prev_value;
            } else if entry.reg != 0 {
                self.regs[entry.reg as usize] = entry.prev_value;
            }
        }
        self.csrs.capture_mdseac(addr);
        self.take_trap(mem, &Trap::LoadAccessFault(addr), self.pc, 0);
        (true, 1)
    }

    /// Mark the load-queue entry matching `addr`/`tag` as complete and drop
    /// it. Returns whether a unique match was found, plus the match count.
    pub fn apply_load_finished(&mut self, addr: u64, tag: u64) -> (bool, usize) {
        let matches: Vec<usize> = self
            .load_queue
            .iter()
            .enumerate()
            .filter(|(_, e)| e.valid && e.addr == addr && e.tag == tag)
            .map(|(i, _)| i)
            .collect();
        let count = matches.len();
        if count != 1 {
            return (false, count);
        }
        self.load_queue.remove(matches[0]);
        (true, 1)
    }
}

//! Snapshot save/restore: architectural hart state plus memory deltas,
//! persisted into a directory as JSON documents.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::csr::CsrNumber;
use crate::hart::Hart;
use crate::memory::Memory;
use crate::Mode;

/// Version identifier for snapshot compatibility checks.
pub const SNAPSHOT_VERSION: &str = "1.0";

const REGS_FILE: &str = "registers.json";
const MEMORY_FILE: &str = "memory.json";
const PAGE_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot format error: {0}")]
    Format(#[from] serde_json::Error),
    #[error("snapshot version {0} is not supported")]
    Version(String),
    #[error("snapshot does not fit the configured memory at {0:#x}")]
    Layout(u64),
}

/// Serializable architectural hart state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HartSnapshot {
    pub version: String,
    pub pc: u64,
    pub mode: Mode,
    pub regs: Vec<u64>,
    pub fregs: Vec<u64>,
    pub csrs: HashMap<CsrNumber, u64>,
}

/// One non-zero page of physical memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub addr: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub version: String,
    pub pages: Vec<PageSnapshot>,
}

impl HartSnapshot {
    pub fn capture(hart: &Hart) -> Self {
        HartSnapshot {
            version: SNAPSHOT_VERSION.to_string(),
            pc: hart.pc(),
            mode: hart.privilege_mode(),
            regs: (0..32).map(|i| hart.peek_int_reg(i).unwrap_or(0)).collect(),
            fregs: (0..32).map(|i| hart.peek_fp_reg(i).unwrap_or(0)).collect(),
            csrs: hart.export_csrs(),
        }
    }

    pub fn restore(&self, hart: &mut Hart) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version(self.version.clone()));
        }
        for (&number, &value) in &self.csrs {
            hart.poke_csr(number, value);
        }
        for (i, &v) in self.regs.iter().enumerate().take(32).skip(1) {
            hart.poke_int_reg(i, v);
        }
        for (i, &v) in self.fregs.iter().enumerate().take(32) {
            hart.poke_fp_reg(i, v);
        }
        hart.set_privilege_mode(self.mode);
        hart.set_pc(self.pc);
        Ok(())
    }
}

impl MemorySnapshot {
    /// Capture the non-zero pages of every region.
    pub fn capture(mem: &Memory) -> Self {
        let mut pages = Vec::new();
        for (base, data) in mem.regions() {
            for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
                if chunk.iter().any(|&b| b != 0) {
                    pages.push(PageSnapshot {
                        addr: base + (i * PAGE_SIZE) as u64,
                        data: chunk.to_vec(),
                    });
                }
            }
        }
        MemorySnapshot {
            version: SNAPSHOT_VERSION.to_string(),
            pages,
        }
    }

    pub fn restore(&self, mem: &mut Memory) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version(self.version.clone()));
        }
        mem.zero_all();
        for page in &self.pages {
            mem.load_bytes(page.addr, &page.data)
                .map_err(|_| SnapshotError::Layout(page.addr))?;
        }
        Ok(())
    }
}

impl Hart {
    /// Persist PC, integer/FP registers, CSRs and memory deltas into `dir`.
    pub fn save_snapshot(&self, mem: &Memory, dir: &Path) -> Result<(), SnapshotError> {
        std::fs::create_dir_all(dir)?;
        let regs = HartSnapshot::capture(self);
        let writer = BufWriter::new(File::create(dir.join(REGS_FILE))?);
        serde_json::to_writer(writer, &regs)?;
        let memory = MemorySnapshot::capture(mem);
        let writer = BufWriter::new(File::create(dir.join(MEMORY_FILE))?);
        serde_json::to_writer(writer, &memory)?;
        log::debug!("snapshot saved to {}", dir.display());
        Ok(())
    }

    /// Restore a snapshot previously written by [`Hart::save_snapshot`].
    pub fn load_snapshot(&mut self, mem: &mut Memory, dir: &Path) -> Result<(), SnapshotError> {
        let reader = BufReader::new(File::open(dir.join(REGS_FILE))?);
        let regs: HartSnapshot = serde_json::from_reader(reader)?;
        let reader = BufReader::new(File::open(dir.join(MEMORY_FILE))?);
        let memory: MemorySnapshot = serde_json::from_reader(reader)?;
        regs.restore(self)?;
        memory.restore(mem)?;
        log::debug!("snapshot loaded from {}", dir.display());
        Ok(())
    }
}

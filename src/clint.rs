//! Core-local interruptor: software-interrupt and timer-compare mailboxes
//! shared by the harts of one system.
//!
//! The driver configures a `[start, limit)` window and, optionally, two
//! address-to-hart resolvers. Stores landing in the window update the
//! mailboxes; each hart polls its mailboxes between instructions and mirrors
//! them into `mip.MSIP` / `mip.MTIP`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Maximum number of harts addressable through the CLINT.
pub const MAX_HARTS: usize = 128;

/// Standard layout offsets, used when no resolver is installed.
pub const MSIP_OFFSET: u64 = 0x0000;
pub const MTIMECMP_OFFSET: u64 = 0x4000;
pub const MTIME_OFFSET: u64 = 0xBFF8;

/// Maps a physical address inside the CLINT window to the hart whose mailbox
/// it addresses, or `None` if the address is not a mailbox of that kind.
pub type HartResolver = Box<dyn Fn(u64) -> Option<usize> + Send + Sync>;

struct ClintState {
    msip: [u32; MAX_HARTS],
    mtimecmp: [u64; MAX_HARTS],
    num_harts: usize,
    window: (u64, u64),
    soft_resolver: Option<HartResolver>,
    timer_resolver: Option<HartResolver>,
}

pub struct Clint {
    state: Mutex<ClintState>,
    /// Machine timer; atomic so harts can read it without the lock.
    mtime: AtomicU64,
}

impl Clint {
    pub fn new(num_harts: usize) -> Self {
        Self {
            state: Mutex::new(ClintState {
                msip: [0; MAX_HARTS],
                mtimecmp: [u64::MAX; MAX_HARTS],
                num_harts: num_harts.clamp(1, MAX_HARTS),
                window: (0, 0),
                soft_resolver: None,
                timer_resolver: None,
            }),
            mtime: AtomicU64::new(0),
        }
    }

    /// Configure the memory window the mailboxes live in.
    pub fn set_window(&self, start: u64, limit: u64) {
        self.state.lock().unwrap().window = (start, limit);
    }

    pub fn window(&self) -> (u64, u64) {
        self.state.lock().unwrap().window
    }

    /// Install the software-interrupt mailbox resolver.
    pub fn set_soft_resolver(&self, resolver: HartResolver) {
        self.state.lock().unwrap().soft_resolver = Some(resolver);
    }

    /// Install the timer-compare mailbox resolver.
    pub fn set_timer_resolver(&self, resolver: HartResolver) {
        self.state.lock().unwrap().timer_resolver = Some(resolver);
    }

    pub fn contains(&self, addr: u64) -> bool {
        let (start, limit) = self.state.lock().unwrap().window;
        start < limit && addr >= start && addr < limit
    }

    #[inline]
    pub fn mtime(&self) -> u64 {
        self.mtime.load(Ordering::Relaxed)
    }

    /// Set mtime directly (snapshot restore, test setup).
    pub fn set_mtime(&self, val: u64) {
        self.mtime.store(val, Ordering::Relaxed);
    }

    /// Advance mtime by one tick; called once per retired instruction by the
    /// active hart.
    #[inline]
    pub fn tick(&self) {
        self.mtime.fetch_add(1, Ordering::Relaxed);
    }

    fn resolve(
        state: &ClintState,
        addr: u64,
        resolver: &Option<HartResolver>,
        default_base: u64,
        stride: u64,
    ) -> Option<usize> {
        if let Some(f) = resolver {
            return f(addr).filter(|&h| h < state.num_harts);
        }
        let base = state.window.0 + default_base;
        if addr >= base && addr < base + state.num_harts as u64 * stride && (addr - base) % stride == 0
        {
            Some(((addr - base) / stride) as usize)
        } else {
            None
        }
    }

    /// Handle a store into the window. Returns true if the address mapped to
    /// a mailbox or the timer; unrecognized offsets are write-ignored.
    pub fn store(&self, addr: u64, size: u32, value: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(hart) = Self::resolve(&state, addr, &state.soft_resolver, MSIP_OFFSET, 4) {
            // Only the LSB of an msip mailbox is meaningful.
            state.msip[hart] = (value & 1) as u32;
            log::debug!("clint: msip[{hart}] <- {}", value & 1);
            return true;
        }
        if let Some(hart) = Self::resolve(&state, addr, &state.timer_resolver, MTIMECMP_OFFSET, 8) {
            state.mtimecmp[hart] = match size {
                4 => (state.mtimecmp[hart] & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF),
                _ => value,
            };
            log::debug!("clint: mtimecmp[{hart}] <- {:#x}", state.mtimecmp[hart]);
            return true;
        }
        if addr == state.window.0 + MTIME_OFFSET {
            self.mtime.store(value, Ordering::Relaxed);
            return true;
        }
        true
    }

    /// Handle a load from the window.
    pub fn load(&self, addr: u64, size: u32) -> u64 {
        let state = self.state.lock().unwrap();
        if let Some(hart) = Self::resolve(&state, addr, &state.soft_resolver, MSIP_OFFSET, 4) {
            return state.msip[hart] as u64;
        }
        if let Some(hart) = Self::resolve(&state, addr, &state.timer_resolver, MTIMECMP_OFFSET, 8) {
            let v = state.mtimecmp[hart];
            return if size == 4 { v & 0xFFFF_FFFF } else { v };
        }
        if addr == state.window.0 + MTIME_OFFSET {
            let v = self.mtime.load(Ordering::Relaxed);
            return if size == 4 { v & 0xFFFF_FFFF } else { v };
        }
        0
    }

    /// Mailbox state for one hart: `(software_pending, timer_pending)`.
    #[inline]
    pub fn pending(&self, hart: usize) -> (bool, bool) {
        if hart >= MAX_HARTS {
            return (false, false);
        }
        let mtime = self.mtime.load(Ordering::Relaxed);
        let state = self.state.lock().unwrap();
        let soft = state.msip[hart] & 1 != 0;
        let timer = mtime >= state.mtimecmp[hart];
        (soft, timer)
    }

    pub fn msip_values(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        state.msip[..state.num_harts].to_vec()
    }

    pub fn mtimecmp_values(&self) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state.mtimecmp[..state.num_harts].to_vec()
    }

    pub fn restore(&self, msip: &[u32], mtimecmp: &[u64], mtime: u64) {
        let mut state = self.state.lock().unwrap();
        for (i, &v) in msip.iter().take(MAX_HARTS).enumerate() {
            state.msip[i] = v;
        }
        for (i, &v) in mtimecmp.iter().take(MAX_HARTS).enumerate() {
            state.mtimecmp[i] = v;
        }
        self.mtime.store(mtime, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_mailboxes() {
        let clint = Clint::new(2);
        clint.set_window(0x0200_0000, 0x0201_0000);
        assert!(clint.contains(0x0200_0000));
        assert!(!clint.contains(0x0201_0000));

        clint.store(0x0200_0004, 4, 1);
        let (soft0, timer0) = clint.pending(0);
        assert!(!soft0 && !timer0);
        let (soft1, timer1) = clint.pending(1);
        assert!(soft1);
        assert!(!timer1); // mtimecmp still MAX

        clint.store(0x0200_0004, 4, 0);
        assert!(!clint.pending(1).0);
    }

    #[test]
    fn timer_compare_fires_when_mtime_reaches() {
        let clint = Clint::new(1);
        clint.set_window(0x0200_0000, 0x0201_0000);
        clint.store(0x0200_0000 + MTIMECMP_OFFSET, 8, 10);
        assert!(!clint.pending(0).1);
        for _ in 0..10 {
            clint.tick();
        }
        assert!(clint.pending(0).1);
        assert_eq!(clint.load(0x0200_0000 + MTIME_OFFSET, 8), 10);
    }

    #[test]
    fn custom_resolver_routes_mailbox() {
        let clint = Clint::new(2);
        clint.set_window(0x1000, 0x2000);
        clint.set_soft_resolver(Box::new(|addr| match addr {
            0x1100 => Some(0),
            0x1200 => Some(1),
            _ => None,
        }));
        clint.store(0x1200, 4, 1);
        assert!(!clint.pending(0).0);
        assert!(clint.pending(1).0);
    }

    #[test]
    fn clint_is_thread_safe() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Clint>();
        assert_sync::<Clint>();
    }
}

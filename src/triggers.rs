//! Debug-trigger module: address/data match triggers (mcontrol), instruction
//! count triggers (icount), and trigger chaining.

use crate::{Mode, Xlen};

/// Number of implemented triggers.
pub const TRIGGER_COUNT: usize = 4;

const TYPE_MCONTROL: u64 = 2;
const TYPE_ICOUNT: u64 = 3;

/// What a tripped trigger asks the hart to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    /// Raise a breakpoint exception.
    RaiseBreak,
    /// Enter debug mode.
    EnterDebug,
}

/// Timing of a trigger relative to the matched operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    Before,
    After,
}

/// The kind of operation a trigger is asked to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    InstAddress,
    InstOpcode,
    LoadAddress,
    LoadData,
    StoreAddress,
    StoreData,
}

/// One trigger: three data words plus per-instruction hit bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trigger {
    pub data1: u64,
    pub data2: u64,
    pub data3: u64,
    hit: bool,
}

impl Trigger {
    fn type_field(&self, xlen: Xlen) -> u64 {
        self.data1 >> (xlen.bits() - 4)
    }

    fn is_mcontrol(&self, xlen: Xlen) -> bool {
        self.type_field(xlen) == TYPE_MCONTROL
    }

    fn is_icount(&self, xlen: Xlen) -> bool {
        self.type_field(xlen) == TYPE_ICOUNT
    }

    // mcontrol fields
    fn select(&self) -> bool {
        self.data1 >> 19 & 1 != 0
    }

    fn timing(&self) -> TriggerTiming {
        if self.data1 >> 18 & 1 != 0 {
            TriggerTiming::After
        } else {
            TriggerTiming::Before
        }
    }

    fn action(&self) -> TriggerAction {
        if (self.data1 >> 12) & 0xF == 1 {
            TriggerAction::EnterDebug
        } else {
            TriggerAction::RaiseBreak
        }
    }

    fn chain(&self) -> bool {
        self.data1 >> 11 & 1 != 0
    }

    fn match_kind(&self) -> u64 {
        (self.data1 >> 7) & 0xF
    }

    fn mode_enabled(&self, mode: Mode, xlen: Xlen) -> bool {
        let (m, s, u) = if self.is_mcontrol(xlen) {
            (
                self.data1 >> 6 & 1 != 0,
                self.data1 >> 4 & 1 != 0,
                self.data1 >> 3 & 1 != 0,
            )
        } else {
            (
                self.data1 >> 9 & 1 != 0,
                self.data1 >> 7 & 1 != 0,
                self.data1 >> 6 & 1 != 0,
            )
        };
        match mode {
            Mode::Machine => m,
            Mode::Supervisor => s,
            Mode::User => u,
        }
    }

    fn matches_event(&self, event: TriggerEvent, xlen: Xlen) -> bool {
        if !self.is_mcontrol(xlen) {
            return false;
        }
        let execute = self.data1 >> 2 & 1 != 0;
        let store = self.data1 >> 1 & 1 != 0;
        let load = self.data1 & 1 != 0;
        match event {
            TriggerEvent::InstAddress => execute && !self.select(),
            TriggerEvent::InstOpcode => execute && self.select(),
            TriggerEvent::LoadAddress => load && !self.select(),
            TriggerEvent::LoadData => load && self.select(),
            TriggerEvent::StoreAddress => store && !self.select(),
            TriggerEvent::StoreData => store && self.select(),
        }
    }

    /// mcontrol match predicate against `value` (an address or data word).
    fn value_matches(&self, value: u64) -> bool {
        match self.match_kind() {
            0 => value == self.data2,
            1 => {
                // NAPOT: trailing ones of data2 select ignored low bits.
                let ones = self.data2.trailing_ones();
                if ones >= 63 {
                    return true;
                }
                let mask = !((1u64 << (ones + 1)) - 1);
                value & mask == self.data2 & mask
            }
            2 => value >= self.data2,
            3 => value < self.data2,
            _ => false,
        }
    }

    // icount fields
    fn icount(&self) -> u64 {
        (self.data1 >> 10) & 0x3FFF
    }

    fn set_icount(&mut self, count: u64) {
        self.data1 = (self.data1 & !(0x3FFF << 10)) | ((count & 0x3FFF) << 10);
    }
}

/// The trigger file: `tselect` plus [`TRIGGER_COUNT`] triggers.
pub struct Triggers {
    triggers: Vec<Trigger>,
    selected: usize,
    tripped_before: u32,
    tripped_after: u32,
}

impl Triggers {
    pub fn new() -> Self {
        Triggers {
            triggers: vec![Trigger::default(); TRIGGER_COUNT],
            selected: 0,
            tripped_before: 0,
            tripped_after: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.triggers.len()
    }

    pub fn tselect(&self) -> u64 {
        self.selected as u64
    }

    /// WARL: out-of-range selections are ignored.
    pub fn set_tselect(&mut self, value: u64) {
        if (value as usize) < self.triggers.len() {
            self.selected = value as usize;
        }
    }

    pub fn data1(&self) -> u64 {
        self.triggers[self.selected].data1
    }

    pub fn data2(&self) -> u64 {
        self.triggers[self.selected].data2
    }

    pub fn data3(&self) -> u64 {
        self.triggers[self.selected].data3
    }

    /// Write tdata1 of the selected trigger. Unsupported trigger types are
    /// coerced to 0 (WARL).
    pub fn set_data1(&mut self, value: u64, xlen: Xlen) {
        let ty = value >> (xlen.bits() - 4);
        let trigger = &mut self.triggers[self.selected];
        if ty == TYPE_MCONTROL || ty == TYPE_ICOUNT {
            trigger.data1 = value;
        } else {
            trigger.data1 = 0;
        }
    }

    pub fn set_data2(&mut self, value: u64) {
        self.triggers[self.selected].data2 = value;
    }

    pub fn set_data3(&mut self, value: u64) {
        self.triggers[self.selected].data3 = value;
    }

    /// Raw peek/poke by trigger index (debug interface).
    pub fn peek(&self, ix: usize) -> Option<(u64, u64, u64)> {
        self.triggers.get(ix).map(|t| (t.data1, t.data2, t.data3))
    }

    pub fn poke(&mut self, ix: usize, data1: u64, data2: u64, data3: u64) -> bool {
        match self.triggers.get_mut(ix) {
            Some(t) => {
                t.data1 = data1;
                t.data2 = data2;
                t.data3 = data3;
                true
            }
            None => false,
        }
    }

    /// Clear per-instruction hit state. Called at each instruction boundary.
    pub fn begin_instruction(&mut self) {
        for t in &mut self.triggers {
            t.hit = false;
        }
        self.tripped_before = 0;
        self.tripped_after = 0;
    }

    /// Counts of triggers tripped by the last instruction, `(before, after)`.
    pub fn tripped_counts(&self) -> (u32, u32) {
        (self.tripped_before, self.tripped_after)
    }

    /// Evaluate mcontrol triggers for `event` against `value` at `timing`.
    ///
    /// Chaining: a trigger with `chain` set only fires when the next trigger
    /// also matches; the whole chain then trips together. Returns the
    /// requested action of the tripped trigger(s), preferring debug entry.
    pub fn evaluate(
        &mut self,
        event: TriggerEvent,
        value: u64,
        timing: TriggerTiming,
        mode: Mode,
        xlen: Xlen,
    ) -> Option<TriggerAction> {
        let n = self.triggers.len();
        let mut raw_hit = vec![false; n];
        for (i, t) in self.triggers.iter().enumerate() {
            if t.matches_event(event, xlen)
                && t.mode_enabled(mode, xlen)
                && t.timing() == timing
                && t.value_matches(value)
            {
                raw_hit[i] = true;
            }
        }

        let mut action = None;
        let mut i = 0;
        while i < n {
            // Collect the chain starting at i.
            let mut end = i;
            while end < n && self.triggers[end].chain() {
                end += 1;
            }
            let chain_hit = (i..=end.min(n - 1)).all(|j| raw_hit[j]);
            if chain_hit && raw_hit[i] {
                for j in i..=end.min(n - 1) {
                    self.triggers[j].hit = true;
                    match timing {
                        TriggerTiming::Before => self.tripped_before += 1,
                        TriggerTiming::After => self.tripped_after += 1,
                    }
                    let a = self.triggers[j].action();
                    if action != Some(TriggerAction::EnterDebug) {
                        action = Some(a);
                    }
                }
            }
            i = end.max(i) + 1;
        }
        action
    }

    /// Count down armed icount triggers; fires when a count reaches zero.
    pub fn evaluate_icount(&mut self, mode: Mode, xlen: Xlen) -> Option<TriggerAction> {
        let mut action = None;
        for t in &mut self.triggers {
            if !t.is_icount(xlen) || !t.mode_enabled(mode, xlen) {
                continue;
            }
            let count = t.icount();
            if count == 0 {
                continue;
            }
            t.set_icount(count - 1);
            if count == 1 {
                t.hit = true;
                action = Some(if t.data1 & 0x3F == 1 {
                    TriggerAction::EnterDebug
                } else {
                    TriggerAction::RaiseBreak
                });
            }
        }
        if action.is_some() {
            self.tripped_after += 1;
        }
        action
    }
}

impl Default for Triggers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// mcontrol tdata1 for RV64: type=2 plus the given low bits.
    fn mcontrol64(bits: u64) -> u64 {
        (TYPE_MCONTROL << 60) | bits
    }

    const M_BIT: u64 = 1 << 6;
    const EXEC: u64 = 1 << 2;
    const LOAD: u64 = 1 << 0;
    const ACTION_DEBUG: u64 = 1 << 12;

    #[test]
    fn exact_address_match_trips() {
        let mut triggers = Triggers::new();
        triggers.set_tselect(0);
        triggers.set_data1(mcontrol64(M_BIT | LOAD), Xlen::Rv64);
        triggers.set_data2(0x8000_1000);
        triggers.begin_instruction();
        let action = triggers.evaluate(
            TriggerEvent::LoadAddress,
            0x8000_1000,
            TriggerTiming::Before,
            Mode::Machine,
            Xlen::Rv64,
        );
        assert_eq!(action, Some(TriggerAction::RaiseBreak));
        assert_eq!(triggers.tripped_counts(), (1, 0));
        // Different address: no trip.
        triggers.begin_instruction();
        let action = triggers.evaluate(
            TriggerEvent::LoadAddress,
            0x8000_1004,
            TriggerTiming::Before,
            Mode::Machine,
            Xlen::Rv64,
        );
        assert_eq!(action, None);
    }

    #[test]
    fn ge_match_and_action_debug() {
        let mut triggers = Triggers::new();
        triggers.set_data1(mcontrol64(M_BIT | EXEC | ACTION_DEBUG | (2 << 7)), Xlen::Rv64);
        triggers.set_data2(0x9000_0000);
        triggers.begin_instruction();
        let action = triggers.evaluate(
            TriggerEvent::InstAddress,
            0x9000_0010,
            TriggerTiming::Before,
            Mode::Machine,
            Xlen::Rv64,
        );
        assert_eq!(action, Some(TriggerAction::EnterDebug));
    }

    #[test]
    fn chained_triggers_require_both() {
        let mut triggers = Triggers::new();
        // Trigger 0 chains to trigger 1; both load-address in M.
        triggers.set_tselect(0);
        triggers.set_data1(mcontrol64(M_BIT | LOAD | (1 << 11)), Xlen::Rv64);
        triggers.set_data2(0x1000);
        triggers.set_tselect(1);
        triggers.set_data1(mcontrol64(M_BIT | LOAD | (2 << 7)), Xlen::Rv64);
        triggers.set_data2(0x2000);
        triggers.begin_instruction();
        // First matches, second does not (below 0x2000): chain suppressed.
        let action = triggers.evaluate(
            TriggerEvent::LoadAddress,
            0x1000,
            TriggerTiming::Before,
            Mode::Machine,
            Xlen::Rv64,
        );
        assert_eq!(action, None);
    }

    #[test]
    fn mode_filter_applies() {
        let mut triggers = Triggers::new();
        // User-only trigger.
        triggers.set_data1(mcontrol64((1 << 3) | LOAD), Xlen::Rv64);
        triggers.set_data2(0x1000);
        triggers.begin_instruction();
        assert_eq!(
            triggers.evaluate(
                TriggerEvent::LoadAddress,
                0x1000,
                TriggerTiming::Before,
                Mode::Machine,
                Xlen::Rv64,
            ),
            None
        );
        assert!(triggers
            .evaluate(
                TriggerEvent::LoadAddress,
                0x1000,
                TriggerTiming::Before,
                Mode::User,
                Xlen::Rv64,
            )
            .is_some());
    }

    #[test]
    fn icount_fires_after_count_instructions() {
        let mut triggers = Triggers::new();
        // icount type=3, count=2, m bit (bit 9).
        let data1 = (TYPE_ICOUNT << 60) | (2 << 10) | (1 << 9);
        triggers.set_data1(data1, Xlen::Rv64);
        triggers.begin_instruction();
        assert_eq!(triggers.evaluate_icount(Mode::Machine, Xlen::Rv64), None);
        assert_eq!(
            triggers.evaluate_icount(Mode::Machine, Xlen::Rv64),
            Some(TriggerAction::RaiseBreak)
        );
        // Count exhausted; no further trips.
        assert_eq!(triggers.evaluate_icount(Mode::Machine, Xlen::Rv64), None);
    }

    #[test]
    fn unsupported_type_coerces_to_zero() {
        let mut triggers = Triggers::new();
        triggers.set_data1(7 << 60, Xlen::Rv64);
        assert_eq!(triggers.data1(), 0);
    }
}

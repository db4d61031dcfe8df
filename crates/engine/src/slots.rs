//! Upload slot admission counters. Tracks how many `CC`s are currently
//! uploading (full slots) and how many of those are using a mini-slot,
//! against the caps in `Config`.
use std::sync::atomic::{AtomicU32, Ordering};

use tigerwire_core::config::Config;

#[derive(Default)]
pub struct SlotCounters {
    slots_in_use: AtomicU32,
    mini_in_use: AtomicU32,
}

/// What the slot table decided for one upload request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Admission {
    FullSlot,
    MiniSlot,
    Refused,
}

impl SlotCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slots_in_use(&self) -> u32 {
        self.slots_in_use.load(Ordering::Relaxed)
    }

    pub fn mini_in_use(&self) -> u32 {
        self.mini_in_use.load(Ordering::Relaxed)
    }

    /// Decide admission for a request of `file_size` bytes.
    /// `granted_slot` is true for a peer the user has explicitly granted a
    /// slot to; `is_operator` exempts mini-slot-only requests from the cap;
    /// `is_small` covers `files.xml.bz2` and partial list requests, which
    /// are mini-slot-eligible regardless of size.
    pub fn try_admit(
        &self,
        config: &Config,
        file_size: u64,
        is_small: bool,
        granted_slot: bool,
        is_operator: bool,
    ) -> Admission {
        let wants_full_slot = file_size >= config.minislot_size && !is_small;

        if granted_slot {
            self.slots_in_use.fetch_add(1, Ordering::Relaxed);
            return Admission::FullSlot;
        }

        if wants_full_slot {
            if self.try_take_full(config.slots) {
                return Admission::FullSlot;
            }
            return Admission::Refused;
        }

        // Small file, file list, or partial list: a full slot still
        // satisfies it too.
        if self.try_take_full(config.slots) {
            return Admission::FullSlot;
        }
        if is_operator || self.try_take_mini(config.minislots) {
            return Admission::MiniSlot;
        }
        Admission::Refused
    }

    fn try_take_full(&self, cap: u32) -> bool {
        loop {
            let cur = self.slots_in_use.load(Ordering::Relaxed);
            if cur >= cap {
                return false;
            }
            if self
                .slots_in_use
                .compare_exchange(cur, cur + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn try_take_mini(&self, cap: u32) -> bool {
        loop {
            let cur = self.mini_in_use.load(Ordering::Relaxed);
            if cur >= cap {
                return false;
            }
            if self
                .mini_in_use
                .compare_exchange(cur, cur + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release whatever `admission` held, once the upload's `Transfer`
    /// state ends.
    pub fn release(&self, admission: Admission) {
        match admission {
            Admission::FullSlot => {
                self.slots_in_use.fetch_sub(1, Ordering::Relaxed);
            }
            Admission::MiniSlot => {
                self.mini_in_use.fetch_sub(1, Ordering::Relaxed);
            }
            Admission::Refused => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config {
            slots: 1,
            minislots: 1,
            minislot_size: 64 * 1024,
            ..Config::default()
        }
    }

    #[test]
    fn full_slot_refused_once_exhausted() {
        let counters = SlotCounters::new();
        let config = cfg();
        let a = counters.try_admit(&config, 1_000_000, false, false, false);
        assert_eq!(a, Admission::FullSlot);
        let b = counters.try_admit(&config, 1_000_000, false, false, false);
        assert_eq!(b, Admission::Refused);
    }

    #[test]
    fn small_file_falls_back_to_minislot() {
        let counters = SlotCounters::new();
        let config = cfg();
        // Exhaust the one full slot with an unrelated big upload.
        assert_eq!(
            counters.try_admit(&config, 1_000_000, false, false, false),
            Admission::FullSlot
        );
        let small = counters.try_admit(&config, 1000, false, false, false);
        assert_eq!(small, Admission::MiniSlot);
    }

    #[test]
    fn operator_exempt_from_minislot_cap() {
        let counters = SlotCounters::new();
        let config = cfg();
        assert_eq!(
            counters.try_admit(&config, 1_000_000, false, false, false),
            Admission::FullSlot
        );
        assert_eq!(
            counters.try_admit(&config, 1000, false, false, false),
            Admission::MiniSlot
        );
        // Mini-slot cap (1) is now exhausted; a non-operator is refused...
        assert_eq!(
            counters.try_admit(&config, 1000, false, false, false),
            Admission::Refused
        );
        // ...but an operator is exempt.
        assert_eq!(
            counters.try_admit(&config, 1000, false, false, true),
            Admission::MiniSlot
        );
    }

    #[test]
    fn granted_slot_bypasses_cap_entirely() {
        let counters = SlotCounters::new();
        let config = cfg();
        assert_eq!(
            counters.try_admit(&config, 1_000_000, false, false, false),
            Admission::FullSlot
        );
        assert_eq!(
            counters.try_admit(&config, 1_000_000, false, true, false),
            Admission::FullSlot
        );
    }
}

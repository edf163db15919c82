// Copyright (C) 2025 piolink contributors
//
// MIT License

//! PIO slot ownership map
//!
//! The RP2350 host has two PIO blocks of four state machines each; a debug
//! session exclusively owns one `(block, state machine)` pair.  This module
//! is the pure bookkeeping - `piolink_swd::target` wraps a single process-wide
//! instance of [`SlotMap`] in a critical section.

use core::fmt;

/// State machines per PIO block
pub const SM_PER_BLOCK: u8 = 4;

/// A PIO block on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PioBlock {
    Pio0,
    Pio1,
}

impl PioBlock {
    fn index(&self) -> usize {
        match self {
            PioBlock::Pio0 => 0,
            PioBlock::Pio1 => 1,
        }
    }
}

impl fmt::Display for PioBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PioBlock::Pio0 => write!(f, "PIO0"),
            PioBlock::Pio1 => write!(f, "PIO1"),
        }
    }
}

/// A `(pio block, state machine)` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub block: PioBlock,
    pub sm: u8,
}

impl Slot {
    /// Returns `None` if the state machine index is out of range
    pub fn new(block: PioBlock, sm: u8) -> Option<Self> {
        (sm < SM_PER_BLOCK).then_some(Slot { block, sm })
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} SM{}", self.block, self.sm)
    }
}

/// Snapshot of slot usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotUsage {
    pub pio0_sm_used: [bool; SM_PER_BLOCK as usize],
    pub pio1_sm_used: [bool; SM_PER_BLOCK as usize],
    pub active_sessions: usize,
}

/// Ownership map from slot to session token
///
/// Invariants: at most one owner per slot; `active_count()` equals the
/// number of owned slots; releasing is idempotent.
#[derive(Debug, Default)]
pub struct SlotMap {
    owners: [[Option<u32>; SM_PER_BLOCK as usize]; 2],
}

impl SlotMap {
    pub const fn new() -> Self {
        SlotMap {
            owners: [[None; SM_PER_BLOCK as usize]; 2],
        }
    }

    /// Claim a specific slot for `owner`.  Fails if already owned.
    pub fn claim(&mut self, slot: Slot, owner: u32) -> bool {
        let entry = &mut self.owners[slot.block.index()][slot.sm as usize];
        if entry.is_some() {
            return false;
        }
        *entry = Some(owner);
        true
    }

    /// Claim the lowest free slot, PIO0 first.
    pub fn allocate(&mut self, owner: u32) -> Option<Slot> {
        for block in [PioBlock::Pio0, PioBlock::Pio1] {
            for sm in 0..SM_PER_BLOCK {
                let slot = Slot { block, sm };
                if self.claim(slot, owner) {
                    return Some(slot);
                }
            }
        }
        None
    }

    /// Release a slot.  Safe to call on an unowned slot.
    pub fn release(&mut self, slot: Slot) {
        self.owners[slot.block.index()][slot.sm as usize] = None;
    }

    /// The session owning a slot, if any
    pub fn owner_of(&self, slot: Slot) -> Option<u32> {
        self.owners[slot.block.index()][slot.sm as usize]
    }

    /// Number of owned slots
    pub fn active_count(&self) -> usize {
        self.owners
            .iter()
            .flatten()
            .filter(|owner| owner.is_some())
            .count()
    }

    /// Snapshot of current usage
    pub fn usage(&self) -> SlotUsage {
        let mut usage = SlotUsage {
            active_sessions: self.active_count(),
            ..Default::default()
        };
        for sm in 0..SM_PER_BLOCK as usize {
            usage.pio0_sm_used[sm] = self.owners[0][sm].is_some();
            usage.pio1_sm_used[sm] = self.owners[1][sm].is_some();
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_release() {
        let mut map = SlotMap::new();
        let slot = Slot::new(PioBlock::Pio0, 2).unwrap();

        assert!(map.claim(slot, 1));
        assert_eq!(map.owner_of(slot), Some(1));
        assert_eq!(map.active_count(), 1);

        // Second claim of the same slot fails, state unchanged
        assert!(!map.claim(slot, 2));
        assert_eq!(map.owner_of(slot), Some(1));

        map.release(slot);
        assert_eq!(map.owner_of(slot), None);
        assert_eq!(map.active_count(), 0);

        // Release is idempotent
        map.release(slot);
        assert_eq!(map.active_count(), 0);
    }

    #[test]
    fn allocate_lowest_free() {
        let mut map = SlotMap::new();
        let first = map.allocate(1).unwrap();
        assert_eq!(first, Slot::new(PioBlock::Pio0, 0).unwrap());

        let second = map.allocate(2).unwrap();
        assert_eq!(second, Slot::new(PioBlock::Pio0, 1).unwrap());

        map.release(first);
        let third = map.allocate(3).unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn allocate_exhaustion() {
        let mut map = SlotMap::new();
        for session in 0..8 {
            assert!(map.allocate(session).is_some());
        }
        assert_eq!(map.active_count(), 8);
        assert!(map.allocate(99).is_none());
    }

    #[test]
    fn sm_index_range() {
        assert!(Slot::new(PioBlock::Pio1, 3).is_some());
        assert!(Slot::new(PioBlock::Pio1, 4).is_none());
    }

    #[test]
    fn usage_snapshot() {
        let mut map = SlotMap::new();
        map.claim(Slot::new(PioBlock::Pio0, 0).unwrap(), 1);
        map.claim(Slot::new(PioBlock::Pio1, 3).unwrap(), 2);

        let usage = map.usage();
        assert_eq!(usage.active_sessions, 2);
        assert!(usage.pio0_sm_used[0]);
        assert!(!usage.pio0_sm_used[1]);
        assert!(usage.pio1_sm_used[3]);
    }
}

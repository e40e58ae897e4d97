//! Register slots and per-kind slot bookkeeping.
//!
//! Jitcodes address registers with a single byte, per kind. [`RegBitSet`]
//! tracks a set of slots of one bank (256 bits) and [`RegisterFile`] hands
//! out slots for all three banks, always picking the lowest slot that is
//! not excluded so slot indices stay contiguous from 0.

use super::value::{Kind, REGISTER_KINDS};
use std::fmt;

/// Number of addressable slots per kind.
pub const SLOTS_PER_BANK: usize = 256;

const WORDS: usize = SLOTS_PER_BANK / 64;

/// A register: a slot index within the bank of its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register {
    pub kind: Kind,
    pub index: u8,
}

impl Register {
    pub const fn new(kind: Kind, index: u8) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}{}", self.kind.letter(), self.index)
    }
}

/// Bit set over the 256 slots of one bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegBitSet {
    words: [u64; WORDS],
}

impl RegBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, slot: usize) -> bool {
        slot < SLOTS_PER_BANK && self.words[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    pub fn set(&mut self, slot: usize) {
        if slot < SLOTS_PER_BANK {
            self.words[slot / 64] |= 1u64 << (slot % 64);
        }
    }

    pub fn clear(&mut self, slot: usize) {
        if slot < SLOTS_PER_BANK {
            self.words[slot / 64] &= !(1u64 << (slot % 64));
        }
    }

    pub fn union(&mut self, other: &RegBitSet) {
        for (word, other) in self.words.iter_mut().zip(other.words.iter()) {
            *word |= other;
        }
    }

    /// Lowest slot not in the set.
    pub fn first_clear(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(i, word)| i * 64 + (!word).trailing_zeros() as usize)
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Slots in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..SLOTS_PER_BANK).filter(move |slot| self.contains(*slot))
    }
}

/// Error types for slot allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAllocError {
    /// Every slot of the bank is excluded.
    BankExhausted(Kind),
    /// Void values have no bank.
    NoBank,
}

impl fmt::Display for RegAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegAllocError::BankExhausted(kind) => {
                write!(f, "all {} {} slots are in use", SLOTS_PER_BANK, kind)
            }
            RegAllocError::NoBank => write!(f, "void values have no register bank"),
        }
    }
}

impl std::error::Error for RegAllocError {}

/// Slot bookkeeping for the three register banks of one jitcode.
#[derive(Debug, Clone, Default)]
pub struct RegisterFile {
    used: [RegBitSet; 3],
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a slot of `kind` outside `exclude`, preferring `preferred`.
    pub fn allocate(
        &mut self,
        kind: Kind,
        exclude: &RegBitSet,
        preferred: Option<u8>,
    ) -> Result<Register, RegAllocError> {
        let bank = kind.bank().ok_or(RegAllocError::NoBank)?;
        let slot = match preferred {
            Some(p) if !exclude.contains(p as usize) => p as usize,
            _ => exclude.first_clear().ok_or(RegAllocError::BankExhausted(kind))?,
        };
        self.used[bank].set(slot);
        Ok(Register::new(kind, slot as u8))
    }

    /// Mark a slot as used without searching.
    pub fn reserve(&mut self, reg: Register) -> Result<(), RegAllocError> {
        let bank = reg.kind.bank().ok_or(RegAllocError::NoBank)?;
        self.used[bank].set(reg.index as usize);
        Ok(())
    }

    /// Number of slots needed for `kind`: one past the highest used slot.
    pub fn count(&self, kind: Kind) -> usize {
        kind.bank()
            .and_then(|bank| self.used[bank].iter().last())
            .map_or(0, |slot| slot + 1)
    }

    pub fn counts(&self) -> [usize; 3] {
        REGISTER_KINDS.map(|kind| self.count(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_first_clear_spans_words() {
        let mut set = RegBitSet::new();
        for slot in 0..70 {
            set.set(slot);
        }
        assert_eq!(set.first_clear(), Some(70));
        set.clear(3);
        assert_eq!(set.first_clear(), Some(3));
        assert_eq!(set.count(), 69);
    }

    #[test]
    fn test_full_bitset_has_no_clear_slot() {
        let mut set = RegBitSet::new();
        for slot in 0..SLOTS_PER_BANK {
            set.set(slot);
        }
        assert_eq!(set.first_clear(), None);
    }

    #[test]
    fn test_allocate_prefers_hint() {
        let mut file = RegisterFile::new();
        let mut exclude = RegBitSet::new();
        exclude.set(0);

        let reg = file.allocate(Kind::Int, &exclude, Some(4)).unwrap();
        assert_eq!(reg, Register::new(Kind::Int, 4));

        let reg = file.allocate(Kind::Int, &exclude, Some(0)).unwrap();
        assert_eq!(reg.index, 1);

        assert_eq!(file.count(Kind::Int), 5);
        assert_eq!(file.count(Kind::Ref), 0);
        assert_eq!(
            file.allocate(Kind::Void, &exclude, None),
            Err(RegAllocError::NoBank)
        );
    }

    #[test]
    fn test_register_display() {
        assert_eq!(Register::new(Kind::Ref, 3).to_string(), "%r3");
        assert_eq!(Register::new(Kind::Float, 0).to_string(), "%f0");
    }
}

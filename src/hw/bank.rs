use std::fmt;

use serde::{Serialize, Serializer};

/// Highest number of memory banks a CU can be wired to.
pub const MAX_DDR_MAP: usize = 64;

/// Set of memory banks a compute unit can address.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BankSet([bool; MAX_DDR_MAP]);

impl BankSet {
    pub const fn empty() -> Self {
        Self([false; MAX_DDR_MAP])
    }

    /// Build a set from explicit bank ids. Returns the first id that does not
    /// fit in the map.
    pub fn from_banks(banks: &[u32]) -> Result<Self, u32> {
        let mut set = Self::empty();
        for &bank in banks {
            if !set.insert(bank) {
                return Err(bank);
            }
        }
        Ok(set)
    }

    /// Add `bank` to the set. Returns false if the id is out of range.
    pub fn insert(&mut self, bank: u32) -> bool {
        match self.0.get_mut(bank as usize) {
            Some(slot) => {
                *slot = true;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, bank: u32) -> bool {
        self.0.get(bank as usize).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, present)| **present)
            .map(|(bank, _)| bank as u32)
    }

    pub fn lowest(&self) -> Option<u32> {
        self.iter().next()
    }

    pub fn is_empty(&self) -> bool {
        self.lowest().is_none()
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }
}

impl Default for BankSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BankSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for BankSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_banks_and_contains() {
        let set = BankSet::from_banks(&[0, 3, 63]).unwrap();
        assert!(set.contains(0));
        assert!(set.contains(3));
        assert!(set.contains(63));
        assert!(!set.contains(1));
        assert!(!set.contains(64));
        assert!(!set.contains(u32::MAX));
        assert_eq!(set.to_vec(), vec![0, 3, 63]);
    }

    #[test]
    fn test_out_of_range_bank_is_reported() {
        assert_eq!(BankSet::from_banks(&[1, 64, 2]), Err(64));
    }

    #[test]
    fn test_lowest_and_empty() {
        assert!(BankSet::empty().is_empty());
        assert_eq!(BankSet::empty().lowest(), None);
        assert_eq!(BankSet::from_banks(&[5, 2]).unwrap().lowest(), Some(2));
    }

    #[test]
    fn test_serializes_as_bank_list() {
        let set = BankSet::from_banks(&[2, 1]).unwrap();
        assert_eq!(serde_json::to_string(&set).unwrap(), "[1,2]");
    }
}

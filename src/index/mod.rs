//! Per-fork batch index. The on-disk form lives in [`log`]; this module is
//! the in-memory ordered map of currently-live runs.

use std::collections::BTreeMap;

use crate::types::{Key, Location, MAX_SKEW};

pub(crate) mod log;

pub(crate) use log::IndexLog;

#[derive(Clone, Default)]
pub(crate) struct Index {
    tree: BTreeMap<Key, Location>,
    /// Sum of the live runs' lengths, i.e. the number of readable items.
    total: u64,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the run at `loc.key`, returning the previous
    /// run at that key if any.
    pub fn set(&mut self, loc: Location) -> Option<Location> {
        debug_assert!(!loc.is_tombstone());
        let prev = self.tree.insert(loc.key, loc);
        if let Some(prev) = prev {
            self.total -= prev.len as u64;
        }
        self.total += loc.len as u64;
        prev
    }

    pub fn remove(&mut self, key: Key) -> Option<Location> {
        let prev = self.tree.remove(&key);
        if let Some(prev) = prev {
            self.total -= prev.len as u64;
        }
        prev
    }

    pub fn get(&self, key: Key) -> Option<Location> {
        self.tree.get(&key).copied()
    }

    /// Inserts `loc`, de-duplicating an occupied key by probing
    /// `key+1 .. key+MAX_SKEW` for a free slot. Returns the location as
    /// inserted together with the skew that was applied, or `None` when
    /// every slot in the probe window is taken; the run is then not
    /// indexed at all and only an index rebuild can bring it back.
    pub fn set_with_skew(&mut self, mut loc: Location) -> (Option<Location>, i64) {
        if let Some(prev) = self.set(loc) {
            // restore the previous run and look for a free key nearby.
            self.set(prev);

            for skew in 1..MAX_SKEW {
                let probe = Key(loc.key.0 + skew);
                if self.tree.contains_key(&probe) {
                    continue;
                }
                loc.key = probe;
                self.set(loc);
                return (Some(loc), skew);
            }
            return (None, MAX_SKEW);
        }

        (Some(loc), 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, Location)> + '_ {
        self.tree.iter().map(|(k, l)| (*k, *l))
    }

    /// Number of readable items, O(1).
    pub fn item_count(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn num_entries(&self) -> usize {
        self.tree.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(key: i64, off: u64, len: u32) -> Location {
        Location {
            key: Key(key),
            off,
            len,
        }
    }

    #[test]
    fn set_and_remove_track_item_total() {
        let mut idx = Index::new();
        assert_eq!(idx.item_count(), 0);

        idx.set(loc(10, 0, 5));
        idx.set(loc(20, 100, 3));
        assert_eq!(idx.item_count(), 8);

        // overwrite replaces the old run's contribution.
        idx.set(loc(10, 200, 2));
        assert_eq!(idx.item_count(), 5);

        idx.remove(Key(20));
        assert_eq!(idx.item_count(), 2);
        idx.remove(Key(10));
        assert!(idx.is_empty());
        assert_eq!(idx.item_count(), 0);
    }

    #[test]
    fn skew_probes_next_free_key() {
        let mut idx = Index::new();
        let (first, skew) = idx.set_with_skew(loc(5, 0, 4));
        assert_eq!(skew, 0);
        assert_eq!(first.unwrap().key, Key(5));

        let (second, skew) = idx.set_with_skew(loc(5, 50, 4));
        assert_eq!(skew, 1);
        assert_eq!(second.unwrap().key, Key(6));

        // the original entry is untouched.
        assert_eq!(idx.get(Key(5)).unwrap().off, 0);
        assert_eq!(idx.get(Key(6)).unwrap().off, 50);
        assert_eq!(idx.item_count(), 8);
    }

    #[test]
    fn skew_gives_up_after_the_probe_window() {
        let mut idx = Index::new();
        for _ in 0..MAX_SKEW {
            let (inserted, _) = idx.set_with_skew(loc(0, 0, 1));
            assert!(inserted.is_some());
        }

        let (inserted, skew) = idx.set_with_skew(loc(0, 0, 1));
        assert!(inserted.is_none());
        assert_eq!(skew, MAX_SKEW);
        assert_eq!(idx.item_count(), MAX_SKEW as u64);
    }

    #[test]
    fn iteration_is_key_ordered() {
        let mut idx = Index::new();
        idx.set(loc(30, 0, 1));
        idx.set(loc(10, 0, 1));
        idx.set(loc(20, 0, 1));

        let keys: Vec<Key> = idx.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![Key(10), Key(20), Key(30)]);
    }
}

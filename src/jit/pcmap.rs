//! Program-counter keyed hash map
//!
//! Open addressing with a bounded linear probe: a key lives within
//! [`PROBE_DISTANCE`] slots of its home slot. When an insertion finds no
//! free slot inside that window the table doubles and every record is
//! rehashed.

use crate::bytecode::Pc;
use std::fmt;

/// Slots probed before the table grows
pub const PROBE_DISTANCE: usize = 16;

/// Smallest table size
pub const INITIAL_SIZE: usize = 16;

/// 64-to-32 bit integer hash (Thomas Wang's shift mix)
#[inline]
pub fn hash_pc(pc: Pc) -> u32 {
    let mut key = pc.0 as i64;
    key = (!key).wrapping_add(key << 18);
    key ^= ((key as u64) >> 31) as i64;
    key = key.wrapping_mul(21);
    key ^= ((key as u64) >> 11) as i64;
    key = key.wrapping_add(key << 6);
    key ^= ((key as u64) >> 22) as i64;
    key as u32
}

#[derive(Debug, Clone)]
struct Record<V> {
    hash: u32,
    key: Pc,
    value: V,
}

/// Outcome of [`PcMap::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    /// A new key was added
    Added,
    /// An existing key's value was replaced
    Updated,
}

/// Hash map from [`Pc`] to `V`
#[derive(Clone)]
pub struct PcMap<V> {
    records: Vec<Option<Record<V>>>,
    used: usize,
}

impl<V> PcMap<V> {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Map with room for at least `capacity` records (rounded up to a
    /// power of two)
    pub fn with_capacity(capacity: usize) -> Self {
        let size = capacity.max(INITIAL_SIZE).next_power_of_two();
        Self {
            records: Self::empty_table(size),
            used: 0,
        }
    }

    fn empty_table(size: usize) -> Vec<Option<Record<V>>> {
        std::iter::repeat_with(|| None).take(size).collect()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.records.len() - 1
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Number of slots in the table
    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    fn slot_of(&self, hash: u32, key: Pc) -> Option<usize> {
        let mut idx = hash as usize & self.mask();
        for _ in 0..PROBE_DISTANCE {
            if let Some(r) = &self.records[idx] {
                if r.hash == hash && r.key == key {
                    return Some(idx);
                }
            }
            idx = (idx + 1) & self.mask();
        }
        None
    }

    pub fn get(&self, key: Pc) -> Option<&V> {
        let idx = self.slot_of(hash_pc(key), key)?;
        self.records[idx].as_ref().map(|r| &r.value)
    }

    pub fn get_mut(&mut self, key: Pc) -> Option<&mut V> {
        let idx = self.slot_of(hash_pc(key), key)?;
        self.records[idx].as_mut().map(|r| &mut r.value)
    }

    pub fn contains_key(&self, key: Pc) -> bool {
        self.slot_of(hash_pc(key), key).is_some()
    }

    /// Insert or replace the value for `key`
    pub fn insert(&mut self, key: Pc, value: V) -> InsertStatus {
        let mut record = Record {
            hash: hash_pc(key),
            key,
            value,
        };
        loop {
            match self.try_insert(record) {
                Ok(status) => return status,
                Err(back) => {
                    record = back;
                    self.grow();
                }
            }
        }
    }

    fn try_insert(&mut self, record: Record<V>) -> std::result::Result<InsertStatus, Record<V>> {
        let mask = self.mask();
        let mut idx = record.hash as usize & mask;
        for _ in 0..PROBE_DISTANCE {
            match &mut self.records[idx] {
                slot @ None => {
                    *slot = Some(record);
                    self.used += 1;
                    return Ok(InsertStatus::Added);
                }
                Some(r) if r.hash == record.hash && r.key == record.key => {
                    *r = record;
                    return Ok(InsertStatus::Updated);
                }
                Some(_) => {}
            }
            idx = (idx + 1) & mask;
        }
        Err(record)
    }

    /// Double the table until every record fits its probe window
    fn grow(&mut self) {
        let mut size = self.records.len() * 2;
        let mut pending: Vec<Record<V>> = self.records.drain(..).flatten().collect();
        'rebuild: loop {
            self.records = Self::empty_table(size);
            self.used = 0;
            while let Some(record) = pending.pop() {
                if let Err(back) = self.try_insert(record) {
                    pending.push(back);
                    pending.extend(self.records.drain(..).flatten());
                    size *= 2;
                    continue 'rebuild;
                }
            }
            return;
        }
    }

    /// Remove `key`, re-seating the records that probed past it
    pub fn remove(&mut self, key: Pc) -> Option<V> {
        let idx = self.slot_of(hash_pc(key), key)?;
        let removed = self.records[idx].take()?;
        self.used -= 1;
        let mask = self.mask();
        let mut next = (idx + 1) & mask;
        for _ in 1..PROBE_DISTANCE {
            let Some(record) = self.records[next].take() else {
                break;
            };
            self.used -= 1;
            // the slot just vacated is always within the record's window
            if let Err(record) = self.try_insert(record) {
                self.records[next] = Some(record);
                self.used += 1;
            }
            next = (next + 1) & mask;
        }
        Some(removed.value)
    }

    pub fn clear(&mut self) {
        self.records = Self::empty_table(INITIAL_SIZE);
        self.used = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pc, &V)> {
        self.records.iter().flatten().map(|r| (r.key, &r.value))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.records.iter().flatten().map(|r| &r.value)
    }

    /// Entries sorted by program counter
    pub fn sorted(&self) -> Vec<(Pc, &V)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by_key(|(pc, _)| *pc);
        entries
    }

    /// Move every entry out, leaving the map empty
    pub fn drain(&mut self) -> Vec<(Pc, V)> {
        self.used = 0;
        let size = self.records.len();
        std::mem::replace(&mut self.records, Self::empty_table(size))
            .into_iter()
            .flatten()
            .map(|r| (r.key, r.value))
            .collect()
    }
}

impl<V> Default for PcMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: fmt::Debug> fmt::Debug for PcMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.sorted()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut map = PcMap::new();
        assert_eq!(map.insert(Pc(3), "a"), InsertStatus::Added);
        assert_eq!(map.insert(Pc(7), "b"), InsertStatus::Added);
        assert_eq!(map.get(Pc(3)), Some(&"a"));
        assert_eq!(map.get(Pc(7)), Some(&"b"));
        assert_eq!(map.get(Pc(4)), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_update_replaces_value() {
        let mut map = PcMap::new();
        map.insert(Pc(10), 1);
        assert_eq!(map.insert(Pc(10), 2), InsertStatus::Updated);
        assert_eq!(map.get(Pc(10)), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_grows_past_initial_size() {
        let mut map = PcMap::new();
        for i in 0..1000 {
            map.insert(Pc(i), i * 2);
        }
        assert_eq!(map.len(), 1000);
        assert!(map.capacity() >= 1000);
        for i in 0..1000 {
            assert_eq!(map.get(Pc(i)), Some(&(i * 2)));
        }
    }

    #[test]
    fn test_remove_keeps_probe_chains() {
        let mut map = PcMap::new();
        for i in 0..64 {
            map.insert(Pc(i), i);
        }
        for i in (0..64).step_by(3) {
            assert_eq!(map.remove(Pc(i)), Some(i));
        }
        for i in 0..64 {
            let expected = if i % 3 == 0 { None } else { Some(&i) };
            assert_eq!(map.get(Pc(i)), expected, "pc {}", i);
        }
        assert_eq!(map.remove(Pc(0)), None);
    }

    #[test]
    fn test_sorted_and_drain() {
        let mut map = PcMap::new();
        map.insert(Pc(5), 'x');
        map.insert(Pc(1), 'y');
        let keys: Vec<Pc> = map.sorted().into_iter().map(|(pc, _)| pc).collect();
        assert_eq!(keys, vec![Pc(1), Pc(5)]);
        let drained = map.drain();
        assert_eq!(drained.len(), 2);
        assert!(map.is_empty());
    }

    #[test]
    fn test_hash_spreads_neighbours() {
        assert_ne!(hash_pc(Pc(1)), hash_pc(Pc(2)));
        assert_eq!(hash_pc(Pc(42)), hash_pc(Pc(42)));
    }
}

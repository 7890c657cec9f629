//! Open-Addressing Hash Map
//!
//! Integer-keyed map from protocol identifiers (windows, atoms, composite
//! keys) to values. Linear probing over a power-of-two table with cached
//! hashes and backward-shift deletion: removal shifts same-cluster entries
//! back until the probe sequence is unbroken, so the insert/remove-heavy
//! coalescing workload never accumulates tombstones.
//!
//! INVARIANT: key 0 is reserved to mark empty slots and must not be used.

#[derive(Debug)]
struct Entry<V> {
    key: u64,
    hash: u32,
    value: V,
}

#[derive(Debug)]
pub struct OpenHash<V> {
    entries: Vec<Option<Entry<V>>>,
    len: usize,
}

/// MurmurHash3 64-bit finalizer, truncated.
pub(crate) fn hash_key(key: u64) -> u32 {
    let mut k = key;
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k as u32
}

impl<V> OpenHash<V> {
    pub fn new() -> Self {
        OpenHash {
            entries: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Insert or replace. Returns the previous value for the key, if any.
    pub fn insert(&mut self, key: u64, value: V) -> Option<V> {
        assert!(key != 0, "key 0 is reserved");
        if (self.len + 1) * 4 > self.entries.len() * 3 {
            let new_cap = if self.entries.is_empty() {
                16
            } else {
                self.entries.len() * 2
            };
            self.resize(new_cap);
        }

        let hash = hash_key(key);
        let mask = self.entries.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            match &mut self.entries[idx] {
                Some(e) if e.key == key => {
                    return Some(std::mem::replace(&mut e.value, value));
                }
                Some(_) => idx = (idx + 1) & mask,
                slot @ None => {
                    *slot = Some(Entry { key, hash, value });
                    self.len += 1;
                    return None;
                }
            }
        }
    }

    pub fn get(&self, key: u64) -> Option<&V> {
        let idx = self.probe(key)?;
        self.entries[idx].as_ref().map(|e| &e.value)
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut V> {
        let idx = self.probe(key)?;
        self.entries[idx].as_mut().map(|e| &mut e.value)
    }

    /// Remove a key, returning its value. Uses backward-shift deletion.
    pub fn remove(&mut self, key: u64) -> Option<V> {
        let idx = self.probe(key)?;
        let removed = self.entries[idx].take();
        self.len -= 1;

        let mask = self.entries.len() - 1;
        let mut hole = idx;
        let mut j = (hole + 1) & mask;
        while let Some(e) = &self.entries[j] {
            let home = e.hash as usize & mask;
            let should_move = if home <= j {
                home <= hole && hole < j
            } else {
                hole < j || home <= hole
            };
            if should_move {
                self.entries[hole] = self.entries[j].take();
                hole = j;
            }
            j = (j + 1) & mask;
        }

        removed.map(|e| e.value)
    }

    /// Drop all entries, retaining the table's capacity.
    pub fn clear(&mut self) {
        for slot in &mut self.entries {
            *slot = None;
        }
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> {
        self.entries
            .iter()
            .filter_map(|slot| slot.as_ref().map(|e| (e.key, &e.value)))
    }

    fn probe(&self, key: u64) -> Option<usize> {
        assert!(key != 0, "key 0 is reserved");
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut idx = hash_key(key) as usize & mask;
        while let Some(e) = &self.entries[idx] {
            if e.key == key {
                return Some(idx);
            }
            idx = (idx + 1) & mask;
        }
        None
    }

    fn resize(&mut self, new_cap: usize) {
        debug_assert!(new_cap.is_power_of_two());
        let old = std::mem::replace(&mut self.entries, Vec::new());
        self.entries.resize_with(new_cap, || None);
        let mask = new_cap - 1;
        for slot in old {
            let Some(e) = slot else { continue };
            let mut idx = e.hash as usize & mask;
            while self.entries[idx].is_some() {
                idx = (idx + 1) & mask;
            }
            self.entries[idx] = Some(e);
        }
    }
}

impl<V> Default for OpenHash<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_without_growing_len() {
        let mut map = OpenHash::new();
        assert_eq!(map.insert(7, "a"), None);
        assert_eq!(map.insert(7, "b"), Some("a"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(7), Some(&"b"));
    }

    #[test]
    fn remove_reports_presence() {
        let mut map = OpenHash::new();
        map.insert(1, 10u32);
        assert_eq!(map.remove(1), Some(10));
        assert_eq!(map.remove(1), None);
        assert_eq!(map.get(1), None);
    }

    #[test]
    fn heavy_churn_with_backshift() {
        let mut map = OpenHash::new();
        for k in 1..=4000u64 {
            map.insert(k, k * 2);
        }
        for k in (2..=4000u64).step_by(2) {
            assert_eq!(map.remove(k), Some(k * 2));
        }
        // Every odd key still resolves after the shift storm.
        for k in (1..=3999u64).step_by(2) {
            assert_eq!(map.get(k), Some(&(k * 2)));
        }
        for k in (2..=4000u64).step_by(2) {
            map.insert(k, k * 3);
        }
        for k in 1..=4000u64 {
            let expected = if k % 2 == 0 { k * 3 } else { k * 2 };
            assert_eq!(map.get(k), Some(&expected));
        }
        assert_eq!(map.len(), 4000);
    }

    #[test]
    fn clear_retains_capacity() {
        let mut map = OpenHash::new();
        for k in 1..=100u64 {
            map.insert(k, ());
        }
        let cap = map.capacity();
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.capacity(), cap);
        map.insert(5, ());
        assert_eq!(map.len(), 1);
    }

    #[test]
    #[should_panic(expected = "key 0 is reserved")]
    fn key_zero_rejected() {
        let mut map = OpenHash::new();
        map.insert(0, ());
    }
}

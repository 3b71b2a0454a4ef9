//! Bucket-chained hash table shared by the symbol table and environments.
//!
//! The table has a fixed bucket array; every bucket is a small vector of
//! `(key, value)` entries. It never resizes on its own: owners check
//! [`HashTable::is_full`] after inserting and call [`HashTable::grow`], which
//! rehashes every entry into `capacity * 2 + 1` buckets.
//!
//! Inserting an existing key overwrites its entry in place, so a bucket never
//! holds two entries for one key.

use rustc_hash::FxBuildHasher;
use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};

/// Occupancy above which a table of `capacity` buckets counts as full
pub(crate) const fn fill_limit(capacity: usize) -> usize {
    capacity * 3 / 4
}

/// Bucket count after one growth step
pub(crate) const fn grown_capacity(capacity: usize) -> usize {
    capacity * 2 + 1
}

type Bucket<K, V> = Vec<(K, V)>;

#[derive(Debug, Clone)]
pub struct HashTable<K, V> {
    buckets: Vec<Bucket<K, V>>,
    count: usize,
}

impl<K: Hash + Eq, V> HashTable<K, V> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        HashTable {
            buckets: (0..capacity).map(|_| Vec::new()).collect(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of buckets
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_full(&self) -> bool {
        fill_limit(self.capacity()) < self.count
    }

    fn index<Q>(&self, key: &Q) -> usize
    where
        Q: Hash + ?Sized,
    {
        let hash = FxBuildHasher.hash_one(key);
        (hash % self.buckets.len() as u64) as usize
    }

    pub fn value<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.buckets[self.index(key)]
            .iter()
            .find(|(k, _)| <K as Borrow<Q>>::borrow(k) == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.value(key).is_some()
    }

    /// Overwrite the value of an existing key.
    /// Returns the previous value, or `None` (and drops `value`) if the key is absent.
    pub fn update<Q>(&mut self, key: &Q, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = self.index(key);
        self.buckets[index]
            .iter_mut()
            .find(|(k, _)| <K as Borrow<Q>>::borrow(k) == key)
            .map(|(_, slot)| std::mem::replace(slot, value))
    }

    /// Insert or overwrite. Returns the previous value when the key was present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let index = self.index(&key);
        let bucket = &mut self.buckets[index];
        if let Some((_, slot)) = bucket.iter_mut().find(|(k, _)| *k == key) {
            return Some(std::mem::replace(slot, value));
        }
        bucket.push((key, value));
        self.count += 1;
        None
    }

    /// Take every entry out, in bucket order, leaving the table empty with its
    /// bucket count unchanged
    pub fn get_all_elements(&mut self) -> Vec<(K, V)> {
        self.count = 0;
        self.buckets.iter_mut().flat_map(std::mem::take).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().map(|(k, v)| (k, v)))
    }

    /// Rehash every entry into a bucket array of `capacity * 2 + 1`.
    pub fn grow(&mut self) {
        let entries = self.get_all_elements();
        self.buckets = (0..grown_capacity(self.capacity())).map(|_| Vec::new()).collect();
        self.count = entries.len();
        for (key, value) in entries {
            let index = self.index(&key);
            self.buckets[index].push((key, value));
        }
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_insert_and_lookup_by_borrowed_key() {
        let mut table: HashTable<String, i64> = HashTable::with_capacity(4);
        assert!(table.is_empty());
        assert_eq!(table.insert("alpha".to_owned(), 1), None);
        assert_eq!(table.insert("beta".to_owned(), 2), None);

        assert_eq!(table.value("alpha"), Some(&1));
        assert_eq!(table.value("beta"), Some(&2));
        assert_eq!(table.value("gamma"), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_insert_existing_key_overwrites_without_duplicate() {
        let mut table: HashTable<String, i64> = HashTable::with_capacity(1);
        table.insert("x".to_owned(), 1);
        assert_eq!(table.insert("x".to_owned(), 2), Some(1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.iter().count(), 1);
        assert_eq!(table.value("x"), Some(&2));
    }

    #[test]
    fn test_update_only_touches_present_keys() {
        let mut table: HashTable<String, i64> = HashTable::with_capacity(8);
        assert_eq!(table.update("missing", 5), None);
        assert!(!table.contains_key("missing"));

        table.insert("present".to_owned(), 1);
        assert_eq!(table.update("present", 7), Some(1));
        assert_eq!(table.value("present"), Some(&7));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_full_threshold_and_growth() {
        let mut table: HashTable<u32, u32> = HashTable::with_capacity(4);
        // fill limit of 4 buckets is 3, so the fourth entry makes it full
        for n in 0..3 {
            table.insert(n, n * 10);
            assert!(!table.is_full());
        }
        table.insert(3, 30);
        assert!(table.is_full());

        table.grow();
        assert_eq!(table.capacity(), 9);
        assert!(!table.is_full());
        assert_eq!(table.len(), 4);
        for n in 0..4 {
            assert_eq!(*table.value(&n).unwrap(), n * 10);
        }
    }

    #[test]
    fn test_many_collisions_in_single_bucket() {
        let mut table: HashTable<u32, u32> = HashTable::with_capacity(0);
        assert_eq!(table.capacity(), 1);
        for n in 0..50 {
            table.insert(n, n + 1);
        }
        for n in 0..50 {
            assert_eq!(table.value(&n), Some(&(n + 1)));
        }
        let mut values: Vec<u32> = table.get_all_elements().into_iter().map(|(_, v)| v).collect();
        values.sort_unstable();
        assert_eq!(values, (1..=50).collect::<Vec<_>>());
        assert!(table.is_empty());
        assert_eq!(table.capacity(), 1);
        assert_eq!(table.value(&7), None);
    }
}

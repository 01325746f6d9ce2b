use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use super::{StoreError, Table, Version, Versioned};

/// In-process [`Table`] backed by a `HashMap`.
///
/// The lock is held only for the duration of a single get/insert/swap, which
/// is exactly the atomicity a transactional store gives one record.
pub struct MemoryTable<K, V> {
    records: RwLock<HashMap<K, Versioned<V>>>,
}

impl<K, V> MemoryTable<K, V> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for MemoryTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("table lock poisoned".to_string())
}

impl<K, V> Table<K, V> for MemoryTable<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Result<Option<Versioned<V>>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(key).cloned())
    }

    fn insert(&self, key: K, value: V) -> Result<Versioned<V>, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        let record = Versioned { version: 1, value };
        records.insert(key, record.clone());
        Ok(record)
    }

    fn compare_and_swap(
        &self,
        key: &K,
        expected: Version,
        value: V,
    ) -> Result<Versioned<V>, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let current = records.get_mut(key).ok_or(StoreError::NotFound)?;
        if current.version != expected {
            return Err(StoreError::Conflict {
                expected,
                found: current.version,
            });
        }
        current.version += 1;
        current.value = value;
        Ok(current.clone())
    }

    fn scan(&self) -> Result<Vec<Versioned<V>>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get() {
        let table = MemoryTable::new();
        let created = table.insert(1u32, "a".to_string()).unwrap();
        assert_eq!(created.version, 1);
        assert_eq!(table.get(&1).unwrap(), Some(created));
        assert_eq!(table.get(&2).unwrap(), None);
    }

    #[test]
    fn insert_twice_fails() {
        let table = MemoryTable::new();
        table.insert(1u32, 10u64).unwrap();
        assert_eq!(table.insert(1, 20), Err(StoreError::AlreadyExists));
        assert_eq!(table.get(&1).unwrap().unwrap().value, 10);
    }

    #[test]
    fn swap_bumps_version() {
        let table = MemoryTable::new();
        table.insert(1u32, 10u64).unwrap();
        let updated = table.compare_and_swap(&1, 1, 11).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.value, 11);
    }

    #[test]
    fn stale_swap_conflicts_and_keeps_value() {
        let table = MemoryTable::new();
        table.insert(1u32, 10u64).unwrap();
        table.compare_and_swap(&1, 1, 11).unwrap();

        let result = table.compare_and_swap(&1, 1, 99);
        assert_eq!(
            result,
            Err(StoreError::Conflict {
                expected: 1,
                found: 2
            })
        );
        assert_eq!(table.get(&1).unwrap().unwrap().value, 11);
    }

    #[test]
    fn swap_missing_record_fails() {
        let table: MemoryTable<u32, u64> = MemoryTable::new();
        assert_eq!(table.compare_and_swap(&1, 1, 5), Err(StoreError::NotFound));
    }

    #[test]
    fn transient_errors() {
        assert!(StoreError::Conflict { expected: 1, found: 2 }.is_transient());
        assert!(StoreError::AlreadyExists.is_transient());
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::NotFound.is_transient());
    }
}

//! In-memory storage for tests and ephemeral servers.

use std::collections::HashMap;

use prefsync_core::PrefType;

use super::{PrefStorage, StorageError, StorageFactory};

/// Ephemeral per-namespace table. Contents die with the handle.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: HashMap<String, (PrefType, String)>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded table, for tests that need existing state.
    pub fn with_entries(entries: Vec<(String, PrefType, String)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, t, v)| (k, (t, v)))
                .collect(),
        }
    }
}

impl PrefStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<(PrefType, String)>, StorageError> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, pref_type: PrefType, value: &str) -> Result<(), StorageError> {
        self.entries
            .insert(key.to_string(), (pref_type, value.to_string()));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.entries.clear();
        Ok(())
    }

    fn enumerate(&self) -> Result<Vec<(String, PrefType, String)>, StorageError> {
        Ok(self
            .entries
            .iter()
            .map(|(k, (t, v))| (k.clone(), *t, v.clone()))
            .collect())
    }
}

/// Hands out a fresh empty table per namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryFactory;

impl MemoryFactory {
    pub fn new() -> Self {
        Self
    }
}

impl StorageFactory for MemoryFactory {
    fn open(&self, _namespace: &str) -> Result<Box<dyn PrefStorage>, StorageError> {
        Ok(Box::new(MemoryStorage::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_remove() {
        let mut storage = MemoryStorage::new();

        storage.put("theme", PrefType::String, "dark").unwrap();
        assert_eq!(
            storage.get("theme").unwrap(),
            Some((PrefType::String, "dark".to_string()))
        );

        assert!(storage.remove("theme").unwrap());
        assert!(!storage.remove("theme").unwrap());
        assert_eq!(storage.get("theme").unwrap(), None);
    }

    #[test]
    fn test_put_overwrites_type_and_value() {
        let mut storage = MemoryStorage::new();
        storage.put("k", PrefType::Int, "1").unwrap();
        storage.put("k", PrefType::Bool, "true").unwrap();
        assert_eq!(
            storage.get("k").unwrap(),
            Some((PrefType::Bool, "true".to_string()))
        );
    }

    #[test]
    fn test_clear_and_enumerate() {
        let mut storage = MemoryStorage::new();
        storage.put("a", PrefType::Int, "1").unwrap();
        storage.put("b", PrefType::Int, "2").unwrap();

        let mut rows = storage.enumerate().unwrap();
        rows.sort();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "a");

        storage.clear().unwrap();
        assert!(storage.enumerate().unwrap().is_empty());
    }

    #[test]
    fn test_factory_opens_independent_tables() {
        let factory = MemoryFactory::new();
        let mut a = factory.open("a").unwrap();
        let b = factory.open("b").unwrap();

        a.put("k", PrefType::Int, "1").unwrap();
        assert!(b.get("k").unwrap().is_none());
    }
}

//! The authoritative preference store.
//!
//! One `PrefStore` per serving process owns every namespace: a
//! lock-guarded table of per-namespace entry maps, each lazily loaded
//! from its injected storage handle on first access. All reads and
//! mutations serialize on the table lock, and a mutation persists
//! *before* its change record is published — still under the lock — so
//! no subscriber can observe a notification for a value that is not
//! durably stored, and record order per namespace equals mutation
//! order.
//!
//! ```text
//! Update RPC ──► policy check ──► decode-validate ──► persist
//!                                                        │
//!                            ChangeBus ◄── publish ◄─────┘
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use prefsync_core::{AccessPolicy, FormatError, PrefType, PrefValue};

use crate::broadcast::ChangeBus;
use crate::protocol::{ChangeRecord, ProtocolError, UpdateAction, WireEntry, WireError};
use crate::storage::{PrefStorage, StorageError, StorageFactory};

/// State for one loaded namespace.
struct NamespaceState {
    entries: HashMap<String, (PrefType, String)>,
    storage: Box<dyn PrefStorage>,
    /// Mutation counter; assigned under the store lock, carried by
    /// every change record and ack.
    seq: u64,
}

/// The single authoritative, lock-protected table owning all
/// namespaces.
pub struct PrefStore {
    namespaces: Mutex<HashMap<String, NamespaceState>>,
    factory: Box<dyn StorageFactory>,
    policy: Arc<dyn AccessPolicy>,
    bus: Arc<ChangeBus>,
}

impl PrefStore {
    pub fn new(
        factory: Box<dyn StorageFactory>,
        policy: Arc<dyn AccessPolicy>,
        bus: Arc<ChangeBus>,
    ) -> Self {
        Self {
            namespaces: Mutex::new(HashMap::new()),
            factory,
            policy,
            bus,
        }
    }

    /// The change bus this store publishes on.
    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    /// Snapshot one namespace: its current sequence and all entries.
    pub async fn read_all(&self, namespace: &str) -> Result<(u64, Vec<WireEntry>), SyncError> {
        if !self.policy.check(namespace, "", false) {
            return Err(SyncError::PermissionDenied {
                namespace: namespace.to_string(),
                key: String::new(),
            });
        }

        let mut table = self.namespaces.lock().await;
        let ns = Self::load(&mut table, &*self.factory, namespace)?;
        let entries = ns
            .entries
            .iter()
            .map(|(key, (pref_type, value))| WireEntry::new(key.clone(), *pref_type, value.clone()))
            .collect();
        Ok((ns.seq, entries))
    }

    /// Store one entry and publish the change.
    ///
    /// The wire string is decode-validated against its tag first, so a
    /// malformed write is rejected before it can reach any cache.
    pub async fn put(
        &self,
        namespace: &str,
        key: &str,
        pref_type: PrefType,
        value: &str,
        change_id: Uuid,
    ) -> Result<u64, SyncError> {
        if !self.policy.check(namespace, key, true) {
            return Err(SyncError::PermissionDenied {
                namespace: namespace.to_string(),
                key: key.to_string(),
            });
        }
        PrefValue::decode(value, pref_type)?;

        let mut table = self.namespaces.lock().await;
        let ns = Self::load(&mut table, &*self.factory, namespace)?;
        ns.storage.put(key, pref_type, value)?;
        ns.entries
            .insert(key.to_string(), (pref_type, value.to_string()));
        ns.seq += 1;
        let seq = ns.seq;
        self.bus
            .publish(ChangeRecord::put(
                namespace, seq, change_id, key, pref_type, value,
            ))
            .await;
        Ok(seq)
    }

    /// Delete one entry and publish the change.
    ///
    /// A record is published whether or not the key existed, so caches
    /// can reconcile a remove they never saw the put for.
    pub async fn remove(
        &self,
        namespace: &str,
        key: &str,
        change_id: Uuid,
    ) -> Result<u64, SyncError> {
        if !self.policy.check(namespace, key, true) {
            return Err(SyncError::PermissionDenied {
                namespace: namespace.to_string(),
                key: key.to_string(),
            });
        }

        let mut table = self.namespaces.lock().await;
        let ns = Self::load(&mut table, &*self.factory, namespace)?;
        ns.storage.remove(key)?;
        ns.entries.remove(key);
        ns.seq += 1;
        let seq = ns.seq;
        self.bus
            .publish(ChangeRecord::remove(namespace, seq, change_id, key))
            .await;
        Ok(seq)
    }

    /// Delete every entry in a namespace and publish one wildcard
    /// record.
    pub async fn clear(&self, namespace: &str, change_id: Uuid) -> Result<u64, SyncError> {
        if !self.policy.check(namespace, "", true) {
            return Err(SyncError::PermissionDenied {
                namespace: namespace.to_string(),
                key: String::new(),
            });
        }

        let mut table = self.namespaces.lock().await;
        let ns = Self::load(&mut table, &*self.factory, namespace)?;
        ns.storage.clear()?;
        ns.entries.clear();
        ns.seq += 1;
        let seq = ns.seq;
        self.bus
            .publish(ChangeRecord::clear(namespace, seq, change_id))
            .await;
        Ok(seq)
    }

    /// Dispatch one update action. The RPC surface for transports.
    pub async fn apply(
        &self,
        namespace: &str,
        action: UpdateAction,
        change_id: Uuid,
    ) -> Result<u64, SyncError> {
        match action {
            UpdateAction::Put {
                key,
                pref_type,
                value,
            } => self.put(namespace, &key, pref_type, &value, change_id).await,
            UpdateAction::Remove { key } => self.remove(namespace, &key, change_id).await,
            UpdateAction::Clear => self.clear(namespace, change_id).await,
        }
    }

    fn load<'a>(
        table: &'a mut HashMap<String, NamespaceState>,
        factory: &dyn StorageFactory,
        namespace: &str,
    ) -> Result<&'a mut NamespaceState, SyncError> {
        match table.entry(namespace.to_string()) {
            Entry::Occupied(occupied) => Ok(occupied.into_mut()),
            Entry::Vacant(vacant) => {
                let storage = factory.open(namespace)?;
                let mut entries = HashMap::new();
                for (key, pref_type, value) in storage.enumerate()? {
                    entries.insert(key, (pref_type, value));
                }
                log::debug!(
                    "Loaded namespace {namespace} ({} entries)",
                    entries.len()
                );
                Ok(vacant.insert(NamespaceState {
                    entries,
                    storage,
                    seq: 0,
                }))
            }
        }
    }
}

/// Failure of a sync operation, as seen by a client.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// The access policy denied the operation; nothing was mutated.
    PermissionDenied { namespace: String, key: String },
    /// A wire string failed to decode under its declared tag.
    Format(FormatError),
    Storage(StorageError),
    Protocol(ProtocolError),
    /// The RPC or notification transport failed.
    Transport(String),
    /// The store rejected the operation (remote-side detail).
    Rejected(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::PermissionDenied { namespace, key } if key.is_empty() => {
                write!(f, "Permission denied: namespace {namespace}")
            }
            SyncError::PermissionDenied { namespace, key } => {
                write!(f, "Permission denied: {namespace}/{key}")
            }
            SyncError::Format(e) => write!(f, "Format error: {e}"),
            SyncError::Storage(e) => write!(f, "Storage error: {e}"),
            SyncError::Protocol(e) => write!(f, "Protocol error: {e}"),
            SyncError::Transport(e) => write!(f, "Transport error: {e}"),
            SyncError::Rejected(e) => write!(f, "Rejected by store: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<FormatError> for SyncError {
    fn from(e: FormatError) -> Self {
        SyncError::Format(e)
    }
}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        SyncError::Storage(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

impl From<WireError> for SyncError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::PermissionDenied { namespace, key } => {
                SyncError::PermissionDenied { namespace, key }
            }
            WireError::Format { detail }
            | WireError::Storage { detail }
            | WireError::Unsupported { detail } => SyncError::Rejected(detail),
        }
    }
}

impl From<&SyncError> for WireError {
    fn from(e: &SyncError) -> Self {
        match e {
            SyncError::PermissionDenied { namespace, key } => WireError::PermissionDenied {
                namespace: namespace.clone(),
                key: key.clone(),
            },
            SyncError::Format(err) => WireError::Format {
                detail: err.to_string(),
            },
            SyncError::Storage(err) => WireError::Storage {
                detail: err.to_string(),
            },
            other => WireError::Unsupported {
                detail: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChangeKind;
    use crate::storage::{MemoryFactory, MemoryStorage};
    use prefsync_core::AllowAll;

    fn store() -> PrefStore {
        PrefStore::new(
            Box::new(MemoryFactory::new()),
            Arc::new(AllowAll),
            Arc::new(ChangeBus::new(64)),
        )
    }

    #[tokio::test]
    async fn test_read_all_empty_namespace() {
        let store = store();
        let (seq, entries) = store.read_all("settings").await.unwrap();
        assert_eq!(seq, 0);
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_put_then_read_all() {
        let store = store();
        let seq = store
            .put("settings", "theme", PrefType::String, "dark", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let (seq, entries) = store.read_all("settings").await.unwrap();
        assert_eq!(seq, 1);
        assert_eq!(
            entries,
            vec![WireEntry::new("theme", PrefType::String, "dark")]
        );
    }

    #[tokio::test]
    async fn test_records_published_in_mutation_order() {
        let store = store();
        let mut rx = store.bus().subscribe("settings").await;

        store
            .put("settings", "a", PrefType::Int, "1", Uuid::new_v4())
            .await
            .unwrap();
        store
            .remove("settings", "a", Uuid::new_v4())
            .await
            .unwrap();
        store.clear("settings", Uuid::new_v4()).await.unwrap();

        let r1 = rx.recv().await.unwrap();
        let r2 = rx.recv().await.unwrap();
        let r3 = rx.recv().await.unwrap();
        assert_eq!((r1.seq, r2.seq, r3.seq), (1, 2, 3));
        assert!(matches!(r1.kind, ChangeKind::Put { .. }));
        assert!(matches!(r2.kind, ChangeKind::Remove { .. }));
        assert!(matches!(r3.kind, ChangeKind::Clear));
    }

    #[tokio::test]
    async fn test_remove_of_absent_key_still_publishes() {
        let store = store();
        let mut rx = store.bus().subscribe("settings").await;

        let id = Uuid::new_v4();
        let seq = store.remove("settings", "ghost", id).await.unwrap();
        assert_eq!(seq, 1);

        let record = rx.recv().await.unwrap();
        assert_eq!(record.change_id, id);
        assert_eq!(record.key(), Some("ghost"));
    }

    #[tokio::test]
    async fn test_clear_publishes_single_wildcard_record() {
        let store = store();
        for key in ["a", "b", "c"] {
            store
                .put("settings", key, PrefType::Int, "1", Uuid::new_v4())
                .await
                .unwrap();
        }

        let mut rx = store.bus().subscribe("settings").await;
        store.clear("settings", Uuid::new_v4()).await.unwrap();

        let record = rx.recv().await.unwrap();
        assert!(matches!(record.kind, ChangeKind::Clear));
        assert!(rx.try_recv().is_err());

        let (_, entries) = store.read_all("settings").await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_put_rejects_malformed_wire_value() {
        let store = store();
        let mut rx = store.bus().subscribe("settings").await;

        let err = store
            .put("settings", "count", PrefType::Int, "not-a-number", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Format(_)));

        // No mutation, no record.
        assert!(rx.try_recv().is_err());
        let (seq, entries) = store.read_all("settings").await.unwrap();
        assert_eq!(seq, 0);
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_permission_denied_before_any_mutation() {
        struct DenyWrites;
        impl AccessPolicy for DenyWrites {
            fn check(&self, _namespace: &str, _key: &str, write: bool) -> bool {
                !write
            }
        }

        let store = PrefStore::new(
            Box::new(MemoryFactory::new()),
            Arc::new(DenyWrites),
            Arc::new(ChangeBus::new(64)),
        );
        let mut rx = store.bus().subscribe("settings").await;

        let err = store
            .put("settings", "theme", PrefType::String, "dark", Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::PermissionDenied { .. }));
        assert!(store.clear("settings", Uuid::new_v4()).await.is_err());

        assert!(rx.try_recv().is_err());
        let (_, entries) = store.read_all("settings").await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_read_permission_checked() {
        struct DenyReads;
        impl AccessPolicy for DenyReads {
            fn check(&self, _namespace: &str, _key: &str, write: bool) -> bool {
                write
            }
        }

        let store = PrefStore::new(
            Box::new(MemoryFactory::new()),
            Arc::new(DenyReads),
            Arc::new(ChangeBus::new(64)),
        );
        assert!(matches!(
            store.read_all("settings").await,
            Err(SyncError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_namespace_loads_existing_rows_from_storage() {
        struct SeededFactory;
        impl StorageFactory for SeededFactory {
            fn open(&self, namespace: &str) -> Result<Box<dyn PrefStorage>, StorageError> {
                let rows = if namespace == "settings" {
                    vec![("theme".to_string(), PrefType::String, "dark".to_string())]
                } else {
                    vec![]
                };
                Ok(Box::new(MemoryStorage::with_entries(rows)))
            }
        }

        let store = PrefStore::new(
            Box::new(SeededFactory),
            Arc::new(AllowAll),
            Arc::new(ChangeBus::new(64)),
        );
        let (_, entries) = store.read_all("settings").await.unwrap();
        assert_eq!(
            entries,
            vec![WireEntry::new("theme", PrefType::String, "dark")]
        );
        let (_, other) = store.read_all("other").await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_seq_is_per_namespace() {
        let store = store();
        store
            .put("a", "k", PrefType::Int, "1", Uuid::new_v4())
            .await
            .unwrap();
        store
            .put("a", "k", PrefType::Int, "2", Uuid::new_v4())
            .await
            .unwrap();
        let seq_b = store
            .put("b", "k", PrefType::Int, "1", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(seq_b, 1);
    }
}

//! Per-process preference cache with change-notification sync.
//!
//! A [`SharedPrefs`] mirrors one namespace: seeded by a single
//! baseline read, kept current by the namespace's change records, and
//! mutated through a transactional [`Editor`]. Reads never leave the
//! process.
//!
//! ## Self-change suppression
//!
//! Every outbound mutation carries a change id minted here and
//! registered in the pending set *before* the RPC is issued. The
//! commit applies the change locally and reports it to listeners
//! immediately; when the record echoes back over the bus, the first
//! delivery carrying a pending id is consumed silently. A record with
//! an unrecognized id is foreign and applied normally.
//!
//! Echoes solve only half of the ordering problem: a foreign record
//! that serialized *before* our own write can still arrive *after*
//! our optimistic apply. The store's per-namespace sequence closes
//! that window — the cache records the sequence each key was last
//! applied at (acks carry it for our own writes) and drops records
//! that are not newer.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use prefsync_core::{PrefType, PrefValue};

use crate::protocol::{ChangeKind, ChangeRecord, UpdateAction};
use crate::store::SyncError;
use crate::transport::{ChangeStream, Transport};

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// Handle returned by [`SharedPrefs::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Cache state guarded by one lock: the mirror of the namespace, the
/// per-key sequence watermarks, and the pending change-id set. The
/// lock serializes commits against record delivery.
struct CacheState {
    values: HashMap<String, PrefValue>,
    /// Sequence each key was last applied at. Kept for removed keys
    /// so a removal cannot be resurrected by a late record.
    seqs: HashMap<String, u64>,
    /// Change ids of our own writes, awaiting their echo.
    pending: HashSet<Uuid>,
}

/// Read-through cache over one namespace of the authoritative store.
pub struct SharedPrefs {
    name: String,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<CacheState>>,
    listeners: Arc<std::sync::Mutex<Vec<(u64, Listener)>>>,
    next_listener: AtomicU64,
    notifier: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SharedPrefs {
    /// Attach to a namespace: subscribe, seed with one full read, and
    /// start applying change records.
    ///
    /// Subscription happens before the baseline read so nothing can
    /// fall between them; any record already reflected in the baseline
    /// arrives with a sequence at or below the snapshot's and is
    /// dropped as stale.
    pub async fn attach(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, SyncError> {
        let name = name.into();
        let stream = transport.subscribe(&name).await?;
        let (seq, entries) = transport.read_all(&name).await?;

        let mut values = HashMap::new();
        let mut seqs = HashMap::new();
        for entry in entries {
            match PrefValue::decode(&entry.value, entry.pref_type) {
                Ok(value) => {
                    seqs.insert(entry.key.clone(), seq);
                    values.insert(entry.key, value);
                }
                Err(e) => log::warn!("Skipping undecodable entry {}: {e}", entry.key),
            }
        }
        log::info!("Attached to namespace {name} ({} entries)", values.len());

        let prefs = Arc::new(Self {
            name: name.clone(),
            transport,
            state: Arc::new(Mutex::new(CacheState {
                values,
                seqs,
                pending: HashSet::new(),
            })),
            listeners: Arc::new(std::sync::Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(0),
            notifier: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(Self::notify_loop(
            name,
            stream,
            prefs.state.clone(),
            prefs.listeners.clone(),
        ));
        *prefs.notifier.lock().unwrap() = Some(handle);

        Ok(prefs)
    }

    /// Namespace this cache mirrors.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.state.lock().await.values.get(key) {
            Some(PrefValue::Bool(v)) => *v,
            _ => default,
        }
    }

    pub async fn get_int(&self, key: &str, default: i32) -> i32 {
        match self.state.lock().await.values.get(key) {
            Some(PrefValue::Int(v)) => *v,
            _ => default,
        }
    }

    pub async fn get_long(&self, key: &str, default: i64) -> i64 {
        match self.state.lock().await.values.get(key) {
            Some(PrefValue::Long(v)) => *v,
            _ => default,
        }
    }

    pub async fn get_float(&self, key: &str, default: f32) -> f32 {
        match self.state.lock().await.values.get(key) {
            Some(PrefValue::Float(v)) => *v,
            _ => default,
        }
    }

    pub async fn get_string(&self, key: &str, default: &str) -> String {
        match self.state.lock().await.values.get(key) {
            Some(PrefValue::String(v)) => v.clone(),
            _ => default.to_string(),
        }
    }

    pub async fn get_string_set(&self, key: &str, default: BTreeSet<String>) -> BTreeSet<String> {
        match self.state.lock().await.values.get(key) {
            Some(PrefValue::StringSet(v)) => v.clone(),
            _ => default,
        }
    }

    /// The stored value whatever its type, or `None` if unset.
    pub async fn get(&self, key: &str) -> Option<PrefValue> {
        self.state.lock().await.values.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.state.lock().await.values.contains_key(key)
    }

    /// Snapshot of every entry.
    pub async fn all(&self) -> HashMap<String, PrefValue> {
        self.state.lock().await.values.clone()
    }

    /// Register a change listener, invoked once per affected key
    /// whenever the local mapping mutates.
    pub fn register_listener(
        &self,
        listener: impl Fn(&str) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));
        ListenerId(id)
    }

    pub fn unregister_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap()
            .retain(|(listener_id, _)| *listener_id != id.0);
    }

    /// Begin staging a set of mutations.
    pub fn edit(&self) -> Editor {
        Editor {
            name: self.name.clone(),
            transport: self.transport.clone(),
            state: self.state.clone(),
            listeners: self.listeners.clone(),
            ops: HashMap::new(),
            clear: false,
        }
    }

    /// Re-baseline from the store and notify for every key that
    /// differs. The recovery path after notification loss.
    pub async fn reload(&self) -> Result<(), SyncError> {
        let (seq, entries) = self.transport.read_all(&self.name).await?;

        let mut changed = Vec::new();
        {
            let mut state = self.state.lock().await;

            let mut fresh: HashMap<String, PrefValue> = HashMap::new();
            for entry in entries {
                match PrefValue::decode(&entry.value, entry.pref_type) {
                    Ok(value) => {
                        fresh.insert(entry.key, value);
                    }
                    Err(e) => log::warn!("Skipping undecodable entry {}: {e}", entry.key),
                }
            }

            for key in state.values.keys() {
                if !fresh.contains_key(key) {
                    changed.push(key.clone());
                }
            }
            for (key, value) in &fresh {
                if state.values.get(key) != Some(value) {
                    changed.push(key.clone());
                }
            }

            state.seqs = fresh.keys().map(|key| (key.clone(), seq)).collect();
            for key in &changed {
                state.seqs.entry(key.clone()).or_insert(seq);
            }
            state.values = fresh;
        }

        changed.sort();
        changed.dedup();
        log::debug!(
            "Reloaded namespace {} ({} keys changed)",
            self.name,
            changed.len()
        );
        Self::fire(&self.listeners, &changed);
        Ok(())
    }

    /// Stop applying change records. Further reads serve the frozen
    /// mirror; further commits still reach the store.
    pub fn detach(&self) {
        if let Some(handle) = self.notifier.lock().unwrap().take() {
            handle.abort();
            log::debug!("Detached from namespace {}", self.name);
        }
    }

    async fn notify_loop(
        name: String,
        mut stream: ChangeStream,
        state: Arc<Mutex<CacheState>>,
        listeners: Arc<std::sync::Mutex<Vec<(u64, Listener)>>>,
    ) {
        while let Some(record) = stream.recv().await {
            if record.namespace != name {
                log::warn!(
                    "Record for namespace {} delivered to {name}",
                    record.namespace
                );
                continue;
            }
            let changed = {
                let mut state = state.lock().await;
                Self::apply_record(&mut state, &record)
            };
            Self::fire(&listeners, &changed);
        }
        log::debug!("Change stream for namespace {name} ended");
    }

    /// Apply one delivered record. Returns the keys whose local value
    /// actually changed.
    fn apply_record(state: &mut CacheState, record: &ChangeRecord) -> Vec<String> {
        if state.pending.remove(&record.change_id) {
            // The echo of our own write: already applied, already
            // reported at commit time.
            log::trace!("Suppressed echo of change {}", record.change_id);
            return Vec::new();
        }

        match &record.kind {
            ChangeKind::Put {
                key,
                pref_type,
                value,
            } => {
                if record.seq <= state.seqs.get(key).copied().unwrap_or(0) {
                    return Vec::new();
                }
                match PrefValue::decode(value, *pref_type) {
                    Ok(decoded) => {
                        state.seqs.insert(key.clone(), record.seq);
                        let mutated = state.values.get(key) != Some(&decoded);
                        state.values.insert(key.clone(), decoded);
                        if mutated {
                            vec![key.clone()]
                        } else {
                            Vec::new()
                        }
                    }
                    Err(e) => {
                        log::warn!("Dropping undecodable record for key {key}: {e}");
                        Vec::new()
                    }
                }
            }
            ChangeKind::Remove { key } => {
                if record.seq <= state.seqs.get(key).copied().unwrap_or(0) {
                    return Vec::new();
                }
                state.seqs.insert(key.clone(), record.seq);
                if state.values.remove(key).is_some() {
                    vec![key.clone()]
                } else {
                    Vec::new()
                }
            }
            ChangeKind::Clear => {
                let CacheState { values, seqs, .. } = state;
                let mut cleared = Vec::new();
                values.retain(|key, _| {
                    if seqs.get(key).copied().unwrap_or(0) < record.seq {
                        cleared.push(key.clone());
                        false
                    } else {
                        true
                    }
                });
                for key in &cleared {
                    seqs.insert(key.clone(), record.seq);
                }
                cleared
            }
        }
    }

    fn fire(listeners: &std::sync::Mutex<Vec<(u64, Listener)>>, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        // Snapshot so a listener may unregister itself mid-callback.
        let snapshot: Vec<Listener> = listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for key in keys {
            for listener in &snapshot {
                listener(key);
            }
        }
    }
}

impl Drop for SharedPrefs {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Staged mutations against one cache.
///
/// Later stages override earlier ones per key; `clear` wipes prior
/// stages and is applied before them on commit. The editor shares the
/// cache's state, so it stays valid however long it is held.
pub struct Editor {
    name: String,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<CacheState>>,
    listeners: Arc<std::sync::Mutex<Vec<(u64, Listener)>>>,
    ops: HashMap<String, Option<PrefValue>>,
    clear: bool,
}

impl Editor {
    pub fn put(mut self, key: impl Into<String>, value: PrefValue) -> Self {
        self.ops.insert(key.into(), Some(value));
        self
    }

    pub fn put_bool(self, key: impl Into<String>, value: bool) -> Self {
        self.put(key, PrefValue::Bool(value))
    }

    pub fn put_int(self, key: impl Into<String>, value: i32) -> Self {
        self.put(key, PrefValue::Int(value))
    }

    pub fn put_long(self, key: impl Into<String>, value: i64) -> Self {
        self.put(key, PrefValue::Long(value))
    }

    pub fn put_float(self, key: impl Into<String>, value: f32) -> Self {
        self.put(key, PrefValue::Float(value))
    }

    pub fn put_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put(key, PrefValue::String(value.into()))
    }

    pub fn put_string_set(self, key: impl Into<String>, value: BTreeSet<String>) -> Self {
        self.put(key, PrefValue::StringSet(value))
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.ops.insert(key.into(), None);
        self
    }

    pub fn clear(mut self) -> Self {
        self.clear = true;
        self.ops.clear();
        self
    }

    /// Commit every staged operation and wait for the store's acks.
    ///
    /// Holds the cache lock for the whole commit, so concurrent
    /// editors serialize and record delivery cannot interleave with
    /// the optimistic applies. Keys are applied independently: if the
    /// transport fails partway, already-acked keys stay applied and
    /// the error propagates.
    pub async fn commit(self) -> Result<(), SyncError> {
        let mut changed: Vec<String> = Vec::new();

        {
            let mut state = self.state.lock().await;

            if self.clear {
                let change_id = Uuid::new_v4();
                state.pending.insert(change_id);
                let seq = self
                    .transport
                    .update(&self.name, UpdateAction::Clear, change_id)
                    .await?;
                let CacheState { values, seqs, .. } = &mut *state;
                for (key, _) in values.drain() {
                    seqs.insert(key.clone(), seq);
                    changed.push(key);
                }
            }

            for (key, op) in self.ops {
                let change_id = Uuid::new_v4();
                state.pending.insert(change_id);
                let action = match &op {
                    Some(value) => UpdateAction::Put {
                        key: key.clone(),
                        pref_type: value.pref_type(),
                        value: value.encode(),
                    },
                    None => UpdateAction::Remove { key: key.clone() },
                };
                let seq = self
                    .transport
                    .update(&self.name, action, change_id)
                    .await?;
                state.seqs.insert(key.clone(), seq);
                match op {
                    Some(value) => {
                        let mutated = state.values.get(&key) != Some(&value);
                        state.values.insert(key.clone(), value);
                        if mutated {
                            changed.push(key);
                        }
                    }
                    None => {
                        if state.values.remove(&key).is_some() {
                            changed.push(key);
                        }
                    }
                }
            }
        }

        changed.sort();
        changed.dedup();
        SharedPrefs::fire(&self.listeners, &changed);
        Ok(())
    }

    /// Fire-and-forget commit; failures are logged, not returned.
    pub fn apply(self) {
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = self.commit().await {
                log::warn!("Deferred commit to namespace {name} failed: {e}");
            }
        });
    }
}

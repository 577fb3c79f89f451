//! SyncStore collaborator contract and an in-process implementation.
//!
//! A store holds collections of records keyed by id. Subscribers receive a
//! full snapshot of the collection on subscription and after every change,
//! fanned out through a tokio broadcast channel. A lagging subscriber may
//! skip snapshots; since every snapshot is complete, the next one it reads
//! is still authoritative.
//!
//! ```text
//! put / delete ──► CollectionState (last-write-wins per id)
//!                        │  server timestamp
//!                        ▼
//!                  broadcast::Sender<SnapshotEvent>
//!                   │         │         │
//!                   ▼         ▼         ▼
//!                 viewer   viewer   broadcaster
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::protocol::{Fields, Snapshot, StoredRecord, FIELD_TIMESTAMP};

/// Event delivered to subscribers.
#[derive(Debug, Clone)]
pub enum SnapshotEvent {
    Snapshot(Snapshot),
    Error(StoreError),
}

pub type SnapshotReceiver = broadcast::Receiver<SnapshotEvent>;

/// Document-store collaborator.
///
/// Writes are fire-and-forget: an `Ok` means the write was accepted for
/// delivery, not that subscribers have observed it. Implementations stamp
/// `timestamp` with their own clock on every `put`.
pub trait SyncStore: Send + Sync {
    fn subscribe(&self, collection: &str) -> Result<SnapshotReceiver, StoreError>;
    fn put(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<(), StoreError>;
    fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;
}

/// Milliseconds since the Unix epoch, as stamped into records.
pub fn server_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ───────────────────────────────────────────────────────────────────
// Collection state
// ───────────────────────────────────────────────────────────────────

/// Records of one collection, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct CollectionState {
    records: BTreeMap<String, Fields>,
}

impl CollectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace or merge a record and stamp it.
    pub fn put(&mut self, id: &str, fields: Fields, merge: bool, timestamp: u64) {
        let entry = self.records.entry(id.to_string()).or_default();
        if !merge {
            entry.clear();
        }
        entry.extend(fields);
        entry.insert(FIELD_TIMESTAMP.to_string(), Value::from(timestamp));
    }

    /// Remove a record. Removing a missing record is not an error.
    pub fn delete(&mut self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.records
                .iter()
                .map(|(id, fields)| StoredRecord::new(id.clone(), fields.clone()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory store
// ───────────────────────────────────────────────────────────────────

/// A write applied by `MemoryStore`, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        collection: String,
        id: String,
        fields: Fields,
        merge: bool,
    },
    Delete {
        collection: String,
        id: String,
    },
}

/// Statistics for monitoring store traffic.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub puts: u64,
    pub deletes: u64,
    pub failed_writes: u64,
    pub snapshots_sent: u64,
}

struct AtomicStoreStats {
    puts: AtomicU64,
    deletes: AtomicU64,
    failed_writes: AtomicU64,
    snapshots_sent: AtomicU64,
}

impl AtomicStoreStats {
    fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            snapshots_sent: AtomicU64::new(0),
        }
    }
}

struct MemoryCollection {
    state: CollectionState,
    sender: broadcast::Sender<SnapshotEvent>,
}

/// In-process store with synchronous fan-out.
///
/// Used by tests and single-process setups. Write failures can be injected
/// to exercise the session's error paths.
pub struct MemoryStore {
    collections: Mutex<HashMap<String, MemoryCollection>>,
    capacity: usize,
    write_failure: Mutex<Option<StoreError>>,
    log: Mutex<Vec<WriteOp>>,
    stats: AtomicStoreStats,
}

impl MemoryStore {
    /// `capacity` is the number of snapshots buffered per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            write_failure: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            stats: AtomicStoreStats::new(),
        }
    }

    /// Make every following write fail with `error` (`None` to recover).
    pub fn set_write_failure(&self, error: Option<StoreError>) {
        *self.write_failure.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Deliver a subscription error to every subscriber of `collection`.
    pub fn fail_subscribers(&self, collection: &str, error: StoreError) {
        let collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(c) = collections.get(collection) {
            let _ = c.sender.send(SnapshotEvent::Error(error));
        }
    }

    /// Current contents of a collection.
    pub fn snapshot(&self, collection: &str) -> Snapshot {
        let collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        collections
            .get(collection)
            .map(|c| c.state.snapshot())
            .unwrap_or_default()
    }

    /// Applied writes in issue order.
    pub fn writes(&self) -> Vec<WriteOp> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_writes(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            puts: self.stats.puts.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            failed_writes: self.stats.failed_writes.load(Ordering::Relaxed),
            snapshots_sent: self.stats.snapshots_sent.load(Ordering::Relaxed),
        }
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let failure = self.write_failure.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match failure {
            Some(e) => {
                self.stats.failed_writes.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Apply a change to a collection, then push the new snapshot.
    fn mutate<F>(&self, collection: &str, change: F)
    where
        F: FnOnce(&mut CollectionState),
    {
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = self.capacity;
        let c = collections
            .entry(collection.to_string())
            .or_insert_with(|| MemoryCollection {
                state: CollectionState::new(),
                sender: broadcast::channel(capacity).0,
            });
        change(&mut c.state);
        let snapshot = c.state.snapshot();
        if c.sender.send(SnapshotEvent::Snapshot(snapshot)).is_ok() {
            self.stats.snapshots_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record(&self, op: WriteOp) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SyncStore for MemoryStore {
    fn subscribe(&self, collection: &str) -> Result<SnapshotReceiver, StoreError> {
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = self.capacity;
        let c = collections
            .entry(collection.to_string())
            .or_insert_with(|| MemoryCollection {
                state: CollectionState::new(),
                sender: broadcast::channel(capacity).0,
            });
        let rx = c.sender.subscribe();
        // Initial snapshot; other subscribers get a harmless duplicate.
        let _ = c.sender.send(SnapshotEvent::Snapshot(c.state.snapshot()));
        self.stats.snapshots_sent.fetch_add(1, Ordering::Relaxed);
        log::debug!("New subscriber on collection {collection}");
        Ok(rx)
    }

    fn put(&self, collection: &str, id: &str, fields: Fields, merge: bool) -> Result<(), StoreError> {
        self.check_write()?;
        self.record(WriteOp::Put {
            collection: collection.to_string(),
            id: id.to_string(),
            fields: fields.clone(),
            merge,
        });
        let timestamp = server_timestamp();
        self.mutate(collection, |state| state.put(id, fields, merge, timestamp));
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.record(WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        self.mutate(collection, |state| {
            state.delete(id);
        });
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

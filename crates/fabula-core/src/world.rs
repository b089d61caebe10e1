//! Versioned, recoverable world state.
//!
//! One mutable tree behind a single writer lock. All mutation goes through
//! path-addressed batches that produce [`StateChange`] records; every
//! `snapshot_interval` changes a checksummed [`Snapshot`] is retained for
//! restore. The store can persist itself to a single local JSON file with a
//! write-temp-then-rename, and load it back verifying the checksum.
//!
//! The lock is never held across a suspension point; readers always get a
//! deep copy, so they observe either the pre- or post-batch tree, never an
//! interleaving.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::SimulationConfig;
use crate::error::{PersistenceError, WorldError};
use crate::value::{ChangeKind, canonical_checksum, set_path};

/// Top-level sections guaranteed to exist after init, load, and restore.
pub const TOP_LEVEL_SECTIONS: [&str; 6] = [
    "environment",
    "locations",
    "characters",
    "events",
    "resources",
    "statistics",
];

/// One applied path-addressed mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub id: Uuid,
    pub kind: ChangeKind,
    pub path: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
    /// Which component requested the batch (e.g. "turn:12").
    pub source: String,
}

/// A full checkpoint of the tree plus an integrity checksum.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Total changes applied when the snapshot was taken.
    pub change_count: u64,
    pub checksum: String,
    tree: Map<String, Value>,
}

/// Snapshot metadata without the tree payload.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub change_count: u64,
    pub checksum: String,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    world_state: Value,
    metadata: PersistedMetadata,
}

#[derive(Serialize, Deserialize)]
struct PersistedMetadata {
    last_updated: DateTime<Utc>,
    change_count: u64,
    checksum: String,
}

struct WorldInner {
    tree: Map<String, Value>,
    change_log: VecDeque<StateChange>,
    change_count: u64,
    snapshots: VecDeque<Snapshot>,
}

/// The single world-state owner shared across turns.
pub struct WorldStateStore {
    inner: RwLock<WorldInner>,
    snapshot_interval: u64,
    max_snapshots: usize,
    max_change_log: usize,
}

impl WorldStateStore {
    /// Create a store with the guaranteed top-level sections in place.
    pub fn new(config: &SimulationConfig) -> Self {
        let mut tree = Map::new();
        ensure_sections(&mut tree);
        Self {
            inner: RwLock::new(WorldInner {
                tree,
                change_log: VecDeque::new(),
                change_count: 0,
                snapshots: VecDeque::new(),
            }),
            snapshot_interval: config.snapshot_interval,
            max_snapshots: config.max_snapshots,
            max_change_log: config.max_change_log,
        }
    }

    /// Deep copy of the current tree.
    pub fn read(&self) -> Result<Value, WorldError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| WorldError::LockPoisoned(e.to_string()))?;
        Ok(Value::Object(inner.tree.clone()))
    }

    /// Total changes applied over the store's lifetime.
    pub fn change_count(&self) -> u64 {
        self.inner.read().map(|i| i.change_count).unwrap_or(0)
    }

    /// Recent change records, oldest first.
    pub fn recent_changes(&self, limit: usize) -> Result<Vec<StateChange>, WorldError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| WorldError::LockPoisoned(e.to_string()))?;
        let skip = inner.change_log.len().saturating_sub(limit);
        Ok(inner.change_log.iter().skip(skip).cloned().collect())
    }

    /// Apply one batch of path-addressed updates under a single critical
    /// section.
    ///
    /// Classification per path: absent terminal key creates, `Null` new
    /// value deletes, anything else updates. Deleting an absent key records
    /// nothing.
    ///
    /// The batch is best-effort, not transactional: an invalid path midway
    /// returns the error but changes already applied in this batch stand.
    pub fn apply(
        &self,
        updates: impl IntoIterator<Item = (String, Value)>,
        source: &str,
    ) -> Result<Vec<StateChange>, WorldError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| WorldError::LockPoisoned(e.to_string()))?;

        let mut applied = Vec::new();
        for (path, new_value) in updates {
            let recorded_new = if new_value.is_null() {
                None
            } else {
                Some(new_value.clone())
            };
            let outcome = set_path(&mut inner.tree, &path, new_value)?;
            let Some((kind, old_value)) = outcome else {
                continue;
            };

            let change = StateChange {
                id: Uuid::new_v4(),
                kind,
                path,
                old_value,
                new_value: recorded_new,
                timestamp: Utc::now(),
                source: source.to_string(),
            };
            tracing::debug!(
                path = %change.path,
                kind = ?change.kind,
                source = %change.source,
                "world-state change applied"
            );
            inner.change_log.push_back(change.clone());
            while inner.change_log.len() > self.max_change_log {
                inner.change_log.pop_front();
            }
            applied.push(change);

            inner.change_count += 1;
            if inner.change_count % self.snapshot_interval == 0 {
                take_snapshot(&mut inner, self.max_snapshots);
            }
        }

        Ok(applied)
    }

    /// Metadata for every retained snapshot, oldest first.
    pub fn snapshots(&self) -> Result<Vec<SnapshotInfo>, WorldError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| WorldError::LockPoisoned(e.to_string()))?;
        Ok(inner
            .snapshots
            .iter()
            .map(|s| SnapshotInfo {
                id: s.id,
                created_at: s.created_at,
                change_count: s.change_count,
                checksum: s.checksum.clone(),
            })
            .collect())
    }

    /// Force a checkpoint now, outside the automatic interval.
    pub fn snapshot_now(&self) -> Result<SnapshotInfo, WorldError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| WorldError::LockPoisoned(e.to_string()))?;
        let snapshot = take_snapshot(&mut inner, self.max_snapshots);
        Ok(snapshot)
    }

    /// Replace the live tree wholesale with a retained snapshot's tree.
    pub fn restore(&self, id: Uuid) -> Result<(), WorldError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| WorldError::LockPoisoned(e.to_string()))?;
        let tree = inner
            .snapshots
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| WorldError::UnknownSnapshot(id.to_string()))?
            .tree
            .clone();
        inner.tree = tree;
        tracing::info!(snapshot = %id, "world state restored from snapshot");
        Ok(())
    }

    /// Write `{world_state, metadata}` to `path` atomically.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<(), WorldError> {
        let path = path.as_ref();
        let (tree, change_count) = {
            let inner = self
                .inner
                .read()
                .map_err(|e| WorldError::LockPoisoned(e.to_string()))?;
            (Value::Object(inner.tree.clone()), inner.change_count)
        };

        let doc = PersistedState {
            metadata: PersistedMetadata {
                last_updated: Utc::now(),
                change_count,
                checksum: canonical_checksum(&tree),
            },
            world_state: tree,
        };
        let json = serde_json::to_string_pretty(&doc).map_err(PersistenceError::from)?;

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, json).map_err(|source| PersistenceError::Io {
            path: tmp_path.display().to_string(),
            source,
        })?;
        fs::rename(&tmp_path, path).map_err(|source| PersistenceError::Io {
            path: path.display().to_string(),
            source,
        })?;

        tracing::debug!(path = %path.display(), change_count, "world state persisted");
        Ok(())
    }

    /// Load a store from `path`.
    ///
    /// A missing file is a fresh start. A checksum mismatch loads anyway
    /// with a warning; the file is the only copy we have.
    pub fn load(path: impl AsRef<Path>, config: &SimulationConfig) -> Result<Self, WorldError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no state file, starting fresh");
                return Ok(Self::new(config));
            }
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: path.display().to_string(),
                    source,
                }
                .into());
            }
        };

        let doc: PersistedState =
            serde_json::from_str(&contents).map_err(PersistenceError::from)?;

        let computed = canonical_checksum(&doc.world_state);
        if computed != doc.metadata.checksum {
            tracing::warn!(
                path = %path.display(),
                expected = %doc.metadata.checksum,
                computed = %computed,
                "world-state checksum mismatch, loading anyway"
            );
        }

        let mut tree = doc
            .world_state
            .as_object()
            .cloned()
            .unwrap_or_default();
        ensure_sections(&mut tree);

        tracing::info!(
            path = %path.display(),
            change_count = doc.metadata.change_count,
            "world state loaded"
        );
        Ok(Self {
            inner: RwLock::new(WorldInner {
                tree,
                change_log: VecDeque::new(),
                change_count: doc.metadata.change_count,
                snapshots: VecDeque::new(),
            }),
            snapshot_interval: config.snapshot_interval,
            max_snapshots: config.max_snapshots,
            max_change_log: config.max_change_log,
        })
    }
}

fn ensure_sections(tree: &mut Map<String, Value>) {
    for section in TOP_LEVEL_SECTIONS {
        tree.entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn take_snapshot(inner: &mut WorldInner, max_snapshots: usize) -> SnapshotInfo {
    let tree = inner.tree.clone();
    let checksum = canonical_checksum(&Value::Object(tree.clone()));
    let snapshot = Snapshot {
        id: Uuid::new_v4(),
        created_at: Utc::now(),
        change_count: inner.change_count,
        checksum: checksum.clone(),
        tree,
    };
    let info = SnapshotInfo {
        id: snapshot.id,
        created_at: snapshot.created_at,
        change_count: snapshot.change_count,
        checksum,
    };
    tracing::debug!(
        snapshot = %snapshot.id,
        change_count = snapshot.change_count,
        "world-state snapshot taken"
    );
    inner.snapshots.push_back(snapshot);
    while inner.snapshots.len() > max_snapshots {
        inner.snapshots.pop_front();
    }
    info
}

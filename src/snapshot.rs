//! Snapshot persistence for entity state.
//!
//! A snapshot bounds replay cost: recovery loads the latest snapshot and
//! folds only the events recorded after it. Snapshots are a cache; losing
//! or failing to read one only makes recovery slower.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::storage::StorageLayout;

/// A point-in-time capture of an entity's state.
///
/// `sequence_nr` is the number of the last event folded into `state`, so
/// recovery resumes with the events after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "S: Serialize", deserialize = "S: DeserializeOwned"))]
pub struct Snapshot<S> {
    /// The entity state at the time of the snapshot.
    pub state: S,
    /// Sequence number of the last event included in `state`.
    pub sequence_nr: u64,
}

impl<S: Serialize> Snapshot<S> {
    /// Convert to the untyped form handled by [`SnapshotStore`].
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the state cannot be serialized.
    pub fn to_json(&self) -> serde_json::Result<Snapshot<Value>> {
        Ok(Snapshot {
            state: serde_json::to_value(&self.state)?,
            sequence_nr: self.sequence_nr,
        })
    }
}

impl Snapshot<Value> {
    /// Convert back to a typed snapshot.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the stored state does not match `S`.
    pub fn into_typed<S: DeserializeOwned>(self) -> serde_json::Result<Snapshot<S>> {
        Ok(Snapshot {
            state: serde_json::from_value(self.state)?,
            sequence_nr: self.sequence_nr,
        })
    }
}

/// Storage for the latest snapshot of each entity.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Replace the stored snapshot of an entity.
    fn save(
        &self,
        persistence_id: &str,
        entity_id: &str,
        snapshot: &Snapshot<Value>,
    ) -> io::Result<()>;

    /// The latest snapshot of an entity, if one exists.
    ///
    /// Unreadable snapshots are reported as `Ok(None)`.
    fn load(&self, persistence_id: &str, entity_id: &str) -> io::Result<Option<Snapshot<Value>>>;
}

/// Snapshot store held in process memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<(String, String), Snapshot<Value>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(
        &self,
        persistence_id: &str,
        entity_id: &str,
        snapshot: &Snapshot<Value>,
    ) -> io::Result<()> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (persistence_id.to_owned(), entity_id.to_owned()),
                snapshot.clone(),
            );
        Ok(())
    }

    fn load(&self, persistence_id: &str, entity_id: &str) -> io::Result<Option<Snapshot<Value>>> {
        Ok(self
            .snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(persistence_id.to_owned(), entity_id.to_owned()))
            .cloned())
    }
}

/// Snapshot store writing one JSON file per entity.
///
/// Writes are atomic via a temp-rename so a crash mid-write never leaves a
/// partially written `snapshot.json`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    layout: StorageLayout,
}

impl FileSnapshotStore {
    /// Open a snapshot store rooted at `base_dir` (see [`StorageLayout`]).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_layout(StorageLayout::new(base_dir))
    }

    pub fn with_layout(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(
        &self,
        persistence_id: &str,
        entity_id: &str,
        snapshot: &Snapshot<Value>,
    ) -> io::Result<()> {
        let path = self.layout.snapshot_path(persistence_id, entity_id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn load(&self, persistence_id: &str, entity_id: &str) -> io::Result<Option<Snapshot<Value>>> {
        let path = self.layout.snapshot_path(persistence_id, entity_id);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice::<Snapshot<Value>>(&bytes) {
            Ok(snap) => Ok(Some(snap)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }
}

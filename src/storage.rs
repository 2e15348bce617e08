//! On-disk directory layout shared by the file-backed journal and snapshot
//! store.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::event::stream_uuid;

/// Manages the on-disk directory layout for entity streams.
///
/// ```text
/// <base_dir>/
///     journal/
///         <persistence_id>/
///             <stream uuid>/
///                 events.jsonl
///     snapshots/
///         <persistence_id>/
///             <stream uuid>/
///                 snapshot.json
/// ```
///
/// The stream UUID is [`stream_uuid`] of the persistence and entity IDs, so
/// arbitrary entity IDs never end up as path components. Each
/// `events.jsonl` line carries the entity ID in its metadata.
///
/// Cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a layout rooted at `base_dir`.
    ///
    /// The directory does not need to exist yet; backends create what they
    /// need on first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/journal/<persistence_id>/<stream uuid>`
    pub fn journal_dir(&self, persistence_id: &str, entity_id: &str) -> PathBuf {
        self.base_dir
            .join("journal")
            .join(persistence_id)
            .join(stream_uuid(persistence_id, entity_id).to_string())
    }

    /// `<base_dir>/journal/<persistence_id>/<stream uuid>/events.jsonl`
    pub fn events_path(&self, persistence_id: &str, entity_id: &str) -> PathBuf {
        self.journal_dir(persistence_id, entity_id)
            .join("events.jsonl")
    }

    /// `<base_dir>/snapshots/<persistence_id>/<stream uuid>/snapshot.json`
    pub fn snapshot_path(&self, persistence_id: &str, entity_id: &str) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(persistence_id)
            .join(stream_uuid(persistence_id, entity_id).to_string())
            .join("snapshot.json")
    }

    /// Lists every persistence ID that has a journal directory.
    ///
    /// # Returns
    ///
    /// A sorted `Vec<String>`; empty if nothing has been journaled yet.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading the directory fails for a reason other
    /// than the directory not existing.
    pub fn list_persistence_ids(&self) -> io::Result<Vec<String>> {
        let journal_dir = self.base_dir.join("journal");

        let entries = match fs::read_dir(&journal_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                entry
                    .file_type()
                    .ok()?
                    .is_dir()
                    .then(|| entry.file_name().to_string_lossy().into_owned())
            })
            .collect();

        ids.sort();
        Ok(ids)
    }
}

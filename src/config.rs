//! Registration configuration for an entity type.

use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of accepted events between snapshots.
pub const DEFAULT_SNAPSHOT_EVERY: u64 = 100;

/// How an entity type is persisted and described.
///
/// Deserializes from the camelCase keys used by entity hosts:
///
/// ```
/// use entityfold::EntityConfig;
///
/// let config = EntityConfig::from_json(r#"{
///     "persistenceId": "shopping-cart",
///     "snapshotEvery": 5,
///     "includeDirs": ["./"],
///     "serializeFallbackToJson": true
/// }"#).unwrap();
///
/// assert_eq!(config.persistence_id, "shopping-cart");
/// assert_eq!(config.snapshot_every.map(|n| n.get()), Some(5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityConfig {
    /// Groups the durable logs of every instance of the entity type.
    pub persistence_id: String,
    /// Persist a snapshot of the full state after every N accepted events.
    /// `None` disables snapshots.
    pub snapshot_every: Option<NonZeroU64>,
    /// Directories searched, in order, for `descriptors`.
    pub include_dirs: Vec<PathBuf>,
    /// Schema files describing the entity's commands, events and state.
    pub descriptors: Vec<PathBuf>,
    /// Persist events and state without a registered binary schema as JSON.
    pub serialize_fallback_to_json: bool,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            persistence_id: String::new(),
            snapshot_every: NonZeroU64::new(DEFAULT_SNAPSHOT_EVERY),
            include_dirs: vec![PathBuf::from(".")],
            descriptors: Vec::new(),
            serialize_fallback_to_json: true,
        }
    }
}

impl EntityConfig {
    /// Config with defaults for everything but the persistence ID.
    pub fn new(persistence_id: impl Into<String>) -> Self {
        Self {
            persistence_id: persistence_id.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON configuration object.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the JSON is malformed or a field has
    /// the wrong type (including `snapshotEvery: 0`).
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Snapshot every `n` events; `0` disables snapshots.
    pub fn snapshot_every(mut self, n: u64) -> Self {
        self.snapshot_every = NonZeroU64::new(n);
        self
    }

    pub fn include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    /// Replace the include directories.
    pub fn include_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.include_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn descriptor(mut self, file: impl Into<PathBuf>) -> Self {
        self.descriptors.push(file.into());
        self
    }

    pub fn serialize_fallback_to_json(mut self, enabled: bool) -> Self {
        self.serialize_fallback_to_json = enabled;
        self
    }

    /// Check the configuration for `service_name`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::EmptyPersistenceId`] if the persistence ID is blank.
    /// - [`ConfigError::JsonFallbackDisabled`] if JSON serialization is off,
    ///   since JSON is the only codec this crate provides.
    pub fn validate(&self, service_name: &str) -> Result<(), ConfigError> {
        if self.persistence_id.trim().is_empty() {
            return Err(ConfigError::EmptyPersistenceId);
        }
        if !self.serialize_fallback_to_json {
            return Err(ConfigError::JsonFallbackDisabled(service_name.to_owned()));
        }
        Ok(())
    }

    /// Locate every descriptor file.
    ///
    /// Absolute paths are used as-is. Relative paths are tried against each
    /// include directory in order; the first existing file wins.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DescriptorNotFound`] for the first descriptor
    /// that exists nowhere.
    pub fn resolve_descriptors(&self) -> Result<Vec<PathBuf>, ConfigError> {
        self.descriptors
            .iter()
            .map(|file| self.resolve_descriptor(file))
            .collect()
    }

    fn resolve_descriptor(&self, file: &Path) -> Result<PathBuf, ConfigError> {
        let candidates: Vec<PathBuf> = if file.is_absolute() {
            vec![file.to_path_buf()]
        } else {
            self.include_dirs.iter().map(|dir| dir.join(file)).collect()
        };

        candidates
            .into_iter()
            .find(|path| path.is_file())
            .ok_or_else(|| ConfigError::DescriptorNotFound {
                file: file.to_path_buf(),
                include_dirs: self.include_dirs.clone(),
            })
    }
}

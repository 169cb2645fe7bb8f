//! Persisted user preference for disabled extensions
//!
//! The state file is read once, on first access, and cached. Every mutation
//! rewrites the whole file before returning. Persistence is best effort: a
//! missing or corrupt file reads as "nothing disabled" and a failed write is
//! logged while the in-memory state stands.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, warn};

use super::error::StateError;
use super::manifest::ExtensionId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateModel {
    #[serde(default, alias = "Disabled")]
    disabled: Vec<String>,
}

/// Store for the set of user-disabled extension IDs
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    state: OnceCell<Mutex<StateModel>>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// IDs the user has disabled
    pub fn disabled_ids(&self) -> HashSet<ExtensionId> {
        let state = self.lock();
        state
            .disabled
            .iter()
            .map(|id| ExtensionId::new(id.as_str()))
            .collect()
    }

    /// Record whether `id` is enabled; blank IDs are ignored
    pub fn set_enabled(&self, id: &str, enabled: bool) {
        if id.trim().is_empty() {
            return;
        }

        let target = ExtensionId::new(id);
        let mut state = self.lock();

        if enabled {
            state.disabled.retain(|existing| target != existing.as_str());
        } else if !state.disabled.iter().any(|existing| target == existing.as_str()) {
            state.disabled.push(id.to_string());
        }

        if let Err(e) = self.save(&state) {
            error!(error = %e, "Failed to save extension state; keeping in-memory state");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateModel> {
        self.state
            .get_or_init(|| Mutex::new(self.load_or_default()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn load_or_default(&self) -> StateModel {
        match self.load() {
            Ok(Some(state)) => {
                debug!(path = %self.path.display(), disabled = state.disabled.len(), "Loaded extension state");
                state
            }
            Ok(None) => StateModel::default(),
            Err(e) => {
                warn!(error = %e, "Failed to load extension state; using defaults");
                StateModel::default()
            }
        }
    }

    fn load(&self) -> Result<Option<StateModel>, StateError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;

        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| StateError::Malformed {
                path: self.path.clone(),
                source,
            })
    }

    fn save(&self, state: &StateModel) -> Result<(), StateError> {
        let io_error = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        // Serializing a list of strings cannot fail
        let json = serde_json::to_string_pretty(state).unwrap_or_default();
        fs::write(&self.path, json).map_err(io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ids(values: &[&str]) -> HashSet<ExtensionId> {
        values.iter().map(|v| ExtensionId::new(*v)).collect()
    }

    #[test]
    fn test_missing_file_means_nothing_disabled() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("extensions.json"));
        assert!(store.disabled_ids().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_file_means_nothing_disabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extensions.json");
        fs::write(&path, "{ not json").unwrap();

        let store = StateStore::new(&path);
        assert!(store.disabled_ids().is_empty());
    }

    #[test]
    fn test_disable_then_enable_ignores_case() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("extensions.json"));

        store.set_enabled("Clock", false);
        store.set_enabled("clock", false);
        assert_eq!(store.disabled_ids(), ids(&["CLOCK"]));

        store.set_enabled("CLOCK", true);
        assert!(store.disabled_ids().is_empty());
    }

    #[test]
    fn test_blank_ids_are_ignored() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("extensions.json"));
        store.set_enabled("   ", false);
        assert!(store.disabled_ids().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn test_every_mutation_is_written_through() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("extensions.json");
        let store = StateStore::new(&path);

        store.set_enabled("weather", false);
        let on_disk: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["disabled"], serde_json::json!(["weather"]));
    }

    #[test]
    fn test_reads_legacy_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extensions.json");
        fs::write(&path, r#"{ "Disabled": ["Legacy"] }"#).unwrap();

        let store = StateStore::new(&path);
        assert_eq!(store.disabled_ids(), ids(&["legacy"]));
    }

    #[test]
    fn test_file_is_read_only_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("extensions.json");
        fs::write(&path, r#"{ "disabled": ["a"] }"#).unwrap();

        let store = StateStore::new(&path);
        assert_eq!(store.disabled_ids(), ids(&["a"]));

        fs::write(&path, r#"{ "disabled": ["b"] }"#).unwrap();
        assert_eq!(store.disabled_ids(), ids(&["a"]));
    }

    #[test]
    fn test_write_failure_keeps_memory_state() {
        let dir = tempdir().unwrap();
        // The parent "directory" is a file, so every write fails
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"").unwrap();
        let store = StateStore::new(blocker.join("extensions.json"));

        store.set_enabled("clock", false);
        assert_eq!(store.disabled_ids(), ids(&["clock"]));
    }
}

//! Extension registry
//!
//! One [`Registry`] holds a single generation of entries. Generations are
//! replaced wholesale by the manager, never patched in place.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::{debug, warn};

use super::api::AppExtension;
use super::loader::{panic_message, LoadContext};
use super::manifest::{ExtensionId, Manifest};

/// A registered extension and its runtime state
pub struct ExtensionEntry {
    manifest: Manifest,
    disabled_by_configuration: bool,
    disabled_by_user: bool,
    generation: u64,
    // Field order matters: the instance must be gone before its code unloads.
    instance: Option<Box<dyn AppExtension>>,
    load_context: Option<LoadContext>,
    last_error: Option<String>,
}

impl ExtensionEntry {
    pub fn new(
        manifest: Manifest,
        disabled_by_configuration: bool,
        disabled_by_user: bool,
        generation: u64,
    ) -> Self {
        Self {
            manifest,
            disabled_by_configuration,
            disabled_by_user,
            generation,
            instance: None,
            load_context: None,
            last_error: None,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn id(&self) -> &ExtensionId {
        &self.manifest.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn disabled_by_configuration(&self) -> bool {
        self.disabled_by_configuration
    }

    pub fn disabled_by_user(&self) -> bool {
        self.disabled_by_user
    }

    pub fn can_activate(&self) -> bool {
        !self.disabled_by_configuration && !self.disabled_by_user
    }

    pub fn is_loaded(&self) -> bool {
        self.instance.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Take ownership of an initialized instance and the context it came from
    pub fn attach(&mut self, instance: Box<dyn AppExtension>, load_context: LoadContext) {
        self.instance = Some(instance);
        self.load_context = Some(load_context);
    }

    /// Record an activation failure
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    /// Dispose the instance (if any) and unload its context
    ///
    /// Disposal failures are logged and never stop the unload. Safe to call
    /// more than once.
    pub fn teardown(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            let id = &self.manifest.id;
            match panic::catch_unwind(AssertUnwindSafe(|| instance.dispose())) {
                Ok(Ok(())) => debug!(extension_id = %id, "Disposed extension"),
                Ok(Err(e)) => {
                    warn!(extension_id = %id, error = %format!("{e:#}"), "Extension dispose failed")
                }
                Err(payload) => {
                    warn!(extension_id = %id, panic = %panic_message(payload), "Extension panicked during dispose")
                }
            }
            drop(instance);
        }

        if let Some(context) = self.load_context.take() {
            context.unload();
        }
    }

    pub fn snapshot(&self) -> ExtensionSnapshot {
        ExtensionSnapshot {
            id: self.manifest.id.to_string(),
            display_name: self.manifest.display_name.clone(),
            version: self.manifest.version.clone(),
            description: self.manifest.description.clone(),
            module_path: self.manifest.module_path.clone(),
            last_modified: self.manifest.last_modified,
            is_enabled: self.can_activate(),
            is_loaded: self.is_loaded(),
            disabled_by_configuration: self.disabled_by_configuration,
            disabled_by_user: self.disabled_by_user,
            initialization_failed: self.last_error.is_some(),
            status_message: self.status_message(),
            generation: self.generation,
        }
    }

    fn status_message(&self) -> String {
        if self.disabled_by_configuration {
            "disabled by configuration".to_string()
        } else if self.disabled_by_user {
            "disabled by user".to_string()
        } else if let Some(error) = &self.last_error {
            format!("initialization failed: {error}")
        } else if self.is_loaded() {
            "active".to_string()
        } else {
            "not loaded".to_string()
        }
    }
}

impl Drop for ExtensionEntry {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for ExtensionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionEntry")
            .field("id", &self.manifest.id)
            .field("generation", &self.generation)
            .field("loaded", &self.is_loaded())
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Read-only view of an extension for UI and other collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionSnapshot {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub description: Option<String>,
    pub module_path: PathBuf,
    pub last_modified: DateTime<Utc>,
    pub is_enabled: bool,
    pub is_loaded: bool,
    pub disabled_by_configuration: bool,
    pub disabled_by_user: bool,
    pub initialization_failed: bool,
    pub status_message: String,
    /// Reload cycle that produced this entry
    pub generation: u64,
}

/// One generation of registered extensions, in discovery order
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<ExtensionEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<&ExtensionEntry> {
        self.entries.iter().find(|entry| *entry.id() == id)
    }

    pub fn contains(&self, id: &ExtensionId) -> bool {
        self.entries.iter().any(|entry| entry.id() == id)
    }

    pub fn push(&mut self, entry: ExtensionEntry) {
        self.entries.push(entry);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtensionEntry> {
        self.entries.iter()
    }

    pub fn snapshots(&self) -> Vec<ExtensionSnapshot> {
        self.entries.iter().map(ExtensionEntry::snapshot).collect()
    }

    /// Tear down every entry; one failing entry never stops the rest
    pub fn teardown(&mut self) {
        for mut entry in self.entries.drain(..) {
            entry.teardown();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::api::ExtensionContext;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manifest(id: &str) -> Manifest {
        Manifest {
            id: ExtensionId::new(id),
            display_name: id.to_uppercase(),
            version: "1.0.0".to_string(),
            description: None,
            module_path: PathBuf::from(format!("/ext/{id}.Extension.so")),
            last_modified: Utc::now(),
        }
    }

    struct Disposable {
        disposals: Arc<AtomicUsize>,
        fail: bool,
    }

    impl AppExtension for Disposable {
        fn initialize(&mut self, _context: &ExtensionContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn dispose(&mut self) -> anyhow::Result<()> {
            self.disposals.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("dispose failed"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_status_message_priority() {
        let mut entry = ExtensionEntry::new(manifest("clock"), true, true, 1);
        entry.mark_failed("boom");
        assert_eq!(entry.snapshot().status_message, "disabled by configuration");

        let mut entry = ExtensionEntry::new(manifest("clock"), false, true, 1);
        entry.mark_failed("boom");
        assert_eq!(entry.snapshot().status_message, "disabled by user");

        let mut entry = ExtensionEntry::new(manifest("clock"), false, false, 1);
        entry.mark_failed("boom");
        let snapshot = entry.snapshot();
        assert_eq!(snapshot.status_message, "initialization failed: boom");
        assert!(snapshot.initialization_failed);
        assert!(!snapshot.is_loaded);

        let entry = ExtensionEntry::new(manifest("clock"), false, false, 1);
        assert_eq!(entry.snapshot().status_message, "not loaded");
    }

    #[test]
    fn test_is_enabled_tracks_both_authorities() {
        for (by_config, by_user) in [(false, false), (true, false), (false, true), (true, true)] {
            let entry = ExtensionEntry::new(manifest("clock"), by_config, by_user, 1);
            assert_eq!(entry.snapshot().is_enabled, !by_config && !by_user);
        }
    }

    #[test]
    fn test_teardown_continues_after_dispose_failure() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();

        for (id, fail) in [("first", true), ("second", false)] {
            let mut entry = ExtensionEntry::new(manifest(id), false, false, 1);
            entry.instance = Some(Box::new(Disposable {
                disposals: disposals.clone(),
                fail,
            }));
            registry.push(entry);
        }

        assert_eq!(registry.snapshots()[0].status_message, "active");
        registry.teardown();
        assert_eq!(disposals.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_ignores_case() {
        let mut registry = Registry::new();
        registry.push(ExtensionEntry::new(manifest("Clock"), false, false, 3));

        assert_eq!(registry.find("CLOCK").map(ExtensionEntry::generation), Some(3));
        assert!(registry.contains(&ExtensionId::new("clock")));
        assert!(registry.find("weather").is_none());
    }
}

//! Extension manager
//!
//! Owns the registry and drives every reload cycle. All registry mutation is
//! serialized through one mutex; readers observe either the previous
//! generation or the next one, never a mix. Change notifications go out only
//! after the new generation is visible.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashSet;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn, Span};

use super::api::{
    AppExtension, ExtensionConstructor, ExtensionContext, ExtensionLogger, LogLevel,
};
use super::discovery::{discover_modules, ModulePattern};
use super::error::ToggleError;
use super::loader::{panic_message, LoadContext, ModuleLoader};
use super::manifest::{resolve, ExtensionId};
use super::native::NativeModuleLoader;
use super::registry::{ExtensionEntry, ExtensionSnapshot, Registry};
use super::state::StateStore;
use super::watcher::ExtensionWatcher;
use crate::config::Config;

/// Number of unread change notifications kept per subscriber
const NOTIFICATION_CAPACITY: usize = 16;

/// Services handed to every extension through its context
pub type HostServices = Arc<dyn Any + Send + Sync>;

/// Snapshot list carried by a change notification
pub type SnapshotList = Arc<[ExtensionSnapshot]>;

/// Builder for [`ExtensionManager`]
pub struct ExtensionManagerBuilder {
    config: Config,
    loader: Option<Arc<dyn ModuleLoader>>,
    services: Option<HostServices>,
    root: Option<PathBuf>,
    debounce: Option<Duration>,
}

impl ExtensionManagerBuilder {
    /// Use `loader` instead of the native shared-library loader
    #[must_use]
    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Services exposed to extensions through their context
    #[must_use]
    pub fn services(mut self, services: HostServices) -> Self {
        self.services = Some(services);
        self
    }

    /// Override the application data root
    #[must_use]
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Override the configured hot-reload debounce delay
    #[must_use]
    pub fn debounce(mut self, delay: Duration) -> Self {
        self.debounce = Some(delay);
        self
    }

    pub fn build(self) -> Result<ExtensionManager> {
        let root = match self.root {
            Some(root) => root,
            None => self.config.app_data.resolve_root()?,
        };

        let settings = &self.config.extensions;
        let pattern = ModulePattern::new(&settings.search_pattern).with_context(|| {
            format!("Invalid extension search pattern `{}`", settings.search_pattern)
        })?;

        let (changes, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let inner = ManagerInner {
            extensions_dir: root.join(&settings.directory_name),
            data_root: root.join(&settings.data_directory_name),
            state: StateStore::new(root.join(&settings.state_file_name)),
            configured_disabled: settings
                .disabled
                .iter()
                .filter(|id| !id.trim().is_empty())
                .map(|id| ExtensionId::new(id.as_str()))
                .collect(),
            watch_for_changes: settings.watch_for_changes,
            debounce: self
                .debounce
                .unwrap_or(Duration::from_millis(settings.debounce_ms)),
            pattern,
            loader: self
                .loader
                .unwrap_or_else(|| Arc::new(NativeModuleLoader::new())),
            services: self.services,
            configuration: Arc::new(self.config),
            registry: Mutex::new(Registry::new()),
            generation: AtomicU64::new(0),
            changes,
            disposed: AtomicBool::new(false),
        };

        Ok(ExtensionManager {
            inner: Arc::new(inner),
            watcher: Mutex::new(None),
            initialized: AtomicBool::new(false),
        })
    }
}

/// Discovers, loads and supervises extensions
pub struct ExtensionManager {
    inner: Arc<ManagerInner>,
    watcher: Mutex<Option<ExtensionWatcher>>,
    initialized: AtomicBool,
}

struct ManagerInner {
    configuration: Arc<Config>,
    services: Option<HostServices>,
    loader: Arc<dyn ModuleLoader>,
    pattern: ModulePattern,
    extensions_dir: PathBuf,
    data_root: PathBuf,
    configured_disabled: HashSet<ExtensionId>,
    watch_for_changes: bool,
    debounce: Duration,
    state: StateStore,
    registry: Mutex<Registry>,
    generation: AtomicU64,
    changes: broadcast::Sender<SnapshotList>,
    disposed: AtomicBool,
}

impl ExtensionManager {
    pub fn builder(config: Config) -> ExtensionManagerBuilder {
        ExtensionManagerBuilder {
            config,
            loader: None,
            services: None,
            root: None,
            debounce: None,
        }
    }

    /// Create the directories, run the first reload and start watching
    ///
    /// Only the first call has any effect.
    pub fn initialize(&self) {
        if self.inner.is_disposed() || self.initialized.swap(true, Ordering::SeqCst) {
            warn!("Extension manager is already initialized or disposed");
            return;
        }

        self.inner.ensure_directories();
        self.inner.loader.prepare(&self.inner.extensions_dir);
        self.inner.reload_extensions();

        if self.inner.watch_for_changes {
            self.start_watcher();
        }
    }

    fn start_watcher(&self) {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let started = ExtensionWatcher::start(
            &self.inner.extensions_dir,
            self.inner.pattern.clone(),
            self.inner.debounce,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.reload_extensions();
                }
            },
        );

        match started {
            Ok(watcher) => *self.lock_watcher() = Some(watcher),
            Err(e) => warn!(
                dir = %self.inner.extensions_dir.display(),
                error = %format!("{e:#}"),
                "Failed to watch extensions directory; hot reload is unavailable"
            ),
        }
    }

    /// Tear down the current generation and load a fresh one
    pub fn reload_extensions(&self) {
        self.inner.reload_extensions();
    }

    /// Point-in-time view of the registry, in discovery order
    pub fn snapshot(&self) -> Vec<ExtensionSnapshot> {
        self.inner.lock_registry().snapshots()
    }

    /// Receive the snapshot list after every completed reload
    ///
    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotList> {
        self.inner.changes.subscribe()
    }

    /// Clear the user's disable flag for `id` and reload
    pub fn try_enable(&self, id: &str) -> Result<(), ToggleError> {
        self.inner.set_enabled(id, true)
    }

    /// Set the user's disable flag for `id` and reload
    pub fn try_disable(&self, id: &str) -> Result<(), ToggleError> {
        self.inner.set_enabled(id, false)
    }

    pub fn extensions_dir(&self) -> &Path {
        &self.inner.extensions_dir
    }

    pub fn data_root(&self) -> &Path {
        &self.inner.data_root
    }

    pub fn state_path(&self) -> &Path {
        self.inner.state.path()
    }

    pub fn configuration(&self) -> &Config {
        &self.inner.configuration
    }

    pub fn is_watching(&self) -> bool {
        self.lock_watcher().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Stop watching and tear down the current generation; idempotent
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Waits for an in-flight debounced reload; must not hold the registry lock
        if let Some(mut watcher) = self.lock_watcher().take() {
            watcher.stop();
        }

        self.inner.lock_registry().teardown();
        info!("Extension manager disposed");
    }

    fn lock_watcher(&self) -> MutexGuard<'_, Option<ExtensionWatcher>> {
        self.watcher.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ExtensionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("extensions_dir", &self.inner.extensions_dir)
            .field("data_root", &self.inner.data_root)
            .field("pattern", &self.inner.pattern.as_str())
            .field("disposed", &self.inner.is_disposed())
            .finish()
    }
}

/// Disable sets captured once per reload cycle
struct DisabledSets {
    configuration: HashSet<ExtensionId>,
    user: HashSet<ExtensionId>,
}

impl ManagerInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_directories(&self) {
        for dir in [&self.extensions_dir, &self.data_root] {
            if let Err(e) = fs::create_dir_all(dir) {
                error!(dir = %dir.display(), error = %e, "Failed to create extension directory");
            }
        }
    }

    fn reload_extensions(&self) {
        let snapshots: SnapshotList = {
            let mut registry = self.lock_registry();
            if self.is_disposed() {
                return;
            }

            self.ensure_directories();
            registry.teardown();

            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let disabled = DisabledSets {
                configuration: self.configured_disabled.clone(),
                user: self.state.disabled_ids(),
            };

            let candidates = discover_modules(&self.extensions_dir, &self.pattern)
                .unwrap_or_else(|e| {
                    error!(dir = %self.extensions_dir.display(), error = %e, "Failed to enumerate extensions directory");
                    Vec::new()
                });

            let mut next = Registry::new();
            for path in &candidates {
                self.load_candidate(path, generation, &disabled, &mut next);
            }

            info!(
                generation,
                candidates = candidates.len(),
                registered = next.len(),
                "Reloaded extensions"
            );

            *registry = next;
            registry.snapshots().into()
        };

        // No receivers is not an error
        let _ = self.changes.send(snapshots);
    }

    fn load_candidate(
        &self,
        path: &Path,
        generation: u64,
        disabled: &DisabledSets,
        registry: &mut Registry,
    ) {
        let context = match LoadContext::load(path, self.loader.as_ref()) {
            Ok(context) => context,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to load extension module");
                return;
            }
        };

        let types = match context.exported_types() {
            Ok(types) => types,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to read extension type table");
                context.unload();
                return;
            }
        };

        let resolved = resolve(&types, path, last_modified(path));
        drop(types);
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Rejected extension module");
                context.unload();
                return;
            }
        };

        let id = resolved.manifest.id.clone();
        if registry.contains(&id) {
            warn!(extension_id = %id, path = %path.display(), "Extension id is already registered; skipping module");
            context.unload();
            return;
        }

        let mut entry = ExtensionEntry::new(
            resolved.manifest,
            disabled.configuration.contains(&id),
            disabled.user.contains(&id),
            generation,
        );

        if entry.can_activate() {
            self.activate(&mut entry, resolved.constructor, context);
        } else {
            context.unload();
            if entry.disabled_by_configuration() {
                info!(extension_id = %id, "Extension is disabled by configuration");
            } else {
                info!(extension_id = %id, "Extension is disabled by user");
            }
        }

        registry.push(entry);
    }

    fn activate(
        &self,
        entry: &mut ExtensionEntry,
        constructor: ExtensionConstructor,
        context: LoadContext,
    ) {
        let id = entry.id().clone();
        let module = context
            .module_path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let span = info_span!("extension", extension_id = %id, module = %module);

        let data_dir = self.data_root.join(id.as_str());
        let initialized = fs::create_dir_all(&data_dir)
            .map_err(|e| format!("failed to create data directory {}: {e}", data_dir.display()))
            .and_then(|()| {
                let extension_context = ExtensionContext::new(
                    self.services.clone(),
                    self.configuration.clone(),
                    Arc::new(ScopedLogger { span: span.clone() }),
                    id.as_str(),
                    &self.extensions_dir,
                    &data_dir,
                );
                let _entered = span.enter();
                construct_and_initialize(constructor, &extension_context)
            });

        match initialized {
            Ok(instance) => {
                info!(extension_id = %id, display_name = %entry.manifest().display_name, "Loaded extension");
                entry.attach(instance, context);
            }
            Err(message) => {
                error!(extension_id = %id, error = %message, "Extension initialization failed");
                entry.mark_failed(message);
                context.unload();
            }
        }
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ToggleError> {
        if id.trim().is_empty() {
            return Err(ToggleError::InvalidId);
        }
        if self.is_disposed() {
            return Err(ToggleError::Disposed);
        }

        let canonical = {
            let registry = self.lock_registry();
            let entry = registry
                .find(id)
                .ok_or_else(|| ToggleError::NotFound(id.to_string()))?;

            if entry.disabled_by_configuration() {
                return Err(ToggleError::DisabledByConfiguration(entry.id().to_string()));
            }
            if enabled && !entry.disabled_by_user() {
                return Ok(());
            }
            entry.id().to_string()
        };

        self.state.set_enabled(&canonical, enabled);
        info!(extension_id = %canonical, enabled, "Extension preference changed");
        self.reload_extensions();
        Ok(())
    }
}

/// Run extension code that creates and initializes an instance
///
/// Errors and panics are turned into host-owned messages while the module is
/// still loaded. A failed instance is dropped here too.
fn construct_and_initialize(
    constructor: ExtensionConstructor,
    context: &ExtensionContext,
) -> Result<Box<dyn AppExtension>, String> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        let mut instance = constructor();
        match instance.initialize(context) {
            Ok(()) => Ok(instance),
            Err(e) => Err(format!("{e:#}")),
        }
    }))
    .unwrap_or_else(|payload| Err(panic_message(payload)))
}

fn last_modified(path: &Path) -> DateTime<Utc> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|e| {
            debug!(path = %path.display(), error = %e, "Module timestamp unavailable");
            Utc::now()
        })
}

/// Emits an extension's log lines inside its span
struct ScopedLogger {
    span: Span,
}

impl ExtensionLogger for ScopedLogger {
    fn log(&self, level: LogLevel, message: &str) {
        let _entered = self.span.enter();
        match level {
            LogLevel::Debug => debug!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::api::{ExtensionMetadata, ExtensionType};
    use crate::extensions::StaticModuleLoader;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct Clock;

    impl AppExtension for Clock {
        fn initialize(&mut self, context: &ExtensionContext) -> anyhow::Result<()> {
            assert!(context.data_dir().is_dir());
            context.info("clock ready");
            Ok(())
        }
    }

    fn clock_table() -> Vec<ExtensionType> {
        vec![ExtensionType::new::<Clock>()
            .with_metadata(ExtensionMetadata::new("clock", "Clock", "1.0.0"))]
    }

    fn manager_with(config: Config, loader: &StaticModuleLoader, root: &TempDir) -> ExtensionManager {
        ExtensionManager::builder(config)
            .loader(Arc::new(loader.clone()))
            .root(root.path())
            .build()
            .unwrap()
    }

    fn install_module(manager: &ExtensionManager, file_name: &str) {
        fs::create_dir_all(manager.extensions_dir()).unwrap();
        fs::write(manager.extensions_dir().join(file_name), b"module").unwrap();
    }

    fn no_watch() -> Config {
        let mut config = Config::default();
        config.extensions.watch_for_changes = false;
        config.extensions.search_pattern = "*.Extension.so".to_string();
        config
    }

    #[test]
    fn test_initialize_creates_directories_and_loads() {
        let root = tempdir().unwrap();
        let loader = StaticModuleLoader::new();
        loader.register("Clock.Extension.so", clock_table);

        let manager = manager_with(no_watch(), &loader, &root);
        install_module(&manager, "Clock.Extension.so");
        manager.initialize();

        assert!(manager.data_root().is_dir());
        assert!(manager.data_root().join("clock").is_dir());
        assert!(!manager.is_watching());

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status_message, "active");
        assert_eq!(snapshot[0].generation, 1);
    }

    #[test]
    fn test_generation_increases_per_reload() {
        let root = tempdir().unwrap();
        let loader = StaticModuleLoader::new();
        loader.register("Clock.Extension.so", clock_table);

        let manager = manager_with(no_watch(), &loader, &root);
        install_module(&manager, "Clock.Extension.so");
        manager.initialize();
        manager.reload_extensions();
        manager.reload_extensions();

        assert_eq!(manager.snapshot()[0].generation, 3);
    }

    #[test]
    fn test_toggle_validation() {
        let root = tempdir().unwrap();
        let loader = StaticModuleLoader::new();
        loader.register("Clock.Extension.so", clock_table);

        let manager = manager_with(no_watch(), &loader, &root);
        install_module(&manager, "Clock.Extension.so");
        manager.initialize();

        assert_eq!(manager.try_enable("  "), Err(ToggleError::InvalidId));
        assert_eq!(
            manager.try_disable("weather"),
            Err(ToggleError::NotFound("weather".to_string()))
        );

        // Already enabled: no reload happens
        manager.try_enable("CLOCK").unwrap();
        assert_eq!(manager.snapshot()[0].generation, 1);
    }

    #[test]
    fn test_disposed_manager_ignores_reloads() {
        let root = tempdir().unwrap();
        let loader = StaticModuleLoader::new();
        loader.register("Clock.Extension.so", clock_table);

        let manager = manager_with(no_watch(), &loader, &root);
        install_module(&manager, "Clock.Extension.so");
        manager.initialize();

        manager.dispose();
        manager.dispose();
        manager.reload_extensions();

        assert!(manager.is_disposed());
        assert!(manager.snapshot().is_empty());
        assert_eq!(manager.try_disable("clock"), Err(ToggleError::Disposed));
    }

    #[test]
    fn test_watcher_starts_when_configured() {
        let root = tempdir().unwrap();
        let mut config = no_watch();
        config.extensions.watch_for_changes = true;

        let manager = manager_with(config, &StaticModuleLoader::new(), &root);
        manager.initialize();
        assert!(manager.is_watching());

        manager.dispose();
        assert!(!manager.is_watching());
    }
}

//! Extensions linked into the host binary
//!
//! A [`StaticModuleLoader`] still discovers modules on disk, but the file only
//! selects a type table registered in-process under the module's file name.
//! Everything after loading (resolution, activation, enable/disable, hot
//! reload) behaves exactly as for native modules.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use super::api::ExtensionType;
use super::error::LoadError;
use super::loader::{LoadedModule, ModuleImage, ModuleLoader};

type TypeTableFactory = Arc<dyn Fn() -> Vec<ExtensionType> + Send + Sync>;
type UnloadHook = Arc<dyn Fn(&ModuleImage) + Send + Sync>;

/// Resolves modules against type tables registered by file name
#[derive(Clone, Default)]
pub struct StaticModuleLoader {
    modules: Arc<RwLock<HashMap<String, TypeTableFactory>>>,
    on_unload: Option<UnloadHook>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the type table served for modules named `file_name`
    pub fn register<F>(&self, file_name: impl Into<String>, table: F) -> &Self
    where
        F: Fn() -> Vec<ExtensionType> + Send + Sync + 'static,
    {
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(file_name.into(), Arc::new(table));
        self
    }

    /// Remove a registration; later loads of that file fail
    pub fn unregister(&self, file_name: &str) {
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(file_name);
    }

    /// Observe every module unload (receives the image the module was loaded from)
    #[must_use]
    pub fn on_unload<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ModuleImage) + Send + Sync + 'static,
    {
        self.on_unload = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for StaticModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<_> = modules.keys().collect();
        names.sort();
        f.debug_struct("StaticModuleLoader")
            .field("modules", &names)
            .finish()
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load(&self, image: ModuleImage) -> Result<Box<dyn LoadedModule>, LoadError> {
        let file_name = image.file_name();
        let registered = {
            let modules = self.modules.read().unwrap_or_else(|e| e.into_inner());
            modules.get(&file_name).cloned()
        };
        let table = registered.ok_or(LoadError::UnknownModule(file_name))?;

        Ok(Box::new(StaticModule {
            table,
            image,
            on_unload: self.on_unload.clone(),
        }))
    }
}

struct StaticModule {
    table: TypeTableFactory,
    image: ModuleImage,
    on_unload: Option<UnloadHook>,
}

impl LoadedModule for StaticModule {
    fn exported_types(&self) -> Result<Vec<ExtensionType>, LoadError> {
        let table = &self.table;
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| table())).map_err(|payload| {
            LoadError::Panicked {
                path: self.image.source_path.clone(),
                message: super::loader::panic_message(payload),
            }
        })
    }
}

impl Drop for StaticModule {
    fn drop(&mut self) {
        if let Some(hook) = &self.on_unload {
            hook(&self.image);
        }
    }
}

/// File name of `path`, as used for registrations
pub fn registration_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::loader::LoadContext;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_registered_module_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Clock.Extension.so");
        std::fs::write(&path, b"").unwrap();

        let loader = StaticModuleLoader::new();
        loader.register(registration_name(&path), || vec![ExtensionType::opaque("Helper")]);

        let context = LoadContext::load(&path, &loader).unwrap();
        let types = context.exported_types().unwrap();
        assert_eq!(types[0].type_name, "Helper");
    }

    #[test]
    fn test_unknown_module_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Ghost.Extension.so");
        std::fs::write(&path, b"").unwrap();

        let err = LoadContext::load(&path, &StaticModuleLoader::new()).unwrap_err();
        assert!(matches!(err, LoadError::UnknownModule(name) if name == "Ghost.Extension.so"));
    }

    #[test]
    fn test_unload_hook_fires_per_context() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Clock.Extension.so");
        std::fs::write(&path, b"").unwrap();

        let unloads = Arc::new(AtomicUsize::new(0));
        let counter = unloads.clone();
        let loader = StaticModuleLoader::new().on_unload(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        loader.register("Clock.Extension.so", Vec::new);

        LoadContext::load(&path, &loader).unwrap().unload();
        drop(LoadContext::load(&path, &loader).unwrap());
        assert_eq!(unloads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_table_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Bad.Extension.so");
        std::fs::write(&path, b"").unwrap();

        let loader = StaticModuleLoader::new();
        loader.register("Bad.Extension.so", || panic!("table exploded"));

        let context = LoadContext::load(&path, &loader).unwrap();
        let err = context.exported_types().unwrap_err();
        assert!(matches!(err, LoadError::Panicked { message, .. } if message == "table exploded"));
    }
}

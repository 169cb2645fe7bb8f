//! Isolated load contexts
//!
//! Every extension module gets its own [`LoadContext`]. The module image is
//! read fully into memory and its file closed before the platform loader
//! sees it, so the file on disk can be replaced while the module is loaded.

use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::api::ExtensionType;
use super::error::LoadError;

/// Extensions probed for a debug-symbol sidecar sharing the module's base name
const SYMBOL_EXTENSIONS: &[&str] = &["pdb", "dwp", "debug"];

/// In-memory copy of a module file
#[derive(Debug)]
pub struct ModuleImage {
    pub source_path: PathBuf,
    pub bytes: Vec<u8>,
    pub symbols: Option<SymbolImage>,
}

/// In-memory copy of a debug-symbol sidecar
#[derive(Debug)]
pub struct SymbolImage {
    pub source_path: PathBuf,
    pub bytes: Vec<u8>,
}

impl ModuleImage {
    /// Read a module and its optional symbol sidecar into memory
    pub fn read(path: &Path) -> Result<Self, LoadError> {
        let bytes = fs::read(path).map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            source_path: path.to_path_buf(),
            bytes,
            symbols: read_symbols(path),
        })
    }

    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn read_symbols(module_path: &Path) -> Option<SymbolImage> {
    let symbols_path = SYMBOL_EXTENSIONS
        .iter()
        .map(|ext| module_path.with_extension(ext))
        .find(|candidate| candidate.is_file())?;

    match fs::read(&symbols_path) {
        Ok(bytes) => Some(SymbolImage {
            source_path: symbols_path,
            bytes,
        }),
        Err(e) => {
            warn!(path = %symbols_path.display(), error = %e, "Failed to read debug symbols; loading without them");
            None
        }
    }
}

/// Strategy that turns a module image into loaded code
pub trait ModuleLoader: Send + Sync {
    /// Load an image into a fresh, private context
    fn load(&self, image: ModuleImage) -> Result<Box<dyn LoadedModule>, LoadError>;

    /// Called once before the first reload cycle
    fn prepare(&self, extensions_dir: &Path) {
        let _ = extensions_dir;
    }
}

/// Code loaded by a [`ModuleLoader`]; dropping it unloads the code
pub trait LoadedModule: Send {
    /// The module's exported type table
    fn exported_types(&self) -> Result<Vec<ExtensionType>, LoadError>;
}

/// Owner of one loaded extension module
///
/// Unloading happens exactly once, either through [`LoadContext::unload`] or
/// on drop. Instances created from the module must be dropped first.
pub struct LoadContext {
    id: Uuid,
    module_path: PathBuf,
    module: Option<Box<dyn LoadedModule>>,
}

impl LoadContext {
    /// Read `path` and load it through `loader`
    pub fn load(path: &Path, loader: &dyn ModuleLoader) -> Result<Self, LoadError> {
        let image = ModuleImage::read(path)?;
        let module = loader.load(image)?;
        let id = Uuid::new_v4();

        debug!(context = %id, path = %path.display(), "Created extension load context");

        Ok(Self {
            id,
            module_path: path.to_path_buf(),
            module: Some(module),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    pub fn exported_types(&self) -> Result<Vec<ExtensionType>, LoadError> {
        match &self.module {
            Some(module) => module.exported_types(),
            None => Ok(Vec::new()),
        }
    }

    /// Release the loaded module
    pub fn unload(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(module) = self.module.take() {
            drop(module);
            debug!(context = %self.id, path = %self.module_path.display(), "Unloaded extension load context");
        }
    }
}

impl Drop for LoadContext {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadContext")
            .field("id", &self.id)
            .field("module_path", &self.module_path)
            .field("loaded", &self.module.is_some())
            .finish()
    }
}

/// Copy a panic payload into a host-owned message
///
/// The payload's drop glue may live in extension code, so it is consumed
/// here while the originating module is still loaded.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

//! Native extension modules loaded with `libloading`
//!
//! The in-memory image is staged as a hidden shadow file next to the
//! original (`.<file>.<context>.shadow`) and loaded from there:
//! - two generations of an identically named module never alias in the
//!   platform loader, because every context stages under a fresh name
//! - the original file is never opened by the platform loader, so it can be
//!   replaced while the previous generation is still loaded
//! - on Windows the module's own dependencies resolve from the extensions
//!   directory (`LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR`)
//!
//! On unix the dynamic loader only consults the module's own run path. A
//! plugin that ships private dependencies next to itself must link with
//! `-Wl,-rpath,$ORIGIN`.
//!
//! Unloading closes the library and deletes its shadow files. Whether the
//! code is actually unmapped is up to the platform (a library with live
//! thread-local destructors stays resident on most unix loaders).

use libloading::Library;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::api::{ExtensionType, API_VERSION, API_VERSION_SYMBOL, TYPE_TABLE_SYMBOL};
use super::error::LoadError;
use super::loader::{panic_message, LoadedModule, ModuleImage, ModuleLoader};

const SHADOW_SUFFIX: &str = "shadow";

/// Signature of the exported type table function
pub type TypeTableFn = fn() -> Vec<ExtensionType>;

/// Loads extension modules as native dynamic libraries
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeModuleLoader;

impl NativeModuleLoader {
    pub fn new() -> Self {
        Self
    }
}

/// Whether `path` is a staged shadow copy rather than a real module
pub fn is_shadow_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with('.') && name.ends_with(&format!(".{SHADOW_SUFFIX}"))
}

fn shadow_path(source: &Path, context: Uuid) -> PathBuf {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!(".{file_name}.{}.{SHADOW_SUFFIX}", context.simple()))
}

fn stage(path: &Path, bytes: &[u8]) -> Result<(), LoadError> {
    fs::write(path, bytes).map_err(|source| LoadError::Stage {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_shadow(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!(path = %path.display(), error = %e, "Failed to remove shadow file");
    }
}

impl ModuleLoader for NativeModuleLoader {
    fn load(&self, image: ModuleImage) -> Result<Box<dyn LoadedModule>, LoadError> {
        let context = Uuid::new_v4();
        let shadow = shadow_path(&image.source_path, context);
        let mut shadow_files = Vec::with_capacity(2);

        stage(&shadow, &image.bytes)?;
        shadow_files.push(shadow.clone());

        if let Some(symbols) = &image.symbols {
            let symbols_shadow = shadow_path(&symbols.source_path, context);
            match stage(&symbols_shadow, &symbols.bytes) {
                Ok(()) => shadow_files.push(symbols_shadow),
                Err(e) => warn!(error = %e, "Failed to stage debug symbols"),
            }
        }

        let library = match open_library(&shadow) {
            Ok(library) => library,
            Err(e) => {
                shadow_files.iter().for_each(|p| remove_shadow(p));
                return Err(LoadError::Dependency {
                    path: image.source_path,
                    reason: e.to_string(),
                });
            }
        };

        debug!(
            source = %image.source_path.display(),
            shadow = %shadow.display(),
            "Loaded native extension module"
        );

        Ok(Box::new(NativeModule {
            library: Some(library),
            source_path: image.source_path,
            shadow_files,
        }))
    }

    fn prepare(&self, extensions_dir: &Path) {
        let entries = match fs::read_dir(extensions_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %extensions_dir.display(), error = %e, "Skipping shadow sweep");
                return;
            }
        };

        for path in entries.flatten().map(|entry| entry.path()) {
            if is_shadow_file(&path) {
                debug!(path = %path.display(), "Removing stale shadow file");
                remove_shadow(&path);
            }
        }
    }
}

#[cfg(unix)]
fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};

    // Safety: loading runs the module's initializers; extensions are trusted
    // code running with host privileges.
    unsafe { UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL).map(Library::from) }
}

#[cfg(windows)]
fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::windows::{
        Library as WindowsLibrary, LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
        LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR,
    };

    // Safety: see the unix variant.
    unsafe {
        WindowsLibrary::load_with_flags(
            path,
            LOAD_LIBRARY_SEARCH_DLL_LOAD_DIR | LOAD_LIBRARY_SEARCH_DEFAULT_DIRS,
        )
        .map(Library::from)
    }
}

/// A native library owned by one load context
struct NativeModule {
    library: Option<Library>,
    source_path: PathBuf,
    shadow_files: Vec<PathBuf>,
}

impl NativeModule {
    fn missing(&self, symbol: &'static str) -> LoadError {
        LoadError::MissingExport {
            path: self.source_path.clone(),
            symbol,
        }
    }
}

impl LoadedModule for NativeModule {
    fn exported_types(&self) -> Result<Vec<ExtensionType>, LoadError> {
        let Some(library) = &self.library else {
            return Ok(Vec::new());
        };

        let version_name = format!("{API_VERSION_SYMBOL}\0");
        let table_name = format!("{TYPE_TABLE_SYMBOL}\0");

        // Safety: both symbols are produced by `export_extensions!` with the
        // types named here; the version check below guards the table's layout.
        let found = unsafe {
            let version = library
                .get::<*const u32>(version_name.as_bytes())
                .map_err(|_| self.missing(API_VERSION_SYMBOL))?;
            **version
        };

        if found != API_VERSION {
            return Err(LoadError::ApiVersion {
                path: self.source_path.clone(),
                expected: API_VERSION,
                found,
            });
        }

        let table: TypeTableFn = unsafe {
            *library
                .get::<TypeTableFn>(table_name.as_bytes())
                .map_err(|_| self.missing(TYPE_TABLE_SYMBOL))?
        };

        panic::catch_unwind(AssertUnwindSafe(table)).map_err(|payload| LoadError::Panicked {
            path: self.source_path.clone(),
            message: panic_message(payload),
        })
    }
}

impl Drop for NativeModule {
    fn drop(&mut self) {
        if let Some(library) = self.library.take() {
            if let Err(e) = library.close() {
                warn!(path = %self.source_path.display(), error = %e, "Failed to close extension library");
            }
        }
        for path in &self.shadow_files {
            remove_shadow(path);
        }
    }
}

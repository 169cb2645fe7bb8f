//! Extension runtime
//!
//! Discovers extension modules in a directory, loads each into its own
//! context, merges the configuration and user disable flags, and reloads
//! everything when the directory changes.
//!
//! - [`api`]: the contract extensions implement
//! - [`manifest`]: identity resolution from a module's type table
//! - [`loader`], [`native`], [`static_loader`]: load contexts
//! - [`state`]: persisted user preferences
//! - [`registry`]: entries and snapshots of one generation
//! - [`manager`]: the reload cycle, commands and notifications
//! - [`watcher`]: directory watching and debouncing
//! - [`host`]: holder of the live manager

pub mod api;
pub mod discovery;
pub mod error;
pub mod host;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod native;
pub mod registry;
pub mod state;
pub mod static_loader;
pub mod watcher;

pub use api::{
    AppExtension, ExtensionConstructor, ExtensionContext, ExtensionLogger, ExtensionMetadata,
    ExtensionType, LogLevel, API_VERSION,
};
pub use error::{HostError, LoadError, ResolveError, StateError, ToggleError};
pub use host::ExtensionHost;
pub use loader::{LoadContext, LoadedModule, ModuleImage, ModuleLoader};
pub use manager::{ExtensionManager, ExtensionManagerBuilder, HostServices, SnapshotList};
pub use manifest::{ExtensionId, Manifest};
pub use native::NativeModuleLoader;
pub use registry::ExtensionSnapshot;
pub use state::StateStore;
pub use static_loader::{registration_name, StaticModuleLoader};

//! Extension API definitions
//!
//! A module is recognized as an extension when it exports a type table (see
//! [`export_extensions!`]) containing exactly one constructible
//! [`AppExtension`] implementer with [`ExtensionMetadata`] attached.
//!
//! Native extensions are built as `cdylib` crates against the same
//! `launchpad` release and toolchain as the host. The table is exchanged
//! through the Rust ABI, so [`API_VERSION`] is the only compatibility check.

use anyhow::Result;
use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;

/// Version of the host/extension contract
pub const API_VERSION: u32 = 1;

/// Exported `u32` holding the API version a module was built against
pub const API_VERSION_SYMBOL: &str = "LAUNCHPAD_API_VERSION";

/// Exported `fn() -> Vec<ExtensionType>` listing a module's types
pub const TYPE_TABLE_SYMBOL: &str = "launchpad_extension_table";

/// Extension capability that every plugin implements
pub trait AppExtension: Send {
    /// Initialize the extension. An error marks the extension as failed.
    fn initialize(&mut self, context: &ExtensionContext) -> Result<()>;

    /// Release resources before the extension's module is unloaded
    fn dispose(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Identity metadata attached to an extension type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionMetadata {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub description: Option<String>,
}

impl ExtensionMetadata {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            version: version.into(),
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Parameterless constructor for an extension type
pub type ExtensionConstructor = fn() -> Box<dyn AppExtension>;

/// One row of a module's exported type table
#[derive(Clone)]
pub struct ExtensionType {
    pub type_name: &'static str,
    /// Present only for concrete, default-constructible implementers
    pub constructor: Option<ExtensionConstructor>,
    pub metadata: Option<ExtensionMetadata>,
}

impl ExtensionType {
    /// Describe a constructible extension type
    pub fn new<T: AppExtension + Default + 'static>() -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            constructor: Some(construct::<T>),
            metadata: None,
        }
    }

    /// Describe a type that cannot be instantiated by the host
    pub fn opaque(type_name: &'static str) -> Self {
        Self {
            type_name,
            constructor: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: ExtensionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_constructible(&self) -> bool {
        self.constructor.is_some()
    }
}

impl fmt::Debug for ExtensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionType")
            .field("type_name", &self.type_name)
            .field("constructible", &self.is_constructible())
            .field("metadata", &self.metadata)
            .finish()
    }
}

fn construct<T: AppExtension + Default + 'static>() -> Box<dyn AppExtension> {
    Box::new(T::default())
}

/// Severity of a message logged by an extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger scoped to a single extension
///
/// Extensions link their own copy of `tracing`, which has no subscriber
/// installed. Messages therefore go through this trait object so they are
/// emitted by the host.
pub trait ExtensionLogger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Information handed to an extension during initialization
#[derive(Clone)]
pub struct ExtensionContext {
    services: Option<Arc<dyn Any + Send + Sync>>,
    configuration: Arc<Config>,
    logger: Arc<dyn ExtensionLogger>,
    extension_id: String,
    extensions_dir: PathBuf,
    data_dir: PathBuf,
}

impl ExtensionContext {
    pub fn new(
        services: Option<Arc<dyn Any + Send + Sync>>,
        configuration: Arc<Config>,
        logger: Arc<dyn ExtensionLogger>,
        extension_id: impl Into<String>,
        extensions_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            services,
            configuration,
            logger,
            extension_id: extension_id.into(),
            extensions_dir: extensions_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Host services, if the host exposes any
    pub fn services(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.services.as_ref()
    }

    /// Host services downcast to a concrete type
    pub fn service<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services.clone()?.downcast::<T>().ok()
    }

    pub fn configuration(&self) -> &Config {
        &self.configuration
    }

    /// The `settings.<extension id>` section of the host configuration
    pub fn settings(&self) -> Option<&serde_yaml::Value> {
        self.configuration.settings.get(self.extension_id.as_str())
    }

    pub fn logger(&self) -> &Arc<dyn ExtensionLogger> {
        &self.logger
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Directory shared by all extension modules
    pub fn extensions_dir(&self) -> &Path {
        &self.extensions_dir
    }

    /// Private data directory of this extension
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn debug(&self, message: &str) {
        self.logger.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.logger.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.logger.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.logger.log(LogLevel::Error, message);
    }
}

impl fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("extension_id", &self.extension_id)
            .field("has_services", &self.services.is_some())
            .field("extensions_dir", &self.extensions_dir)
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

/// Export the type table of a native extension module
///
/// Build the module as a `cdylib`. Private shared-library dependencies are
/// not found next to the module on unix unless it links with
/// `-Wl,-rpath,$ORIGIN` (for example through `cargo:rustc-link-arg` in a
/// build script).
///
/// ```rust,ignore
/// use launchpad::extensions::{AppExtension, ExtensionContext, ExtensionMetadata, ExtensionType};
///
/// #[derive(Default)]
/// struct Clock;
///
/// impl AppExtension for Clock {
///     fn initialize(&mut self, context: &ExtensionContext) -> anyhow::Result<()> {
///         context.info("clock ready");
///         Ok(())
///     }
/// }
///
/// launchpad::export_extensions![
///     ExtensionType::new::<Clock>()
///         .with_metadata(ExtensionMetadata::new("clock", "Clock", "1.0.0")),
/// ];
/// ```
#[macro_export]
macro_rules! export_extensions {
    ($($entry:expr),* $(,)?) => {
        #[no_mangle]
        pub static LAUNCHPAD_API_VERSION: u32 = $crate::extensions::API_VERSION;

        #[no_mangle]
        pub fn launchpad_extension_table() -> ::std::vec::Vec<$crate::extensions::ExtensionType> {
            ::std::vec![$($entry),*]
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sample;

    impl AppExtension for Sample {
        fn initialize(&mut self, context: &ExtensionContext) -> Result<()> {
            context.info("sample ready");
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingLogger {
        lines: Mutex<Vec<(LogLevel, String)>>,
    }

    impl ExtensionLogger for RecordingLogger {
        fn log(&self, level: LogLevel, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_string()));
        }
    }

    fn context_with(logger: Arc<RecordingLogger>, config: Config) -> ExtensionContext {
        ExtensionContext::new(
            Some(Arc::new(42_u32) as Arc<dyn Any + Send + Sync>),
            Arc::new(config),
            logger,
            "sample",
            "/ext",
            "/ext/sample",
        )
    }

    #[test]
    fn test_extension_type_constructible() {
        let ty = ExtensionType::new::<Sample>()
            .with_metadata(ExtensionMetadata::new("sample", "Sample", "1.0.0"));
        assert!(ty.is_constructible());
        assert!(ty.type_name.ends_with("Sample"));
        assert_eq!(ty.metadata.as_ref().unwrap().id, "sample");

        let opaque = ExtensionType::opaque("Helper");
        assert!(!opaque.is_constructible());
    }

    #[test]
    fn test_context_routes_logs_through_logger() {
        let logger = Arc::new(RecordingLogger::default());
        let context = context_with(logger.clone(), Config::default());

        let mut instance = (ExtensionType::new::<Sample>().constructor.unwrap())();
        instance.initialize(&context).unwrap();
        instance.dispose().unwrap();

        let lines = logger.lines.lock().unwrap();
        assert_eq!(lines.as_slice(), &[(LogLevel::Info, "sample ready".to_string())]);
    }

    #[test]
    fn test_context_services_and_settings() {
        let config: Config = serde_yaml::from_str("settings:\n  sample:\n    interval: 5\n").unwrap();
        let context = context_with(Arc::new(RecordingLogger::default()), config);

        assert_eq!(context.service::<u32>().as_deref(), Some(&42));
        assert!(context.service::<String>().is_none());
        assert_eq!(
            context.settings().and_then(|s| s["interval"].as_u64()),
            Some(5)
        );
        assert_eq!(context.data_dir(), Path::new("/ext/sample"));
    }
}

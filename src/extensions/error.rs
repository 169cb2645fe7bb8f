//! Error types for the extension runtime
//!
//! Nothing here escapes a reload cycle: load, resolution and activation
//! failures are logged per module. Only [`ToggleError`] and [`HostError`]
//! reach callers.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to bring a module image into a load context
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read module image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stage module image {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The platform loader rejected the image, usually because one of its
    /// own dependencies could not be resolved
    #[error("failed to load module {path}: {reason}")]
    Dependency { path: PathBuf, reason: String },

    #[error("module {path} does not export `{symbol}`")]
    MissingExport { path: PathBuf, symbol: &'static str },

    #[error("module {path} targets extension API v{found}, host provides v{expected}")]
    ApiVersion {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("module {path} panicked while exporting its type table: {message}")]
    Panicked { path: PathBuf, message: String },

    #[error("no module registered for {0}")]
    UnknownModule(String),
}

/// Rejection of a loaded module by the manifest resolver
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no constructible extension type found")]
    NoEntryPoint,

    #[error("multiple constructible extension types found: {}", .0.join(", "))]
    AmbiguousEntryPoint(Vec<String>),

    #[error("extension type {0} carries no metadata")]
    MissingMetadata(String),

    #[error("extension type {type_name} has an empty `{field}`")]
    EmptyField {
        type_name: String,
        field: &'static str,
    },

    #[error("extension id `{0}` cannot be used as a directory name")]
    InvalidId(String),
}

/// Reason an enable/disable command was refused
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToggleError {
    #[error("extension id must not be blank")]
    InvalidId,

    #[error("extension `{0}` was not found")]
    NotFound(String),

    #[error("extension `{0}` is disabled by configuration and cannot be changed")]
    DisabledByConfiguration(String),

    #[error("extension manager has been disposed")]
    Disposed,
}

/// Misuse of the extension host
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("extension manager has not been initialized")]
    NotInitialized,
}

/// Failure reading or writing the extension state file
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_entry_point_lists_types() {
        let err = ResolveError::AmbiguousEntryPoint(vec!["Clock".into(), "Weather".into()]);
        assert_eq!(
            err.to_string(),
            "multiple constructible extension types found: Clock, Weather"
        );
    }

    #[test]
    fn test_toggle_error_messages() {
        let err = ToggleError::DisabledByConfiguration("clock".into());
        assert!(err.to_string().contains("disabled by configuration"));

        let err = ToggleError::NotFound("ghost".into());
        assert_eq!(err.to_string(), "extension `ghost` was not found");
    }

    #[test]
    fn test_api_version_message() {
        let err = LoadError::ApiVersion {
            path: PathBuf::from("Clock.Extension.so"),
            expected: 1,
            found: 2,
        };
        assert!(err.to_string().contains("API v2"));
        assert!(err.to_string().contains("host provides v1"));
    }
}

//! Manifest resolution
//!
//! Turns a module's exported type table into a [`Manifest`], or rejects the
//! module. A rejected module is never partially registered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use super::api::{ExtensionConstructor, ExtensionType};
use super::error::ResolveError;

/// Extension identifier, compared and hashed case-insensitively
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionId(String);

impl ExtensionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn folded(&self) -> impl Iterator<Item = char> + '_ {
        self.0.chars().flat_map(char::to_lowercase)
    }
}

impl PartialEq for ExtensionId {
    fn eq(&self, other: &Self) -> bool {
        self.folded().eq(other.folded())
    }
}

impl Eq for ExtensionId {}

impl Hash for ExtensionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for c in self.folded() {
            c.hash(state);
        }
    }
}

impl PartialEq<str> for ExtensionId {
    fn eq(&self, other: &str) -> bool {
        self.folded().eq(other.chars().flat_map(char::to_lowercase))
    }
}

impl PartialEq<&str> for ExtensionId {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExtensionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ExtensionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of a resolved extension module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub id: ExtensionId,
    pub display_name: String,
    pub version: String,
    pub description: Option<String>,
    pub module_path: PathBuf,
    pub last_modified: DateTime<Utc>,
}

/// A manifest together with the constructor of its implementation type
#[derive(Debug)]
pub struct ResolvedExtension {
    pub manifest: Manifest,
    pub type_name: String,
    pub constructor: ExtensionConstructor,
}

/// Find the single constructible extension type in a type table
///
/// All strings are copied out of the table; the caller may drop it (and
/// later unload the module that produced it) independently of the result.
pub fn resolve(
    types: &[ExtensionType],
    module_path: &Path,
    last_modified: DateTime<Utc>,
) -> Result<ResolvedExtension, ResolveError> {
    let candidates: Vec<&ExtensionType> = types.iter().filter(|t| t.is_constructible()).collect();

    let extension_type = match candidates.as_slice() {
        [] => return Err(ResolveError::NoEntryPoint),
        [single] => *single,
        many => {
            return Err(ResolveError::AmbiguousEntryPoint(
                many.iter().map(|t| t.type_name.to_string()).collect(),
            ))
        }
    };

    let type_name = extension_type.type_name.to_string();
    let metadata = extension_type
        .metadata
        .as_ref()
        .ok_or_else(|| ResolveError::MissingMetadata(type_name.clone()))?;

    for (field, value) in [
        ("id", &metadata.id),
        ("display_name", &metadata.display_name),
        ("version", &metadata.version),
    ] {
        if value.trim().is_empty() {
            return Err(ResolveError::EmptyField {
                type_name: type_name.clone(),
                field,
            });
        }
    }

    if !is_path_safe(&metadata.id) {
        return Err(ResolveError::InvalidId(metadata.id.clone()));
    }

    let constructor = extension_type.constructor.ok_or(ResolveError::NoEntryPoint)?;

    Ok(ResolvedExtension {
        manifest: Manifest {
            id: ExtensionId::new(metadata.id.as_str()),
            display_name: metadata.display_name.clone(),
            version: metadata.version.clone(),
            description: metadata
                .description
                .clone()
                .filter(|d| !d.trim().is_empty()),
            module_path: module_path.to_path_buf(),
            last_modified,
        },
        type_name,
        constructor,
    })
}

// The id names the extension's private data directory.
fn is_path_safe(id: &str) -> bool {
    id != "." && id != ".." && !id.contains(|c: char| matches!(c, '/' | '\\' | ':' | '\0'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::api::{AppExtension, ExtensionContext, ExtensionMetadata};
    use std::collections::HashSet;

    #[derive(Default)]
    struct Clock;

    impl AppExtension for Clock {
        fn initialize(&mut self, _context: &ExtensionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Weather;

    impl AppExtension for Weather {
        fn initialize(&mut self, _context: &ExtensionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn clock_type() -> ExtensionType {
        ExtensionType::new::<Clock>().with_metadata(
            ExtensionMetadata::new("clock", "Clock", "1.2.0").with_description("Shows the time"),
        )
    }

    fn resolve_types(types: &[ExtensionType]) -> Result<ResolvedExtension, ResolveError> {
        resolve(types, Path::new("/ext/Clock.Extension.so"), Utc::now())
    }

    #[test]
    fn test_resolves_single_implementer() {
        let types = vec![ExtensionType::opaque("Helper"), clock_type()];
        let resolved = resolve_types(&types).unwrap();

        assert_eq!(resolved.manifest.id, "clock");
        assert_eq!(resolved.manifest.display_name, "Clock");
        assert_eq!(resolved.manifest.version, "1.2.0");
        assert_eq!(resolved.manifest.description.as_deref(), Some("Shows the time"));
        assert!(resolved.type_name.ends_with("Clock"));
    }

    #[test]
    fn test_rejects_module_without_implementer() {
        let types = vec![ExtensionType::opaque("Helper")];
        assert_eq!(resolve_types(&types).unwrap_err(), ResolveError::NoEntryPoint);
        assert_eq!(resolve_types(&[]).unwrap_err(), ResolveError::NoEntryPoint);
    }

    #[test]
    fn test_rejects_multiple_implementers() {
        let weather = ExtensionType::new::<Weather>()
            .with_metadata(ExtensionMetadata::new("weather", "Weather", "1.0.0"));
        let err = resolve_types(&[clock_type(), weather]).unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousEntryPoint(names) if names.len() == 2));
    }

    #[test]
    fn test_rejects_missing_metadata() {
        let err = resolve_types(&[ExtensionType::new::<Clock>()]).unwrap_err();
        assert!(matches!(err, ResolveError::MissingMetadata(_)));
    }

    #[test]
    fn test_rejects_blank_fields() {
        let blank_version = ExtensionType::new::<Clock>()
            .with_metadata(ExtensionMetadata::new("clock", "Clock", "  "));
        let err = resolve_types(&[blank_version]).unwrap_err();
        assert!(matches!(err, ResolveError::EmptyField { field: "version", .. }));

        let blank_id = ExtensionType::new::<Clock>()
            .with_metadata(ExtensionMetadata::new("", "Clock", "1.0.0"));
        let err = resolve_types(&[blank_id]).unwrap_err();
        assert!(matches!(err, ResolveError::EmptyField { field: "id", .. }));
    }

    #[test]
    fn test_rejects_ids_that_escape_data_root() {
        for id in ["..", "a/b", "a\\b", "c:"] {
            let ty = ExtensionType::new::<Clock>()
                .with_metadata(ExtensionMetadata::new(id, "Clock", "1.0.0"));
            assert_eq!(
                resolve_types(&[ty]).unwrap_err(),
                ResolveError::InvalidId(id.to_string())
            );
        }
    }

    #[test]
    fn test_extension_id_ignores_case() {
        let a = ExtensionId::new("Clock");
        let b = ExtensionId::new("cLOCK");
        assert_eq!(a, b);
        assert_eq!(a, "CLOCK");
        assert_eq!(a.to_string(), "Clock");

        let set: HashSet<ExtensionId> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }
}

//! Candidate module discovery

use regex::{Regex, RegexBuilder};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name pattern with `*` and `?` wildcards
///
/// Matching is case-insensitive on Windows. Hidden files never match, which
/// keeps staged shadow copies out of discovery and out of the watcher.
#[derive(Debug, Clone)]
pub struct ModulePattern {
    source: String,
    regex: Regex,
}

impl ModulePattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for c in pattern.chars() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
            }
        }
        expr.push('$');

        let regex = RegexBuilder::new(&expr)
            .case_insensitive(cfg!(windows))
            .build()?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| !name.starts_with('.') && self.regex.is_match(name))
    }
}

/// List module files directly inside `dir`, ordered by file name
///
/// The order is what makes duplicate-ID resolution deterministic: the first
/// module in this list wins.
pub fn discover_modules(dir: &Path, pattern: &ModulePattern) -> io::Result<Vec<PathBuf>> {
    let mut modules = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };

        if pattern.matches(&path) && path.is_file() {
            modules.push(path);
        }
    }

    modules.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(modules)
}

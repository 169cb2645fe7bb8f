use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main launcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub app_data: AppDataConfig,
    #[serde(default)]
    pub extensions: ExtensionSettings,
    /// Free-form settings section, handed to extensions as their configuration handle
    #[serde(default)]
    pub settings: serde_yaml::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDataConfig {
    /// Directory name created under the platform data directory
    #[serde(default = "default_application_directory_name")]
    pub application_directory_name: String,

    /// Explicit data root, overrides the platform data directory
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionSettings {
    /// Directory (under the data root) holding extension modules
    #[serde(default = "default_extensions_directory")]
    pub directory_name: String,

    /// Directory (under the data root) holding per-extension data directories
    #[serde(default = "default_extension_data_directory")]
    pub data_directory_name: String,

    /// File name pattern for extension modules (`*` and `?` wildcards)
    #[serde(default = "default_search_pattern")]
    pub search_pattern: String,

    /// File (under the data root) that records user-disabled extensions
    #[serde(default = "default_state_file_name")]
    pub state_file_name: String,

    /// Reload automatically when the extensions directory changes
    #[serde(default = "default_true")]
    pub watch_for_changes: bool,

    /// Quiet period after the last filesystem event before a reload runs
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Extension IDs disabled by the administrator
    #[serde(default)]
    pub disabled: Vec<String>,
}

// Default value functions
fn default_application_directory_name() -> String {
    "Launchpad".to_string()
}

fn default_extensions_directory() -> String {
    "Extensions".to_string()
}

fn default_extension_data_directory() -> String {
    "ExtensionData".to_string()
}

fn default_search_pattern() -> String {
    format!("*.Extension.{}", std::env::consts::DLL_EXTENSION)
}

fn default_state_file_name() -> String {
    "extensions.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    750
}

impl Default for AppDataConfig {
    fn default() -> Self {
        Self {
            application_directory_name: default_application_directory_name(),
            root: None,
        }
    }
}

impl Default for ExtensionSettings {
    fn default() -> Self {
        Self {
            directory_name: default_extensions_directory(),
            data_directory_name: default_extension_data_directory(),
            search_pattern: default_search_pattern(),
            state_file_name: default_state_file_name(),
            watch_for_changes: true,
            debounce_ms: default_debounce_ms(),
            disabled: Vec::new(),
        }
    }
}

impl AppDataConfig {
    /// Resolve the private application data root
    pub fn resolve_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }

        let data_dir = dirs::data_dir().context("Failed to get data directory")?;
        Ok(data_dir.join(&self.application_directory_name))
    }
}

impl Config {
    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;

        Ok(home.join(".launchpad").join("config.yaml"))
    }
}

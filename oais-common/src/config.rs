//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration is a TOML file. Each service deserializes its own
//! section layout; this module only locates the file, parses it, and resolves
//! the root data folder in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file (`root_folder` key)
//! 4. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable overriding the root data folder
pub const ROOT_FOLDER_ENV: &str = "OAIS_ROOT_FOLDER";

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Default config file path for a service: `<config_dir>/oais/<service>.toml`
pub fn default_config_path(service_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("oais").join(format!("{}.toml", service_name)))
}

/// Locate the config file: explicit path, then env var, then platform default.
///
/// Returns `None` when no candidate exists on disk; callers fall back to
/// built-in defaults.
pub fn locate_config_file(
    cli_path: Option<&Path>,
    env_var_name: &str,
    service_name: &str,
) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        return Some(PathBuf::from(path));
    }

    default_config_path(service_name).filter(|p| p.exists())
}

/// Parse a TOML config file
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Load a config file if one is found, otherwise the type's defaults.
///
/// A missing file is not an error. A file that exists but does not parse is.
pub fn load_or_default<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    match path {
        Some(p) if p.exists() => {
            debug!(path = %p.display(), "Loading configuration file");
            load_toml(p)
        }
        Some(p) => {
            warn!(path = %p.display(), "Configuration file not found, using built-in defaults");
            Ok(T::default())
        }
        None => {
            warn!("No configuration file found, using built-in defaults");
            Ok(T::default())
        }
    }
}

/// Resolves the root data folder for a service
pub struct RootFolderResolver {
    service_name: String,
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            cli_arg: None,
            toml_value: None,
        }
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml_value(mut self, path: Option<PathBuf>) -> Self {
        self.toml_value = path;
        self
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_value {
            return path.clone();
        }

        default_root_folder(&self.service_name)
    }
}

/// OS-dependent default root folder
pub fn default_root_folder(service_name: &str) -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("oais").join(service_name))
        .unwrap_or_else(|| PathBuf::from("./oais_data").join(service_name))
}

/// Creates the root folder and derives per-tenant database paths
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
        }
        Ok(())
    }

    /// SQLite database file for a tenant
    pub fn database_path(&self, tenant: &str) -> PathBuf {
        self.root_folder.join(format!("{}.db", tenant))
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }
}

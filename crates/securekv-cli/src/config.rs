use std::{
    fs,
    path::{Path, PathBuf},
};

use clap::ValueEnum;
use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

/// Namespace used when neither the config file nor the command line sets one.
pub const DEFAULT_NAMESPACE: &str = "securekv";

/// Which secure store backs the namespace.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// OS credential store, one item per key.
    Keychain,
    /// Encrypted preferences file with a keyring-held master key.
    EncryptedPreferences,
    /// Process-local store that forgets everything on exit.
    Memory,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(any(target_os = "macos", target_os = "ios", target_os = "windows")) {
            BackendKind::Keychain
        } else {
            BackendKind::EncryptedPreferences
        }
    }
}

/// User-level configuration loaded from `~/.config/securekv/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Storage namespace (keychain service / preferences file name).
    pub namespace: Option<String>,
    /// Backend override; defaults per platform.
    pub backend: Option<BackendKind>,
    /// Override for the encrypted preferences directory.
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Apply command-line overrides on top of the file values.
    pub fn with_overrides(
        mut self,
        namespace: Option<String>,
        backend: Option<BackendKind>,
    ) -> Self {
        if namespace.is_some() {
            self.namespace = namespace;
        }
        if backend.is_some() {
            self.backend = backend;
        }
        self
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    pub fn backend(&self) -> BackendKind {
        self.backend.unwrap_or_default()
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("securekv").join("config.toml"))
}

/// Write the given config to disk unless a file already exists there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

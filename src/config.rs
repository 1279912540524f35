//! Runtime configuration for the coordination kernel: a user-level
//! config overridden by a project-level one, loaded as JSON with the
//! project copy winning outright over anything it sets.

use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::coordinator::CoordinationSettings;

/// Which `EntryStore`/`SessionStore` pair the demo binary should
/// construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    Memory,
    File,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::File
    }
}

/// On-disk JSON shape. Durations are expressed in milliseconds so the
/// file format has no ambiguity about units.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoordinationConfig {
    /// Logical address prefix this node's sessions are issued under.
    #[serde(default = "default_logical_prefix")]
    pub logical_prefix: String,

    #[serde(default = "default_lease_length_ms")]
    pub lease_length_ms: u64,

    #[serde(default = "default_lease_grace_ms")]
    pub lease_grace_ms: u64,

    #[serde(default)]
    pub store_backend: StoreBackend,

    /// Directory the file-backed store keeps its per-key JSON records
    /// under. Ignored for `StoreBackend::Memory`.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

fn default_logical_prefix() -> String {
    "coord".to_string()
}

fn default_lease_length_ms() -> u64 {
    10_000
}

/// One renewal interval (spec §4.5's documented default for
/// `lease_grace`): half the lease length, matching the interval the
/// session manager's renewal loop actually fires at.
fn default_lease_grace_ms() -> u64 {
    default_lease_length_ms() / 2
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".coord/store")
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            logical_prefix: default_logical_prefix(),
            lease_length_ms: default_lease_length_ms(),
            lease_grace_ms: default_lease_grace_ms(),
            store_backend: StoreBackend::default(),
            store_dir: default_store_dir(),
        }
    }
}

impl CoordinationConfig {
    pub fn lease_length(&self) -> Duration {
        Duration::from_millis(self.lease_length_ms)
    }

    pub fn lease_grace(&self) -> Duration {
        Duration::from_millis(self.lease_grace_ms)
    }

    pub fn load(path: &FsPath) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config JSON: {}", path.display()))
    }

    pub fn into_settings(self) -> CoordinationSettings {
        CoordinationSettings {
            logical_prefix: self.logical_prefix.into_bytes(),
            lease_length: self.lease_length(),
            lease_grace: self.lease_grace(),
        }
    }
}

/// Resolves the effective config for a working directory: a
/// project-level config, when present, wins outright over a
/// user-level one, which in turn wins over the built-in defaults.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(user_config_path: Option<PathBuf>) -> Self {
        Self { user_config_path }
    }

    /// `$XDG_CONFIG_HOME/coord/config.json`, falling back to
    /// `~/.config/coord/config.json`.
    pub fn default_user_config_path() -> Option<PathBuf> {
        if let Some(base) = std::env::var_os("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(base).join("coord").join("config.json"));
        }
        let home = dirs::home_dir()?;
        Some(home.join(".config").join("coord").join("config.json"))
    }

    pub fn project_config_path(project_root: &FsPath) -> PathBuf {
        project_root.join(".coord").join("config.json")
    }

    /// Loads and merges config for `project_root`. Never fails solely
    /// because a file is missing; always returns at least the
    /// built-in defaults.
    pub fn load_for_project(&self, project_root: &FsPath) -> Result<CoordinationConfig> {
        let mut effective = CoordinationConfig::default();

        if let Some(p) = self.user_config_path.as_deref() {
            if p.exists() {
                effective = merge(effective, CoordinationConfig::load(p)?);
            }
        }

        let project_path = Self::project_config_path(project_root);
        if project_path.exists() {
            effective = merge(
                effective,
                CoordinationConfig::load(&project_path)
                    .with_context(|| format!("failed to load project config: {}", project_path.display()))?,
            );
        }

        Ok(effective)
    }
}

/// Field-by-field merge where `overlay` wins outright: every field of
/// `CoordinationConfig` is independently meaningful and `#[serde(default)]`
/// has already filled any gaps left by a partial file, so there is no
/// "absent" state left to distinguish at this layer.
fn merge(_base: CoordinationConfig, overlay: CoordinationConfig) -> CoordinationConfig {
    overlay
}

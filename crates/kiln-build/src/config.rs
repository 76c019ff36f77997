//! Builder configuration.

use std::fs;
use std::path::{Path, PathBuf};

use kiln_common::{KilnError, KilnPaths, KilnResult};
use serde::{Deserialize, Serialize};

/// Default age after which `cache prune` evicts a layer.
pub const DEFAULT_MAX_AGE_DAYS: u64 = 7;

/// Configuration file contents. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
    /// Data root (bases, cache, images). Defaults to `$KILN_ROOT`.
    pub root: Option<PathBuf>,
    /// Layer cache settings.
    pub cache: CacheConfig,
    /// Command runner settings.
    pub runner: RunnerConfig,
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Reuse and record layers.
    pub enabled: bool,
    /// Age in days used by `cache prune` when none is given.
    pub max_age_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_days: DEFAULT_MAX_AGE_DAYS,
        }
    }
}

/// `[runner]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Confine commands to the snapshot with `chroot --userspec`. When off,
    /// commands run unconfined on the host and privileged steps are refused.
    pub chroot: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { chroot: true }
    }
}

impl KilnConfig {
    /// Load from `path`, or from the user config file when `path` is `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Config`] if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> KilnResult<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match KilnPaths::config_file() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.is_file() {
            if explicit {
                return Err(KilnError::Config {
                    message: format!("Config file not found: {}", path.display()),
                });
            }
            return Ok(Self::default());
        }

        let config = Self::from_toml(&fs::read_to_string(&path)?)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse TOML.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Config`] on syntax errors or unknown keys.
    pub fn from_toml(content: &str) -> KilnResult<Self> {
        toml::from_str(content).map_err(|e| KilnError::Config {
            message: format!("Invalid configuration: {e}"),
        })
    }

    /// Paths rooted at the configured root, or the default root.
    #[must_use]
    pub fn paths(&self) -> KilnPaths {
        self.root
            .as_ref()
            .map_or_else(KilnPaths::new, KilnPaths::with_root)
    }

    /// Override the data root.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Disable the layer cache.
    #[must_use]
    pub fn without_cache(mut self) -> Self {
        self.cache.enabled = false;
        self
    }
}

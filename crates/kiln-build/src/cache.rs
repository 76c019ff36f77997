//! Build cache management.
//!
//! The cache stores the snapshot produced by expensive operations (`run` and
//! `install`) keyed by everything that can influence them: the parent
//! snapshot, the operation itself, the working directory and the effective
//! user. A rebuild with unchanged inputs reuses the stored snapshot instead of
//! invoking the command again.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use kiln_common::{Digest, KilnResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::manifest::Operation;
use crate::privilege::PrivilegeState;
use crate::snapshot::Snapshot;

const INDEX_FILE: &str = "index.json";
const SECONDS_PER_DAY: u64 = 86_400;

/// Metadata for one cached layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key.
    pub key: String,
    /// Archive size in bytes.
    pub size: u64,
    /// Creation time (seconds since the epoch).
    pub created: u64,
    /// Last use (seconds since the epoch).
    pub last_access: u64,
    /// Operation that produced the layer.
    #[serde(default)]
    pub command: Option<String>,
}

impl CacheEntry {
    /// Size formatted for humans.
    #[must_use]
    pub fn size_human(&self) -> String {
        format_size(self.size)
    }
}

/// Build cache manager.
#[derive(Debug)]
pub struct CacheManager {
    /// Cache directory.
    cache_dir: PathBuf,
    /// Entries by key.
    index: BTreeMap<String, CacheEntry>,
}

impl CacheManager {
    /// Open the cache in `cache_dir`, loading its index if present.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        let cache_dir = cache_dir.into();
        let index = match load_index(&cache_dir) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    dir = %cache_dir.display(),
                    "Ignoring unreadable cache index"
                );
                BTreeMap::new()
            }
        };
        Self { cache_dir, index }
    }

    /// Cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Key for running `operation` on top of `parent`.
    ///
    /// `scope` names everything outside the manifest that shapes the result:
    /// the runner kind, and the package manager for installs.
    #[must_use]
    pub fn key(
        parent: &Digest,
        operation: &Operation,
        workdir: &str,
        user: &PrivilegeState,
        scope: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(parent.as_str().as_bytes());
        hasher.update([0]);
        // Struct fields serialize in declaration order and maps are ordered.
        hasher.update(serde_json::to_vec(operation).unwrap_or_default());
        hasher.update([0]);
        hasher.update(workdir.as_bytes());
        hasher.update([0]);
        hasher.update(user.name().as_bytes());
        hasher.update([0]);
        hasher.update(scope.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check if a layer is cached.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.index.contains_key(key) && self.layer_path(key).is_file()
    }

    /// Load a cached layer, refreshing its access time.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive exists but cannot be read.
    pub fn get(&mut self, key: &str) -> KilnResult<Option<Snapshot>> {
        if !self.has(key) {
            return Ok(None);
        }

        let snapshot = Snapshot::read_tar(BufReader::new(File::open(self.layer_path(key))?))?;
        if let Some(entry) = self.index.get_mut(key) {
            entry.last_access = now();
        }
        self.save_index()?;

        tracing::debug!(key, "Cache hit");
        Ok(Some(snapshot))
    }

    /// Store a layer in cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive or index cannot be written.
    pub fn store(&mut self, key: &str, snapshot: &Snapshot, command: &str) -> KilnResult<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let path = self.layer_path(key);
        snapshot
            .write_tar(BufWriter::new(File::create(&path)?))?
            .flush()?;

        let size = fs::metadata(&path)?.len();
        let now = now();
        self.index.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                size,
                created: now,
                last_access: now,
                command: Some(command.to_string()),
            },
        );
        self.save_index()?;

        tracing::debug!(key, size, "Stored layer in cache");
        Ok(())
    }

    /// Entries, most recently used first.
    #[must_use]
    pub fn list(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<_> = self.index.values().cloned().collect();
        entries.sort_by(|a, b| b.last_access.cmp(&a.last_access).then(a.key.cmp(&b.key)));
        entries
    }

    /// Number of cached layers.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// Total size of cached layers in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.index.values().map(|e| e.size).sum()
    }

    /// Prune entries not used for `max_age_days`. Returns the bytes freed.
    ///
    /// # Errors
    ///
    /// Returns an error if an archive or the index cannot be updated.
    pub fn prune(&mut self, max_age_days: u64) -> KilnResult<u64> {
        tracing::info!(max_age_days, "Pruning cache");

        let now = now();
        let max_age = max_age_days.saturating_mul(SECONDS_PER_DAY);
        let stale: Vec<String> = self
            .index
            .values()
            .filter(|e| now.saturating_sub(e.last_access) >= max_age)
            .map(|e| e.key.clone())
            .collect();

        let mut freed = 0;
        for key in stale {
            freed += self.evict(&key)?;
        }
        self.save_index()?;
        Ok(freed)
    }

    /// Remove every entry. Returns the bytes freed.
    ///
    /// # Errors
    ///
    /// Returns an error if an archive or the index cannot be removed.
    pub fn clear(&mut self) -> KilnResult<u64> {
        let keys: Vec<String> = self.index.keys().cloned().collect();
        let mut freed = 0;
        for key in keys {
            freed += self.evict(&key)?;
        }
        self.save_index()?;
        Ok(freed)
    }

    fn evict(&mut self, key: &str) -> KilnResult<u64> {
        let Some(entry) = self.index.remove(key) else {
            return Ok(0);
        };
        let path = self.layer_path(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(entry.size)
    }

    fn layer_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.tar"))
    }

    fn save_index(&self) -> KilnResult<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let data = serde_json::to_vec_pretty(&self.index)?;
        fs::write(self.cache_dir.join(INDEX_FILE), data)?;
        Ok(())
    }
}

fn load_index(cache_dir: &Path) -> KilnResult<BTreeMap<String, CacheEntry>> {
    let path = cache_dir.join(INDEX_FILE);
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}

fn now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// Format a byte count for humans.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

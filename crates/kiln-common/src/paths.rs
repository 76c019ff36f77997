//! Standard filesystem paths for kiln.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for kiln data.
pub static KILN_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KILN_ROOT").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("kiln")
    })
});

/// Standard paths used by the kiln builder.
#[derive(Debug, Clone)]
pub struct KilnPaths {
    /// Root data directory (default: `$KILN_ROOT` or `<data dir>/kiln`).
    pub root: PathBuf,
}

impl KilnPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding base image archives.
    #[must_use]
    pub fn bases(&self) -> PathBuf {
        self.root.join("bases")
    }

    /// Archive for a base image, `<bases>/<name>/<tag>.tar`.
    ///
    /// Registry separators in the name become nested directories.
    #[must_use]
    pub fn base(&self, name: &str, tag: &str) -> PathBuf {
        self.bases().join(name).join(format!("{tag}.tar"))
    }

    /// Build cache directory.
    #[must_use]
    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Directory for exported images.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// OCI layout directory of a built image, `<images>/<name>/<tag>`.
    #[must_use]
    pub fn image(&self, name: &str, tag: &str) -> PathBuf {
        self.images().join(name).join(tag)
    }

    /// User configuration file (`<config dir>/kiln/config.toml`).
    #[must_use]
    pub fn config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kiln").join("config.toml"))
    }
}

impl Default for KilnPaths {
    fn default() -> Self {
        Self {
            root: KILN_ROOT.clone(),
        }
    }
}

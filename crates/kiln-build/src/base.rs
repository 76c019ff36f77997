//! Base image resolution.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use kiln_common::{KilnError, KilnPaths, KilnResult};

use crate::snapshot::Snapshot;

/// Reference that always resolves to the empty filesystem.
pub const SCRATCH: &str = "scratch";

/// Turns a base image reference into its initial root filesystem.
pub trait BaseResolver: Send + Sync {
    /// Resolve `reference` to a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::ImageNotFound`] if the reference is unknown.
    fn resolve(&self, reference: &str) -> KilnResult<Snapshot>;
}

/// Split `name[:tag]` into name and tag (default `latest`).
///
/// A colon followed by a slash belongs to a registry port, not a tag.
#[must_use]
pub fn split_reference(reference: &str) -> (&str, &str) {
    match reference.rfind(':') {
        Some(idx) if !reference[idx + 1..].contains('/') => {
            (&reference[..idx], &reference[idx + 1..])
        }
        _ => (reference, "latest"),
    }
}

/// Resolves bases from tar archives in the local store.
#[derive(Debug, Clone)]
pub struct StoreBaseResolver {
    paths: KilnPaths,
}

impl StoreBaseResolver {
    /// Create a resolver over the store at `paths`.
    #[must_use]
    pub fn new(paths: KilnPaths) -> Self {
        Self { paths }
    }

    /// Import a base image into the store from a directory or tar archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read or the archive written.
    pub fn import(&self, reference: &str, source: &Path) -> KilnResult<Snapshot> {
        let snapshot = if source.is_dir() {
            Snapshot::read_dir(source, &Snapshot::empty(), crate::snapshot::ROOT_USER)?
        } else {
            Snapshot::read_tar(BufReader::new(File::open(source)?))?
        };

        let (name, tag) = split_reference(reference);
        let target = self.paths.base(name, tag);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        snapshot.write_tar(File::create(&target)?)?;

        tracing::info!(
            reference,
            path = %target.display(),
            entries = snapshot.len(),
            digest = %snapshot.digest(),
            "Imported base image"
        );
        Ok(snapshot)
    }

    /// References of every base image in the store, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let root = self.paths.bases();
        let mut references: Vec<String> = walkdir::WalkDir::new(&root)
            .min_depth(2)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let rel = e.path().strip_prefix(&root).ok()?;
                let tag = rel.file_stem()?.to_str()?;
                let name = rel.parent()?.to_str()?;
                (rel.extension()? == "tar").then(|| format!("{name}:{tag}"))
            })
            .collect();
        references.sort();
        references
    }
}

impl BaseResolver for StoreBaseResolver {
    fn resolve(&self, reference: &str) -> KilnResult<Snapshot> {
        if reference == SCRATCH {
            return Ok(Snapshot::empty());
        }

        let (name, tag) = split_reference(reference);
        let path = self.paths.base(name, tag);
        if !path.is_file() {
            return Err(KilnError::ImageNotFound {
                reference: reference.to_string(),
            });
        }

        tracing::debug!(reference, path = %path.display(), "Resolving base image");
        Snapshot::read_tar(BufReader::new(File::open(&path)?))
    }
}

/// Resolves bases from an in-memory table.
#[derive(Debug, Clone, Default)]
pub struct StaticBaseResolver {
    images: HashMap<String, Snapshot>,
}

impl StaticBaseResolver {
    /// An empty table (only `scratch` resolves).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a base image.
    #[must_use]
    pub fn with(mut self, reference: impl Into<String>, snapshot: Snapshot) -> Self {
        self.images.insert(reference.into(), snapshot);
        self
    }
}

impl BaseResolver for StaticBaseResolver {
    fn resolve(&self, reference: &str) -> KilnResult<Snapshot> {
        if reference == SCRATCH {
            return Ok(Snapshot::empty());
        }
        self.images
            .get(reference)
            .cloned()
            .ok_or_else(|| KilnError::ImageNotFound {
                reference: reference.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ROOT_USER;

    #[test]
    fn reference_splitting() {
        assert_eq!(split_reference("debian:bookworm"), ("debian", "bookworm"));
        assert_eq!(split_reference("alpine"), ("alpine", "latest"));
        assert_eq!(
            split_reference("localhost:5000/team/svc"),
            ("localhost:5000/team/svc", "latest")
        );
        assert_eq!(
            split_reference("localhost:5000/team/svc:1.2"),
            ("localhost:5000/team/svc", "1.2")
        );
    }

    #[test]
    fn store_import_then_resolve() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("rootfs");
        std::fs::create_dir_all(source.join("etc")).unwrap();
        std::fs::write(source.join("etc/os-release"), "ID=slim\n").unwrap();

        let resolver = StoreBaseResolver::new(KilnPaths::with_root(temp.path().join("store")));
        let imported = resolver.import("runtime:slim", &source).unwrap();
        let resolved = resolver.resolve("runtime:slim").unwrap();

        assert_eq!(resolved.digest(), imported.digest());
        assert_eq!(resolved.read("/etc/os-release").unwrap().as_ref(), b"ID=slim\n");
        assert!(matches!(
            resolver.resolve("runtime:fat"),
            Err(KilnError::ImageNotFound { .. })
        ));
        assert!(resolver.resolve(SCRATCH).unwrap().is_empty());

        resolver.import("team/toolchain", &source).unwrap();
        assert_eq!(resolver.list(), vec!["runtime:slim", "team/toolchain:latest"]);
    }

    #[test]
    fn static_table() {
        let mut builder = Snapshot::empty().edit();
        builder.write_file("/bin/sh", "", ROOT_USER);
        let resolver = StaticBaseResolver::new().with("busybox", builder.freeze());

        assert!(resolver.resolve("busybox").unwrap().exists("/bin/sh"));
        assert!(resolver.resolve("alpine").is_err());
    }
}

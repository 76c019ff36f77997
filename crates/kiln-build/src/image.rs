//! The deliverable image and its OCI layout export.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_common::{Digest, KilnError, KilnResult};
use serde::{Deserialize, Serialize};

use crate::privilege::PrivilegeState;
use crate::snapshot::Snapshot;

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// One entry of a stage's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Snapshot digest after the operation.
    pub digest: Digest,
    /// The operation that produced it.
    pub created_by: String,
    /// True for metadata-only operations.
    pub empty_layer: bool,
}

/// What one stage produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSummary {
    /// Stage label.
    pub label: String,
    /// Base image reference.
    pub base: String,
    /// Final snapshot digest.
    pub digest: Digest,
    /// Number of operations applied.
    pub operations: usize,
}

/// Runtime configuration of the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Entrypoint argv.
    pub entrypoint: Option<Vec<String>>,
    /// Effective user at the end of the final stage.
    pub user: PrivilegeState,
    /// Working directory at the end of the final stage.
    pub workdir: String,
    /// Labels.
    pub labels: BTreeMap<String, String>,
}

/// A built image: the final stage's snapshot plus its runtime configuration.
///
/// Images are never modified after assembly.
#[derive(Debug, Clone)]
pub struct Image {
    tag: String,
    config: ImageConfig,
    snapshot: Snapshot,
    history: Vec<LayerRecord>,
    stages: Vec<StageSummary>,
    digest: Digest,
}

impl Image {
    /// Assemble an image and compute its digest.
    ///
    /// The digest covers the configuration and the root filesystem only, so
    /// rebuilding unchanged inputs gives the same digest.
    #[must_use]
    pub fn new(
        tag: String,
        config: ImageConfig,
        snapshot: Snapshot,
        history: Vec<LayerRecord>,
        stages: Vec<StageSummary>,
    ) -> Self {
        let canonical = serde_json::json!({
            "config": config,
            "rootfs": snapshot.digest(),
        });
        let digest = Digest::of_bytes(canonical.to_string().as_bytes());

        Self {
            tag,
            config,
            snapshot,
            history,
            stages,
            digest,
        }
    }

    /// Image tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Entrypoint argv.
    #[must_use]
    pub fn entrypoint(&self) -> Option<&[String]> {
        self.config.entrypoint.as_deref()
    }

    /// Runtime user.
    #[must_use]
    pub fn user(&self) -> &PrivilegeState {
        &self.config.user
    }

    /// Final root filesystem.
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// History of the final stage.
    #[must_use]
    pub fn history(&self) -> &[LayerRecord] {
        &self.history
    }

    /// Every stage that was executed, in order.
    #[must_use]
    pub fn stages(&self) -> &[StageSummary] {
        &self.stages
    }

    /// Content digest.
    #[must_use]
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Total size of the root filesystem in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.snapshot.size()
    }

    /// Write the image as an OCI image layout under `dir`.
    ///
    /// The root filesystem becomes a single gzip layer. Returns the manifest digest.
    ///
    /// # Errors
    ///
    /// Returns an error if any blob cannot be written.
    pub fn export_oci(&self, dir: &Path) -> KilnResult<Digest> {
        let blobs_dir = dir.join("blobs").join(Digest::ALGORITHM);
        fs::create_dir_all(&blobs_dir)?;

        let layer_tar = self.snapshot.write_tar(Vec::new())?;
        let diff_id = Digest::of_bytes(&layer_tar);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&layer_tar)?;
        let layer = encoder.finish()?;
        let layer_digest = write_blob(&blobs_dir, &layer)?;

        let config = serde_json::json!({
            "architecture": oci_architecture(),
            "os": "linux",
            "config": {
                "Entrypoint": self.config.entrypoint,
                "User": self.config.user.name(),
                "WorkingDir": self.config.workdir,
                "Labels": self.config.labels,
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": [diff_id],
            },
            "history": self.history.iter().map(|h| serde_json::json!({
                "created_by": h.created_by,
                "empty_layer": h.empty_layer,
            })).collect::<Vec<_>>(),
        });
        let config_bytes = serde_json::to_vec_pretty(&config)?;
        let config_digest = write_blob(&blobs_dir, &config_bytes)?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "digest": config_digest,
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": LAYER_MEDIA_TYPE,
                "digest": layer_digest,
                "size": layer.len(),
            }],
            "annotations": { REF_NAME_ANNOTATION: self.tag },
        });
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        let manifest_digest = write_blob(&blobs_dir, &manifest_bytes)?;

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": MANIFEST_MEDIA_TYPE,
                "digest": manifest_digest,
                "size": manifest_bytes.len(),
                "annotations": { REF_NAME_ANNOTATION: self.tag },
            }],
        });
        fs::write(dir.join("index.json"), serde_json::to_vec_pretty(&index)?)?;
        fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#)?;

        tracing::info!(
            path = %dir.display(),
            manifest = %manifest_digest,
            layer_size = layer.len(),
            "Exported OCI image layout"
        );
        Ok(manifest_digest)
    }
}

fn write_blob(blobs_dir: &Path, data: &[u8]) -> KilnResult<Digest> {
    let digest = Digest::of_bytes(data);
    fs::write(blobs_dir.join(digest.hex()), data)?;
    Ok(digest)
}

fn oci_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Summary of an exported image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    /// Manifest digest.
    pub digest: String,
    /// Tag annotation.
    pub tag: Option<String>,
    /// Architecture.
    pub architecture: String,
    /// OS.
    pub os: String,
    /// Number of layers.
    pub layer_count: usize,
    /// Total blob size in bytes.
    pub size: u64,
    /// Entrypoint.
    pub entrypoint: Vec<String>,
    /// Runtime user.
    pub user: Option<String>,
    /// Working directory.
    pub workdir: Option<String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// History of the final stage.
    pub history: Vec<String>,
}

/// Inspect an OCI image layout written by [`Image::export_oci`].
///
/// # Errors
///
/// Returns an error if the directory is not a readable OCI image layout.
pub fn inspect_local(image_path: &Path) -> KilnResult<ImageInfo> {
    let layout_error = |message: &str| KilnError::Config {
        message: format!("{}: {message}", image_path.display()),
    };

    if !image_path.join("oci-layout").exists() {
        return Err(layout_error("not an OCI image layout"));
    }

    let index: serde_json::Value =
        serde_json::from_slice(&fs::read(image_path.join("index.json"))?)?;
    let entry = index["manifests"]
        .as_array()
        .and_then(|m| m.first())
        .ok_or_else(|| layout_error("no manifests in index.json"))?;
    let manifest_digest = Digest::parse(
        entry["digest"]
            .as_str()
            .ok_or_else(|| layout_error("missing manifest digest"))?,
    )?;

    let blobs_dir = image_path.join("blobs").join(Digest::ALGORITHM);
    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(blobs_dir.join(manifest_digest.hex()))?)?;
    let config_digest = Digest::parse(
        manifest["config"]["digest"]
            .as_str()
            .ok_or_else(|| layout_error("missing config digest"))?,
    )?;
    let config: serde_json::Value =
        serde_json::from_slice(&fs::read(blobs_dir.join(config_digest.hex()))?)?;
    let cfg = &config["config"];

    Ok(ImageInfo {
        digest: manifest_digest.to_string(),
        tag: entry["annotations"][REF_NAME_ANNOTATION]
            .as_str()
            .map(String::from),
        architecture: config["architecture"]
            .as_str()
            .unwrap_or("unknown")
            .to_string(),
        os: config["os"].as_str().unwrap_or("linux").to_string(),
        layer_count: manifest["layers"].as_array().map_or(0, Vec::len),
        size: calculate_image_size(&blobs_dir)?,
        entrypoint: extract_string_array(&cfg["Entrypoint"]),
        user: cfg["User"].as_str().map(String::from),
        workdir: cfg["WorkingDir"].as_str().map(String::from),
        labels: cfg["Labels"]
            .as_object()
            .map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), v.as_str().unwrap_or("").to_string()))
                    .collect()
            })
            .unwrap_or_default(),
        history: config["history"]
            .as_array()
            .map(|h| {
                h.iter()
                    .filter_map(|e| e["created_by"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn extract_string_array(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn calculate_image_size(blobs_dir: &Path) -> KilnResult<u64> {
    let mut total = 0;

    if blobs_dir.exists() {
        for entry in fs::read_dir(blobs_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                total += entry.metadata()?.len();
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ROOT_USER;

    fn image(user: &str) -> Image {
        let mut builder = Snapshot::empty().edit();
        builder.write_file("/usr/local/bin/svc", "ELF", ROOT_USER);
        let snapshot = builder.freeze();

        Image::new(
            "svc:1.0.0".into(),
            ImageConfig {
                entrypoint: Some(vec!["/usr/local/bin/svc".into()]),
                user: PrivilegeState::for_user(user),
                workdir: "/".into(),
                labels: BTreeMap::from([("team".to_string(), "platform".to_string())]),
            },
            snapshot.clone(),
            vec![LayerRecord {
                digest: snapshot.digest(),
                created_by: "COPY --from=builder /out/svc /usr/local/bin/svc".into(),
                empty_layer: false,
            }],
            Vec::new(),
        )
    }

    #[test]
    fn digest_is_stable_and_config_sensitive() {
        assert_eq!(image("svc").digest(), image("svc").digest());
        assert_ne!(image("svc").digest(), image("root").digest());
    }

    #[test]
    fn export_then_inspect() {
        let temp = tempfile::tempdir().unwrap();
        let image = image("svc");
        let manifest = image.export_oci(temp.path()).unwrap();

        let info = inspect_local(temp.path()).unwrap();
        assert_eq!(info.digest, manifest.to_string());
        assert_eq!(info.tag.as_deref(), Some("svc:1.0.0"));
        assert_eq!(info.entrypoint, vec!["/usr/local/bin/svc"]);
        assert_eq!(info.user.as_deref(), Some("svc"));
        assert_eq!(info.layer_count, 1);
        assert_eq!(info.labels.get("team").map(String::as_str), Some("platform"));
        assert_eq!(info.history.len(), 1);
        assert!(info.size > 0);
    }

    #[test]
    fn export_is_reproducible() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let first = image("svc").export_oci(a.path()).unwrap();
        let second = image("svc").export_oci(b.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn inspect_rejects_plain_directory() {
        let temp = tempfile::tempdir().unwrap();
        assert!(matches!(
            inspect_local(temp.path()),
            Err(KilnError::Config { .. })
        ));
    }

    #[test]
    fn extracts_string_arrays() {
        let json = serde_json::json!(["a", "b", 3]);
        assert_eq!(extract_string_array(&json), vec!["a", "b"]);
    }
}

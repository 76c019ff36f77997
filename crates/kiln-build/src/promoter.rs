//! Artifact promotion between stages.
//!
//! The promoter holds the final snapshot of every stage that has finished and
//! hands out copies of paths inside them. A stage can only ever read from
//! stages declared before it.

use crate::error::{BuildError, BuildResult};
use crate::manifest::Kilnfile;
use crate::snapshot::{Node, Snapshot};

/// A copy of `source_path` in one stage to `dest_path` in another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossStageReference {
    /// Referenced stage (name or zero-based index).
    pub source_stage: String,
    /// Path inside the referenced stage's final snapshot.
    pub source_path: String,
    /// Label of the stage receiving the copy.
    pub dest_stage: String,
    /// Destination path in the receiving stage.
    pub dest_path: String,
}

/// Entries extracted from a completed stage.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Base name of the source path.
    pub name: String,
    /// Whether the source path is a directory.
    pub is_dir: bool,
    /// Extracted entries, relative to the source path.
    pub entries: Vec<(String, Node)>,
}

/// Registry of completed stages and the single way to read from them.
#[derive(Debug, Clone)]
pub struct ArtifactPromoter {
    names: Vec<Option<String>>,
    built: Vec<Snapshot>,
}

impl ArtifactPromoter {
    /// Prepare for a manifest; no stage is complete yet.
    #[must_use]
    pub fn new(manifest: &Kilnfile) -> Self {
        Self {
            names: manifest.stages.iter().map(|s| s.name.clone()).collect(),
            built: Vec::with_capacity(manifest.stages.len()),
        }
    }

    /// Record the final snapshot of the next stage in declaration order.
    pub fn complete(&mut self, snapshot: Snapshot) {
        self.built.push(snapshot);
    }

    /// Final snapshot of a completed stage.
    ///
    /// # Errors
    ///
    /// [`BuildError::UnknownStage`] if no stage has that name or index,
    /// [`BuildError::StageNotYetBuilt`] if it has not finished.
    pub fn stage(&self, reference: &str) -> BuildResult<&Snapshot> {
        let index = self
            .names
            .iter()
            .position(|n| n.as_deref() == Some(reference))
            .or_else(|| {
                reference
                    .parse::<usize>()
                    .ok()
                    .filter(|idx| *idx < self.names.len())
            })
            .ok_or_else(|| BuildError::UnknownStage {
                stage: reference.to_string(),
            })?;

        self.built
            .get(index)
            .ok_or_else(|| BuildError::StageNotYetBuilt {
                stage: reference.to_string(),
            })
    }

    /// Extract the referenced path from its completed stage.
    ///
    /// # Errors
    ///
    /// Fails as [`ArtifactPromoter::stage`] does, or with
    /// [`BuildError::PathNotFound`] if the path is missing.
    pub fn promote(&self, reference: &CrossStageReference) -> BuildResult<Artifact> {
        let snapshot = self.stage(&reference.source_stage)?;
        let entries =
            snapshot
                .subtree(&reference.source_path)
                .ok_or_else(|| BuildError::PathNotFound {
                    stage: reference.source_stage.clone(),
                    path: reference.source_path.clone(),
                })?;

        let path = crate::snapshot::normalize("/", &reference.source_path);
        tracing::debug!(
            from = %reference.source_stage,
            to = %reference.dest_stage,
            src = %path,
            dest = %reference.dest_path,
            entries = entries.len(),
            "Promoting artifact"
        );

        Ok(Artifact {
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            is_dir: snapshot.is_dir(&path),
            entries,
        })
    }
}

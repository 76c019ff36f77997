//! Image assembly.
//!
//! The assembler validates a manifest, runs its stages strictly in
//! declaration order and turns the final stage into an [`Image`].

use std::sync::Arc;

use kiln_common::KilnError;
use parking_lot::Mutex;
use tracing::Instrument;

use crate::base::BaseResolver;
use crate::cache::CacheManager;
use crate::context::BuildContext;
use crate::error::BuildResult;
use crate::executor::{StageExecutor, StageOutcome};
use crate::image::{Image, ImageConfig, StageSummary};
use crate::manifest::{Kilnfile, Stage};
use crate::promoter::ArtifactPromoter;
use crate::runner::CommandRunner;
use crate::validator::{Finding, PipelineValidator};

/// Tag used when neither the caller nor the manifest names one.
pub const DEFAULT_TAG: &str = "kiln-image:latest";

/// Builds images from manifests.
pub struct ImageAssembler {
    resolver: Arc<dyn BaseResolver>,
    runner: Arc<dyn CommandRunner>,
    context: BuildContext,
    cache: Option<Mutex<CacheManager>>,
    validator: PipelineValidator,
    tag: Option<String>,
}

impl ImageAssembler {
    /// Create an assembler with an empty build context and no cache.
    #[must_use]
    pub fn new(resolver: Arc<dyn BaseResolver>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            resolver,
            runner,
            context: BuildContext::empty(),
            cache: None,
            validator: PipelineValidator::new(),
            tag: None,
        }
    }

    /// Use `context` as the host build context.
    #[must_use]
    pub fn with_context(mut self, context: BuildContext) -> Self {
        self.context = context;
        self
    }

    /// Enable the layer cache.
    #[must_use]
    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(Mutex::new(cache));
        self
    }

    /// Override the manifest's tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Validate without building.
    #[must_use]
    pub fn validate(&self, manifest: &Kilnfile) -> Vec<Finding> {
        self.validator.validate(manifest)
    }

    /// Build the image described by `manifest`.
    ///
    /// # Errors
    ///
    /// [`crate::BuildError::ValidationFailed`] before anything runs if the manifest
    /// has hard findings; otherwise the first stage failure, after which no
    /// further stage runs.
    pub async fn build(&self, manifest: &Kilnfile) -> BuildResult<Image> {
        let warnings = self.validator.check(manifest)?;
        for finding in &warnings {
            tracing::warn!(
                rule = ?finding.rule,
                stage = finding.stage.as_deref().unwrap_or("-"),
                operation = ?finding.operation,
                "{}",
                finding.message
            );
        }

        let tag = self
            .tag
            .clone()
            .or_else(|| manifest.get_tag())
            .unwrap_or_else(|| DEFAULT_TAG.to_string());
        tracing::info!(tag = %tag, stages = manifest.stages.len(), "Building image");

        let mut promoter = ArtifactPromoter::new(manifest);
        let mut summaries = Vec::with_capacity(manifest.stages.len());
        let mut last: Option<StageOutcome> = None;

        for (index, stage) in manifest.stages.iter().enumerate() {
            let label = stage.label(index);
            let span = tracing::info_span!("stage", name = %label);

            let outcome = self
                .run_stage(stage, index, &promoter)
                .instrument(span)
                .await?;

            summaries.push(StageSummary {
                label,
                base: stage.from.clone(),
                digest: outcome.state.snapshot.digest(),
                operations: stage.steps.len(),
            });
            promoter.complete(outcome.state.snapshot.clone());
            last = Some(outcome);
        }

        let Some(outcome) = last else {
            return Err(KilnError::Internal {
                message: "manifest has no stages".to_string(),
            }
            .into());
        };
        let final_stage = &manifest.stages[manifest.stages.len() - 1];

        let config = ImageConfig {
            entrypoint: final_stage.entrypoint.clone(),
            user: outcome.state.privilege,
            workdir: outcome.state.workdir,
            labels: manifest.metadata.labels.clone(),
        };
        let image = Image::new(tag, config, outcome.state.snapshot, outcome.history, summaries);

        tracing::info!(
            tag = %image.tag(),
            digest = %image.digest(),
            user = %image.user(),
            size = image.size(),
            "Image assembled"
        );
        Ok(image)
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        index: usize,
        promoter: &ArtifactPromoter,
    ) -> BuildResult<StageOutcome> {
        tracing::info!(base = %stage.from, operations = stage.steps.len(), "Building stage");
        let base = self.resolver.resolve(&stage.from)?;

        let mut executor = StageExecutor::new(self.runner.as_ref(), &self.context);
        if let Some(cache) = &self.cache {
            executor = executor.with_cache(cache);
        }
        let outcome = executor.execute(stage, index, base, promoter).await?;

        tracing::info!(
            user = %outcome.state.privilege,
            digest = %outcome.state.snapshot.digest(),
            "Stage complete"
        );
        Ok(outcome)
    }
}

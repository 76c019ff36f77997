//! # kiln-build
//!
//! Multi-stage image build pipeline.
//!
//! A [`Kilnfile`] lists stages; each stage starts from a base image and
//! applies its operations in order:
//! - [`PipelineValidator`] checks the manifest before anything runs
//! - [`StageExecutor`] threads an immutable [`Snapshot`] and the effective
//!   [`PrivilegeState`] through a stage's operations
//! - [`ArtifactPromoter`] hands files from finished stages to later ones
//! - [`ImageAssembler`] runs the stages in order and turns the last one into
//!   an [`Image`]

#![warn(missing_docs)]

pub mod assembler;
pub mod base;
pub mod cache;
pub mod cli;
pub mod config;
pub mod containerfile;
pub mod context;
pub mod error;
pub mod executor;
pub mod image;
pub mod manifest;
pub mod packages;
pub mod privilege;
pub mod promoter;
pub mod runner;
pub mod snapshot;
pub mod validator;

pub use assembler::ImageAssembler;
pub use base::{BaseResolver, StaticBaseResolver, StoreBaseResolver};
pub use cache::{CacheEntry, CacheManager};
pub use config::KilnConfig;
pub use context::BuildContext;
pub use error::{BuildError, BuildResult};
pub use executor::{StageExecutor, StageOutcome, StageState};
pub use image::{Image, ImageConfig, ImageInfo, LayerRecord};
pub use manifest::{Kilnfile, Operation, Stage};
pub use packages::PackageManagerKind;
pub use privilege::PrivilegeState;
pub use promoter::{Artifact, ArtifactPromoter, CrossStageReference};
pub use runner::{CommandRunner, HostRunner, Invocation, SimulatedRunner};
pub use snapshot::Snapshot;
pub use validator::{Finding, PipelineValidator, Severity};

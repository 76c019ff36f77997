//! # kiln-common
//!
//! Shared utilities and types for the kiln image build pipeline.
//!
//! This crate provides common functionality used across all kiln crates:
//! - Content digests
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod digest;
pub mod error;
pub mod paths;

pub use digest::Digest;
pub use error::{KilnError, KilnResult};
pub use paths::KilnPaths;

//! Common error types for the kiln crates.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KilnError`].
pub type KilnResult<T> = Result<T, KilnError>;

/// Common errors across the kiln crates.
#[derive(Error, Diagnostic, Debug)]
pub enum KilnError {
    /// Base image not found.
    #[error("Base image not found: {reference}")]
    #[diagnostic(
        code(kiln::image::not_found),
        help("Import the base image into the store with `kiln base import`, or use `scratch`")
    )]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Invalid digest format.
    #[error("Invalid digest: {value}")]
    #[diagnostic(
        code(kiln::digest::invalid),
        help("Digests have the form 'sha256:' followed by 64 lowercase hex characters")
    )]
    InvalidDigest {
        /// The invalid value.
        value: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(kiln::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(kiln::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(kiln::internal), help("This is a bug, please report it"))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KilnError::ImageNotFound {
            reference: "debian:bookworm".to_string(),
        };
        assert_eq!(err.to_string(), "Base image not found: debian:bookworm");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KilnError = io_err.into();
        assert!(matches!(err, KilnError::Io(_)));
    }

    #[test]
    fn error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: KilnError = json_err.into();
        assert!(matches!(err, KilnError::Serialization(_)));
    }
}

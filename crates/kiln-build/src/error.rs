//! Build pipeline errors.

use kiln_common::KilnError;
use miette::Diagnostic;
use thiserror::Error;

use crate::validator::Finding;

/// Result type alias using [`BuildError`].
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors raised while validating or executing a manifest.
#[derive(Error, Diagnostic, Debug)]
pub enum BuildError {
    /// A copy source resolved neither in the build context nor in a prior stage.
    #[error("Source not found: {path}")]
    #[diagnostic(
        code(kiln::build::source_not_found),
        help("Check the path against the build context and any .kilnignore patterns")
    )]
    SourceNotFound {
        /// The unresolved source path.
        path: String,
    },

    /// An external command exited with a non-zero status.
    #[error("Command {argv:?} failed with exit code {exit_code}")]
    #[diagnostic(code(kiln::build::command_failed))]
    CommandFailed {
        /// The command line that failed.
        argv: Vec<String>,
        /// Process exit status.
        exit_code: i32,
    },

    /// A privileged operation ran under a non-root user.
    #[error("Permission denied: {operation} requires root but the active user is '{user}'")]
    #[diagnostic(
        code(kiln::build::permission_denied),
        help("Move the `user` step after every install, create_user and privileged run step")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
        /// The effective user at that point.
        user: String,
    },

    /// A cross-stage reference names a stage that is never declared.
    #[error("Unknown stage: {stage}")]
    #[diagnostic(code(kiln::build::unknown_stage))]
    UnknownStage {
        /// The referenced name.
        stage: String,
    },

    /// A cross-stage reference names a stage that has not been built yet.
    #[error("Stage '{stage}' is not built yet; only earlier stages can be referenced")]
    #[diagnostic(code(kiln::build::stage_not_yet_built))]
    StageNotYetBuilt {
        /// The referenced name.
        stage: String,
    },

    /// A path is missing from a completed stage's snapshot.
    #[error("Path '{path}' not found in stage '{stage}'")]
    #[diagnostic(code(kiln::build::path_not_found))]
    PathNotFound {
        /// The source stage.
        stage: String,
        /// The missing path.
        path: String,
    },

    /// `user` named an account that does not exist in the snapshot.
    #[error("Unknown user: {user}")]
    #[diagnostic(
        code(kiln::build::unknown_user),
        help("Create the account with a `create_user` step first")
    )]
    UnknownUser {
        /// The requested account.
        user: String,
    },

    /// The manifest has hard validation findings.
    #[error("Manifest validation failed with {} error(s)", .0.len())]
    #[diagnostic(code(kiln::build::validation_failed))]
    ValidationFailed(Vec<Finding>),

    /// An operation would act on the host because the runner is unconfined.
    #[error("{operation} refused: the command runner is not confined to the image")]
    #[diagnostic(
        code(kiln::build::unconfined),
        help("Enable `[runner] chroot` in the configuration and drop --unconfined")
    )]
    Unconfined {
        /// The refused operation.
        operation: String,
    },

    /// The build was aborted.
    #[error("Build cancelled")]
    #[diagnostic(code(kiln::build::cancelled))]
    Cancelled,

    /// An operation failed; wraps the underlying error with its location.
    #[error("Stage '{stage}' operation #{index} ({operation}) failed: {source}")]
    #[diagnostic(code(kiln::build::operation))]
    Operation {
        /// Name (or index) of the failing stage.
        stage: String,
        /// Zero-based operation index within the stage.
        index: usize,
        /// Short description of the operation.
        operation: String,
        /// The underlying failure.
        #[source]
        source: Box<BuildError>,
    },

    /// Shared infrastructure error.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Common(#[from] KilnError),
}

impl BuildError {
    /// The innermost error, unwrapping operation context.
    #[must_use]
    pub fn root_cause(&self) -> &BuildError {
        match self {
            BuildError::Operation { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Exit status of the failing external command, if any.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self.root_cause() {
            BuildError::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::Common(KilnError::Io(err))
    }
}

//! Kilnfile - the stage-ordered build manifest.
//!
//! A Kilnfile is an ordered list of stages. Each stage starts from a base
//! image and applies its steps in order; a later stage may copy artifacts out
//! of an earlier one. Supported formats:
//! - YAML (default), TOML and JSON, picked by file extension
//! - a Containerfile subset, see [`crate::containerfile`]

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use kiln_common::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};

use crate::packages::PackageManagerKind;

/// The complete build manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kilnfile {
    /// Image metadata.
    #[serde(default)]
    pub metadata: Metadata,

    /// Build stages, in execution order.
    #[serde(default)]
    pub stages: Vec<Stage>,
}

/// Image metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Image name.
    #[serde(default)]
    pub name: Option<String>,

    /// Version.
    #[serde(default)]
    pub version: Option<String>,

    /// Tag template (supports `{{name}}` and `{{version}}`).
    #[serde(default)]
    pub tag: Option<String>,

    /// Labels recorded in the image config.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Metadata {
    /// Build the full image tag.
    pub fn build_tag(&self) -> Option<String> {
        if let Some(template) = &self.tag {
            let mut result = template.clone();
            if let Some(name) = &self.name {
                result = result.replace("{{name}}", name);
            }
            if let Some(version) = &self.version {
                result = result.replace("{{version}}", version);
            }
            Some(result)
        } else if let (Some(name), Some(version)) = (&self.name, &self.version) {
            Some(format!("{name}:{version}"))
        } else {
            self.name.clone()
        }
    }
}

/// One build stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Optional alias used by cross-stage copies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Base image reference (`scratch` for an empty filesystem).
    pub from: String,

    /// Package ecosystem of the base image.
    #[serde(default)]
    pub packages: PackageManagerKind,

    /// Accounts assumed to exist in the base image, besides `root` and `nobody`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assume_users: Vec<String>,

    /// Operations, applied in order.
    #[serde(default)]
    pub steps: Vec<Operation>,

    /// Entrypoint; only the final stage's entrypoint is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
}

impl Stage {
    /// Create an unnamed stage from a base reference.
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            name: None,
            from: from.into(),
            packages: PackageManagerKind::default(),
            assume_users: Vec::new(),
            steps: Vec::new(),
            entrypoint: None,
        }
    }

    /// Name the stage.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append an operation.
    #[must_use]
    pub fn step(mut self, operation: Operation) -> Self {
        self.steps.push(operation);
        self
    }

    /// Set the entrypoint.
    #[must_use]
    pub fn entrypoint<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    /// Human readable label: the name, or `#<index>` for unnamed stages.
    #[must_use]
    pub fn label(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("#{index}"))
    }
}

/// A single stage operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Change the working directory for later operations.
    #[serde(rename = "workdir")]
    SetWorkdir(String),

    /// Copy files from the build context or an earlier stage.
    #[serde(rename = "copy")]
    CopySources(CopySources),

    /// Run an opaque command.
    #[serde(rename = "run")]
    RunCommand(RunCommand),

    /// Install OS packages.
    #[serde(rename = "install")]
    InstallPackages(InstallPackages),

    /// Create a non-privileged account.
    #[serde(rename = "create_user")]
    CreateUser(CreateUser),

    /// Switch the effective user for later operations.
    #[serde(rename = "user")]
    SetUser(String),
}

impl Operation {
    /// Build a `run` operation from an argv.
    pub fn run<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Operation::RunCommand(RunCommand::Simple(argv.into_iter().map(Into::into).collect()))
    }

    /// Build a `copy` from the build context.
    pub fn copy(src: impl Into<String>, to: impl Into<String>) -> Self {
        Operation::CopySources(CopySources {
            src: vec![src.into()],
            to: to.into(),
            from: None,
            chown: None,
        })
    }

    /// Build a `copy` out of an earlier stage.
    pub fn copy_from(
        stage: impl Into<String>,
        src: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Operation::CopySources(CopySources {
            src: vec![src.into()],
            to: to.into(),
            from: Some(stage.into()),
            chown: None,
        })
    }

    /// Build an `install` that cleans the package index.
    pub fn install<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Operation::InstallPackages(InstallPackages {
            packages: packages.into_iter().map(Into::into).collect(),
            clean: true,
        })
    }

    /// Build a `create_user` for a service account without a home directory.
    pub fn create_user(name: impl Into<String>) -> Self {
        Operation::CreateUser(CreateUser {
            name: name.into(),
            shell: default_shell(),
            home: false,
        })
    }

    /// Build a `user` step.
    pub fn user(name: impl Into<String>) -> Self {
        Operation::SetUser(name.into())
    }

    /// Whether the operation mutates the filesystem and records a layer.
    #[must_use]
    pub fn writes_layer(&self) -> bool {
        !matches!(self, Operation::SetWorkdir(_) | Operation::SetUser(_))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::SetWorkdir(dir) => write!(f, "WORKDIR {dir}"),
            Operation::CopySources(copy) => {
                f.write_str("COPY")?;
                if let Some(stage) = &copy.from {
                    write!(f, " --from={stage}")?;
                }
                if let Some(owner) = &copy.chown {
                    write!(f, " --chown={owner}")?;
                }
                write!(f, " {} {}", copy.src.join(" "), copy.to)
            }
            Operation::RunCommand(run) => {
                f.write_str("RUN")?;
                if run.privileged() {
                    f.write_str(" (privileged)")?;
                }
                write!(f, " {}", run.argv().join(" "))
            }
            Operation::InstallPackages(install) => {
                write!(f, "INSTALL {}", install.packages.join(" "))?;
                if install.clean {
                    f.write_str(" (clean)")?;
                }
                Ok(())
            }
            Operation::CreateUser(user) => write!(f, "USERADD {}", user.name),
            Operation::SetUser(user) => write!(f, "USER {user}"),
        }
    }
}

/// Copy step configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySources {
    /// Source paths or glob patterns.
    pub src: Vec<String>,

    /// Destination path.
    pub to: String,

    /// Earlier stage to copy from (name or zero-based index).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Owner of the copied entries (default root).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chown: Option<String>,
}

/// Run step configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunCommand {
    /// Plain argv.
    Simple(Vec<String>),

    /// Detailed run configuration.
    Detailed {
        /// Command and arguments.
        argv: Vec<String>,
        /// The command needs root.
        #[serde(default)]
        privileged: bool,
        /// Extra environment.
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

impl RunCommand {
    /// Command and arguments.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        match self {
            RunCommand::Simple(argv) | RunCommand::Detailed { argv, .. } => argv,
        }
    }

    /// Whether the command requires root.
    #[must_use]
    pub fn privileged(&self) -> bool {
        matches!(self, RunCommand::Detailed { privileged: true, .. })
    }

    /// Extra environment for the command.
    #[must_use]
    pub fn env(&self) -> BTreeMap<String, String> {
        match self {
            RunCommand::Simple(_) => BTreeMap::new(),
            RunCommand::Detailed { env, .. } => env.clone(),
        }
    }
}

/// Package install step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallPackages {
    /// Packages to install.
    #[serde(default)]
    pub packages: Vec<String>,

    /// Purge the package index cache in the same step.
    #[serde(default)]
    pub clean: bool,
}

/// Account creation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUser {
    /// Login name.
    pub name: String,

    /// Login shell.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Create `/home/<name>`.
    #[serde(default)]
    pub home: bool,
}

fn default_shell() -> String {
    "/usr/sbin/nologin".to_string()
}

// ============================================================================
// Parsing
// ============================================================================

impl Kilnfile {
    /// Parse from any supported format (auto-detected by file name).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> KilnResult<Self> {
        let content = fs::read_to_string(path)?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();
        if file_name.starts_with("containerfile") || file_name.starts_with("dockerfile") {
            return crate::containerfile::parse(&content);
        }

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("yaml");

        match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            "containerfile" | "dockerfile" => crate::containerfile::parse(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid Kilnfile.
    pub fn from_yaml(content: &str) -> KilnResult<Self> {
        let value: serde_json::Value =
            serde_yaml::from_str(content).map_err(|e| KilnError::Config {
                message: format!("Failed to parse YAML structure: {e}"),
            })?;

        serde_json::from_value(value).map_err(|e| KilnError::Config {
            message: format!("Failed to interpret YAML as Kilnfile: {e}"),
        })
    }

    /// Parse from TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid Kilnfile.
    pub fn from_toml(content: &str) -> KilnResult<Self> {
        toml::from_str(content).map_err(|e| KilnError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })
    }

    /// Parse from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid Kilnfile.
    pub fn from_json(content: &str) -> KilnResult<Self> {
        serde_json::from_str(content).map_err(|e| KilnError::Config {
            message: format!("Failed to parse JSON: {e}"),
        })
    }

    /// Get the final image tag.
    #[must_use]
    pub fn get_tag(&self) -> Option<String> {
        self.metadata.build_tag()
    }

    /// Resolve a stage reference (name or zero-based index) to its position.
    #[must_use]
    pub fn stage_index(&self, reference: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.name.as_deref() == Some(reference))
            .or_else(|| {
                reference
                    .parse::<usize>()
                    .ok()
                    .filter(|idx| *idx < self.stages.len())
            })
    }
}

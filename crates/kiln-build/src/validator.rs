//! Static manifest checks.
//!
//! The validator runs before any stage executes. Findings with
//! [`Severity::Error`] block the build; warnings are reported and the build
//! proceeds.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::error::{BuildError, BuildResult};
use crate::manifest::{Kilnfile, Operation};
use crate::privilege::PrivilegeState;

/// Accounts every base image is assumed to carry.
pub const ASSUMED_USERS: &[&str] = &["root", "nobody"];

/// How serious a finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Reported, build continues.
    Warning,
    /// Build refused.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Error => f.write_str("error"),
        }
    }
}

/// The check that produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    /// The manifest declares no stage.
    EmptyManifest,
    /// Two stages share a name.
    DuplicateStageName,
    /// A copy names a stage that is never declared.
    UnknownStage,
    /// A copy names its own stage.
    SelfReference,
    /// A copy names a stage declared later.
    ForwardReference,
    /// `user` names an account that is neither created earlier nor assumed.
    UnknownUser,
    /// `create_user` repeats an account created earlier in the stage.
    DuplicateUser,
    /// A root-only operation follows a privilege drop.
    RootAfterPrivilegeDrop,
    /// `install` leaves the package index behind.
    MissingCleanup,
    /// `install` with no packages.
    EmptyPackageSet,
    /// An entrypoint on a stage other than the last.
    DiscardedEntrypoint,
    /// The final stage has no entrypoint.
    MissingEntrypoint,
}

impl Rule {
    /// Severity the rule reports at.
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Rule::EmptyManifest
            | Rule::DuplicateStageName
            | Rule::UnknownStage
            | Rule::SelfReference
            | Rule::ForwardReference
            | Rule::UnknownUser
            | Rule::DuplicateUser => Severity::Error,
            Rule::RootAfterPrivilegeDrop
            | Rule::MissingCleanup
            | Rule::EmptyPackageSet
            | Rule::DiscardedEntrypoint
            | Rule::MissingEntrypoint => Severity::Warning,
        }
    }
}

/// One validator finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Check that fired.
    pub rule: Rule,
    /// Severity of the check.
    pub severity: Severity,
    /// Stage label (name or `#index`), if the finding is stage specific.
    pub stage: Option<String>,
    /// Operation index within the stage.
    pub operation: Option<usize>,
    /// Human readable description.
    pub message: String,
}

impl Finding {
    fn new(rule: Rule, message: impl Into<String>) -> Self {
        Self {
            rule,
            severity: rule.severity(),
            stage: None,
            operation: None,
            message: message.into(),
        }
    }

    fn at(mut self, stage: &str, operation: Option<usize>) -> Self {
        self.stage = Some(stage.to_string());
        self.operation = operation;
        self
    }

    /// Whether the finding blocks the build.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.severity)?;
        match (&self.stage, self.operation) {
            (Some(stage), Some(op)) => write!(f, " [{stage} #{op}]")?,
            (Some(stage), None) => write!(f, " [{stage}]")?,
            _ => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Checks a manifest before execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineValidator;

impl PipelineValidator {
    /// Create a validator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Every finding for `manifest`, in stage and operation order.
    #[must_use]
    pub fn validate(&self, manifest: &Kilnfile) -> Vec<Finding> {
        let mut findings = Vec::new();

        if manifest.stages.is_empty() {
            findings.push(Finding::new(Rule::EmptyManifest, "Manifest declares no stages"));
            return findings;
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (index, stage) in manifest.stages.iter().enumerate() {
            let Some(name) = stage.name.as_deref() else {
                continue;
            };
            if let Some(first) = seen.insert(name, index) {
                findings.push(
                    Finding::new(
                        Rule::DuplicateStageName,
                        format!("Stage name '{name}' is already used by stage #{first}"),
                    )
                    .at(&stage.label(index), None),
                );
            }
        }

        let last = manifest.stages.len() - 1;
        for (index, stage) in manifest.stages.iter().enumerate() {
            let label = stage.label(index);
            self.check_stage(manifest, index, &label, &mut findings);

            if index < last && stage.entrypoint.is_some() {
                findings.push(
                    Finding::new(
                        Rule::DiscardedEntrypoint,
                        "Entrypoint is discarded; only the final stage's entrypoint is kept",
                    )
                    .at(&label, None),
                );
            }
        }

        if manifest.stages[last].entrypoint.is_none() {
            findings.push(
                Finding::new(Rule::MissingEntrypoint, "Final stage declares no entrypoint")
                    .at(&manifest.stages[last].label(last), None),
            );
        }

        findings
    }

    /// Validate and fail on hard findings. Returns the warnings.
    ///
    /// # Errors
    ///
    /// [`BuildError::ValidationFailed`] carrying every finding if any is an error.
    pub fn check(&self, manifest: &Kilnfile) -> BuildResult<Vec<Finding>> {
        let findings = self.validate(manifest);
        if findings.iter().any(Finding::is_error) {
            return Err(BuildError::ValidationFailed(findings));
        }
        Ok(findings)
    }

    fn check_stage(
        &self,
        manifest: &Kilnfile,
        index: usize,
        label: &str,
        findings: &mut Vec<Finding>,
    ) {
        let stage = &manifest.stages[index];
        let mut known: HashSet<&str> = ASSUMED_USERS.iter().copied().collect();
        known.extend(stage.assume_users.iter().map(String::as_str));
        let mut created: HashSet<&str> = HashSet::new();
        let mut dropped_to: Option<&str> = None;

        for (op_index, operation) in stage.steps.iter().enumerate() {
            let at = Some(op_index);
            let root_only = match operation {
                Operation::CopySources(copy) => {
                    if let Some(reference) = copy.from.as_deref() {
                        if let Some(finding) = check_reference(manifest, index, reference) {
                            findings.push(finding.at(label, at));
                        }
                    }
                    false
                }
                Operation::RunCommand(run) => run.privileged(),
                Operation::InstallPackages(install) => {
                    if install.packages.is_empty() {
                        findings.push(
                            Finding::new(
                                Rule::EmptyPackageSet,
                                "Install declares no packages and will do nothing",
                            )
                            .at(label, at),
                        );
                    } else if !install.clean {
                        findings.push(
                            Finding::new(
                                Rule::MissingCleanup,
                                format!(
                                    "Install of {} does not purge the package index ({})",
                                    install.packages.join(", "),
                                    stage.packages.index_cache_dir()
                                ),
                            )
                            .at(label, at),
                        );
                    }
                    true
                }
                Operation::CreateUser(user) => {
                    if !created.insert(user.name.as_str()) {
                        findings.push(
                            Finding::new(
                                Rule::DuplicateUser,
                                format!("Account '{}' is created twice", user.name),
                            )
                            .at(label, at),
                        );
                    }
                    true
                }
                Operation::SetUser(name) => {
                    let privilege = PrivilegeState::for_user(name.as_str());
                    if !privilege.is_root()
                        && !PrivilegeState::is_numeric(name)
                        && !known.contains(name.as_str())
                        && !created.contains(name.as_str())
                    {
                        findings.push(
                            Finding::new(
                                Rule::UnknownUser,
                                format!(
                                    "User '{name}' is not created by an earlier create_user \
                                     and is not assumed to exist in '{}'",
                                    stage.from
                                ),
                            )
                            .at(label, at),
                        );
                    }
                    dropped_to = (!privilege.is_root()).then_some(name.as_str());
                    false
                }
                Operation::SetWorkdir(_) => false,
            };

            if root_only {
                if let Some(user) = dropped_to {
                    findings.push(
                        Finding::new(
                            Rule::RootAfterPrivilegeDrop,
                            format!(
                                "{operation} needs root but runs after the switch to user \
                                 '{user}'; it will fail with permission denied"
                            ),
                        )
                        .at(label, at),
                    );
                }
            }
        }
    }
}

fn check_reference(manifest: &Kilnfile, index: usize, reference: &str) -> Option<Finding> {
    match manifest.stage_index(reference) {
        None => Some(Finding::new(
            Rule::UnknownStage,
            format!("Copy references undeclared stage '{reference}'"),
        )),
        Some(source) if source == index => Some(Finding::new(
            Rule::SelfReference,
            format!("Copy references its own stage '{reference}'"),
        )),
        Some(source) if source > index => Some(Finding::new(
            Rule::ForwardReference,
            format!("Copy references stage '{reference}' (#{source}) which is declared later"),
        )),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{InstallPackages, Stage};

    fn two_stage(runtime: Stage) -> Kilnfile {
        Kilnfile {
            metadata: Default::default(),
            stages: vec![
                Stage::new("toolchain")
                    .named("builder")
                    .step(Operation::copy(".", "/src"))
                    .step(Operation::run(["compile", "/src", "-o", "/out/svc"])),
                runtime,
            ],
        }
    }

    fn rules(findings: &[Finding]) -> Vec<Rule> {
        findings.iter().map(|f| f.rule).collect()
    }

    #[test]
    fn well_formed_manifest_is_clean() {
        let manifest = two_stage(
            Stage::new("runtime")
                .step(Operation::create_user("svc"))
                .step(Operation::install(["ca-certificates"]))
                .step(Operation::user("svc"))
                .step(Operation::copy_from("builder", "/out/svc", "/usr/local/bin/svc"))
                .entrypoint(["/usr/local/bin/svc"]),
        );
        assert!(PipelineValidator::new().validate(&manifest).is_empty());
        assert!(PipelineValidator::new().check(&manifest).unwrap().is_empty());
    }

    #[test]
    fn install_after_user_switch_warns() {
        let manifest = two_stage(
            Stage::new("runtime")
                .step(Operation::create_user("svc"))
                .step(Operation::user("svc"))
                .step(Operation::install(["ca-certificates"]))
                .entrypoint(["/usr/local/bin/svc"]),
        );
        let findings = PipelineValidator::new().check(&manifest).unwrap();
        assert_eq!(rules(&findings), vec![Rule::RootAfterPrivilegeDrop]);
        assert_eq!(findings[0].stage.as_deref(), Some("#1"));
        assert_eq!(findings[0].operation, Some(2));
        assert_eq!(findings[0].severity, Severity::Warning);
    }

    #[test]
    fn switching_back_to_root_clears_the_drop() {
        let manifest = two_stage(
            Stage::new("runtime")
                .step(Operation::user("nobody"))
                .step(Operation::user("root"))
                .step(Operation::install(["tzdata"]))
                .entrypoint(["/bin/true"]),
        );
        assert!(PipelineValidator::new().validate(&manifest).is_empty());
    }

    #[test]
    fn cross_stage_reference_integrity() {
        let manifest = Kilnfile {
            metadata: Default::default(),
            stages: vec![
                Stage::new("runtime")
                    .named("app")
                    .step(Operation::copy_from("builder", "/out/svc", "/svc"))
                    .step(Operation::copy_from("app", "/etc", "/etc2"))
                    .step(Operation::copy_from("tester", "/x", "/x")),
                Stage::new("toolchain").named("builder").entrypoint(["svc"]),
            ],
        };

        let err = PipelineValidator::new().check(&manifest).unwrap_err();
        let BuildError::ValidationFailed(findings) = err else {
            panic!("expected validation failure");
        };
        assert_eq!(
            rules(&findings),
            vec![Rule::ForwardReference, Rule::SelfReference, Rule::UnknownStage]
        );
        assert!(findings.iter().all(Finding::is_error));
    }

    #[test]
    fn numeric_forward_reference() {
        let manifest = Kilnfile {
            metadata: Default::default(),
            stages: vec![
                Stage::new("runtime").step(Operation::copy_from("1", "/out", "/out")),
                Stage::new("runtime").entrypoint(["x"]),
            ],
        };
        let findings = PipelineValidator::new().validate(&manifest);
        assert_eq!(rules(&findings), vec![Rule::ForwardReference]);
    }

    #[test]
    fn set_user_must_be_created_or_assumed() {
        let mut runtime = Stage::new("runtime")
            .step(Operation::user("svc"))
            .step(Operation::user("www-data"))
            .step(Operation::user("nobody"))
            .step(Operation::user("1000:1000"))
            .entrypoint(["svc"]);
        runtime.assume_users.push("www-data".into());

        let findings = PipelineValidator::new().validate(&two_stage(runtime));
        assert_eq!(rules(&findings), vec![Rule::UnknownUser]);
        assert_eq!(findings[0].operation, Some(0));
    }

    #[test]
    fn users_do_not_leak_across_stages() {
        let manifest = Kilnfile {
            metadata: Default::default(),
            stages: vec![
                Stage::new("runtime").named("a").step(Operation::create_user("svc")),
                Stage::new("runtime").step(Operation::user("svc")).entrypoint(["x"]),
            ],
        };
        assert_eq!(
            rules(&PipelineValidator::new().validate(&manifest)),
            vec![Rule::UnknownUser]
        );
    }

    #[test]
    fn package_hygiene_warnings() {
        let manifest = two_stage(
            Stage::new("runtime")
                .step(Operation::InstallPackages(InstallPackages {
                    packages: vec!["curl".into()],
                    clean: false,
                }))
                .step(Operation::install(Vec::<String>::new())),
        );
        let findings = PipelineValidator::new().check(&manifest).unwrap();
        assert_eq!(
            rules(&findings),
            vec![Rule::MissingCleanup, Rule::EmptyPackageSet, Rule::MissingEntrypoint]
        );
        assert!(findings[0].message.contains("/var/lib/apt/lists"));
    }

    #[test]
    fn structural_errors() {
        assert_eq!(
            rules(&PipelineValidator::new().validate(&Kilnfile::default())),
            vec![Rule::EmptyManifest]
        );

        let manifest = Kilnfile {
            metadata: Default::default(),
            stages: vec![
                Stage::new("a").named("dup").entrypoint(["x"]),
                Stage::new("b").named("dup").entrypoint(["y"]),
            ],
        };
        assert_eq!(
            rules(&PipelineValidator::new().validate(&manifest)),
            vec![Rule::DuplicateStageName, Rule::DiscardedEntrypoint]
        );
    }

    #[test]
    fn finding_display() {
        let finding = Finding::new(Rule::MissingCleanup, "no purge").at("runtime", Some(3));
        assert_eq!(finding.to_string(), "warning [runtime #3]: no purge");
        assert_eq!(
            Finding::new(Rule::EmptyManifest, "empty").to_string(),
            "error: empty"
        );
    }
}

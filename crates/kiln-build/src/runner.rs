//! Command execution against a snapshot.
//!
//! Compilers, package managers and any other `run` program are opaque to the
//! pipeline. A [`CommandRunner`] takes a snapshot and an [`Invocation`] and
//! reports the exit status together with the resulting snapshot.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{BuildError, BuildResult};
use crate::privilege::PrivilegeState;
use crate::snapshot::{normalize, Snapshot, SnapshotBuilder};

/// Exit status reported when the program cannot be found.
pub const EXIT_NOT_FOUND: i32 = 127;

/// One command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Working directory inside the snapshot.
    pub workdir: String,
    /// Effective user.
    pub user: PrivilegeState,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    /// An invocation as root in `/` with no extra environment.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            workdir: "/".to_string(),
            user: PrivilegeState::Root,
            env: BTreeMap::new(),
        }
    }

    /// Program name (first argv element).
    #[must_use]
    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }
}

/// Result of running a command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Process exit status.
    pub exit_code: i32,
    /// Filesystem after the command; the input snapshot on failure.
    pub snapshot: Snapshot,
}

impl CommandOutcome {
    /// Whether the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes opaque commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `invocation` against `snapshot`, blocking until the command exits.
    async fn run(
        &self,
        invocation: &Invocation,
        snapshot: &Snapshot,
    ) -> BuildResult<CommandOutcome>;

    /// Name of the execution mode; layers cached under one mode are never
    /// reused under another.
    fn kind(&self) -> &'static str;

    /// Whether commands see only the snapshot. An unconfined runner acts on
    /// the host filesystem.
    fn confined(&self) -> bool {
        true
    }
}

// ============================================================================
// Host runner
// ============================================================================

/// Runs commands as host processes over a materialized copy of the snapshot.
///
/// The snapshot is written into a temporary directory, exported to the
/// command as `KILN_ROOTFS`, and read back once the command exits. By default
/// the command runs inside that tree through `chroot(8)`, with `--userspec`
/// for non-root users so the kernel enforces the effective user; this needs
/// root on the host and a `/bin/sh` in the image.
///
/// An unconfined runner spawns the program directly on the host with only its
/// working directory inside the tree, so absolute paths reach the host. It
/// refuses non-root invocations, and the executor refuses package installs and
/// account creation on it.
#[derive(Debug, Clone)]
pub struct HostRunner {
    confined: bool,
}

impl Default for HostRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRunner {
    /// A runner that confines commands to the snapshot tree.
    #[must_use]
    pub fn new() -> Self {
        Self { confined: true }
    }

    /// A runner that spawns commands directly on the host.
    #[must_use]
    pub fn unconfined() -> Self {
        Self { confined: false }
    }

    fn command(
        &self,
        invocation: &Invocation,
        rootfs: &std::path::Path,
    ) -> tokio::process::Command {
        let workdir = normalize("/", &invocation.workdir);

        let mut cmd = if self.confined {
            let mut cmd = tokio::process::Command::new("chroot");
            if !invocation.user.is_root() {
                cmd.arg(format!("--userspec={}", invocation.user.name()));
            }
            cmd.arg(rootfs)
                .args(["/bin/sh", "-c", "cd \"$0\" && exec \"$@\""])
                .arg(&workdir)
                .args(&invocation.argv);
            cmd
        } else {
            let mut cmd = tokio::process::Command::new(invocation.program());
            cmd.args(&invocation.argv[1..])
                .current_dir(rootfs.join(workdir.trim_start_matches('/')));
            cmd
        };

        cmd.env("KILN_ROOTFS", rootfs)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        snapshot: &Snapshot,
    ) -> BuildResult<CommandOutcome> {
        if invocation.argv.is_empty() {
            return Ok(CommandOutcome {
                exit_code: EXIT_NOT_FOUND,
                snapshot: snapshot.clone(),
            });
        }
        if !self.confined && !invocation.user.is_root() {
            return Err(BuildError::Unconfined {
                operation: format!(
                    "RUN {} as user '{}'",
                    invocation.argv.join(" "),
                    invocation.user
                ),
            });
        }

        let workspace = tempfile::tempdir()?;
        let rootfs = workspace.path().join("rootfs");
        snapshot.write_to_dir(&rootfs)?;
        std::fs::create_dir_all(rootfs.join(invocation.workdir.trim_start_matches('/')))?;

        tracing::debug!(
            argv = ?invocation.argv,
            workdir = %invocation.workdir,
            user = %invocation.user,
            confined = self.confined,
            "Spawning command"
        );

        let output = match self.command(invocation, &rootfs).output().await {
            Ok(output) => output,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(program = %invocation.program(), "Program not found");
                return Ok(CommandOutcome {
                    exit_code: EXIT_NOT_FOUND,
                    snapshot: snapshot.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::info!(target: "kiln_build::run", "{line}");
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            tracing::info!(target: "kiln_build::run", stream = "stderr", "{line}");
        }

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            return Ok(CommandOutcome {
                exit_code,
                snapshot: snapshot.clone(),
            });
        }

        let snapshot = Snapshot::read_dir(&rootfs, snapshot, invocation.user.name())?;
        Ok(CommandOutcome { exit_code, snapshot })
    }

    fn kind(&self) -> &'static str {
        if self.confined { "host" } else { "host-unconfined" }
    }

    fn confined(&self) -> bool {
        self.confined
    }
}

// ============================================================================
// Simulated runner
// ============================================================================

/// Effect of a simulated program: edit the filesystem, return the exit status.
pub type Handler = Box<dyn Fn(&Invocation, &mut SnapshotBuilder) -> i32 + Send + Sync>;

/// A runner that never spawns processes.
///
/// Programs with a registered handler apply its effect; anything else exits
/// zero without touching the filesystem. `rm`, `mkdir`, `true` and `false`
/// are built in. Every invocation is recorded.
pub struct SimulatedRunner {
    handlers: HashMap<String, Handler>,
    invocations: Mutex<Vec<Invocation>>,
}

impl Default for SimulatedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRunner {
    /// A runner with the built-in programs.
    #[must_use]
    pub fn new() -> Self {
        let runner = Self {
            handlers: HashMap::new(),
            invocations: Mutex::new(Vec::new()),
        };

        runner
            .on("true", |_, _| 0)
            .on("false", |_, _| 1)
            .on("rm", |inv, fs| {
                for path in inv.argv[1..].iter().filter(|a| !a.starts_with('-')) {
                    fs.remove(&normalize(&inv.workdir, path));
                }
                0
            })
            .on("mkdir", |inv, fs| {
                for path in inv.argv[1..].iter().filter(|a| !a.starts_with('-')) {
                    fs.mkdir_all(&normalize(&inv.workdir, path), inv.user.name());
                }
                0
            })
    }

    /// Register the effect of `program`, replacing any previous handler.
    #[must_use]
    pub fn on<F>(mut self, program: &str, handler: F) -> Self
    where
        F: Fn(&Invocation, &mut SnapshotBuilder) -> i32 + Send + Sync + 'static,
    {
        self.handlers.insert(program.to_string(), Box::new(handler));
        self
    }

    /// All invocations so far, in order.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for SimulatedRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        snapshot: &Snapshot,
    ) -> BuildResult<CommandOutcome> {
        self.invocations.lock().push(invocation.clone());

        let program = invocation.program();
        let handler = self.handlers.get(program).or_else(|| {
            program
                .rsplit('/')
                .next()
                .and_then(|base| self.handlers.get(base))
        });

        let Some(handler) = handler else {
            tracing::debug!(argv = ?invocation.argv, "Simulated command (no effect)");
            return Ok(CommandOutcome {
                exit_code: 0,
                snapshot: snapshot.clone(),
            });
        };

        let mut builder = snapshot.edit();
        let exit_code = handler(invocation, &mut builder);
        tracing::debug!(argv = ?invocation.argv, exit_code, "Simulated command");

        Ok(CommandOutcome {
            exit_code,
            snapshot: if exit_code == 0 {
                builder.freeze()
            } else {
                snapshot.clone()
            },
        })
    }

    fn kind(&self) -> &'static str {
        "simulated"
    }
}

//! Stage execution.
//!
//! A stage is a fold over its operations. Each operation receives the state
//! left by the previous one (snapshot, effective user, working directory) and
//! returns the next state; nothing is mutated in place. The effective user an
//! operation sees is therefore exactly the one in force at its position in the
//! stage, which is what makes a privilege drop before an install fail at the
//! install instead of going unnoticed.

use kiln_common::KilnResult;
use parking_lot::Mutex;

use crate::cache::CacheManager;
use crate::context::BuildContext;
use crate::error::{BuildError, BuildResult};
use crate::image::LayerRecord;
use crate::manifest::{CopySources, CreateUser, InstallPackages, Operation, RunCommand, Stage};
use crate::packages::PackageManagerKind;
use crate::privilege::PrivilegeState;
use crate::promoter::{Artifact, ArtifactPromoter, CrossStageReference};
use crate::runner::{CommandRunner, Invocation};
use crate::snapshot::{normalize, Account, Node, Snapshot, PASSWD_PATH, ROOT_USER};

/// Lowest uid handed out by `create_user`.
pub const FIRST_USER_UID: u32 = 1000;

/// The uid of `nobody`, never used as a baseline for new accounts.
const NOBODY_UID: u32 = 65_534;

/// Exit status `useradd` uses when the account already exists.
const EXIT_USER_EXISTS: i32 = 9;

/// State threaded from one operation to the next.
#[derive(Debug, Clone)]
pub struct StageState {
    /// Current filesystem.
    pub snapshot: Snapshot,
    /// Effective user.
    pub privilege: PrivilegeState,
    /// Working directory for relative paths.
    pub workdir: String,
}

impl StageState {
    /// Initial state on top of a base snapshot: root in `/`.
    #[must_use]
    pub fn new(base: Snapshot) -> Self {
        Self {
            snapshot: base,
            privilege: PrivilegeState::Root,
            workdir: "/".to_string(),
        }
    }
}

/// Result of a completed stage.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// Final state.
    pub state: StageState,
    /// One record per operation.
    pub history: Vec<LayerRecord>,
}

/// Runs the operations of one stage.
pub struct StageExecutor<'a> {
    runner: &'a dyn CommandRunner,
    context: &'a BuildContext,
    cache: Option<&'a Mutex<CacheManager>>,
}

impl<'a> StageExecutor<'a> {
    /// Create an executor over a runner and the shared build context.
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, context: &'a BuildContext) -> Self {
        Self {
            runner,
            context,
            cache: None,
        }
    }

    /// Reuse and record `run`/`install` results in a layer cache.
    #[must_use]
    pub fn with_cache(mut self, cache: &'a Mutex<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Execute `stage` (declared at `index`) on top of `base`.
    ///
    /// `promoter` supplies the final snapshots of earlier stages.
    ///
    /// # Errors
    ///
    /// The first failing operation aborts the stage; the error is wrapped in
    /// [`BuildError::Operation`] naming the stage and operation index.
    pub async fn execute(
        &self,
        stage: &Stage,
        index: usize,
        base: Snapshot,
        promoter: &ArtifactPromoter,
    ) -> BuildResult<StageOutcome> {
        let label = stage.label(index);
        let mut state = StageState::new(base);
        let mut history = Vec::with_capacity(stage.steps.len());

        for (op_index, operation) in stage.steps.iter().enumerate() {
            tracing::debug!(
                stage = %label,
                index = op_index,
                user = %state.privilege,
                "{operation}"
            );

            state = self
                .apply(stage, &label, operation, state, promoter)
                .await
                .map_err(|source| BuildError::Operation {
                    stage: label.clone(),
                    index: op_index,
                    operation: operation.to_string(),
                    source: Box::new(source),
                })?;

            history.push(LayerRecord {
                digest: state.snapshot.digest(),
                created_by: operation.to_string(),
                empty_layer: !operation.writes_layer(),
            });
        }

        Ok(StageOutcome { state, history })
    }

    async fn apply(
        &self,
        stage: &Stage,
        label: &str,
        operation: &Operation,
        state: StageState,
        promoter: &ArtifactPromoter,
    ) -> BuildResult<StageState> {
        match operation {
            Operation::SetWorkdir(dir) => Ok(StageState {
                workdir: normalize(&state.workdir, dir),
                ..state
            }),
            Operation::CopySources(copy) => {
                let snapshot = self.copy(label, copy, &state, promoter)?;
                Ok(StageState { snapshot, ..state })
            }
            Operation::RunCommand(run) => {
                if run.privileged() {
                    require_root(&state, operation)?;
                }
                let scope = self.runner.kind();
                let snapshot = match self.cached(operation, &state, scope)? {
                    Some(snapshot) => snapshot,
                    None => {
                        let snapshot = self.run(run, &state).await?;
                        self.remember(operation, &state, scope, &snapshot)?;
                        snapshot
                    }
                };
                Ok(StageState { snapshot, ..state })
            }
            Operation::InstallPackages(install) => {
                require_root(&state, operation)?;
                self.require_confined(operation)?;
                if install.packages.is_empty() {
                    tracing::debug!(stage = %label, "Empty package set, nothing to install");
                    return Ok(state);
                }
                let scope = format!("{}/{}", self.runner.kind(), stage.packages);
                let snapshot = match self.cached(operation, &state, &scope)? {
                    Some(snapshot) => snapshot,
                    None => {
                        let snapshot = self.install(stage.packages, install, &state).await?;
                        self.remember(operation, &state, &scope, &snapshot)?;
                        snapshot
                    }
                };
                Ok(StageState { snapshot, ..state })
            }
            Operation::CreateUser(user) => {
                require_root(&state, operation)?;
                self.require_confined(operation)?;
                let snapshot = create_user(&state.snapshot, user)?;
                Ok(StageState { snapshot, ..state })
            }
            Operation::SetUser(name) => {
                let privilege = PrivilegeState::for_user(name.as_str());
                if !privilege.is_root()
                    && !PrivilegeState::is_numeric(name)
                    && state.snapshot.account(name).is_none()
                {
                    return Err(BuildError::UnknownUser { user: name.clone() });
                }
                Ok(StageState { privilege, ..state })
            }
        }
    }

    fn copy(
        &self,
        label: &str,
        copy: &CopySources,
        state: &StageState,
        promoter: &ArtifactPromoter,
    ) -> BuildResult<Snapshot> {
        let dest = normalize(&state.workdir, &copy.to);

        let mut artifacts: Vec<Artifact> = Vec::new();
        for src in &copy.src {
            match &copy.from {
                Some(stage) => artifacts.push(promoter.promote(&CrossStageReference {
                    source_stage: stage.clone(),
                    source_path: normalize("/", src),
                    dest_stage: label.to_string(),
                    dest_path: dest.clone(),
                })?),
                None => artifacts.extend(
                    self.context
                        .resolve(src)
                        .ok_or_else(|| BuildError::SourceNotFound { path: src.clone() })?,
                ),
            }
        }

        let into_dir =
            copy.to.ends_with('/') || artifacts.len() > 1 || state.snapshot.is_dir(&dest);
        let owner = copy.chown.as_deref().unwrap_or(ROOT_USER);

        let mut builder = state.snapshot.edit();
        for artifact in artifacts {
            if artifact.is_dir {
                builder.mkdir_all(&dest, owner);
                builder.graft(&dest, artifact.entries, Some(owner));
            } else {
                let target = if into_dir {
                    normalize(&dest, &artifact.name)
                } else {
                    dest.clone()
                };
                builder.graft(&target, artifact.entries, Some(owner));
            }
        }

        Ok(builder.freeze())
    }

    async fn run(&self, run: &RunCommand, state: &StageState) -> BuildResult<Snapshot> {
        let invocation = Invocation {
            argv: run.argv().to_vec(),
            workdir: state.workdir.clone(),
            user: state.privilege.clone(),
            env: run.env(),
        };
        self.invoke(&invocation, &state.snapshot).await
    }

    async fn install(
        &self,
        manager: PackageManagerKind,
        install: &InstallPackages,
        state: &StageState,
    ) -> BuildResult<Snapshot> {
        let mut commands = Vec::new();
        commands.extend(manager.refresh_argv());
        commands.push(manager.install_argv(&install.packages));
        if install.clean {
            commands.push(manager.purge_argv());
        }

        let mut snapshot = state.snapshot.clone();
        for argv in commands {
            let invocation = Invocation {
                argv,
                workdir: state.workdir.clone(),
                user: state.privilege.clone(),
                env: std::collections::BTreeMap::new(),
            };
            snapshot = self.invoke(&invocation, &snapshot).await?;
        }

        tracing::info!(
            packages = ?install.packages,
            manager = %manager,
            clean = install.clean,
            "Installed packages"
        );
        Ok(snapshot)
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        snapshot: &Snapshot,
    ) -> BuildResult<Snapshot> {
        let outcome = self.runner.run(invocation, snapshot).await?;
        if !outcome.success() {
            return Err(BuildError::CommandFailed {
                argv: invocation.argv.clone(),
                exit_code: outcome.exit_code,
            });
        }
        Ok(outcome.snapshot)
    }

    fn require_confined(&self, operation: &Operation) -> BuildResult<()> {
        if self.runner.confined() {
            Ok(())
        } else {
            Err(BuildError::Unconfined {
                operation: operation.to_string(),
            })
        }
    }

    fn cached(
        &self,
        operation: &Operation,
        state: &StageState,
        scope: &str,
    ) -> KilnResult<Option<Snapshot>> {
        let Some(cache) = self.cache else {
            return Ok(None);
        };
        cache.lock().get(&cache_key(operation, state, scope))
    }

    fn remember(
        &self,
        operation: &Operation,
        state: &StageState,
        scope: &str,
        snapshot: &Snapshot,
    ) -> KilnResult<()> {
        let Some(cache) = self.cache else {
            return Ok(());
        };
        let key = cache_key(operation, state, scope);
        cache.lock().store(&key, snapshot, &operation.to_string())
    }
}

fn cache_key(operation: &Operation, state: &StageState, scope: &str) -> String {
    CacheManager::key(
        &state.snapshot.digest(),
        operation,
        &state.workdir,
        &state.privilege,
        scope,
    )
}

fn require_root(state: &StageState, operation: &Operation) -> BuildResult<()> {
    if state.privilege.is_root() {
        Ok(())
    } else {
        Err(BuildError::PermissionDenied {
            operation: operation.to_string(),
            user: state.privilege.name().to_string(),
        })
    }
}

fn create_user(snapshot: &Snapshot, user: &CreateUser) -> BuildResult<Snapshot> {
    let accounts = snapshot.accounts();
    if accounts.iter().any(|a| a.name == user.name) {
        return Err(BuildError::CommandFailed {
            argv: vec!["useradd".to_string(), user.name.clone()],
            exit_code: EXIT_USER_EXISTS,
        });
    }

    let uid = accounts
        .iter()
        .map(|a| a.uid)
        .filter(|uid| (FIRST_USER_UID..NOBODY_UID).contains(uid))
        .max()
        .map_or(FIRST_USER_UID, |uid| uid + 1);

    let home = if user.home {
        format!("/home/{}", user.name)
    } else {
        "/nonexistent".to_string()
    };
    let account = Account {
        name: user.name.clone(),
        uid,
        gid: uid,
        home: home.clone(),
        shell: user.shell.clone(),
    };

    let mut builder = snapshot.edit();
    builder.append_line(PASSWD_PATH, &account.to_line());
    if user.home {
        builder.insert(&home, Node::dir(user.name.as_str()));
    }

    tracing::debug!(user = %user.name, uid, "Created account");
    Ok(builder.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Kilnfile;
    use crate::runner::{CommandOutcome, SimulatedRunner};

    /// Delegates to a simulated runner while reporting another mode.
    struct Relabelled<'a> {
        inner: &'a SimulatedRunner,
        kind: &'static str,
        confined: bool,
    }

    #[async_trait::async_trait]
    impl CommandRunner for Relabelled<'_> {
        async fn run(
            &self,
            invocation: &Invocation,
            snapshot: &Snapshot,
        ) -> BuildResult<CommandOutcome> {
            self.inner.run(invocation, snapshot).await
        }

        fn kind(&self) -> &'static str {
            self.kind
        }

        fn confined(&self) -> bool {
            self.confined
        }
    }

    fn runtime_base() -> Snapshot {
        let mut builder = Snapshot::empty().edit();
        builder.write_file(
            PASSWD_PATH,
            "root:x:0:0:root:/root:/bin/sh\nnobody:x:65534:65534::/nonexistent:/usr/sbin/nologin\n",
            ROOT_USER,
        );
        builder.mkdir_all("/var/lib/apt/lists", ROOT_USER);
        builder.freeze()
    }

    fn apt_runner() -> SimulatedRunner {
        SimulatedRunner::new()
            .on("apt-get", |inv, fs| {
                match inv.argv.get(1).map(String::as_str) {
                    Some("update") => {
                        fs.write_file("/var/lib/apt/lists/main_Packages", "index", ROOT_USER);
                    }
                    Some("install") => {
                        for pkg in inv.argv[4..].iter() {
                            let doc = format!("/usr/share/doc/{pkg}/copyright");
                            fs.write_file(&doc, "", ROOT_USER);
                        }
                    }
                    _ => return 100,
                }
                0
            })
    }

    async fn execute(stage: Stage, runner: &SimulatedRunner) -> BuildResult<StageOutcome> {
        let manifest = Kilnfile {
            metadata: Default::default(),
            stages: vec![stage.clone()],
        };
        let context = BuildContext::empty();
        let promoter = ArtifactPromoter::new(&manifest);
        StageExecutor::new(runner, &context)
            .execute(&stage, 0, runtime_base(), &promoter)
            .await
    }

    #[tokio::test]
    async fn install_then_drop_privileges() {
        let runner = apt_runner();
        let stage = Stage::new("runtime")
            .step(Operation::create_user("svc"))
            .step(Operation::install(["ca-certificates"]))
            .step(Operation::user("svc"));

        let outcome = execute(stage, &runner).await.unwrap();
        let state = outcome.state;

        assert_eq!(state.privilege, PrivilegeState::for_user("svc"));
        assert!(state.snapshot.exists("/usr/share/doc/ca-certificates/copyright"));
        assert!(!state.snapshot.exists("/var/lib/apt/lists/main_Packages"));
        assert_eq!(state.snapshot.account("svc").unwrap().uid, FIRST_USER_UID);
        assert_eq!(outcome.history.len(), 3);
        assert!(outcome.history[2].empty_layer);

        let programs: Vec<_> = runner
            .invocations()
            .iter()
            .map(|i| i.argv[..2].join(" "))
            .collect();
        assert_eq!(programs, vec!["apt-get update", "apt-get install", "rm -rf"]);
        assert!(runner.invocations().iter().all(|i| i.user.is_root()));
    }

    #[tokio::test]
    async fn install_after_privilege_drop_is_denied() {
        let runner = apt_runner();
        let stage = Stage::new("runtime")
            .step(Operation::create_user("svc"))
            .step(Operation::user("svc"))
            .step(Operation::install(["ca-certificates"]));

        let err = execute(stage, &runner).await.unwrap_err();
        match &err {
            BuildError::Operation { stage, index, .. } => {
                assert_eq!(stage, "#0");
                assert_eq!(*index, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            err.root_cause(),
            BuildError::PermissionDenied { user, .. } if user == "svc"
        ));
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn privileged_run_needs_root_but_plain_run_does_not() {
        let runner = SimulatedRunner::new();
        let stage = Stage::new("runtime")
            .step(Operation::user("nobody"))
            .step(Operation::run(["svc", "--self-test"]))
            .step(Operation::RunCommand(RunCommand::Detailed {
                argv: vec!["sysctl".into(), "-w".into()],
                privileged: true,
                env: Default::default(),
            }));

        let err = execute(stage, &runner).await.unwrap_err();
        assert!(matches!(err.root_cause(), BuildError::PermissionDenied { .. }));
        assert_eq!(runner.invocations().len(), 1);
        assert_eq!(runner.invocations()[0].user.name(), "nobody");
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let runner = SimulatedRunner::new().on("compile", |_, _| 2);
        let stage = Stage::new("toolchain")
            .named("builder")
            .step(Operation::run(["compile", "/src"]));

        let err = execute(stage, &runner).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
        assert!(err.to_string().starts_with("Stage 'builder' operation #0"));
    }

    #[tokio::test]
    async fn set_user_requires_known_account() {
        let runner = SimulatedRunner::new();
        let err = execute(Stage::new("runtime").step(Operation::user("svc")), &runner)
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), BuildError::UnknownUser { user } if user == "svc"));

        let numeric = execute(Stage::new("runtime").step(Operation::user("1000:1000")), &runner)
            .await
            .unwrap();
        assert_eq!(numeric.state.privilege.name(), "1000:1000");
    }

    #[tokio::test]
    async fn create_user_twice_fails_and_needs_root() {
        let runner = SimulatedRunner::new();
        let stage = Stage::new("runtime")
            .step(Operation::create_user("svc"))
            .step(Operation::create_user("svc"));
        let err = execute(stage, &runner).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(EXIT_USER_EXISTS));

        let stage = Stage::new("runtime")
            .step(Operation::user("nobody"))
            .step(Operation::create_user("svc"));
        let err = execute(stage, &runner).await.unwrap_err();
        assert!(matches!(err.root_cause(), BuildError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn create_user_with_home() {
        let runner = SimulatedRunner::new();
        let stage = Stage::new("runtime")
            .step(Operation::create_user("first"))
            .step(Operation::CreateUser(CreateUser {
                name: "svc".into(),
                shell: "/bin/sh".into(),
                home: true,
            }));

        let snapshot = execute(stage, &runner).await.unwrap().state.snapshot;
        let account = snapshot.account("svc").unwrap();
        assert_eq!(account.uid, FIRST_USER_UID + 1);
        assert_eq!(account.home, "/home/svc");
        assert_eq!(snapshot.get("/home/svc").unwrap().owner, "svc");
    }

    #[tokio::test]
    async fn workdir_resolves_relative_paths_without_touching_fs() {
        let runner = SimulatedRunner::new().on("touch", |inv, fs| {
            fs.write_file(&normalize(&inv.workdir, &inv.argv[1]), "", inv.user.name());
            0
        });
        let stage = Stage::new("runtime")
            .step(Operation::SetWorkdir("/app".into()))
            .step(Operation::SetWorkdir("data".into()))
            .step(Operation::run(["touch", "marker"]));

        let outcome = execute(stage, &runner).await.unwrap();
        assert_eq!(outcome.state.workdir, "/app/data");
        assert!(outcome.state.snapshot.exists("/app/data/marker"));
        assert_eq!(outcome.history[0].digest, runtime_base().digest());
    }

    #[tokio::test]
    async fn empty_install_is_a_no_op() {
        let runner = SimulatedRunner::new();
        let stage = Stage::new("runtime").step(Operation::install(Vec::<String>::new()));
        let outcome = execute(stage, &runner).await.unwrap();
        assert_eq!(outcome.state.snapshot, runtime_base());
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn copy_from_context_into_directory() {
        let mut files = Snapshot::empty().edit();
        files.write_file("/src/main.rs", "fn main() {}", ROOT_USER);
        files.write_file("/Cargo.toml", "[package]", ROOT_USER);
        let context = BuildContext::from_snapshot(files.freeze());

        let stage = Stage::new("toolchain")
            .step(Operation::copy(".", "/build"))
            .step(Operation::copy("Cargo.toml", "/etc/svc/"))
            .step(Operation::CopySources(CopySources {
                src: vec!["src/main.rs".into()],
                to: "/opt/main.rs".into(),
                from: None,
                chown: Some("nobody".into()),
            }))
            .step(Operation::copy("missing.rs", "/x"));
        let manifest = Kilnfile {
            metadata: Default::default(),
            stages: vec![stage.clone()],
        };
        let runner = SimulatedRunner::new();
        let promoter = ArtifactPromoter::new(&manifest);
        let executor = StageExecutor::new(&runner, &context);

        let err = executor
            .execute(&stage, 0, runtime_base(), &promoter)
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            BuildError::SourceNotFound { path } if path == "missing.rs"
        ));

        let mut ok = stage.clone();
        ok.steps.pop();
        let snapshot = executor
            .execute(&ok, 0, runtime_base(), &promoter)
            .await
            .unwrap()
            .state
            .snapshot;
        assert!(snapshot.exists("/build/src/main.rs"));
        assert!(snapshot.exists("/build/Cargo.toml"));
        assert!(snapshot.exists("/etc/svc/Cargo.toml"));
        assert_eq!(snapshot.get("/opt/main.rs").unwrap().owner, "nobody");
    }

    #[tokio::test]
    async fn cache_skips_repeated_commands() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Mutex::new(CacheManager::new(temp.path()));
        let runner = apt_runner();
        let stage = Stage::new("runtime").step(Operation::install(["tzdata"]));
        let manifest = Kilnfile {
            metadata: Default::default(),
            stages: vec![stage.clone()],
        };
        let context = BuildContext::empty();
        let promoter = ArtifactPromoter::new(&manifest);
        let executor = StageExecutor::new(&runner, &context).with_cache(&cache);

        let first = executor.execute(&stage, 0, runtime_base(), &promoter).await.unwrap();
        let calls = runner.invocations().len();
        let second = executor.execute(&stage, 0, runtime_base(), &promoter).await.unwrap();

        assert_eq!(runner.invocations().len(), calls);
        assert_eq!(first.state.snapshot, second.state.snapshot);
        assert_eq!(cache.lock().entry_count(), 1);
    }

    async fn execute_cached(
        stage: &Stage,
        runner: &dyn CommandRunner,
        cache: &Mutex<CacheManager>,
    ) -> BuildResult<StageOutcome> {
        let manifest = Kilnfile {
            metadata: Default::default(),
            stages: vec![stage.clone()],
        };
        let context = BuildContext::empty();
        let promoter = ArtifactPromoter::new(&manifest);
        StageExecutor::new(runner, &context)
            .with_cache(cache)
            .execute(stage, 0, runtime_base(), &promoter)
            .await
    }

    #[tokio::test]
    async fn simulated_layers_are_not_reused_by_real_runs() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Mutex::new(CacheManager::new(temp.path()));
        let stage = Stage::new("runtime")
            .step(Operation::install(["tzdata"]))
            .step(Operation::run(["update-ca-certificates"]));

        let simulated = apt_runner();
        execute_cached(&stage, &simulated, &cache).await.unwrap();
        assert_eq!(cache.lock().entry_count(), 2);

        let inner = apt_runner();
        let host = Relabelled {
            inner: &inner,
            kind: "host",
            confined: true,
        };
        execute_cached(&stage, &host, &cache).await.unwrap();

        let programs: Vec<_> = inner.invocations().iter().map(|i| i.argv[0].clone()).collect();
        assert!(programs.contains(&"apt-get".to_string()));
        assert!(programs.contains(&"update-ca-certificates".to_string()));
        assert_eq!(cache.lock().entry_count(), 4);

        let before = inner.invocations().len();
        execute_cached(&stage, &host, &cache).await.unwrap();
        assert_eq!(inner.invocations().len(), before);
    }

    #[tokio::test]
    async fn cached_installs_are_scoped_to_the_package_manager() {
        let temp = tempfile::tempdir().unwrap();
        let cache = Mutex::new(CacheManager::new(temp.path()));

        let apt = apt_runner();
        let debian = Stage::new("runtime").step(Operation::install(["tzdata"]));
        execute_cached(&debian, &apt, &cache).await.unwrap();

        let apk = SimulatedRunner::new().on("apk", |inv, fs| {
            for pkg in &inv.argv[2..] {
                fs.write_file(&format!("/usr/share/apk/{pkg}"), "", ROOT_USER);
            }
            0
        });
        let mut alpine = debian.clone();
        alpine.packages = PackageManagerKind::Apk;
        let outcome = execute_cached(&alpine, &apk, &cache).await.unwrap();

        assert_eq!(apk.invocations()[0].argv, vec!["apk", "add", "tzdata"]);
        assert!(outcome.state.snapshot.exists("/usr/share/apk/tzdata"));
        assert!(!outcome.state.snapshot.exists("/usr/share/doc/tzdata/copyright"));
    }

    #[tokio::test]
    async fn unconfined_runner_refuses_installs_and_accounts() {
        let inner = apt_runner();
        let runner = Relabelled {
            inner: &inner,
            kind: "host-unconfined",
            confined: false,
        };
        let context = BuildContext::empty();

        for operation in [Operation::install(["tzdata"]), Operation::create_user("svc")] {
            let stage = Stage::new("runtime").step(operation);
            let manifest = Kilnfile {
                metadata: Default::default(),
                stages: vec![stage.clone()],
            };
            let promoter = ArtifactPromoter::new(&manifest);
            let err = StageExecutor::new(&runner, &context)
                .execute(&stage, 0, runtime_base(), &promoter)
                .await
                .unwrap_err();
            assert!(matches!(err.root_cause(), BuildError::Unconfined { .. }));
        }
        assert!(inner.invocations().is_empty());

        let stage = Stage::new("runtime").step(Operation::run(["true"]));
        let manifest = Kilnfile {
            metadata: Default::default(),
            stages: vec![stage.clone()],
        };
        let promoter = ArtifactPromoter::new(&manifest);
        StageExecutor::new(&runner, &context)
            .execute(&stage, 0, runtime_base(), &promoter)
            .await
            .unwrap();
        assert_eq!(inner.invocations().len(), 1);
    }
}

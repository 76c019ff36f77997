//! Host build context.
//!
//! The build context is the host directory whose files `copy` steps without a
//! `from` stage read. It is loaded once, is read-only, and is shared by every
//! stage of a build.

use std::fs;
use std::path::Path;

use kiln_common::{KilnError, KilnResult};

use crate::promoter::Artifact;
use crate::snapshot::{normalize, Snapshot, ROOT_USER};

/// File listing glob patterns excluded from the context.
pub const IGNORE_FILE: &str = ".kilnignore";

/// `*` and `?` stay within one path component.
const MATCH_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// The read-only host build context.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    files: Snapshot,
}

impl BuildContext {
    /// An empty context.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap an in-memory tree as the context.
    #[must_use]
    pub fn from_snapshot(files: Snapshot) -> Self {
        Self { files }
    }

    /// Load a host directory, skipping entries matched by `.kilnignore`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or the ignore file
    /// holds an invalid pattern.
    pub fn load(dir: &Path) -> KilnResult<Self> {
        if !dir.is_dir() {
            return Err(KilnError::Config {
                message: format!("Build context is not a directory: {}", dir.display()),
            });
        }

        let ignore = load_ignore_patterns(dir)?;
        let all = Snapshot::read_dir(dir, &Snapshot::empty(), ROOT_USER)?;

        let mut builder = Snapshot::empty().edit();
        let mut skipped = 0usize;
        for (path, node) in all.entries() {
            let rel = path.trim_start_matches('/');
            if ignore.iter().any(|p| is_ignored(p, rel)) {
                skipped += 1;
                continue;
            }
            builder.insert(path, node.clone());
        }
        let files = builder.freeze();

        tracing::debug!(
            context = %dir.display(),
            entries = files.len(),
            skipped,
            "Loaded build context"
        );

        Ok(Self { files })
    }

    /// The context as a snapshot rooted at `/`.
    #[must_use]
    pub fn files(&self) -> &Snapshot {
        &self.files
    }

    /// Resolve a source (path or glob pattern) to artifacts.
    ///
    /// `.` selects the whole context. Returns `None` when nothing matches.
    #[must_use]
    pub fn resolve(&self, src: &str) -> Option<Vec<Artifact>> {
        let path = normalize("/", src);
        if let Some(artifact) = self.artifact(&path) {
            return Some(vec![artifact]);
        }

        let pattern = glob::Pattern::new(&path).ok()?;
        let matches: Vec<_> = self
            .files
            .entries()
            .filter(|(p, _)| pattern.matches_with(p, MATCH_OPTIONS))
            .filter_map(|(p, _)| self.artifact(p))
            .collect();

        if matches.is_empty() {
            None
        } else {
            Some(matches)
        }
    }

    fn artifact(&self, path: &str) -> Option<Artifact> {
        let entries = self.files.subtree(path)?;
        Some(Artifact {
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            is_dir: self.files.is_dir(path),
            entries,
        })
    }
}

/// A pattern excludes the entries it matches and everything beneath them.
fn is_ignored(pattern: &glob::Pattern, rel: &str) -> bool {
    let mut prefix = rel;
    loop {
        if pattern.matches_with(prefix, MATCH_OPTIONS) {
            return true;
        }
        match prefix.rsplit_once('/') {
            Some((parent, _)) => prefix = parent,
            None => return false,
        }
    }
}

fn load_ignore_patterns(dir: &Path) -> KilnResult<Vec<glob::Pattern>> {
    let path = dir.join(IGNORE_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }

    fs::read_to_string(&path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            glob::Pattern::new(line.trim_matches('/')).map_err(|e| KilnError::Config {
                message: format!("Invalid pattern '{line}' in {IGNORE_FILE}: {e}"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_dir() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("src")).unwrap();
        fs::create_dir_all(temp.path().join("target/debug")).unwrap();
        fs::write(temp.path().join("Cargo.toml"), "[package]").unwrap();
        fs::write(temp.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(temp.path().join("src/lib.rs"), "").unwrap();
        fs::write(temp.path().join("target/debug/svc"), "stale").unwrap();
        fs::write(temp.path().join(IGNORE_FILE), "# build output\ntarget\n*.log\n").unwrap();
        fs::write(temp.path().join("build.log"), "noise").unwrap();
        temp
    }

    #[test]
    fn load_honours_ignore_file() {
        let temp = context_dir();
        let context = BuildContext::load(temp.path()).unwrap();

        assert!(context.files().exists("/src/main.rs"));
        assert!(!context.files().exists("/target"));
        assert!(!context.files().exists("/target/debug/svc"));
        assert!(!context.files().exists("/build.log"));
    }

    #[test]
    fn ignore_patterns_stay_within_one_directory() {
        let temp = context_dir();
        fs::create_dir_all(temp.path().join("logs/2024")).unwrap();
        fs::create_dir_all(temp.path().join("docs/generated")).unwrap();
        fs::write(temp.path().join("logs/app.log"), "").unwrap();
        fs::write(temp.path().join("logs/2024/old.txt"), "").unwrap();
        fs::write(temp.path().join("docs/generated/api.md"), "").unwrap();
        fs::write(temp.path().join("docs/intro.md"), "").unwrap();
        fs::write(
            temp.path().join(IGNORE_FILE),
            "target\n*.log\nlogs/*\ndocs/*/api.md\n",
        )
        .unwrap();
        let context = BuildContext::load(temp.path()).unwrap();

        assert!(!context.files().exists("/build.log"));
        assert!(!context.files().exists("/logs/app.log"));
        assert!(!context.files().exists("/logs/2024/old.txt"));
        assert!(!context.files().exists("/docs/generated/api.md"));
        assert!(context.files().exists("/docs/intro.md"));
        assert!(context.files().exists("/src/main.rs"));
    }

    #[test]
    fn root_level_pattern_does_not_reach_nested_files() {
        let temp = context_dir();
        fs::create_dir_all(temp.path().join("src/nested")).unwrap();
        fs::write(temp.path().join("src/nested/trace.log"), "").unwrap();
        let context = BuildContext::load(temp.path()).unwrap();

        assert!(!context.files().exists("/build.log"));
        assert!(context.files().exists("/src/nested/trace.log"));
    }

    #[test]
    fn resolve_paths_and_globs() {
        let temp = context_dir();
        let context = BuildContext::load(temp.path()).unwrap();

        let file = context.resolve("Cargo.toml").unwrap();
        assert_eq!(file[0].name, "Cargo.toml");
        assert!(!file[0].is_dir);

        let dir = context.resolve("./src").unwrap();
        assert_eq!(dir[0].name, "src");
        assert!(dir[0].is_dir);
        assert_eq!(dir[0].entries.len(), 2);

        let globbed = context.resolve("src/*.rs").unwrap();
        let names: Vec<_> = globbed.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["lib.rs", "main.rs"]);

        assert!(context.resolve("missing.txt").is_none());
        let everything = context.resolve(".").unwrap();
        assert!(everything[0].is_dir);
        assert!(everything[0].entries.iter().any(|(rel, _)| rel == "src/main.rs"));
    }

    #[test]
    fn glob_star_does_not_cross_directories() {
        let mut files = Snapshot::empty().edit();
        files.write_file("/src/main.rs", "fn main() {}", ROOT_USER);
        files.write_file("/src/nested/deep.rs", "", ROOT_USER);
        files.write_file("/src/nested/more/deeper.rs", "", ROOT_USER);
        let context = BuildContext::from_snapshot(files.freeze());

        let names = |src: &str| -> Vec<String> {
            context
                .resolve(src)
                .unwrap_or_default()
                .into_iter()
                .map(|a| a.name)
                .collect()
        };
        assert_eq!(names("src/*.rs"), vec!["main.rs"]);
        assert_eq!(names("src/*/*.rs"), vec!["deep.rs"]);
        assert!(context.resolve("*.rs").is_none());
    }

    #[test]
    fn load_rejects_missing_directory() {
        let temp = tempfile::tempdir().unwrap();
        assert!(BuildContext::load(&temp.path().join("nope")).is_err());
    }
}

//! Immutable root filesystem snapshots.
//!
//! A [`Snapshot`] is the filesystem state a stage has after one operation.
//! Snapshots are never mutated: an operation calls [`Snapshot::edit`] to get a
//! private [`SnapshotBuilder`], applies its changes and [`freeze`]s the result
//! into a new snapshot. File contents are reference counted [`Bytes`], so the
//! copy is shallow while the two trees stay fully independent.
//!
//! [`freeze`]: SnapshotBuilder::freeze

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use kiln_common::{Digest, KilnResult};
use sha2::{Digest as _, Sha256};

/// Owner of anything the pipeline creates without an explicit owner.
pub const ROOT_USER: &str = "root";

/// Location of the account database inside a snapshot.
pub const PASSWD_PATH: &str = "/etc/passwd";

/// Kind of a filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Directory.
    Dir,
    /// Regular file with its contents.
    File(Bytes),
    /// Symbolic link with its target.
    Symlink(String),
}

/// One filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Entry kind.
    pub kind: NodeKind,
    /// Owning account name.
    pub owner: String,
    /// Permission bits.
    pub mode: u32,
}

impl Node {
    /// A directory with mode 0755.
    pub fn dir(owner: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Dir,
            owner: owner.into(),
            mode: 0o755,
        }
    }

    /// A regular file with mode 0644.
    pub fn file(data: impl Into<Bytes>, owner: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::File(data.into()),
            owner: owner.into(),
            mode: 0o644,
        }
    }

    /// A symbolic link.
    pub fn symlink(target: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Symlink(target.into()),
            owner: owner.into(),
            mode: 0o777,
        }
    }

    /// Replace the permission bits.
    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Whether this entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir)
    }

    /// File contents, if this is a regular file.
    #[must_use]
    pub fn contents(&self) -> Option<&Bytes> {
        match &self.kind {
            NodeKind::File(data) => Some(data),
            _ => None,
        }
    }
}

/// An account line from `/etc/passwd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Login name.
    pub name: String,
    /// User id.
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
    /// Home directory.
    pub home: String,
    /// Login shell.
    pub shell: String,
}

impl Account {
    fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 {
            return None;
        }
        Some(Self {
            name: fields[0].to_string(),
            uid: fields[2].parse().ok()?,
            gid: fields[3].parse().ok()?,
            home: fields[5].to_string(),
            shell: fields[6].to_string(),
        })
    }

    /// Render as a `/etc/passwd` line (without newline).
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "{}:x:{}:{}::{}:{}",
            self.name, self.uid, self.gid, self.home, self.shell
        )
    }
}

/// An immutable root filesystem.
///
/// Paths are absolute and normalized; the root directory is implicit.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    tree: Arc<BTreeMap<String, Node>>,
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree) || self.tree == other.tree
    }
}

impl Eq for Snapshot {}

impl Snapshot {
    /// The empty filesystem (`scratch`).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start a private, mutable copy of this snapshot.
    #[must_use]
    pub fn edit(&self) -> SnapshotBuilder {
        SnapshotBuilder {
            tree: (*self.tree).clone(),
        }
    }

    /// Look up an entry. Relative paths resolve against `/`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Node> {
        self.tree.get(&normalize("/", path))
    }

    /// Whether a path exists. The root always exists.
    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        normalize("/", path) == "/" || self.get(path).is_some()
    }

    /// Whether a path is a directory.
    #[must_use]
    pub fn is_dir(&self, path: &str) -> bool {
        normalize("/", path) == "/" || self.get(path).is_some_and(Node::is_dir)
    }

    /// Contents of a regular file.
    #[must_use]
    pub fn read(&self, path: &str) -> Option<&Bytes> {
        self.get(path).and_then(Node::contents)
    }

    /// Iterate all entries in path order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.tree.iter().map(|(path, node)| (path.as_str(), node))
    }

    /// Number of entries, excluding the implicit root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the snapshot has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Total size of all regular files in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.tree
            .values()
            .filter_map(Node::contents)
            .map(|data| data.len() as u64)
            .sum()
    }

    /// Extract the entries under `path`.
    ///
    /// For a file or symlink the result is a single entry with an empty
    /// relative path. For a directory it holds every descendant, keyed by
    /// its path relative to `path`. Returns `None` if `path` does not exist.
    #[must_use]
    pub fn subtree(&self, path: &str) -> Option<Vec<(String, Node)>> {
        let path = normalize("/", path);
        if path != "/" {
            let node = self.tree.get(&path)?;
            if !node.is_dir() {
                return Some(vec![(String::new(), node.clone())]);
            }
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };

        Some(
            self.tree
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, node)| (key[prefix.len()..].to_string(), node.clone()))
                .collect(),
        )
    }

    /// Accounts declared in `/etc/passwd`.
    #[must_use]
    pub fn accounts(&self) -> Vec<Account> {
        self.read(PASSWD_PATH)
            .map(|data| {
                String::from_utf8_lossy(data)
                    .lines()
                    .filter_map(Account::parse)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look up an account by name.
    #[must_use]
    pub fn account(&self, name: &str) -> Option<Account> {
        self.accounts().into_iter().find(|a| a.name == name)
    }

    /// Content digest over every entry, independent of how the snapshot was produced.
    #[must_use]
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        for (path, node) in self.tree.iter() {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            match &node.kind {
                NodeKind::Dir => hasher.update(b"d"),
                NodeKind::File(data) => {
                    hasher.update(b"f");
                    hasher.update(Sha256::digest(data));
                }
                NodeKind::Symlink(target) => {
                    hasher.update(b"l");
                    hasher.update(target.as_bytes());
                }
            }
            hasher.update(node.owner.as_bytes());
            hasher.update([0]);
            hasher.update(node.mode.to_be_bytes());
        }
        Digest::from_hasher(hasher)
    }

    /// Write the snapshot as an uncompressed tar archive.
    ///
    /// Timestamps are fixed at zero so equal snapshots give equal archives.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_tar<W: Write>(&self, writer: W) -> io::Result<W> {
        let mut builder = tar::Builder::new(writer);
        builder.mode(tar::HeaderMode::Deterministic);

        for (path, node) in self.tree.iter() {
            let mut header = tar::Header::new_gnu();
            header.set_mode(node.mode);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_username(&node.owner)?;
            let rel = path.trim_start_matches('/');

            match &node.kind {
                NodeKind::Dir => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    builder.append_data(&mut header, format!("{rel}/"), io::empty())?;
                }
                NodeKind::File(data) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(data.len() as u64);
                    builder.append_data(&mut header, rel, data.as_ref())?;
                }
                NodeKind::Symlink(target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    builder.append_link(&mut header, rel, target)?;
                }
            }
        }

        builder.into_inner()
    }

    /// Read a snapshot from a tar archive.
    ///
    /// Entry owners come from the archive's user names, defaulting to `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be read.
    pub fn read_tar<R: Read>(reader: R) -> KilnResult<Self> {
        let mut archive = tar::Archive::new(reader);
        let mut builder = Self::empty().edit();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = normalize("/", &entry.path()?.to_string_lossy());
            if path == "/" {
                continue;
            }

            let header = entry.header();
            let owner = header
                .username()
                .ok()
                .flatten()
                .filter(|name| !name.is_empty())
                .unwrap_or(ROOT_USER)
                .to_string();
            let mode = header.mode()? & 0o7777;
            let entry_type = header.entry_type();

            let node = if entry_type.is_dir() {
                Node::dir(owner).with_mode(mode)
            } else if entry_type.is_symlink() {
                let target = entry
                    .link_name()?
                    .map(|t| t.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Node::symlink(target, owner)
            } else if entry_type.is_file() {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                Node::file(data, owner).with_mode(mode)
            } else {
                tracing::debug!(path = %path, "Skipping unsupported tar entry");
                continue;
            };

            builder.insert(&path, node);
        }

        Ok(builder.freeze())
    }

    /// Materialize the snapshot under a host directory.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry cannot be created.
    pub fn write_to_dir(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        for (path, node) in self.tree.iter() {
            let target = dir.join(path.trim_start_matches('/'));
            match &node.kind {
                NodeKind::Dir => fs::create_dir_all(&target)?,
                NodeKind::File(data) => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&target, data)?;
                }
                NodeKind::Symlink(link) => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(link, &target)?;
                    #[cfg(not(unix))]
                    fs::write(&target, link)?;
                }
            }
            #[cfg(unix)]
            if !matches!(node.kind, NodeKind::Symlink(_)) {
                use std::os::unix::fs::PermissionsExt;
                // Keep directories traversable for the re-import walk.
                let mode = if node.is_dir() { node.mode | 0o700 } else { node.mode };
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
            }
        }
        Ok(())
    }

    /// Read a host directory back into a snapshot.
    ///
    /// Entries that already existed in `previous` keep their owner; new
    /// entries are owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be walked.
    pub fn read_dir(dir: &Path, previous: &Snapshot, owner: &str) -> KilnResult<Self> {
        let mut builder = Self::empty().edit();

        for entry in walkdir::WalkDir::new(dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| io::Error::other(e.to_string()))?;
            let path = normalize("/", &rel.to_string_lossy());
            let owner = previous
                .get(&path)
                .map_or_else(|| owner.to_string(), |n| n.owner.clone());
            let meta = entry.path().symlink_metadata()?;

            let node = if meta.file_type().is_symlink() {
                let target = fs::read_link(entry.path())?;
                Node::symlink(target.to_string_lossy().into_owned(), owner)
            } else if meta.is_dir() {
                Node::dir(owner).with_mode(host_mode(&meta, 0o755))
            } else {
                Node::file(fs::read(entry.path())?, owner).with_mode(host_mode(&meta, 0o644))
            };

            builder.insert(&path, node);
        }

        Ok(builder.freeze())
    }
}

#[cfg(unix)]
fn host_mode(meta: &fs::Metadata, _default: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn host_mode(_meta: &fs::Metadata, default: u32) -> u32 {
    default
}

/// A private, mutable copy of a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    tree: BTreeMap<String, Node>,
}

impl SnapshotBuilder {
    /// Look up an entry.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Node> {
        self.tree.get(&normalize("/", path))
    }

    /// Whether a path is a directory.
    #[must_use]
    pub fn is_dir(&self, path: &str) -> bool {
        let path = normalize("/", path);
        path == "/" || self.tree.get(&path).is_some_and(Node::is_dir)
    }

    /// Insert an entry, creating missing parent directories owned by root.
    ///
    /// Any non-directory ancestor is replaced by a directory, and an existing
    /// directory at `path` is replaced along with its contents unless the new
    /// entry is also a directory.
    pub fn insert(&mut self, path: &str, node: Node) {
        let path = normalize("/", path);
        if path == "/" {
            return;
        }

        let segments: Vec<&str> = path[1..].split('/').collect();
        let mut parent = String::new();
        for segment in &segments[..segments.len() - 1] {
            parent.push('/');
            parent.push_str(segment);
            match self.tree.get(&parent) {
                Some(existing) if existing.is_dir() => {}
                _ => {
                    self.tree.insert(parent.clone(), Node::dir(ROOT_USER));
                }
            }
        }

        if !node.is_dir() {
            self.remove_children(&path);
        }
        self.tree.insert(path, node);
    }

    /// Write a regular file.
    pub fn write_file(&mut self, path: &str, data: impl Into<Bytes>, owner: &str) {
        self.insert(path, Node::file(data, owner));
    }

    /// Create a directory and any missing parents.
    pub fn mkdir_all(&mut self, path: &str, owner: &str) {
        if !self.is_dir(path) {
            self.insert(path, Node::dir(owner));
        }
    }

    /// Remove an entry and everything beneath it. Returns whether anything was removed.
    pub fn remove(&mut self, path: &str) -> bool {
        let path = normalize("/", path);
        let removed_children = self.remove_children(&path);
        self.tree.remove(&path).is_some() || removed_children
    }

    /// Append a line to a text file, creating it if needed.
    pub fn append_line(&mut self, path: &str, line: &str) {
        let mut contents = self
            .get(path)
            .and_then(Node::contents)
            .map(|data| data.to_vec())
            .unwrap_or_default();
        if !contents.is_empty() && !contents.ends_with(b"\n") {
            contents.push(b'\n');
        }
        contents.extend_from_slice(line.as_bytes());
        contents.push(b'\n');

        let (owner, mode) = self
            .get(path)
            .map_or((ROOT_USER.to_string(), 0o644), |n| (n.owner.clone(), n.mode));
        self.insert(path, Node::file(contents, owner).with_mode(mode));
    }

    /// Place extracted entries under `dest`, as produced by [`Snapshot::subtree`].
    ///
    /// When `owner` is set every grafted entry is re-owned.
    pub fn graft(&mut self, dest: &str, entries: Vec<(String, Node)>, owner: Option<&str>) {
        let dest = normalize("/", dest);
        for (rel, mut node) in entries {
            if let Some(owner) = owner {
                node.owner = owner.to_string();
            }
            let path = if rel.is_empty() {
                dest.clone()
            } else {
                normalize(&dest, &rel)
            };
            if path == "/" {
                continue;
            }
            self.insert(&path, node);
        }
    }

    /// Finish editing.
    #[must_use]
    pub fn freeze(self) -> Snapshot {
        Snapshot {
            tree: Arc::new(self.tree),
        }
    }

    fn remove_children(&mut self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let doomed: Vec<String> = self
            .tree
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.tree.remove(key);
        }
        !doomed.is_empty()
    }
}

/// Resolve `path` against the absolute directory `base`.
///
/// The result is absolute with `.` and `..` resolved, no empty segments and
/// no trailing slash (except the root itself).
#[must_use]
pub fn normalize(base: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{base}/{path}")
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Snapshot {
        let mut builder = Snapshot::empty().edit();
        builder.write_file("/etc/passwd", "root:x:0:0:root:/root:/bin/sh\n", ROOT_USER);
        builder.write_file("/usr/bin/compile", "#!toolchain", ROOT_USER);
        builder.insert("/usr/bin/cc", Node::symlink("compile", ROOT_USER));
        builder.freeze()
    }

    #[test]
    fn normalize_resolves_relative_paths() {
        assert_eq!(normalize("/src", "app/main.rs"), "/src/app/main.rs");
        assert_eq!(normalize("/src", "../out/./svc"), "/out/svc");
        assert_eq!(normalize("/src", "/abs//path/"), "/abs/path");
        assert_eq!(normalize("/", ".."), "/");
        assert_eq!(normalize("/", "."), "/");
    }

    #[test]
    fn insert_creates_parents() {
        let snapshot = sample();
        assert!(snapshot.is_dir("/usr"));
        assert!(snapshot.is_dir("/usr/bin"));
        assert_eq!(snapshot.get("/usr").unwrap().owner, ROOT_USER);
        assert_eq!(snapshot.read("/usr/bin/compile").unwrap().as_ref(), b"#!toolchain");
    }

    #[test]
    fn edits_never_touch_the_original() {
        let original = sample();
        let mut builder = original.edit();
        builder.remove("/usr");
        builder.write_file("/new", "x", ROOT_USER);
        let edited = builder.freeze();

        assert!(original.exists("/usr/bin/compile"));
        assert!(!original.exists("/new"));
        assert!(!edited.exists("/usr/bin/compile"));
        assert!(edited.exists("/new"));
        assert_ne!(original.digest(), edited.digest());
    }

    #[test]
    fn digest_depends_on_content_only() {
        assert_eq!(sample().digest(), sample().digest());

        let mut builder = sample().edit();
        builder.insert(
            "/usr/bin/compile",
            Node::file("#!toolchain", ROOT_USER).with_mode(0o755),
        );
        assert_ne!(builder.freeze().digest(), sample().digest());
    }

    #[test]
    fn subtree_of_file_and_dir() {
        let snapshot = sample();
        let file = snapshot.subtree("/usr/bin/compile").unwrap();
        assert_eq!(file.len(), 1);
        assert_eq!(file[0].0, "");

        let dir = snapshot.subtree("/usr").unwrap();
        let names: Vec<_> = dir.iter().map(|(rel, _)| rel.as_str()).collect();
        assert_eq!(names, vec!["bin", "bin/cc", "bin/compile"]);

        assert!(snapshot.subtree("/missing").is_none());
    }

    #[test]
    fn file_replaces_directory_contents() {
        let mut builder = sample().edit();
        builder.write_file("/usr", "flat", ROOT_USER);
        let snapshot = builder.freeze();
        assert!(!snapshot.exists("/usr/bin/compile"));
        assert_eq!(snapshot.read("/usr").unwrap().as_ref(), b"flat");
    }

    #[test]
    fn accounts_come_from_passwd() {
        let mut builder = sample().edit();
        builder.append_line(
            PASSWD_PATH,
            &Account {
                name: "svc".into(),
                uid: 1000,
                gid: 1000,
                home: "/home/svc".into(),
                shell: "/usr/sbin/nologin".into(),
            }
            .to_line(),
        );
        let snapshot = builder.freeze();

        let names: Vec<_> = snapshot.accounts().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["root", "svc"]);
        assert_eq!(snapshot.account("svc").unwrap().uid, 1000);
    }

    #[test]
    fn tar_round_trip_preserves_owner_and_mode() {
        let mut builder = sample().edit();
        builder.insert("/home/svc", Node::dir("svc").with_mode(0o700));
        let snapshot = builder.freeze();

        let archive = snapshot.write_tar(Vec::new()).unwrap();
        let restored = Snapshot::read_tar(archive.as_slice()).unwrap();

        assert_eq!(restored, snapshot);
        assert_eq!(restored.get("/home/svc").unwrap().owner, "svc");
        assert_eq!(restored.get("/home/svc").unwrap().mode, 0o700);
    }

    #[test]
    fn tar_output_is_deterministic() {
        let a = sample().write_tar(Vec::new()).unwrap();
        let b = sample().write_tar(Vec::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn host_directory_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let snapshot = sample();
        snapshot.write_to_dir(temp.path()).unwrap();

        std::fs::write(temp.path().join("usr/bin/extra"), b"new").unwrap();
        let restored = Snapshot::read_dir(temp.path(), &snapshot, "svc").unwrap();

        assert_eq!(restored.get("/usr/bin/compile").unwrap().owner, ROOT_USER);
        assert_eq!(restored.get("/usr/bin/extra").unwrap().owner, "svc");
        assert_eq!(
            restored.get("/usr/bin/cc").unwrap().kind,
            NodeKind::Symlink("compile".into())
        );
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(base in "(/[a-z.]{0,4}){0,4}", path in "[a-z./]{0,20}") {
            let base = normalize("/", &base);
            let once = normalize(&base, &path);
            prop_assert!(once.starts_with('/'));
            prop_assert!(!once.contains("//"));
            prop_assert_eq!(normalize("/", &once), once.clone());
        }
    }
}

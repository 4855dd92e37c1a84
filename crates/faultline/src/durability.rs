//! Crash-consistency emulation for one node's data directory.
//!
//! The kernel applies writes and renames immediately, but a real machine
//! that loses power keeps only what was made durable. The tracker mirrors
//! that with versioned backup blobs next to each tracked file:
//!
//! - every path has a current version, bumped by creation, `mknod` and
//!   rename; the persisted version is the one a crash would leave behind,
//!   and its content lives in `<path>.<version>.__bk`;
//! - a rename is recorded as a pending operation on both paths and only
//!   becomes durable when an fsync commits it, in order;
//! - fsync of a file copies its content into the backup of its current
//!   version, or, when that version was produced by a rename that is still
//!   pending, into the backup of the version the rename chain started from;
//! - on a crash pending renames are discarded, and on restart every tracked
//!   path is overwritten with its persisted backup, or removed if there is
//!   none.
//!
//! ```text
//! open(tmp) write fsync(tmp)  rename(tmp,data)   fsync(dir)     crash
//!  tmp.1 ──────────► tmp.1.__bk ─── op 1 pending ──► data.1.__bk ──► data = tmp's content
//!                                       └─ crash before fsync(dir) ──► data = old content
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, trace};

use crate::error::{Error, Result};

pub const BACKUP_SUFFIX: &str = ".__bk";

/// `<path>.<version>.__bk`.
pub fn backup_path(path: &str, version: u32) -> String {
    format!("{path}.{version}{BACKUP_SUFFIX}")
}

/// `<path>.latest.__bk`, the crash-time snapshot kept for inspection.
pub fn latest_path(path: &str) -> String {
    format!("{path}.latest{BACKUP_SUFFIX}")
}

#[derive(Debug, Clone)]
struct RenameOp {
    src: (String, u32),
    dst: (String, u32),
    /// Persisted version of the destination when the rename happened.
    dst_persisted: u32,
}

/// What an intercepted open needs to remember until the syscall returns.
#[derive(Debug)]
pub struct OpenTicket {
    path: String,
    had_backup: bool,
}

impl OpenTicket {
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// File versions, pending renames and descriptor paths of one node.
#[derive(Debug)]
pub struct DurabilityTracker {
    prefix: String,
    fds: BTreeMap<i32, String>,
    versions: BTreeMap<String, u32>,
    persisted: BTreeMap<String, u32>,
    /// Pending op ids touching each path, oldest first.
    pending: BTreeMap<String, VecDeque<u64>>,
    ops: BTreeMap<u64, RenameOp>,
    op_count: u64,
}

impl DurabilityTracker {
    /// Tracks every path that starts with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            fds: BTreeMap::new(),
            versions: BTreeMap::new(),
            persisted: BTreeMap::new(),
            pending: BTreeMap::new(),
            ops: BTreeMap::new(),
            op_count: 0,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn tracks(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    pub fn has_fd(&self, fd: i32) -> bool {
        self.fds.contains_key(&fd)
    }

    pub fn path_of(&self, fd: i32) -> Option<&str> {
        self.fds.get(&fd).map(String::as_str)
    }

    pub fn version(&self, path: &str) -> Option<u32> {
        self.versions.get(path).copied()
    }

    pub fn persisted_version(&self, path: &str) -> Option<u32> {
        self.persisted.get(path).copied()
    }

    pub fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    /// Called at open entry. Returns `None` for paths outside the prefix.
    pub fn prepare_open(&mut self, path: &str) -> Result<Option<OpenTicket>> {
        if !self.tracks(path) {
            return Ok(None);
        }
        let path = normalize(path);
        self.snapshot_baseline(&path)?;
        let had_backup = match self.versions.get(&path) {
            Some(&version) => exists(&backup_path(&path, version))?,
            None => false,
        };
        Ok(Some(OpenTicket { path, had_backup }))
    }

    /// Called once the open returned `fd`.
    pub fn finish_open(&mut self, ticket: OpenTicket, fd: i32) -> Result<()> {
        let OpenTicket { path, had_backup } = ticket;
        trace!(fd, path, "tracking descriptor");
        self.fds.insert(fd, path.clone());
        if is_regular(&path)? {
            self.persisted.entry(path.clone()).or_insert(0);
            let version = self.versions.entry(path).or_insert(0);
            if !had_backup {
                *version += 1;
            }
        }
        Ok(())
    }

    /// Called after a successful `mknod`.
    pub fn mknod(&mut self, path: &str) {
        if !self.tracks(path) {
            return;
        }
        let path = normalize(path);
        self.persisted.entry(path.clone()).or_insert(0);
        *self.versions.entry(path).or_insert(0) += 1;
    }

    /// Called at rename entry, before either path changes on disk.
    pub fn prepare_rename(&mut self, src: &str, dst: &str) -> Result<()> {
        self.snapshot_baseline(&normalize(src))?;
        self.snapshot_baseline(&normalize(dst))
    }

    /// Records a successful `rename(src, dst)` as a pending operation.
    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let (src, dst) = (normalize(src), normalize(dst));
        if src == dst {
            return Ok(());
        }
        let metadata = fs::metadata(&dst).map_err(|e| Error::io(&dst, e))?;
        if !metadata.is_file() {
            return Err(Error::Internal(format!(
                "rename of non-regular file {dst} is not supported"
            )));
        }

        self.op_count += 1;
        let id = self.op_count;
        let dst_version = {
            let version = self.versions.entry(dst.clone()).or_insert(0);
            *version += 1;
            *version
        };
        let src_version = *self.versions.entry(src.clone()).or_insert(0);
        let dst_persisted = *self.persisted.entry(dst.clone()).or_insert(0);
        self.persisted.entry(src.clone()).or_insert(0);

        debug!(
            op = id,
            src = %src,
            src_version,
            dst = %dst,
            dst_version,
            "rename pending"
        );
        self.ops.insert(
            id,
            RenameOp {
                src: (src.clone(), src_version),
                dst: (dst.clone(), dst_version),
                dst_persisted,
            },
        );
        self.pending.entry(dst.clone()).or_default().push_back(id);
        self.pending.entry(src.clone()).or_default().push_back(id);

        for path in self.fds.values_mut() {
            if *path == src {
                path.clone_from(&dst);
            }
        }
        *self.versions.entry(src).or_insert(0) += 1;
        Ok(())
    }

    pub fn close(&mut self, fd: i32) {
        self.fds.remove(&fd);
    }

    /// Commits the `count` oldest pending renames.
    pub fn commit(&mut self, count: usize) -> Result<()> {
        for _ in 0..count.min(self.ops.len()) {
            self.perform_next_op()?;
        }
        Ok(())
    }

    pub fn commit_all(&mut self) -> Result<()> {
        self.commit(self.ops.len())
    }

    fn perform_next_op(&mut self) -> Result<()> {
        let Some((id, op)) = self.ops.pop_first() else {
            return Err(Error::Internal("no pending rename to commit".to_string()));
        };
        let src_backup = backup_path(&op.src.0, op.src.1);
        let dst_backup = backup_path(&op.dst.0, op.dst.1);
        debug!(op = id, src = %src_backup, dst = %dst_backup, "committing rename");
        if exists(&src_backup)? {
            fs::rename(&src_backup, &dst_backup).map_err(|e| Error::io(&src_backup, e))?;
        } else {
            fs::File::create(&dst_backup).map_err(|e| Error::io(&dst_backup, e))?;
        }

        for path in [&op.dst.0, &op.src.0] {
            let queue = self.pending.get_mut(path);
            let front = queue.and_then(VecDeque::pop_front);
            if front != Some(id) {
                return Err(Error::Internal(format!(
                    "pending rename {id} is not the oldest for {path} (found {front:?})"
                )));
            }
            if self.pending.get(path).is_some_and(VecDeque::is_empty) {
                self.pending.remove(path);
            }
        }

        let src_persisted = self.persisted.entry(op.src.0).or_insert(0);
        *src_persisted = (*src_persisted).max(op.src.1 + 1);
        let dst_persisted = self.persisted.entry(op.dst.0).or_insert(0);
        *dst_persisted = (*dst_persisted).max(op.dst.1);
        Ok(())
    }

    /// Makes whatever `fd` refers to durable. Descriptors outside the
    /// prefix are ignored.
    pub fn persist_fd(&mut self, fd: i32) -> Result<()> {
        let Some(path) = self.fds.get(&fd).cloned() else {
            trace!(fd, "fsync on untracked descriptor");
            return Ok(());
        };
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io(&path, e)),
        };
        if metadata.is_dir() {
            self.persist_dir(&path)
        } else if metadata.is_file() {
            self.persist_file(&path)
        } else {
            Err(Error::Internal(format!("cannot persist {path}: not a file or directory")))
        }
    }

    /// Commits every pending rename up to the newest one that touches a
    /// direct child of `dir`.
    fn persist_dir(&mut self, dir: &str) -> Result<()> {
        let last = self
            .pending
            .iter()
            .filter(|(path, _)| is_direct_child(dir, path))
            .filter_map(|(_, ids)| ids.back().copied())
            .max();
        debug!(dir, ?last, "directory fsync");
        if let Some(last) = last {
            while self.ops.first_key_value().is_some_and(|(&id, _)| id <= last) {
                self.perform_next_op()?;
            }
        }
        Ok(())
    }

    fn persist_file(&mut self, path: &str) -> Result<()> {
        let current = *self.versions.entry(path.to_string()).or_insert(0);
        self.persisted.insert(path.to_string(), current);
        let own = backup_path(path, current);
        let target = if exists(&own)? {
            own
        } else {
            // Until the renames that produced this version commit, its
            // content belongs to the version the chain started from.
            let (root, root_version) = self.find_root(path, current);
            if root != path {
                // A crash discards the renames, leaving the content at the root.
                let persisted = self.persisted.entry(root.clone()).or_insert(0);
                *persisted = (*persisted).max(root_version);
            }
            backup_path(&root, root_version)
        };
        debug!(path, version = current, backup = %target, "file fsync");
        copy(path, &target)
    }

    /// Follows pending renames backwards from `(path, version)` to the
    /// version that was renamed into it.
    ///
    /// Ops are walked newest first and matched on the exact version, so when
    /// several pending renames target the same path only the one that
    /// produced `version` is followed; older renames into that path produced
    /// older versions and are skipped.
    fn find_root(&self, path: &str, version: u32) -> (String, u32) {
        let mut root = (path.to_string(), version);
        for op in self.ops.values().rev() {
            if op.dst == root {
                root.clone_from(&op.src);
            }
        }
        root
    }

    /// Forgets everything a crash loses. Call after the process is dead.
    pub fn crash(&mut self) -> Result<()> {
        for path in self.versions.keys() {
            if exists(path)? {
                copy(path, &latest_path(path))?;
            }
        }
        while let Some((id, op)) = self.ops.pop_last() {
            let (dst, dst_version) = &op.dst;
            let rollback = self.rollback_version(dst, *dst_version, op.dst_persisted)?;
            if let Some(persisted) = self.persisted.get_mut(dst)
                && *persisted >= *dst_version
            {
                debug!(op = id, dst = %dst, from = *persisted, to = rollback, "rename discarded");
                *persisted = rollback;
            }
        }
        self.pending.clear();
        self.fds.clear();
        self.op_count = 0;
        Ok(())
    }

    /// Newest version of `path` below `below` with a backup on disk, no
    /// older than the version that was persisted when the rename happened.
    fn rollback_version(&self, path: &str, below: u32, floor: u32) -> Result<u32> {
        for version in (floor..below).rev() {
            if exists(&backup_path(path, version))? {
                return Ok(version);
            }
        }
        Ok(floor)
    }

    /// Puts every tracked path back to its persisted content.
    pub fn restore(&self) -> Result<()> {
        for path in self.versions.keys() {
            let persisted = self.persisted.get(path).copied().unwrap_or(0);
            let backup = backup_path(path, persisted);
            if exists(&backup)? {
                debug!(path, version = persisted, "restoring");
                copy(&backup, path)?;
            } else {
                debug!(path, version = persisted, "no durable copy, removing");
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io(path, e)),
                }
            }
        }
        Ok(())
    }

    /// Registers a file that existed before the node first touched it,
    /// keeping its content as version 0.
    fn snapshot_baseline(&mut self, path: &str) -> Result<()> {
        if !self.tracks(path) || self.versions.contains_key(path) || !is_regular(path)? {
            return Ok(());
        }
        trace!(path, "baseline snapshot");
        copy(path, &backup_path(path, 0))?;
        self.versions.insert(path.to_string(), 0);
        self.persisted.insert(path.to_string(), 0);
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    path.strip_suffix('/').unwrap_or(path).to_string()
}

fn is_direct_child(dir: &str, path: &str) -> bool {
    path.strip_prefix(dir)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|name| !name.is_empty() && !name.contains('/'))
}

fn exists(path: &str) -> Result<bool> {
    Path::new(path).try_exists().map_err(|e| Error::io(path, e))
}

fn is_regular(path: &str) -> Result<bool> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn copy(from: &str, to: &str) -> Result<()> {
    fs::copy(from, to).map(drop).map_err(|e| Error::io(from, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    struct Node {
        _dir: TempDir,
        root: String,
        tracker: DurabilityTracker,
    }

    impl Node {
        fn new() -> Self {
            let dir = tempdir().expect("Failed to create temp dir");
            let root = dir.path().to_string_lossy().into_owned();
            let tracker = DurabilityTracker::new(root.clone());
            Self {
                _dir: dir,
                root,
                tracker,
            }
        }

        fn path(&self, name: &str) -> String {
            format!("{}/{name}", self.root)
        }

        /// Opens (creating if needed) the way the node virtualizer would.
        fn open(&mut self, name: &str, fd: i32) {
            let path = self.path(name);
            let ticket = self.tracker.prepare_open(&path).unwrap().unwrap();
            if !Path::new(&path).exists() {
                fs::write(&path, b"").unwrap();
            }
            self.tracker.finish_open(ticket, fd).unwrap();
        }

        fn open_dir(&mut self, fd: i32) {
            let root = self.root.clone();
            let ticket = self.tracker.prepare_open(&root).unwrap().unwrap();
            self.tracker.finish_open(ticket, fd).unwrap();
        }

        fn write(&self, name: &str, content: &str) {
            fs::write(self.path(name), content).unwrap();
        }

        fn rename(&mut self, from: &str, to: &str) {
            let (src, dst) = (self.path(from), self.path(to));
            self.tracker.prepare_rename(&src, &dst).unwrap();
            fs::rename(&src, &dst).unwrap();
            self.tracker.rename(&src, &dst).unwrap();
        }

        fn crash_and_restart(&mut self) {
            self.tracker.crash().unwrap();
            self.tracker.restore().unwrap();
        }

        fn read(&self, name: &str) -> Option<String> {
            fs::read_to_string(self.path(name)).ok()
        }
    }

    #[test]
    fn crash_restores_last_fsynced_content() {
        let mut node = Node::new();
        node.open("log", 3);
        node.write("log", "v1");
        node.tracker.persist_fd(3).unwrap();
        node.write("log", "v1v2");

        node.crash_and_restart();

        assert_eq!(node.read("log").as_deref(), Some("v1"));
        let latest = fs::read_to_string(latest_path(&node.path("log"))).unwrap();
        assert_eq!(latest, "v1v2");
    }

    #[test]
    fn never_fsynced_file_disappears() {
        let mut node = Node::new();
        node.open("scratch", 3);
        node.write("scratch", "lost");

        node.crash_and_restart();

        assert_eq!(node.read("scratch"), None);
    }

    #[test]
    fn preexisting_file_keeps_its_original_content() {
        let mut node = Node::new();
        node.write("state", "orig");
        node.open("state", 3);
        assert_eq!(node.tracker.version(&node.path("state")), Some(0));
        node.write("state", "unsynced");

        node.crash_and_restart();

        assert_eq!(node.read("state").as_deref(), Some("orig"));
    }

    #[test]
    fn rename_without_directory_fsync_is_rolled_back() {
        let mut node = Node::new();
        node.write("data", "orig");
        node.open("tmp", 3);
        node.write("tmp", "new");
        node.tracker.persist_fd(3).unwrap();
        node.rename("tmp", "data");
        assert_eq!(node.tracker.pending_ops(), 1);

        node.crash_and_restart();

        assert_eq!(node.read("data").as_deref(), Some("orig"));
        assert_eq!(node.read("tmp").as_deref(), Some("new"));
        assert_eq!(node.tracker.pending_ops(), 0);
    }

    #[test]
    fn directory_fsync_commits_rename() {
        let mut node = Node::new();
        node.write("data", "orig");
        node.open("tmp", 3);
        node.write("tmp", "new");
        node.tracker.persist_fd(3).unwrap();
        node.rename("tmp", "data");
        node.open_dir(4);
        node.tracker.persist_fd(4).unwrap();
        assert_eq!(node.tracker.pending_ops(), 0);

        node.crash_and_restart();

        assert_eq!(node.read("data").as_deref(), Some("new"));
        assert_eq!(node.read("tmp"), None);
    }

    #[test]
    fn fsync_through_renamed_descriptor_lands_at_root() {
        let mut node = Node::new();
        node.open("tmp", 3);
        node.write("tmp", "a");
        node.rename("tmp", "data");
        assert_eq!(node.tracker.path_of(3), Some(node.path("data").as_str()));
        node.write("data", "ab");
        node.tracker.persist_fd(3).unwrap();

        let root_backup = backup_path(&node.path("tmp"), 1);
        assert_eq!(fs::read_to_string(&root_backup).unwrap(), "ab");

        node.tracker.commit_all().unwrap();
        node.crash_and_restart();
        assert_eq!(node.read("data").as_deref(), Some("ab"));
    }

    #[test]
    fn fsync_through_renamed_descriptor_survives_crash_before_commit() {
        let mut node = Node::new();
        node.open("tmp", 3);
        node.write("tmp", "a");
        node.rename("tmp", "data");
        node.write("data", "ab");
        node.tracker.persist_fd(3).unwrap();
        assert_eq!(node.tracker.persisted_version(&node.path("tmp")), Some(1));

        node.crash_and_restart();

        // the rename never became durable, the fsynced bytes did
        assert_eq!(node.read("tmp").as_deref(), Some("ab"));
        assert_eq!(node.read("data"), None);
    }

    fn two_renames_into_one_destination() -> Node {
        let mut node = Node::new();
        node.write("d", "orig");
        node.open("a", 3);
        node.write("a", "A");
        node.tracker.persist_fd(3).unwrap();
        node.open("b", 4);
        node.write("b", "B");
        node.tracker.persist_fd(4).unwrap();
        node.rename("a", "d");
        node.rename("b", "d");
        assert_eq!(node.tracker.pending_ops(), 2);
        node
    }

    #[test]
    fn uncommitted_renames_into_one_destination_all_roll_back() {
        let mut node = two_renames_into_one_destination();
        // a file fsync does not commit renames
        node.tracker.persist_fd(4).unwrap();
        assert_eq!(node.tracker.pending_ops(), 2);
        let b_root = backup_path(&node.path("b"), 1);
        assert_eq!(fs::read_to_string(b_root).unwrap(), "B");

        node.crash_and_restart();

        assert_eq!(node.read("d").as_deref(), Some("orig"));
        assert_eq!(node.read("a").as_deref(), Some("A"));
        assert_eq!(node.read("b").as_deref(), Some("B"));
    }

    #[test]
    fn committed_renames_into_one_destination_apply_in_order() {
        let mut node = two_renames_into_one_destination();
        node.open_dir(5);
        node.tracker.persist_fd(5).unwrap();
        assert_eq!(node.tracker.pending_ops(), 0);

        node.crash_and_restart();

        assert_eq!(node.read("d").as_deref(), Some("B"));
        assert_eq!(node.read("a"), None);
        assert_eq!(node.read("b"), None);
    }

    #[test]
    fn partially_committed_renames_keep_the_older_one() {
        let mut node = two_renames_into_one_destination();
        node.tracker.commit(1).unwrap();

        node.crash_and_restart();

        assert_eq!(node.read("d").as_deref(), Some("A"));
        assert_eq!(node.read("a"), None);
        assert_eq!(node.read("b").as_deref(), Some("B"));
    }

    #[test]
    fn discarded_rename_rolls_back_to_existing_backup() {
        let mut node = Node::new();
        node.open("data", 3);
        node.write("data", "durable");
        node.tracker.persist_fd(3).unwrap();
        // recreated without fsync: version 2 has no backup
        let data = node.path("data");
        node.tracker.mknod(&data);
        node.open("tmp", 4);
        node.write("tmp", "next");
        node.rename("tmp", "data");
        node.tracker.persist_fd(4).unwrap();

        node.crash_and_restart();

        assert_eq!(node.read("data").as_deref(), Some("durable"));
    }

    #[test]
    fn directory_fsync_ignores_nested_paths() {
        let mut node = Node::new();
        fs::create_dir(node.path("sub")).unwrap();
        node.open("sub/x", 3);
        node.open("a", 4);
        node.rename("sub/x", "sub/y");
        node.rename("a", "b");
        assert_eq!(node.tracker.pending_ops(), 2);

        // the newest op touching a direct child is op 2, so both commit
        node.open_dir(5);
        node.tracker.persist_fd(5).unwrap();
        assert_eq!(node.tracker.pending_ops(), 0);

        node.rename("sub/y", "sub/z");
        node.tracker.persist_fd(5).unwrap();
        assert_eq!(node.tracker.pending_ops(), 1);
    }

    #[test]
    fn untracked_paths_are_ignored() {
        let mut node = Node::new();
        assert!(node.tracker.prepare_open("/etc/hosts").unwrap().is_none());
        node.tracker.persist_fd(42).unwrap();
        node.tracker.mknod("/dev/null");
        assert_eq!(node.tracker.version("/dev/null"), None);
    }

    #[test]
    fn renaming_a_directory_is_rejected() {
        let mut node = Node::new();
        fs::create_dir(node.path("d1")).unwrap();
        fs::rename(node.path("d1"), node.path("d2")).unwrap();
        let err = node
            .tracker
            .rename(&node.path("d1"), &node.path("d2"))
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn direct_child_detection() {
        assert!(is_direct_child("/d", "/d/a"));
        assert!(!is_direct_child("/d", "/d/a/b"));
        assert!(!is_direct_child("/d", "/da"));
        assert!(!is_direct_child("/d", "/d"));
    }
}

//! Materialize a snapshot back into a directory tree.
//!
//! Files are rebuilt chunk by chunk in listed order; directories get
//! their metadata applied after their contents so restored mtimes
//! survive the writes underneath them.

use std::fs::File;
use std::io::Write;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::error;
use crate::hashing::ObjectId;
use crate::pack::BlobType;
use crate::progress::RestoreStatistics;
use crate::repository::Repository;
use crate::snapshot::Snapshot;
use crate::tree::{self, Node, NodeKind};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorDecision {
    Abort,
    Skip,
}

type SelectFn<'a> = dyn Fn(&Utf8Path, &Utf8Path, &Node) -> bool + Sync + 'a;
type ErrorFn<'a> = dyn Fn(&Utf8Path, &anyhow::Error) -> ErrorDecision + Sync + 'a;

pub struct Restorer<'a> {
    repo: &'a Repository,
    select: Box<SelectFn<'a>>,
    on_error: Box<ErrorFn<'a>>,
    pub stats: RestoreStatistics,
}

impl<'a> Restorer<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            select: Box::new(|_path, _dst, _node| true),
            on_error: Box::new(|_path, _err| ErrorDecision::Abort),
            stats: RestoreStatistics::default(),
        }
    }

    /// Decides per-node whether to materialize it. Defaults to everything.
    pub fn select<F>(mut self, f: F) -> Self
    where
        F: Fn(&Utf8Path, &Utf8Path, &Node) -> bool + Sync + 'a,
    {
        self.select = Box::new(f);
        self
    }

    /// Decides whether a failed entry aborts the restore or is skipped.
    /// Crypto failures always abort.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Utf8Path, &anyhow::Error) -> ErrorDecision + Sync + 'a,
    {
        self.on_error = Box::new(f);
        self
    }

    /// Restores the whole snapshot into `target`,
    /// which is created if needed.
    pub fn restore(&self, snapshot: &Snapshot, target: &Utf8Path) -> Result<()> {
        info!("Restoring snapshot of {:?} to {target}", snapshot.paths);
        std::fs::create_dir_all(target)
            .with_context(|| format!("Couldn't create {target}"))?;
        self.restore_tree(&snapshot.tree, Utf8Path::new(""), target)
    }

    fn restore_tree(&self, tree_id: &ObjectId, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        let tree = tree::load(self.repo, tree_id)?;
        for node in &tree.nodes {
            let path = from.join(&node.name);
            let dst = to.join(&node.name);
            if !(self.select)(&path, &dst, node) {
                trace!("{path} not selected");
                continue;
            }
            match self.restore_node(node, &path, &dst) {
                Ok(()) => {}
                Err(e) if error::is_crypto_failure(&e) => return Err(e),
                Err(e) => match (self.on_error)(&path, &e) {
                    ErrorDecision::Skip => warn!("Skipping {path}: {e:#}"),
                    ErrorDecision::Abort => {
                        return Err(e.context(format!("Couldn't restore {path}")));
                    }
                },
            }
        }
        Ok(())
    }

    fn restore_node(&self, node: &Node, path: &Utf8Path, dst: &Utf8Path) -> Result<()> {
        node.validate()?;
        match node.kind {
            NodeKind::Dir => {
                match std::fs::create_dir(dst) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e).with_context(|| format!("Couldn't create {dst}")),
                }
                self.restore_tree(node.subtree.as_ref().unwrap(), path, dst)?;
                self.stats.directories.fetch_add(1, Ordering::Relaxed);
                // Metadata last, or writing children would bump mtime.
                self.apply_metadata(node, dst)
            }
            NodeKind::File => {
                self.restore_file(node, dst)?;
                self.stats.files.fetch_add(1, Ordering::Relaxed);
                self.apply_metadata(node, dst)
            }
            NodeKind::Symlink => {
                let target = node
                    .linktarget
                    .as_ref()
                    .with_context(|| format!("Symlink {path} has no target"))?;
                make_symlink(target, dst)?;
                self.stats.symlinks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            other => {
                // Sockets, devices, FIFOs: not ours to recreate.
                debug!("Not restoring {other:?} {path}");
                Ok(())
            }
        }
    }

    fn restore_file(&self, node: &Node, dst: &Utf8Path) -> Result<()> {
        let mut fh = File::create(dst).with_context(|| format!("Couldn't create {dst}"))?;
        let mut written = 0u64;
        for chunk_id in node.content.as_ref().unwrap() {
            let bytes = self.repo.load_blob(BlobType::Data, chunk_id)?;
            fh.write_all(&bytes)
                .with_context(|| format!("Couldn't write {dst}"))?;
            written += bytes.len() as u64;
        }
        if let Some(size) = node.size {
            ensure!(
                written == size,
                "{dst}: wrote {written} bytes, expected {size}"
            );
        }
        self.stats.bytes_written.fetch_add(written, Ordering::Relaxed);
        Ok(())
    }

    #[cfg(unix)]
    fn apply_metadata(&self, node: &Node, dst: &Utf8Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(dst, std::fs::Permissions::from_mode(node.mode & 0o7777))
            .with_context(|| format!("Couldn't set permissions on {dst}"))?;

        let times = rustix::fs::Timestamps {
            last_access: timespec(&node.atime),
            last_modification: timespec(&node.mtime),
        };
        rustix::fs::utimensat(
            rustix::fs::CWD,
            dst.as_std_path(),
            &times,
            rustix::fs::AtFlags::SYMLINK_NOFOLLOW,
        )
        .with_context(|| format!("Couldn't set times on {dst}"))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn apply_metadata(&self, _node: &Node, _dst: &Utf8Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn timespec(ts: &jiff::Timestamp) -> rustix::fs::Timespec {
    rustix::fs::Timespec {
        tv_sec: ts.as_second(),
        tv_nsec: ts.subsec_nanosecond() as _,
    }
}

#[cfg(unix)]
fn make_symlink(target: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dst)
        .with_context(|| format!("Couldn't link {dst} -> {target}"))
}

#[cfg(not(unix))]
fn make_symlink(target: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    anyhow::bail!("Can't restore symlink {dst} -> {target} on this platform")
}

//! Turn directory trees into snapshots.
//!
//! Files are chunked and saved as Data blobs, directories become Trees
//! bottom-up, and the root tree ID goes into a new snapshot. Anything
//! whose blobs are already in the master index is reused without
//! uploading a byte - that's the whole point.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::*;

use crate::chunker::Chunker;
use crate::error;
use crate::file_util;
use crate::hashing::ObjectId;
use crate::pack::BlobType;
use crate::progress::BackupStatistics;
use crate::repository::Repository;
use crate::snapshot::{self, Snapshot};
use crate::tree::{self, Node, NodeKind, Tree};

/// What to do about a file we couldn't read.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorDecision {
    Abort,
    Skip,
}

type FilterFn<'a> = dyn Fn(&Utf8Path, &Node) -> bool + Sync + 'a;
type ErrorFn<'a> = dyn Fn(&Utf8Path, &anyhow::Error) -> ErrorDecision + Sync + 'a;

pub struct Archiver<'a> {
    repo: &'a Repository,
    filter: Box<FilterFn<'a>>,
    on_error: Box<ErrorFn<'a>>,
    tags: Vec<String>,
    pub stats: BackupStatistics,
}

impl<'a> Archiver<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            filter: Box::new(|_path, _node| true),
            on_error: Box::new(|_path, _err| ErrorDecision::Abort),
            tags: Vec::new(),
            stats: BackupStatistics::default(),
        }
    }

    /// Decides per-entry whether to include it. Defaults to everything.
    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Utf8Path, &Node) -> bool + Sync + 'a,
    {
        self.filter = Box::new(f);
        self
    }

    /// Decides whether a file-level error aborts the backup or just
    /// skips the entry. Crypto failures are never offered here; they
    /// always abort.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Utf8Path, &anyhow::Error) -> ErrorDecision + Sync + 'a,
    {
        self.on_error = Box::new(f);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Archives the given paths and writes a snapshot referencing them.
    ///
    /// A single directory archives as its *contents* (its entries form
    /// the root tree); several paths become one root node each.
    pub fn snapshot(&self, paths: &[Utf8PathBuf]) -> Result<(ObjectId, Snapshot)> {
        ensure!(!paths.is_empty(), "Nothing to back up");
        let mut paths: Vec<Utf8PathBuf> = paths.to_vec();
        paths.sort();
        paths.dedup();

        info!("Backing up {paths:?}");
        let root = match &paths[..] {
            [single] if single.is_dir() => self.save_dir_contents(single)?,
            many => {
                let mut nodes = Vec::new();
                for path in many {
                    match self.save_one_path(path)? {
                        Some(node) => nodes.push(node),
                        None => debug!("{path} filtered out"),
                    }
                }
                tree::save(self.repo, &Tree { nodes })?
            }
        };

        // Everything the snapshot references has to be uploaded and
        // indexed before the snapshot exists, or it's dangling.
        self.repo.flush()?;

        let parent = snapshot::latest_of_paths(self.repo, &paths)?;
        let mut snap = Snapshot::of(root, paths, parent);
        snap.tags = self.tags.clone();
        let id = snapshot::save(self.repo, &snap)?;
        Ok((id, snap))
    }

    /// Builds and saves a node for one filesystem entry,
    /// or `None` if it was filtered out or skipped after an error.
    fn save_one_path(&self, path: &Utf8Path) -> Result<Option<Node>> {
        let mut node = match tree::node_from_path(path) {
            Ok(node) => node,
            Err(e) => return self.skip_or_abort(path, e),
        };
        if !(self.filter)(path, &node) {
            return Ok(None);
        }

        match node.kind {
            NodeKind::File => match self.chunk_and_save(path) {
                Ok(chunks) => node.content = Some(chunks),
                Err(e) if error::is_crypto_failure(&e) => return Err(e),
                Err(e) => return self.skip_or_abort(path, e),
            },
            NodeKind::Dir => {
                node.subtree = Some(self.save_dir_contents(path)?);
            }
            // Symlinks carry their target, the rest are metadata-only.
            _ => {}
        }
        Ok(Some(node))
    }

    /// Recursively archives a directory's entries and saves their tree,
    /// returning its ID.
    fn save_dir_contents(&self, dir: &Utf8Path) -> Result<ObjectId> {
        // Sort by name so the same directory always hashes the same.
        let mut entries = BTreeMap::new();
        let listing = std::fs::read_dir(dir).with_context(|| format!("Couldn't list {dir}"));
        match listing {
            Ok(listing) => {
                for entry in listing {
                    let entry = entry.with_context(|| format!("Failed iterating {dir}"))?;
                    let path = Utf8PathBuf::from_path_buf(entry.path())
                        .map_err(|p| anyhow::anyhow!("{} isn't UTF-8", p.display()))?;
                    let name = path
                        .file_name()
                        .expect("read_dir entry without a file name")
                        .to_owned();
                    entries.insert(name, path);
                }
            }
            Err(e) => {
                // An unreadable directory either aborts the backup or
                // archives as empty.
                self.skip_or_abort::<()>(dir, e)?;
                return tree::save(self.repo, &Tree::default());
            }
        }

        let mut nodes = Vec::new();
        for path in entries.values() {
            match self.save_one_path(path)? {
                Some(node) => nodes.push(node),
                None => trace!("{path} filtered out"),
            }
        }

        self.stats.directories.fetch_add(1, Ordering::Relaxed);
        let tree = Tree { nodes };
        let id = tree::save(self.repo, &tree)?;
        self.stats
            .tree_bytes
            .fetch_add(serde_json::to_vec(&tree)?.len() as u64, Ordering::Relaxed);
        Ok(id)
    }

    /// Chunks one file and saves every chunk, reusing whatever the
    /// index already has.
    fn chunk_and_save(&self, path: &Utf8Path) -> Result<Vec<ObjectId>> {
        let file = file_util::read_file(path.as_std_path())
            .with_context(|| format!("Couldn't read {path}"))?;

        let mut chunker = Chunker::new(Cursor::new(file.bytes()), self.repo.polynomial());
        let mut ids = Vec::new();
        while let Some(chunk) = chunker.next()? {
            let (id, new) = self.repo.save_blob(BlobType::Data, &chunk.data, None)?;
            let counter = if new {
                &self.stats.chunk_bytes
            } else {
                &self.stats.reused_bytes
            };
            counter.fetch_add(chunk.length as u64, Ordering::Relaxed);
            ids.push(id);
        }
        self.stats.files.fetch_add(1, Ordering::Relaxed);
        trace!("{path}: {} chunks", ids.len());
        Ok(ids)
    }

    fn skip_or_abort<T>(&self, path: &Utf8Path, err: anyhow::Error) -> Result<Option<T>> {
        match (self.on_error)(path, &err) {
            ErrorDecision::Skip => {
                warn!("Skipping {path}: {err:#}");
                Ok(None)
            }
            ErrorDecision::Abort => Err(err.context(format!("Couldn't back up {path}"))),
        }
    }
}

//! Snapshots: one point-in-time reference to a root tree,
//! plus enough metadata to know who took it and of what.
//!
//! Unlike blobs, snapshots live as standalone encrypted objects so
//! they can be listed and loaded without touching any index.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::backend::{Backend, FileType};
use crate::hashing::{self, ObjectId};
use crate::ident;
use crate::repository::Repository;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: jiff::Timestamp,
    /// The previous snapshot of these paths, if any. A weak reference:
    /// pruning the parent doesn't invalidate this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ObjectId>,
    /// The root of everything this snapshot holds.
    pub tree: ObjectId,
    pub paths: Vec<Utf8PathBuf>,
    pub hostname: String,
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Snapshot {
    /// A snapshot of the given tree taken right now, by us.
    pub fn of(tree: ObjectId, paths: Vec<Utf8PathBuf>, parent: Option<ObjectId>) -> Self {
        let (uid, gid) = ident::uid_gid();
        Self {
            time: jiff::Timestamp::now(),
            parent,
            tree,
            paths,
            hostname: ident::hostname(),
            username: ident::username(),
            uid,
            gid,
            excludes: Vec::new(),
            tags: Vec::new(),
        }
    }
}

/// Stores the snapshot; its name is the SHA256 of its JSON.
pub fn save(repo: &Repository, snapshot: &Snapshot) -> Result<ObjectId> {
    let id = repo.save_unpacked(FileType::Snapshot, snapshot)?;
    info!("Wrote snapshot {}", id.short_name());
    Ok(id)
}

pub fn load(repo: &Repository, id: &ObjectId) -> Result<Snapshot> {
    repo.load_unpacked(FileType::Snapshot, id)
        .with_context(|| format!("Couldn't load snapshot {id}"))
}

/// Load all snapshots and sort them by time taken.
pub fn load_chronologically(repo: &Repository) -> Result<Vec<(Snapshot, ObjectId)>> {
    debug!("Reading snapshots");
    let mut snapshots = repo
        .backend()
        .list(FileType::Snapshot)?
        .iter()
        .map(|name| {
            let id: ObjectId = name.parse()?;
            Ok((load(repo, &id)?, id))
        })
        .collect::<Result<Vec<_>>>()?;
    snapshots.sort_by_key(|(snap, _)| snap.time);
    Ok(snapshots)
}

/// The most recent snapshot covering the given paths, for `parent`.
pub fn latest_of_paths(repo: &Repository, paths: &[Utf8PathBuf]) -> Result<Option<ObjectId>> {
    Ok(load_chronologically(repo)?
        .into_iter()
        .rev()
        .find(|(snap, _)| snap.paths == paths)
        .map(|(_, id)| id))
}

/// Resolves a hex prefix to the unique snapshot it names.
pub fn find(backend: &dyn Backend, prefix: &str) -> Result<ObjectId> {
    let names = backend.list(FileType::Snapshot)?;
    hashing::resolve_prefix(prefix, &names)
        .with_context(|| format!("Couldn't find snapshot {prefix}"))
}

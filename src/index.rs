//! Build, read, and write indexes: which pack holds which blob, where.
//!
//! Several index objects can coexist in a repository; the in-memory
//! [`MasterIndex`] is the union of all of them. An index object can
//! also name predecessors it supersedes (after a merge or rebuild).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::error::Error;
use crate::hashing::ObjectId;
use crate::pack::{BlobType, PackedBlob};

/// One pack's worth of an index document.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct IndexPack {
    pub id: ObjectId,
    pub blobs: Vec<PackedBlob>,
}

/// An index document as persisted (encrypted JSON).
#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Index {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub supersedes: BTreeSet<ObjectId>,
    pub packs: Vec<IndexPack>,
}

impl Index {
    pub fn len(&self) -> usize {
        self.packs.iter().map(|p| p.blobs.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

/// Whether a stored index parsed as the current document or the legacy
/// bare array of packs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IndexFormat {
    Current,
    Legacy,
}

/// Parses an index, current format first, falling back to the legacy
/// ordered-by-pack array on a shape mismatch.
pub fn from_json(bytes: &[u8]) -> Result<(Index, IndexFormat)> {
    match serde_json::from_slice::<Index>(bytes) {
        Ok(index) => Ok((index, IndexFormat::Current)),
        Err(e) if e.is_data() => {
            let packs: Vec<IndexPack> = serde_json::from_slice(bytes)
                .map_err(|_| e)
                .map_err(|e| anyhow::Error::from(e).context("Index isn't either known format"))?;
            debug!("Index parsed as the old bare-array format");
            Ok((
                Index {
                    supersedes: BTreeSet::new(),
                    packs,
                },
                IndexFormat::Legacy,
            ))
        }
        Err(e) => Err(anyhow::Error::from(e).context("Index isn't valid JSON")),
    }
}

/// Default flush threshold for the in-memory indexer.
pub const DEFAULT_FULL_ENTRIES: usize = 500_000;

/// Accumulates finished packs into the next index object to upload.
#[derive(Debug)]
pub struct Indexer {
    packs: BTreeMap<ObjectId, Vec<PackedBlob>>,
    supersedes: BTreeSet<ObjectId>,
    entries: usize,
    full_at: usize,
}

impl Indexer {
    pub fn new(full_at: usize) -> Self {
        Self {
            packs: BTreeMap::new(),
            supersedes: BTreeSet::new(),
            entries: 0,
            full_at,
        }
    }

    /// Records every blob of a finished pack.
    /// Exact duplicates (same pack, blob, and type) are dropped.
    pub fn add_pack(&mut self, pack_id: ObjectId, blobs: &[PackedBlob]) {
        let entry = self.packs.entry(pack_id).or_default();
        for blob in blobs {
            if !entry.iter().any(|b| b.id == blob.id && b.kind == blob.kind) {
                entry.push(*blob);
                self.entries += 1;
            }
        }
    }

    pub fn supersede(&mut self, predecessor: ObjectId) {
        self.supersedes.insert(predecessor);
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0 && self.supersedes.is_empty()
    }

    /// Time to flush?
    pub fn full(&self) -> bool {
        self.entries >= self.full_at
    }

    /// Takes the accumulated contents as a serializable document,
    /// leaving the indexer empty for the next segment.
    pub fn finalize(&mut self) -> Index {
        let index = Index {
            supersedes: std::mem::take(&mut self.supersedes),
            packs: std::mem::take(&mut self.packs)
                .into_iter()
                .map(|(id, blobs)| IndexPack { id, blobs })
                .collect(),
        };
        self.entries = 0;
        index
    }
}

/// Where one blob lives.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub struct IndexEntry {
    pub pack: ObjectId,
    pub kind: BlobType,
    pub offset: u32,
    pub length: u32,
}

/// The in-memory union of every loaded index.
///
/// Lookups are expected O(1); readers share a lock, inserts take it
/// exclusively. All duplicates are preserved (more than one pack
/// claiming a blob is a corruption *hint*, not an error), and entries
/// for one blob are kept sorted so lookups don't depend on load order.
#[derive(Debug, Default)]
pub struct MasterIndex {
    entries: RwLock<FxHashMap<ObjectId, Vec<IndexEntry>>>,
}

impl MasterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, id: &ObjectId) -> bool {
        self.entries.read().unwrap().contains_key(id)
    }

    /// The first location of the blob, or [`Error::NotInIndex`].
    pub fn lookup(&self, id: &ObjectId) -> Result<IndexEntry> {
        match self.entries.read().unwrap().get(id) {
            Some(locations) => Ok(locations[0]),
            None => bail!(Error::NotInIndex(*id)),
        }
    }

    /// The first location of the blob holding the given type of
    /// contents, or [`Error::NotInIndex`].
    pub fn lookup_typed(&self, id: &ObjectId, kind: BlobType) -> Result<IndexEntry> {
        match self.entries.read().unwrap().get(id) {
            Some(locations) => locations
                .iter()
                .find(|e| e.kind == kind)
                .copied()
                .ok_or_else(|| Error::NotInIndex(*id).into()),
            None => bail!(Error::NotInIndex(*id)),
        }
    }

    /// Records one blob location.
    /// Returns true if another pack already claimed this blob.
    pub fn store(&self, id: ObjectId, entry: IndexEntry) -> bool {
        let mut entries = self.entries.write().unwrap();
        let locations = entries.entry(id).or_default();
        if locations.contains(&entry) {
            return false; // Exact duplicate: benign, drop it.
        }
        let crosses_packs = !locations.is_empty();
        let at = locations.partition_point(|e| e < &entry);
        locations.insert(at, entry);
        crosses_packs
    }

    /// Merges a whole index document.
    /// Returns the IDs of blobs that now appear in more than one pack.
    pub fn add_index(&self, index: &Index) -> Vec<ObjectId> {
        let mut duplicates = Vec::new();
        for pack in &index.packs {
            for blob in &pack.blobs {
                let duplicate = self.store(
                    blob.id,
                    IndexEntry {
                        pack: pack.id,
                        kind: blob.kind,
                        offset: blob.offset,
                        length: blob.length,
                    },
                );
                if duplicate {
                    duplicates.push(blob.id);
                }
            }
        }
        duplicates
    }

    /// Number of distinct blobs.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every pack any entry points at.
    pub fn referenced_packs(&self) -> BTreeSet<ObjectId> {
        self.entries
            .read()
            .unwrap()
            .values()
            .flat_map(|locations| locations.iter().map(|e| e.pack))
            .collect()
    }

    /// Visits every entry in arbitrary order until `cancel` is set.
    ///
    /// Takes a snapshot of the keys up front so the lock isn't held
    /// while `f` runs.
    pub fn each<F>(&self, cancel: &AtomicBool, mut f: F)
    where
        F: FnMut(&ObjectId, &IndexEntry),
    {
        let keys: Vec<ObjectId> = self.entries.read().unwrap().keys().copied().collect();
        for id in keys {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            let locations = match self.entries.read().unwrap().get(&id) {
                Some(l) => l.clone(),
                None => continue,
            };
            for entry in &locations {
                f(&id, entry);
            }
        }
    }
}

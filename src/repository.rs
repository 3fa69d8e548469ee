//! The orchestrator: encrypts blobs into packs on the way down,
//! finds and decrypts them on the way back up.
//!
//! A repository owns the backend handle, the master keys, the union of
//! all loaded indexes, one open packer per blob type, and a small cache
//! of recently decrypted blobs. Snapshots, keys, the config, and locks
//! are stored as standalone encrypted JSON; everything else rides
//! inside packs.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, ensure};
use serde::de::DeserializeOwned;
use tracing::*;

use crate::backend::{self, Backend, FileType, Handle};
use crate::cache::BlobCache;
use crate::config::Config;
use crate::counters;
use crate::crypto::MasterKeys;
use crate::error::Error;
use crate::hashing::ObjectId;
use crate::index::{self, Indexer, MasterIndex};
use crate::key::{self, KdfParams};
use crate::pack::{BlobType, FinishedPack, PackWriter};
use crate::pool;
use crate::{pack, snapshot};

/// Tunables. None of these are part of the on-disk format.
#[derive(Debug, Clone)]
pub struct Options {
    /// Packs are finalized and uploaded once they buffer this much.
    pub min_pack_size: usize,
    /// The in-memory indexer flushes a segment at this many entries.
    pub index_full_entries: usize,
    /// Decrypted blobs kept around, by count.
    pub cache_entries: usize,
    /// Scrypt difficulty for new keys; `None` calibrates.
    pub kdf: Option<KdfParams>,
    /// Threads for parallel index loading.
    pub workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            min_pack_size: 4 * 1024 * 1024,
            index_full_entries: index::DEFAULT_FULL_ENTRIES,
            cache_entries: 64,
            kdf: None,
            workers: num_cpus::get(),
        }
    }
}

pub struct Repository {
    backend: Arc<dyn Backend>,
    keys: Arc<MasterKeys>,
    config: Config,
    polynomial: u64,
    master_index: MasterIndex,
    indexer: Mutex<Indexer>,
    data_packer: Mutex<Option<PackWriter>>,
    tree_packer: Mutex<Option<PackWriter>>,
    cache: BlobCache,
    opts: Options,
}

impl Repository {
    /// Creates a brand new repository: a random config (repo ID and
    /// chunker polynomial) and a first key wrapping fresh master keys.
    ///
    /// The config is written exactly once, here, and never again.
    pub fn init(backend: Arc<dyn Backend>, password: &str, opts: Options) -> Result<Self> {
        ensure!(
            !backend.test(&Handle::config())?,
            Error::BackendAlreadyExists(String::from("config"))
        );

        let keys = Arc::new(MasterKeys::random());
        key::create(&*backend, &keys, password, "", opts.kdf)?;

        let config = Config::random()?;
        let sealed = keys.encrypt(&serde_json::to_vec(&config)?);
        backend::save_bytes(&*backend, &Handle::config(), &sealed)
            .context("Couldn't write the repository config")?;
        info!("Initialized repository {}", config.id.short_name());

        Self::assemble(backend, keys, config, opts)
    }

    /// Opens an existing repository with any password that unwraps one
    /// of its keys.
    pub fn open(backend: Arc<dyn Backend>, password: &str, opts: Options) -> Result<Self> {
        let keys = Arc::new(key::search(&*backend, password, 20)?);

        let sealed = backend::load_all(&*backend, &Handle::config())
            .context("Couldn't read the repository config")?;
        let config: Config =
            serde_json::from_slice(&keys.decrypt(&sealed)?).context("Config isn't valid JSON")?;

        Self::assemble(backend, keys, config, opts)
    }

    fn assemble(
        backend: Arc<dyn Backend>,
        keys: Arc<MasterKeys>,
        config: Config,
        opts: Options,
    ) -> Result<Self> {
        let polynomial = config.polynomial()?;
        Ok(Self {
            backend,
            keys,
            config,
            polynomial,
            master_index: MasterIndex::new(),
            indexer: Mutex::new(Indexer::new(opts.index_full_entries)),
            data_packer: Mutex::new(None),
            tree_packer: Mutex::new(None),
            cache: BlobCache::new(opts.cache_entries),
            opts,
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn keys(&self) -> &Arc<MasterKeys> {
        &self.keys
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The chunking polynomial, fixed at repository creation.
    pub fn polynomial(&self) -> u64 {
        self.polynomial
    }

    pub fn index(&self) -> &MasterIndex {
        &self.master_index
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Loads every index object into the master index, in parallel.
    ///
    /// Returns the blobs that more than one pack claims - a corruption
    /// hint, not an error.
    pub fn load_index(&self) -> Result<Vec<ObjectId>> {
        let names = self.backend.list(FileType::Index)?;
        debug!("Loading {} indexes", names.len());

        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let (res_tx, res_rx) = crossbeam_channel::unbounded();
        let (_keep_alive, done) = pool::cancellation();
        for name in names {
            job_tx.send(name).unwrap();
        }
        drop(job_tx);

        let mut loaded_indexes = Vec::new();
        std::thread::scope(|s| -> Result<()> {
            s.spawn(|| {
                pool::run(self.opts.workers, job_rx, res_tx, done, |name: String| {
                    self.load_one_index(&name)
                        .with_context(|| format!("Couldn't load index {name}"))
                });
            });

            for loaded in res_rx.iter() {
                loaded_indexes.push(loaded?);
                counters::bump(counters::Op::IndexLoad);
            }
            Ok(())
        })?;

        // Strip out superseded indexes; their contents live on in
        // whatever replaced them.
        let superseded: std::collections::BTreeSet<ObjectId> = loaded_indexes
            .iter()
            .flat_map(|(_, index, _)| index.supersedes.iter().copied())
            .collect();

        let mut duplicates = Vec::new();
        for (id, index, format) in &loaded_indexes {
            if superseded.contains(id) {
                debug!("Index {} is superseded and can be deleted", id.short_name());
                continue;
            }
            if *format == index::IndexFormat::Legacy {
                warn!(
                    "Index {} uses the old format; consider rewriting it",
                    id.short_name()
                );
            }
            duplicates.extend(self.master_index.add_index(index));
        }

        for id in &duplicates {
            warn!("Blob {} appears in more than one pack", id.short_name());
        }
        Ok(duplicates)
    }

    fn load_one_index(&self, name: &str) -> Result<(ObjectId, index::Index, index::IndexFormat)> {
        let id: ObjectId = name.parse()?;
        let plaintext = self.load_verified(FileType::Index, &id)?;
        let (index, format) = index::from_json(&plaintext)?;
        Ok((id, index, format))
    }

    fn packer_for(&self, kind: BlobType) -> &Mutex<Option<PackWriter>> {
        match kind {
            BlobType::Data => &self.data_packer,
            BlobType::Tree => &self.tree_packer,
        }
    }

    /// Encrypts and stores one blob, deduplicating against everything
    /// we already have. Returns the blob's ID and whether it was new.
    pub fn save_blob(
        &self,
        kind: BlobType,
        data: &[u8],
        id: Option<ObjectId>,
    ) -> Result<(ObjectId, bool)> {
        let id = id.unwrap_or_else(|| ObjectId::hash(data));

        if self.master_index.has(&id) {
            counters::bump(counters::Op::DedupSkippedBlob);
            return Ok((id, false));
        }

        let ready = {
            let mut slot = self.packer_for(kind).lock().unwrap();
            let packer = slot.get_or_insert_with(|| PackWriter::new(self.keys.clone()));
            if packer.contains(&id) {
                counters::bump(counters::Op::DedupSkippedBlob);
                return Ok((id, false));
            }
            let size = packer.add(kind, id, data)?;
            if size >= self.opts.min_pack_size {
                slot.take()
            } else {
                None
            }
            // Lock drops here; a finalized pack uploads outside it so
            // other writers of this type can start the next one.
        };

        if let Some(full_packer) = ready {
            self.upload_pack(full_packer.finalize()?)?;
        }
        Ok((id, true))
    }

    fn upload_pack(&self, finished: FinishedPack) -> Result<()> {
        let FinishedPack { id, bytes, blobs } = finished;
        let handle = Handle::from_id(FileType::Data, &id);
        match backend::save_bytes(&*self.backend, &handle, &bytes) {
            Ok(()) => {}
            // An identical pack already uploaded is the bytes we wanted.
            Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::BackendAlreadyExists(_))) => {
                debug!("Pack {} already present", id.short_name());
            }
            Err(e) => return Err(e),
        }

        // Publish the pack's contents: visible to readers and dedup now,
        // durable at the next index flush.
        for blob in &blobs {
            self.master_index.store(
                blob.id,
                index::IndexEntry {
                    pack: id,
                    kind: blob.kind,
                    offset: blob.offset,
                    length: blob.length,
                },
            );
        }
        let mut indexer = self.indexer.lock().unwrap();
        indexer.add_pack(id, &blobs);
        if indexer.full() {
            let segment = indexer.finalize();
            drop(indexer);
            self.write_index_object(&segment)?;
        }
        Ok(())
    }

    fn write_index_object(&self, index: &index::Index) -> Result<ObjectId> {
        let id = self.save_unpacked(FileType::Index, index)?;
        debug!("Wrote index {}", id.short_name());
        Ok(id)
    }

    /// Reads one blob back: index lookup, cache, then a ranged backend
    /// read and decryption. The plaintext always hashes to `id`.
    pub fn load_blob(&self, kind: BlobType, id: &ObjectId) -> Result<Vec<u8>> {
        let entry = self.master_index.lookup_typed(id, kind)?;

        if let Some(hit) = self.cache.get(id, kind) {
            return Ok(hit);
        }

        let plaintext = pack::read_blob(
            &*self.backend,
            &self.keys,
            &entry.pack,
            &pack::PackedBlob {
                id: *id,
                kind,
                offset: entry.offset,
                length: entry.length,
            },
        )?;
        self.cache.insert(*id, kind, plaintext.clone());
        Ok(plaintext)
    }

    /// Encrypts a JSON object and stores it standalone (not in a pack)
    /// under the given type. Its name is the SHA256 of the plaintext.
    pub fn save_unpacked<T: serde::Serialize>(&self, kind: FileType, value: &T) -> Result<ObjectId> {
        let plaintext = serde_json::to_vec(value)?;
        let id = ObjectId::hash(&plaintext);
        let sealed = self.keys.encrypt(&plaintext);
        match backend::save_bytes(&*self.backend, &Handle::from_id(kind, &id), &sealed) {
            Ok(()) => Ok(id),
            // Same name means same plaintext; the object is already there.
            Err(e) if matches!(e.downcast_ref::<Error>(), Some(Error::BackendAlreadyExists(_))) => {
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    /// Loads and decrypts a standalone object, verifying its name.
    pub fn load_unpacked<T: DeserializeOwned>(&self, kind: FileType, id: &ObjectId) -> Result<T> {
        let plaintext = self.load_verified(kind, id)?;
        serde_json::from_slice(&plaintext)
            .with_context(|| format!("{} {id} isn't valid JSON", kind.dirname()))
    }

    fn load_verified(&self, kind: FileType, id: &ObjectId) -> Result<Vec<u8>> {
        let sealed = backend::load_all(&*self.backend, &Handle::from_id(kind, id))?;
        let plaintext = self.keys.decrypt(&sealed)?;
        let actual = ObjectId::hash(&plaintext);
        ensure!(
            actual == *id,
            Error::ChecksumMismatch {
                expected: *id,
                actual,
            }
        );
        Ok(plaintext)
    }

    /// Finalizes all open packers and writes out pending index state.
    ///
    /// The undersized tails of the per-type packers merge into one
    /// final pack. Call this before writing a snapshot - a snapshot is
    /// meaningless until every blob it references is uploaded and
    /// indexed.
    pub fn flush(&self) -> Result<()> {
        let data = self.data_packer.lock().unwrap().take();
        let tree = self.tree_packer.lock().unwrap().take();
        let combined = match (data, tree) {
            (Some(d), Some(t)) => Some(d.merge(t)),
            (Some(p), None) | (None, Some(p)) => Some(p),
            (None, None) => None,
        };
        if let Some(packer) = combined {
            if packer.count() > 0 {
                self.upload_pack(packer.finalize()?)?;
            }
        }

        let mut indexer = self.indexer.lock().unwrap();
        if !indexer.is_empty() {
            let final_index = indexer.finalize();
            drop(indexer);
            self.write_index_object(&final_index)?;
        }
        Ok(())
    }

    /// Finds the snapshot whose ID starts with the given hex prefix.
    pub fn find_snapshot(&self, prefix: &str) -> Result<snapshot::Snapshot> {
        let id = snapshot::find(&*self.backend, prefix)?;
        self.load_unpacked(FileType::Snapshot, &id)
    }
}

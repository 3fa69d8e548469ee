//! Walk everything and make sure it's all still there and still adds up.
//!
//! Four phases, each cheap enough to run alone:
//! 1. load_index - every index object parses and merges.
//! 2. check_packs - every indexed pack exists; every existing pack is
//!    indexed.
//! 3. check_structure - every snapshot's tree graph resolves, node by
//!    node, through the master index.
//! 4. read_data - the expensive one: download every pack and verify
//!    every hash, outside in.
//!
//! Errors are *collected*, never aborted on - the whole point is a
//! complete damage report. All phases stop early if the done channel
//! closes.

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use rustc_hash::FxHashSet;
use tracing::*;

use crate::backend::{self, FileType, Handle};
use crate::hashing::ObjectId;
use crate::pack::{self, BlobType};
use crate::pool;
use crate::repository::Repository;
use crate::snapshot;
use crate::tree;

/// A problem with a pack's existence.
#[derive(Debug, Clone)]
pub struct PackError {
    pub id: ObjectId,
    /// true: the pack exists but no index references it.
    /// false: an index references it but it's gone.
    pub orphaned: bool,
    pub detail: String,
}

/// A problem in the snapshot/tree/blob graph.
#[derive(Debug, Clone)]
pub struct StructureError {
    /// The tree where the problem was found, if we got that far.
    pub tree: Option<ObjectId>,
    pub detail: String,
}

/// A problem found while deep-reading a pack.
#[derive(Debug, Clone)]
pub struct ReadDataError {
    pub pack: ObjectId,
    pub detail: String,
}

/// Something odd but recoverable.
#[derive(Debug, Clone)]
pub enum Hint {
    /// More than one pack claims this blob.
    DuplicateBlob(ObjectId),
}

pub struct Checker<'a> {
    repo: &'a Repository,
    pub workers: usize,
}

impl<'a> Checker<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            workers: num_cpus::get(),
        }
    }

    /// Phase 1: load every index object into the master index.
    pub fn load_index(&self) -> Result<Vec<Hint>> {
        Ok(self
            .repo
            .load_index()?
            .into_iter()
            .map(Hint::DuplicateBlob)
            .collect())
    }

    /// Phase 2: `test` every pack any index references, and flag packs
    /// in the backend that no index knows about.
    pub fn check_packs(&self, errors: Sender<PackError>, done: Receiver<()>) -> Result<()> {
        let referenced = self.repo.index().referenced_packs();
        let mut present = FxHashSet::default();
        for name in self.repo.backend().list(FileType::Data)? {
            present.insert(name.parse::<ObjectId>()?);
        }

        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let (res_tx, res_rx) = crossbeam_channel::unbounded();
        for id in &referenced {
            job_tx.send(*id).unwrap();
        }
        drop(job_tx);

        std::thread::scope(|s| {
            s.spawn(|| {
                pool::run(self.workers, job_rx, res_tx, done, |id: ObjectId| {
                    let probed = self
                        .repo
                        .backend()
                        .test(&Handle::from_id(FileType::Data, &id));
                    (id, probed)
                });
            });

            for (id, probed) in res_rx.iter() {
                let error = match probed {
                    Ok(true) => continue,
                    Ok(false) => PackError {
                        id,
                        orphaned: false,
                        detail: String::from("referenced by an index but not in the backend"),
                    },
                    Err(e) => PackError {
                        id,
                        orphaned: false,
                        detail: format!("couldn't probe: {e:#}"),
                    },
                };
                let _ = errors.send(error);
            }
        });

        for orphan in present.iter().filter(|p| !referenced.contains(p)) {
            warn!("Pack {} isn't referenced by any index", orphan.short_name());
            let _ = errors.send(PackError {
                id: *orphan,
                orphaned: true,
                detail: String::from("in the backend but referenced by no index"),
            });
        }
        Ok(())
    }

    /// Phase 3: breadth-first walk of every snapshot's tree graph.
    ///
    /// Loader workers pull tree IDs and hand parsed trees back to the
    /// coordinator, which checks nodes and feeds newly discovered
    /// subtrees into the backlog. Each tree is loaded at most once, and
    /// the phase ends exactly when the backlog is empty and no loads
    /// are outstanding.
    pub fn check_structure(&self, errors: Sender<StructureError>, done: Receiver<()>) -> Result<()> {
        let mut visited = FxHashSet::default();
        let mut backlog: Vec<ObjectId> = Vec::new();

        for (snap, id) in snapshot::load_chronologically(self.repo)? {
            trace!("Checking snapshot {}", id.short_name());
            if visited.insert(snap.tree) {
                backlog.push(snap.tree);
            }
        }

        let cap = self.workers * 2;
        let (load_tx, load_rx) = crossbeam_channel::bounded::<ObjectId>(cap);
        let (loaded_tx, loaded_rx) = crossbeam_channel::bounded(cap);

        std::thread::scope(|s| {
            s.spawn(|| {
                pool::run(self.workers, load_rx, loaded_tx, done, |id: ObjectId| {
                    (id, tree::load(self.repo, &id))
                });
            });

            let mut outstanding = 0usize;
            loop {
                // Keep the loaders fed, but never more than the channel
                // can hold - the send must not block the drain below.
                while outstanding < cap {
                    match backlog.pop() {
                        Some(id) => {
                            if load_tx.send(id).is_err() {
                                break;
                            }
                            outstanding += 1;
                        }
                        None => break,
                    }
                }
                if outstanding == 0 {
                    break; // Backlog drained, nothing in flight: done.
                }

                let (id, loaded) = match loaded_rx.recv() {
                    Ok(got) => got,
                    Err(_) => break, // Loaders cancelled out from under us.
                };
                outstanding -= 1;

                let tree = match loaded {
                    Ok(tree) => tree,
                    Err(e) => {
                        let _ = errors.send(StructureError {
                            tree: Some(id),
                            detail: format!("couldn't load: {e:#}"),
                        });
                        continue;
                    }
                };
                for node in &tree.nodes {
                    self.check_node(&id, node, &errors, &mut visited, &mut backlog);
                }
            }
            drop(load_tx);
        });
        Ok(())
    }

    fn check_node(
        &self,
        tree_id: &ObjectId,
        node: &tree::Node,
        errors: &Sender<StructureError>,
        visited: &mut FxHashSet<ObjectId>,
        backlog: &mut Vec<ObjectId>,
    ) {
        if let Err(e) = node.validate() {
            let _ = errors.send(StructureError {
                tree: Some(*tree_id),
                detail: format!("{e:#}"),
            });
            return;
        }
        match node.kind {
            tree::NodeKind::File => {
                for chunk in node.content.as_ref().unwrap() {
                    if self.repo.index().lookup_typed(chunk, BlobType::Data).is_err() {
                        let _ = errors.send(StructureError {
                            tree: Some(*tree_id),
                            detail: format!(
                                "file {} references blob {} which is in no index",
                                node.name, chunk
                            ),
                        });
                    }
                }
            }
            tree::NodeKind::Dir => {
                let subtree = node.subtree.as_ref().unwrap();
                if visited.insert(*subtree) {
                    backlog.push(*subtree);
                }
            }
            // Everything else carries no blob references.
            _ => {}
        }
    }

    /// Phase 4: the deep check. Download every referenced pack whole,
    /// verify its file hash against its name, parse its header, and
    /// re-hash every blob's plaintext.
    ///
    /// A pack whose file hash is wrong gets exactly that one error;
    /// everything inside it would be noise.
    pub fn read_data(&self, errors: Sender<ReadDataError>, done: Receiver<()>) -> Result<()> {
        let referenced = self.repo.index().referenced_packs();
        info!("Deep-reading {} packs", referenced.len());

        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        let (res_tx, res_rx) = crossbeam_channel::unbounded();
        for id in &referenced {
            job_tx.send(*id).unwrap();
        }
        drop(job_tx);

        std::thread::scope(|s| {
            s.spawn(|| {
                pool::run(self.workers, job_rx, res_tx, done, |id: ObjectId| {
                    self.read_one_pack(&id)
                });
            });
            for pack_errors in res_rx.iter() {
                for e in pack_errors {
                    let _ = errors.send(e);
                }
            }
        });
        Ok(())
    }

    fn read_one_pack(&self, id: &ObjectId) -> Vec<ReadDataError> {
        let mut found = Vec::new();
        let handle = Handle::from_id(FileType::Data, id);

        let bytes = match backend::load_all(&**self.repo.backend(), &handle) {
            Ok(bytes) => bytes,
            Err(e) => {
                found.push(ReadDataError {
                    pack: *id,
                    detail: format!("couldn't download: {e:#}"),
                });
                return found;
            }
        };

        let actual = ObjectId::hash(&bytes);
        if actual != *id {
            found.push(ReadDataError {
                pack: *id,
                detail: format!("pack bytes hash to {actual}, not its name"),
            });
            return found;
        }

        let blobs = match pack::parse_header(self.repo.keys(), &bytes) {
            Ok(blobs) => blobs,
            Err(e) => {
                found.push(ReadDataError {
                    pack: *id,
                    detail: format!("bad header: {e:#}"),
                });
                return found;
            }
        };

        for blob in blobs {
            let sealed = &bytes[blob.offset as usize..blob.offset as usize + blob.length as usize];
            match self.repo.keys().decrypt(sealed) {
                Ok(plaintext) => {
                    let hash = ObjectId::hash(&plaintext);
                    if hash != blob.id {
                        found.push(ReadDataError {
                            pack: *id,
                            detail: format!("blob {} decrypts to hash {hash}", blob.id),
                        });
                    }
                }
                Err(e) => {
                    found.push(ReadDataError {
                        pack: *id,
                        detail: format!("blob {}: {e:#}", blob.id),
                    });
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archiver::Archiver;
    use crate::backend::memory::MemoryBackend;
    use crate::key;
    use crate::repository::{Options, Repository};
    use camino::Utf8PathBuf;
    use std::sync::Arc;

    fn backed_up_repo() -> Result<(Arc<MemoryBackend>, Repository)> {
        let mem = Arc::new(MemoryBackend::new());
        let repo = Repository::init(
            mem.clone(),
            "test",
            Options {
                kdf: Some(key::trivial_params()),
                workers: 2,
                ..Options::default()
            },
        )?;
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("file.txt"), b"checkable contents\n")?;
        Archiver::new(&repo)
            .snapshot(&[Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap()])?;
        Ok((mem, repo))
    }

    fn drain<T>(rx: Receiver<T>) -> Vec<T> {
        rx.try_iter().collect()
    }

    #[test]
    fn healthy_repository_is_quiet() -> Result<()> {
        let (_mem, repo) = backed_up_repo()?;
        let mut checker = Checker::new(&repo);
        checker.workers = 2;

        assert!(checker.load_index()?.is_empty());

        let (_cancel, done) = pool::cancellation();
        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        checker.check_packs(err_tx, done.clone())?;
        assert!(drain(err_rx).is_empty());

        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        checker.check_structure(err_tx, done.clone())?;
        assert!(drain(err_rx).is_empty());

        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        checker.read_data(err_tx, done)?;
        assert!(drain(err_rx).is_empty());
        Ok(())
    }

    #[test]
    fn unindexed_blob_reference_is_reported() -> Result<()> {
        let (_mem, repo) = backed_up_repo()?;

        // Write a snapshot whose tree references a blob nobody has.
        let mut evil = tree::Tree::default();
        evil.nodes.push(tree::Node {
            name: String::from("phantom.bin"),
            kind: tree::NodeKind::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime: jiff::Timestamp::UNIX_EPOCH,
            atime: jiff::Timestamp::UNIX_EPOCH,
            ctime: jiff::Timestamp::UNIX_EPOCH,
            size: Some(1),
            content: Some(vec![ObjectId::hash(b"never stored")]),
            subtree: None,
            linktarget: None,
            device: None,
            inode: None,
            links: None,
            extended_attributes: None,
        });
        let evil_id = tree::save(&repo, &evil)?;
        repo.flush()?;
        snapshot::save(
            &repo,
            &snapshot::Snapshot::of(evil_id, vec![Utf8PathBuf::from("/evil")], None),
        )?;

        let checker = Checker::new(&repo);
        let (_cancel, done) = pool::cancellation();
        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        checker.check_structure(err_tx, done)?;

        let errors = drain(err_rx);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].detail.contains("phantom.bin"));
        assert_eq!(errors[0].tree, Some(evil_id));
        Ok(())
    }
}

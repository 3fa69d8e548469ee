//! Places where we can keep a backup repository - the local filesystem,
//! an in-memory store for tests, and (via other crates) cloud hosts.
//!
//! Everything above this layer is polymorphic over [`Backend`]:
//! an opaque blob store addressed by [`Handle`].

use std::fmt;
use std::io::{self, prelude::*};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use tracing::*;

use crate::hashing::ObjectId;

pub mod fs;
pub mod memory;
pub mod semaphored;

/// Storage-level file types.
///
/// `Data` names pack files; whether a packed blob is file data or a tree
/// lives inside the pack header, not in the file name.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum FileType {
    Data,
    Snapshot,
    Index,
    Key,
    Lock,
    Config,
}

pub const ALL_FILE_TYPES: [FileType; 6] = [
    FileType::Data,
    FileType::Snapshot,
    FileType::Index,
    FileType::Key,
    FileType::Lock,
    FileType::Config,
];

impl FileType {
    /// The directory objects of this type live in.
    pub fn dirname(self) -> &'static str {
        match self {
            FileType::Data => "data",
            FileType::Snapshot => "snapshots",
            FileType::Index => "index",
            FileType::Key => "keys",
            FileType::Lock => "locks",
            FileType::Config => "",
        }
    }
}

/// Addresses a single object in a backend: a file type plus a name.
///
/// The name is the hex ID for hashed objects and `"config"` for the
/// singleton config object.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub kind: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(kind: FileType, name: String) -> Self {
        Self { kind, name }
    }

    pub fn from_id(kind: FileType, id: &ObjectId) -> Self {
        Self {
            kind,
            name: id.to_string(),
        }
    }

    pub fn config() -> Self {
        Self {
            kind: FileType::Config,
            name: String::from("config"),
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == FileType::Config {
            write!(f, "config")
        } else {
            write!(f, "{}/{}", self.kind.dirname(), self.name)
        }
    }
}

/// How handles map onto paths.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Layout {
    /// Packs are grouped into 256 subdirectories by the first byte of
    /// their name; everything else sits in a single directory per type.
    Default,
    /// Packs sit directly in `data/`. Cloud stores like this better.
    Flat,
}

impl Layout {
    /// The path of the given handle, relative to the repository root.
    pub fn path(self, handle: &Handle) -> Utf8PathBuf {
        match handle.kind {
            FileType::Config => Utf8PathBuf::from("config"),
            FileType::Data if self == Layout::Default => {
                assert!(handle.name.len() > 2);
                Utf8PathBuf::from(format!("data/{}/{}", &handle.name[0..2], handle.name))
            }
            kind => Utf8PathBuf::from(format!("{}/{}", kind.dirname(), handle.name)),
        }
    }
}

/// The uniform storage contract.
///
/// Any number of `load`/`stat`/`list`/`test` calls may run in parallel
/// with each other and with `save` of distinct handles.
pub trait Backend: Send + Sync {
    /// Persist `len` bytes of `from` under `to`.
    ///
    /// Atomic: a partial write must never become visible under `to`,
    /// and an existing object is never overwritten
    /// ([`Error::BackendAlreadyExists`](crate::error::Error)).
    fn save(&self, to: &Handle, len: u64, from: &mut (dyn Read + Send)) -> Result<()>;

    /// Stream `length` bytes of the object starting at `offset`.
    ///
    /// A length of 0 means "everything from `offset` on";
    /// an offset past the end yields an empty stream.
    fn load(&self, from: &Handle, offset: u64, length: u32)
    -> Result<Box<dyn Read + Send + '_>>;

    /// Size of the object, in bytes.
    fn stat(&self, of: &Handle) -> Result<u64>;

    /// Is the object present?
    fn test(&self, of: &Handle) -> Result<bool>;

    fn remove(&self, which: &Handle) -> Result<()>;

    /// All names of the given type, in arbitrary order.
    fn list(&self, kind: FileType) -> Result<Vec<String>>;

    /// Remove every object of every type.
    fn delete(&self) -> Result<()>;

    /// Release resources. A no-op for most implementations.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Convenience: save an in-memory buffer.
pub fn save_bytes(backend: &dyn Backend, to: &Handle, bytes: &[u8]) -> Result<()> {
    let mut cursor = io::Cursor::new(bytes);
    backend.save(to, bytes.len() as u64, &mut cursor)
}

/// Convenience: slurp a whole object.
pub fn load_all(backend: &dyn Backend, from: &Handle) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    backend
        .load(from, 0, 0)?
        .read_to_end(&mut buf)
        .with_context(|| format!("Couldn't read {from}"))?;
    Ok(buf)
}

/// Read an exact range of an object, failing short reads.
pub fn load_range(backend: &dyn Backend, from: &Handle, offset: u64, length: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0; length as usize];
    backend
        .load(from, offset, length)?
        .read_exact(&mut buf)
        .with_context(|| format!("Couldn't read {length} bytes at {offset} from {from}"))?;
    Ok(buf)
}

/// Default cap on concurrent backend operations.
pub const DEFAULT_CONCURRENCY: u32 = 8;

/// Initializes a filesystem-backed repository directory at the given path.
pub fn initialize<P: AsRef<Path>>(repository: P) -> Result<()> {
    fs::FilesystemBackend::initialize(repository.as_ref())
}

/// Opens a filesystem-backed repository, probing its layout and wrapping
/// it in the standard concurrency cap.
pub fn open<P: AsRef<Path>>(repository: P) -> Result<Arc<dyn Backend>> {
    let repository = repository.as_ref();
    info!("Opening repository '{}'", repository.display());
    let fs = fs::FilesystemBackend::open(repository)?;
    Ok(Arc::new(semaphored::Semaphored::new(
        fs,
        DEFAULT_CONCURRENCY,
    )))
}

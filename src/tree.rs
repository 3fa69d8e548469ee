//! Trees and nodes: the filesystem metadata half of a backup.
//!
//! A tree is one directory's worth of [`Node`]s; directories point at
//! subtrees by ID, files point at the chunks holding their contents.
//! Since IDs are content hashes, the whole thing forms a DAG with the
//! snapshot's root tree on top.

use anyhow::{Context, Result, ensure};
use camino::Utf8PathBuf;
use serde_derive::{Deserialize, Serialize};

use crate::hashing::ObjectId;
use crate::pack::BlobType;
use crate::repository::Repository;

/// Every kind of filesystem entry we can put in a tree.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
    Socket,
    Chardev,
    Dev,
    Fifo,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Xattr {
    pub name: String,
    pub value: String,
}

/// One directory entry and its metadata.
///
/// Exactly one of `content` (files) or `subtree` (directories) is set;
/// the other kinds carry no blob references at all.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: jiff::Timestamp,
    pub atime: jiff::Timestamp,
    pub ctime: jiff::Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ObjectId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linktarget: Option<Utf8PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_attributes: Option<Vec<Xattr>>,
}

impl Node {
    /// Does the node's shape match its type?
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            NodeKind::File => {
                ensure!(
                    self.content.is_some() && self.subtree.is_none(),
                    "File node {} needs content and no subtree",
                    self.name
                );
            }
            NodeKind::Dir => {
                ensure!(
                    self.subtree.is_some() && self.content.is_none(),
                    "Dir node {} needs a subtree and no content",
                    self.name
                );
            }
            _ => {
                ensure!(
                    self.content.is_none() && self.subtree.is_none(),
                    "{:?} node {} can't reference blobs",
                    self.kind,
                    self.name
                );
            }
        }
        Ok(())
    }
}

/// One directory of nodes. Node order is preserved on write.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

/// Serialize the tree into its on-disk JSON representation and return
/// its ID (hash of those bytes).
pub fn serialize_and_hash(tree: &Tree) -> Result<(Vec<u8>, ObjectId)> {
    let json = serde_json::to_vec(tree)?;
    let id = ObjectId::hash(&json);
    Ok((json, id))
}

/// Marshals the tree and stores it as a Tree blob (deduplicated like
/// any other blob).
pub fn save(repo: &Repository, tree: &Tree) -> Result<ObjectId> {
    let (json, id) = serialize_and_hash(tree)?;
    let (stored, _new) = repo.save_blob(BlobType::Tree, &json, Some(id))?;
    Ok(stored)
}

/// Loads and parses a tree blob.
pub fn load(repo: &Repository, id: &ObjectId) -> Result<Tree> {
    let bytes = repo.load_blob(BlobType::Tree, id)?;
    serde_json::from_slice(&bytes).with_context(|| format!("Tree {id} isn't valid JSON"))
}

/// Reads a node's metadata (but not contents) off the filesystem.
#[cfg(unix)]
pub fn node_from_path(path: &camino::Utf8Path) -> Result<Node> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let meta = std::fs::symlink_metadata(path).with_context(|| format!("Couldn't stat {path}"))?;
    let ft = meta.file_type();

    let kind = if ft.is_symlink() {
        NodeKind::Symlink
    } else if ft.is_dir() {
        NodeKind::Dir
    } else if ft.is_socket() {
        NodeKind::Socket
    } else if ft.is_char_device() {
        NodeKind::Chardev
    } else if ft.is_block_device() {
        NodeKind::Dev
    } else if ft.is_fifo() {
        NodeKind::Fifo
    } else {
        NodeKind::File
    };

    let name = path
        .file_name()
        .with_context(|| format!("{path} has no file name"))?
        .to_owned();

    let linktarget = if kind == NodeKind::Symlink {
        let target = std::fs::read_link(path.as_std_path())
            .with_context(|| format!("Couldn't read link {path}"))?;
        Some(
            Utf8PathBuf::from_path_buf(target)
                .map_err(|t| anyhow::anyhow!("Link target {} isn't UTF-8", t.display()))?,
        )
    } else {
        None
    };

    Ok(Node {
        name,
        kind,
        mode: meta.mode(),
        uid: meta.uid(),
        gid: meta.gid(),
        mtime: unix_timestamp(meta.mtime(), meta.mtime_nsec())?,
        atime: unix_timestamp(meta.atime(), meta.atime_nsec())?,
        ctime: unix_timestamp(meta.ctime(), meta.ctime_nsec())?,
        size: (kind == NodeKind::File).then(|| meta.size()),
        content: None,
        subtree: None,
        linktarget,
        device: matches!(kind, NodeKind::Chardev | NodeKind::Dev).then(|| meta.rdev()),
        inode: Some(meta.ino()),
        links: Some(meta.nlink()),
        extended_attributes: None,
    })
}

#[cfg(unix)]
fn unix_timestamp(secs: i64, nsecs: i64) -> Result<jiff::Timestamp> {
    jiff::Timestamp::new(secs, nsecs as i32).context("Timestamp out of range")
}

//! Build, read, and write packs of encrypted blobs,
//! suitable for storing in a [backend](crate::backend)
//!
//! A pack is every blob's ciphertext back to back, then an encrypted
//! header of fixed-size entries describing them, then the header's
//! length:
//!
//! ```text
//! |blob 0|blob 1|...|blob n-1|encrypted header|u32_le(header length)|
//! ```
//!
//! The pack's storage name is the SHA256 of the entire file.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail, ensure};
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::backend::{self, Backend, FileType, Handle};
use crate::counters;
use crate::crypto::{self, MasterKeys};
use crate::error::Error;
use crate::hashing::ObjectId;

/// What a packed blob holds: file contents or a directory tree.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobType {
    Data,
    Tree,
}

impl BlobType {
    fn to_wire(self) -> u8 {
        match self {
            BlobType::Data => 0,
            BlobType::Tree => 1,
        }
    }

    fn from_wire(b: u8) -> Result<Self> {
        match b {
            0 => Ok(BlobType::Data),
            1 => Ok(BlobType::Tree),
            unknown => bail!(Error::InvalidPackFormat(format!(
                "unknown blob type {unknown}"
            ))),
        }
    }
}

/// One header entry: `{type: u8, length: u32_le, id: [u8; 32]}`.
///
/// `length` is the stored (encrypted) length; blob offsets are the
/// cumulative sums of these.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PackEntry {
    pub kind: BlobType,
    pub length: u32,
    pub id: ObjectId,
}

/// The fixed stride keeps bounds checking trivial.
pub const ENTRY_SIZE: usize = 1 + 4 + 32;

/// Encrypted headers bigger than this are rejected out of hand.
pub const MAX_HEADER_SIZE: u32 = 16 * 1024 * 1024;

/// A blob's location inside its pack, as recorded in indexes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PackedBlob {
    pub id: ObjectId,
    #[serde(rename = "type")]
    pub kind: BlobType,
    pub offset: u32,
    pub length: u32,
}

/// A finalized pack, ready for upload and indexing.
pub struct FinishedPack {
    /// SHA256 of `bytes`, and the pack's storage name.
    pub id: ObjectId,
    pub bytes: Vec<u8>,
    pub blobs: Vec<PackedBlob>,
}

fn encode_entries(entries: &[PackEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * ENTRY_SIZE);
    for entry in entries {
        out.push(entry.kind.to_wire());
        out.extend_from_slice(&entry.length.to_le_bytes());
        out.extend_from_slice(entry.id.as_bytes());
    }
    out
}

fn decode_entries(bytes: &[u8]) -> Result<Vec<PackEntry>> {
    ensure!(
        bytes.len() % ENTRY_SIZE == 0,
        Error::InvalidPackFormat(format!(
            "header length {} isn't a multiple of {ENTRY_SIZE}",
            bytes.len()
        ))
    );
    bytes
        .chunks_exact(ENTRY_SIZE)
        .map(|chunk| {
            Ok(PackEntry {
                kind: BlobType::from_wire(chunk[0])?,
                length: u32::from_le_bytes(chunk[1..5].try_into().unwrap()),
                id: ObjectId::from_bytes(chunk[5..37].try_into().unwrap()),
            })
        })
        .collect()
}

fn entries_to_blobs(entries: Vec<PackEntry>) -> Vec<PackedBlob> {
    let mut offset = 0u32;
    entries
        .into_iter()
        .map(|e| {
            let blob = PackedBlob {
                id: e.id,
                kind: e.kind,
                offset,
                length: e.length,
            };
            offset += e.length;
            blob
        })
        .collect()
}

struct WriterInner {
    buf: Vec<u8>,
    entries: Vec<PackEntry>,
}

/// Accumulates encrypted blobs until someone decides the pack is big
/// enough and finalizes it.
///
/// `add` is internally serialized; concurrent callers may share one
/// writer per blob type.
pub struct PackWriter {
    keys: Arc<MasterKeys>,
    inner: Mutex<WriterInner>,
}

impl PackWriter {
    pub fn new(keys: Arc<MasterKeys>) -> Self {
        Self {
            keys,
            inner: Mutex::new(WriterInner {
                buf: Vec::new(),
                entries: Vec::new(),
            }),
        }
    }

    /// Encrypts the blob, appends it, and returns the pack's new size.
    pub fn add(&self, kind: BlobType, id: ObjectId, plaintext: &[u8]) -> Result<usize> {
        assert!(plaintext.len() + crypto::OVERHEAD <= u32::MAX as usize);
        let sealed = self.keys.encrypt(plaintext);

        let mut inner = self.inner.lock().unwrap();
        trace!("Packing {kind:?} blob {}", id.short_name());
        inner.buf.extend_from_slice(&sealed);
        inner.entries.push(PackEntry {
            kind,
            length: sealed.len() as u32,
            id,
        });
        Ok(inner.buf.len())
    }

    /// Bytes buffered so far.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Is the blob already waiting in this pack?
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .any(|e| e.id == *id)
    }

    /// Folds another writer's pending blobs into this one.
    ///
    /// Used when flushing: the undersized tails of the per-type packers
    /// coalesce into a single final pack rather than several tiny ones.
    pub fn merge(self, other: PackWriter) -> PackWriter {
        let PackWriter { keys, inner } = self;
        let mut a = inner.into_inner().unwrap();
        let b = other.inner.into_inner().unwrap();
        a.buf.extend_from_slice(&b.buf);
        a.entries.extend(b.entries);
        PackWriter {
            keys,
            inner: Mutex::new(a),
        }
    }

    /// Appends the encrypted header and its length, hashes the result,
    /// and hands back the bytes to upload.
    pub fn finalize(self) -> Result<FinishedPack> {
        let WriterInner { mut buf, entries } = self.inner.into_inner().unwrap();
        ensure!(!entries.is_empty(), "Refusing to finalize an empty pack");

        let header = self.keys.encrypt(&encode_entries(&entries));
        ensure!(
            header.len() as u32 <= MAX_HEADER_SIZE,
            Error::InvalidPackFormat(format!("{}-byte header is too large", header.len()))
        );
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&(header.len() as u32).to_le_bytes());

        let id = ObjectId::hash(&buf);
        debug!(
            "Finalized pack {} ({} blobs, {} bytes)",
            id.short_name(),
            entries.len(),
            buf.len()
        );
        counters::bump(counters::Op::PackFinalized);
        Ok(FinishedPack {
            id,
            bytes: buf,
            blobs: entries_to_blobs(entries),
        })
    }
}

/// Reads and decrypts the header of a stored pack,
/// returning its blobs with offsets.
pub fn read_header(
    backend: &dyn Backend,
    keys: &MasterKeys,
    id: &ObjectId,
) -> Result<Vec<PackedBlob>> {
    let handle = Handle::from_id(FileType::Data, id);
    let size = backend.stat(&handle)?;
    ensure!(
        size >= 4 + (crypto::OVERHEAD as u64),
        Error::InvalidPackFormat(format!("pack {id} is only {size} bytes"))
    );

    let trailer = backend::load_range(backend, &handle, size - 4, 4)?;
    let header_len = u32::from_le_bytes(trailer.as_slice().try_into().unwrap());
    ensure!(
        header_len <= MAX_HEADER_SIZE,
        Error::InvalidPackFormat(format!("{header_len}-byte header is too large"))
    );
    ensure!(
        (header_len as u64) + 4 <= size,
        Error::InvalidPackFormat(format!(
            "pack {id} is {size} bytes but claims a {header_len}-byte header"
        ))
    );

    let sealed = backend::load_range(backend, &handle, size - 4 - header_len as u64, header_len)?;
    let entries =
        decode_entries(&keys.decrypt(&sealed)?).with_context(|| format!("In pack {id}"))?;

    let blobs = entries_to_blobs(entries);
    let blob_bytes: u64 = blobs.iter().map(|b| b.length as u64).sum();
    ensure!(
        blob_bytes + header_len as u64 + 4 == size,
        Error::InvalidPackFormat(format!(
            "pack {id}: blobs + header cover {} of {size} bytes",
            blob_bytes + header_len as u64 + 4
        ))
    );
    Ok(blobs)
}

/// Parses the header of a fully-downloaded pack.
///
/// Used by the checker, which already has the whole file in hand.
pub fn parse_header(keys: &MasterKeys, pack_bytes: &[u8]) -> Result<Vec<PackedBlob>> {
    ensure!(
        pack_bytes.len() >= 4 + crypto::OVERHEAD,
        Error::InvalidPackFormat(format!("pack is only {} bytes", pack_bytes.len()))
    );
    let (rest, trailer) = pack_bytes.split_at(pack_bytes.len() - 4);
    let header_len = u32::from_le_bytes(trailer.try_into().unwrap()) as usize;
    ensure!(
        header_len as u64 <= MAX_HEADER_SIZE as u64,
        Error::InvalidPackFormat(format!("{header_len}-byte header is too large"))
    );
    ensure!(
        header_len <= rest.len(),
        Error::InvalidPackFormat(format!(
            "pack is {} bytes but claims a {header_len}-byte header",
            pack_bytes.len()
        ))
    );

    let entries = decode_entries(&keys.decrypt(&rest[rest.len() - header_len..])?)?;
    let blobs = entries_to_blobs(entries);
    let blob_bytes: usize = blobs.iter().map(|b| b.length as usize).sum();
    ensure!(
        blob_bytes + header_len + 4 == pack_bytes.len(),
        Error::InvalidPackFormat(format!(
            "blobs + header cover {} of {} bytes",
            blob_bytes + header_len + 4,
            pack_bytes.len()
        ))
    );
    Ok(blobs)
}

/// Loads one blob out of a stored pack and decrypts it.
pub fn read_blob(
    backend: &dyn Backend,
    keys: &MasterKeys,
    pack_id: &ObjectId,
    blob: &PackedBlob,
) -> Result<Vec<u8>> {
    let handle = Handle::from_id(FileType::Data, pack_id);
    let sealed = backend::load_range(backend, &handle, blob.offset as u64, blob.length)
        .with_context(|| format!("Couldn't read blob {} from pack {pack_id}", blob.id))?;
    let plaintext = keys.decrypt(&sealed)?;

    let actual = ObjectId::hash(&plaintext);
    ensure!(
        actual == blob.id,
        Error::ChecksumMismatch {
            expected: blob.id,
            actual,
        }
    );
    Ok(plaintext)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn test_keys() -> Arc<MasterKeys> {
        Arc::new(MasterKeys::random())
    }

    #[test]
    fn entry_encoding_round_trips() -> Result<()> {
        let entries = vec![
            PackEntry {
                kind: BlobType::Data,
                length: 42,
                id: ObjectId::hash(b"first"),
            },
            PackEntry {
                kind: BlobType::Tree,
                length: 22,
                id: ObjectId::hash(b"second"),
            },
        ];
        let encoded = encode_entries(&entries);
        assert_eq!(encoded.len(), 2 * ENTRY_SIZE);
        assert_eq!(decode_entries(&encoded)?, entries);
        Ok(())
    }

    #[test]
    fn ragged_headers_are_rejected() {
        let err = decode_entries(&[0u8; ENTRY_SIZE + 1]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidPackFormat(_))
        ));
    }

    #[test]
    fn round_trip() -> Result<()> {
        let keys = test_keys();
        let mem = MemoryBackend::new();

        let writer = PackWriter::new(keys.clone());
        let payloads: Vec<Vec<u8>> = vec![
            b"just a little data".to_vec(),
            vec![0u8; 4096],
            b"{\"nodes\":[]}".to_vec(),
        ];
        let kinds = [BlobType::Data, BlobType::Data, BlobType::Tree];
        for (payload, kind) in payloads.iter().zip(kinds) {
            writer.add(kind, ObjectId::hash(payload), payload)?;
        }
        assert_eq!(writer.count(), 3);
        assert!(writer.contains(&ObjectId::hash(&payloads[0])));

        let finished = writer.finalize()?;
        assert_eq!(ObjectId::hash(&finished.bytes), finished.id);

        backend::save_bytes(
            &mem,
            &Handle::from_id(FileType::Data, &finished.id),
            &finished.bytes,
        )?;

        let blobs = read_header(&mem, &keys, &finished.id)?;
        assert_eq!(blobs, finished.blobs);

        // Offsets are cumulative sums of stored lengths.
        assert_eq!(blobs[0].offset, 0);
        assert_eq!(blobs[1].offset, blobs[0].length);
        assert_eq!(blobs[2].offset, blobs[0].length + blobs[1].length);

        for (payload, blob) in payloads.iter().zip(&blobs) {
            assert_eq!(blob.length as usize, payload.len() + crypto::OVERHEAD);
            assert_eq!(&read_blob(&mem, &keys, &finished.id, blob)?, payload);
        }
        Ok(())
    }

    #[test]
    fn single_blob_pack_layout() -> Result<()> {
        let keys = test_keys();
        let writer = PackWriter::new(keys.clone());
        writer.add(BlobType::Data, ObjectId::hash(b"solo"), b"solo")?;
        let finished = writer.finalize()?;

        // One blob ciphertext, one encrypted 37-byte header, 4-byte trailer.
        let blob_len = 4 + crypto::OVERHEAD;
        let header_len = ENTRY_SIZE + crypto::OVERHEAD;
        assert_eq!(finished.bytes.len(), blob_len + header_len + 4);

        let trailer = &finished.bytes[finished.bytes.len() - 4..];
        assert_eq!(
            u32::from_le_bytes(trailer.try_into().unwrap()) as usize,
            header_len
        );

        let blobs = parse_header(&keys, &finished.bytes)?;
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].offset, 0);
        Ok(())
    }

    #[test]
    fn oversized_headers_are_rejected() {
        let keys = test_keys();
        // A "pack" whose trailer claims a comically large header.
        let mut fake = vec![0u8; 64];
        fake.extend_from_slice(&(MAX_HEADER_SIZE + 1).to_le_bytes());
        let err = parse_header(&keys, &fake).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidPackFormat(_))
        ));
    }

    #[test]
    fn tampered_headers_fail_decryption() -> Result<()> {
        let keys = test_keys();
        let writer = PackWriter::new(keys.clone());
        writer.add(BlobType::Data, ObjectId::hash(b"bytes"), b"bytes")?;
        let mut finished = writer.finalize()?;

        // Flip a bit inside the encrypted header.
        let header_start = finished.bytes.len() - 4 - (ENTRY_SIZE + crypto::OVERHEAD);
        finished.bytes[header_start + 3] ^= 1;
        let err = parse_header(&keys, &finished.bytes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Unauthenticated)
        ));
        Ok(())
    }
}

//! Tools for hashing everything we care about into a unique [`ObjectId`]

use std::fmt;
use std::io;
use std::io::prelude::*;

use anyhow::{Context, Result, bail, ensure};
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256, digest::Output};

use crate::error::Error;

type Sha256Digest = Output<Sha256>;

/// The hash (a SHA256) used to identify all objects in our system.
///
/// Blobs are named by the hash of their plaintext,
/// packs and standalone files by the hash of their bytes.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId {
    digest: Sha256Digest,
}

impl ObjectId {
    /// Calculates an ID from the given bytes
    pub fn hash(bytes: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(bytes),
        }
    }

    fn from_digest(digest: Sha256Digest) -> Self {
        Self { digest }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            digest: *Sha256Digest::from_slice(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.digest.as_slice()
    }

    /// Gets a git-like shortened version of the hash that's unique enough
    /// for most UI uses.
    pub fn short_name(&self) -> String {
        let mut full = format!("{self}");
        let _rest = full.split_off(8);
        full
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ digest: {} }}", HEXLOWER.encode(&self.digest))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.digest))
    }
}

impl std::str::FromStr for ObjectId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = HEXLOWER
            .decode(s.to_ascii_lowercase().as_bytes())
            .with_context(|| format!("Couldn't decode {s} as hex"))?;

        ensure!(
            bytes.len() == <Sha256 as Digest>::output_size(),
            "Expected a SHA256 in hex"
        );
        Ok(ObjectId::from_digest(*Sha256Digest::from_slice(&bytes)))
    }
}

impl serde::Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&HEXLOWER.encode(self.digest.as_slice()))
    }
}

impl<'de> serde::Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<ObjectId, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let hex: String = String::deserialize(deserializer)?;
        hex.parse().map_err(|e| D::Error::custom(format!("{e:#}")))
    }
}

/// Resolves a hex prefix against a list of object names.
///
/// Exactly one name must start with the prefix;
/// several matches fail with [`Error::AmbiguousId`].
pub fn resolve_prefix(prefix: &str, names: &[String]) -> Result<ObjectId> {
    // Like Git, require at least a few digits.
    if prefix.len() < 4 {
        bail!("Provide an ID with at least 4 hex digits");
    }
    let lowered = prefix.to_ascii_lowercase();
    let matches: Vec<&String> = names.iter().filter(|n| n.starts_with(&lowered)).collect();
    match matches.len() {
        0 => bail!("No object starts with {prefix}"),
        1 => matches[0].parse(),
        multiple => bail!(Error::AmbiguousId(prefix.to_owned(), multiple)),
    }
}

pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (ObjectId, R) {
        (ObjectId::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }
}

pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (ObjectId, W) {
        (ObjectId::from_digest(self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.hasher.update(&buf[..count]);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

//! The repository config: identity and chunking polynomial.
//!
//! Written exactly once when the repository is created and immutable
//! after that - the polynomial decides every chunk boundary, so
//! changing it would orphan all existing deduplication.

use anyhow::{Context, Result, ensure};
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

use crate::chunker;
use crate::hashing::ObjectId;

pub const REPO_VERSION: u32 = 1;

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    /// Identifies this repository (e.g. to keep caches apart).
    pub id: ObjectId,
    /// Hex-encoded irreducible polynomial driving the chunker.
    chunker_polynomial: String,
}

impl Config {
    /// A fresh config with a random ID and a random irreducible
    /// polynomial.
    pub fn random() -> Result<Self> {
        let mut id_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut id_bytes);
        Ok(Self {
            version: REPO_VERSION,
            id: ObjectId::from_bytes(&id_bytes),
            chunker_polynomial: format!("{:x}", chunker::random_polynomial()?),
        })
    }

    pub fn polynomial(&self) -> Result<u64> {
        let pol = u64::from_str_radix(&self.chunker_polynomial, 16)
            .with_context(|| format!("Bad chunker polynomial {}", self.chunker_polynomial))?;
        ensure!(
            chunker::irreducible(pol),
            "Config polynomial {pol:#x} isn't irreducible"
        );
        Ok(pol)
    }
}

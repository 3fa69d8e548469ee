#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use camino::Utf8PathBuf;

use sealbak::backend::memory::MemoryBackend;
use sealbak::key;
use sealbak::repository::{Options, Repository};

/// An in-memory repository with cheap key derivation,
/// initialized with the password "test".
pub fn memory_repo() -> Result<(Arc<MemoryBackend>, Repository)> {
    memory_repo_with(Options {
        kdf: Some(key::trivial_params()),
        workers: 2,
        ..Options::default()
    })
}

pub fn memory_repo_with(opts: Options) -> Result<(Arc<MemoryBackend>, Repository)> {
    let mem = Arc::new(MemoryBackend::new());
    let repo = Repository::init(mem.clone(), "test", opts)?;
    Ok((mem, repo))
}

pub fn reopen(mem: &Arc<MemoryBackend>) -> Result<Repository> {
    let repo = Repository::open(
        mem.clone(),
        "test",
        Options {
            kdf: Some(key::trivial_params()),
            workers: 2,
            ..Options::default()
        },
    )?;
    repo.load_index()?;
    Ok(repo)
}

pub fn utf8(p: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(p.to_owned()).expect("Test path isn't UTF-8")
}

/// Deterministic pseudo-random bytes from a bog-standard LCG.
pub fn lcg_bytes(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        out.push((seed >> 33) as u8);
    }
    out
}

//! Utilities for reading files into buffers and writing them atomically.

use std::fs::File;
use std::io::prelude::*;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::*;

use crate::counters;

/// A loaded file, either as a buffer (if it's small) or as a memory map.
#[derive(Debug)]
pub enum LoadedFile {
    Buffered(Vec<u8>),
    Mapped(memmap2::Mmap),
}

impl LoadedFile {
    pub fn bytes(&self) -> &[u8] {
        match self {
            LoadedFile::Buffered(vec) => vec,
            LoadedFile::Mapped(map) => map,
        }
    }
}

/// Reads an entire file if it's small enough, memory maps it otherwise.
pub fn read_file(path: &Path) -> Result<Arc<LoadedFile>> {
    const MEGA: u64 = 1024 * 1024;

    let mut fh = File::open(path).with_context(|| format!("Couldn't open {}", path.display()))?;
    let file_length = fh.metadata()?.len();

    let file = if file_length < 10 * MEGA {
        trace!("{} is < 10MB, reading to buffer", path.display());
        let mut buffer = Vec::with_capacity(file_length as usize);
        fh.read_to_end(&mut buffer)?;
        counters::bump(counters::Op::FileToBuffer);
        LoadedFile::Buffered(buffer)
    } else {
        trace!("{} is > 10MB, memory mapping", path.display());
        let mapping = unsafe { memmap2::Mmap::map(&fh)? };
        counters::bump(counters::Op::FileToMmap);
        LoadedFile::Mapped(mapping)
    };

    Ok(Arc::new(file))
}

/// Copies the reader to a new file at `to + ".part"`, then renames to `to`.
///
/// This should guarantee that `to` never contains a partial file.
pub fn safe_copy_to_file<R: Read>(mut from: R, to: &Path) -> Result<()> {
    let mut to_part = to.to_owned().into_os_string();
    to_part.push(".part");
    let to_part = Path::new(&to_part);

    let mut to_fh = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(to_part)
        .with_context(|| format!("Couldn't open {}", to_part.display()))?;

    std::io::copy(&mut from, &mut to_fh)
        .with_context(|| format!("Couldn't write {}", to_part.display()))?;
    drop(from);

    to_fh
        .sync_all()
        .with_context(|| format!("Couldn't sync {}", to_part.display()))?;
    drop(to_fh);

    // Rename to /dest/foo
    std::fs::rename(to_part, to)
        .with_context(|| format!("Couldn't rename {} to {}", to_part.display(), to.display()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn safe_copy() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dst = dir.path().join("out.bin");
        safe_copy_to_file(&b"some bytes"[..], &dst)?;
        assert_eq!(std::fs::read(&dst)?, b"some bytes");
        // No .part droppings left behind.
        assert!(!dir.path().join("out.bin.part").exists());
        Ok(())
    }
}

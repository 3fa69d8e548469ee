//! A backend that stores everything as handle-addressed buffers.
//!
//! Great for testing

use std::io::{self, prelude::*};
use std::sync::{Arc, RwLock};

use anyhow::{Result, bail, ensure};
use rustc_hash::FxHashMap;

use super::{Backend, FileType, Handle};
use crate::error::Error;

#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<FxHashMap<Handle, Arc<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip one byte of a stored object. For tamper tests.
    pub fn corrupt(&self, which: &Handle, offset: usize) -> Result<()> {
        let mut objects = self.objects.write().unwrap();
        let buf = objects
            .get_mut(which)
            .ok_or_else(|| Error::BackendNotFound(which.to_string()))?;
        ensure!(offset < buf.len(), "Corruption offset past object end");
        Arc::make_mut(buf)[offset] ^= 0xa5;
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn save(&self, to: &Handle, len: u64, from: &mut (dyn Read + Send)) -> Result<()> {
        let mut buf = Vec::with_capacity(len as usize);
        from.read_to_end(&mut buf)?;

        let mut objects = self.objects.write().unwrap();
        ensure!(
            !objects.contains_key(to),
            Error::BackendAlreadyExists(to.to_string())
        );
        objects.insert(to.clone(), Arc::new(buf));
        Ok(())
    }

    fn load(&self, from: &Handle, offset: u64, length: u32) -> Result<Box<dyn Read + Send + '_>> {
        let buf: Arc<Vec<u8>> = {
            let objects = self.objects.read().unwrap();
            match objects.get(from) {
                Some(b) => b.clone(),
                None => bail!(Error::BackendNotFound(from.to_string())),
            }
        };
        let start = (offset as usize).min(buf.len());
        let end = match length {
            0 => buf.len(),
            len => (start + len as usize).min(buf.len()),
        };
        Ok(Box::new(io::Cursor::new(buf[start..end].to_vec())))
    }

    fn stat(&self, of: &Handle) -> Result<u64> {
        let objects = self.objects.read().unwrap();
        match objects.get(of) {
            Some(b) => Ok(b.len() as u64),
            None => bail!(Error::BackendNotFound(of.to_string())),
        }
    }

    fn test(&self, of: &Handle) -> Result<bool> {
        Ok(self.objects.read().unwrap().contains_key(of))
    }

    fn remove(&self, which: &Handle) -> Result<()> {
        match self.objects.write().unwrap().remove(which) {
            Some(_) => Ok(()),
            None => bail!(Error::BackendNotFound(which.to_string())),
        }
    }

    fn list(&self, kind: FileType) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .unwrap()
            .keys()
            .filter(|h| h.kind == kind)
            .map(|h| h.name.clone())
            .collect())
    }

    fn delete(&self) -> Result<()> {
        self.objects.write().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{ALL_FILE_TYPES, load_all, load_range, save_bytes};

    #[test]
    fn round_trip() -> Result<()> {
        let mem = MemoryBackend::new();
        let handle = Handle::new(FileType::Data, "aa".repeat(32));

        save_bytes(&mem, &handle, b"0123456789")?;
        assert_eq!(mem.stat(&handle)?, 10);
        assert_eq!(load_all(&mem, &handle)?, b"0123456789");
        assert_eq!(load_range(&mem, &handle, 4, 3)?, b"456");

        // Offset past the end: empty stream.
        let mut buf = Vec::new();
        mem.load(&handle, 1000, 4)?.read_to_end(&mut buf)?;
        assert!(buf.is_empty());

        assert!(save_bytes(&mem, &handle, b"clobber").is_err());

        for kind in ALL_FILE_TYPES {
            let expected = if kind == FileType::Data { 1 } else { 0 };
            assert_eq!(mem.list(kind)?.len(), expected);
        }

        mem.delete()?;
        assert!(!mem.test(&handle)?);
        Ok(())
    }

    #[test]
    fn corruption() -> Result<()> {
        let mem = MemoryBackend::new();
        let handle = Handle::new(FileType::Data, "bb".repeat(32));
        save_bytes(&mem, &handle, b"pristine")?;
        mem.corrupt(&handle, 3)?;
        assert_ne!(load_all(&mem, &handle)?, b"pristine");
        Ok(())
    }
}

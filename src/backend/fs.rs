//! Repositories on the local filesystem.

use std::fs::{self, File};
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use tracing::*;

use super::{ALL_FILE_TYPES, Backend, FileType, Handle, Layout};
use crate::error::Error;
use crate::file_util;

pub struct FilesystemBackend {
    base_directory: PathBuf,
    layout: Layout,
}

impl FilesystemBackend {
    pub fn initialize(repository: &Path) -> Result<()> {
        if let Ok(mut entries) = fs::read_dir(repository) {
            ensure!(
                entries.next().is_none(),
                Error::BackendAlreadyExists(repository.display().to_string())
            );
        }

        fs::create_dir_all(repository)
            .with_context(|| format!("Couldn't create {}", repository.display()))?;
        for kind in ALL_FILE_TYPES {
            if kind == FileType::Config {
                continue;
            }
            fs::create_dir(repository.join(kind.dirname()))?;
        }
        for b in 0..=255 {
            fs::create_dir(repository.join(format!("data/{b:02x}")))?;
        }
        Ok(())
    }

    /// Opens the directory, probing whether packs are bucketed into 256
    /// subdirectories or live directly in `data/`.
    pub fn open(repository: &Path) -> Result<Self> {
        let base_directory = PathBuf::from(repository);
        ensure!(
            base_directory.join("data").is_dir(),
            "The directory {} doesn't look like a repository (no data/)",
            repository.display()
        );

        let layout = if base_directory.join("data/00").is_dir() {
            Layout::Default
        } else {
            debug!("{}: flat data/ layout", repository.display());
            Layout::Flat
        };

        Ok(Self {
            base_directory,
            layout,
        })
    }

    fn path_of(&self, handle: &Handle) -> PathBuf {
        self.base_directory
            .join(self.layout.path(handle).as_std_path())
    }
}

impl Backend for FilesystemBackend {
    fn save(&self, to: &Handle, _len: u64, from: &mut (dyn Read + Send)) -> Result<()> {
        let to_path = self.path_of(to);
        ensure!(
            !to_path.exists(),
            Error::BackendAlreadyExists(to.to_string())
        );
        file_util::safe_copy_to_file(from, &to_path)
            .with_context(|| format!("Couldn't save {to}"))
    }

    fn load(&self, from: &Handle, offset: u64, length: u32) -> Result<Box<dyn Read + Send + '_>> {
        let from_path = self.path_of(from);
        let mut fh = match File::open(&from_path) {
            Ok(fh) => fh,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                bail!(Error::BackendNotFound(from.to_string()))
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Couldn't open {}", from_path.display()));
            }
        };
        // Seeking past EOF is fine; reads there just return 0 bytes.
        fh.seek(io::SeekFrom::Start(offset))?;
        Ok(match length {
            0 => Box::new(fh),
            len => Box::new(fh.take(len as u64)),
        })
    }

    fn stat(&self, of: &Handle) -> Result<u64> {
        match fs::metadata(self.path_of(of)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                bail!(Error::BackendNotFound(of.to_string()))
            }
            Err(e) => Err(e).with_context(|| format!("Couldn't stat {of}")),
        }
    }

    fn test(&self, of: &Handle) -> Result<bool> {
        Ok(self.path_of(of).is_file())
    }

    fn remove(&self, which: &Handle) -> Result<()> {
        match fs::remove_file(self.path_of(which)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                bail!(Error::BackendNotFound(which.to_string()))
            }
            Err(e) => Err(e).with_context(|| format!("Couldn't remove {which}")),
        }
    }

    fn list(&self, kind: FileType) -> Result<Vec<String>> {
        if kind == FileType::Config {
            return Ok(if self.base_directory.join("config").is_file() {
                vec![String::from("config")]
            } else {
                vec![]
            });
        }

        let mut names = Vec::new();
        let top = self.base_directory.join(kind.dirname());
        if kind == FileType::Data && self.layout == Layout::Default {
            for bucket in fs::read_dir(&top)? {
                let bucket = bucket?.path();
                if bucket.is_dir() {
                    list_files_into(&bucket, &mut names)?;
                }
            }
        } else {
            list_files_into(&top, &mut names)?;
        }
        Ok(names)
    }

    fn delete(&self) -> Result<()> {
        for kind in ALL_FILE_TYPES {
            for name in self.list(kind)? {
                self.remove(&Handle::new(kind, name))?;
            }
        }
        Ok(())
    }
}

fn list_files_into(dir: &Path, names: &mut Vec<String>) -> Result<()> {
    for entry in
        fs::read_dir(dir).with_context(|| format!("Couldn't list {}", dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Half-written temporaries aren't objects.
            if name.ends_with(".part") {
                continue;
            }
            names.push(name.into_owned());
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{load_all, load_range, save_bytes};

    fn testbed() -> Result<(tempfile::TempDir, FilesystemBackend)> {
        let dir = tempfile::tempdir()?;
        FilesystemBackend::initialize(dir.path())?;
        let fs = FilesystemBackend::open(dir.path())?;
        Ok((dir, fs))
    }

    #[test]
    fn round_trip() -> Result<()> {
        let (_dir, fs) = testbed()?;
        let handle = Handle::new(FileType::Index, "ab".repeat(32));

        assert!(!fs.test(&handle)?);
        save_bytes(&fs, &handle, b"hello backend")?;
        assert!(fs.test(&handle)?);
        assert_eq!(fs.stat(&handle)?, 13);
        assert_eq!(load_all(&fs, &handle)?, b"hello backend");
        assert_eq!(load_range(&fs, &handle, 6, 7)?, b"backend");

        assert_eq!(fs.list(FileType::Index)?, vec!["ab".repeat(32)]);
        fs.remove(&handle)?;
        assert!(!fs.test(&handle)?);
        Ok(())
    }

    #[test]
    fn no_overwrites() -> Result<()> {
        let (_dir, fs) = testbed()?;
        let handle = Handle::new(FileType::Snapshot, "cd".repeat(32));
        save_bytes(&fs, &handle, b"first")?;
        let refused = save_bytes(&fs, &handle, b"second");
        assert!(matches!(
            refused.unwrap_err().downcast_ref::<Error>(),
            Some(Error::BackendAlreadyExists(_))
        ));
        assert_eq!(load_all(&fs, &handle)?, b"first");
        Ok(())
    }

    #[test]
    fn read_past_the_end() -> Result<()> {
        let (_dir, fs) = testbed()?;
        let handle = Handle::new(FileType::Key, "ee".repeat(32));
        save_bytes(&fs, &handle, b"short")?;
        let mut buf = Vec::new();
        fs.load(&handle, 100, 0)?.read_to_end(&mut buf)?;
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn packs_are_bucketed() -> Result<()> {
        let (dir, fs) = testbed()?;
        let name = format!("cafe{}", "00".repeat(30));
        save_bytes(&fs, &Handle::new(FileType::Data, name.clone()), b"pack")?;
        assert!(dir.path().join("data/ca").join(&name).is_file());
        assert_eq!(fs.list(FileType::Data)?, vec![name]);
        Ok(())
    }

    #[test]
    fn flat_layout_probe() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for d in ["data", "snapshots", "index", "keys", "locks"] {
            fs::create_dir(dir.path().join(d))?;
        }
        let name = format!("cafe{}", "00".repeat(30));
        fs::write(dir.path().join("data").join(&name), b"pack")?;

        let flat = FilesystemBackend::open(dir.path())?;
        assert_eq!(flat.layout, Layout::Flat);
        assert_eq!(flat.list(FileType::Data)?, vec![name.clone()]);
        assert_eq!(load_all(&flat, &Handle::new(FileType::Data, name))?, b"pack");
        Ok(())
    }
}

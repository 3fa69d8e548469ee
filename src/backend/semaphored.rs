//! Cap how many [`Backend`] operations run at once.
//!
//! Backends that talk to the network want a ceiling on concurrent
//! connections; a counting semaphore around every method gives us one
//! without the backends themselves having to care.

use std::io::{self, prelude::*};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use atomic_wait::{wait, wake_one};

use super::{Backend, FileType, Handle};

/// A futex-backed counting semaphore, since the stdlib still doesn't
/// ship one. The atomic holds the number of free slots.
struct Semaphore {
    free: AtomicU32,
}

/// One held slot. Give it back by dropping it.
struct Token<'a> {
    free: &'a AtomicU32,
}

impl Semaphore {
    fn new(slots: u32) -> Self {
        assert!(slots > 0);
        Self {
            free: AtomicU32::new(slots),
        }
    }

    /// Takes a slot, sleeping on the futex while none are free.
    fn acquire(&self) -> Token<'_> {
        // A weak CAS in a retry loop is all we need - one spurious
        // failure is nothing next to the I/O we're about to do.
        let mut seen = 1;
        loop {
            match self
                .free
                .compare_exchange_weak(seen, seen - 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return Token { free: &self.free },
                Err(0) => {
                    // All slots taken; park until a Token drop bumps the
                    // count. Several sleepers can race for the same slot,
                    // but the losers just fail the CAS and park again.
                    wait(&self.free, 0);
                    seen = 1;
                }
                Err(actual) => seen = actual,
            }
        }
    }

    #[cfg(test)]
    fn available(&self) -> u32 {
        self.free.load(Ordering::SeqCst)
    }
}

impl Drop for Token<'_> {
    fn drop(&mut self) {
        // Post the slot; a zero count beforehand means someone may be
        // parked waiting for it.
        if self.free.fetch_add(1, Ordering::Release) == 0 {
            wake_one(self.free);
        }
    }
}

/// Holds its semaphore token until the stream is dropped,
/// so a slow reader keeps counting against the connection cap.
struct SemaphoredReader<'a> {
    inner: Box<dyn Read + Send + 'a>,
    _token: Token<'a>,
}

impl Read for SemaphoredReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

pub struct Semaphored<B> {
    inner: B,
    limiter: Semaphore,
}

impl<B: Backend> Semaphored<B> {
    pub fn new(inner: B, concurrency: u32) -> Self {
        Self {
            inner,
            limiter: Semaphore::new(concurrency),
        }
    }
}

impl<B: Backend> Backend for Semaphored<B> {
    fn save(&self, to: &Handle, len: u64, from: &mut (dyn Read + Send)) -> Result<()> {
        let _token = self.limiter.acquire();
        self.inner.save(to, len, from)
    }

    fn load(&self, from: &Handle, offset: u64, length: u32) -> Result<Box<dyn Read + Send + '_>> {
        let token = self.limiter.acquire();
        let inner = self.inner.load(from, offset, length)?;
        Ok(Box::new(SemaphoredReader {
            inner,
            _token: token,
        }))
    }

    fn stat(&self, of: &Handle) -> Result<u64> {
        let _token = self.limiter.acquire();
        self.inner.stat(of)
    }

    fn test(&self, of: &Handle) -> Result<bool> {
        let _token = self.limiter.acquire();
        self.inner.test(of)
    }

    fn remove(&self, which: &Handle) -> Result<()> {
        let _token = self.limiter.acquire();
        self.inner.remove(which)
    }

    fn list(&self, kind: FileType) -> Result<Vec<String>> {
        let _token = self.limiter.acquire();
        self.inner.list(kind)
    }

    fn delete(&self) -> Result<()> {
        let _token = self.limiter.acquire();
        self.inner.delete()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::{load_all, save_bytes};

    #[test]
    fn tokens_outlive_streams() -> Result<()> {
        let sem = Semaphored::new(MemoryBackend::new(), 1);
        let handle = Handle::new(FileType::Index, "ab".repeat(32));
        save_bytes(&sem, &handle, b"some bytes")?;

        // Holding an open reader consumes the only token...
        let reader = sem.load(&handle, 0, 0)?;
        assert_eq!(sem.limiter.available(), 0);
        // ...and dropping it gives the token back.
        drop(reader);
        assert_eq!(sem.limiter.available(), 1);

        assert_eq!(load_all(&sem, &handle)?, b"some bytes");
        Ok(())
    }

    #[test]
    fn contention() -> Result<()> {
        let sem = Semaphored::new(MemoryBackend::new(), 2);
        let handle = Handle::new(FileType::Data, "cd".repeat(32));
        save_bytes(&sem, &handle, &vec![42u8; 1024])?;

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        let loaded = load_all(&sem, &handle).unwrap();
                        assert_eq!(loaded.len(), 1024);
                    }
                });
            }
        });
        assert_eq!(sem.limiter.available(), 2);
        Ok(())
    }

    #[test]
    fn waiters_wake_up() {
        let sem = Semaphore::new(1);
        let first = sem.acquire();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                // Blocks until `first` drops below.
                let _second = sem.acquire();
            });
            std::thread::sleep(std::time::Duration::from_millis(10));
            drop(first);
            waiter.join().unwrap();
        });
        assert_eq!(sem.available(), 1);
    }
}

//! Atomic counters and a periodic reporter thread,
//! so long-running operations can tell somebody how it's going.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

/// Counts bytes as they stream through.
pub struct AtomicCountRead<'a, R> {
    inner: R,
    count: &'a AtomicU64,
}

impl<'a, R: Read> AtomicCountRead<'a, R> {
    pub fn new(inner: R, count: &'a AtomicU64) -> Self {
        Self { inner, count }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for AtomicCountRead<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let num_read = self.inner.read(buf)?;
        self.count.fetch_add(num_read as u64, Ordering::Relaxed);
        Ok(num_read)
    }
}

pub struct AtomicCountWrite<'a, W> {
    inner: W,
    count: &'a AtomicU64,
}

impl<'a, W: Write> AtomicCountWrite<'a, W> {
    pub fn new(inner: W, count: &'a AtomicU64) -> Self {
        Self { inner, count }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for AtomicCountWrite<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let num_written = self.inner.write(buf)?;
        self.count.fetch_add(num_written as u64, Ordering::Relaxed);
        Ok(num_written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// What a backup has done so far. All loads/stores are relaxed;
/// these are eventually-consistent progress numbers, nothing more.
#[derive(Debug, Default)]
pub struct BackupStatistics {
    pub files: AtomicU64,
    pub directories: AtomicU64,
    pub chunk_bytes: AtomicU64,
    pub tree_bytes: AtomicU64,
    pub reused_bytes: AtomicU64,
}

#[derive(Debug, Default)]
pub struct RestoreStatistics {
    pub files: AtomicU64,
    pub directories: AtomicU64,
    pub symlinks: AtomicU64,
    pub bytes_written: AtomicU64,
}

/// Calls a function at a fixed cadence (plus once at shutdown, with the
/// final numbers) until joined.
pub struct ProgressThread {
    handle: JoinHandle<()>,
    stop: Sender<()>,
}

impl ProgressThread {
    pub fn spawn<F>(period: Duration, mut f: F) -> Self
    where
        F: FnMut(usize) + Send + 'static,
    {
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handle = std::thread::spawn(move || {
            let mut i = 0;
            loop {
                f(i);
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => i += 1,
                    // Stopped (or the sender vanished): one last report.
                    _ => {
                        f(i + 1);
                        return;
                    }
                }
            }
        });
        Self { handle, stop }
    }

    pub fn join(self) {
        let _ = self.stop.send(());
        self.handle.join().expect("Couldn't join progress thread");
    }
}

pub fn spinner(i: usize) -> char {
    match i % 4 {
        0 => '|',
        1 => '/',
        2 => '-',
        _ => '\\',
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn counting_reader() -> io::Result<()> {
        let count = AtomicU64::new(0);
        let mut reader = AtomicCountRead::new(&b"0123456789"[..], &count);
        io::copy(&mut reader, &mut io::sink())?;
        assert_eq!(count.load(Ordering::SeqCst), 10);
        Ok(())
    }

    #[test]
    fn counting_writer() -> io::Result<()> {
        let count = AtomicU64::new(0);
        let mut writer = AtomicCountWrite::new(io::sink(), &count);
        writer.write_all(b"01234")?;
        assert_eq!(count.load(Ordering::SeqCst), 5);
        Ok(())
    }

    #[test]
    fn progress_thread_reports_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = ticks.clone();
        let thread = ProgressThread::spawn(Duration::from_millis(5), move |_i| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(30));
        thread.join();
        // At least the initial report and the final one.
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }
}

//! Advisory repository locks.
//!
//! A lock is just another encrypted JSON object; holding one means
//! keeping it fresh. Readers take shared locks, anything that deletes
//! takes an exclusive one. Purely advisory - a misbehaving client can
//! ignore them, and stale ones get reaped on TTL.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{RecvTimeoutError, Sender};
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::backend::{self, Backend, FileType, Handle};
use crate::counters;
use crate::crypto::MasterKeys;
use crate::error::Error;
use crate::hashing::ObjectId;
use crate::ident;

/// Locks older than this are presumed dead.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Held locks are rewritten this often, well inside the TTL.
const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub time: jiff::Timestamp,
    pub exclusive: bool,
    pub hostname: String,
    pub username: String,
    pub pid: u32,
}

impl Lock {
    fn fresh(exclusive: bool) -> Self {
        Self {
            time: jiff::Timestamp::now(),
            exclusive,
            hostname: ident::hostname(),
            username: ident::username(),
            pid: std::process::id(),
        }
    }

    /// Can `other` coexist with a lock of our exclusivity?
    fn conflicts_with(&self, exclusive: bool) -> bool {
        self.exclusive || exclusive
    }

    fn is_stale(&self, ttl: Duration) -> bool {
        // A lock from the future (somebody's clock is wrong) comes out
        // negative here and is left alone until the TTL passes for real.
        let expired = match jiff::Timestamp::now().since(self.time) {
            Ok(span) => span.get_seconds() >= ttl.as_secs() as i64,
            Err(_) => false,
        };
        if expired {
            return true;
        }
        // Within TTL, a same-host lock whose process is gone is also
        // stale. The pid probe is best-effort and host-local only.
        self.hostname == ident::hostname() && !pid_alive(self.pid)
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    match rustix::process::Pid::from_raw(pid as i32) {
        // Signal 0 semantics: ESRCH means gone, EPERM means alive but
        // not ours, success means alive.
        Some(pid) => match rustix::process::test_kill_process(pid) {
            Ok(()) => true,
            Err(rustix::io::Errno::SRCH) => false,
            Err(_) => true,
        },
        None => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Can't probe; the TTL has to do.
    true
}

fn write_lock_object(backend: &dyn Backend, keys: &MasterKeys, lock: &Lock) -> Result<ObjectId> {
    let plaintext = serde_json::to_vec(lock)?;
    let id = ObjectId::hash(&plaintext);
    let sealed = keys.encrypt(&plaintext);
    backend::save_bytes(backend, &Handle::from_id(FileType::Lock, &id), &sealed)?;
    Ok(id)
}

fn read_lock_object(backend: &dyn Backend, keys: &MasterKeys, id: &ObjectId) -> Result<Lock> {
    let sealed = backend::load_all(backend, &Handle::from_id(FileType::Lock, id))?;
    let plaintext = keys.decrypt(&sealed)?;
    serde_json::from_slice(&plaintext).with_context(|| format!("Lock {id} isn't valid JSON"))
}

/// Every lock currently in the backend, with stale ones reaped along
/// the way.
fn live_locks(
    backend: &dyn Backend,
    keys: &MasterKeys,
    ttl: Duration,
) -> Result<Vec<(ObjectId, Lock)>> {
    let mut live = Vec::new();
    for name in backend.list(FileType::Lock)? {
        let id: ObjectId = name.parse()?;
        let lock = match read_lock_object(backend, keys, &id) {
            Ok(lock) => lock,
            Err(e) => {
                warn!("Ignoring unreadable lock {name}: {e:#}");
                continue;
            }
        };
        if lock.is_stale(ttl) {
            info!(
                "Reaping stale lock {} ({}@{}, pid {})",
                id.short_name(),
                lock.username,
                lock.hostname,
                lock.pid
            );
            counters::bump(counters::Op::StaleLockReaped);
            // Somebody else may reap it first; that's fine.
            let _ = backend.remove(&Handle::from_id(FileType::Lock, &id));
            continue;
        }
        live.push((id, lock));
    }
    Ok(live)
}

/// A held lock: refreshed on a timer, removed on drop.
pub struct LockGuard {
    backend: Arc<dyn Backend>,
    current_id: Arc<Mutex<ObjectId>>,
    stop: Option<Sender<()>>,
    refresher: Option<JoinHandle<()>>,
}

impl LockGuard {
    /// Releases the lock, reporting any trouble doing so.
    pub fn unlock(mut self) -> Result<()> {
        self.shut_down()
            .context("Couldn't remove our lock object")
    }

    fn shut_down(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(refresher) = self.refresher.take() {
            let _ = refresher.join();
        }
        let id = *self.current_id.lock().unwrap();
        self.backend
            .remove(&Handle::from_id(FileType::Lock, &id))?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.stop.is_some() {
            if let Err(e) = self.shut_down() {
                warn!("Couldn't clean up lock: {e:#}");
            }
        }
    }
}

/// Takes a shared or exclusive lock on the repository.
///
/// Fails with [`Error::LockConflict`] if anyone holds an incompatible
/// lock. The post-write recheck closes the obvious race: if two
/// writers collide, the smaller storage name wins and the loser backs
/// out.
pub fn lock(
    backend: Arc<dyn Backend>,
    keys: Arc<MasterKeys>,
    exclusive: bool,
) -> Result<LockGuard> {
    lock_with_ttl(backend, keys, exclusive, DEFAULT_TTL)
}

pub fn lock_with_ttl(
    backend: Arc<dyn Backend>,
    keys: Arc<MasterKeys>,
    exclusive: bool,
    ttl: Duration,
) -> Result<LockGuard> {
    for (_, other) in live_locks(&*backend, &keys, ttl)? {
        if other.conflicts_with(exclusive) {
            bail!(Error::LockConflict(describe(&other)));
        }
    }

    let own = Lock::fresh(exclusive);
    let own_id = write_lock_object(&*backend, &keys, &own)?;
    debug!(
        "Took {} lock {}",
        if exclusive { "exclusive" } else { "shared" },
        own_id.short_name()
    );

    // Recheck: somebody may have written a conflicting lock while we
    // were writing ours.
    for (other_id, other) in live_locks(&*backend, &keys, ttl)? {
        if other_id == own_id || !other.conflicts_with(exclusive) {
            continue;
        }
        // Deterministic tie-break: the smaller name wins.
        if own_id < other_id {
            continue;
        }
        let _ = backend.remove(&Handle::from_id(FileType::Lock, &own_id));
        bail!(Error::LockConflict(describe(&other)));
    }

    // Keep the lock fresh while held.
    let current_id = Arc::new(Mutex::new(own_id));
    let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let refresher = {
        let backend = backend.clone();
        let keys = keys.clone();
        let current_id = current_id.clone();
        std::thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(REFRESH_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = refresh(&*backend, &keys, &current_id, exclusive) {
                            warn!("Couldn't refresh lock: {e:#}");
                        }
                    }
                    _ => return,
                }
            }
        })
    };

    Ok(LockGuard {
        backend,
        current_id,
        stop: Some(stop),
        refresher: Some(refresher),
    })
}

fn refresh(
    backend: &dyn Backend,
    keys: &MasterKeys,
    current_id: &Mutex<ObjectId>,
    exclusive: bool,
) -> Result<()> {
    let fresh_id = write_lock_object(backend, keys, &Lock::fresh(exclusive))?;
    let old = {
        let mut id = current_id.lock().unwrap();
        std::mem::replace(&mut *id, fresh_id)
    };
    trace!("Refreshed lock {} -> {}", old.short_name(), fresh_id.short_name());
    let _ = backend.remove(&Handle::from_id(FileType::Lock, &old));
    Ok(())
}

fn describe(lock: &Lock) -> String {
    format!(
        "{} lock held by {}@{} (pid {}) since {}",
        if lock.exclusive { "exclusive" } else { "shared" },
        lock.username,
        lock.hostname,
        lock.pid,
        lock.time
    )
}

//! Break a repository in controlled ways and make sure the checker
//! notices - and says so exactly once, naming the right object.

mod common;

use anyhow::Result;
use common::*;

use sealbak::archiver::Archiver;
use sealbak::backend::{Backend, FileType, Handle};
use sealbak::checker::Checker;
use sealbak::hashing::ObjectId;
use sealbak::pool;

fn backed_up() -> Result<(std::sync::Arc<sealbak::backend::memory::MemoryBackend>, ObjectId)> {
    let (mem, repo) = memory_repo()?;
    let src = tempfile::tempdir()?;
    std::fs::write(src.path().join("hello.txt"), b"Hello, deduplicated world\n")?;
    Archiver::new(&repo).snapshot(&[utf8(src.path())])?;

    let packs = mem.list(FileType::Data)?;
    assert_eq!(packs.len(), 1);
    let pack_id = packs[0].parse()?;
    Ok((mem, pack_id))
}

#[test]
fn tampered_pack_is_caught_by_read_data() -> Result<()> {
    let (mem, pack_id) = backed_up()?;

    // Flip one byte in the blob (ciphertext) region.
    mem.corrupt(&Handle::from_id(FileType::Data, &pack_id), 20)?;

    let repo = reopen(&mem)?;
    let checker = Checker::new(&repo);

    // The shallow phases don't download, so they're still happy...
    let (_cancel, done) = pool::cancellation();
    let (err_tx, err_rx) = crossbeam_channel::unbounded();
    checker.check_packs(err_tx, done.clone())?;
    assert_eq!(err_rx.try_iter().count(), 0);

    // ...but the deep read isn't.
    let (err_tx, err_rx) = crossbeam_channel::unbounded();
    checker.read_data(err_tx, done)?;
    let errors: Vec<_> = err_rx.try_iter().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].pack, pack_id);
    Ok(())
}

#[test]
fn missing_pack_is_caught_by_check_packs() -> Result<()> {
    let (mem, pack_id) = backed_up()?;

    mem.remove(&Handle::from_id(FileType::Data, &pack_id))?;

    let repo = reopen(&mem)?;
    let checker = Checker::new(&repo);
    let (_cancel, done) = pool::cancellation();
    let (err_tx, err_rx) = crossbeam_channel::unbounded();
    checker.check_packs(err_tx, done)?;

    let errors: Vec<_> = err_rx.try_iter().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id, pack_id);
    assert!(!errors[0].orphaned);
    Ok(())
}

#[test]
fn unreferenced_pack_is_an_orphan() -> Result<()> {
    let (mem, pack_id) = backed_up()?;

    // Delete the index instead: the pack is fine, nobody knows it.
    for name in mem.list(FileType::Index)? {
        mem.remove(&Handle::new(FileType::Index, name))?;
    }

    let repo = reopen(&mem)?;
    let checker = Checker::new(&repo);
    let (_cancel, done) = pool::cancellation();
    let (err_tx, err_rx) = crossbeam_channel::unbounded();
    checker.check_packs(err_tx, done)?;

    let errors: Vec<_> = err_rx.try_iter().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].id, pack_id);
    assert!(errors[0].orphaned);
    Ok(())
}

#[test]
fn lost_index_breaks_structure_too() -> Result<()> {
    let (mem, _pack_id) = backed_up()?;

    for name in mem.list(FileType::Index)? {
        mem.remove(&Handle::new(FileType::Index, name))?;
    }

    // With no index, the snapshot's root tree can't even be loaded.
    let repo = reopen(&mem)?;
    let checker = Checker::new(&repo);
    let (_cancel, done) = pool::cancellation();
    let (err_tx, err_rx) = crossbeam_channel::unbounded();
    checker.check_structure(err_tx, done)?;

    let errors: Vec<_> = err_rx.try_iter().collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].detail.contains("couldn't load"));
    Ok(())
}

#[test]
fn healthy_repository_passes_every_phase() -> Result<()> {
    let (mem, _pack_id) = backed_up()?;

    let repo = reopen(&mem)?;
    let checker = Checker::new(&repo);
    let (_cancel, done) = pool::cancellation();

    let (err_tx, err_rx) = crossbeam_channel::unbounded();
    checker.check_packs(err_tx, done.clone())?;
    assert_eq!(err_rx.try_iter().count(), 0);

    let (err_tx, err_rx) = crossbeam_channel::unbounded();
    checker.check_structure(err_tx, done.clone())?;
    assert_eq!(err_rx.try_iter().count(), 0);

    let (err_tx, err_rx) = crossbeam_channel::unbounded();
    checker.read_data(err_tx, done)?;
    assert_eq!(err_rx.try_iter().count(), 0);
    Ok(())
}

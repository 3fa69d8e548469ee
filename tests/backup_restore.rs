//! End to end: archive directories into an in-memory repository,
//! deduplicate on repeat runs, and restore byte-for-byte.

mod common;

use anyhow::Result;
use common::*;

use sealbak::archiver::Archiver;
use sealbak::backend::{Backend as _, FileType};
use sealbak::hashing::ObjectId;
use sealbak::pack::{self, BlobType};
use sealbak::restorer::Restorer;
use sealbak::snapshot;
use sealbak::tree;

const HELLO: &[u8] = b"Hello, deduplicated world\n";

#[test]
fn single_file_round_trip() -> Result<()> {
    let (mem, repo) = memory_repo()?;

    let src = tempfile::tempdir()?;
    std::fs::write(src.path().join("hello.txt"), HELLO)?;

    let (snap_id, snap) = Archiver::new(&repo).snapshot(&[utf8(src.path())])?;

    // Exactly one pack, holding one data blob and one tree blob.
    let packs = mem.list(FileType::Data)?;
    assert_eq!(packs.len(), 1);
    let blobs = pack::read_header(&*mem, repo.keys(), &packs[0].parse()?)?;
    assert_eq!(blobs.len(), 2);
    assert_eq!(
        blobs.iter().filter(|b| b.kind == BlobType::Data).count(),
        1
    );
    assert_eq!(
        blobs.iter().filter(|b| b.kind == BlobType::Tree).count(),
        1
    );

    // The snapshot's tree resolves to one file node whose single chunk
    // is the hash of the file's bytes.
    let root = tree::load(&repo, &snap.tree)?;
    assert_eq!(root.nodes.len(), 1);
    let node = &root.nodes[0];
    assert_eq!(node.name, "hello.txt");
    assert_eq!(node.kind, tree::NodeKind::File);
    assert_eq!(node.content, Some(vec![ObjectId::hash(HELLO)]));

    // And it's all still there after reopening from the backend alone.
    let reopened = reopen(&mem)?;
    let found = snapshot::load(&reopened, &snap_id)?;
    assert_eq!(found, snap);
    Ok(())
}

#[test]
fn second_snapshot_reuses_all_blobs() -> Result<()> {
    let (mem, repo) = memory_repo()?;

    let src = tempfile::tempdir()?;
    std::fs::write(src.path().join("hello.txt"), HELLO)?;
    let paths = [utf8(src.path())];

    let (first_id, first) = Archiver::new(&repo).snapshot(&paths)?;
    let packs_before = mem.list(FileType::Data)?.len();
    let indexes_before = mem.list(FileType::Index)?.len();

    let (second_id, second) = Archiver::new(&repo).snapshot(&paths)?;

    // No new packs: every data chunk AND every tree was already there.
    assert_eq!(mem.list(FileType::Data)?.len(), packs_before);
    // And with nothing new packed, no new index either.
    assert_eq!(mem.list(FileType::Index)?.len(), indexes_before);

    // Same tree, different snapshot.
    assert_eq!(second.tree, first.tree);
    assert_ne!(second_id, first_id);
    assert_eq!(snapshot::load_chronologically(&repo)?.len(), 2);
    Ok(())
}

#[test]
fn multi_chunk_files_restore_intact() -> Result<()> {
    let (_mem, repo) = memory_repo()?;

    let src = tempfile::tempdir()?;
    let big = lcg_bytes(5 * 1024 * 1024, 42);
    std::fs::write(src.path().join("big.bin"), &big)?;
    std::fs::write(src.path().join("small.txt"), b"wee\n")?;

    let (_, snap) = Archiver::new(&repo).snapshot(&[utf8(src.path())])?;

    // The big file really did get cut up.
    let root = tree::load(&repo, &snap.tree)?;
    let big_node = root.nodes.iter().find(|n| n.name == "big.bin").unwrap();
    assert!(big_node.content.as_ref().unwrap().len() > 1);

    let dst = tempfile::tempdir()?;
    let out = utf8(dst.path()).join("out");
    Restorer::new(&repo).restore(&snap, &out)?;

    assert_eq!(std::fs::read(out.join("big.bin"))?, big);
    assert_eq!(std::fs::read(out.join("small.txt"))?, b"wee\n");
    Ok(())
}

#[test]
fn edited_file_shares_unchanged_chunks() -> Result<()> {
    let (mem, repo) = memory_repo()?;

    let src = tempfile::tempdir()?;
    let mut contents = lcg_bytes(5 * 1024 * 1024, 7);
    std::fs::write(src.path().join("evolving.bin"), &contents)?;
    let (_, first) = Archiver::new(&repo).snapshot(&[utf8(src.path())])?;

    // Append a little; leading chunks shouldn't change.
    contents.extend_from_slice(b"and then some");
    std::fs::write(src.path().join("evolving.bin"), &contents)?;
    let (_, second) = Archiver::new(&repo).snapshot(&[utf8(src.path())])?;

    let chunks_of = |snap: &snapshot::Snapshot| -> Result<Vec<ObjectId>> {
        let root = tree::load(&repo, &snap.tree)?;
        Ok(root.nodes[0].content.clone().unwrap())
    };
    let first_chunks = chunks_of(&first)?;
    let second_chunks = chunks_of(&second)?;
    assert_ne!(first_chunks, second_chunks);
    assert!(second_chunks.len() > 1);
    // All but the tail comes from the first run.
    assert_eq!(
        first_chunks[..first_chunks.len() - 1],
        second_chunks[..first_chunks.len() - 1]
    );

    // Restore the second snapshot and make sure the stitching holds.
    let dst = tempfile::tempdir()?;
    let out = utf8(dst.path()).join("out");
    Restorer::new(&repo).restore(&second, &out)?;
    assert_eq!(std::fs::read(out.join("evolving.bin"))?, contents);

    drop(mem);
    Ok(())
}

#[test]
fn snapshots_found_by_prefix() -> Result<()> {
    let (mem, repo) = memory_repo()?;
    let src = tempfile::tempdir()?;
    std::fs::write(src.path().join("f"), b"f")?;
    let (snap_id, snap) = Archiver::new(&repo).snapshot(&[utf8(src.path())])?;

    let prefix = &snap_id.to_string()[..8];
    assert_eq!(repo.find_snapshot(prefix)?, snap);

    // Nonsense prefixes don't resolve.
    assert!(repo.find_snapshot("ffffffff").is_err() || snap_id.to_string().starts_with("ffffffff"));
    drop(mem);
    Ok(())
}

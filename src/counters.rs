//! Performance counters: Count how many times we do various important operations.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use enum_map::{Enum, EnumMap};
use tracing::*;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    IndexLoad,
    BlobCacheHit,
    BlobCacheMiss,
    BlobCacheEviction,
    DedupSkippedBlob,
    PackFinalized,
    FileToBuffer,
    FileToMmap,
    ChunkerTableBuild,
    ChunkerTableReuse,
    StaleLockReaped,
}

static COUNTER_MAP: LazyLock<EnumMap<Op, AtomicUsize>> = LazyLock::new(EnumMap::default);

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

#[cfg(test)]
pub fn get(which: Op) -> usize {
    COUNTER_MAP[which].load(Ordering::Relaxed)
}

pub fn log_counts() {
    // Probably not needed; but we're probably calling this once at program exit.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0) // Ignore things we didn't do
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::IndexLoad => "indexes loaded",
        Op::BlobCacheHit => "blob cache hits",
        Op::BlobCacheMiss => "blob cache misses",
        Op::BlobCacheEviction => "blob cache evictions",
        Op::DedupSkippedBlob => "blobs deduplicated",
        Op::PackFinalized => "packs finalized",
        Op::FileToBuffer => "input files buffered",
        Op::FileToMmap => "input files memory mapped",
        Op::ChunkerTableBuild => "chunker tables built",
        Op::ChunkerTableReuse => "chunker tables reused",
        Op::StaleLockReaped => "stale locks reaped",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counts_go_up() {
        let before = get(Op::PackFinalized);
        bump(Op::PackFinalized);
        add(Op::PackFinalized, 2);
        assert_eq!(get(Op::PackFinalized), before + 3);
        log_counts();
    }
}

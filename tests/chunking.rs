//! Chunker determinism over a sizeable pseudo-random input.

mod common;

use anyhow::Result;
use common::lcg_bytes;

use sealbak::chunker::{Chunker, MAX_SIZE, MIN_SIZE};

/// A known irreducible polynomial, so results are comparable between
/// runs and machines.
const POLYNOMIAL: u64 = 0x3DA3358B4DC173;

#[test]
fn ten_megabytes_of_noise() -> Result<()> {
    let input = lcg_bytes(10 * 1024 * 1024, 0xF00D);

    let mut chunker = Chunker::new(&input[..], POLYNOMIAL);
    let mut chunks = Vec::new();
    while let Some(chunk) = chunker.next()? {
        chunks.push(chunk);
    }

    // Average target is 1 MiB, so 10 MiB of noise lands solidly here.
    assert!(
        (5..=25).contains(&chunks.len()),
        "expected 5..=25 chunks, got {}",
        chunks.len()
    );

    // Size bounds hold for everything but the final remainder.
    for chunk in &chunks[..chunks.len() - 1] {
        assert!(chunk.length >= MIN_SIZE);
        assert!(chunk.length <= MAX_SIZE);
    }

    // Concatenating the chunks reproduces the input exactly.
    let mut reassembled = Vec::with_capacity(input.len());
    for chunk in &chunks {
        assert_eq!(chunk.start as usize, reassembled.len());
        reassembled.extend_from_slice(&chunk.data);
    }
    assert_eq!(reassembled, input);

    // And doing it all again cuts in exactly the same places.
    let mut again = Chunker::new(&input[..], POLYNOMIAL);
    for chunk in &chunks {
        let repeat = again.next()?.expect("second pass ended early");
        assert_eq!(&repeat, chunk);
    }
    assert!(again.next()?.is_none());
    Ok(())
}

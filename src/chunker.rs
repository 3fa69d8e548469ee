//! Cut byte streams into content-based chunks with a Rabin rolling hash.
//!
//! Each repository draws its own random irreducible polynomial at
//! creation (stored in the config), so chunk boundaries - and therefore
//! deduplication - are stable for the life of the repository but differ
//! between repositories.

use std::io::prelude::*;
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::{Result, bail};
use rand::RngCore;
use rustc_hash::FxHashMap;

use crate::counters;

/// Sliding window width, in bytes.
const WINDOW_SIZE: usize = 64;

/// No chunk smaller than this (except a stream's final chunk).
pub const MIN_SIZE: usize = 512 * 1024;
/// No chunk larger than this, content be damned.
pub const MAX_SIZE: usize = 8 * 1024 * 1024;
/// A boundary is cut when the low `AVERAGE_BITS` bits of the digest are
/// zero, which lands the average chunk near 2^AVERAGE_BITS bytes.
pub const AVERAGE_BITS: u32 = 20;

const SPLITMASK: u64 = (1 << AVERAGE_BITS) - 1;

const BUF_SIZE: usize = 512 * 1024;

// --- Polynomials over GF(2), represented as u64 bit vectors. ---
// Bit i is the coefficient of x^i.

/// Degree of the polynomial; deg(0) = -1.
fn deg(p: u64) -> i32 {
    63 - p.leading_zeros() as i32
}

fn pol_mod(mut a: u64, m: u64) -> u64 {
    debug_assert!(m != 0);
    while deg(a) >= deg(m) {
        a ^= m << (deg(a) - deg(m));
    }
    a
}

/// a * b mod m, carry-less.
fn mulmod(a: u64, mut b: u64, m: u64) -> u64 {
    let mut a = pol_mod(a, m);
    let mut res = 0;
    while b != 0 {
        if b & 1 == 1 {
            res ^= a;
        }
        b >>= 1;
        a <<= 1;
        if deg(a) >= deg(m) {
            a ^= m;
        }
    }
    res
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, pol_mod(a, b)) }
}

/// (x^(2^p) + x) mod g, by repeated squaring.
fn qp(p: i32, g: u64) -> u64 {
    let mut res = 2; // x
    let mut i = 1u64;
    while i < (1u64 << p) {
        res = mulmod(res, res, g);
        i *= 2;
    }
    pol_mod(res ^ 2, g)
}

/// Ben-Or irreducibility test.
pub fn irreducible(f: u64) -> bool {
    for i in 1..=deg(f) / 2 {
        if gcd(f, qp(i, f)) != 1 {
            return false;
        }
    }
    true
}

/// Draws a random irreducible polynomial of degree 53 from the OS CSPRNG.
///
/// About one in deg tries succeeds, so this returns quickly.
pub fn random_polynomial() -> Result<u64> {
    for _ in 0..10_000 {
        let mut bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let mut f = u64::from_be_bytes(bytes);

        // Mask away everything above bit 53, then pin the highest and
        // lowest bits so the degree is 53 and x doesn't divide f.
        f &= (1 << 54) - 1;
        f |= (1 << 53) | 1;

        if irreducible(f) {
            return Ok(f);
        }
    }
    bail!("Couldn't find an irreducible polynomial (broken RNG?)");
}

// --- Per-polynomial lookup tables. ---

struct Tables {
    /// Cancels a byte's contribution as it slides out of the window.
    out: [u64; 256],
    /// Reduces the digest's top byte mod the polynomial as it shifts.
    modt: [u64; 256],
}

fn append_byte(hash: u64, b: u8, pol: u64) -> u64 {
    pol_mod((hash << 8) | b as u64, pol)
}

fn build_tables(pol: u64) -> Tables {
    let mut out = [0u64; 256];
    let mut modt = [0u64; 256];

    for b in 0..256usize {
        // The hash of this byte followed by window-1 zero bytes:
        // exactly what sliding it out needs to cancel.
        let mut h = append_byte(0, b as u8, pol);
        for _ in 0..WINDOW_SIZE - 1 {
            h = append_byte(h, 0, pol);
        }
        out[b] = h;
    }

    let k = deg(pol);
    for b in 0..256usize {
        let shifted = (b as u64) << k;
        modt[b] = pol_mod(shifted, pol) | shifted;
    }

    Tables { out, modt }
}

/// Tables are ~4 KiB per polynomial and immutable once built;
/// share them between every chunker in the process.
static TABLE_CACHE: LazyLock<Mutex<FxHashMap<u64, Arc<Tables>>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));

fn tables_for(pol: u64) -> Arc<Tables> {
    let mut cache = TABLE_CACHE.lock().unwrap();
    if let Some(t) = cache.get(&pol) {
        counters::bump(counters::Op::ChunkerTableReuse);
        return t.clone();
    }
    counters::bump(counters::Op::ChunkerTableBuild);
    let t = Arc::new(build_tables(pol));
    cache.insert(pol, t.clone());
    t
}

/// One content-defined chunk.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Chunk {
    /// Offset of the chunk in the input stream.
    pub start: u64,
    pub length: usize,
    /// The rolling digest at the cut point.
    pub cut: u64,
    pub data: Vec<u8>,
}

/// Streams chunks out of a reader.
pub struct Chunker<R> {
    rd: R,
    tables: Arc<Tables>,
    pol_shift: u32,

    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,

    /// Bytes in the current chunk so far.
    count: usize,
    /// Absolute position in the stream.
    pos: u64,
    /// Where the current chunk began.
    start: u64,
    /// Bytes to pass through before the hash starts rolling; no cut can
    /// happen before the minimum size anyway.
    pre: usize,

    buf: Vec<u8>,
    bpos: usize,
    bmax: usize,
    closed: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(rd: R, pol: u64) -> Self {
        assert!(deg(pol) > 8, "Chunking needs a polynomial of degree > 8");
        let mut c = Self {
            rd,
            tables: tables_for(pol),
            pol_shift: (deg(pol) - 8) as u32,
            window: [0; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            count: 0,
            pos: 0,
            start: 0,
            pre: 0,
            buf: vec![0; BUF_SIZE],
            bpos: 0,
            bmax: 0,
            closed: false,
        };
        c.start_new_chunk();
        c
    }

    fn start_new_chunk(&mut self) {
        self.window = [0; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
        self.count = 0;
        // Seed the window so an all-zero prefix still rolls.
        self.slide(1);
        self.start = self.pos;
        self.pre = MIN_SIZE - WINDOW_SIZE;
    }

    fn slide(&mut self, b: u8) {
        let out = self.window[self.wpos];
        self.window[self.wpos] = b;
        self.digest ^= self.tables.out[out as usize];
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;

        let index = (self.digest >> self.pol_shift) as u8;
        self.digest <<= 8;
        self.digest |= b as u64;
        self.digest ^= self.tables.modt[index as usize];
    }

    /// Returns the next chunk, or `None` at the end of the input.
    ///
    /// The final chunk is whatever bytes remain and may be shorter than
    /// [`MIN_SIZE`].
    pub fn next(&mut self) -> Result<Option<Chunk>> {
        if self.closed {
            return Ok(None);
        }
        let mut data = Vec::new();

        loop {
            if self.bpos >= self.bmax {
                let n = match self.rd.read(&mut self.buf) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                if n == 0 {
                    self.closed = true;
                    if self.count > 0 {
                        let chunk = Chunk {
                            start: self.start,
                            length: self.count,
                            cut: self.digest,
                            data,
                        };
                        self.count = 0;
                        return Ok(Some(chunk));
                    }
                    return Ok(None);
                }
                self.bpos = 0;
                self.bmax = n;
            }

            // Bytes that can't possibly hold the first cut point just get
            // copied; the window only starts rolling for the last
            // `WINDOW_SIZE` bytes before the minimum.
            if self.pre > 0 {
                let n = (self.bmax - self.bpos).min(self.pre);
                data.extend_from_slice(&self.buf[self.bpos..self.bpos + n]);
                self.pre -= n;
                self.count += n;
                self.pos += n as u64;
                self.bpos += n;
                continue;
            }

            // The hot loop: local copies, no per-byte calls.
            let mut add = self.count;
            let mut digest = self.digest;
            let mut wpos = self.wpos;
            let out_table = &self.tables.out;
            let mod_table = &self.tables.modt;
            let pol_shift = self.pol_shift;

            for i in 0..(self.bmax - self.bpos) {
                let b = self.buf[self.bpos + i];

                let out = self.window[wpos];
                self.window[wpos] = b;
                digest ^= out_table[out as usize];
                wpos += 1;
                if wpos >= WINDOW_SIZE {
                    wpos = 0;
                }

                let index = (digest >> pol_shift) as u8;
                digest <<= 8;
                digest |= b as u64;
                digest ^= mod_table[index as usize];

                add += 1;
                if add < MIN_SIZE {
                    continue;
                }

                if (digest & SPLITMASK) == 0 || add >= MAX_SIZE {
                    let consumed = i + 1;
                    data.extend_from_slice(&self.buf[self.bpos..self.bpos + consumed]);
                    self.pos += consumed as u64;
                    self.bpos += consumed;

                    let chunk = Chunk {
                        start: self.start,
                        length: add,
                        cut: digest,
                        data,
                    };
                    self.start_new_chunk();
                    return Ok(Some(chunk));
                }
            }

            let steps = self.bmax - self.bpos;
            data.extend_from_slice(&self.buf[self.bpos..self.bmax]);
            self.digest = digest;
            self.wpos = wpos;
            self.count += steps;
            self.pos += steps as u64;
            self.bpos = self.bmax;
        }
    }
}

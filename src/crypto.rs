//! Per-blob authenticated encryption: AES-256-CTR for confidentiality,
//! Poly1305-AES for authenticity.
//!
//! Every encrypted object is `IV(16) || AES-CTR(plaintext) || MAC(16)`,
//! so ciphertext overhead is exactly [`OVERHEAD`] bytes. The MAC covers
//! the IV and the ciphertext, keyed per-message by encrypting the IV
//! with the AES half of the MAC key.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use anyhow::{Result, ensure};
use poly1305::Poly1305;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::Error;

pub const IV_SIZE: usize = 16;
pub const MAC_SIZE: usize = 16;
/// Fixed per-object ciphertext overhead: one IV plus one MAC tag.
pub const OVERHEAD: usize = IV_SIZE + MAC_SIZE;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// The two halves of a Poly1305-AES key.
///
/// `r` is stored masked; masking is idempotent and applied exactly once
/// when the key is constructed or loaded.
#[derive(Clone)]
pub struct MacKey {
    k: [u8; 16],
    r: [u8; 16],
}

impl MacKey {
    pub fn new(k: [u8; 16], mut r: [u8; 16]) -> Self {
        mask_r(&mut r);
        Self { k, r }
    }

    pub fn k(&self) -> &[u8; 16] {
        &self.k
    }

    /// The masked `r` half. Persisting this (rather than the raw bytes)
    /// keeps the mask a load-time concern.
    pub fn r(&self) -> &[u8; 16] {
        &self.r
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.k.zeroize();
        self.r.zeroize();
    }
}

/// The standard Poly1305 clamp: the top four bits of r[3], r[7], r[11],
/// and r[15] and the bottom two bits of r[4], r[8], and r[12] are zeroed.
fn mask_r(r: &mut [u8; 16]) {
    for i in [3, 7, 11, 15] {
        r[i] &= 0x0f;
    }
    for i in [4, 8, 12] {
        r[i] &= 0xfc;
    }
}

/// A repository's master key material: one AES-256 key for encryption,
/// one composite key for authentication.
#[derive(Clone)]
pub struct MasterKeys {
    encrypt: [u8; 32],
    mac: MacKey,
}

impl MasterKeys {
    pub fn new(encrypt: [u8; 32], mac: MacKey) -> Self {
        Self { encrypt, mac }
    }

    /// Draws a fresh random key from the OS CSPRNG.
    pub fn random() -> Self {
        let mut encrypt = [0; 32];
        let mut k = [0; 16];
        let mut r = [0; 16];
        rand::rngs::OsRng.fill_bytes(&mut encrypt);
        rand::rngs::OsRng.fill_bytes(&mut k);
        rand::rngs::OsRng.fill_bytes(&mut r);
        Self::new(encrypt, MacKey::new(k, r))
    }

    /// Splits a 64-byte derived stream (e.g. from scrypt) into keys:
    /// bytes 0..32 encrypt, 32..48 are `k`, 48..64 are `r`.
    pub fn from_derived_bytes(bytes: &[u8; 64]) -> Self {
        let mut encrypt = [0; 32];
        let mut k = [0; 16];
        let mut r = [0; 16];
        encrypt.copy_from_slice(&bytes[0..32]);
        k.copy_from_slice(&bytes[32..48]);
        r.copy_from_slice(&bytes[48..64]);
        Self::new(encrypt, MacKey::new(k, r))
    }

    pub fn encryption_key(&self) -> &[u8; 32] {
        &self.encrypt
    }

    pub fn mac_key(&self) -> &MacKey {
        &self.mac
    }

    /// Encrypts and authenticates `plaintext` under a fresh random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0; IV_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        self.encrypt_with_iv(plaintext, &iv)
    }

    // Split out so tests can pin the IV. Everyone else gets a random one;
    // IV reuse under the same key breaks CTR confidentiality.
    fn encrypt_with_iv(&self, plaintext: &[u8], iv: &[u8; IV_SIZE]) -> Vec<u8> {
        let mut out = Vec::with_capacity(plaintext.len() + OVERHEAD);
        out.extend_from_slice(iv);
        out.extend_from_slice(plaintext);

        let mut cipher = Aes256Ctr::new((&self.encrypt).into(), iv.into());
        cipher.apply_keystream(&mut out[IV_SIZE..]);

        let tag = poly1305_aes(&self.mac, iv, &out);
        out.extend_from_slice(&tag);
        out
    }

    /// Verifies the MAC (in constant time) and decrypts.
    ///
    /// Any mismatch - a flipped bit anywhere in IV, ciphertext, or tag -
    /// fails with [`Error::Unauthenticated`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        ensure!(ciphertext.len() >= OVERHEAD, Error::Unauthenticated);

        let (body, tag) = ciphertext.split_at(ciphertext.len() - MAC_SIZE);
        let iv: &[u8; IV_SIZE] = body[..IV_SIZE].try_into().unwrap();

        let expected = poly1305_aes(&self.mac, iv, body);
        ensure!(
            bool::from(expected.ct_eq(tag)),
            Error::Unauthenticated
        );

        let mut out = body[IV_SIZE..].to_vec();
        let mut cipher = Aes256Ctr::new((&self.encrypt).into(), iv.into());
        cipher.apply_keystream(&mut out);
        Ok(out)
    }
}

impl Drop for MasterKeys {
    fn drop(&mut self) {
        self.encrypt.zeroize();
    }
}

/// Poly1305-AES: the per-message Poly1305 key is `r || AES-128_k(IV)`.
fn poly1305_aes(mac: &MacKey, iv: &[u8; IV_SIZE], msg: &[u8]) -> [u8; MAC_SIZE] {
    let mut nonce_block = *iv;
    let aes = aes::Aes128::new(mac.k().into());
    aes.encrypt_block((&mut nonce_block).into());

    let mut poly_key = [0; 32];
    poly_key[..16].copy_from_slice(mac.r());
    poly_key[16..].copy_from_slice(&nonce_block);

    let tag = Poly1305::new((&poly_key).into()).compute_unpadded(msg);
    poly_key.zeroize();
    tag.into()
}

//! Password-derived keys that unwrap a repository's master key.
//!
//! The master key never changes; each key *object* wraps it under a
//! different password-derived key, so adding a password is just adding
//! another key object and removing one doesn't re-encrypt anything.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use data_encoding::HEXLOWER;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use tracing::*;
use zeroize::Zeroize;

use crate::backend::{self, Backend, FileType, Handle};
use crate::crypto::{MacKey, MasterKeys};
use crate::error::Error;
use crate::hashing::ObjectId;
use crate::ident;

/// How long key derivation should take on this machine.
const TARGET_DERIVATION: Duration = Duration::from_millis(500);

/// scrypt needs 128 * r * N bytes; with r=8, N=2^16 lands at the 64 MiB cap.
const MAX_LOG_N: u8 = 16;
const MIN_LOG_N: u8 = 14;

/// scrypt difficulty. Calibrated once when a key is created,
/// then fixed in that key object forever.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct KdfParams {
    pub n: u64,
    pub r: u32,
    pub p: u32,
}

impl KdfParams {
    fn log_n(&self) -> Result<u8> {
        ensure!(
            self.n.is_power_of_two() && self.n > 1,
            "scrypt N must be a power of two, got {}",
            self.n
        );
        Ok(self.n.trailing_zeros() as u8)
    }
}

/// Picks parameters that cost roughly [`TARGET_DERIVATION`] on the
/// current hardware without blowing past the memory cap.
pub fn calibrate() -> KdfParams {
    let mut log_n = MIN_LOG_N;
    let mut elapsed = time_derivation(log_n, 1);
    while log_n < MAX_LOG_N && elapsed * 2 <= TARGET_DERIVATION {
        log_n += 1;
        elapsed = time_derivation(log_n, 1);
    }

    // Memory is capped; p buys more time without more memory.
    let mut p = 1;
    while elapsed * (p + 1) <= TARGET_DERIVATION && p < 8 {
        p += 1;
    }

    let params = KdfParams {
        n: 1 << log_n,
        r: 8,
        p: p as u32,
    };
    debug!("Calibrated scrypt to {params:?} (~{elapsed:?} per pass)");
    params
}

fn time_derivation(log_n: u8, p: u32) -> Duration {
    let start = Instant::now();
    let _ = derive(
        "calibration",
        &[0; SALT_SIZE],
        &KdfParams {
            n: 1 << log_n,
            r: 8,
            p,
        },
    );
    start.elapsed()
}

const SALT_SIZE: usize = 64;

fn derive(password: &str, salt: &[u8], params: &KdfParams) -> Result<MasterKeys> {
    let scrypt_params = scrypt::Params::new(params.log_n()?, params.r, params.p, 64)
        .map_err(|e| anyhow::anyhow!("Bad scrypt parameters: {e}"))?;
    let mut derived = [0u8; 64];
    scrypt::scrypt(password.as_bytes(), salt, &scrypt_params, &mut derived)
        .map_err(|e| anyhow::anyhow!("scrypt failed: {e}"))?;
    let keys = MasterKeys::from_derived_bytes(&derived);
    derived.zeroize();
    Ok(keys)
}

/// The master key as wrapped inside a key object.
#[derive(Serialize, Deserialize)]
struct WrappedKey {
    encryption_key: String,
    mac_key: WrappedMacKey,
}

#[derive(Serialize, Deserialize)]
struct WrappedMacKey {
    k: String,
    r: String,
}

/// One key object: scrypt parameters, salt, and the wrapped master key.
///
/// Stored as plaintext JSON - it has to be readable before any key is
/// known. Its storage name is the SHA256 of its serialized form.
#[derive(Serialize, Deserialize)]
pub struct KeyFile {
    pub name: String,
    pub created: jiff::Timestamp,
    pub hostname: String,
    pub username: String,
    kdf: String,
    n: u64,
    r: u32,
    p: u32,
    salt: String,
    data: String,
}

/// Wraps `keys` under `password` and stores the new key object,
/// returning its ID.
pub fn create(
    backend: &dyn Backend,
    keys: &MasterKeys,
    password: &str,
    name: &str,
    params: Option<KdfParams>,
) -> Result<ObjectId> {
    let params = params.unwrap_or_else(calibrate);

    let mut salt = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let wrapping = derive(password, &salt, &params)?;
    let wrapped = WrappedKey {
        encryption_key: HEXLOWER.encode(keys.encryption_key()),
        mac_key: WrappedMacKey {
            k: HEXLOWER.encode(keys.mac_key().k()),
            r: HEXLOWER.encode(keys.mac_key().r()),
        },
    };
    let wrapped_json = serde_json::to_vec(&wrapped)?;
    let data = wrapping.encrypt(&wrapped_json);

    let key_file = KeyFile {
        name: name.to_owned(),
        created: jiff::Timestamp::now(),
        hostname: ident::hostname(),
        username: ident::username(),
        kdf: String::from("scrypt"),
        n: params.n,
        r: params.r,
        p: params.p,
        salt: HEXLOWER.encode(&salt),
        data: HEXLOWER.encode(&data),
    };

    let serialized = serde_json::to_vec(&key_file)?;
    let id = ObjectId::hash(&serialized);
    backend::save_bytes(backend, &Handle::from_id(FileType::Key, &id), &serialized)?;
    info!("Created key {}", id.short_name());
    Ok(id)
}

fn try_unwrap(key_file: &KeyFile, password: &str) -> Result<MasterKeys> {
    ensure!(
        key_file.kdf == "scrypt",
        "Unknown KDF {} in key file",
        key_file.kdf
    );
    let salt = HEXLOWER
        .decode(key_file.salt.as_bytes())
        .context("Couldn't decode key salt")?;
    let params = KdfParams {
        n: key_file.n,
        r: key_file.r,
        p: key_file.p,
    };

    let wrapping = derive(password, &salt, &params)?;
    let data = HEXLOWER
        .decode(key_file.data.as_bytes())
        .context("Couldn't decode wrapped key")?;
    let unwrapped = wrapping.decrypt(&data)?;
    let wrapped: WrappedKey =
        serde_json::from_slice(&unwrapped).context("Wrapped key isn't valid JSON")?;

    let encrypt: [u8; 32] = decode_exact(&wrapped.encryption_key)?;
    let k: [u8; 16] = decode_exact(&wrapped.mac_key.k)?;
    let r: [u8; 16] = decode_exact(&wrapped.mac_key.r)?;
    // MacKey::new re-applies the mask; it's idempotent on a stored key.
    Ok(MasterKeys::new(encrypt, MacKey::new(k, r)))
}

fn decode_exact<const N: usize>(hex: &str) -> Result<[u8; N]> {
    let bytes = HEXLOWER
        .decode(hex.as_bytes())
        .context("Couldn't decode key material")?;
    let arr: [u8; N] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("Expected {N} bytes of key material, got {}", bytes.len()))?;
    Ok(arr)
}

/// Tries `password` against every key object in the backend,
/// stopping at the first that authenticates.
pub fn search(backend: &dyn Backend, password: &str, max_attempts: usize) -> Result<MasterKeys> {
    let names = backend.list(FileType::Key)?;
    ensure!(!names.is_empty(), "Repository has no keys");

    let mut tries = 0;
    for name in names.iter().take(max_attempts) {
        let handle = Handle::new(FileType::Key, name.clone());
        let bytes = backend::load_all(backend, &handle)?;
        let key_file: KeyFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("Key {name} isn't valid JSON"))?;

        tries += 1;
        match try_unwrap(&key_file, password) {
            Ok(keys) => {
                debug!("Key {} opened", &name[..8]);
                return Ok(keys);
            }
            Err(e) if e.downcast_ref::<Error>().is_some() => {
                trace!("Key {name} didn't match the password");
            }
            Err(e) => return Err(e.context(format!("Couldn't read key {name}"))),
        }
    }
    bail!(Error::WrongPassword { tries })
}

/// Cheap parameters for tests; real keys calibrate instead.
pub fn trivial_params() -> KdfParams {
    KdfParams { n: 16, r: 2, p: 1 }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    #[test]
    fn round_trip() -> Result<()> {
        let mem = MemoryBackend::new();
        let keys = MasterKeys::random();
        let id = create(&mem, &keys, "hunter2", "", Some(trivial_params()))?;

        // The object's name is the hash of its bytes.
        let handle = Handle::from_id(FileType::Key, &id);
        let bytes = backend::load_all(&mem, &handle)?;
        assert_eq!(ObjectId::hash(&bytes), id);

        let found = search(&mem, "hunter2", 10)?;
        assert_eq!(found.encryption_key(), keys.encryption_key());
        assert_eq!(found.mac_key().k(), keys.mac_key().k());
        assert_eq!(found.mac_key().r(), keys.mac_key().r());
        Ok(())
    }

    #[test]
    fn wrong_password() -> Result<()> {
        let mem = MemoryBackend::new();
        create(
            &mem,
            &MasterKeys::random(),
            "hunter2",
            "",
            Some(trivial_params()),
        )?;

        let err = match search(&mem, "*******", 10) {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::WrongPassword { tries: 1 })
        ));
        Ok(())
    }

    #[test]
    fn second_password_unwraps_the_same_key() -> Result<()> {
        let mem = MemoryBackend::new();
        let keys = MasterKeys::random();
        create(&mem, &keys, "first", "laptop", Some(trivial_params()))?;
        create(&mem, &keys, "second", "desktop", Some(trivial_params()))?;

        for password in ["first", "second"] {
            let found = search(&mem, password, 10)?;
            assert_eq!(found.encryption_key(), keys.encryption_key());
        }
        Ok(())
    }
}

//! Key derivation: passphrase → master key
//!
//! Argon2id is tried first. If it cannot run with the requested parameters
//! the derivation falls back to PBKDF2-HMAC-SHA256, and the algorithm that
//! actually produced the key is reported in [`DerivedKey::algorithm`] so it
//! can be recorded next to the wrapped file key.

use argon2::{Algorithm, Argon2, Params, Version};
use dm_core::config::CryptoConfig;
use dm_core::types::KdfInfo;
use dm_core::{DmError, DmResult};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::{encoding, KEY_SIZE, SALT_SIZE};

/// A 256-bit master key derived from a passphrase.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    #[serde(rename = "argon2id")]
    Argon2id,
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256,
}

impl KdfAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            KdfAlgorithm::Argon2id => "argon2id",
            KdfAlgorithm::Pbkdf2Sha256 => "pbkdf2-sha256",
        }
    }
}

impl std::fmt::Display for KdfAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KdfAlgorithm {
    type Err = DmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "argon2id" => Ok(KdfAlgorithm::Argon2id),
            "pbkdf2-sha256" | "pbkdf2" => Ok(KdfAlgorithm::Pbkdf2Sha256),
            other => Err(DmError::InvalidInput(format!("unknown KDF algorithm '{other}'"))),
        }
    }
}

/// KDF cost parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Argon2id time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Argon2id parallelism (default: 1)
    pub parallelism: u32,
    /// PBKDF2-HMAC-SHA256 iterations (default: 250000)
    pub pbkdf2_iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 1,
            pbkdf2_iterations: 250_000,
        }
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(c: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: c.argon2_mem_cost_kib,
            time_cost: c.argon2_time_cost,
            parallelism: c.argon2_parallelism,
            pbkdf2_iterations: c.pbkdf2_iterations,
        }
    }
}

/// A master key together with the salt and scheme that produced it.
#[derive(Debug, Clone)]
pub struct DerivedKey {
    pub master: MasterKey,
    pub salt: [u8; SALT_SIZE],
    pub algorithm: KdfAlgorithm,
}

impl DerivedKey {
    /// Metadata stored with a file so the key can be re-derived later.
    pub fn kdf_info(&self) -> KdfInfo {
        KdfInfo {
            algorithm: self.algorithm.as_str().to_string(),
            salt: encoding::encode(&self.salt),
        }
    }
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit master key, generating a random salt when none is given.
///
/// Only fails if both Argon2id and the PBKDF2 fallback fail.
pub fn derive_master_key(
    passphrase: &SecretString,
    salt: Option<[u8; SALT_SIZE]>,
    params: &KdfParams,
) -> DmResult<DerivedKey> {
    let salt = salt.unwrap_or_else(generate_salt);

    let (master, algorithm) = match argon2id(passphrase, &salt, params) {
        Ok(key) => (key, KdfAlgorithm::Argon2id),
        Err(e) => {
            warn!(error = %e, "Argon2id unavailable, falling back to PBKDF2-HMAC-SHA256");
            (pbkdf2_sha256(passphrase, &salt, params)?, KdfAlgorithm::Pbkdf2Sha256)
        }
    };
    debug!(algorithm = %algorithm, "master key derived");

    Ok(DerivedKey {
        master,
        salt,
        algorithm,
    })
}

/// Re-derive with a specific algorithm, e.g. the one recorded in a file's metadata.
pub fn derive_with(
    algorithm: KdfAlgorithm,
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> DmResult<MasterKey> {
    match algorithm {
        KdfAlgorithm::Argon2id => argon2id(passphrase, salt, params),
        KdfAlgorithm::Pbkdf2Sha256 => pbkdf2_sha256(passphrase, salt, params),
    }
}

fn argon2id(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> DmResult<MasterKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| DmError::DerivationFailure(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| DmError::DerivationFailure(format!("Argon2id KDF failed: {e}")))?;

    let master = MasterKey::from_bytes(key);
    key.zeroize();
    Ok(master)
}

fn pbkdf2_sha256(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> DmResult<MasterKey> {
    if params.pbkdf2_iterations == 0 {
        return Err(DmError::DerivationFailure(
            "PBKDF2 iteration count must be non-zero".into(),
        ));
    }

    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        passphrase.expose_secret().as_bytes(),
        salt,
        params.pbkdf2_iterations,
        &mut key,
    );

    let master = MasterKey::from_bytes(key);
    key.zeroize();
    Ok(master)
}

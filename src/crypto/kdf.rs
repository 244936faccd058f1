use std::time::{Duration, Instant};

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::hashes::hash256;
use crate::error::WalletError;

/// Cap on the memory the KDF may claim. Past this point the function is
/// already firmly memory-bound on commodity hardware.
pub const MAX_KDF_MEMORY: u32 = 32 * 1024 * 1024;

const MIN_KDF_MEMORY: u32 = 1024 * 1024;
const DEFAULT_TARGET_MS: u64 = 250;

/// Identifier of a persisted KDF parameter set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KdfId(pub [u8; 16]);

impl KdfId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Memory-hard KDF parameters, persisted alongside the key records they
/// protect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory requirement in bytes.
    pub memory_bytes: u32,
    /// Number of passes over the memory.
    pub iterations: u32,
    /// Per-wallet random salt.
    pub salt: [u8; 32],
}

impl KdfParams {
    /// Fixed parameters, used when the caller has already calibrated.
    pub fn new(memory_bytes: u32, iterations: u32, salt: [u8; 32]) -> Self {
        KdfParams {
            memory_bytes: memory_bytes.clamp(MIN_KDF_MEMORY, MAX_KDF_MEMORY),
            iterations: iterations.max(1),
            salt,
        }
    }

    /// Pick parameters so a single derivation lands near `target`, doubling
    /// the memory requirement until the budget is met or the cap is reached.
    pub fn calibrate(target: Duration, salt: [u8; 32]) -> Result<Self, WalletError> {
        let target = if target.is_zero() {
            Duration::from_millis(DEFAULT_TARGET_MS)
        } else {
            target
        };

        let mut memory = MIN_KDF_MEMORY;
        loop {
            let params = KdfParams::new(memory, 2, salt);
            let started = Instant::now();
            params.derive(b"calibration probe")?;
            let elapsed = started.elapsed();

            if elapsed >= target / 2 || memory >= MAX_KDF_MEMORY {
                return Ok(params);
            }
            memory = (memory * 2).min(MAX_KDF_MEMORY);
        }
    }

    /// Identifier binding these exact parameters.
    pub fn id(&self) -> KdfId {
        let mut material = Vec::with_capacity(8 + 32);
        material.extend_from_slice(&self.memory_bytes.to_be_bytes());
        material.extend_from_slice(&self.iterations.to_be_bytes());
        material.extend_from_slice(&self.salt);
        let digest = hash256(&material);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        KdfId(id)
    }

    /// Derive a 32-byte key from a passphrase.
    pub fn derive(&self, passphrase: &[u8]) -> Result<Zeroizing<[u8; 32]>, WalletError> {
        let params = Params::new(
            (self.memory_bytes / 1024).max(Params::MIN_M_COST),
            self.iterations,
            1,
            Some(32),
        )
        .map_err(|err| WalletError::Kdf(err.to_string()))?;

        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut output = Zeroizing::new([0u8; 32]);
        argon
            .hash_password_into(passphrase, &self.salt, output.as_mut())
            .map_err(|err| WalletError::Kdf(err.to_string()))?;
        Ok(output)
    }
}

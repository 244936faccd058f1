//! Legacy Armory135 chained derivation.
//!
//! A single chain of keys where each child is the parent multiplied by a
//! chaincode-bound scalar: `mult = hash256(uncompressed pub) XOR chaincode`,
//! `child_priv = priv · mult mod n`, `child_pub = mult · P`.

use secp256k1::{PublicKey, Scalar, SecretKey};

use crate::crypto::hashes::{hash256, hmac_sha256};
use crate::crypto::secp;
use crate::error::WalletError;

const CHAINCODE_DOMAIN: &[u8] = b"Derive Chaincode from Root Key";

/// Deterministic chaincode for a root key:
/// `HMAC-SHA-256(hash256(root), "Derive Chaincode from Root Key")`.
pub fn compute_chaincode(root: &[u8]) -> [u8; 32] {
    hmac_sha256(&hash256(root), CHAINCODE_DOMAIN)
}

fn chain_multiplier(public_key: &PublicKey, chaincode: &[u8; 32]) -> Result<Scalar, WalletError> {
    let digest = hash256(&public_key.serialize_uncompressed());
    let mut tweak = [0u8; 32];
    for (out, (a, b)) in tweak.iter_mut().zip(digest.iter().zip(chaincode.iter())) {
        *out = a ^ b;
    }
    Scalar::from_be_bytes(tweak)
        .map_err(|_| WalletError::invalid_input("chain multiplier out of range"))
}

/// Next private key in the chain.
pub fn chained_private_key(
    private_key: &SecretKey,
    chaincode: &[u8; 32],
) -> Result<SecretKey, WalletError> {
    let public_key = PublicKey::from_secret_key(secp(), private_key);
    let tweak = chain_multiplier(&public_key, chaincode)?;
    Ok(private_key.mul_tweak(&tweak)?)
}

/// Next public key in the chain.
pub fn chained_public_key(
    public_key: &PublicKey,
    chaincode: &[u8; 32],
) -> Result<PublicKey, WalletError> {
    let tweak = chain_multiplier(public_key, chaincode)?;
    Ok(public_key.mul_tweak(secp(), &tweak)?)
}

//! Per-record ECIES envelopes and the epoch key ladder.
//!
//! Every on-disk record is sealed under a one-off AES key agreed between a
//! fresh ephemeral keypair and the epoch key for the record's counter. The
//! epoch ladder is derived from the sub-database's salted root, itself the
//! HMAC of the control seed under the sub-database salt.

use secp256k1::{PublicKey, Scalar, SecretKey};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::cipher::{aes_cbc_decrypt, aes_cbc_encrypt, IV_LEN};
use crate::crypto::hashes::{hash256, hmac_sha256, hmac_sha512};
use crate::crypto::secp;
use crate::error::WalletError;

/// Compressed public key length in an envelope.
pub const EPHEMERAL_KEY_LEN: usize = 33;

/// Key material protecting a single record counter.
pub struct EpochKeys {
    enc_key: SecretKey,
    mac_key: Zeroizing<[u8; 32]>,
}

impl EpochKeys {
    /// Derive the keys for `counter` from a salted root. Returns `None` for
    /// the (astronomically unlikely) counters whose derived scalar is not a
    /// valid secp256k1 private key; writer and reader skip those identically.
    pub fn derive(salted_root: &[u8; 32], counter: u32) -> Option<Self> {
        let mut output = hmac_sha512(&counter.to_be_bytes(), salted_root);
        let enc_key = SecretKey::from_slice(&output[..32]).ok();
        let mut mac_key = Zeroizing::new([0u8; 32]);
        mac_key.copy_from_slice(&output[32..]);
        output.zeroize();

        enc_key.map(|enc_key| EpochKeys { enc_key, mac_key })
    }

    /// Public half of the encryption key; what ephemeral keys agree against.
    pub fn public(&self) -> PublicKey {
        PublicKey::from_secret_key(secp(), &self.enc_key)
    }

    /// MAC key for this counter's record.
    pub fn mac_key(&self) -> &[u8; 32] {
        &self.mac_key
    }
}

/// Salted root of a sub-database: `HMAC-SHA-256(control_salt, seed)`.
pub fn salted_root(control_salt: &[u8; 32], seed: &[u8]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(hmac_sha256(control_salt, seed))
}

/// Fresh ephemeral private key for one envelope.
pub fn ephemeral_key() -> SecretKey {
    loop {
        let candidate: [u8; 32] = crate::crypto::cipher::random_array();
        if let Ok(key) = SecretKey::from_slice(&candidate) {
            return key;
        }
    }
}

/// Shared AES key between an ephemeral scalar and a public key:
/// `hash256(compressed(scalar · point))`.
fn shared_key(scalar: &SecretKey, point: &PublicKey) -> Result<Zeroizing<[u8; 32]>, WalletError> {
    let tweak = Scalar::from(*scalar);
    let shared_point = point
        .mul_tweak(secp(), &tweak)
        .map_err(|_| WalletError::invalid_input("degenerate ecies point"))?;
    Ok(Zeroizing::new(hash256(&shared_point.serialize())))
}

/// Seal `plaintext` for the epoch key: `ephemeral pub ‖ iv ‖ ciphertext`.
pub fn seal(
    epoch: &EpochKeys,
    ephemeral: &SecretKey,
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, WalletError> {
    let key = shared_key(ephemeral, &epoch.public())?;
    let ciphertext = aes_cbc_encrypt(&key, iv, plaintext);

    let ephemeral_pub = PublicKey::from_secret_key(secp(), ephemeral);
    let mut envelope = Vec::with_capacity(EPHEMERAL_KEY_LEN + IV_LEN + ciphertext.len());
    envelope.extend_from_slice(&ephemeral_pub.serialize());
    envelope.extend_from_slice(iv);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Parsed view of a sealed record.
pub struct Envelope {
    pub ephemeral_pub: PublicKey,
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

/// Split an envelope into its parts without decrypting.
pub fn parse_envelope(envelope: &[u8]) -> Result<Envelope, WalletError> {
    if envelope.len() < EPHEMERAL_KEY_LEN + IV_LEN {
        return Err(WalletError::invalid_input("short ecies envelope"));
    }
    let ephemeral_pub = PublicKey::from_slice(&envelope[..EPHEMERAL_KEY_LEN])
        .map_err(|_| WalletError::invalid_input("invalid ephemeral public key"))?;
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&envelope[EPHEMERAL_KEY_LEN..EPHEMERAL_KEY_LEN + IV_LEN]);
    let ciphertext = envelope[EPHEMERAL_KEY_LEN + IV_LEN..].to_vec();
    Ok(Envelope {
        ephemeral_pub,
        iv,
        ciphertext,
    })
}

/// Open a sealed record with the counter's epoch keys.
pub fn open(epoch: &EpochKeys, envelope: &[u8]) -> Result<Vec<u8>, WalletError> {
    let parsed = parse_envelope(envelope)?;
    let key = shared_key(&epoch.enc_key, &parsed.ephemeral_pub)?;
    aes_cbc_decrypt(&key, &parsed.iv, &parsed.ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::random_iv;

    fn test_epoch(counter: u32) -> EpochKeys {
        let root = salted_root(&[3u8; 32], &[9u8; 32]);
        EpochKeys::derive(&root, counter).expect("valid epoch scalar")
    }

    #[test]
    fn seal_open_roundtrip() {
        let epoch = test_epoch(0);
        let plaintext = b"record payload".to_vec();

        let envelope = seal(&epoch, &ephemeral_key(), &random_iv(), &plaintext).expect("seal");
        assert_eq!(open(&epoch, &envelope).expect("open"), plaintext);
    }

    #[test]
    fn wrong_counter_key_fails() {
        let envelope = seal(
            &test_epoch(0),
            &ephemeral_key(),
            &random_iv(),
            b"record payload padded out to a couple of blocks",
        )
        .expect("seal");

        assert!(open(&test_epoch(1), &envelope).is_err());
    }

    #[test]
    fn ladder_is_deterministic() {
        let root = salted_root(&[1u8; 32], b"seed material");
        let a = EpochKeys::derive(&root, 7).expect("derive");
        let b = EpochKeys::derive(&root, 7).expect("derive");
        assert_eq!(a.public(), b.public());
        assert_eq!(a.mac_key(), b.mac_key());

        let c = EpochKeys::derive(&root, 8).expect("derive");
        assert_ne!(a.public(), c.public());
    }

    #[test]
    fn envelope_layout() {
        let epoch = test_epoch(0);
        let iv = random_iv();
        let envelope = seal(&epoch, &ephemeral_key(), &iv, b"x").expect("seal");

        let parsed = parse_envelope(&envelope).expect("parse");
        assert_eq!(parsed.iv, iv);
        assert_eq!(parsed.ciphertext.len(), IV_LEN); // one padded block
    }

    #[test]
    fn short_envelope_is_rejected() {
        assert!(matches!(
            parse_envelope(&[0u8; 20]),
            Err(WalletError::InvalidInput(_))
        ));
    }
}

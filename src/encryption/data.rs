use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use zeroize::Zeroizing;

use crate::crypto::cipher::{aes_cbc_decrypt, aes_cbc_encrypt, random_array, random_iv, IV_LEN};
use crate::crypto::hashes::hmac_sha256;
use crate::crypto::kdf::KdfId;
use crate::error::WalletError;

const KEY_CHECK_DOMAIN: &[u8] = b"kdf key check";

/// Identifier of a master encryption key. Assigned at creation and stable for
/// the life of the wallet; ciphertext records reference it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    pub fn random() -> Self {
        KeyId(random_array())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// One encrypted payload: an asset private key, a seed, or similar. The IV is
/// persistent; it is only replaced when the payload itself is re-encrypted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherData {
    /// Master key this payload is encrypted under.
    pub key_id: KeyId,
    /// KDF gating that master key.
    pub kdf_id: KdfId,
    pub iv: [u8; IV_LEN],
    pub ciphertext: ByteBuf,
}

impl CipherData {
    /// Encrypt `plaintext` under `master` with a fresh IV.
    pub fn encrypt(key_id: KeyId, kdf_id: KdfId, master: &[u8; 32], plaintext: &[u8]) -> Self {
        let iv = random_iv();
        let ciphertext = ByteBuf::from(aes_cbc_encrypt(master, &iv, plaintext));
        CipherData {
            key_id,
            kdf_id,
            iv,
            ciphertext,
        }
    }

    /// Decrypt this payload with the master key it references.
    pub fn decrypt(&self, master: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        Ok(Zeroizing::new(aes_cbc_decrypt(
            master,
            &self.iv,
            &self.ciphertext,
        )?))
    }
}

/// One `(IV, ciphertext)` pair of a master-key record, i.e. one passphrase
/// that can unlock the master key. The check tag lets the unlock loop reject
/// wrong passphrases deterministically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherEntry {
    pub iv: [u8; IV_LEN],
    pub ciphertext: ByteBuf,
    pub check: [u8; 8],
}

impl CipherEntry {
    fn new(derived: &[u8; 32], master: &[u8; 32]) -> Self {
        let iv = random_iv();
        let ciphertext = ByteBuf::from(aes_cbc_encrypt(derived, &iv, master));
        CipherEntry {
            iv,
            ciphertext,
            check: key_check(master),
        }
    }

    fn try_open(&self, derived: &[u8; 32]) -> Option<Zeroizing<[u8; 32]>> {
        let plain = aes_cbc_decrypt(derived, &self.iv, &self.ciphertext).ok()?;
        let bytes: [u8; 32] = plain.as_slice().try_into().ok()?;
        let candidate = Zeroizing::new(bytes);
        (key_check(&candidate) == self.check).then_some(candidate)
    }
}

fn key_check(master: &[u8; 32]) -> [u8; 8] {
    let tag = hmac_sha256(master, KEY_CHECK_DOMAIN);
    tag[..8].try_into().expect("tag is 32 bytes")
}

/// A master encryption key, stored as one ciphertext entry per passphrase
/// able to unlock it. The master key bytes themselves never change; adding or
/// erasing passphrases only adds or removes entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyRecord {
    pub key_id: KeyId,
    pub kdf_id: KdfId,
    pub entries: Vec<CipherEntry>,
    /// Whether the single entry is encrypted under the default (empty)
    /// passphrase, i.e. the wallet is unencrypted.
    pub default_encrypted: bool,
}

impl EncryptedKeyRecord {
    /// Wrap `master` under a passphrase-derived key. An empty passphrase
    /// produces an unencrypted-wallet record (gated by the default
    /// passphrase).
    pub fn create(
        key_id: KeyId,
        kdf_id: KdfId,
        derived: &[u8; 32],
        master: &[u8; 32],
        default_encrypted: bool,
    ) -> Self {
        EncryptedKeyRecord {
            key_id,
            kdf_id,
            entries: vec![CipherEntry::new(derived, master)],
            default_encrypted,
        }
    }

    /// Try a passphrase-derived key against every entry; returns the master
    /// key and the index of the entry that matched.
    pub fn try_unlock(&self, derived: &[u8; 32]) -> Option<(Zeroizing<[u8; 32]>, usize)> {
        self.entries
            .iter()
            .enumerate()
            .find_map(|(index, entry)| entry.try_open(derived).map(|master| (master, index)))
    }

    /// Append an entry for an additional passphrase.
    pub fn push_entry(&mut self, derived: &[u8; 32], master: &[u8; 32]) {
        self.entries.push(CipherEntry::new(derived, master));
    }

    /// Replace the entry at `index` with one under a new derived key,
    /// rotating its IV and ciphertext.
    pub fn replace_entry(&mut self, index: usize, derived: &[u8; 32], master: &[u8; 32]) {
        self.entries[index] = CipherEntry::new(derived, master);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::KdfParams;

    fn kdf() -> KdfParams {
        KdfParams::new(1024 * 1024, 1, [5u8; 32])
    }

    #[test]
    fn record_unlocks_with_right_key_only() {
        let master = random_array::<32>();
        let good = kdf().derive(b"passphrase").expect("derive");
        let record =
            EncryptedKeyRecord::create(KeyId::random(), kdf().id(), &good, &master, false);

        let (unlocked, index) = record.try_unlock(&good).expect("unlock");
        assert_eq!(*unlocked, master);
        assert_eq!(index, 0);

        let bad = kdf().derive(b"wrong").expect("derive");
        assert!(record.try_unlock(&bad).is_none());
    }

    #[test]
    fn multiple_entries_share_master() {
        let master = random_array::<32>();
        let first = kdf().derive(b"one").expect("derive");
        let second = kdf().derive(b"two").expect("derive");

        let mut record =
            EncryptedKeyRecord::create(KeyId::random(), kdf().id(), &first, &master, false);
        record.push_entry(&second, &master);

        let (a, _) = record.try_unlock(&first).expect("first entry");
        let (b, index) = record.try_unlock(&second).expect("second entry");
        assert_eq!(*a, *b);
        assert_eq!(index, 1);
    }

    #[test]
    fn replace_entry_rotates_iv_and_ciphertext() {
        let master = random_array::<32>();
        let old = kdf().derive(b"old").expect("derive");
        let new = kdf().derive(b"new").expect("derive");

        let mut record =
            EncryptedKeyRecord::create(KeyId::random(), kdf().id(), &old, &master, false);
        let before = record.entries[0].clone();

        record.replace_entry(0, &new, &master);
        let after = &record.entries[0];
        assert_ne!(before.iv, after.iv);
        assert_ne!(before.ciphertext, after.ciphertext);

        assert!(record.try_unlock(&old).is_none());
        let (unlocked, _) = record.try_unlock(&new).expect("new passphrase");
        assert_eq!(*unlocked, master);
    }

    #[test]
    fn cipher_data_roundtrip() {
        let master = random_array::<32>();
        let data = CipherData::encrypt(KeyId::random(), kdf().id(), &master, b"private key bytes");
        let plain = data.decrypt(&master).expect("decrypt");
        assert_eq!(plain.as_slice(), b"private key bytes");
    }
}

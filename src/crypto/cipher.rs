use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::WalletError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size, also the IV length used throughout the wallet format.
pub const IV_LEN: usize = 16;

/// AES-256-CBC with PKCS7 padding.
pub fn aes_cbc_encrypt(key: &[u8; 32], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Inverse of [`aes_cbc_encrypt`]. Fails on bad padding, which is the usual
/// symptom of a wrong key.
pub fn aes_cbc_decrypt(
    key: &[u8; 32],
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, WalletError> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| WalletError::DecryptFailed)
}

/// Fresh random IV. The all-zero IV is reserved as an invalid marker and is
/// never returned.
pub fn random_iv() -> [u8; IV_LEN] {
    let mut rng = rand::thread_rng();
    loop {
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut iv);
        if iv != [0u8; IV_LEN] {
            return iv;
        }
    }
}

/// `len` random bytes from the thread RNG.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Fixed-size random array helper.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_roundtrip() {
        let key = random_array::<32>();
        let iv = random_iv();
        let plain = b"attack at dawn".to_vec();

        let ct = aes_cbc_encrypt(&key, &iv, &plain);
        assert_ne!(ct, plain);
        assert_eq!(ct.len() % IV_LEN, 0);

        let decrypted = aes_cbc_decrypt(&key, &iv, &ct).expect("decrypt");
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn wrong_key_fails_padding() {
        let key = random_array::<32>();
        let iv = random_iv();
        let ct = aes_cbc_encrypt(&key, &iv, b"some payload bytes");

        let mut bad_key = key;
        bad_key[0] ^= 0xff;
        // PKCS7 unpadding rejects virtually every wrong-key decrypt.
        assert!(aes_cbc_decrypt(&bad_key, &iv, &ct).is_err());
    }

    #[test]
    fn iv_is_never_zero() {
        for _ in 0..32 {
            assert_ne!(random_iv(), [0u8; IV_LEN]);
        }
    }
}

//! BIP32 extended keys over secp256k1.

use secp256k1::{PublicKey, Scalar, SecretKey};
use zeroize::Zeroizing;

use crate::crypto::hashes::{hash160, hmac_sha512};
use crate::crypto::secp;
use crate::derivation::is_hardened;
use crate::error::WalletError;

const BITCOIN_SEED_KEY: &[u8] = b"Bitcoin seed";
const XPRV_VERSION: [u8; 4] = [0x04, 0x88, 0xad, 0xe4];
const XPUB_VERSION: [u8; 4] = [0x04, 0x88, 0xb2, 0x1e];

/// One node of a BIP32 tree: public key, chain code and position metadata,
/// with the private key present only on signing-capable branches.
#[derive(Clone, Debug)]
pub struct Bip32Node {
    depth: u8,
    parent_fingerprint: [u8; 4],
    leaf_id: u32,
    chaincode: [u8; 32],
    public_key: PublicKey,
    private_key: Option<SecretKey>,
}

impl Bip32Node {
    /// Master node from seed entropy.
    pub fn from_seed(seed: &[u8]) -> Result<Self, WalletError> {
        if seed.is_empty() || seed.len() > 64 {
            return Err(WalletError::invalid_input("seed length out of range"));
        }
        let mut digest = Zeroizing::new(hmac_sha512(BITCOIN_SEED_KEY, seed));
        let private_key = SecretKey::from_slice(&digest[..32])?;
        let mut chaincode = [0u8; 32];
        chaincode.copy_from_slice(&digest[32..]);

        Ok(Bip32Node {
            depth: 0,
            parent_fingerprint: [0u8; 4],
            leaf_id: 0,
            chaincode,
            public_key: PublicKey::from_secret_key(secp(), &private_key),
            private_key: Some(private_key),
        })
    }

    /// Build a public-only node from stored fields.
    pub fn from_public_parts(
        public_key: PublicKey,
        chaincode: [u8; 32],
        depth: u8,
        leaf_id: u32,
        parent_fingerprint: [u8; 4],
    ) -> Self {
        Bip32Node {
            depth,
            parent_fingerprint,
            leaf_id,
            chaincode,
            public_key,
            private_key: None,
        }
    }

    /// Rebuild a private node from stored fields.
    pub fn from_private_parts(
        private_key: SecretKey,
        chaincode: [u8; 32],
        depth: u8,
        leaf_id: u32,
        parent_fingerprint: [u8; 4],
    ) -> Self {
        Bip32Node {
            depth,
            parent_fingerprint,
            leaf_id,
            chaincode,
            public_key: PublicKey::from_secret_key(secp(), &private_key),
            private_key: Some(private_key),
        }
    }

    /// Derive a child, consuming hardened steps with the private key and soft
    /// steps with either half.
    pub fn derive(&self, index: u32) -> Result<Self, WalletError> {
        if is_hardened(index) {
            self.derive_private(index)
        } else if self.private_key.is_some() {
            self.derive_private(index)
        } else {
            self.derive_public(index)
        }
    }

    /// Private child derivation. Hardened indices require the private key.
    pub fn derive_private(&self, index: u32) -> Result<Self, WalletError> {
        let private_key = self.private_key.ok_or(WalletError::NoPrivateKey)?;

        let mut data = Zeroizing::new(Vec::with_capacity(37));
        if is_hardened(index) {
            data.push(0x00);
            data.extend_from_slice(&private_key.secret_bytes());
        } else {
            data.extend_from_slice(&self.public_key.serialize());
        }
        data.extend_from_slice(&index.to_be_bytes());

        let mut digest = Zeroizing::new(hmac_sha512(&self.chaincode, &data));
        let tweak = Scalar::from_be_bytes(
            digest[..32]
                .try_into()
                .expect("hmac output is 64 bytes"),
        )
        .map_err(|_| WalletError::invalid_input("derived scalar out of range"))?;
        let child_private = private_key.add_tweak(&tweak)?;

        let mut chaincode = [0u8; 32];
        chaincode.copy_from_slice(&digest[32..]);

        Ok(Bip32Node {
            depth: self.depth + 1,
            parent_fingerprint: self.fingerprint(),
            leaf_id: index,
            chaincode,
            public_key: PublicKey::from_secret_key(secp(), &child_private),
            private_key: Some(child_private),
        })
    }

    /// Public child derivation; soft indices only.
    pub fn derive_public(&self, index: u32) -> Result<Self, WalletError> {
        if is_hardened(index) {
            return Err(WalletError::NoPrivateKey);
        }

        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&self.public_key.serialize());
        data.extend_from_slice(&index.to_be_bytes());

        let digest = hmac_sha512(&self.chaincode, &data);
        let tweak = Scalar::from_be_bytes(
            digest[..32]
                .try_into()
                .expect("hmac output is 64 bytes"),
        )
        .map_err(|_| WalletError::invalid_input("derived scalar out of range"))?;
        let child_public = self.public_key.add_exp_tweak(secp(), &tweak)?;

        let mut chaincode = [0u8; 32];
        chaincode.copy_from_slice(&digest[32..]);

        Ok(Bip32Node {
            depth: self.depth + 1,
            parent_fingerprint: self.fingerprint(),
            leaf_id: index,
            chaincode,
            public_key: child_public,
            private_key: None,
        })
    }

    /// Walk a full derivation path.
    pub fn derive_path(&self, path: &[u32]) -> Result<Self, WalletError> {
        let mut node = self.clone();
        for &step in path {
            node = node.derive(step)?;
        }
        Ok(node)
    }

    /// Copy with the private key stripped.
    pub fn public_copy(&self) -> Self {
        Bip32Node {
            private_key: None,
            ..self.clone()
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn leaf_id(&self) -> u32 {
        self.leaf_id
    }

    pub fn parent_fingerprint(&self) -> [u8; 4] {
        self.parent_fingerprint
    }

    /// `hash160(pubkey)[0..4]`, the fingerprint this node's children carry.
    pub fn fingerprint(&self) -> [u8; 4] {
        hash160(&self.public_key.serialize())[..4]
            .try_into()
            .expect("hash160 is 20 bytes")
    }

    pub fn chaincode(&self) -> &[u8; 32] {
        &self.chaincode
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> Option<&SecretKey> {
        self.private_key.as_ref()
    }

    pub fn has_private(&self) -> bool {
        self.private_key.is_some()
    }

    /// Serialize as xprv when the private key is present, xpub otherwise.
    pub fn to_base58(&self) -> String {
        let mut payload = Vec::with_capacity(78);
        match &self.private_key {
            Some(private_key) => {
                payload.extend_from_slice(&XPRV_VERSION);
                self.push_common(&mut payload);
                payload.push(0x00);
                payload.extend_from_slice(&private_key.secret_bytes());
            }
            None => {
                payload.extend_from_slice(&XPUB_VERSION);
                self.push_common(&mut payload);
                payload.extend_from_slice(&self.public_key.serialize());
            }
        }
        bs58::encode(payload).with_check().into_string()
    }

    fn push_common(&self, payload: &mut Vec<u8>) {
        payload.push(self.depth);
        payload.extend_from_slice(&self.parent_fingerprint);
        payload.extend_from_slice(&self.leaf_id.to_be_bytes());
        payload.extend_from_slice(&self.chaincode);
    }

    /// Parse an xprv or xpub string.
    pub fn from_base58(encoded: &str) -> Result<Self, WalletError> {
        let payload = bs58::decode(encoded)
            .with_check(None)
            .into_vec()
            .map_err(|_| WalletError::invalid_input("bad base58 extended key"))?;
        if payload.len() != 78 {
            return Err(WalletError::invalid_input("bad extended key length"));
        }

        let version: [u8; 4] = payload[..4].try_into().expect("checked length");
        let depth = payload[4];
        let parent_fingerprint: [u8; 4] = payload[5..9].try_into().expect("checked length");
        let leaf_id = u32::from_be_bytes(payload[9..13].try_into().expect("checked length"));
        let mut chaincode = [0u8; 32];
        chaincode.copy_from_slice(&payload[13..45]);
        let key_material = &payload[45..78];

        match version {
            XPRV_VERSION => {
                if key_material[0] != 0x00 {
                    return Err(WalletError::invalid_input("bad private key padding"));
                }
                let private_key = SecretKey::from_slice(&key_material[1..])?;
                Ok(Bip32Node::from_private_parts(
                    private_key,
                    chaincode,
                    depth,
                    leaf_id,
                    parent_fingerprint,
                ))
            }
            XPUB_VERSION => {
                let public_key = PublicKey::from_slice(key_material)?;
                Ok(Bip32Node::from_public_parts(
                    public_key,
                    chaincode,
                    depth,
                    leaf_id,
                    parent_fingerprint,
                ))
            }
            _ => Err(WalletError::invalid_input("unknown extended key version")),
        }
    }
}

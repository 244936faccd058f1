//! Tagged asset entries: the materialized keys of an account chain.
//!
//! Assets are arena-owned by their wallet and keyed by
//! `(account id, node id, index)`; accounts hold ids, never references.
//! Watching-only forks simply drop the private arms.

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;

use crate::crypto::hashes::hash256;
use crate::encryption::CipherData;
use crate::error::WalletError;

/// Four-byte account identifier, derived from the account's root public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 4]);

impl AccountId {
    /// Deterministic id from an account kind tag and its root public key, so
    /// watching-only forks agree with their source wallet.
    pub fn derive(kind_tag: u8, root_public: &PublicKey) -> Self {
        let mut material = Vec::with_capacity(34);
        material.push(kind_tag);
        material.extend_from_slice(&root_public.serialize());
        let digest = hash256(&material);
        AccountId(digest[..4].try_into().expect("digest is 32 bytes"))
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

/// Fully-qualified asset address inside a wallet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId {
    pub account: AccountId,
    pub node: u32,
    pub index: u32,
}

impl AssetId {
    pub fn new(account: AccountId, node: u32, index: u32) -> Self {
        AssetId {
            account,
            node,
            index,
        }
    }
}

/// A single-key asset: one public key, optionally its encrypted private key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSingle {
    pub id: AssetId,
    /// Compressed public key (33 bytes).
    pub public_key: ByteBuf,
    pub encrypted_private: Option<CipherData>,
}

impl AssetSingle {
    pub fn new(id: AssetId, public_key: &PublicKey, encrypted_private: Option<CipherData>) -> Self {
        AssetSingle {
            id,
            public_key: ByteBuf::from(public_key.serialize().to_vec()),
            encrypted_private,
        }
    }

    /// Parse the stored compressed key.
    pub fn public_key(&self) -> Result<PublicKey, WalletError> {
        Ok(PublicKey::from_slice(&self.public_key)?)
    }

    pub fn has_private(&self) -> bool {
        self.encrypted_private.is_some()
    }
}

/// A BIP32 root asset: a single asset plus the chain state needed to extend
/// beneath it, and the derivation path that produced it from the seed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBip32Root {
    pub base: AssetSingle,
    pub chaincode: [u8; 32],
    pub depth: u8,
    pub leaf_id: u32,
    pub parent_fingerprint: [u8; 4],
    pub seed_fingerprint: [u8; 4],
    /// Path from the seed to this root.
    pub derivation_path: Vec<u32>,
}

impl AssetBip32Root {
    pub fn public_key(&self) -> Result<PublicKey, WalletError> {
        self.base.public_key()
    }

    pub fn has_private(&self) -> bool {
        self.base.has_private()
    }
}

/// An m-of-n collection of named single assets, ordered by insertion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMultisig {
    pub m: u8,
    pub n: u8,
    /// Insertion-ordered names -> single assets.
    pub assets: Vec<(String, AssetSingle)>,
}

impl AssetMultisig {
    /// Cosigner public keys in canonical (insertion) order.
    pub fn public_keys(&self) -> Result<Vec<PublicKey>, WalletError> {
        self.assets
            .iter()
            .map(|(_, asset)| asset.public_key())
            .collect()
    }

    pub fn has_private(&self) -> bool {
        self.assets.iter().any(|(_, asset)| asset.has_private())
    }
}

/// Every asset form the wallet persists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetEntry {
    Single(AssetSingle),
    Bip32Root(AssetBip32Root),
    Multisig(AssetMultisig),
}

impl AssetEntry {
    pub fn id(&self) -> AssetId {
        match self {
            AssetEntry::Single(asset) => asset.id,
            AssetEntry::Bip32Root(root) => root.base.id,
            AssetEntry::Multisig(multisig) => {
                multisig
                    .assets
                    .first()
                    .map(|(_, asset)| asset.id)
                    .unwrap_or(AssetId {
                        account: AccountId([0; 4]),
                        node: 0,
                        index: 0,
                    })
            }
        }
    }

    /// Capability test: can this entry produce a clear private key once the
    /// container is unlocked?
    pub fn has_private(&self) -> bool {
        match self {
            AssetEntry::Single(asset) => asset.has_private(),
            AssetEntry::Bip32Root(root) => root.has_private(),
            AssetEntry::Multisig(multisig) => multisig.has_private(),
        }
    }
}

/// Arena of materialized assets, keyed by `(account, node, index)`.
pub type AssetArena = BTreeMap<AssetId, AssetSingle>;

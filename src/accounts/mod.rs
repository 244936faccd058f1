//! Accounts: collections of deterministic asset chains with a declared
//! address-type capability set.
//!
//! An account owns one chain per node id (commonly outer = receiving,
//! inner = change). Chains extend forward only; an index never changes
//! meaning once assigned. Public extension works from public material alone;
//! private extension reconstructs clear keys under an unlocked container and
//! stores them encrypted with persistent IVs.

use std::collections::BTreeMap;

use secp256k1::{PublicKey, Scalar, SecretKey};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use zeroize::Zeroizing;

use crate::addresses::{AddressEntry, AddressType};
use crate::assets::{AccountId, AssetBip32Root, AssetId, AssetSingle};
use crate::crypto::secp;
use crate::derivation::{armory135, bip32::Bip32Node};
use crate::encryption::{DecryptedDataContainer, KeyId};
use crate::error::WalletError;

/// Account-kind tags feeding [`AccountId::derive`].
pub const TAG_ARMORY135: u8 = 0x35;
pub const TAG_BIP32: u8 = 0x32;
pub const TAG_BIP32_SALTED: u8 = 0x33;
pub const TAG_ECDH: u8 = 0x34;

/// The single chain node id of a legacy account.
pub const ARMORY135_NODE: u32 = 0;

/// Creation-time description of an account.
#[derive(Clone, Debug)]
pub enum AccountSpec {
    /// Legacy single-chain account over the wallet root.
    Armory135 { lookup: u32 },
    /// Standard BIP32 account rooted at `derivation_path` under the seed.
    Bip32 {
        derivation_path: Vec<u32>,
        nodes: Vec<u32>,
        outer: u32,
        inner: Option<u32>,
        address_types: Vec<AddressType>,
        default_address_type: AddressType,
        lookup: u32,
        main: bool,
    },
    /// BIP32 account whose every descendant key is multiplied by a salt.
    Bip32Salted {
        derivation_path: Vec<u32>,
        salt: [u8; 32],
        nodes: Vec<u32>,
        outer: u32,
        inner: Option<u32>,
        address_types: Vec<AddressType>,
        default_address_type: AddressType,
        lookup: u32,
        main: bool,
    },
    /// Settlement account over a fixed base keypair and registered salts.
    Ecdh {
        /// Base private key; absent on watching-only imports.
        private_key: Option<[u8; 32]>,
        /// Base public key (compressed encoding).
        public_key: [u8; 33],
        address_types: Vec<AddressType>,
        default_address_type: AddressType,
        main: bool,
    },
}

impl AccountSpec {
    pub fn is_main(&self) -> bool {
        match self {
            AccountSpec::Armory135 { .. } => true,
            AccountSpec::Bip32 { main, .. }
            | AccountSpec::Bip32Salted { main, .. }
            | AccountSpec::Ecdh { main, .. } => *main,
        }
    }
}

/// Persisted derivation rule of an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKind {
    Armory135,
    Bip32 { derivation_path: Vec<u32> },
    Bip32Salted { derivation_path: Vec<u32>, salt: [u8; 32] },
    Ecdh,
}

/// Per-node cursor state: how many indices were handed out and which address
/// type each one was instantiated as.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub used: u32,
    pub instantiated: BTreeMap<u32, AddressType>,
}

/// Persisted account metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMeta {
    pub id: AccountId,
    pub kind: AccountKind,
    pub outer_node: u32,
    pub inner_node: Option<u32>,
    pub address_types: Vec<AddressType>,
    pub default_address_type: AddressType,
    pub lookup: u32,
    pub node_state: BTreeMap<u32, NodeState>,
}

/// Persisted root of one asset chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainRoot {
    Armory135 {
        public_key: ByteBuf,
        chaincode: [u8; 32],
        encrypted_private: Option<crate::encryption::CipherData>,
    },
    Bip32 {
        root: AssetBip32Root,
    },
    Bip32Salted {
        root: AssetBip32Root,
        salt: [u8; 32],
    },
    Ecdh {
        public_key: ByteBuf,
        encrypted_private: Option<crate::encryption::CipherData>,
        /// Registered salts, index-ordered. Registration is idempotent.
        salts: Vec<[u8; 32]>,
    },
}

impl ChainRoot {
    pub fn public_key(&self) -> Result<PublicKey, WalletError> {
        match self {
            ChainRoot::Armory135 { public_key, .. } | ChainRoot::Ecdh { public_key, .. } => {
                Ok(PublicKey::from_slice(public_key)?)
            }
            ChainRoot::Bip32 { root } | ChainRoot::Bip32Salted { root, .. } => root.public_key(),
        }
    }

    /// Whether the chain can reconstruct private keys once unlocked.
    pub fn has_private(&self) -> bool {
        match self {
            ChainRoot::Armory135 {
                encrypted_private, ..
            }
            | ChainRoot::Ecdh {
                encrypted_private, ..
            } => encrypted_private.is_some(),
            ChainRoot::Bip32 { root } | ChainRoot::Bip32Salted { root, .. } => root.has_private(),
        }
    }

    /// Strip private material for a watching-only fork.
    pub fn to_watching_only(&self) -> Self {
        let mut copy = self.clone();
        match &mut copy {
            ChainRoot::Armory135 {
                encrypted_private, ..
            }
            | ChainRoot::Ecdh {
                encrypted_private, ..
            } => *encrypted_private = None,
            ChainRoot::Bip32 { root } | ChainRoot::Bip32Salted { root, .. } => {
                root.base.encrypted_private = None;
            }
        }
        copy
    }

    fn encrypted_private(&self) -> Option<&crate::encryption::CipherData> {
        match self {
            ChainRoot::Armory135 {
                encrypted_private, ..
            }
            | ChainRoot::Ecdh {
                encrypted_private, ..
            } => encrypted_private.as_ref(),
            ChainRoot::Bip32 { root } | ChainRoot::Bip32Salted { root, .. } => {
                root.base.encrypted_private.as_ref()
            }
        }
    }

    /// Decrypt the chain's root private key.
    fn clear_private(
        &self,
        container: &DecryptedDataContainer,
    ) -> Result<Zeroizing<[u8; 32]>, WalletError> {
        let cipher = self.encrypted_private().ok_or(WalletError::NoPrivateKey)?;
        let plain = container.decrypt(cipher)?;
        let bytes: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_| WalletError::invalid_input("bad private key length"))?;
        Ok(Zeroizing::new(bytes))
    }

    fn bip32_public_node(root: &AssetBip32Root) -> Result<Bip32Node, WalletError> {
        Ok(Bip32Node::from_public_parts(
            root.public_key()?,
            root.chaincode,
            root.depth,
            root.leaf_id,
            root.parent_fingerprint,
        ))
    }
}

/// One deterministic asset chain.
#[derive(Clone, Debug)]
pub struct AssetChain {
    pub account: AccountId,
    pub node: u32,
    pub root: ChainRoot,
    pub assets: BTreeMap<u32, AssetSingle>,
}

impl AssetChain {
    pub fn new(account: AccountId, node: u32, root: ChainRoot) -> Self {
        AssetChain {
            account,
            node,
            root,
            assets: BTreeMap::new(),
        }
    }

    /// Number of materialized assets.
    pub fn len(&self) -> u32 {
        self.assets.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn asset(&self, index: u32) -> Option<&AssetSingle> {
        self.assets.get(&index)
    }

    /// Public key for an index, deriving it if the asset is materialized.
    pub fn public_key(&self, index: u32) -> Result<PublicKey, WalletError> {
        self.assets
            .get(&index)
            .ok_or_else(|| WalletError::not_found(format!("asset index {index}")))?
            .public_key()
    }

    /// Extend the materialized window by `count` using public material only.
    /// ECDH chains extend up to the registered salt count.
    pub fn extend_public(&mut self, count: u32) -> Result<(), WalletError> {
        let start = self.len();
        match &self.root {
            ChainRoot::Armory135 {
                public_key,
                chaincode,
                ..
            } => {
                let chaincode = *chaincode;
                let mut current = match start.checked_sub(1) {
                    Some(last) => self.public_key(last)?,
                    None => PublicKey::from_slice(public_key)?,
                };
                for index in start..start + count {
                    current = armory135::chained_public_key(&current, &chaincode)?;
                    self.push_asset(index, &current, None);
                }
            }
            ChainRoot::Bip32 { root } => {
                let node = ChainRoot::bip32_public_node(root)?;
                for index in start..start + count {
                    let child = node.derive_public(index)?;
                    self.push_asset(index, child.public_key(), None);
                }
            }
            ChainRoot::Bip32Salted { root, salt } => {
                let node = ChainRoot::bip32_public_node(root)?;
                let tweak = salt_scalar(salt)?;
                for index in start..start + count {
                    let child = node.derive_public(index)?;
                    let salted = child.public_key().mul_tweak(secp(), &tweak)?;
                    self.push_asset(index, &salted, None);
                }
            }
            ChainRoot::Ecdh {
                public_key, salts, ..
            } => {
                let base = PublicKey::from_slice(public_key)?;
                let limit = (salts.len() as u32).min(start + count);
                let salts = salts.clone();
                for index in start..limit {
                    let tweak = salt_scalar(&salts[index as usize])?;
                    let salted = base.mul_tweak(secp(), &tweak)?;
                    self.push_asset(index, &salted, None);
                }
            }
        }
        Ok(())
    }

    fn push_asset(&mut self, index: u32, public_key: &PublicKey, encrypted: Option<crate::encryption::CipherData>) {
        let id = AssetId::new(self.account, self.node, index);
        self.assets
            .insert(index, AssetSingle::new(id, public_key, encrypted));
    }

    /// Reconstruct the clear private key for `index` by the chain's
    /// derivation rule. Requires an unlocked container holding the chain's
    /// master key.
    pub fn derive_private(
        &self,
        container: &DecryptedDataContainer,
        index: u32,
    ) -> Result<Zeroizing<[u8; 32]>, WalletError> {
        if let Some(asset) = self.assets.get(&index) {
            if let Some(cipher) = &asset.encrypted_private {
                let plain = container.decrypt(cipher)?;
                let bytes: [u8; 32] = plain
                    .as_slice()
                    .try_into()
                    .map_err(|_| WalletError::invalid_input("bad private key length"))?;
                return Ok(Zeroizing::new(bytes));
            }
        }

        let root_private = self.root.clear_private(container)?;
        match &self.root {
            ChainRoot::Armory135 { chaincode, .. } => {
                let mut key = SecretKey::from_slice(root_private.as_slice())?;
                for _ in 0..=index {
                    key = armory135::chained_private_key(&key, chaincode)?;
                }
                Ok(Zeroizing::new(key.secret_bytes()))
            }
            ChainRoot::Bip32 { root } => {
                let key = SecretKey::from_slice(root_private.as_slice())?;
                let node = Bip32Node::from_private_parts(
                    key,
                    root.chaincode,
                    root.depth,
                    root.leaf_id,
                    root.parent_fingerprint,
                );
                let child = node.derive_private(index)?;
                Ok(Zeroizing::new(
                    child.private_key().expect("private derivation").secret_bytes(),
                ))
            }
            ChainRoot::Bip32Salted { root, salt } => {
                let key = SecretKey::from_slice(root_private.as_slice())?;
                let node = Bip32Node::from_private_parts(
                    key,
                    root.chaincode,
                    root.depth,
                    root.leaf_id,
                    root.parent_fingerprint,
                );
                let child = node.derive_private(index)?;
                let salted = child
                    .private_key()
                    .expect("private derivation")
                    .mul_tweak(&salt_scalar(salt)?)?;
                Ok(Zeroizing::new(salted.secret_bytes()))
            }
            ChainRoot::Ecdh { salts, .. } => {
                let salt = salts
                    .get(index as usize)
                    .ok_or_else(|| WalletError::not_found(format!("ecdh salt {index}")))?;
                let key = SecretKey::from_slice(root_private.as_slice())?;
                let salted = key.mul_tweak(&salt_scalar(salt)?)?;
                Ok(Zeroizing::new(salted.secret_bytes()))
            }
        }
    }

    /// Fill in encrypted private keys for every materialized asset lacking
    /// one, encrypting under `key_id`. Requires an unlocked container.
    pub fn extend_private(
        &mut self,
        container: &DecryptedDataContainer,
        key_id: KeyId,
    ) -> Result<(), WalletError> {
        if !self.root.has_private() {
            return Err(WalletError::NoPrivateKey);
        }
        let missing: Vec<u32> = self
            .assets
            .iter()
            .filter(|(_, asset)| !asset.has_private())
            .map(|(index, _)| *index)
            .collect();
        for index in missing {
            let clear = self.derive_private(container, index)?;
            let cipher = container.encrypt(&key_id, clear.as_slice())?;
            self.assets
                .get_mut(&index)
                .expect("asset listed as missing")
                .encrypted_private = Some(cipher);
        }
        Ok(())
    }

    /// Register an ECDH salt; returns its (idempotent) index and materializes
    /// the matching asset.
    pub fn add_salt(&mut self, salt: [u8; 32]) -> Result<u32, WalletError> {
        let ChainRoot::Ecdh { salts, .. } = &mut self.root else {
            return Err(WalletError::invalid_input("not a settlement chain"));
        };
        if let Some(existing) = salts.iter().position(|known| *known == salt) {
            return Ok(existing as u32);
        }
        salts.push(salt);
        let index = salts.len() as u32 - 1;
        self.extend_public(1)?;
        Ok(index)
    }

    /// Strip private key material for a watching-only fork.
    pub fn to_watching_only(&self) -> Self {
        let mut copy = self.clone();
        copy.root = self.root.to_watching_only();
        for asset in copy.assets.values_mut() {
            asset.encrypted_private = None;
        }
        copy
    }
}

fn salt_scalar(salt: &[u8; 32]) -> Result<Scalar, WalletError> {
    Scalar::from_be_bytes(*salt).map_err(|_| WalletError::invalid_input("salt out of range"))
}

/// A full account: metadata plus one chain per node.
#[derive(Clone, Debug)]
pub struct AddressAccount {
    pub meta: AccountMeta,
    pub chains: BTreeMap<u32, AssetChain>,
}

impl AddressAccount {
    pub fn id(&self) -> AccountId {
        self.meta.id
    }

    pub fn outer_chain(&self) -> &AssetChain {
        self.chains
            .get(&self.meta.outer_node)
            .expect("outer chain exists")
    }

    /// Validate a requested address type against the capability set.
    fn resolve_type(&self, requested: Option<&AddressType>) -> Result<AddressType, WalletError> {
        match requested {
            None => Ok(self.meta.default_address_type.clone()),
            Some(requested) => {
                if self.meta.address_types.contains(requested) {
                    Ok(requested.clone())
                } else {
                    Err(WalletError::invalid_input("address type not permitted"))
                }
            }
        }
    }

    fn next_on_chain(
        &mut self,
        node: u32,
        requested: Option<&AddressType>,
    ) -> Result<(AssetId, AddressEntry), WalletError> {
        let address_type = self.resolve_type(requested)?;
        let lookup = self.meta.lookup.max(1);

        let chain = self
            .chains
            .get_mut(&node)
            .ok_or_else(|| WalletError::not_found(format!("chain node {node}")))?;
        let state = self.meta.node_state.entry(node).or_default();
        let index = state.used;

        if index >= chain.len() {
            chain.extend_public(lookup)?;
        }
        let asset = chain
            .asset(index)
            .ok_or_else(|| WalletError::not_found(format!("asset index {index}")))?;

        let entry = AddressEntry::single(&address_type, asset.public_key()?)?;
        state.used = index + 1;
        state.instantiated.insert(index, address_type);
        Ok((AssetId::new(self.meta.id, node, index), entry))
    }

    /// Next receiving address on the outer chain.
    pub fn next_address(
        &mut self,
        requested: Option<&AddressType>,
    ) -> Result<(AssetId, AddressEntry), WalletError> {
        self.next_on_chain(self.meta.outer_node, requested)
    }

    /// Next change address on the inner chain (outer when none declared).
    pub fn next_change_address(
        &mut self,
        requested: Option<&AddressType>,
    ) -> Result<(AssetId, AddressEntry), WalletError> {
        let node = self.meta.inner_node.unwrap_or(self.meta.outer_node);
        self.next_on_chain(node, requested)
    }

    /// Every `(prefixed hash, asset id)` pair this account answers for, over
    /// the materialized windows and all permitted single-key types.
    pub fn address_hashes(
        &self,
        settings: &crate::config::NetworkSettings,
    ) -> Result<Vec<(Vec<u8>, AssetId)>, WalletError> {
        let mut out = Vec::new();
        for chain in self.chains.values() {
            for (index, asset) in &chain.assets {
                let public_key = asset.public_key()?;
                for address_type in &self.meta.address_types {
                    if !address_type.is_single_key() {
                        continue;
                    }
                    let entry = AddressEntry::single(address_type, public_key)?;
                    out.push((
                        entry.prefixed_hash(settings),
                        AssetId::new(self.meta.id, chain.node, *index),
                    ));
                }
            }
        }
        Ok(out)
    }

    /// Derivation path from the seed for one of this account's assets, when
    /// the account is path-derived.
    pub fn bip32_path_for_asset(&self, asset_id: &AssetId) -> Option<Vec<u32>> {
        let path = match &self.meta.kind {
            AccountKind::Bip32 { derivation_path }
            | AccountKind::Bip32Salted {
                derivation_path, ..
            } => derivation_path.clone(),
            AccountKind::Armory135 | AccountKind::Ecdh => return None,
        };
        let mut full = path;
        full.push(asset_id.node);
        full.push(asset_id.index);
        Some(full)
    }

    /// Leaf xpub for one of this account's assets (path-derived accounts).
    pub fn xpub_for_asset(&self, asset_id: &AssetId) -> Result<String, WalletError> {
        let chain = self
            .chains
            .get(&asset_id.node)
            .ok_or_else(|| WalletError::not_found("chain node"))?;
        let root = match &chain.root {
            ChainRoot::Bip32 { root } | ChainRoot::Bip32Salted { root, .. } => root,
            _ => return Err(WalletError::invalid_input("account is not path-derived")),
        };
        let node = ChainRoot::bip32_public_node(root)?;
        let leaf = node.derive_public(asset_id.index)?;
        Ok(leaf.to_base58())
    }

    /// Strip private material from every chain.
    pub fn to_watching_only(&self) -> Self {
        let mut copy = self.clone();
        copy.chains = self
            .chains
            .iter()
            .map(|(node, chain)| (*node, chain.to_watching_only()))
            .collect();
        copy
    }
}

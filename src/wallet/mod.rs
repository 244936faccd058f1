//! The wallet façade: composes the encrypted store, the secret container and
//! the derivation engine into the user-facing asset wallet.

mod comments;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::accounts::{
    AccountKind, AccountMeta, AccountSpec, AddressAccount, AssetChain, ChainRoot, ARMORY135_NODE,
    TAG_ARMORY135, TAG_BIP32, TAG_BIP32_SALTED, TAG_ECDH,
};
use crate::addresses::{AddressEntry, AddressType};
use crate::assets::{AccountId, AssetBip32Root, AssetId, AssetSingle};
use crate::config::NetworkSettings;
use crate::crypto::hashes::hash256;
use crate::crypto::kdf::KdfParams;
use crate::crypto::secp;
use crate::db::{codec, schema, StorageParams, WalletStorage};
use crate::derivation::{armory135, bip32::Bip32Node};
use crate::encryption::{
    CipherData, ContainerLock, DecryptedDataContainer, KeyId, PassphrasePrompt,
};
use crate::error::WalletError;

/// Root form a wallet was created from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletKind {
    Armory135,
    Bip32,
}

/// Persisted wallet root entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct WalletRootRecord {
    kind: WalletKind,
    root: AssetBip32Root,
}

/// Default address capability set for seed-created BIP32 wallets.
fn default_bip32_types() -> Vec<AddressType> {
    vec![
        AddressType::P2pkh { compressed: true },
        AddressType::P2wpkh,
        AddressType::P2sh(Box::new(AddressType::P2wpkh)),
    ]
}

/// Legacy capability set for Armory135 wallets.
fn legacy_types() -> Vec<AddressType> {
    vec![
        AddressType::P2pkh { compressed: false },
        AddressType::P2pkh { compressed: true },
        AddressType::P2pk,
    ]
}

fn prompt_of(pass: &[u8]) -> PassphrasePrompt {
    let pass = pass.to_vec();
    Arc::new(move |_| pass.clone())
}

/// Short base58 wallet id derived from a root public key.
fn compute_wallet_id(root_public: &PublicKey) -> String {
    let digest = hash256(&root_public.serialize());
    bs58::encode(&digest[..6]).into_string()
}

/// An encrypted deterministic wallet bound to one sub-database of its
/// environment.
pub struct Wallet {
    storage: WalletStorage,
    settings: NetworkSettings,
    wallet_id: String,
    kind: WalletKind,
    root: AssetBip32Root,
    container: DecryptedDataContainer,
    master_key_id: Option<KeyId>,
    encrypted_seed: Option<CipherData>,
    accounts: BTreeMap<AccountId, AddressAccount>,
    main_account: Option<AccountId>,
    address_cache: HashMap<Vec<u8>, AssetId>,
}

impl Wallet {
    // ------------------------------------------------------------------
    // creation

    /// Create a legacy wallet from a private root key.
    pub fn create_from_private_root_armory135(
        home: &Path,
        root_key: &[u8; 32],
        private_pass: &[u8],
        control_pass: &[u8],
        lookup: u32,
        settings: NetworkSettings,
        kdf: KdfParams,
    ) -> Result<Wallet, WalletError> {
        let root_private = SecretKey::from_slice(root_key)?;
        let root_public = PublicKey::from_secret_key(secp(), &root_private);
        let chaincode = armory135::compute_chaincode(root_key);

        let mut wallet = Wallet::bootstrap(
            home,
            WalletKind::Armory135,
            &root_public,
            chaincode,
            Some(root_key),
            None,
            private_pass,
            control_pass,
            settings,
            kdf,
        )?;
        wallet.create_account_with_pass(AccountSpec::Armory135 { lookup }, private_pass)?;
        Ok(wallet)
    }

    /// Create a watching-only legacy wallet from a public root and chaincode.
    pub fn create_from_public_root_armory135(
        home: &Path,
        root_public: &PublicKey,
        chaincode: [u8; 32],
        control_pass: &[u8],
        lookup: u32,
        settings: NetworkSettings,
        kdf: KdfParams,
    ) -> Result<Wallet, WalletError> {
        let mut wallet = Wallet::bootstrap(
            home,
            WalletKind::Armory135,
            root_public,
            chaincode,
            None,
            None,
            &[],
            control_pass,
            settings,
            kdf,
        )?;
        wallet.create_account_with_pass(AccountSpec::Armory135 { lookup }, &[])?;
        Ok(wallet)
    }

    /// Create a BIP32 wallet and its default account rooted at
    /// `derivation_path` (outer node 0, inner node 1).
    pub fn create_from_seed_bip32(
        home: &Path,
        seed: &[u8],
        derivation_path: &[u32],
        private_pass: &[u8],
        control_pass: &[u8],
        lookup: u32,
        settings: NetworkSettings,
        kdf: KdfParams,
    ) -> Result<Wallet, WalletError> {
        let master = Bip32Node::from_seed(seed)?;
        let mut wallet = Wallet::bootstrap(
            home,
            WalletKind::Bip32,
            master.public_key(),
            *master.chaincode(),
            master
                .private_key()
                .map(|key| key.secret_bytes())
                .as_ref(),
            Some(seed),
            private_pass,
            control_pass,
            settings,
            kdf,
        )?;
        wallet.create_account_with_pass(
            AccountSpec::Bip32 {
                derivation_path: derivation_path.to_vec(),
                nodes: vec![0, 1],
                outer: 0,
                inner: Some(1),
                address_types: default_bip32_types(),
                default_address_type: AddressType::P2wpkh,
                lookup,
                main: true,
            },
            private_pass,
        )?;
        Ok(wallet)
    }

    /// Create a BIP32 wallet with no accounts; accounts are added afterwards.
    pub fn create_blank_bip32(
        home: &Path,
        seed: &[u8],
        private_pass: &[u8],
        control_pass: &[u8],
        settings: NetworkSettings,
        kdf: KdfParams,
    ) -> Result<Wallet, WalletError> {
        let master = Bip32Node::from_seed(seed)?;
        Wallet::bootstrap(
            home,
            WalletKind::Bip32,
            master.public_key(),
            *master.chaincode(),
            master
                .private_key()
                .map(|key| key.secret_bytes())
                .as_ref(),
            Some(seed),
            private_pass,
            control_pass,
            settings,
            kdf,
        )
    }

    /// Shared creation path: environment, containers, root records.
    #[allow(clippy::too_many_arguments)]
    fn bootstrap(
        home: &Path,
        kind: WalletKind,
        root_public: &PublicKey,
        chaincode: [u8; 32],
        root_private: Option<&[u8; 32]>,
        seed: Option<&[u8]>,
        private_pass: &[u8],
        control_pass: &[u8],
        settings: NetworkSettings,
        kdf: KdfParams,
    ) -> Result<Wallet, WalletError> {
        let wallet_id = compute_wallet_id(root_public);
        let path = home.join(format!("wallet_{wallet_id}"));

        let storage = WalletStorage::create(
            &path,
            StorageParams {
                db_cap: 1,
                kdf: kdf.clone(),
            },
            control_pass,
        )?;
        storage.add_sub_db(&wallet_id, prompt_of(control_pass))?;
        storage.set_main_wallet_id(&wallet_id)?;

        // The private container gets its own salt; costs match the control
        // container's calibrated parameters.
        let private_kdf = KdfParams::new(
            kdf.memory_bytes,
            kdf.iterations,
            crate::crypto::cipher::random_array(),
        );
        let (container, master_key_id) =
            DecryptedDataContainer::create(private_kdf.clone(), private_pass)?;
        container.set_prompt(prompt_of(private_pass));

        let seed_fingerprint = {
            use crate::crypto::hashes::hash160;
            hash160(&root_public.serialize())[..4]
                .try_into()
                .expect("hash160 is 20 bytes")
        };

        let (encrypted_seed, encrypted_root) = {
            let _lock = container.lock();
            let encrypted_seed = match seed {
                Some(seed) => Some(container.encrypt(&master_key_id, seed)?),
                None => match root_private {
                    // Legacy wallets treat the root key as their seed.
                    Some(root_key) => Some(container.encrypt(&master_key_id, root_key)?),
                    None => None,
                },
            };
            let encrypted_root = match root_private {
                Some(root_key) => Some(container.encrypt(&master_key_id, root_key)?),
                None => None,
            };
            (encrypted_seed, encrypted_root)
        };
        container.reset_prompt();

        let root = AssetBip32Root {
            base: AssetSingle {
                id: AssetId::new(AccountId([0; 4]), 0, 0),
                public_key: serde_bytes::ByteBuf::from(root_public.serialize().to_vec()),
                encrypted_private: encrypted_root,
            },
            chaincode,
            depth: 0,
            leaf_id: 0,
            parent_fingerprint: [0; 4],
            seed_fingerprint,
            derivation_path: Vec::new(),
        };

        let mut wallet = Wallet {
            storage,
            settings,
            wallet_id,
            kind,
            root,
            container,
            master_key_id: Some(master_key_id),
            encrypted_seed,
            accounts: BTreeMap::new(),
            main_account: None,
            address_cache: HashMap::new(),
        };
        wallet.persist_wallet_header()?;
        info!(wallet = %wallet.wallet_id, "created wallet");
        Ok(wallet)
    }

    fn persist_wallet_header(&self) -> Result<(), WalletError> {
        let tx = self.storage.begin_write(&self.wallet_id)?;
        let record = WalletRootRecord {
            kind: self.kind,
            root: self.root.clone(),
        };
        tx.insert(
            &schema::u32_key(schema::ROOT_ASSET_KEY),
            &codec::encode(&record)?,
        )?;
        if let Some(seed) = &self.encrypted_seed {
            tx.insert(
                &schema::u32_key(schema::WALLET_PRIVATE_SEED_KEY),
                &codec::encode_cipher_data(seed)?,
            )?;
        }
        for kdf in self.container.kdf_params() {
            tx.insert(
                &schema::prefixed_key(schema::PREFIX_KDF, kdf.id().as_bytes()),
                &codec::encode_kdf_params(&kdf)?,
            )?;
        }
        for record in self.container.key_records() {
            tx.insert(
                &schema::prefixed_key(schema::PREFIX_ENCRYPTION_KEY, record.key_id.as_bytes()),
                &codec::encode_key_record(&record)?,
            )?;
        }
        if let Some(main) = &self.main_account {
            tx.insert(
                &schema::u32_key(schema::MAIN_ACCOUNT_KEY),
                &codec::encode(main)?,
            )?;
        }
        tx.commit()
    }

    // ------------------------------------------------------------------
    // loading

    /// Load the main wallet of an environment.
    pub fn load(
        path: &Path,
        control_prompt: PassphrasePrompt,
        settings: NetworkSettings,
    ) -> Result<Wallet, WalletError> {
        let storage = WalletStorage::open(path, control_prompt)?;
        let wallet_id = storage.main_wallet_id()?;

        let container = DecryptedDataContainer::new();
        let mut master_key_id = None;
        let mut encrypted_seed = None;
        let mut root_record: Option<WalletRootRecord> = None;
        let mut main_account = None;
        let mut metas: Vec<AccountMeta> = Vec::new();
        let mut roots: BTreeMap<(AccountId, u32), ChainRoot> = BTreeMap::new();
        let mut assets: BTreeMap<(AccountId, u32), BTreeMap<u32, AssetSingle>> = BTreeMap::new();

        {
            let tx = storage.begin_read(&wallet_id)?;
            for (data_key, data_val) in tx.iter() {
                match data_key.first() {
                    Some(&schema::PREFIX_KDF) => {
                        container.add_kdf(codec::decode_kdf_params(data_val)?);
                    }
                    Some(&schema::PREFIX_ENCRYPTION_KEY) => {
                        let record = codec::decode_key_record(data_val)?;
                        master_key_id = Some(record.key_id);
                        container.add_key_record(record);
                    }
                    Some(&schema::PREFIX_ACCOUNT) => {
                        metas.push(codec::decode(data_val)?);
                    }
                    Some(&schema::PREFIX_ACCOUNT_ROOT) => {
                        let (account, node) = parse_chain_key(data_key)?;
                        roots.insert((account, node), codec::decode(data_val)?);
                    }
                    Some(&schema::PREFIX_ASSET) => {
                        let asset: AssetSingle = codec::decode(data_val)?;
                        assets
                            .entry((asset.id.account, asset.id.node))
                            .or_default()
                            .insert(asset.id.index, asset);
                    }
                    _ => {
                        if data_key == schema::u32_key(schema::WALLET_PRIVATE_SEED_KEY) {
                            encrypted_seed = Some(codec::decode_cipher_data(data_val)?);
                        } else if data_key == schema::u32_key(schema::ROOT_ASSET_KEY) {
                            root_record = Some(codec::decode(data_val)?);
                        } else if data_key == schema::u32_key(schema::MAIN_ACCOUNT_KEY) {
                            main_account = Some(codec::decode(data_val)?);
                        }
                    }
                }
            }
        }

        let root_record =
            root_record.ok_or_else(|| WalletError::not_found("wallet root record"))?;

        let mut accounts = BTreeMap::new();
        for meta in metas {
            let mut chains = BTreeMap::new();
            let node_ids: Vec<u32> = roots
                .range((meta.id, 0)..=(meta.id, u32::MAX))
                .map(|((_, node), _)| *node)
                .collect();
            for node in node_ids {
                let root = roots.remove(&(meta.id, node)).expect("listed node");
                let mut chain = AssetChain::new(meta.id, node, root);
                if let Some(chain_assets) = assets.remove(&(meta.id, node)) {
                    chain.assets = chain_assets;
                }
                chains.insert(node, chain);
            }
            accounts.insert(meta.id, AddressAccount { meta, chains });
        }

        let mut wallet = Wallet {
            storage,
            settings,
            wallet_id,
            kind: root_record.kind,
            root: root_record.root,
            container,
            master_key_id,
            encrypted_seed,
            accounts,
            main_account,
            address_cache: HashMap::new(),
        };
        wallet.rebuild_address_cache()?;
        debug!(wallet = %wallet.wallet_id, accounts = wallet.accounts.len(), "loaded wallet");
        Ok(wallet)
    }

    // ------------------------------------------------------------------
    // accounts

    /// Create an account from a spec; the private passphrase is needed for
    /// hardened derivation on encrypted wallets.
    pub fn create_account(&mut self, spec: AccountSpec) -> Result<AccountId, WalletError> {
        let is_main = spec.is_main();
        let account = self.instantiate_account(spec)?;
        let id = account.id();
        if self.accounts.contains_key(&id) {
            return Err(WalletError::invalid_input("account already exists"));
        }
        self.accounts.insert(id, account);
        if is_main || self.main_account.is_none() {
            self.main_account = Some(id);
        }
        self.persist_wallet_header()?;
        self.persist_account(&id)?;
        self.rebuild_address_cache()?;
        info!(wallet = %self.wallet_id, account = ?id, "created account");
        Ok(id)
    }

    fn create_account_with_pass(
        &mut self,
        spec: AccountSpec,
        private_pass: &[u8],
    ) -> Result<AccountId, WalletError> {
        self.container.set_prompt(prompt_of(private_pass));
        let outcome = self.create_account(spec);
        self.container.reset_prompt();
        outcome
    }

    fn instantiate_account(&self, spec: AccountSpec) -> Result<AddressAccount, WalletError> {
        match spec {
            AccountSpec::Armory135 { lookup } => self.instantiate_armory_account(lookup),
            AccountSpec::Bip32 {
                derivation_path,
                nodes,
                outer,
                inner,
                address_types,
                default_address_type,
                lookup,
                main: _,
            } => self.instantiate_bip32_account(
                derivation_path,
                None,
                nodes,
                outer,
                inner,
                address_types,
                default_address_type,
                lookup,
            ),
            AccountSpec::Bip32Salted {
                derivation_path,
                salt,
                nodes,
                outer,
                inner,
                address_types,
                default_address_type,
                lookup,
                main: _,
            } => self.instantiate_bip32_account(
                derivation_path,
                Some(salt),
                nodes,
                outer,
                inner,
                address_types,
                default_address_type,
                lookup,
            ),
            AccountSpec::Ecdh {
                private_key,
                public_key,
                address_types,
                default_address_type,
                main: _,
            } => self.instantiate_ecdh_account(
                private_key,
                public_key,
                address_types,
                default_address_type,
            ),
        }
    }

    fn instantiate_armory_account(&self, lookup: u32) -> Result<AddressAccount, WalletError> {
        let root_public = self.root.public_key()?;
        let id = AccountId::derive(TAG_ARMORY135, &root_public);

        let root = ChainRoot::Armory135 {
            public_key: self.root.base.public_key.clone(),
            chaincode: self.root.chaincode,
            encrypted_private: self.root.base.encrypted_private.clone(),
        };
        let mut chain = AssetChain::new(id, ARMORY135_NODE, root);
        chain.extend_public(lookup)?;
        if chain.root.has_private() {
            let key_id = self.master_key_id.ok_or(WalletError::NoPrivateKey)?;
            let _lock = self.container.lock();
            chain.extend_private(&self.container, key_id)?;
        }

        let meta = AccountMeta {
            id,
            kind: AccountKind::Armory135,
            outer_node: ARMORY135_NODE,
            inner_node: None,
            address_types: legacy_types(),
            default_address_type: AddressType::P2pkh { compressed: false },
            lookup,
            node_state: BTreeMap::new(),
        };
        let mut chains = BTreeMap::new();
        chains.insert(ARMORY135_NODE, chain);
        Ok(AddressAccount { meta, chains })
    }

    #[allow(clippy::too_many_arguments)]
    fn instantiate_bip32_account(
        &self,
        derivation_path: Vec<u32>,
        salt: Option<[u8; 32]>,
        nodes: Vec<u32>,
        outer: u32,
        inner: Option<u32>,
        address_types: Vec<AddressType>,
        default_address_type: AddressType,
        lookup: u32,
    ) -> Result<AddressAccount, WalletError> {
        if nodes.is_empty() || !nodes.contains(&outer) {
            return Err(WalletError::invalid_input("account node set is invalid"));
        }

        // Resolve the account root node, privately when the wallet holds its
        // root key, publicly otherwise (soft paths only).
        let needs_private = self.root.has_private();
        let _lock;
        let account_node = if needs_private {
            _lock = self.container.lock();
            let clear = self
                .container
                .decrypt(self.root.base.encrypted_private.as_ref().expect("has private"))?;
            let root_key = SecretKey::from_slice(&clear)?;
            let node = Bip32Node::from_private_parts(
                root_key,
                self.root.chaincode,
                self.root.depth,
                self.root.leaf_id,
                self.root.parent_fingerprint,
            );
            node.derive_path(&derivation_path)?
        } else {
            let node = Bip32Node::from_public_parts(
                self.root.public_key()?,
                self.root.chaincode,
                self.root.depth,
                self.root.leaf_id,
                self.root.parent_fingerprint,
            );
            node.derive_path(&derivation_path)?
        };

        let tag = if salt.is_some() { TAG_BIP32_SALTED } else { TAG_BIP32 };
        let id = AccountId::derive(tag, account_node.public_key());

        let mut chains = BTreeMap::new();
        for node_id in &nodes {
            let chain_node = account_node.derive(*node_id)?;
            let mut chain_path = derivation_path.clone();
            chain_path.push(*node_id);

            let encrypted_private = match chain_node.private_key() {
                Some(private_key) => {
                    let key_id = self.master_key_id.ok_or(WalletError::NoPrivateKey)?;
                    let _inner_lock = self.container.lock();
                    Some(
                        self.container
                            .encrypt(&key_id, &private_key.secret_bytes())?,
                    )
                }
                None => None,
            };

            let root_asset = AssetBip32Root {
                base: AssetSingle {
                    id: AssetId::new(id, *node_id, 0),
                    public_key: serde_bytes::ByteBuf::from(
                        chain_node.public_key().serialize().to_vec(),
                    ),
                    encrypted_private,
                },
                chaincode: *chain_node.chaincode(),
                depth: chain_node.depth(),
                leaf_id: chain_node.leaf_id(),
                parent_fingerprint: chain_node.parent_fingerprint(),
                seed_fingerprint: self.root.seed_fingerprint,
                derivation_path: chain_path,
            };
            let root = match salt {
                Some(salt) => ChainRoot::Bip32Salted {
                    root: root_asset,
                    salt,
                },
                None => ChainRoot::Bip32 { root: root_asset },
            };

            let mut chain = AssetChain::new(id, *node_id, root);
            chain.extend_public(lookup.max(1))?;
            if chain.root.has_private() {
                let key_id = self.master_key_id.ok_or(WalletError::NoPrivateKey)?;
                let _inner_lock = self.container.lock();
                chain.extend_private(&self.container, key_id)?;
            }
            chains.insert(*node_id, chain);
        }

        let meta = AccountMeta {
            id,
            kind: match salt {
                Some(salt) => AccountKind::Bip32Salted {
                    derivation_path,
                    salt,
                },
                None => AccountKind::Bip32 { derivation_path },
            },
            outer_node: outer,
            inner_node: inner,
            address_types,
            default_address_type,
            lookup,
            node_state: BTreeMap::new(),
        };
        Ok(AddressAccount { meta, chains })
    }

    fn instantiate_ecdh_account(
        &self,
        private_key: Option<[u8; 32]>,
        public_key: [u8; 33],
        address_types: Vec<AddressType>,
        default_address_type: AddressType,
    ) -> Result<AddressAccount, WalletError> {
        let base_public = PublicKey::from_slice(&public_key)?;
        if let Some(private_key) = &private_key {
            let check = SecretKey::from_slice(private_key)?;
            if PublicKey::from_secret_key(secp(), &check) != base_public {
                return Err(WalletError::invalid_input("ecdh key pair mismatch"));
            }
        }
        let id = AccountId::derive(TAG_ECDH, &base_public);

        let encrypted_private = match private_key {
            Some(private_key) => {
                let key_id = self.master_key_id.ok_or(WalletError::NoPrivateKey)?;
                let _lock = self.container.lock();
                Some(self.container.encrypt(&key_id, &private_key)?)
            }
            None => None,
        };

        let root = ChainRoot::Ecdh {
            public_key: serde_bytes::ByteBuf::from(public_key.to_vec()),
            encrypted_private,
            salts: Vec::new(),
        };
        let chain = AssetChain::new(id, 0, root);

        let meta = AccountMeta {
            id,
            kind: AccountKind::Ecdh,
            outer_node: 0,
            inner_node: None,
            address_types,
            default_address_type,
            lookup: 1,
            node_state: BTreeMap::new(),
        };
        let mut chains = BTreeMap::new();
        chains.insert(0, chain);
        Ok(AddressAccount { meta, chains })
    }

    fn persist_account(&self, id: &AccountId) -> Result<(), WalletError> {
        let account = self
            .accounts
            .get(id)
            .ok_or_else(|| WalletError::not_found("account"))?;

        let tx = self.storage.begin_write(&self.wallet_id)?;
        tx.insert(
            &schema::prefixed_key(schema::PREFIX_ACCOUNT, id.as_bytes()),
            &codec::encode(&account.meta)?,
        )?;
        for (node, chain) in &account.chains {
            tx.insert(&chain_key(id, *node), &codec::encode(&chain.root)?)?;
            for asset in chain.assets.values() {
                tx.insert(&asset_key(&asset.id), &codec::encode(asset)?)?;
            }
        }
        tx.commit()
    }

    /// The account registered as main.
    pub fn main_account_id(&self) -> Option<AccountId> {
        self.main_account
    }

    pub fn account_ids(&self) -> Vec<AccountId> {
        self.accounts.keys().copied().collect()
    }

    pub fn account(&self, id: &AccountId) -> Result<&AddressAccount, WalletError> {
        self.accounts
            .get(id)
            .ok_or_else(|| WalletError::not_found("account"))
    }

    // ------------------------------------------------------------------
    // addresses

    fn next_address_on(
        &mut self,
        account_id: AccountId,
        requested: Option<&AddressType>,
        change: bool,
    ) -> Result<AddressEntry, WalletError> {
        let account = self
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| WalletError::not_found("account"))?;
        let (_, entry) = if change {
            account.next_change_address(requested)?
        } else {
            account.next_address(requested)?
        };
        self.persist_account(&account_id)?;
        self.rebuild_address_cache()?;
        Ok(entry)
    }

    /// Next receiving address on the main account.
    pub fn get_new_address(
        &mut self,
        requested: Option<&AddressType>,
    ) -> Result<AddressEntry, WalletError> {
        let main = self
            .main_account
            .ok_or_else(|| WalletError::not_found("main account"))?;
        self.next_address_on(main, requested, false)
    }

    /// Next change address on the main account.
    pub fn get_new_change_address(
        &mut self,
        requested: Option<&AddressType>,
    ) -> Result<AddressEntry, WalletError> {
        let main = self
            .main_account
            .ok_or_else(|| WalletError::not_found("main account"))?;
        self.next_address_on(main, requested, true)
    }

    /// Next receiving address on a specific account.
    pub fn get_new_address_for_account(
        &mut self,
        account_id: AccountId,
        requested: Option<&AddressType>,
    ) -> Result<AddressEntry, WalletError> {
        self.next_address_on(account_id, requested, false)
    }

    /// Register an ECDH settlement salt; idempotent on the salt value.
    pub fn add_ecdh_salt(
        &mut self,
        account_id: AccountId,
        salt: [u8; 32],
    ) -> Result<u32, WalletError> {
        let account = self
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| WalletError::not_found("account"))?;
        let node = account.meta.outer_node;
        let chain = account
            .chains
            .get_mut(&node)
            .ok_or_else(|| WalletError::not_found("chain node"))?;
        let index = chain.add_salt(salt)?;
        self.persist_account(&account_id)?;
        self.rebuild_address_cache()?;
        Ok(index)
    }

    fn rebuild_address_cache(&mut self) -> Result<(), WalletError> {
        let mut cache = HashMap::new();
        for account in self.accounts.values() {
            for (hash, asset_id) in account.address_hashes(&self.settings)? {
                cache.insert(hash, asset_id);
            }
        }
        self.address_cache = cache;
        Ok(())
    }

    /// Every prefixed script hash this wallet answers for.
    pub fn addr_hash_set(&self) -> BTreeSet<Vec<u8>> {
        self.address_cache.keys().cloned().collect()
    }

    /// Reverse lookup: prefixed script hash to asset.
    pub fn asset_for_hash(&self, hash: &[u8]) -> Option<AssetId> {
        self.address_cache.get(hash).copied()
    }

    /// Reverse lookup: public key to its derivation path from the seed.
    pub fn bip32_path_for_pubkey(&self, public_key: &PublicKey) -> Option<Vec<u32>> {
        let serialized = public_key.serialize();
        for account in self.accounts.values() {
            for chain in account.chains.values() {
                for asset in chain.assets.values() {
                    if asset.public_key.as_slice() == serialized {
                        return account.bip32_path_for_asset(&asset.id);
                    }
                }
            }
        }
        None
    }

    /// Leaf xpub for an asset of a path-derived account.
    pub fn xpub_for_asset(&self, asset_id: &AssetId) -> Result<String, WalletError> {
        self.account(&asset_id.account)?.xpub_for_asset(asset_id)
    }

    /// Asset on the main account's outer chain.
    pub fn main_account_asset(&self, index: u32) -> Result<&AssetSingle, WalletError> {
        let main = self
            .main_account
            .ok_or_else(|| WalletError::not_found("main account"))?;
        let account = self.account(&main)?;
        account
            .outer_chain()
            .asset(index)
            .ok_or_else(|| WalletError::not_found(format!("asset index {index}")))
    }

    /// Clear private key for an asset; requires a held container lock.
    pub fn asset_private_key(
        &self,
        asset_id: &AssetId,
    ) -> Result<Zeroizing<[u8; 32]>, WalletError> {
        let account = self.account(&asset_id.account)?;
        let chain = account
            .chains
            .get(&asset_id.node)
            .ok_or_else(|| WalletError::not_found("chain node"))?;
        chain.derive_private(&self.container, asset_id.index)
    }

    /// Fill encrypted private keys for every materialized asset of an
    /// account; requires the wallet to hold private material.
    pub fn extend_private_chain(&mut self, account_id: AccountId) -> Result<(), WalletError> {
        let key_id = self.master_key_id.ok_or(WalletError::NoPrivateKey)?;
        let account = self
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| WalletError::not_found("account"))?;
        {
            let _lock = self.container.lock();
            for chain in account.chains.values_mut() {
                chain.extend_private(&self.container, key_id)?;
            }
        }
        self.persist_account(&account_id)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // secrets

    /// Scoped unlock of the private-key container.
    pub fn lock_container(&self) -> ContainerLock<'_> {
        self.container.lock()
    }

    /// Install the passphrase prompt driving private-key unlocks.
    pub fn set_passphrase_prompt(&self, prompt: PassphrasePrompt) {
        self.container.set_prompt(prompt);
    }

    /// Remove the passphrase prompt.
    pub fn reset_passphrase_prompt(&self) {
        self.container.reset_prompt();
    }

    /// Decrypt a payload under the private container; requires a held lock.
    pub fn decrypted_value(&self, data: &CipherData) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        self.container.decrypt(data)
    }

    /// The encrypted seed record; absent on watching-only wallets.
    pub fn encrypted_seed(&self) -> Option<&CipherData> {
        self.encrypted_seed.as_ref()
    }

    /// Whether this wallet holds no private material.
    pub fn is_watching_only(&self) -> bool {
        !self.root.has_private()
    }

    /// Change the private-key passphrase: only the master-key record's IV and
    /// ciphertext change; per-asset records keep their bytes.
    pub fn change_private_passphrase(&self, new_passphrase: &[u8]) -> Result<(), WalletError> {
        let key_id = self.master_key_id.ok_or(WalletError::NoPrivateKey)?;
        self.container.change_passphrase(&key_id, new_passphrase)?;
        self.persist_key_records()
    }

    /// Add an additional private-key passphrase.
    pub fn add_private_passphrase(&self, new_passphrase: &[u8]) -> Result<(), WalletError> {
        let key_id = self.master_key_id.ok_or(WalletError::NoPrivateKey)?;
        self.container.add_passphrase(&key_id, new_passphrase)?;
        self.persist_key_records()
    }

    /// Erase the private-key passphrase identified through the prompt.
    pub fn erase_private_passphrase(&self) -> Result<(), WalletError> {
        let key_id = self.master_key_id.ok_or(WalletError::NoPrivateKey)?;
        self.container.erase_passphrase(&key_id)?;
        self.persist_key_records()
    }

    fn persist_key_records(&self) -> Result<(), WalletError> {
        let tx = self.storage.begin_write(&self.wallet_id)?;
        for record in self.container.key_records() {
            tx.insert(
                &schema::prefixed_key(schema::PREFIX_ENCRYPTION_KEY, record.key_id.as_bytes()),
                &codec::encode_key_record(&record)?,
            )?;
        }
        tx.commit()
    }

    /// Change the control passphrase of the backing environment.
    pub fn change_control_passphrase(
        &self,
        prompt: PassphrasePrompt,
        new_passphrase: &[u8],
    ) -> Result<(), WalletError> {
        self.storage.change_control_passphrase(prompt, new_passphrase)
    }

    // ------------------------------------------------------------------
    // lifecycle

    /// Fork a watching-only copy: same public roots and accounts, no private
    /// material, fresh control passphrase, non-main sub-databases dropped.
    pub fn fork_watching_only(
        path: &Path,
        control_prompt: PassphrasePrompt,
        new_control_pass: &[u8],
        settings: NetworkSettings,
    ) -> Result<PathBuf, WalletError> {
        let source = Wallet::load(path, control_prompt, settings)?;

        let fork_path = path.with_file_name(format!(
            "{}_watchonly",
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "wallet".to_string())
        ));
        if fork_path.exists() {
            std::fs::remove_dir_all(&fork_path)?;
        }

        let control_kdf = source
            .storage
            .control_container()
            .kdf_params()
            .into_iter()
            .next()
            .map(|params| {
                KdfParams::new(
                    params.memory_bytes,
                    params.iterations,
                    crate::crypto::cipher::random_array(),
                )
            })
            .ok_or_else(|| WalletError::not_found("control kdf"))?;

        let storage = WalletStorage::create(
            &fork_path,
            StorageParams {
                db_cap: 1,
                kdf: control_kdf,
            },
            new_control_pass,
        )?;
        storage.add_sub_db(&source.wallet_id, prompt_of(new_control_pass))?;
        storage.set_main_wallet_id(&source.wallet_id)?;

        let fork = Wallet {
            storage,
            settings,
            wallet_id: source.wallet_id.clone(),
            kind: source.kind,
            root: AssetBip32Root {
                base: AssetSingle {
                    encrypted_private: None,
                    ..source.root.base.clone()
                },
                ..source.root.clone()
            },
            container: DecryptedDataContainer::new(),
            master_key_id: None,
            encrypted_seed: None,
            accounts: source
                .accounts
                .iter()
                .map(|(id, account)| (*id, account.to_watching_only()))
                .collect(),
            main_account: source.main_account,
            address_cache: HashMap::new(),
        };
        fork.persist_wallet_header()?;
        for id in fork.accounts.keys() {
            fork.persist_account(id)?;
        }

        info!(wallet = %fork.wallet_id, path = %fork_path.display(), "forked watching-only wallet");
        Ok(fork_path)
    }

    /// The wallet's stable identifier (also its sub-database name).
    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    /// Root public key of the wallet.
    pub fn public_root(&self) -> Result<PublicKey, WalletError> {
        self.root.public_key()
    }

    /// Chaincode of a legacy root.
    pub fn armory135_chaincode(&self) -> [u8; 32] {
        self.root.chaincode
    }

    /// Backing storage engine.
    pub fn storage(&self) -> &WalletStorage {
        &self.storage
    }

    /// Network parameters this wallet encodes addresses with.
    pub fn network_settings(&self) -> &NetworkSettings {
        &self.settings
    }
}

fn chain_key(account: &AccountId, node: u32) -> Vec<u8> {
    let mut suffix = account.as_bytes().to_vec();
    suffix.extend_from_slice(&node.to_be_bytes());
    schema::prefixed_key(schema::PREFIX_ACCOUNT_ROOT, &suffix)
}

fn asset_key(asset_id: &AssetId) -> Vec<u8> {
    let mut suffix = asset_id.account.as_bytes().to_vec();
    suffix.extend_from_slice(&asset_id.node.to_be_bytes());
    suffix.extend_from_slice(&asset_id.index.to_be_bytes());
    schema::prefixed_key(schema::PREFIX_ASSET, &suffix)
}

fn parse_chain_key(data_key: &[u8]) -> Result<(AccountId, u32), WalletError> {
    if data_key.len() != 9 {
        return Err(WalletError::invalid_input("bad chain root key"));
    }
    let account = AccountId(data_key[1..5].try_into().expect("checked length"));
    let node = u32::from_be_bytes(data_key[5..9].try_into().expect("checked length"));
    Ok((account, node))
}

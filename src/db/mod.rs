//! The transactional encrypted key-value engine: plaintext bootstrap region,
//! control container, encrypted sub-databases and their transactions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use storage_kv::KvEnv;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::crypto::cipher::random_array;
use crate::crypto::kdf::KdfParams;
use crate::encryption::{CipherData, DecryptedDataContainer, PassphrasePrompt};
use crate::error::WalletError;

pub mod codec;
pub mod record;
pub mod schema;
pub mod subdb;
pub mod tx;

pub use tx::{ReadTx, WriteTx};

use codec::{ControlHeader, SubDbHeader};
use subdb::{Snapshot, Staging, SubDb};
use tx::TxRegistry;

/// Parameters for creating a fresh environment.
pub struct StorageParams {
    /// Number of wallet sub-databases the environment may hold.
    pub db_cap: u32,
    /// Calibrated KDF parameters for the control master key.
    pub kdf: KdfParams,
}

/// Transactional encrypted key-value store over one KV environment.
pub struct WalletStorage {
    inner: Arc<StorageInner>,
}

impl std::fmt::Debug for WalletStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletStorage").finish()
    }
}

pub(crate) struct StorageInner {
    path: PathBuf,
    env: Mutex<Option<KvEnv>>,
    subdbs: RwLock<BTreeMap<String, Arc<Mutex<SubDb>>>>,
    pub(crate) registry: Mutex<TxRegistry>,
    control: ControlState,
}

struct ControlState {
    header: ControlHeader,
    container: DecryptedDataContainer,
    seed_cipher: Mutex<CipherData>,
    db_cap: Mutex<u32>,
}

impl StorageInner {
    fn with_env<R>(
        &self,
        op: impl FnOnce(&mut KvEnv) -> Result<R, WalletError>,
    ) -> Result<R, WalletError> {
        let mut guard = self.env.lock();
        let env = guard
            .as_mut()
            .ok_or_else(|| WalletError::invalid_input("environment is shut down"))?;
        op(env)
    }

    fn subdb(&self, name: &str) -> Result<Arc<Mutex<SubDb>>, WalletError> {
        self.subdbs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| WalletError::not_found(format!("invalid db name: {name}")))
    }

    pub(crate) fn subdb_snapshot(&self, name: &str) -> Result<Snapshot, WalletError> {
        Ok(self.subdb(name)?.lock().snapshot())
    }

    pub(crate) fn commit_subdb(&self, name: &str, staging: Staging) -> Result<(), WalletError> {
        let subdb = self.subdb(name)?;
        self.with_env(|env| subdb.lock().commit(env, staging))
    }

    /// Decrypt the control seed under a scoped control-container lock.
    fn with_control_seed<R>(
        &self,
        op: impl FnOnce(&[u8]) -> Result<R, WalletError>,
    ) -> Result<R, WalletError> {
        let _lock = self.control.container.lock();
        let seed = self
            .control
            .container
            .decrypt(&self.control.seed_cipher.lock())?;
        op(&seed)
    }
}

impl WalletStorage {
    /// Create a fresh environment: control bootstrap records, control master
    /// key under `control_pass` (empty = unencrypted), headers and comments
    /// sub-databases.
    pub fn create(
        path: &Path,
        params: StorageParams,
        control_pass: &[u8],
    ) -> Result<Self, WalletError> {
        let mut env = KvEnv::open(path, schema::BUILTIN_DB_COUNT + params.db_cap as usize)?;
        env.open_db(schema::CONTROL_DB_NAME)?;
        env.open_db(schema::HEADERS_DB_NAME)?;
        env.open_db(schema::COMMENTS_DB_NAME)?;

        let kdf_id = params.kdf.id();
        let (container, master_key_id) =
            DecryptedDataContainer::create(params.kdf.clone(), control_pass)?;

        let seed = Zeroizing::new(random_array::<32>());
        let seed_cipher = {
            let pass = control_pass.to_vec();
            container.set_prompt(Arc::new(move |_| pass.clone()));
            let _lock = container.lock();
            let cipher = container.encrypt(&master_key_id, seed.as_slice())?;
            drop(_lock);
            container.reset_prompt();
            cipher
        };

        let header = ControlHeader {
            version: schema::ENCRYPTION_VERSION,
            salt: random_array(),
            kdf_id,
            master_key_id,
        };

        // Bootstrap region: plaintext keys, ciphertext-only sensitive values.
        env.put(
            schema::CONTROL_DB_NAME,
            schema::prefixed_key(schema::PREFIX_HEADER, schema::CONTROL_DB_NAME.as_bytes()),
            codec::encode_control_header(&header)?,
        )?;
        env.put(
            schema::CONTROL_DB_NAME,
            schema::prefixed_key(schema::PREFIX_KDF, kdf_id.as_bytes()),
            codec::encode_kdf_params(&params.kdf)?,
        )?;
        let key_record = container
            .key_record(&master_key_id)
            .expect("master key just created");
        env.put(
            schema::CONTROL_DB_NAME,
            schema::prefixed_key(schema::PREFIX_ENCRYPTION_KEY, master_key_id.as_bytes()),
            codec::encode_key_record(&key_record)?,
        )?;
        env.put(
            schema::CONTROL_DB_NAME,
            schema::u32_key(schema::WALLET_SEED_KEY),
            codec::encode_cipher_data(&seed_cipher)?,
        )?;
        env.put(
            schema::CONTROL_DB_NAME,
            schema::u32_key(schema::DB_COUNT_KEY),
            codec::encode_u32(params.db_cap)?,
        )?;
        env.commit()?;

        let headers_db = SubDb::load(&env, schema::HEADERS_DB_NAME, &header.salt, seed.as_slice())?;

        let comments_header = SubDbHeader {
            version: schema::ENCRYPTION_VERSION,
            name: schema::COMMENTS_DB_NAME.to_string(),
            salt: random_array(),
            kdf_id,
            default_key_id: master_key_id,
        };
        let comments_db = SubDb::load(
            &env,
            schema::COMMENTS_DB_NAME,
            &comments_header.salt,
            seed.as_slice(),
        )?;

        let mut subdbs = BTreeMap::new();
        subdbs.insert(
            schema::HEADERS_DB_NAME.to_string(),
            Arc::new(Mutex::new(headers_db)),
        );
        subdbs.insert(
            schema::COMMENTS_DB_NAME.to_string(),
            Arc::new(Mutex::new(comments_db)),
        );

        let storage = WalletStorage {
            inner: Arc::new(StorageInner {
                path: path.to_path_buf(),
                env: Mutex::new(Some(env)),
                subdbs: RwLock::new(subdbs),
                registry: Mutex::new(TxRegistry::default()),
                control: ControlState {
                    header,
                    container,
                    seed_cipher: Mutex::new(seed_cipher),
                    db_cap: Mutex::new(params.db_cap),
                },
            }),
        };

        // The comments store is enumerated like any other sub-database.
        let tx = storage.begin_write(schema::HEADERS_DB_NAME)?;
        tx.insert(
            &schema::prefixed_key(schema::PREFIX_HEADER, schema::COMMENTS_DB_NAME.as_bytes()),
            &codec::encode_subdb_header(&comments_header)?,
        )?;
        tx.commit()?;

        info!(path = %path.display(), "created wallet environment");
        Ok(storage)
    }

    /// Open an existing environment, unlocking the control container through
    /// `prompt` and verifying every sub-database record.
    pub fn open(path: &Path, prompt: PassphrasePrompt) -> Result<Self, WalletError> {
        // The slot count is fixed at open, so bootstrap in two phases: read
        // the persisted cap first, then reopen with it.
        let (header, kdf, key_record, seed_cipher, db_cap) = {
            let probe = KvEnv::open(path, 0)?;
            let header_bytes = probe
                .get(
                    schema::CONTROL_DB_NAME,
                    &schema::prefixed_key(
                        schema::PREFIX_HEADER,
                        schema::CONTROL_DB_NAME.as_bytes(),
                    ),
                )
                .ok_or_else(|| WalletError::not_found("control header"))?;
            let header = codec::decode_control_header(&header_bytes)?;

            let kdf_bytes = probe
                .get(
                    schema::CONTROL_DB_NAME,
                    &schema::prefixed_key(schema::PREFIX_KDF, header.kdf_id.as_bytes()),
                )
                .ok_or_else(|| WalletError::not_found("control kdf record"))?;
            let kdf = codec::decode_kdf_params(&kdf_bytes)?;

            let key_bytes = probe
                .get(
                    schema::CONTROL_DB_NAME,
                    &schema::prefixed_key(
                        schema::PREFIX_ENCRYPTION_KEY,
                        header.master_key_id.as_bytes(),
                    ),
                )
                .ok_or_else(|| WalletError::not_found("control master key record"))?;
            let key_record = codec::decode_key_record(&key_bytes)?;

            let seed_bytes = probe
                .get(
                    schema::CONTROL_DB_NAME,
                    &schema::u32_key(schema::WALLET_SEED_KEY),
                )
                .ok_or_else(|| WalletError::not_found("control seed record"))?;
            let seed_cipher = codec::decode_cipher_data(&seed_bytes)?;

            let cap_bytes = probe
                .get(schema::CONTROL_DB_NAME, &schema::u32_key(schema::DB_COUNT_KEY))
                .ok_or_else(|| WalletError::not_found("db count record"))?;
            let db_cap = codec::decode_u32(&cap_bytes)?;

            (header, kdf, key_record, seed_cipher, db_cap)
        };

        let env = KvEnv::open(path, schema::BUILTIN_DB_COUNT + db_cap as usize)?;

        let container = DecryptedDataContainer::new();
        container.add_kdf(kdf);
        container.add_key_record(key_record);
        container.set_prompt(prompt);

        let mut subdbs = BTreeMap::new();
        {
            let _lock = container.lock();
            let seed = container.decrypt(&seed_cipher)?;

            let headers_db =
                SubDb::load(&env, schema::HEADERS_DB_NAME, &header.salt, seed.as_slice())?;
            let headers_snapshot = headers_db.snapshot();
            subdbs.insert(
                schema::HEADERS_DB_NAME.to_string(),
                Arc::new(Mutex::new(headers_db)),
            );

            for (data_key, data_val) in headers_snapshot.iter() {
                if data_key.first() != Some(&schema::PREFIX_HEADER) {
                    continue;
                }
                let subdb_header = codec::decode_subdb_header(&data_val.value)?;
                let subdb = SubDb::load(&env, &subdb_header.name, &subdb_header.salt, seed.as_slice())?;
                subdbs.insert(subdb_header.name.clone(), Arc::new(Mutex::new(subdb)));
            }
        }
        container.reset_prompt();

        debug!(
            path = %path.display(),
            subdbs = subdbs.len(),
            "opened wallet environment"
        );

        Ok(WalletStorage {
            inner: Arc::new(StorageInner {
                path: path.to_path_buf(),
                env: Mutex::new(Some(env)),
                subdbs: RwLock::new(subdbs),
                registry: Mutex::new(TxRegistry::default()),
                control: ControlState {
                    header,
                    container,
                    seed_cipher: Mutex::new(seed_cipher),
                    db_cap: Mutex::new(db_cap),
                },
            }),
        })
    }

    /// Environment directory.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Begin a scoped read transaction on a sub-database.
    pub fn begin_read(&self, name: &str) -> Result<ReadTx, WalletError> {
        self.inner.with_env(|_| Ok(()))?;
        let snapshot = self.inner.subdb_snapshot(name)?;
        self.inner.registry.lock().enter_read()?;
        Ok(ReadTx::new(Arc::clone(&self.inner), snapshot))
    }

    /// Begin a scoped write transaction on a sub-database.
    pub fn begin_write(&self, name: &str) -> Result<WriteTx, WalletError> {
        self.inner.with_env(|_| Ok(()))?;
        self.inner.subdb(name)?;
        self.inner.registry.lock().enter_write(name)?;
        Ok(WriteTx::new(Arc::clone(&self.inner), name.to_string()))
    }

    /// Live logical entry count of a sub-database.
    pub fn entry_count(&self, name: &str) -> Result<usize, WalletError> {
        Ok(self.inner.subdb(name)?.lock().entry_count())
    }

    /// Names of the wallet sub-databases (builtin stores excluded).
    pub fn wallet_db_names(&self) -> Vec<String> {
        self.inner
            .subdbs
            .read()
            .keys()
            .filter(|name| {
                name.as_str() != schema::HEADERS_DB_NAME
                    && name.as_str() != schema::COMMENTS_DB_NAME
            })
            .cloned()
            .collect()
    }

    /// Whether `name` designates a known sub-database.
    pub fn has_sub_db(&self, name: &str) -> bool {
        self.inner.subdbs.read().contains_key(name)
    }

    /// Number of wallet sub-databases currently present.
    pub fn wallet_db_count(&self) -> usize {
        self.wallet_db_names().len()
    }

    /// Persisted sub-database slot cap.
    pub fn db_cap(&self) -> u32 {
        *self.inner.control.db_cap.lock()
    }

    /// Raise the sub-database slot cap. Refused while any transaction is
    /// live; the underlying environment is reopened with the new slot count.
    pub fn set_db_count(&self, cap: u32) -> Result<(), WalletError> {
        if self.inner.registry.lock().live > 0 {
            return Err(WalletError::Busy("live transactions, cannot change db count"));
        }
        let cap = cap.max(self.wallet_db_count() as u32);

        let mut guard = self.inner.env.lock();
        let env = guard
            .as_mut()
            .ok_or_else(|| WalletError::invalid_input("environment is shut down"))?;
        env.put(
            schema::CONTROL_DB_NAME,
            schema::u32_key(schema::DB_COUNT_KEY),
            codec::encode_u32(cap)?,
        )?;
        env.commit()?;

        // Slot count is fixed at open; apply the new cap by reopening.
        *guard = None;
        let reopened = KvEnv::open(&self.inner.path, schema::BUILTIN_DB_COUNT + cap as usize)?;
        *guard = Some(reopened);
        drop(guard);

        *self.inner.control.db_cap.lock() = cap;
        Ok(())
    }

    /// Register a new wallet sub-database. Requires unlocking the control
    /// container through `prompt`; fails when the slot cap is reached or the
    /// name is taken.
    pub fn add_sub_db(&self, name: &str, prompt: PassphrasePrompt) -> Result<(), WalletError> {
        if self.has_sub_db(name) || name == schema::CONTROL_DB_NAME {
            return Err(WalletError::invalid_input("header already in map"));
        }
        if self.wallet_db_count() as u32 >= self.db_cap() {
            return Err(WalletError::invalid_input("db count is too low"));
        }

        let header = SubDbHeader {
            version: schema::ENCRYPTION_VERSION,
            name: name.to_string(),
            salt: random_array(),
            kdf_id: self.inner.control.header.kdf_id,
            default_key_id: self.inner.control.header.master_key_id,
        };

        self.inner.control.container.set_prompt(prompt);
        let loaded = self.inner.with_control_seed(|seed| {
            self.inner.with_env(|env| {
                env.open_db(name)?;
                SubDb::load(env, name, &header.salt, seed)
            })
        });
        self.inner.control.container.reset_prompt();
        let subdb = loaded?;

        self.inner
            .subdbs
            .write()
            .insert(name.to_string(), Arc::new(Mutex::new(subdb)));

        let tx = self.begin_write(schema::HEADERS_DB_NAME)?;
        tx.insert(
            &schema::prefixed_key(schema::PREFIX_HEADER, name.as_bytes()),
            &codec::encode_subdb_header(&header)?,
        )?;
        tx.commit()?;

        info!(subdb = name, "added wallet sub-database");
        Ok(())
    }

    /// Main wallet id recorded in the control region.
    pub fn main_wallet_id(&self) -> Result<String, WalletError> {
        let bytes = self
            .inner
            .with_env(|env| {
                Ok(env.get(
                    schema::CONTROL_DB_NAME,
                    &schema::u32_key(schema::MAIN_WALLET_KEY),
                ))
            })?
            .ok_or_else(|| WalletError::not_found("main wallet id"))?;
        codec::decode_wallet_id(&bytes)
    }

    /// Record the main wallet id in the control region.
    pub fn set_main_wallet_id(&self, id: &str) -> Result<(), WalletError> {
        self.inner.with_env(|env| {
            env.put(
                schema::CONTROL_DB_NAME,
                schema::u32_key(schema::MAIN_WALLET_KEY),
                codec::encode_wallet_id(id),
            )?;
            env.commit()?;
            Ok(())
        })
    }

    /// The control container gating the control seed.
    pub fn control_container(&self) -> &DecryptedDataContainer {
        &self.inner.control.container
    }

    /// Change the control passphrase, rewriting only the control master-key
    /// record.
    pub fn change_control_passphrase(
        &self,
        prompt: PassphrasePrompt,
        new_passphrase: &[u8],
    ) -> Result<(), WalletError> {
        let master_key_id = self.inner.control.header.master_key_id;
        self.inner.control.container.set_prompt(prompt);
        let outcome = self
            .inner
            .control
            .container
            .change_passphrase(&master_key_id, new_passphrase);
        self.inner.control.container.reset_prompt();
        outcome?;

        let record = self
            .inner
            .control
            .container
            .key_record(&master_key_id)
            .expect("control master key record exists");
        self.inner.with_env(|env| {
            env.put(
                schema::CONTROL_DB_NAME,
                schema::prefixed_key(schema::PREFIX_ENCRYPTION_KEY, master_key_id.as_bytes()),
                codec::encode_key_record(&record)?,
            )?;
            env.commit()?;
            Ok(())
        })
    }

    /// Close the environment. Refused while any transaction is live.
    pub fn shutdown(&self) -> Result<(), WalletError> {
        if self.inner.registry.lock().live > 0 {
            return Err(WalletError::Busy("live transactions, cannot shutdown env"));
        }
        *self.inner.env.lock() = None;
        self.inner.subdbs.write().clear();
        info!(path = %self.inner.path.display(), "environment shut down");
        Ok(())
    }
}

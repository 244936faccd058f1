use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::kdf::{KdfId, KdfParams};
use crate::encryption::data::{CipherData, EncryptedKeyRecord, KeyId};
use crate::error::WalletError;

/// Callback asked for the passphrase unlocking a set of master keys.
/// Returning an empty passphrase aborts the unlock.
pub type PassphrasePrompt = Arc<dyn Fn(&BTreeSet<KeyId>) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct KeyCache {
    depth: u32,
    masters: BTreeMap<KeyId, Zeroizing<[u8; 32]>>,
}

impl KeyCache {
    fn wipe(&mut self) {
        for (_, mut master) in std::mem::take(&mut self.masters) {
            master.zeroize();
        }
    }
}

/// Passphrase-gated container for master encryption keys.
///
/// Decrypted masters are cached only while a [`ContainerLock`] is held; the
/// cache is zeroized when the outermost lock is released. The lock is
/// re-entrant on a thread and exclusive across threads.
pub struct DecryptedDataContainer {
    records: Mutex<ContainerRecords>,
    cache: ReentrantMutex<RefCell<KeyCache>>,
    prompt: Mutex<Option<PassphrasePrompt>>,
}

struct ContainerRecords {
    keys: BTreeMap<KeyId, EncryptedKeyRecord>,
    kdfs: BTreeMap<KdfId, KdfParams>,
}

/// Scoped unlock of a [`DecryptedDataContainer`]. Dropping the outermost
/// guard wipes every cached master key.
pub struct ContainerLock<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<KeyCache>>,
}

impl Drop for ContainerLock<'_> {
    fn drop(&mut self) {
        let mut cache = self.guard.borrow_mut();
        cache.depth -= 1;
        if cache.depth == 0 {
            cache.wipe();
        }
    }
}

impl DecryptedDataContainer {
    /// Fresh container with no key material.
    pub fn new() -> Self {
        DecryptedDataContainer {
            records: Mutex::new(ContainerRecords {
                keys: BTreeMap::new(),
                kdfs: BTreeMap::new(),
            }),
            cache: ReentrantMutex::new(RefCell::new(KeyCache::default())),
            prompt: Mutex::new(None),
        }
    }

    /// Create a container holding one master key gated by `passphrase`
    /// (empty = unencrypted). Returns the container and the id of the master
    /// key.
    pub fn create(kdf: KdfParams, passphrase: &[u8]) -> Result<(Self, KeyId), WalletError> {
        let container = DecryptedDataContainer::new();
        let key_id = KeyId::random();
        let kdf_id = kdf.id();

        let master = Zeroizing::new(crate::crypto::cipher::random_array::<32>());
        let effective = if passphrase.is_empty() { &[][..] } else { passphrase };
        let derived = kdf.derive(effective)?;
        let record = EncryptedKeyRecord::create(
            key_id,
            kdf_id,
            &derived,
            &master,
            passphrase.is_empty(),
        );

        {
            let mut records = container.records.lock();
            records.kdfs.insert(kdf_id, kdf);
            records.keys.insert(key_id, record);
        }
        Ok((container, key_id))
    }

    /// Install the passphrase prompt used by unlock loops.
    pub fn set_prompt(&self, prompt: PassphrasePrompt) {
        *self.prompt.lock() = Some(prompt);
    }

    /// Remove the passphrase prompt.
    pub fn reset_prompt(&self) {
        *self.prompt.lock() = None;
    }

    /// Register a persisted key record (during wallet load).
    pub fn add_key_record(&self, record: EncryptedKeyRecord) {
        self.records.lock().keys.insert(record.key_id, record);
    }

    /// Register persisted KDF parameters (during wallet load).
    pub fn add_kdf(&self, params: KdfParams) {
        self.records.lock().kdfs.insert(params.id(), params);
    }

    /// Snapshot of every key record, for persistence.
    pub fn key_records(&self) -> Vec<EncryptedKeyRecord> {
        self.records.lock().keys.values().cloned().collect()
    }

    /// Snapshot of every KDF parameter set, for persistence.
    pub fn kdf_params(&self) -> Vec<KdfParams> {
        self.records.lock().kdfs.values().cloned().collect()
    }

    /// A key record by id.
    pub fn key_record(&self, key_id: &KeyId) -> Option<EncryptedKeyRecord> {
        self.records.lock().keys.get(key_id).cloned()
    }

    /// Whether the container holds exactly one master gated by the default
    /// empty passphrase.
    pub fn is_unencrypted(&self, key_id: &KeyId) -> bool {
        self.records
            .lock()
            .keys
            .get(key_id)
            .map(|record| record.default_encrypted)
            .unwrap_or(false)
    }

    /// Acquire the scoped lock. Re-entrant on the calling thread; other
    /// threads block until every guard is dropped.
    pub fn lock(&self) -> ContainerLock<'_> {
        let guard = self.cache.lock();
        guard.borrow_mut().depth += 1;
        ContainerLock { guard }
    }

    fn with_cache<R>(
        &self,
        op: impl FnOnce(&mut KeyCache) -> Result<R, WalletError>,
    ) -> Result<R, WalletError> {
        // Re-entrant try_lock succeeds for the holding thread and fails for
        // everyone else; a zero depth means nobody holds the scope.
        let guard = self.cache.try_lock().ok_or(WalletError::NotLocked)?;
        let mut cache = guard.borrow_mut();
        if cache.depth == 0 {
            return Err(WalletError::NotLocked);
        }
        op(&mut cache)
    }

    /// Decrypt `data` under its master key. Requires an active lock; the
    /// master is unlocked through the prompt on first use and cached for the
    /// lock scope.
    pub fn decrypt(&self, data: &CipherData) -> Result<Zeroizing<Vec<u8>>, WalletError> {
        self.with_cache(|cache| {
            self.materialize_master(cache, &data.key_id)?;
            let master = cache.masters.get(&data.key_id).expect("just materialized");
            data.decrypt(master)
        })
    }

    /// Encrypt `plaintext` under the master key `key_id`. Requires an active
    /// lock.
    pub fn encrypt(&self, key_id: &KeyId, plaintext: &[u8]) -> Result<CipherData, WalletError> {
        self.with_cache(|cache| {
            self.materialize_master(cache, key_id)?;
            let master = cache.masters.get(key_id).expect("just materialized");
            let kdf_id = self
                .records
                .lock()
                .keys
                .get(key_id)
                .expect("record exists for materialized master")
                .kdf_id;
            Ok(CipherData::encrypt(*key_id, kdf_id, master, plaintext))
        })
    }

    /// Unlock the master into the cache, trying the default passphrase first
    /// and then looping on the prompt.
    fn materialize_master(
        &self,
        cache: &mut KeyCache,
        key_id: &KeyId,
    ) -> Result<(), WalletError> {
        if cache.masters.contains_key(key_id) {
            return Ok(());
        }
        let (master, _) = self.unlock_master(key_id)?;
        cache.masters.insert(*key_id, master);
        Ok(())
    }

    /// Run the unlock protocol for one master key. Returns the key and the
    /// index of the cipher entry that matched.
    fn unlock_master(
        &self,
        key_id: &KeyId,
    ) -> Result<(Zeroizing<[u8; 32]>, usize), WalletError> {
        let (record, kdf) = {
            let records = self.records.lock();
            let record = records
                .keys
                .get(key_id)
                .cloned()
                .ok_or_else(|| WalletError::not_found("encryption key record"))?;
            let kdf = records
                .kdfs
                .get(&record.kdf_id)
                .cloned()
                .ok_or_else(|| WalletError::not_found("kdf record"))?;
            (record, kdf)
        };

        // Unencrypted wallets unlock silently; no prompt round-trip.
        let derived = kdf.derive(&[])?;
        if let Some(hit) = record.try_unlock(&derived) {
            return Ok(hit);
        }

        let prompt = self
            .prompt
            .lock()
            .clone()
            .ok_or(WalletError::EmptyPassphrase)?;
        let mut ids = BTreeSet::new();
        ids.insert(*key_id);

        loop {
            let passphrase = Zeroizing::new(prompt(&ids));
            if passphrase.is_empty() {
                return Err(WalletError::EmptyPassphrase);
            }
            let derived = kdf.derive(&passphrase)?;
            if let Some(hit) = record.try_unlock(&derived) {
                return Ok(hit);
            }
            debug!("passphrase rejected for key {:02x?}", key_id.as_bytes());
        }
    }

    fn ensure_not_locked(&self) -> Result<(), WalletError> {
        let guard = self.cache.try_lock().ok_or(WalletError::AlreadyLocked)?;
        if guard.borrow().depth != 0 {
            return Err(WalletError::AlreadyLocked);
        }
        Ok(())
    }

    /// Re-encrypt the master key `key_id` under a new passphrase, rotating
    /// only the matched entry's IV and ciphertext. An empty new passphrase
    /// turns the container into an unencrypted one.
    pub fn change_passphrase(
        &self,
        key_id: &KeyId,
        new_passphrase: &[u8],
    ) -> Result<(), WalletError> {
        self.ensure_not_locked()?;
        let (master, index) = self.unlock_master(key_id)?;

        let mut records = self.records.lock();
        let record = records
            .keys
            .get(key_id)
            .ok_or_else(|| WalletError::not_found("encryption key record"))?;
        let kdf = records
            .kdfs
            .get(&record.kdf_id)
            .cloned()
            .ok_or_else(|| WalletError::not_found("kdf record"))?;

        let effective = if new_passphrase.is_empty() { &[][..] } else { new_passphrase };
        let derived = kdf.derive(effective)?;
        let record = records.keys.get_mut(key_id).expect("checked above");
        record.replace_entry(index, &derived, &master);
        record.default_encrypted = new_passphrase.is_empty();
        Ok(())
    }

    /// Append an additional passphrase able to unlock `key_id`.
    pub fn add_passphrase(
        &self,
        key_id: &KeyId,
        new_passphrase: &[u8],
    ) -> Result<(), WalletError> {
        self.ensure_not_locked()?;
        if new_passphrase.is_empty() {
            return Err(WalletError::EmptyPassphrase);
        }
        if self.is_unencrypted(key_id) {
            return Err(WalletError::CannotAddPassphraseToUnencrypted);
        }
        let (master, _) = self.unlock_master(key_id)?;

        let mut records = self.records.lock();
        let record = records
            .keys
            .get(key_id)
            .ok_or_else(|| WalletError::not_found("encryption key record"))?;
        let kdf = records
            .kdfs
            .get(&record.kdf_id)
            .cloned()
            .ok_or_else(|| WalletError::not_found("kdf record"))?;
        let derived = kdf.derive(new_passphrase)?;
        records
            .keys
            .get_mut(key_id)
            .expect("checked above")
            .push_entry(&derived, &master);
        Ok(())
    }

    /// Remove the passphrase the prompt identifies. The master key itself is
    /// unchanged; erasing the last entry is rejected.
    pub fn erase_passphrase(&self, key_id: &KeyId) -> Result<(), WalletError> {
        self.ensure_not_locked()?;
        let (_, index) = self.unlock_master(key_id)?;

        let mut records = self.records.lock();
        let record = records
            .keys
            .get_mut(key_id)
            .ok_or_else(|| WalletError::not_found("encryption key record"))?;
        if record.entries.len() <= 1 {
            return Err(WalletError::invalid_input(
                "cannot erase the last passphrase entry",
            ));
        }
        record.entries.remove(index);
        Ok(())
    }
}

impl Default for DecryptedDataContainer {
    fn default() -> Self {
        DecryptedDataContainer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kdf::KdfParams;

    fn kdf() -> KdfParams {
        KdfParams::new(1024 * 1024, 1, [11u8; 32])
    }

    fn prompt_for(pass: &'static [u8]) -> PassphrasePrompt {
        Arc::new(move |_ids: &BTreeSet<KeyId>| pass.to_vec())
    }

    #[test]
    fn decrypt_requires_lock() {
        let (container, key_id) = DecryptedDataContainer::create(kdf(), b"").expect("create");
        let data = {
            let _lock = container.lock();
            container.encrypt(&key_id, b"secret").expect("encrypt")
        };

        assert!(matches!(
            container.decrypt(&data),
            Err(WalletError::NotLocked)
        ));

        let _lock = container.lock();
        let plain = container.decrypt(&data).expect("decrypt");
        assert_eq!(plain.as_slice(), b"secret");
    }

    #[test]
    fn lock_is_reentrant() {
        let (container, key_id) = DecryptedDataContainer::create(kdf(), b"").expect("create");
        let outer = container.lock();
        {
            let _inner = container.lock();
            container.encrypt(&key_id, b"x").expect("encrypt under inner");
        }
        // Outer scope still holds the cache.
        container.encrypt(&key_id, b"y").expect("encrypt under outer");
        drop(outer);
        assert!(matches!(
            container.encrypt(&key_id, b"z"),
            Err(WalletError::NotLocked)
        ));
    }

    #[test]
    fn encrypted_container_prompts() {
        let (container, key_id) =
            DecryptedDataContainer::create(kdf(), b"passphrase").expect("create");
        let data = {
            container.set_prompt(prompt_for(b"passphrase"));
            let _lock = container.lock();
            container.encrypt(&key_id, b"secret").expect("encrypt")
        };

        // Without a prompt the unlock cannot proceed.
        container.reset_prompt();
        {
            let _lock = container.lock();
            assert!(matches!(
                container.decrypt(&data),
                Err(WalletError::EmptyPassphrase)
            ));
        }

        // Giving up at the prompt surfaces EmptyPassphrase.
        container.set_prompt(prompt_for(b""));
        {
            let _lock = container.lock();
            assert!(matches!(
                container.decrypt(&data),
                Err(WalletError::EmptyPassphrase)
            ));
        }

        container.set_prompt(prompt_for(b"passphrase"));
        let _lock = container.lock();
        assert_eq!(container.decrypt(&data).expect("decrypt").as_slice(), b"secret");
    }

    #[test]
    fn passphrase_mutations_rejected_while_locked() {
        let (container, key_id) =
            DecryptedDataContainer::create(kdf(), b"passphrase").expect("create");
        container.set_prompt(prompt_for(b"passphrase"));

        let lock = container.lock();
        assert!(matches!(
            container.change_passphrase(&key_id, b"new"),
            Err(WalletError::AlreadyLocked)
        ));
        drop(lock);

        container.change_passphrase(&key_id, b"new").expect("change");
        container.set_prompt(prompt_for(b"new"));
        let _lock = container.lock();
        container.encrypt(&key_id, b"works").expect("unlock with new passphrase");
    }

    #[test]
    fn add_passphrase_to_unencrypted_is_rejected() {
        let (container, key_id) = DecryptedDataContainer::create(kdf(), b"").expect("create");
        assert!(matches!(
            container.add_passphrase(&key_id, b"extra"),
            Err(WalletError::CannotAddPassphraseToUnencrypted)
        ));

        container.change_passphrase(&key_id, b"primary").expect("change");
        container.set_prompt(prompt_for(b"primary"));
        container.add_passphrase(&key_id, b"extra").expect("add");

        // Both passphrases unlock the same master.
        let record = container.key_record(&key_id).expect("record");
        assert_eq!(record.entries.len(), 2);
    }

    #[test]
    fn erase_last_passphrase_is_rejected() {
        let (container, key_id) =
            DecryptedDataContainer::create(kdf(), b"only").expect("create");
        container.set_prompt(prompt_for(b"only"));
        assert!(container.erase_passphrase(&key_id).is_err());
    }
}

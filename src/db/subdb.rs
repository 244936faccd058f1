//! One encrypted sub-database: the decrypted live map, integrity-checked
//! loading, and the commit protocol that rewrites the on-disk image.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use storage_kv::KvEnv;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::cipher::random_iv;
use crate::crypto::ecies::{self, EpochKeys};
use crate::db::record;
use crate::db::schema::CYCLE_FLAG;
use crate::error::WalletError;

/// A live logical entry with its current on-disk position and its stable
/// write-order rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedEntry {
    pub value: Vec<u8>,
    pub counter: u32,
    pub seq: u64,
}

/// Immutable view of a sub-database's live logical entries. Read transactions
/// hold a clone of this for their lifetime.
pub type Snapshot = Arc<BTreeMap<Vec<u8>, CommittedEntry>>;

/// Mutations staged by a write transaction.
#[derive(Default)]
pub struct Staging {
    /// Last staged operation per data-key; `None` stages an erasure.
    ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    /// Data-keys in first-staged order; the commit applies them in this
    /// order so fresh entries land on disk in insertion order.
    order: Vec<Vec<u8>>,
    /// Old counters of entries erased since the last commit.
    pub tombstones: BTreeSet<u32>,
}

impl Staging {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.tombstones.is_empty()
    }

    /// Stage an operation, remembering first-staged order.
    pub fn stage(&mut self, data_key: Vec<u8>, op: Option<Vec<u8>>) {
        if !self.ops.contains_key(&data_key) {
            self.order.push(data_key.clone());
        }
        self.ops.insert(data_key, op);
    }

    /// Staged operation for a data-key, if any.
    pub fn get(&self, data_key: &[u8]) -> Option<&Option<Vec<u8>>> {
        self.ops.get(data_key)
    }

    /// Staged operations in data-key order, for merged iteration.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)> {
        self.ops.iter()
    }
}

fn parse_counter(raw: &[u8]) -> Result<u32, WalletError> {
    let bytes: [u8; 4] = raw
        .try_into()
        .map_err(|_| WalletError::invalid_input("record key is not a 4-byte counter"))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Decrypted, verified state of one encrypted sub-database.
pub struct SubDb {
    name: String,
    salted_root: Zeroizing<[u8; 32]>,
    snapshot: Snapshot,
    next_seq: u64,
}

impl std::fmt::Debug for SubDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubDb")
            .field("name", &self.name)
            .field("salted_root", &"<redacted>")
            .field("snapshot", &self.snapshot)
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

impl SubDb {
    /// Load and verify every record of `name` from the underlying store.
    ///
    /// Counter 0 must decrypt to the cycle sentinel; every other record must
    /// carry a valid MAC under its counter's epoch key. Erasure records are
    /// recognized and dropped from the live map.
    pub fn load(
        env: &KvEnv,
        name: &str,
        control_salt: &[u8; 32],
        seed: &[u8],
    ) -> Result<Self, WalletError> {
        let salted_root = ecies::salted_root(control_salt, seed);

        let mut map = BTreeMap::new();
        let mut next_seq = 0u64;
        let mut saw_sentinel = false;
        let mut record_count = 0usize;

        for (raw_key, envelope) in env.scan(name) {
            record_count += 1;
            let counter = parse_counter(raw_key)?;
            let epoch = EpochKeys::derive(&salted_root, counter)
                .ok_or(WalletError::HmacMismatch { counter })?;
            let payload = ecies::open(&epoch, envelope)
                .map_err(|_| WalletError::HmacMismatch { counter })?;
            let (data_key, data_val) = record::parse(epoch.mac_key(), counter, &payload)?;

            if counter == 0 {
                if !data_key.is_empty() || data_val != CYCLE_FLAG {
                    return Err(WalletError::CorruptSentinel(name.to_string()));
                }
                saw_sentinel = true;
                continue;
            }

            if data_key.is_empty() {
                if record::parse_erasure(&data_val).is_some() {
                    continue;
                }
                return Err(WalletError::HmacMismatch { counter });
            }

            // Counter order is insertion order; last write wins.
            map.insert(
                data_key,
                CommittedEntry {
                    value: data_val,
                    counter,
                    seq: next_seq,
                },
            );
            next_seq += 1;
        }

        if record_count > 0 && !saw_sentinel {
            return Err(WalletError::CorruptSentinel(name.to_string()));
        }

        debug!(
            subdb = name,
            records = record_count,
            live = map.len(),
            "loaded encrypted sub-database"
        );

        Ok(SubDb {
            name: name.to_string(),
            salted_root,
            snapshot: Arc::new(map),
            next_seq,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current immutable view of the live entries.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.snapshot)
    }

    /// Number of live logical entries (the sentinel is not one).
    pub fn entry_count(&self) -> usize {
        self.snapshot.len()
    }

    /// Run the compaction/rotation protocol for a batch of staged mutations:
    /// clear the backing sub-database, write a fresh sentinel at counter 0,
    /// rewrite every live entry in first-insertion order, then append one
    /// erasure record per tombstoned counter.
    pub fn commit(&mut self, env: &mut KvEnv, staging: Staging) -> Result<(), WalletError> {
        let mut next_map: BTreeMap<Vec<u8>, CommittedEntry> = (*self.snapshot).clone();
        let mut next_seq = self.next_seq;

        let Staging {
            mut ops,
            order,
            tombstones,
        } = staging;
        for data_key in order {
            let Some(op) = ops.remove(&data_key) else {
                continue;
            };
            match op {
                Some(value) => {
                    if let Some(existing) = next_map.get_mut(&data_key) {
                        existing.value = value;
                    } else {
                        next_map.insert(
                            data_key,
                            CommittedEntry {
                                value,
                                counter: 0, // assigned below
                                seq: next_seq,
                            },
                        );
                        next_seq += 1;
                    }
                }
                None => {
                    next_map.remove(&data_key);
                }
            }
        }

        // Stable write order: first-insertion rank.
        let mut ordered: Vec<(&Vec<u8>, &CommittedEntry)> = next_map.iter().collect();
        ordered.sort_by_key(|(_, entry)| entry.seq);

        env.clear_db(&self.name)?;

        let mut used_ivs: HashSet<[u8; 16]> = HashSet::new();
        let mut used_ephemerals: HashSet<[u8; 33]> = HashSet::new();
        let mut counter = 0u32;
        let mut assigned: Vec<(Vec<u8>, u32)> = Vec::with_capacity(ordered.len());

        let mut write_record =
            |env: &mut KvEnv,
             counter: &mut u32,
             data_key: &[u8],
             data_val: &[u8]|
             -> Result<u32, WalletError> {
            // Skip counters whose epoch scalar is invalid; writer and reader
            // derive the same ladder so both sides skip identically.
            let (slot, epoch) = loop {
                match EpochKeys::derive(&self.salted_root, *counter) {
                    Some(epoch) => break (*counter, epoch),
                    None => *counter += 1,
                }
            };

            let ephemeral = loop {
                let candidate = ecies::ephemeral_key();
                let serialized =
                    secp256k1::PublicKey::from_secret_key(crate::crypto::secp(), &candidate)
                        .serialize();
                if used_ephemerals.insert(serialized) {
                    break candidate;
                }
            };
            let iv = loop {
                let candidate = random_iv();
                if used_ivs.insert(candidate) {
                    break candidate;
                }
            };

            let payload = record::assemble(epoch.mac_key(), slot, data_key, data_val);
            let envelope = ecies::seal(&epoch, &ephemeral, &iv, &payload)?;
            env.put(&self.name, record::db_key(slot).to_vec(), envelope)?;

            *counter += 1;
            Ok(slot)
        };

        write_record(env, &mut counter, &[], CYCLE_FLAG)?;
        for (data_key, entry) in &ordered {
            let slot = write_record(env, &mut counter, data_key, &entry.value)?;
            assigned.push(((*data_key).clone(), slot));
        }
        for old_counter in &tombstones {
            write_record(env, &mut counter, &[], &record::erasure_value(*old_counter))?;
        }

        env.commit()?;

        for (data_key, slot) in assigned {
            next_map
                .get_mut(&data_key)
                .expect("assigned keys are live")
                .counter = slot;
        }
        self.snapshot = Arc::new(next_map);
        self.next_seq = next_seq;

        debug!(
            subdb = %self.name,
            live = self.snapshot.len(),
            erasures = tombstones.len(),
            "committed sub-database epoch"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage_kv::KvEnv;
    use tempfile::tempdir;

    const SALT: [u8; 32] = [1u8; 32];
    const SEED: [u8; 32] = [2u8; 32];

    fn fresh_env(dir: &std::path::Path) -> KvEnv {
        let mut env = KvEnv::open(dir, 4).expect("open env");
        env.open_db("test").expect("open db");
        env
    }

    fn staged(pairs: &[(&[u8], &[u8])]) -> Staging {
        let mut staging = Staging::default();
        for (k, v) in pairs {
            staging.stage(k.to_vec(), Some(v.to_vec()));
        }
        staging
    }

    #[test]
    fn commit_and_reload() {
        let dir = tempdir().expect("tempdir");
        let mut env = fresh_env(dir.path());

        let mut subdb = SubDb::load(&env, "test", &SALT, &SEED).expect("load empty");
        assert_eq!(subdb.entry_count(), 0);

        subdb
            .commit(&mut env, staged(&[(b"alpha", b"one"), (b"beta", b"two")]))
            .expect("commit");
        assert_eq!(subdb.entry_count(), 2);

        // Sentinel + two live records, contiguous counters.
        assert_eq!(env.entry_count("test"), 3);

        let reloaded = SubDb::load(&env, "test", &SALT, &SEED).expect("reload");
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.get(b"alpha".as_slice()).map(|e| e.value.clone()), Some(b"one".to_vec()));
        assert_eq!(snapshot.get(b"beta".as_slice()).map(|e| e.value.clone()), Some(b"two".to_vec()));
    }

    #[test]
    fn wrong_seed_fails_hmac() {
        let dir = tempdir().expect("tempdir");
        let mut env = fresh_env(dir.path());

        let mut subdb = SubDb::load(&env, "test", &SALT, &SEED).expect("load");
        subdb
            .commit(&mut env, staged(&[(b"k", b"v")]))
            .expect("commit");

        let err = SubDb::load(&env, "test", &SALT, &[9u8; 32]).unwrap_err();
        assert!(matches!(
            err,
            WalletError::HmacMismatch { .. } | WalletError::CorruptSentinel(_)
        ));
    }

    #[test]
    fn erasure_records_and_tombstones() {
        let dir = tempdir().expect("tempdir");
        let mut env = fresh_env(dir.path());

        let mut subdb = SubDb::load(&env, "test", &SALT, &SEED).expect("load");
        subdb
            .commit(&mut env, staged(&[(b"keep", b"a"), (b"drop", b"b")]))
            .expect("commit");

        let old_counter = subdb.snapshot().get(b"drop".as_slice()).expect("live").counter;

        let mut staging = Staging::default();
        staging.stage(b"drop".to_vec(), None);
        staging.tombstones.insert(old_counter);
        subdb.commit(&mut env, staging).expect("commit erase");

        // Sentinel + surviving entry + erasure record.
        assert_eq!(env.entry_count("test"), 3);
        assert_eq!(subdb.entry_count(), 1);

        let reloaded = SubDb::load(&env, "test", &SALT, &SEED).expect("reload");
        assert_eq!(reloaded.entry_count(), 1);
        assert!(reloaded.snapshot().get(b"drop".as_slice()).is_none());
    }

    #[test]
    fn rewrite_preserves_insertion_order() {
        let dir = tempdir().expect("tempdir");
        let mut env = fresh_env(dir.path());

        let mut subdb = SubDb::load(&env, "test", &SALT, &SEED).expect("load");
        subdb
            .commit(&mut env, staged(&[(b"c", b"3"), (b"a", b"1"), (b"b", b"2")]))
            .expect("commit");

        // Overwrite one value; its counter rank must not change relative to
        // the others after the rewrite.
        subdb
            .commit(&mut env, staged(&[(b"a", b"1bis")]))
            .expect("commit");

        let snapshot = subdb.snapshot();
        let mut by_counter: Vec<(u32, Vec<u8>)> = snapshot
            .iter()
            .map(|(k, e)| (e.counter, k.clone()))
            .collect();
        by_counter.sort();
        let keys: Vec<Vec<u8>> = by_counter.into_iter().map(|(_, k)| k).collect();
        // First-staged order survives the rewrite: c, a, b.
        assert_eq!(keys, vec![b"c".to_vec(), b"a".to_vec(), b"b".to_vec()]);
    }
}

//! On-disk format checks for the encrypted key-value engine: the cycle
//! sentinel, per-counter epoch keys, ECIES envelope uniqueness, erasure
//! records and integrity failures.

mod support;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use coffer::crypto::cipher::random_bytes;
use coffer::crypto::ecies::{self, EpochKeys};
use coffer::db::{codec, record, schema, StorageParams, WalletStorage};
use coffer::error::WalletError;
use storage_kv::KvEnv;
use tempfile::tempdir;

use support::{dir_contains_bytes, prompt, test_kdf};

const CONTROL_PASS: &[u8] = b"control";

fn new_storage(path: &Path) -> WalletStorage {
    let storage = WalletStorage::create(
        path,
        StorageParams {
            db_cap: 1,
            kdf: test_kdf(),
        },
        CONTROL_PASS,
    )
    .expect("create storage");
    storage
        .add_sub_db("test", prompt(CONTROL_PASS))
        .expect("add sub db");
    storage
}

/// Recover the control seed from the bootstrap region the way an auditor
/// would: kdf -> master key record -> seed record.
fn recover_seed(env: &KvEnv) -> Vec<u8> {
    let header_bytes = env
        .get(
            schema::CONTROL_DB_NAME,
            &schema::prefixed_key(schema::PREFIX_HEADER, schema::CONTROL_DB_NAME.as_bytes()),
        )
        .expect("control header");
    let header = codec::decode_control_header(&header_bytes).expect("decode header");

    let kdf = codec::decode_kdf_params(
        &env.get(
            schema::CONTROL_DB_NAME,
            &schema::prefixed_key(schema::PREFIX_KDF, header.kdf_id.as_bytes()),
        )
        .expect("kdf record"),
    )
    .expect("decode kdf");

    let key_record = codec::decode_key_record(
        &env.get(
            schema::CONTROL_DB_NAME,
            &schema::prefixed_key(
                schema::PREFIX_ENCRYPTION_KEY,
                header.master_key_id.as_bytes(),
            ),
        )
        .expect("key record"),
    )
    .expect("decode key record");

    let derived = kdf.derive(CONTROL_PASS).expect("kdf");
    let (master, _) = key_record.try_unlock(&derived).expect("unlock master");

    let seed_cipher = codec::decode_cipher_data(
        &env.get(
            schema::CONTROL_DB_NAME,
            &schema::u32_key(schema::WALLET_SEED_KEY),
        )
        .expect("seed record"),
    )
    .expect("decode seed");
    seed_cipher.decrypt(&master).expect("decrypt seed").to_vec()
}

/// Decrypt every record of an encrypted sub-database, returning
/// `(counter, envelope bytes, data key, data value)` in counter order.
fn decrypt_subdb(env: &KvEnv, name: &str, salt: &[u8; 32], seed: &[u8]) -> Vec<RawRecord> {
    let salted_root = ecies::salted_root(salt, seed);
    let mut out = Vec::new();
    for (raw_key, envelope) in env.scan(name) {
        let counter = u32::from_be_bytes(raw_key.try_into().expect("4-byte key"));
        let epoch = EpochKeys::derive(&salted_root, counter).expect("epoch keys");
        let payload = ecies::open(&epoch, envelope).expect("decrypt record");
        let (data_key, data_val) =
            record::parse(epoch.mac_key(), counter, &payload).expect("verify record");
        out.push(RawRecord {
            counter,
            envelope: envelope.to_vec(),
            data_key,
            data_val,
        });
    }
    out.sort_by_key(|r| r.counter);
    out
}

struct RawRecord {
    counter: u32,
    envelope: Vec<u8>,
    data_key: Vec<u8>,
    data_val: Vec<u8>,
}

/// Locate the "test" sub-database salt by decrypting the headers store.
fn test_db_salt(env: &KvEnv, seed: &[u8]) -> [u8; 32] {
    let header_bytes = env
        .get(
            schema::CONTROL_DB_NAME,
            &schema::prefixed_key(schema::PREFIX_HEADER, schema::CONTROL_DB_NAME.as_bytes()),
        )
        .expect("control header");
    let control = codec::decode_control_header(&header_bytes).expect("decode header");

    for entry in decrypt_subdb(env, schema::HEADERS_DB_NAME, &control.salt, seed) {
        if entry.data_key.first() != Some(&schema::PREFIX_HEADER) {
            continue;
        }
        let header = codec::decode_subdb_header(&entry.data_val).expect("decode subdb header");
        if header.name == "test" {
            return header.salt;
        }
    }
    panic!("test sub-database header not found");
}

#[test]
fn commit_writes_sentinel_and_ordered_ciphertext() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("env");
    let storage = new_storage(&path);

    // Keys whose lexical order differs from insertion order.
    let key1 = b"zk-first".to_vec();
    let key2 = b"ak-second".to_vec();
    let key3 = b"mk-third".to_vec();
    let val1 = random_bytes(64);
    let val2 = random_bytes(64);
    let val3 = random_bytes(240);
    let val4 = random_bytes(16);

    {
        let tx = storage.begin_write("test").expect("write tx");
        tx.insert(&key1, &val1).expect("insert");
        tx.insert(&key2, &val2).expect("insert");
        tx.insert(&key3, &val3).expect("insert");
        // Replace key3's value within the same transaction.
        tx.insert(&key3, &val4).expect("insert");
        tx.commit().expect("commit");
    }
    assert_eq!(storage.entry_count("test").expect("count"), 3);
    storage.shutdown().expect("shutdown");

    // No logical cleartext anywhere in the environment.
    for needle in [&key1, &key2, &key3, &val1, &val2, &val3, &val4] {
        assert!(!dir_contains_bytes(&path, needle));
    }

    let env = KvEnv::open(&path, 0).expect("raw env");
    let seed = recover_seed(&env);
    let salt = test_db_salt(&env, &seed);
    let records = decrypt_subdb(&env, "test", &salt, &seed);

    // Contiguous counters, sentinel first.
    assert_eq!(records.len(), 4);
    for (position, entry) in records.iter().enumerate() {
        assert_eq!(entry.counter, position as u32);
    }
    assert!(records[0].data_key.is_empty());
    assert_eq!(records[0].data_val, schema::CYCLE_FLAG);

    // Live records in insertion order.
    assert_eq!(records[1].data_key, key1);
    assert_eq!(records[1].data_val, val1);
    assert_eq!(records[2].data_key, key2);
    assert_eq!(records[2].data_val, val2);
    assert_eq!(records[3].data_key, key3);
    assert_eq!(records[3].data_val, val4);

    // Fresh ephemeral keys and IVs for every record; no zero IV.
    let mut ivs = BTreeSet::new();
    let mut ephemerals = BTreeSet::new();
    for entry in &records {
        let parsed = ecies::parse_envelope(&entry.envelope).expect("envelope");
        assert_ne!(parsed.iv, [0u8; 16]);
        assert!(ivs.insert(parsed.iv.to_vec()));
        assert!(ephemerals.insert(parsed.ephemeral_pub.serialize().to_vec()));
    }

    // A record does not decrypt under a neighbouring counter's keys.
    let salted_root = ecies::salted_root(&salt, &seed);
    let wrong_epoch = EpochKeys::derive(&salted_root, 2).expect("epoch");
    let payload = ecies::open(&wrong_epoch, &records[1].envelope);
    assert!(
        payload.is_err()
            || record::parse(wrong_epoch.mac_key(), 1, &payload.expect("payload")).is_err()
    );
}

#[test]
fn erase_and_reinsert_leaves_erasure_records() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("env");
    let storage = new_storage(&path);

    let key1 = b"first".to_vec();
    let key2 = b"second".to_vec();
    let key3 = b"third".to_vec();
    let val4 = random_bytes(16);

    {
        let tx = storage.begin_write("test").expect("write tx");
        tx.insert(&key1, &random_bytes(64)).expect("insert");
        tx.insert(&key2, &random_bytes(64)).expect("insert");
        tx.insert(&key3, &random_bytes(32)).expect("insert");
        tx.commit().expect("commit");
    }

    {
        let tx = storage.begin_write("test").expect("write tx");
        tx.erase(&key2).expect("erase");
        tx.erase(&key3).expect("erase");
        tx.insert(&key3, &val4).expect("insert");

        // Staged view: erased key gone, replaced key visible.
        assert_eq!(tx.get(&key2), None);
        assert_eq!(tx.get(&key3), Some(val4.clone()));
        tx.commit().expect("commit");
    }
    assert_eq!(storage.entry_count("test").expect("count"), 2);
    storage.shutdown().expect("shutdown");

    let env = KvEnv::open(&path, 0).expect("raw env");
    let seed = recover_seed(&env);
    let salt = test_db_salt(&env, &seed);
    let records = decrypt_subdb(&env, "test", &salt, &seed);

    // Sentinel, two live records, two erasure records; counters gap-free.
    assert_eq!(records.len(), 5);
    for (position, entry) in records.iter().enumerate() {
        assert_eq!(entry.counter, position as u32);
    }

    assert_eq!(records[1].data_key, key1);
    assert_eq!(records[2].data_key, key3);
    assert_eq!(records[2].data_val, val4);

    // Erasure cleartext: "erased" ‖ varint(4) ‖ BE32(old counter), naming the
    // counters key2 and key3 held before the rewrite.
    for (entry, old_counter) in records[3..].iter().zip([2u32, 3u32]) {
        assert!(entry.data_key.is_empty());
        let mut expected = b"erased".to_vec();
        expected.push(4);
        expected.extend_from_slice(&old_counter.to_be_bytes());
        assert_eq!(entry.data_val, expected);
        assert_eq!(record::parse_erasure(&entry.data_val), Some(old_counter));
    }
}

#[test]
fn tampered_record_fails_integrity_on_open() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("env");
    let storage = new_storage(&path);

    {
        let tx = storage.begin_write("test").expect("write tx");
        tx.insert(b"key", &random_bytes(32)).expect("insert");
        tx.commit().expect("commit");
    }
    storage.shutdown().expect("shutdown");

    // Flip one ciphertext byte of the record at counter 1.
    {
        let mut env = KvEnv::open(&path, 3).expect("raw env");
        let raw_key = 1u32.to_be_bytes().to_vec();
        let mut envelope = env.get("test", &raw_key).expect("record");
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        env.put("test", raw_key, envelope).expect("put");
        env.commit().expect("commit");
    }

    let err = WalletStorage::open(&path, prompt(CONTROL_PASS)).expect_err("tampered open");
    assert!(matches!(
        err,
        WalletError::HmacMismatch { .. } | WalletError::CorruptSentinel(_)
    ));
}

#[test]
fn giving_up_at_the_prompt_aborts_open() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("env");
    let storage = new_storage(&path);
    storage.shutdown().expect("shutdown");

    // Wrong passphrase once, then give up.
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_prompt = Arc::clone(&attempts);
    let flaky_prompt: coffer::PassphrasePrompt = Arc::new(move |_ids| {
        if attempts_in_prompt.fetch_add(1, Ordering::SeqCst) == 0 {
            b"wrong".to_vec()
        } else {
            Vec::new()
        }
    });

    let err = WalletStorage::open(&path, flaky_prompt).expect_err("wrong passphrase");
    assert!(matches!(err, WalletError::EmptyPassphrase));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn unencrypted_control_never_prompts() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("env");
    let storage = WalletStorage::create(
        &path,
        StorageParams {
            db_cap: 1,
            kdf: test_kdf(),
        },
        &[],
    )
    .expect("create storage");
    storage.shutdown().expect("shutdown");

    let touchy_prompt: coffer::PassphrasePrompt =
        Arc::new(|_ids| panic!("prompt must not fire for unencrypted wallets"));
    WalletStorage::open(&path, touchy_prompt).expect("open unencrypted");
}

#[test]
fn empty_data_keys_are_rejected() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("env");
    let storage = new_storage(&path);

    let tx = storage.begin_write("test").expect("write tx");
    assert!(matches!(
        tx.insert(b"", b"value"),
        Err(WalletError::InvalidInput(_))
    ));
    tx.commit().expect("commit");
}

//! Account scenarios: BIP32 chains, salted accounts, ECDH settlement
//! accounts and asset path resolution, including their watching-only forks.

mod support;

use coffer::accounts::AccountSpec;
use coffer::addresses::AddressType;
use coffer::config::NetworkSettings;
use coffer::crypto::cipher::{random_array, random_bytes};
use coffer::crypto::hashes::hash160;
use coffer::crypto::secp;
use coffer::derivation::bip32::Bip32Node;
use coffer::derivation::HARDENED;
use coffer::error::WalletError;
use coffer::wallet::Wallet;
use secp256k1::{PublicKey, Scalar, SecretKey};
use tempfile::tempdir;

use support::{prompt, test_kdf};

const CONTROL: &[u8] = b"control";
const PASSPHRASE: &[u8] = b"password";

fn settings() -> NetworkSettings {
    NetworkSettings::mainnet()
}

fn blank_wallet(home: &std::path::Path, seed: &[u8]) -> Wallet {
    Wallet::create_blank_bip32(
        home,
        seed,
        PASSPHRASE,
        CONTROL,
        settings(),
        test_kdf(),
    )
    .expect("create blank wallet")
}

fn salted_spec(derivation_path: Vec<u32>, salt: [u8; 32]) -> AccountSpec {
    AccountSpec::Bip32Salted {
        derivation_path,
        salt,
        nodes: vec![0],
        outer: 0,
        inner: None,
        address_types: vec![AddressType::P2wpkh],
        default_address_type: AddressType::P2wpkh,
        lookup: 40,
        main: false,
    }
}

fn mul(public_key: &PublicKey, salt: &[u8; 32]) -> PublicKey {
    public_key
        .mul_tweak(secp(), &Scalar::from_be_bytes(*salt).expect("scalar"))
        .expect("tweak")
}

#[test]
fn bip32_account_matches_seed_derivation() {
    let dir = tempdir().expect("tempdir");
    let seed = random_bytes(32);
    let der_path = [HARDENED | 0x12ab, HARDENED | 0xff13, HARDENED | 0x0005_0000];

    let mut wallet = blank_wallet(dir.path(), &seed);
    wallet.set_passphrase_prompt(prompt(PASSPHRASE));
    let account_id = wallet
        .create_account(AccountSpec::Bip32 {
            derivation_path: der_path.to_vec(),
            nodes: vec![0],
            outer: 0,
            inner: None,
            address_types: vec![AddressType::P2wpkh],
            default_address_type: AddressType::P2wpkh,
            lookup: 10,
            main: true,
        })
        .expect("create account");
    let path = wallet.storage().path().to_path_buf();

    let account_node = Bip32Node::from_seed(&seed)
        .expect("master")
        .derive_path(&der_path)
        .expect("account root")
        .derive_private(0)
        .expect("outer node");

    let account = wallet.account(&account_id).expect("account");
    let chain = account.chains.get(&0).expect("chain");
    assert_eq!(chain.len(), 10);
    for index in 0..10u32 {
        let expected = account_node.derive_public(index).expect("derive");
        assert_eq!(
            chain.public_key(index).expect("asset"),
            *expected.public_key()
        );
    }
    drop(wallet);

    // Reload: same assets, cursor continues at zero.
    let mut wallet = Wallet::load(&path, prompt(CONTROL), settings()).expect("reload");
    let entry = wallet.get_new_address(None).expect("address");
    let expected = account_node.derive_public(0).expect("derive");
    assert_eq!(entry.preimage(), expected.public_key().serialize().to_vec());

    // Private chain filling still works after the reload.
    wallet.set_passphrase_prompt(prompt(PASSPHRASE));
    wallet.extend_private_chain(account_id).expect("extend private");
    let account = wallet.account(&account_id).expect("account");
    assert!(account
        .chains
        .get(&0)
        .expect("chain")
        .asset(9)
        .expect("asset")
        .has_private());
}

#[test]
fn change_addresses_come_from_the_inner_chain() {
    let dir = tempdir().expect("tempdir");
    let seed = random_bytes(32);
    let der_path = [HARDENED | 44, HARDENED, HARDENED];

    let mut wallet = Wallet::create_from_seed_bip32(
        dir.path(),
        &seed,
        &der_path,
        PASSPHRASE,
        CONTROL,
        5,
        settings(),
        test_kdf(),
    )
    .expect("create wallet");

    let account_node = Bip32Node::from_seed(&seed)
        .expect("master")
        .derive_path(&der_path)
        .expect("account root");

    let receive = wallet.get_new_address(None).expect("receive");
    let expected_receive = account_node
        .derive_private(0)
        .expect("outer node")
        .derive_public(0)
        .expect("leaf");
    assert_eq!(
        receive.preimage(),
        expected_receive.public_key().serialize().to_vec()
    );

    let change = wallet.get_new_change_address(None).expect("change");
    let expected_change = account_node
        .derive_private(1)
        .expect("inner node")
        .derive_public(0)
        .expect("leaf");
    assert_eq!(
        change.preimage(),
        expected_change.public_key().serialize().to_vec()
    );
}

#[test]
fn salted_accounts_multiply_every_descendant() {
    let dir = tempdir().expect("tempdir");
    let seed = random_bytes(32);
    let path1 = vec![HARDENED | 0x50, HARDENED | 0x05de, HARDENED | 0x465a, 501];
    let path2 = vec![HARDENED | 0x50, HARDENED | 0x05de, HARDENED | 0xee4f, 327];
    let salt1 = random_array::<32>();
    let salt2 = random_array::<32>();

    let (wallet_path, id1, id2, hashes) = {
        let mut wallet = blank_wallet(dir.path(), &seed);
        wallet.set_passphrase_prompt(prompt(PASSPHRASE));
        let id1 = wallet
            .create_account(salted_spec(path1.clone(), salt1))
            .expect("account 1");
        let id2 = wallet
            .create_account(salted_spec(path2.clone(), salt2))
            .expect("account 2");

        for index in 0..10u32 {
            let entry1 = wallet
                .get_new_address_for_account(id1, None)
                .expect("address");
            let entry2 = wallet
                .get_new_address_for_account(id2, None)
                .expect("address");

            for (entry, path, salt) in [(entry1, &path1, &salt1), (entry2, &path2, &salt2)] {
                let node = Bip32Node::from_seed(&seed)
                    .expect("master")
                    .derive_path(path)
                    .expect("account root")
                    .derive_private(0)
                    .expect("node")
                    .derive_private(index)
                    .expect("leaf");
                let salted = mul(node.public_key(), salt);
                assert_eq!(entry.preimage(), salted.serialize().to_vec());
            }
        }

        let hashes = wallet.addr_hash_set();
        assert_eq!(hashes.len(), 80);
        (wallet.storage().path().to_path_buf(), id1, id2, hashes)
    };

    // Reload and keep deriving.
    {
        let mut wallet = Wallet::load(&wallet_path, prompt(CONTROL), settings()).expect("load");
        assert_eq!(wallet.addr_hash_set(), hashes);

        for index in 10..20u32 {
            let entry1 = wallet
                .get_new_address_for_account(id1, None)
                .expect("address");
            let node = Bip32Node::from_seed(&seed)
                .expect("master")
                .derive_path(&path1)
                .expect("root")
                .derive_private(0)
                .expect("node")
                .derive_private(index)
                .expect("leaf");
            assert_eq!(
                entry1.preimage(),
                mul(node.public_key(), &salt1).serialize().to_vec()
            );
            let _ = wallet.get_new_address_for_account(id2, None).expect("address");
        }
    }

    // The watching-only fork keeps extending the same key family.
    let fork_path =
        Wallet::fork_watching_only(&wallet_path, prompt(CONTROL), CONTROL, settings())
            .expect("fork");
    let mut fork = Wallet::load(&fork_path, prompt(CONTROL), settings()).expect("load fork");
    assert!(fork.is_watching_only());
    assert_eq!(fork.addr_hash_set(), hashes);

    for index in 20..30u32 {
        let entry = fork
            .get_new_address_for_account(id1, None)
            .expect("address");
        let node = Bip32Node::from_seed(&seed)
            .expect("master")
            .derive_path(&path1)
            .expect("root")
            .derive_private(0)
            .expect("node")
            .derive_private(index)
            .expect("leaf");
        assert_eq!(
            entry.preimage(),
            mul(node.public_key(), &salt1).serialize().to_vec()
        );
    }
}

#[test]
fn ecdh_accounts_register_salts_idempotently() {
    let dir = tempdir().expect("tempdir");
    let seed = random_bytes(32);

    let base_priv1: [u8; 32] =
        hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
            .expect("hex")
            .try_into()
            .expect("32 bytes");
    let base_priv2: [u8; 32] =
        hex::decode("101112131415161718191a1b1c1d1e1f202122232425262728292a2b2c2d2e2f")
            .expect("hex")
            .try_into()
            .expect("32 bytes");
    let base_pub1 = PublicKey::from_secret_key(
        secp(),
        &SecretKey::from_slice(&base_priv1).expect("key"),
    );
    let base_pub2 = PublicKey::from_secret_key(
        secp(),
        &SecretKey::from_slice(&base_priv2).expect("key"),
    );

    let ecdh_spec = |private_key: [u8; 32], public_key: PublicKey, main: bool| AccountSpec::Ecdh {
        private_key: Some(private_key),
        public_key: public_key.serialize(),
        address_types: vec![AddressType::P2wpkh],
        default_address_type: AddressType::P2wpkh,
        main,
    };

    let mut salts1 = Vec::new();
    let mut salts2 = Vec::new();
    let mut addr_hashes1 = Vec::new();
    let mut addr_hashes2 = Vec::new();

    let (wallet_path, id1, id2) = {
        let mut wallet = blank_wallet(dir.path(), &seed);
        wallet.set_passphrase_prompt(prompt(PASSPHRASE));
        let id1 = wallet
            .create_account(ecdh_spec(base_priv1, base_pub1, true))
            .expect("account 1");
        let id2 = wallet
            .create_account(ecdh_spec(base_priv2, base_pub2, false))
            .expect("account 2");

        for index in 0..5u32 {
            let salt = random_array::<32>();
            assert_eq!(wallet.add_ecdh_salt(id1, salt).expect("add salt"), index);
            salts1.push(salt);

            let salt = random_array::<32>();
            assert_eq!(wallet.add_ecdh_salt(id2, salt).expect("add salt"), index);
            salts2.push(salt);
        }

        for index in 0..5usize {
            let entry = wallet.get_new_address(None).expect("address");
            assert_eq!(
                entry.hash(),
                hash160(&mul(&base_pub1, &salts1[index]).serialize()).to_vec()
            );
            addr_hashes1.push(entry.hash());

            let entry = wallet
                .get_new_address_for_account(id2, None)
                .expect("address");
            assert_eq!(
                entry.hash(),
                hash160(&mul(&base_pub2, &salts2[index]).serialize()).to_vec()
            );
            addr_hashes2.push(entry.hash());
        }
        (wallet.storage().path().to_path_buf(), id1, id2)
    };

    // Reload: address set intact, registration is idempotent.
    {
        let mut wallet = Wallet::load(&wallet_path, prompt(CONTROL), settings()).expect("load");
        let hashes = wallet.addr_hash_set();
        assert_eq!(hashes.len(), 10);
        let prefix = settings().witness_pubkey_hash_prefix;
        for hash in addr_hashes1.iter().chain(addr_hashes2.iter()) {
            let mut prefixed = vec![prefix];
            prefixed.extend_from_slice(hash);
            assert!(hashes.contains(&prefixed));
        }

        // A sixth salt extends the chain.
        let salt = random_array::<32>();
        assert_eq!(wallet.add_ecdh_salt(id1, salt).expect("add"), 5);
        salts1.push(salt);
        let entry = wallet.get_new_address(None).expect("address");
        assert_eq!(
            entry.hash(),
            hash160(&mul(&base_pub1, &salts1[5]).serialize()).to_vec()
        );

        // Re-registering a known salt returns its existing index.
        assert_eq!(wallet.add_ecdh_salt(id1, salts1[3]).expect("re-add"), 3);
        assert_eq!(wallet.add_ecdh_salt(id2, salts2[2]).expect("re-add"), 2);

        let account = wallet.account(&id1).expect("account");
        let asset = account.outer_chain().asset(3).expect("asset");
        assert_eq!(
            hash160(&asset.public_key().expect("key").serialize()).to_vec(),
            addr_hashes1[3]
        );
    }

    // Watching-only fork: no private base key, salts still register.
    let fork_path =
        Wallet::fork_watching_only(&wallet_path, prompt(CONTROL), CONTROL, settings())
            .expect("fork");
    let mut fork = Wallet::load(&fork_path, prompt(CONTROL), settings()).expect("load fork");
    assert!(fork.is_watching_only());
    assert_eq!(fork.addr_hash_set().len(), 11);

    let asset = fork
        .account(&id1)
        .expect("account")
        .outer_chain()
        .asset(0)
        .expect("asset");
    assert!(matches!(
        fork.asset_private_key(&asset.id),
        Err(WalletError::NoPrivateKey)
    ));

    let salt = random_array::<32>();
    assert_eq!(fork.add_ecdh_salt(id1, salt).expect("add"), 6);
    let entry = fork.get_new_address(None).expect("address");
    assert_eq!(
        entry.hash(),
        hash160(&mul(&base_pub1, &salt).serialize()).to_vec()
    );
}

#[test]
fn asset_path_resolution_survives_forks() {
    let dir = tempdir().expect("tempdir");
    let seed = random_bytes(32);
    let der_path = [HARDENED | 0x12ab, HARDENED | 0xff13, HARDENED | 0x0005_0000];

    let wallet = Wallet::create_from_seed_bip32(
        dir.path(),
        &seed,
        &der_path,
        &[],
        &[],
        10,
        settings(),
        test_kdf(),
    )
    .expect("create wallet");
    let path = wallet.storage().path().to_path_buf();

    let leaf = Bip32Node::from_seed(&seed)
        .expect("master")
        .derive_path(&der_path)
        .expect("account root")
        .derive_private(0)
        .expect("node")
        .derive_private(5)
        .expect("leaf");
    let leaf_pub = *leaf.public_key();
    let leaf_xpub = leaf.public_copy().to_base58();

    let mut full_path = der_path.to_vec();
    full_path.push(0);
    full_path.push(5);

    let check = |wallet: &Wallet| {
        assert_eq!(
            wallet.bip32_path_for_pubkey(&leaf_pub).expect("path"),
            full_path
        );

        let mut prefixed = vec![wallet.network_settings().witness_pubkey_hash_prefix];
        prefixed.extend_from_slice(&hash160(&leaf_pub.serialize()));
        let asset_id = wallet.asset_for_hash(&prefixed).expect("asset");
        assert_eq!(asset_id.node, 0);
        assert_eq!(asset_id.index, 5);

        assert_eq!(wallet.xpub_for_asset(&asset_id).expect("xpub"), leaf_xpub);
    };

    check(&wallet);
    drop(wallet);

    let fork_path = Wallet::fork_watching_only(
        &path,
        prompt(b""),
        b"",
        settings(),
    )
    .expect("fork");
    let fork = Wallet::load(&fork_path, prompt(b""), settings()).expect("load fork");
    check(&fork);
}

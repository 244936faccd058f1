//! Sub-database names, bootstrap data-key layout and sentinel literals.

/// Plaintext bootstrap sub-database. The only sensitive bytes it holds are
/// themselves ciphertext (master key records, encrypted control seed).
pub const CONTROL_DB_NAME: &str = "__control";
/// Encrypted sub-database enumerating every other sub-database.
pub const HEADERS_DB_NAME: &str = "__headers";
/// Encrypted sub-database backing the user comment store.
pub const COMMENTS_DB_NAME: &str = "__meta_comments";

/// Sub-databases every environment carries regardless of wallet count.
pub const BUILTIN_DB_COUNT: usize = 3;

/// Data-key prefix for encrypted master-key records.
pub const PREFIX_ENCRYPTION_KEY: u8 = 0x01;
/// Data-key prefix for persisted KDF parameter records.
pub const PREFIX_KDF: u8 = 0x02;
/// Data-key prefix for control and sub-database headers.
pub const PREFIX_HEADER: u8 = 0x03;
/// Data-key prefix for account metadata records.
pub const PREFIX_ACCOUNT: u8 = 0x04;
/// Data-key prefix for individual asset records.
pub const PREFIX_ASSET: u8 = 0x05;
/// Data-key prefix for account root asset records.
pub const PREFIX_ACCOUNT_ROOT: u8 = 0x06;
/// Data-key prefix for ECDH salt registry records.
pub const PREFIX_ECDH_SALT: u8 = 0x07;

/// Control entry holding the main wallet id (varint-prefixed string).
pub const MAIN_WALLET_KEY: u32 = 0x0000_00a1;
/// Control entry holding the encrypted control seed.
pub const WALLET_SEED_KEY: u32 = 0x0000_00a2;
/// Control entry holding the sub-database slot cap.
pub const DB_COUNT_KEY: u32 = 0x0000_00a3;

/// Wallet entry holding the encrypted account seed.
pub const WALLET_PRIVATE_SEED_KEY: u32 = 0x0000_00b1;
/// Wallet entry holding the main account id.
pub const MAIN_ACCOUNT_KEY: u32 = 0x0000_00b2;
/// Wallet entry holding the wallet's root asset.
pub const ROOT_ASSET_KEY: u32 = 0x0000_00b3;

/// Cleartext value of the record at counter 0.
pub const CYCLE_FLAG: &[u8] = b"cycle";
/// Leading literal of an erasure record's cleartext value.
pub const ERASED_FLAG: &[u8] = b"erased";

/// Version stamped into control and sub-database headers.
pub const ENCRYPTION_VERSION: u32 = 1;

/// `BE32(tag)` data-keys used by the control and wallet sub-databases.
pub fn u32_key(tag: u32) -> Vec<u8> {
    tag.to_be_bytes().to_vec()
}

/// `prefix ‖ suffix` data-keys.
pub fn prefixed_key(prefix: u8, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + suffix.len());
    key.push(prefix);
    key.extend_from_slice(suffix);
    key
}

//! Encrypted hierarchical deterministic wallet storage engine.
//!
//! Two tightly-coupled subsystems: a transactional encrypted key-value store
//! over an ordered KV backend (every commit rewrites the affected
//! sub-database under fresh ECIES envelopes behind a cycle sentinel), and a
//! deterministic derivation engine (BIP32, legacy chained, salted and
//! settlement accounts) that lazily materializes addresses of several script
//! types. A passphrase-gated container holds decrypted master keys only while
//! a scoped lock is held.

pub mod accounts;
pub mod addresses;
pub mod assets;
pub mod config;
pub mod crypto;
pub mod db;
pub mod derivation;
pub mod encryption;
pub mod error;
pub mod wallet;

pub use accounts::{AccountSpec, AddressAccount};
pub use addresses::{AddressEntry, AddressType};
pub use assets::{AccountId, AssetEntry, AssetId};
pub use config::NetworkSettings;
pub use db::{StorageParams, WalletStorage};
pub use encryption::{DecryptedDataContainer, PassphrasePrompt};
pub use error::WalletError;
pub use wallet::Wallet;

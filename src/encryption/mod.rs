//! Encrypted key material records and the passphrase-gated container that
//! caches decrypted master keys while a scoped lock is held.

mod container;
mod data;

pub use container::{ContainerLock, DecryptedDataContainer, PassphrasePrompt};
pub use data::{CipherData, CipherEntry, EncryptedKeyRecord, KeyId};

use thiserror::Error;

/// Error surfaced by the wallet storage engine and the derivation layers.
///
/// Cryptographic and integrity failures are never recovered internally; they
/// propagate through the wallet façade untouched.
#[derive(Debug, Error)]
pub enum WalletError {
    /// The passphrase prompt returned an empty passphrase; the caller gave up.
    #[error("empty passphrase")]
    EmptyPassphrase,
    /// The record at counter 0 did not decrypt to the cycle sentinel.
    #[error("corrupt cycle sentinel in sub-database {0}")]
    CorruptSentinel(String),
    /// A record failed its integrity check; the file is tampered or the seed
    /// is wrong.
    #[error("record hmac mismatch at counter {counter}")]
    HmacMismatch { counter: u32 },
    /// Transaction contention or a live transaction blocking a lifecycle
    /// operation. Transient; the caller may retry.
    #[error("busy: {0}")]
    Busy(&'static str),
    /// A container mutation was attempted while a lock is held.
    #[error("container is locked")]
    AlreadyLocked,
    /// A decrypt was attempted without holding the container lock.
    #[error("container is not locked")]
    NotLocked,
    /// The operation requires a private key the wallet does not hold.
    #[error("no private key available")]
    NoPrivateKey,
    /// Requested name or id is absent.
    #[error("not found: {0}")]
    NotFound(String),
    /// Malformed input: bad address string, invalid curve point, bad bech32.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Passphrases cannot be added to an unencrypted wallet; change the
    /// default passphrase first.
    #[error("cannot add passphrase to unencrypted container")]
    CannotAddPassphraseToUnencrypted,
    /// Underlying ordered KV store failure.
    #[error("storage error: {0}")]
    Storage(#[from] storage_kv::KvError),
    /// Serialization failure in a bootstrap or asset record.
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),
    /// Key derivation function failure.
    #[error("kdf failure: {0}")]
    Kdf(String),
    /// Elliptic curve operation failed.
    #[error("curve error: {0}")]
    Curve(#[from] secp256k1::Error),
    /// Symmetric decryption failed outright (bad padding).
    #[error("decrypt failure")]
    DecryptFailed,
    /// Filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WalletError {
    /// Malformed-input helper.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        WalletError::InvalidInput(msg.into())
    }

    /// Missing-entry helper.
    pub fn not_found(what: impl Into<String>) -> Self {
        WalletError::NotFound(what.into())
    }
}

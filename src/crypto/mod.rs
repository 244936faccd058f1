//! Hash, cipher and key-derivation primitives shared by the storage and
//! derivation layers.

use std::sync::OnceLock;

use secp256k1::{All, Secp256k1};

pub mod cipher;
pub mod ecies;
pub mod hashes;
pub mod kdf;

/// Shared secp256k1 context. Verification and signing contexts are expensive
/// to build, so one is kept for the process lifetime.
pub fn secp() -> &'static Secp256k1<All> {
    static CTX: OnceLock<Secp256k1<All>> = OnceLock::new();
    CTX.get_or_init(Secp256k1::new)
}

//! Deterministic key derivation: BIP32 extended keys and the legacy
//! Armory135 chained scheme.

pub mod armory135;
pub mod bip32;

/// Hardened derivation threshold.
pub const HARDENED: u32 = 0x8000_0000;

/// Whether a derivation step requires the private key.
pub fn is_hardened(index: u32) -> bool {
    index & HARDENED != 0
}

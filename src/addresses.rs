//! Address materialization: script-type-tagged variants computed from asset
//! public keys, plus the base58check / bech32 string codecs.

use bech32::{segwit, Hrp};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::config::NetworkSettings;
use crate::crypto::hashes::{hash160, sha256};
use crate::error::WalletError;

const OP_0: u8 = 0x00;
const OP_DUP: u8 = 0x76;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_HASH160: u8 = 0xa9;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_1: u8 = 0x50;

/// Script type an account is permitted (or defaulted) to hand out.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddressType {
    P2pkh { compressed: bool },
    P2pk,
    P2wpkh,
    /// Pay-to-script-hash over a nested witness or key script.
    P2sh(Box<AddressType>),
    /// Pay-to-witness-script-hash over a multisig script.
    P2wshMultisig { m: u8, n: u8 },
    Multisig { m: u8, n: u8 },
}

impl AddressType {
    /// Whether materializing this type needs exactly one public key.
    pub fn is_single_key(&self) -> bool {
        match self {
            AddressType::P2pkh { .. } | AddressType::P2pk | AddressType::P2wpkh => true,
            AddressType::P2sh(inner) => inner.is_single_key(),
            AddressType::P2wshMultisig { .. } | AddressType::Multisig { .. } => false,
        }
    }
}

/// A materialized address: enough to produce its script, its prefixed hash
/// (the reverse-lookup key) and its display string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressEntry {
    P2pkh { public_key: PublicKey, compressed: bool },
    P2pk { public_key: PublicKey },
    P2wpkh { public_key: PublicKey },
    P2sh { inner: Box<AddressEntry> },
    P2wsh { inner: Box<AddressEntry> },
    Multisig { m: u8, public_keys: Vec<PublicKey> },
}

impl AddressEntry {
    /// Materialize a single-key address of the requested type.
    pub fn single(address_type: &AddressType, public_key: PublicKey) -> Result<Self, WalletError> {
        match address_type {
            AddressType::P2pkh { compressed } => Ok(AddressEntry::P2pkh {
                public_key,
                compressed: *compressed,
            }),
            AddressType::P2pk => Ok(AddressEntry::P2pk { public_key }),
            AddressType::P2wpkh => Ok(AddressEntry::P2wpkh { public_key }),
            AddressType::P2sh(inner) => Ok(AddressEntry::P2sh {
                inner: Box::new(AddressEntry::single(inner, public_key)?),
            }),
            AddressType::P2wshMultisig { .. } | AddressType::Multisig { .. } => Err(
                WalletError::invalid_input("multisig address needs multiple keys"),
            ),
        }
    }

    /// Materialize a multisig-backed address of the requested type.
    pub fn multisig(
        address_type: &AddressType,
        public_keys: Vec<PublicKey>,
    ) -> Result<Self, WalletError> {
        let build = |m: u8, n: u8, keys: Vec<PublicKey>| -> Result<AddressEntry, WalletError> {
            if keys.len() != n as usize || m == 0 || m > n || n > 16 {
                return Err(WalletError::invalid_input("bad multisig arity"));
            }
            Ok(AddressEntry::Multisig {
                m,
                public_keys: keys,
            })
        };
        match address_type {
            AddressType::Multisig { m, n } => build(*m, *n, public_keys),
            AddressType::P2wshMultisig { m, n } => Ok(AddressEntry::P2wsh {
                inner: Box::new(build(*m, *n, public_keys)?),
            }),
            AddressType::P2sh(inner) => Ok(AddressEntry::P2sh {
                inner: Box::new(AddressEntry::multisig(inner, public_keys)?),
            }),
            _ => Err(WalletError::invalid_input(
                "address type takes a single key",
            )),
        }
    }

    /// The script this entry locks to (for nested types, the redeem/witness
    /// script preimage).
    pub fn script(&self) -> Vec<u8> {
        match self {
            AddressEntry::P2pkh { public_key, compressed } => {
                let hash = hash160(&key_bytes(public_key, *compressed));
                let mut script = Vec::with_capacity(25);
                script.push(OP_DUP);
                script.push(OP_HASH160);
                script.push(20);
                script.extend_from_slice(&hash);
                script.push(OP_EQUALVERIFY);
                script.push(OP_CHECKSIG);
                script
            }
            AddressEntry::P2pk { public_key } => {
                let key = public_key.serialize();
                let mut script = Vec::with_capacity(key.len() + 2);
                script.push(key.len() as u8);
                script.extend_from_slice(&key);
                script.push(OP_CHECKSIG);
                script
            }
            AddressEntry::P2wpkh { public_key } => {
                // Witness program, also the redeem script under P2SH nesting.
                let hash = hash160(&public_key.serialize());
                let mut script = Vec::with_capacity(22);
                script.push(OP_0);
                script.push(20);
                script.extend_from_slice(&hash);
                script
            }
            AddressEntry::P2sh { inner } => {
                let hash = hash160(&inner.script());
                let mut script = Vec::with_capacity(23);
                script.push(OP_HASH160);
                script.push(20);
                script.extend_from_slice(&hash);
                script.push(OP_EQUAL);
                script
            }
            AddressEntry::P2wsh { inner } => {
                let hash = sha256(&inner.script());
                let mut script = Vec::with_capacity(34);
                script.push(OP_0);
                script.push(32);
                script.extend_from_slice(&hash);
                script
            }
            AddressEntry::Multisig { m, public_keys } => {
                let mut script = Vec::new();
                script.push(OP_1 + m);
                for key in public_keys {
                    let serialized = key.serialize();
                    script.push(serialized.len() as u8);
                    script.extend_from_slice(&serialized);
                }
                script.push(OP_1 + public_keys.len() as u8);
                script.push(OP_CHECKMULTISIG);
                script
            }
        }
    }

    /// The raw hash committed to by this address.
    pub fn hash(&self) -> Vec<u8> {
        match self {
            AddressEntry::P2pkh { public_key, compressed } => {
                hash160(&key_bytes(public_key, *compressed)).to_vec()
            }
            AddressEntry::P2pk { public_key } => hash160(&public_key.serialize()).to_vec(),
            AddressEntry::P2wpkh { public_key } => hash160(&public_key.serialize()).to_vec(),
            AddressEntry::P2sh { inner } => hash160(&inner.script()).to_vec(),
            AddressEntry::P2wsh { inner } => sha256(&inner.script()).to_vec(),
            AddressEntry::Multisig { .. } => hash160(&self.script()).to_vec(),
        }
    }

    /// Prefix byte tagging this entry's hash in reverse-lookup keys.
    fn hash_prefix(&self, settings: &NetworkSettings) -> u8 {
        match self {
            AddressEntry::P2pkh { .. } | AddressEntry::P2pk { .. } => settings.pubkey_hash_prefix,
            AddressEntry::P2wpkh { .. } => settings.witness_pubkey_hash_prefix,
            AddressEntry::P2sh { .. } => settings.script_hash_prefix,
            AddressEntry::P2wsh { .. } => settings.witness_script_hash_prefix,
            AddressEntry::Multisig { .. } => settings.script_hash_prefix,
        }
    }

    /// `prefix ‖ hash`, the key stored in address lookup caches.
    pub fn prefixed_hash(&self, settings: &NetworkSettings) -> Vec<u8> {
        let mut out = Vec::with_capacity(33);
        out.push(self.hash_prefix(settings));
        out.extend_from_slice(&self.hash());
        out
    }

    /// Display string: base58check for legacy types, bech32 for segwit.
    pub fn address(&self, settings: &NetworkSettings) -> Result<String, WalletError> {
        match self {
            AddressEntry::P2pkh { .. } | AddressEntry::P2pk { .. } => {
                let mut payload = Vec::with_capacity(21);
                payload.push(settings.pubkey_hash_prefix);
                payload.extend_from_slice(&self.hash());
                Ok(scr_addr_to_base58(&payload))
            }
            AddressEntry::P2sh { .. } | AddressEntry::Multisig { .. } => {
                let mut payload = Vec::with_capacity(21);
                payload.push(settings.script_hash_prefix);
                payload.extend_from_slice(&self.hash());
                Ok(scr_addr_to_base58(&payload))
            }
            AddressEntry::P2wpkh { .. } | AddressEntry::P2wsh { .. } => {
                scr_addr_to_segwit(&self.hash(), settings.bech32_hrp)
            }
        }
    }

    /// The spend preimage: the public key for key-hash types, the inner
    /// script for script-hash types.
    pub fn preimage(&self) -> Vec<u8> {
        match self {
            AddressEntry::P2pkh { public_key, compressed } => {
                key_bytes(public_key, *compressed)
            }
            AddressEntry::P2pk { public_key } | AddressEntry::P2wpkh { public_key } => {
                public_key.serialize().to_vec()
            }
            AddressEntry::P2sh { inner } | AddressEntry::P2wsh { inner } => inner.script(),
            AddressEntry::Multisig { .. } => self.script(),
        }
    }
}

fn key_bytes(public_key: &PublicKey, compressed: bool) -> Vec<u8> {
    if compressed {
        public_key.serialize().to_vec()
    } else {
        public_key.serialize_uncompressed().to_vec()
    }
}

/// Encode a prefixed script hash as base58check.
pub fn scr_addr_to_base58(prefixed_hash: &[u8]) -> String {
    bs58::encode(prefixed_hash).with_check().into_string()
}

/// Decode a base58check address string back to its prefixed script hash.
pub fn base58_to_scr_addr(address: &str) -> Result<Vec<u8>, WalletError> {
    bs58::decode(address)
        .with_check(None)
        .into_vec()
        .map_err(|_| WalletError::invalid_input("bad base58 address"))
}

/// Encode a witness program (v0) as a segwit bech32 address.
pub fn scr_addr_to_segwit(program: &[u8], hrp: Hrp) -> Result<String, WalletError> {
    segwit::encode_v0(hrp, program)
        .map_err(|_| WalletError::invalid_input("bad segwit program length"))
}

/// Decode a segwit address back to its witness program.
pub fn segwit_to_scr_addr(address: &str) -> Result<Vec<u8>, WalletError> {
    let (_hrp, _version, program) =
        segwit::decode(address).map_err(|_| WalletError::invalid_input("failed to decode sw address"))?;
    Ok(program)
}

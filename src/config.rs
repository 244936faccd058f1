use bech32::Hrp;

/// Network-dependent address encoding parameters.
///
/// Captured as a value threaded through the wallet façade rather than process
/// globals; a wallet keeps the settings it was opened with for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkSettings {
    /// Version byte prepended to `hash160(pubkey)` for P2PKH base58 addresses.
    pub pubkey_hash_prefix: u8,
    /// Version byte prepended to `hash160(script)` for P2SH base58 addresses.
    pub script_hash_prefix: u8,
    /// Internal prefix tagging P2WPKH script hashes in lookup keys.
    pub witness_pubkey_hash_prefix: u8,
    /// Internal prefix tagging P2WSH script hashes in lookup keys.
    pub witness_script_hash_prefix: u8,
    /// Human-readable part for segwit bech32 addresses.
    pub bech32_hrp: Hrp,
}

impl NetworkSettings {
    /// Bitcoin mainnet parameters.
    pub fn mainnet() -> Self {
        NetworkSettings {
            pubkey_hash_prefix: 0x00,
            script_hash_prefix: 0x05,
            witness_pubkey_hash_prefix: 0x90,
            witness_script_hash_prefix: 0x95,
            bech32_hrp: Hrp::parse_unchecked("bc"),
        }
    }

    /// Bitcoin testnet parameters.
    pub fn testnet() -> Self {
        NetworkSettings {
            pubkey_hash_prefix: 0x6f,
            script_hash_prefix: 0xc4,
            witness_pubkey_hash_prefix: 0x90,
            witness_script_hash_prefix: 0x95,
            bech32_hrp: Hrp::parse_unchecked("tb"),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        NetworkSettings::mainnet()
    }
}

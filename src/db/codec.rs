//! Wire helpers: the Bitcoin variable-length integer used by the record
//! format, and bincode codecs for the bootstrap structures.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::crypto::kdf::{KdfId, KdfParams};
use crate::encryption::{CipherData, EncryptedKeyRecord, KeyId};
use crate::error::WalletError;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Append a Bitcoin varint to `out`.
pub fn put_var_int(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Read a Bitcoin varint, advancing `input` past it.
pub fn get_var_int(input: &mut &[u8]) -> Result<u64, WalletError> {
    let (first, rest) = input
        .split_first()
        .ok_or_else(|| WalletError::invalid_input("truncated varint"))?;
    let (value, rest) = match first {
        0xfd => {
            let bytes: [u8; 2] = rest
                .get(..2)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| WalletError::invalid_input("truncated varint"))?;
            (u16::from_le_bytes(bytes) as u64, &rest[2..])
        }
        0xfe => {
            let bytes: [u8; 4] = rest
                .get(..4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| WalletError::invalid_input("truncated varint"))?;
            (u32::from_le_bytes(bytes) as u64, &rest[4..])
        }
        0xff => {
            let bytes: [u8; 8] = rest
                .get(..8)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| WalletError::invalid_input("truncated varint"))?;
            (u64::from_le_bytes(bytes), &rest[8..])
        }
        byte => (*byte as u64, rest),
    };
    *input = rest;
    Ok(value)
}

/// Read `len` bytes, advancing `input`.
pub fn get_bytes<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], WalletError> {
    if input.len() < len {
        return Err(WalletError::invalid_input("truncated byte run"));
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head)
}

/// Bootstrap header of the whole environment, stored in the control
/// sub-database under `0x03 ‖ "__control"`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlHeader {
    pub version: u32,
    pub salt: [u8; 32],
    pub kdf_id: KdfId,
    pub master_key_id: KeyId,
}

/// Header describing one encrypted sub-database, stored in `__headers` under
/// `0x03 ‖ name`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubDbHeader {
    pub version: u32,
    pub name: String,
    pub salt: [u8; 32],
    pub kdf_id: KdfId,
    pub default_key_id: KeyId,
}

pub fn encode_control_header(header: &ControlHeader) -> Result<Vec<u8>, WalletError> {
    Ok(options().serialize(header)?)
}

pub fn decode_control_header(bytes: &[u8]) -> Result<ControlHeader, WalletError> {
    Ok(options().deserialize(bytes)?)
}

pub fn encode_subdb_header(header: &SubDbHeader) -> Result<Vec<u8>, WalletError> {
    Ok(options().serialize(header)?)
}

pub fn decode_subdb_header(bytes: &[u8]) -> Result<SubDbHeader, WalletError> {
    Ok(options().deserialize(bytes)?)
}

pub fn encode_kdf_params(params: &KdfParams) -> Result<Vec<u8>, WalletError> {
    Ok(options().serialize(params)?)
}

pub fn decode_kdf_params(bytes: &[u8]) -> Result<KdfParams, WalletError> {
    Ok(options().deserialize(bytes)?)
}

pub fn encode_key_record(record: &EncryptedKeyRecord) -> Result<Vec<u8>, WalletError> {
    Ok(options().serialize(record)?)
}

pub fn decode_key_record(bytes: &[u8]) -> Result<EncryptedKeyRecord, WalletError> {
    Ok(options().deserialize(bytes)?)
}

pub fn encode_cipher_data(data: &CipherData) -> Result<Vec<u8>, WalletError> {
    Ok(options().serialize(data)?)
}

pub fn decode_cipher_data(bytes: &[u8]) -> Result<CipherData, WalletError> {
    Ok(options().deserialize(bytes)?)
}

pub fn encode_u32(value: u32) -> Result<Vec<u8>, WalletError> {
    Ok(options().serialize(&value)?)
}

pub fn decode_u32(bytes: &[u8]) -> Result<u32, WalletError> {
    Ok(options().deserialize(bytes)?)
}

/// Main wallet id entry: varint-prefixed string bytes.
pub fn encode_wallet_id(id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + id.len());
    put_var_int(&mut out, id.len() as u64);
    out.extend_from_slice(id.as_bytes());
    out
}

pub fn decode_wallet_id(bytes: &[u8]) -> Result<String, WalletError> {
    let mut cursor = bytes;
    let len = get_var_int(&mut cursor)? as usize;
    let raw = get_bytes(&mut cursor, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| WalletError::invalid_input("wallet id not utf-8"))
}

/// Generic serializer for serde-encoded account and asset records.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WalletError> {
    Ok(options().serialize(value)?)
}

/// Generic deserializer for serde-encoded account and asset records.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, WalletError> {
    Ok(options().deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_boundaries() {
        for value in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x1_0000, 0xffff_ffff, u64::MAX] {
            let mut buf = Vec::new();
            put_var_int(&mut buf, value);
            let mut cursor = buf.as_slice();
            assert_eq!(get_var_int(&mut cursor).expect("roundtrip"), value);
            assert!(cursor.is_empty());
        }
    }

    #[test]
    fn var_int_compact_widths() {
        let mut buf = Vec::new();
        put_var_int(&mut buf, 4);
        assert_eq!(buf, vec![4]);

        buf.clear();
        put_var_int(&mut buf, 0x1234);
        assert_eq!(buf, vec![0xfd, 0x34, 0x12]);
    }

    #[test]
    fn truncated_var_int_is_rejected() {
        let mut cursor: &[u8] = &[0xfd, 0x01];
        assert!(get_var_int(&mut cursor).is_err());
    }

    #[test]
    fn wallet_id_roundtrip() {
        let encoded = encode_wallet_id("2sePvdDBh");
        assert_eq!(decode_wallet_id(&encoded).expect("decode"), "2sePvdDBh");
    }

    #[test]
    fn subdb_header_roundtrip() {
        let header = SubDbHeader {
            version: 1,
            name: "main".to_string(),
            salt: [9u8; 32],
            kdf_id: KdfId([1u8; 16]),
            default_key_id: KeyId([2u8; 16]),
        };
        let encoded = encode_subdb_header(&header).expect("encode");
        assert_eq!(decode_subdb_header(&encoded).expect("decode"), header);
    }
}

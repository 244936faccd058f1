//! Cleartext layout of encrypted records and erasure markers.
//!
//! A record's cleartext is `hmac(32) ‖ varint(len k) ‖ k ‖ varint(len v) ‖ v`;
//! the MAC covers `varint ‖ k ‖ varint ‖ v ‖ db-key` under the per-counter
//! MAC key, binding every record to its on-disk position.

use crate::crypto::hashes::hmac_sha256;
use crate::db::codec::{get_bytes, get_var_int, put_var_int};
use crate::db::schema::ERASED_FLAG;
use crate::error::WalletError;

/// On-disk key of a record: the monotonic counter, big-endian.
pub fn db_key(counter: u32) -> [u8; 4] {
    counter.to_be_bytes()
}

fn framed(data_key: &[u8], data_val: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data_key.len() + data_val.len() + 10);
    put_var_int(&mut out, data_key.len() as u64);
    out.extend_from_slice(data_key);
    put_var_int(&mut out, data_val.len() as u64);
    out.extend_from_slice(data_val);
    out
}

fn compute_hmac(mac_key: &[u8; 32], counter: u32, data_key: &[u8], data_val: &[u8]) -> [u8; 32] {
    let mut message = framed(data_key, data_val);
    message.extend_from_slice(&db_key(counter));
    hmac_sha256(mac_key, &message)
}

/// Assemble the cleartext payload of a record.
pub fn assemble(mac_key: &[u8; 32], counter: u32, data_key: &[u8], data_val: &[u8]) -> Vec<u8> {
    let tag = compute_hmac(mac_key, counter, data_key, data_val);
    let mut payload = Vec::with_capacity(32 + data_key.len() + data_val.len() + 10);
    payload.extend_from_slice(&tag);
    payload.extend_from_slice(&framed(data_key, data_val));
    payload
}

/// Parse a record's cleartext and verify its MAC against the counter it was
/// read from.
pub fn parse(
    mac_key: &[u8; 32],
    counter: u32,
    payload: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), WalletError> {
    let mut cursor = payload;
    let tag = get_bytes(&mut cursor, 32).map_err(|_| WalletError::HmacMismatch { counter })?;

    let parse_body = |cursor: &mut &[u8]| -> Result<(Vec<u8>, Vec<u8>), WalletError> {
        let key_len = get_var_int(cursor)? as usize;
        let data_key = get_bytes(cursor, key_len)?.to_vec();
        let val_len = get_var_int(cursor)? as usize;
        let data_val = get_bytes(cursor, val_len)?.to_vec();
        Ok((data_key, data_val))
    };
    let (data_key, data_val) =
        parse_body(&mut cursor).map_err(|_| WalletError::HmacMismatch { counter })?;

    // Trailing bytes mean a foreign or corrupted payload.
    if !cursor.is_empty() {
        return Err(WalletError::HmacMismatch { counter });
    }

    let expected = compute_hmac(mac_key, counter, &data_key, &data_val);
    if tag != expected {
        return Err(WalletError::HmacMismatch { counter });
    }
    Ok((data_key, data_val))
}

/// Cleartext value of an erasure record naming an old counter:
/// `"erased" ‖ varint(4) ‖ BE32(old counter)`.
pub fn erasure_value(old_counter: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(ERASED_FLAG.len() + 5);
    out.extend_from_slice(ERASED_FLAG);
    put_var_int(&mut out, 4);
    out.extend_from_slice(&old_counter.to_be_bytes());
    out
}

/// Recognize an erasure record's value, returning the counter it names.
pub fn parse_erasure(data_val: &[u8]) -> Option<u32> {
    let mut cursor = data_val.strip_prefix(ERASED_FLAG)?;
    if get_var_int(&mut cursor).ok()? != 4 {
        return None;
    }
    let bytes: [u8; 4] = cursor.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

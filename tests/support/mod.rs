//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use coffer::crypto::cipher::random_array;
use coffer::crypto::kdf::KdfParams;
use coffer::encryption::PassphrasePrompt;

/// Cheap KDF parameters so tests spend their time on the protocol, not on
/// memory-hard hashing.
pub fn test_kdf() -> KdfParams {
    KdfParams::new(1024 * 1024, 1, random_array())
}

/// Prompt that always answers with `pass`.
pub fn prompt(pass: &'static [u8]) -> PassphrasePrompt {
    Arc::new(move |_ids| pass.to_vec())
}

/// Prompt that answers with an owned passphrase.
pub fn prompt_owned(pass: Vec<u8>) -> PassphrasePrompt {
    Arc::new(move |_ids| pass.clone())
}

/// Whether `needle` appears as a contiguous byte run in any file under `dir`.
pub fn dir_contains_bytes(dir: &Path, needle: &[u8]) -> bool {
    if needle.is_empty() {
        return false;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if dir_contains_bytes(&path, needle) {
                return true;
            }
            continue;
        }
        if let Ok(contents) = fs::read(&path) {
            if contents
                .windows(needle.len())
                .any(|window| window == needle)
            {
                return true;
            }
        }
    }
    false
}

//! User comment store: plain logical entries in the `__meta_comments`
//! sub-database, keyed by arbitrary caller bytes.

use crate::db::schema;
use crate::error::WalletError;

use super::Wallet;

impl Wallet {
    /// Store or replace a comment.
    pub fn set_comment(&self, key: &[u8], comment: &[u8]) -> Result<(), WalletError> {
        let tx = self.storage().begin_write(schema::COMMENTS_DB_NAME)?;
        tx.insert(key, comment)?;
        tx.commit()
    }

    /// Fetch a comment.
    pub fn get_comment(&self, key: &[u8]) -> Result<Vec<u8>, WalletError> {
        let tx = self.storage().begin_read(schema::COMMENTS_DB_NAME)?;
        tx.get(key)
            .ok_or_else(|| WalletError::not_found("comment"))
    }

    /// Delete a comment; missing keys are reported as absent.
    pub fn delete_comment(&self, key: &[u8]) -> Result<(), WalletError> {
        let tx = self.storage().begin_write(schema::COMMENTS_DB_NAME)?;
        if tx.get(key).is_none() {
            return Err(WalletError::not_found("comment"));
        }
        tx.erase(key)?;
        tx.commit()
    }

    /// Every stored comment, key-ordered.
    pub fn comments(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, WalletError> {
        let tx = self.storage().begin_read(schema::COMMENTS_DB_NAME)?;
        Ok(tx.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect())
    }
}

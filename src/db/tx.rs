//! Read and write transactions over encrypted sub-databases.
//!
//! Within a thread, nested same-mode transactions share the outer staging
//! buffer; mixing modes on one thread is refused. Across threads there is at
//! most one writing thread at a time; competing writers fail with `Busy`
//! without blocking. Readers are always admitted and keep the snapshot they
//! opened with for their whole lifetime.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::error;

use crate::db::subdb::{Snapshot, Staging};
use crate::db::StorageInner;
use crate::error::WalletError;

#[derive(Default)]
pub(crate) struct WriteScope {
    pub depth: u32,
    pub staging: Staging,
}

/// Book-keeping of every live transaction in one environment.
#[derive(Default)]
pub(crate) struct TxRegistry {
    pub writer_thread: Option<ThreadId>,
    pub write_scopes: BTreeMap<String, WriteScope>,
    pub read_depth: HashMap<ThreadId, u32>,
    pub live: usize,
}

impl TxRegistry {
    pub fn enter_write(&mut self, name: &str) -> Result<(), WalletError> {
        let current = thread::current().id();
        if self.read_depth.get(&current).copied().unwrap_or(0) > 0 {
            return Err(WalletError::Busy("read transaction live on this thread"));
        }
        match self.writer_thread {
            Some(owner) if owner != current => {
                return Err(WalletError::Busy("another thread holds the write transaction"))
            }
            _ => {}
        }
        self.writer_thread = Some(current);
        self.write_scopes.entry(name.to_string()).or_default().depth += 1;
        self.live += 1;
        Ok(())
    }

    pub fn enter_read(&mut self) -> Result<(), WalletError> {
        let current = thread::current().id();
        if self.writer_thread == Some(current) {
            return Err(WalletError::Busy("write transaction live on this thread"));
        }
        *self.read_depth.entry(current).or_insert(0) += 1;
        self.live += 1;
        Ok(())
    }

    pub fn exit_read(&mut self) {
        let current = thread::current().id();
        if let Some(depth) = self.read_depth.get_mut(&current) {
            *depth = depth.saturating_sub(1);
            if *depth == 0 {
                self.read_depth.remove(&current);
            }
        }
        self.live = self.live.saturating_sub(1);
    }

    /// Leave one write scope; returns the staging buffer once the outermost
    /// scope for `name` closes.
    pub fn exit_write(&mut self, name: &str) -> Option<Staging> {
        self.live = self.live.saturating_sub(1);
        let scope = self.write_scopes.get_mut(name)?;
        scope.depth -= 1;
        if scope.depth > 0 {
            return None;
        }
        let staging = self
            .write_scopes
            .remove(name)
            .map(|scope| scope.staging)
            .unwrap_or_default();
        if self.write_scopes.is_empty() {
            self.writer_thread = None;
        }
        Some(staging)
    }
}

/// Scoped read transaction: an immutable snapshot of one sub-database.
pub struct ReadTx {
    inner: Arc<StorageInner>,
    snapshot: Snapshot,
}

impl ReadTx {
    pub(crate) fn new(inner: Arc<StorageInner>, snapshot: Snapshot) -> Self {
        ReadTx { inner, snapshot }
    }

    /// Committed value for a data-key, if any.
    pub fn get(&self, data_key: &[u8]) -> Option<Vec<u8>> {
        self.snapshot.get(data_key).map(|entry| entry.value.clone())
    }

    /// Ordered iteration over the snapshot.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.snapshot
            .iter()
            .map(|(key, entry)| (key.as_slice(), entry.value.as_slice()))
    }

    /// Number of live entries in the snapshot.
    pub fn entry_count(&self) -> usize {
        self.snapshot.len()
    }
}

impl Drop for ReadTx {
    fn drop(&mut self) {
        self.inner.registry.lock().exit_read();
    }
}

/// Scoped write transaction. The outermost scope runs the compaction
/// protocol on commit (or on drop, logging any failure).
pub struct WriteTx {
    inner: Arc<StorageInner>,
    name: String,
    finished: bool,
}

impl WriteTx {
    pub(crate) fn new(inner: Arc<StorageInner>, name: String) -> Self {
        WriteTx {
            inner,
            name,
            finished: false,
        }
    }

    /// Stage a write. Empty data-keys are rejected.
    pub fn insert(&self, data_key: &[u8], data_val: &[u8]) -> Result<(), WalletError> {
        if data_key.is_empty() {
            return Err(WalletError::invalid_input("empty data-key"));
        }
        let mut registry = self.inner.registry.lock();
        let scope = registry
            .write_scopes
            .get_mut(&self.name)
            .expect("write scope exists for live tx");
        scope
            .staging
            .stage(data_key.to_vec(), Some(data_val.to_vec()));
        Ok(())
    }

    /// Stage a deletion, tombstoning the entry's current on-disk counter.
    pub fn erase(&self, data_key: &[u8]) -> Result<(), WalletError> {
        let snapshot = self.inner.subdb_snapshot(&self.name)?;
        let mut registry = self.inner.registry.lock();
        let scope = registry
            .write_scopes
            .get_mut(&self.name)
            .expect("write scope exists for live tx");
        if let Some(entry) = snapshot.get(data_key) {
            scope.staging.tombstones.insert(entry.counter);
        }
        scope.staging.stage(data_key.to_vec(), None);
        Ok(())
    }

    /// Staged value if present, else the committed value.
    pub fn get(&self, data_key: &[u8]) -> Option<Vec<u8>> {
        {
            let registry = self.inner.registry.lock();
            if let Some(scope) = registry.write_scopes.get(&self.name) {
                if let Some(op) = scope.staging.get(data_key) {
                    return op.clone();
                }
            }
        }
        self.inner
            .subdb_snapshot(&self.name)
            .ok()?
            .get(data_key)
            .map(|entry| entry.value.clone())
    }

    /// Ordered view of the committed entries merged with staged writes;
    /// staged erasures hide committed entries.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let snapshot = match self.inner.subdb_snapshot(&self.name) {
            Ok(snapshot) => snapshot,
            Err(_) => return Vec::new(),
        };
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = snapshot
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect();

        let registry = self.inner.registry.lock();
        if let Some(scope) = registry.write_scopes.get(&self.name) {
            for (key, op) in scope.staging.iter() {
                match op {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Close this scope. The outermost scope rewrites the sub-database; inner
    /// scopes only validate.
    pub fn commit(mut self) -> Result<(), WalletError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), WalletError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let staging = self.inner.registry.lock().exit_write(&self.name);
        let Some(staging) = staging else {
            return Ok(()); // nested scope
        };
        if staging.is_empty() {
            return Ok(());
        }
        self.inner.commit_subdb(&self.name, staging)
    }
}

impl Drop for WriteTx {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            error!(subdb = %self.name, %err, "write transaction commit failed on drop");
        }
    }
}

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::wal::{RecordLog, WalError};

/// Rewrite the log as a snapshot once it holds this many records beyond the
/// live entry count.
const COMPACTION_SLACK: usize = 4096;

/// Binary record encoded into the environment log.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogRecord {
    OpenDb { name: String },
    Put { db: String, key: Vec<u8>, value: Vec<u8> },
    Delete { db: String, key: Vec<u8> },
    Clear { db: String },
    Commit,
}

/// Error type reported by the key-value environment.
#[derive(Debug, Error)]
pub enum KvError {
    /// Failure caused by the underlying record log.
    #[error("log error: {0}")]
    Wal(#[from] WalError),
    /// Persistence layer failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A log record failed to decode; the file can no longer be trusted.
    #[error("corrupt log record")]
    Corrupt,
    /// Referenced sub-database has not been opened in this environment.
    #[error("unknown sub-database: {0}")]
    UnknownDb(String),
    /// The environment's fixed sub-database slot count is exhausted.
    #[error("sub-database slots exhausted ({max})")]
    DbSlotsExhausted { max: usize },
}

/// Ordered key-value environment with named sub-databases.
///
/// All data lives inside a single append-only log. The environment keeps one
/// in-memory ordered map per sub-database while the log provides a durable
/// history that is replayed to recover the latest state. The number of
/// sub-database slots is fixed when the environment is opened.
#[derive(Debug)]
pub struct KvEnv {
    log: RecordLog,
    path: PathBuf,
    dbs: BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
    pending: Vec<LogRecord>,
    max_dbs: usize,
}

impl KvEnv {
    /// Open (or create) an environment located at `directory` with room for at
    /// most `max_dbs` named sub-databases.
    pub fn open<P: AsRef<Path>>(directory: P, max_dbs: usize) -> Result<Self, KvError> {
        let directory = directory.as_ref();
        let mut log = RecordLog::open(directory)?;
        let history = log.replay()?;

        let mut env = KvEnv {
            log,
            path: directory.to_path_buf(),
            dbs: BTreeMap::new(),
            pending: Vec::new(),
            max_dbs,
        };

        for raw in history {
            let record: LogRecord =
                bincode::deserialize(&raw).map_err(|_| KvError::Corrupt)?;
            env.apply_record(record);
        }
        Ok(env)
    }

    fn apply_record(&mut self, record: LogRecord) {
        match record {
            LogRecord::OpenDb { name } => {
                self.dbs.entry(name).or_default();
            }
            LogRecord::Put { db, key, value } => {
                self.dbs.entry(db).or_default().insert(key, value);
            }
            LogRecord::Delete { db, key } => {
                if let Some(map) = self.dbs.get_mut(&db) {
                    map.remove(&key);
                }
            }
            LogRecord::Clear { db } => {
                if let Some(map) = self.dbs.get_mut(&db) {
                    map.clear();
                }
            }
            LogRecord::Commit => {}
        }
    }

    /// Directory this environment lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fixed sub-database slot count.
    pub fn max_dbs(&self) -> usize {
        self.max_dbs
    }

    /// Names of every sub-database currently open.
    pub fn db_names(&self) -> Vec<String> {
        self.dbs.keys().cloned().collect()
    }

    /// Whether `name` designates an open sub-database.
    pub fn has_db(&self, name: &str) -> bool {
        self.dbs.contains_key(name)
    }

    /// Register a named sub-database, claiming one of the fixed slots.
    /// Re-opening an existing sub-database is a no-op.
    pub fn open_db(&mut self, name: &str) -> Result<(), KvError> {
        if self.dbs.contains_key(name) {
            return Ok(());
        }
        if self.dbs.len() >= self.max_dbs {
            return Err(KvError::DbSlotsExhausted { max: self.max_dbs });
        }
        self.dbs.insert(name.to_string(), BTreeMap::new());
        self.pending.push(LogRecord::OpenDb {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Fetch a value by key.
    pub fn get(&self, db: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.dbs.get(db)?.get(key).cloned()
    }

    /// Stage a put mutation.
    pub fn put(&mut self, db: &str, key: Vec<u8>, value: Vec<u8>) -> Result<(), KvError> {
        let map = self
            .dbs
            .get_mut(db)
            .ok_or_else(|| KvError::UnknownDb(db.to_string()))?;
        map.insert(key.clone(), value.clone());
        self.pending.push(LogRecord::Put {
            db: db.to_string(),
            key,
            value,
        });
        Ok(())
    }

    /// Stage a delete mutation.
    pub fn delete(&mut self, db: &str, key: &[u8]) -> Result<(), KvError> {
        let map = self
            .dbs
            .get_mut(db)
            .ok_or_else(|| KvError::UnknownDb(db.to_string()))?;
        map.remove(key);
        self.pending.push(LogRecord::Delete {
            db: db.to_string(),
            key: key.to_vec(),
        });
        Ok(())
    }

    /// Stage removal of every entry in a sub-database.
    pub fn clear_db(&mut self, db: &str) -> Result<(), KvError> {
        let map = self
            .dbs
            .get_mut(db)
            .ok_or_else(|| KvError::UnknownDb(db.to_string()))?;
        map.clear();
        self.pending.push(LogRecord::Clear {
            db: db.to_string(),
        });
        Ok(())
    }

    /// Number of entries currently stored in a sub-database.
    pub fn entry_count(&self, db: &str) -> usize {
        self.dbs.get(db).map(|map| map.len()).unwrap_or(0)
    }

    /// Iterate a sub-database in key order.
    pub fn scan<'a>(&'a self, db: &str) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.dbs
            .get(db)
            .into_iter()
            .flat_map(|map| map.iter().map(|(k, v)| (k.as_slice(), v.as_slice())))
    }

    /// Flush staged mutations to the log.
    pub fn commit(&mut self) -> Result<(), KvError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        self.pending.push(LogRecord::Commit);
        for record in self.pending.drain(..) {
            let raw = bincode::serialize(&record).expect("serialize log record");
            self.log.append(&raw)?;
        }
        self.log.sync()?;

        self.maybe_compact()?;
        Ok(())
    }

    /// Rewrite the log as a snapshot of the live state once enough history has
    /// accumulated.
    fn maybe_compact(&mut self) -> Result<(), KvError> {
        let live: usize = self.dbs.values().map(|map| map.len()).sum();
        if self.log.record_count() <= live + self.dbs.len() + COMPACTION_SLACK {
            return Ok(());
        }

        let mut records = Vec::with_capacity(live + self.dbs.len() + 1);
        for (name, map) in &self.dbs {
            records.push(
                bincode::serialize(&LogRecord::OpenDb { name: name.clone() })
                    .expect("serialize log record"),
            );
            for (key, value) in map {
                records.push(
                    bincode::serialize(&LogRecord::Put {
                        db: name.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .expect("serialize log record"),
                );
            }
        }
        records.push(bincode::serialize(&LogRecord::Commit).expect("serialize log record"));

        self.log.rewrite(&records)?;
        Ok(())
    }
}

pub mod env;
pub mod wal;

pub use env::{KvEnv, KvError};
pub use wal::{RecordLog, WalError};

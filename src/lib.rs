pub mod bloom;
pub mod cache;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod flock;
pub mod storage;
pub mod wal;

pub use config::{Config, WalConfig};
pub use db::Database;
pub use document::{Document, Record};
pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Error, Result};

/// An opaque document payload. The store never inspects fields.
pub type Document = serde_json::Value;

/// The on-disk unit of `data.db`: a document wrapped with its id and a
/// revision tag, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub rev: String,
    pub data: Document,
}

impl Record {
    pub fn new(id: impl Into<String>, data: Document) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            rev: new_revision()?,
            data,
        })
    }

    /// Encodes the record as a single line. The JSON encoder escapes any
    /// newline inside strings, so `\n` only ever terminates a record.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn decode(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Generates a short opaque revision tag from a time-plus-random seed.
/// Uniqueness is best-effort; nothing depends on it for correctness.
pub fn new_revision() -> Result<String> {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| Error::Revision(e.to_string()))?
        .as_nanos() as u64;
    let nonce: u64 = rand::random();

    let mut seed = [0u8; 16];
    seed[..8].copy_from_slice(&nanos.to_le_bytes());
    seed[8..].copy_from_slice(&nonce.to_le_bytes());

    Ok(format!("{:016x}", xxh3_64(&seed)))
}

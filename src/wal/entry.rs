use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::document::Document;
use crate::error::Result;

/// The mutation kinds the log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Put,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Put => "PUT",
            Operation::Delete => "DELETE",
        }
    }
}

/// One logged mutation. Entries are serialized in batches, one JSON array
/// per segment line, and individually checksummed so replay can skip a
/// torn entry without losing its neighbors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Wall-clock seconds at log time.
    pub timestamp: f64,
    pub operation: Operation,
    pub id: String,
    pub data: Option<Document>,
    /// xxh3-64 over `timestamp || operation || id || encode(data)`,
    /// rendered as 16 hex digits.
    pub checksum: String,
}

impl WalEntry {
    pub fn new(operation: Operation, id: impl Into<String>, data: Option<Document>) -> Result<Self> {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let mut entry = Self {
            timestamp,
            operation,
            id: id.into(),
            data,
            checksum: String::new(),
        };
        entry.checksum = entry.compute_checksum()?;
        Ok(entry)
    }

    /// Recomputes the checksum from the entry's fields, ignoring the
    /// stored checksum.
    pub fn compute_checksum(&self) -> Result<String> {
        let mut buf = Vec::with_capacity(32 + self.id.len());
        buf.extend_from_slice(&self.timestamp.to_bits().to_le_bytes());
        buf.extend_from_slice(self.operation.as_str().as_bytes());
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&serde_json::to_vec(&self.data)?);
        Ok(format!("{:016x}", xxh3_64(&buf)))
    }

    /// True when the stored checksum matches the entry's contents.
    pub fn verify(&self) -> bool {
        self.compute_checksum()
            .map(|computed| computed == self.checksum)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_verifies() {
        let entry = WalEntry::new(Operation::Put, "a", Some(json!({"v": 1})))
            .expect("Failed to build entry");
        assert!(entry.verify());
    }

    #[test]
    fn test_tampered_entry_fails_verification() {
        let mut entry = WalEntry::new(Operation::Put, "a", Some(json!({"v": 1})))
            .expect("Failed to build entry");
        entry.id = "b".to_string();
        assert!(!entry.verify());

        let mut entry = WalEntry::new(Operation::Delete, "a", None).expect("Failed to build entry");
        entry.operation = Operation::Put;
        assert!(!entry.verify());
    }

    #[test]
    fn test_checksum_survives_json_roundtrip() {
        let entry = WalEntry::new(Operation::Put, "doc", Some(json!({"pi": 3.25, "n": -7})))
            .expect("Failed to build entry");
        let line = serde_json::to_string(&entry).expect("Failed to encode");
        let decoded: WalEntry = serde_json::from_str(&line).expect("Failed to decode");
        assert!(decoded.verify());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_wire_format() {
        let entry =
            WalEntry::new(Operation::Delete, "doc", None).expect("Failed to build entry");
        let value = serde_json::to_value(&entry).expect("Failed to encode");
        assert_eq!(value["operation"], "DELETE");
        assert!(value["data"].is_null());
        assert_eq!(value["checksum"].as_str().unwrap().len(), 16);
        assert!(value["timestamp"].is_f64());
    }
}

pub mod entry;

pub use entry::{Operation, WalEntry};

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::WalConfig;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::flock::{FileLock, LockGuard};

/// Segmented, batched write-ahead log.
///
/// Every mutation is logged before the storage engine applies it. Entries
/// accumulate in memory and reach disk as one line-delimited batch per
/// flush. Segments are named `<base>.<N>` with N counting up from 1;
/// exactly one segment is the append target at any time. Rotation
/// archives every live segment as `<original>.<epoch>.old` and starts
/// over at segment 1.
pub struct Wal {
    base: PathBuf,
    config: WalConfig,
    lock: FileLock,
    pending: Vec<WalEntry>,
    counter: u64,
    active: File,
    active_size: u64,
}

impl Wal {
    /// Opens the log at the given base path, resuming the highest
    /// existing segment or creating segment 1.
    pub fn open(base: impl Into<PathBuf>, config: WalConfig) -> Result<Self> {
        let base = base.into();
        let lock = FileLock::open(lock_path(&base))?;

        let counter = live_segments(&base)?
            .last()
            .map(|(n, _)| *n)
            .unwrap_or(1);

        let (active, active_size) = open_segment(&base, counter)?;

        debug!(segment = counter, size = active_size, "opened wal");

        Ok(Self {
            base,
            config,
            lock,
            pending: Vec::new(),
            counter,
            active,
            active_size,
        })
    }

    /// Buffers an entry for the next flush. No disk I/O happens here;
    /// the entry reaches a segment when `flush` runs.
    pub fn log(&mut self, operation: Operation, id: &str, data: Option<Document>) -> Result<()> {
        self.pending.push(WalEntry::new(operation, id, data)?);
        Ok(())
    }

    /// Writes the pending entries as one batch line and forces them to
    /// disk. A no-op when nothing is pending. Rotates afterwards if the
    /// live segments have outgrown `max_log_size`.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.exclusive()?;

        let mut line = serde_json::to_vec(&self.pending)?;
        line.push(b'\n');

        // A batch that would cross the per-segment cap goes to a fresh
        // segment instead.
        if self.active_size > 0 && self.active_size + line.len() as u64 > self.config.segment_size {
            self.counter += 1;
            let (active, active_size) = open_segment(&self.base, self.counter)?;
            self.active = active;
            self.active_size = active_size;
        }

        let path = segment_path(&self.base, self.counter);
        self.active
            .write_all(&line)
            .map_err(|e| Error::io("append wal batch", &path, e))?;
        self.active
            .sync_all()
            .map_err(|e| Error::io("sync wal segment", &path, e))?;

        self.active_size += line.len() as u64;
        debug!(
            segment = self.counter,
            entries = self.pending.len(),
            "flushed wal batch"
        );
        self.pending.clear();

        if self.live_size()? > self.config.max_log_size {
            let active = rotate_segments(&self.base)?;
            self.counter = 1;
            self.active = active;
            self.active_size = 0;
        }
        Ok(())
    }

    /// Archives every live segment and starts a fresh segment 1.
    pub fn rotate(&mut self) -> Result<()> {
        let _guard = self.lock.exclusive()?;
        let active = rotate_segments(&self.base)?;
        self.counter = 1;
        self.active = active;
        self.active_size = 0;
        Ok(())
    }

    /// Yields entries from every live segment in counter order, oldest
    /// first. Lazy and single-use. Undecodable lines and entries whose
    /// checksum does not match are skipped. The cursor holds the WAL's
    /// shared lock until it is dropped, keeping writers out for the
    /// whole replay.
    pub fn replay(&self) -> Result<Replay<'_>> {
        let guard = self.lock.shared()?;
        let segments = live_segments(&self.base)?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        Ok(Replay {
            _guard: guard,
            segments,
            reader: None,
            batch: VecDeque::new(),
        })
    }

    /// Number of entries waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The active segment number.
    pub fn segment(&self) -> u64 {
        self.counter
    }

    fn live_size(&self) -> Result<u64> {
        let mut total = 0;
        for (_, path) in live_segments(&self.base)? {
            total += std::fs::metadata(&path)
                .map_err(|e| Error::io("stat wal segment", &path, e))?
                .len();
        }
        Ok(total)
    }
}

fn open_segment(base: &Path, counter: u64) -> Result<(File, u64)> {
    let path = segment_path(base, counter);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::io("open wal segment", &path, e))?;
    let size = file
        .metadata()
        .map_err(|e| Error::io("stat wal segment", &path, e))?
        .len();
    Ok((file, size))
}

/// Renames every live segment to `<original>.<epoch>.old` and returns a
/// fresh, empty segment 1. Caller holds the exclusive lock.
fn rotate_segments(base: &Path) -> Result<File> {
    let epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let segments = live_segments(base)?;
    info!(segments = segments.len(), epoch, "rotating wal");

    for (_, path) in &segments {
        let archived = path.with_file_name(format!(
            "{}.{epoch}.old",
            path.file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::IO(format!("bad segment name: {}", path.display())))?
        ));
        std::fs::rename(path, &archived)
            .map_err(|e| Error::io("archive wal segment", path, e))?;
    }

    Ok(open_segment(base, 1)?.0)
}

fn lock_path(base: &Path) -> PathBuf {
    base.with_file_name(format!(
        "{}.lock",
        base.file_name().and_then(|n| n.to_str()).unwrap_or("wal")
    ))
}

fn segment_path(base: &Path, counter: u64) -> PathBuf {
    base.with_file_name(format!(
        "{}.{counter}",
        base.file_name().and_then(|n| n.to_str()).unwrap_or("wal")
    ))
}

/// Live segments as `(counter, path)`, sorted by counter. Archived
/// `.old` files and the lock file do not parse as a bare integer suffix
/// and are ignored.
fn live_segments(base: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let dir = base.parent().unwrap_or(Path::new("."));
    let prefix = format!(
        "{}.",
        base.file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::IO(format!("bad wal base path: {}", base.display())))?
    );

    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io("read wal dir", dir, e))? {
        let entry = entry.map_err(|e| Error::io("read wal dir", dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(&prefix) else {
            continue;
        };
        if let Ok(counter) = suffix.parse::<u64>() {
            segments.push((counter, entry.path()));
        }
    }
    segments.sort_by_key(|(n, _)| *n);
    Ok(segments)
}

/// Lazy cursor over the surviving log entries, in write order. Holds the
/// WAL's shared lock for its lifetime; dropping the cursor releases it.
pub struct Replay<'a> {
    _guard: LockGuard<'a>,
    segments: VecDeque<PathBuf>,
    reader: Option<BufReader<File>>,
    batch: VecDeque<WalEntry>,
}

impl Replay<'_> {
    /// Reads lines until a valid batch is decoded, then queues its
    /// verified entries. Returns false at the end of the last segment.
    fn fill_batch(&mut self) -> Result<bool> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                let Some(path) = self.segments.pop_front() else {
                    return Ok(false);
                };
                let file =
                    File::open(&path).map_err(|e| Error::io("open wal segment", &path, e))?;
                self.reader = Some(BufReader::new(file));
                continue;
            };

            let mut line = String::new();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                self.reader = None;
                continue;
            }

            let entries: Vec<WalEntry> = match serde_json::from_str(line.trim_end()) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(%err, "skipping undecodable wal batch");
                    continue;
                }
            };
            for entry in entries {
                if entry.verify() {
                    self.batch.push_back(entry);
                } else {
                    warn!(id = %entry.id, "skipping wal entry with bad checksum");
                }
            }
            if !self.batch.is_empty() {
                return Ok(true);
            }
        }
    }
}

impl Iterator for Replay<'_> {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(entry) = self.batch.pop_front() {
            return Some(Ok(entry));
        }
        match self.fill_batch() {
            Ok(true) => self.batch.pop_front().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Seek, SeekFrom};
    use tempfile::TempDir;

    fn open_wal(dir: &TempDir, config: WalConfig) -> Wal {
        Wal::open(dir.path().join("wal.log"), config).expect("Failed to open WAL")
    }

    fn collect(wal: &Wal) -> Vec<WalEntry> {
        wal.replay()
            .expect("Failed to create replay")
            .collect::<Result<Vec<_>>>()
            .expect("Replay failed")
    }

    #[test]
    fn test_log_flush_replay() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut wal = open_wal(&dir, WalConfig::default());

        wal.log(Operation::Put, "a", Some(json!({"v": 1})))
            .expect("Failed to log");
        wal.log(Operation::Delete, "b", None).expect("Failed to log");
        assert_eq!(wal.pending_len(), 2);

        wal.flush().expect("Failed to flush");
        assert_eq!(wal.pending_len(), 0);

        let entries = collect(&wal);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation, Operation::Put);
        assert_eq!(entries[0].id, "a");
        assert_eq!(entries[0].data, Some(json!({"v": 1})));
        assert_eq!(entries[1].operation, Operation::Delete);
        assert_eq!(entries[1].data, None);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut wal = open_wal(&dir, WalConfig::default());

        wal.flush().expect("Failed to flush");
        let path = dir.path().join("wal.log.1");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_log_is_memory_only() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut wal = open_wal(&dir, WalConfig::default().max_batch_size(2));

        for i in 0..5 {
            wal.log(Operation::Put, &format!("doc-{i}"), Some(json!(i)))
                .unwrap();
        }
        // Entries only accumulate; nothing reaches the segment until an
        // explicit flush, regardless of the batch threshold.
        assert_eq!(wal.pending_len(), 5);
        let path = dir.path().join("wal.log.1");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        wal.flush().expect("Failed to flush");
        assert_eq!(wal.pending_len(), 0);
        assert_eq!(collect(&wal).len(), 5);
    }

    #[test]
    fn test_segment_cap_opens_new_segment() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        // Tiny cap: every flushed batch crosses it.
        let mut wal = open_wal(
            &dir,
            WalConfig::default().segment_size(16).max_log_size(1 << 30),
        );

        for i in 0..3 {
            wal.log(Operation::Put, &format!("doc-{i}"), Some(json!({"i": i})))
                .unwrap();
            wal.flush().expect("Failed to flush");
        }

        assert_eq!(wal.segment(), 3);
        assert!(dir.path().join("wal.log.1").exists());
        assert!(dir.path().join("wal.log.2").exists());
        assert!(dir.path().join("wal.log.3").exists());

        // Replay still yields everything, in order.
        let ids: Vec<_> = collect(&wal).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["doc-0", "doc-1", "doc-2"]);
    }

    #[test]
    fn test_rotation_archives_segments() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut wal = open_wal(
            &dir,
            WalConfig::default().segment_size(64).max_log_size(64),
        );

        for i in 0..4 {
            wal.log(Operation::Put, &format!("doc-{i}"), Some(json!({"i": i})))
                .unwrap();
            wal.flush().expect("Failed to flush");
        }

        // Rotation ran: the live log was reset and the old segments were
        // renamed with an .old suffix.
        assert_eq!(wal.segment(), 1);
        assert_eq!(collect(&wal).len(), 0);

        let archived = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".old"))
            .count();
        assert!(archived > 0, "expected archived segments");
    }

    #[test]
    fn test_counter_resumes_after_reopen() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let mut wal = open_wal(
                &dir,
                WalConfig::default().segment_size(16).max_log_size(1 << 30),
            );
            for i in 0..3 {
                wal.log(Operation::Put, &format!("doc-{i}"), Some(json!(i)))
                    .unwrap();
                wal.flush().expect("Failed to flush");
            }
            assert_eq!(wal.segment(), 3);
        }

        let wal = open_wal(
            &dir,
            WalConfig::default().segment_size(16).max_log_size(1 << 30),
        );
        assert_eq!(wal.segment(), 3);
        assert_eq!(collect(&wal).len(), 3);
    }

    #[test]
    fn test_torn_batch_is_skipped() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut wal = open_wal(&dir, WalConfig::default());

        wal.log(Operation::Put, "a", Some(json!({"v": 1}))).unwrap();
        wal.flush().expect("Failed to flush");
        wal.log(Operation::Put, "b", Some(json!({"v": 2}))).unwrap();
        wal.flush().expect("Failed to flush");

        // Corrupt the last byte of the second batch line.
        let path = dir.path().join("wal.log.1");
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("Failed to open segment");
        let len = file.metadata().unwrap().len();
        file.seek(SeekFrom::Start(len - 2)).unwrap();
        file.write_all(b"X").unwrap();

        let entries = collect(&wal);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "a");
    }

    #[test]
    fn test_bad_checksum_entry_is_skipped() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let wal = open_wal(&dir, WalConfig::default());

        // Hand-build a batch with one valid and one tampered entry.
        let good = WalEntry::new(Operation::Put, "good", Some(json!(1))).unwrap();
        let mut bad = WalEntry::new(Operation::Put, "bad", Some(json!(2))).unwrap();
        bad.checksum = "0000000000000000".to_string();

        let path = dir.path().join("wal.log.1");
        let mut line = serde_json::to_vec(&vec![good, bad]).unwrap();
        line.push(b'\n');
        std::fs::write(&path, line).unwrap();

        let entries = collect(&wal);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "good");
    }

    #[test]
    fn test_replay_order_across_segments() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut wal = open_wal(
            &dir,
            WalConfig::default().segment_size(8).max_log_size(1 << 30),
        );

        for i in 0..10 {
            wal.log(Operation::Put, &format!("doc-{i:02}"), Some(json!(i)))
                .unwrap();
            wal.flush().expect("Failed to flush");
        }

        let ids: Vec<_> = collect(&wal).into_iter().map(|e| e.id).collect();
        let expected: Vec<_> = (0..10).map(|i| format!("doc-{i:02}")).collect();
        assert_eq!(ids, expected);
    }
}

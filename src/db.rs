use std::fs;

use tracing::{info, warn};

use crate::config::Config;
use crate::document::Document;
use crate::errinput;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::storage::{Iterate, StorageEngine};
use crate::wal::{Operation, Wal};

const LOCK_FILE: &str = "db.lock";
const WAL_BASE: &str = "wal.log";
const DATA_DIR: &str = "data";

/// The database façade: a WAL and a storage engine composed behind
/// `put`/`get`/`delete`/`iterate` plus the batch lifecycle.
///
/// Mutations queue in a pending batch and are logged to the WAL as they
/// arrive; `commit` applies the batch to storage in submission order and
/// flushes the WAL. With auto-commit on, crossing the batch threshold
/// commits implicitly. Construction replays every surviving WAL entry
/// into the storage engine, so committed state and logged-but-unapplied
/// state both come back after a crash.
pub struct Database {
    config: Config,
    lock: FileLock,
    wal: Wal,
    storage: StorageEngine,
    batch: Vec<(Operation, String, Option<Document>)>,
    auto_commit: bool,
    /// True while `begin_batch` holds the exclusive lock.
    batch_held: bool,
}

impl Database {
    /// Open a database with default configuration
    pub fn open(dir: &str) -> Result<Self> {
        Self::open_with_config(Config::new(dir))
    }

    /// Open a database with custom configuration
    pub fn open_with_config(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.dir).map_err(|e| Error::io("create db dir", &config.dir, e))?;

        let lock = FileLock::open(config.dir.join(LOCK_FILE))?;
        let wal = Wal::open(config.dir.join(WAL_BASE), config.wal.clone())?;
        let storage = StorageEngine::open(config.dir.join(DATA_DIR), &config)?;

        let auto_commit = config.auto_commit;
        let mut db = Self {
            config,
            lock,
            wal,
            storage,
            batch: Vec::new(),
            auto_commit,
            batch_held: false,
        };
        db.recover()?;
        Ok(db)
    }

    /// Queues a PUT and logs it. May trigger an auto-commit.
    pub fn put(&mut self, id: &str, document: Document) -> Result<()> {
        validate_id(id)?;
        self.batch
            .push((Operation::Put, id.to_string(), Some(document.clone())));
        self.wal.log(Operation::Put, id, Some(document))?;
        self.maybe_commit()
    }

    /// Read-through lookup: pending batch first (newest operation for
    /// the id wins), then cache, bloom filter, index, data file.
    pub fn get(&mut self, id: &str) -> Result<Option<Document>> {
        validate_id(id)?;
        for (operation, batch_id, data) in self.batch.iter().rev() {
            if batch_id == id {
                return Ok(match operation {
                    Operation::Put => data.clone(),
                    Operation::Delete => None,
                });
            }
        }
        // Inside an open batch this descriptor already holds the
        // exclusive lock; taking it shared would downgrade it.
        let _guard = if self.batch_held {
            None
        } else {
            Some(self.lock.shared()?)
        };
        self.storage.get(id)
    }

    /// Queues a DELETE and logs it. May trigger an auto-commit.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        validate_id(id)?;
        self.batch.push((Operation::Delete, id.to_string(), None));
        self.wal.log(Operation::Delete, id, None)?;
        self.maybe_commit()
    }

    /// Streams live documents in first-write order.
    pub fn iterate(&self) -> Result<Iterate<'_>> {
        self.storage.iterate()
    }

    /// Applies the pending batch to storage in submission order, then
    /// flushes the WAL. The batch is cleared even when a storage
    /// operation fails, so the database stays usable after the error.
    pub fn commit(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let _guard = if self.batch_held {
            None
        } else {
            Some(self.lock.exclusive()?)
        };

        let ops = std::mem::take(&mut self.batch);
        let count = ops.len();
        for (operation, id, data) in ops {
            match operation {
                Operation::Put => {
                    let Some(document) = data else {
                        warn!(%id, "dropping put without a document");
                        continue;
                    };
                    self.storage.write(&id, document)?;
                }
                Operation::Delete => self.storage.delete(&id)?,
            }
        }
        self.wal.flush()?;
        info!(operations = count, "committed batch");
        Ok(())
    }

    /// Takes the exclusive lock and suspends auto-commit until
    /// `end_batch`, giving the batch serialized access to storage.
    pub fn begin_batch(&mut self) -> Result<()> {
        if self.batch_held {
            return Ok(());
        }
        self.lock.acquire_exclusive()?;
        self.batch_held = true;
        self.auto_commit = false;
        Ok(())
    }

    /// Commits, restores auto-commit, and releases the lock on every
    /// path. A commit error propagates after the lock is released.
    pub fn end_batch(&mut self) -> Result<()> {
        let result = self.commit();
        self.auto_commit = self.config.auto_commit;
        if self.batch_held {
            self.batch_held = false;
            let released = self.lock.release();
            return result.and(released);
        }
        result
    }

    /// Number of operations waiting for the next commit.
    pub fn pending_len(&self) -> usize {
        self.batch.len()
    }

    /// Commits when either threshold is crossed: the database batch or
    /// the WAL's pending list. `Wal::log` does no disk I/O of its own,
    /// so WAL durability always arrives together with the applied batch.
    fn maybe_commit(&mut self) -> Result<()> {
        if !self.auto_commit {
            return Ok(());
        }
        if self.batch.len() >= self.config.max_batch_size
            || self.wal.pending_len() >= self.config.wal.max_batch_size
        {
            return self.commit();
        }
        Ok(())
    }

    /// Replays every surviving WAL entry into the storage engine. Replay
    /// is idempotent: a re-applied PUT lands at a new offset, a DELETE of
    /// an absent id is a no-op.
    fn recover(&mut self) -> Result<()> {
        let _guard = self.lock.exclusive()?;

        let replay = self.wal.replay().map_err(wrap_recovery)?;
        let mut applied = 0usize;
        for entry in replay {
            let entry = entry.map_err(wrap_recovery)?;
            match entry.operation {
                Operation::Put => {
                    let Some(document) = entry.data else {
                        warn!(id = %entry.id, "skipping logged put without a document");
                        continue;
                    };
                    self.storage
                        .write(&entry.id, document)
                        .map_err(wrap_recovery)?;
                }
                Operation::Delete => self.storage.delete(&entry.id).map_err(wrap_recovery)?,
            }
            applied += 1;
        }
        if applied > 0 {
            info!(applied, "replayed wal into storage");
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Logged-but-uncommitted entries reach disk so replay can apply
        // them on the next open.
        let _ = self.wal.flush();
        if self.batch_held {
            self.batch_held = false;
            let _ = self.lock.release();
        }
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return errinput!("document id cannot be empty");
    }
    Ok(())
}

fn wrap_recovery(err: Error) -> Error {
    Error::Recovery(err.to_string())
}

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::bloom::BloomFilter;
use crate::cache::DocumentCache;
use crate::config::Config;
use crate::document::{Document, Record};
use crate::error::{Error, Result};
use crate::flock::{FileLock, LockGuard};

const DATA_FILE: &str = "data.db";
const INDEX_FILE: &str = "index.bin";
const ACCESS_FILE: &str = "access.log";
const LOCK_FILE: &str = "storage.lock";

/// Bloom sizing for the admission filter rebuilt at startup.
const BLOOM_EXPECTED_ITEMS: usize = 1_000_000;
const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Durable record store: an append-only data file addressed through an
/// in-memory primary index, with a tombstone set for deletes, a bloom
/// filter in front of point lookups, and a bounded hot-document cache.
///
/// Deleted and superseded record bytes stay in the data file; only the
/// index moves.
pub struct StorageEngine {
    data_path: PathBuf,
    index_path: PathBuf,
    access_path: PathBuf,
    lock: FileLock,

    /// id -> byte offset of the latest record in the data file.
    index: HashMap<String, u64>,
    tombstones: HashSet<String>,
    bloom: BloomFilter,
    cache: DocumentCache,

    read_block_size: usize,
    snapshot_interval: usize,
    /// Index mutations since the last snapshot of index.bin.
    mutations: usize,
}

impl StorageEngine {
    /// Opens (creating as needed) the store under `dir`: loads the index
    /// snapshot, rebuilds the bloom filter from it, and warms the cache
    /// from the access trace.
    pub fn open(dir: impl Into<PathBuf>, config: &Config) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io("create data dir", &dir, e))?;

        let lock = FileLock::open(dir.join(LOCK_FILE))?;
        let data_path = dir.join(DATA_FILE);
        let index_path = dir.join(INDEX_FILE);
        let access_path = dir.join(ACCESS_FILE);

        let index = load_index(&index_path)?;

        // The data file must exist before the first read.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .map_err(|e| Error::io("create data file", &data_path, e))?;

        let mut bloom = BloomFilter::new(BLOOM_EXPECTED_ITEMS, BLOOM_FALSE_POSITIVE_RATE);
        for id in index.keys() {
            bloom.add(id.as_bytes());
        }

        let mut engine = Self {
            data_path,
            index_path,
            access_path,
            lock,
            index,
            tombstones: HashSet::new(),
            bloom,
            cache: DocumentCache::new(config.max_cache_size),
            read_block_size: config.read_block_size,
            snapshot_interval: config.index_snapshot_interval,
            mutations: 0,
        };
        engine.warm_cache(config.max_cache_size)?;

        info!(
            documents = engine.index.len(),
            cached = engine.cache.len(),
            "opened storage engine"
        );
        Ok(engine)
    }

    /// Appends a record for the document and repoints the index at it.
    pub fn write(&mut self, id: &str, document: Document) -> Result<()> {
        let _guard = self.lock.exclusive()?;

        let record = Record::new(id, document)?;
        let encoded = record.encode()?;

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.data_path)
            .map_err(|e| Error::io("open data file", &self.data_path, e))?;
        let pos = file
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::io("seek data file", &self.data_path, e))?;
        file.write_all(&encoded)
            .map_err(|e| Error::io("append record", &self.data_path, e))?;

        self.tombstones.remove(id);
        self.index.insert(id.to_string(), pos);
        self.bloom.add(id.as_bytes());
        self.cache.insert(id.to_string(), record.data);

        self.mutations += 1;
        if self.mutations >= self.snapshot_interval {
            self.persist_index()?;
            self.mutations = 0;
        }
        Ok(())
    }

    /// Point lookup: cache, then bloom filter, then index, then one disk
    /// read at the recorded offset.
    pub fn get(&mut self, id: &str) -> Result<Option<Document>> {
        let _guard = self.lock.shared()?;

        if let Some(document) = self.cache.get(id) {
            return Ok(Some(document.clone()));
        }
        if !self.bloom.might_contain(id.as_bytes()) {
            return Ok(None);
        }
        let Some(&offset) = self.index.get(id) else {
            return Ok(None);
        };

        let Some(record) = self.read_record_at(offset)? else {
            return Ok(None);
        };

        self.log_access(id)?;
        self.cache.insert(id.to_string(), record.data.clone());
        Ok(Some(record.data))
    }

    /// Marks the id deleted. No data-file bytes are reclaimed; the bloom
    /// filter keeps its bits.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        let _guard = self.lock.exclusive()?;

        self.tombstones.insert(id.to_string());
        self.cache.remove(id);
        self.index.remove(id);

        self.persist_index()?;
        self.mutations = 0;
        Ok(())
    }

    /// Streams live `(id, document)` pairs in file order. Tombstoned ids
    /// and records superseded per the live index are skipped, so each id
    /// appears at most once. The cursor holds the shared lock until it is
    /// dropped, so writers stay blocked for the whole walk.
    pub fn iterate(&self) -> Result<Iterate<'_>> {
        let guard = self.lock.shared()?;
        let file = File::open(&self.data_path)
            .map_err(|e| Error::io("open data file", &self.data_path, e))?;
        Ok(Iterate {
            _guard: guard,
            reader: BufReader::new(file),
            offset: 0,
            path: &self.data_path,
            index: &self.index,
            tombstones: &self.tombstones,
        })
    }

    /// Number of live documents.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Cache (hits, misses).
    pub fn cache_stats(&self) -> (usize, usize) {
        self.cache.stats()
    }

    /// Reads the record starting at `offset`, growing the read block
    /// until its terminating newline is seen. Returns None when the line
    /// does not decode.
    fn read_record_at(&self, offset: u64) -> Result<Option<Record>> {
        let mut file = File::open(&self.data_path)
            .map_err(|e| Error::io("open data file", &self.data_path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io("seek data file", &self.data_path, e))?;

        let mut buf = Vec::with_capacity(self.read_block_size);
        let mut block = vec![0u8; self.read_block_size];
        let line = loop {
            let read = file
                .read(&mut block)
                .map_err(|e| Error::io("read record", &self.data_path, e))?;
            buf.extend_from_slice(&block[..read]);
            if let Some(end) = buf.iter().position(|&b| b == b'\n') {
                break &buf[..end];
            }
            if read == 0 {
                break buf.as_slice();
            }
        };

        let Ok(line) = std::str::from_utf8(line) else {
            warn!(offset, "record at offset is not utf-8");
            return Ok(None);
        };
        match Record::decode(line) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(offset, %err, "skipping undecodable record");
                Ok(None)
            }
        }
    }

    /// Appends the id to the access trace used for cache warmup.
    fn log_access(&self, id: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.access_path)
            .map_err(|e| Error::io("open access log", &self.access_path, e))?;
        writeln!(file, "{id}").map_err(|e| Error::io("append access log", &self.access_path, e))
    }

    /// Writes the index snapshot to a sibling temp file and renames it
    /// into place.
    fn persist_index(&self) -> Result<()> {
        let tmp = self.index_path.with_extension("bin.tmp");
        let file =
            File::create(&tmp).map_err(|e| Error::io("create index snapshot", &tmp, e))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &self.index)?;
        writer
            .flush()
            .map_err(|e| Error::io("flush index snapshot", &tmp, e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::io("sync index snapshot", &tmp, e))?;
        std::fs::rename(&tmp, &self.index_path)
            .map_err(|e| Error::io("replace index snapshot", &self.index_path, e))?;
        debug!(entries = self.index.len(), "persisted index snapshot");
        Ok(())
    }

    /// Resolves the most recent access-trace ids into cache entries.
    fn warm_cache(&mut self, limit: usize) -> Result<()> {
        if limit == 0 || !self.access_path.exists() {
            return Ok(());
        }
        let file = File::open(&self.access_path)
            .map_err(|e| Error::io("open access log", &self.access_path, e))?;
        let ids: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()
            .map_err(|e| Error::io("read access log", &self.access_path, e))?;

        let start = ids.len().saturating_sub(limit);
        for id in &ids[start..] {
            let Some(&offset) = self.index.get(id) else {
                continue;
            };
            if let Some(record) = self.read_record_at(offset)? {
                self.cache.insert(id.clone(), record.data);
            }
        }
        Ok(())
    }
}

/// Lazy cursor over the data file, earliest write first. Holds the
/// engine's shared lock for its lifetime; dropping the cursor releases
/// it.
pub struct Iterate<'a> {
    _guard: LockGuard<'a>,
    reader: BufReader<File>,
    offset: u64,
    path: &'a Path,
    index: &'a HashMap<String, u64>,
    tombstones: &'a HashSet<String>,
}

impl Iterator for Iterate<'_> {
    type Item = Result<(String, Document)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let pos = self.offset;
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(n) => self.offset += n as u64,
                Err(e) => return Some(Err(Error::io("read data file", self.path, e))),
            }

            let record = match Record::decode(line.trim_end_matches('\n')) {
                Ok(record) => record,
                Err(err) => {
                    warn!(offset = pos, %err, "skipping undecodable record");
                    continue;
                }
            };
            if self.tombstones.contains(&record.id) {
                continue;
            }
            // Superseded records point elsewhere in the index.
            if self.index.get(&record.id) != Some(&pos) {
                continue;
            }
            return Some(Ok((record.id, record.data)));
        }
    }
}

fn load_index(path: &Path) -> Result<HashMap<String, u64>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let file = File::open(path).map_err(|e| Error::io("open index snapshot", path, e))?;
    Ok(bincode::deserialize_from(BufReader::new(file))?)
}

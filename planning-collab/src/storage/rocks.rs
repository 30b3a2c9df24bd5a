//! RocksDB-backed planning store.
//!
//! Column families:
//! - `plannings`: latest saved planning (JSON, LZ4 compressed)
//! - `operations`: operation log, keyed by `planning_id:append_index`
//! - `conflicts`: conflict records, keyed by `planning_id:conflict_id`
//! - `metadata`: per-planning counters (bincode) and the op-id to append-index map
//!
//! Documents and operations go through JSON because their enums are
//! internally tagged, which bincode cannot decode. Metadata is a flat struct
//! and stays in bincode.
//!
//! Writes that read-then-write (version check, op dedup) take `write_lock`,
//! so the store is safe to share between blocking tasks.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use super::{PlanningStore, StoreError, StoredPlanning};
use crate::conflict::PlanningConflict;
use crate::model::{now_millis, Planning, PlanningId};
use crate::operation::Operation;

const CF_PLANNINGS: &str = "plannings";
const CF_OPERATIONS: &str = "operations";
const CF_CONFLICTS: &str = "conflicts";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_PLANNINGS, CF_OPERATIONS, CF_CONFLICTS, CF_METADATA];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("planning_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches in a caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-planning bookkeeping stored next to the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningMetadata {
    pub planning_id: PlanningId,
    /// Version of the stored document
    pub version: u64,
    /// Operations appended so far; also the next append index
    pub operation_count: u64,
    /// Compressed size of the stored document in bytes
    pub compressed_size: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl PlanningMetadata {
    fn new(planning_id: PlanningId, version: u64) -> Self {
        let now = now_millis();
        Self { planning_id, version, operation_count: 0, compressed_size: 0, created_at: now, updated_at: now }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened planning store at {}", config.path.display());

        Ok(Self { db, config, write_lock: Mutex::new(()) })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4-compressed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_PLANNINGS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS | CF_CONFLICTS => {
                // Many small writes, scanned by planning id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn metadata(&self, id: PlanningId) -> Result<PlanningMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => PlanningMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Ids of every stored planning.
    pub fn list_plannings(&self) -> Result<Vec<PlanningId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            // 32-byte keys belong to the op-id index
            if key.len() == 16 {
                let bytes: [u8; 16] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Deserialization("Invalid UUID key".into()))?;
                ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(ids)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// `planning_id` followed by a 16-byte id or an 8-byte big-endian index.
    fn composite_key(planning_id: PlanningId, suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(16 + suffix.len());
        key.extend_from_slice(planning_id.as_bytes());
        key.extend_from_slice(suffix);
        key
    }

    /// Decode every value under `planning_id` in a prefix-keyed column family.
    fn scan_prefix<T: DeserializeOwned>(&self, cf_name: &str, planning_id: PlanningId) -> Result<Vec<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = planning_id.as_bytes();
        let mut values = Vec::new();
        let iter = self.db.iterator_cf(cf, IteratorMode::From(prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            values.push(decode_record(&value)?);
        }
        Ok(values)
    }
}

impl PlanningStore for RocksStore {
    fn create_planning(&self, planning: &Planning) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.metadata(planning.id).is_ok() {
            return Err(StoreError::AlreadyExists(planning.id));
        }

        let record = encode_record(planning)?;
        let mut meta = PlanningMetadata::new(planning.id, planning.version);
        meta.compressed_size = record.len() as u64;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_PLANNINGS)?, planning.id.as_bytes(), &record);
        batch.put_cf(self.cf(CF_METADATA)?, planning.id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!("Created planning {} ({} bytes)", planning.id, record.len());
        Ok(())
    }

    fn get_planning(&self, id: PlanningId) -> Result<StoredPlanning, StoreError> {
        let cf = self.cf(CF_PLANNINGS)?;
        let planning = match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode_record(&bytes)?,
            None => return Err(StoreError::NotFound(id)),
        };
        let operations = self.scan_prefix(CF_OPERATIONS, id)?;
        Ok(StoredPlanning { planning, operations })
    }

    fn save_planning(&self, id: PlanningId, planning: &Planning, expected_version: u64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut meta = self.metadata(id)?;
        if meta.version != expected_version {
            return Err(StoreError::VersionConflict { expected: expected_version, actual: meta.version });
        }

        let record = encode_record(planning)?;
        meta.version = planning.version;
        meta.compressed_size = record.len() as u64;
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_PLANNINGS)?, id.as_bytes(), &record);
        batch.put_cf(self.cf(CF_METADATA)?, id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn append_operation(&self, id: PlanningId, operation: &Operation) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let index_key = Self::composite_key(id, operation.id.as_bytes());
        if let Some(index) = self.db.get_cf(cf_meta, &index_key)? {
            let key = Self::composite_key(id, &index);
            if let Some(bytes) = self.db.get_cf(cf_ops, &key)? {
                let logged: Operation = decode_record(&bytes)?;
                if logged.seq != operation.seq {
                    self.db.put_cf_opt(cf_ops, &key, encode_record(operation)?, &self.write_options())?;
                }
            }
            return Ok(false);
        }

        let mut meta = self.metadata(id)?;
        let index = meta.operation_count.to_be_bytes();
        let key = Self::composite_key(id, &index);
        meta.operation_count += 1;
        meta.updated_at = now_millis();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_ops, &key, encode_record(operation)?);
        batch.put_cf(cf_meta, &index_key, index);
        batch.put_cf(cf_meta, id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(true)
    }

    fn record_conflict(&self, conflict: &PlanningConflict) -> Result<(), StoreError> {
        self.metadata(conflict.planning_id)?;
        let key = Self::composite_key(conflict.planning_id, conflict.id.as_bytes());
        self.db
            .put_cf_opt(self.cf(CF_CONFLICTS)?, &key, encode_record(conflict)?, &self.write_options())?;
        Ok(())
    }

    fn list_conflicts(&self, id: PlanningId) -> Result<Vec<PlanningConflict>, StoreError> {
        self.metadata(id)?;
        let mut conflicts: Vec<PlanningConflict> = self.scan_prefix(CF_CONFLICTS, id)?;
        conflicts.sort_by_key(|c| (c.detected_at, c.id));
        Ok(conflicts)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

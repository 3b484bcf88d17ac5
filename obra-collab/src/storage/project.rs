//! RocksDB-backed persistent project store.
//!
//! Column families:
//! - `shapes` — Shape entities (LZ4 compressed bincode)
//! - `layers` — Layer entities
//! - `boards` — Board state entities
//! - `meta`   — Per-project metadata (entity count, timestamps)
//!
//! Entity keys are `<project_id:16><entity_id:16>` with a 16-byte
//! prefix extractor, so loading a project is one prefix scan per
//! column family. The store is write-through from the in-memory entity
//! store; it is the source of truth only when a room reopens.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use obra_core::{now_ms, Entity};

/// Column family names.
const CF_SHAPES: &str = "shapes";
const CF_LAYERS: &str = "layers";
const CF_BOARDS: &str = "boards";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_SHAPES, CF_LAYERS, CF_BOARDS, CF_META];

/// Entity column families, scanned in order on project load.
const ENTITY_CFS: &[&str] = &[CF_BOARDS, CF_LAYERS, CF_SHAPES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("obra_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
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

/// Per-project metadata stored alongside entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub project_id: Uuid,
    /// Live entity count across all entity column families.
    pub entity_count: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ProjectMetadata {
    fn new(project_id: Uuid) -> Self {
        let now = now_ms();
        Self {
            project_id,
            entity_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Project not found
    NotFound(Uuid),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StorageError::NotFound(id) => write!(f, "Project not found: {id}"),
            StorageError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StorageError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StorageError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed project store.
///
/// Provides durable storage for canvas entities with:
/// - LZ4-compressed entity records
/// - Bloom filters for fast key lookup
/// - Block cache for hot project access
/// - Atomic write batches for entity + metadata consistency
pub struct ProjectStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl ProjectStore {
    /// Open the project store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(64 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // LZ4: fast decompression matters more than ratio here
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SHAPES => {
                // Many small records, prefix-scanned by project_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_LAYERS | CF_BOARDS => {
                opts.set_max_write_buffer_number(2);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_META => {
                // Small values, frequent reads
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Entities ─────────────────────────────────────────────────────

    /// Write one entity (insert or overwrite), updating project metadata
    /// in the same atomic batch.
    pub fn put_entity(&self, project_id: Uuid, entity: &Entity) -> Result<(), StorageError> {
        let cf_name = Self::cf_for(entity);
        let cf = self.cf(cf_name)?;
        let cf_meta = self.cf(CF_META)?;

        let key = Self::entity_key(project_id, entity.id());
        let is_new = self.db.get_cf(&cf, &key)?.is_none();

        let encoded = bincode::serde::encode_to_vec(entity, bincode::config::standard())
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_metadata(project_id)
            .unwrap_or_else(|_| ProjectMetadata::new(project_id));
        if is_new {
            meta.entity_count += 1;
        }
        meta.updated_at = now_ms();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, &key, &compressed);
        batch.put_cf(&cf_meta, project_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Remove one entity, updating project metadata atomically.
    pub fn delete_entity(&self, project_id: Uuid, entity: &Entity) -> Result<(), StorageError> {
        let cf = self.cf(Self::cf_for(entity))?;
        let cf_meta = self.cf(CF_META)?;

        let key = Self::entity_key(project_id, entity.id());
        if self.db.get_cf(&cf, &key)?.is_none() {
            return Ok(());
        }

        let mut meta = self
            .load_metadata(project_id)
            .unwrap_or_else(|_| ProjectMetadata::new(project_id));
        meta.entity_count = meta.entity_count.saturating_sub(1);
        meta.updated_at = now_ms();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, &key);
        batch.put_cf(&cf_meta, project_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Load every entity of a project (boards, then layers, then shapes).
    ///
    /// An unknown project yields an empty vector, not an error; a fresh
    /// room has nothing persisted yet.
    pub fn load_project(&self, project_id: Uuid) -> Result<Vec<Entity>, StorageError> {
        let mut entities = Vec::new();
        for cf_name in ENTITY_CFS {
            let cf = self.cf(cf_name)?;
            let prefix = project_id.as_bytes();
            let iter = self
                .db
                .iterator_cf(&cf, IteratorMode::From(prefix, rocksdb::Direction::Forward));

            for item in iter {
                let (key, value) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
                if key.len() < 32 || &key[..16] != prefix {
                    break;
                }
                let decompressed = lz4_flex::decompress_size_prepended(&value)
                    .map_err(|e| StorageError::CompressionError(e.to_string()))?;
                let (entity, _) = bincode::serde::decode_from_slice::<Entity, _>(
                    &decompressed,
                    bincode::config::standard(),
                )
                .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Check if a project has persisted state.
    pub fn project_exists(&self, project_id: Uuid) -> Result<bool, StorageError> {
        let cf = self.cf(CF_META)?;
        Ok(self.db.get_cf(&cf, project_id.as_bytes())?.is_some())
    }

    /// Delete a project and all its entities.
    pub fn delete_project(&self, project_id: Uuid) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        let prefix = project_id.as_bytes();

        for cf_name in ENTITY_CFS {
            let cf = self.cf(cf_name)?;
            let iter = self
                .db
                .iterator_cf(&cf, IteratorMode::From(prefix, rocksdb::Direction::Forward));
            for item in iter {
                let (key, _) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
                if key.len() < 32 || &key[..16] != prefix {
                    break;
                }
                batch.delete_cf(&cf, &key);
            }
        }
        batch.delete_cf(&self.cf(CF_META)?, prefix);

        self.db.write(batch)?;
        Ok(())
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Load project metadata.
    pub fn load_metadata(&self, project_id: Uuid) -> Result<ProjectMetadata, StorageError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, project_id.as_bytes())? {
            Some(bytes) => ProjectMetadata::decode(&bytes),
            None => Err(StorageError::NotFound(project_id)),
        }
    }

    /// List all project IDs in the store.
    pub fn list_projects(&self) -> Result<Vec<Uuid>, StorageError> {
        let cf = self.cf(CF_META)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(key.as_ref().try_into().map_err(|_| {
                    StorageError::DeserializationError("Invalid UUID key".into())
                })?);
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf_for(entity: &Entity) -> &'static str {
        match entity {
            Entity::Shape(_) => CF_SHAPES,
            Entity::Layer(_) => CF_LAYERS,
            Entity::Board(_) => CF_BOARDS,
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Entity key: project_id (16 bytes) + entity_id (16 bytes).
    fn entity_key(project_id: Uuid, entity_id: Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(project_id.as_bytes());
        key.extend_from_slice(entity_id.as_bytes());
        key
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use obra_core::{EntityDraft, LayerDraft, Point, Rgba, ShapeDraft, ShapeKind};

    fn open_store() -> (tempfile::TempDir, ProjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn shape() -> Entity {
        EntityDraft::Shape(ShapeDraft {
            kind: ShapeKind::Rect { width: 4.0, height: 2.0 },
            origin: Point::new(1.0, 1.0),
            color: Rgba::default(),
            layer_id: None,
        })
        .into_entity(Uuid::new_v4(), Uuid::new_v4(), 0)
    }

    fn layer(name: &str) -> Entity {
        EntityDraft::Layer(LayerDraft {
            name: name.into(),
            visible: true,
            locked: false,
            order: 0,
        })
        .into_entity(Uuid::new_v4(), Uuid::new_v4(), 0)
    }

    #[test]
    fn test_put_and_load_project() {
        let (_dir, store) = open_store();
        let project = Uuid::new_v4();

        let s = shape();
        let l = layer("Walls");
        store.put_entity(project, &s).unwrap();
        store.put_entity(project, &l).unwrap();

        let loaded = store.load_project(project).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|e| e.id() == s.id()));
        assert!(loaded.iter().any(|e| e.id() == l.id()));
    }

    #[test]
    fn test_load_unknown_project_is_empty() {
        let (_dir, store) = open_store();
        assert!(store.load_project(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_overwrite_keeps_count() {
        let (_dir, store) = open_store();
        let project = Uuid::new_v4();
        let entity = shape();

        store.put_entity(project, &entity).unwrap();
        store.put_entity(project, &entity).unwrap();

        let meta = store.load_metadata(project).unwrap();
        assert_eq!(meta.entity_count, 1);
        assert_eq!(store.load_project(project).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_entity() {
        let (_dir, store) = open_store();
        let project = Uuid::new_v4();
        let entity = shape();

        store.put_entity(project, &entity).unwrap();
        store.delete_entity(project, &entity).unwrap();

        assert!(store.load_project(project).unwrap().is_empty());
        assert_eq!(store.load_metadata(project).unwrap().entity_count, 0);

        // Deleting again is a no-op.
        store.delete_entity(project, &entity).unwrap();
        assert_eq!(store.load_metadata(project).unwrap().entity_count, 0);
    }

    #[test]
    fn test_project_isolation() {
        let (_dir, store) = open_store();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();

        for _ in 0..5 {
            store.put_entity(p1, &shape()).unwrap();
        }
        for _ in 0..3 {
            store.put_entity(p2, &shape()).unwrap();
        }

        assert_eq!(store.load_project(p1).unwrap().len(), 5);
        assert_eq!(store.load_project(p2).unwrap().len(), 3);
    }

    #[test]
    fn test_reopen_preserves_entities() {
        let dir = tempfile::tempdir().unwrap();
        let project = Uuid::new_v4();
        let entity = shape();

        {
            let store = ProjectStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.put_entity(project, &entity).unwrap();
            store.sync().unwrap();
        }

        let store = ProjectStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let loaded = store.load_project(project).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), entity.id());
    }

    #[test]
    fn test_list_projects() {
        let (_dir, store) = open_store();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            store.put_entity(*id, &shape()).unwrap();
        }

        let listed = store.list_projects().unwrap();
        assert_eq!(listed.len(), 3);
        for id in &ids {
            assert!(listed.contains(id));
        }
    }

    #[test]
    fn test_delete_project() {
        let (_dir, store) = open_store();
        let project = Uuid::new_v4();
        store.put_entity(project, &shape()).unwrap();
        store.put_entity(project, &layer("Walls")).unwrap();

        assert!(store.project_exists(project).unwrap());
        store.delete_project(project).unwrap();
        assert!(!store.project_exists(project).unwrap());
        assert!(store.load_project(project).unwrap().is_empty());
    }

    #[test]
    fn test_metadata_tracks_updates() {
        let (_dir, store) = open_store();
        let project = Uuid::new_v4();
        store.put_entity(project, &shape()).unwrap();

        let meta = store.load_metadata(project).unwrap();
        assert_eq!(meta.project_id, project);
        assert_eq!(meta.entity_count, 1);
        assert!(meta.created_at > 0);
        assert!(meta.updated_at >= meta.created_at);
    }
}

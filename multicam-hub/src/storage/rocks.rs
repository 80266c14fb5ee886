//! RocksDB-backed preset store.
//!
//! Column families:
//! - `presets`: focus position per `(camera, slot)` (bincode)
//! - `buttons`: panel button fields per `(camera, slot)` (JSON)
//!
//! Key format: `<camera:4 bytes big-endian><slot:1 byte>`, so a forward
//! iteration yields records ordered by camera, then slot.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, Options,
    SingleThreaded, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{ButtonKey, ButtonValue, PresetRecord, PresetStore, StoreError};
use crate::device::{FocusValue, PresetSlot};

const CF_PRESETS: &str = "presets";
const CF_BUTTONS: &str = "buttons";

const COLUMN_FAMILIES: &[&str] = &[CF_PRESETS, CF_BUTTONS];

const KEY_LEN: usize = 5;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: true; presets are written rarely)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("multicam_data"),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 64,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small cache, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            sync_writes: false,
            max_open_files: 16,
        }
    }
}

/// On-disk preset value.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPreset {
    focus: FocusValue,
    /// Seconds since epoch
    updated_at: u64,
}

impl StoredPreset {
    fn new(focus: FocusValue) -> Self {
        let updated_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self { focus, updated_at }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (preset, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(preset)
    }
}

/// RocksDB-backed preset store.
pub struct RocksPresetStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksPresetStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened preset store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        // Tiny values, point lookups
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn put(&self, cf_name: &str, key: [u8; KEY_LEN], value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, key, value, &write_opts)?;
        Ok(())
    }

    /// Every `(key, value)` pair of a column family, in key order.
    fn scan(&self, cf_name: &str) -> Result<Vec<((usize, PresetSlot), Box<[u8]>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            entries.push((decode_key(&key)?, value));
        }
        Ok(entries)
    }
}

fn encode_key(camera: usize, slot: PresetSlot) -> Result<[u8; KEY_LEN], StoreError> {
    let camera = u32::try_from(camera).map_err(|_| StoreError::CameraOutOfRange(camera))?;
    let mut key = [0u8; KEY_LEN];
    key[..4].copy_from_slice(&camera.to_be_bytes());
    key[4] = slot;
    Ok(key)
}

fn decode_key(key: &[u8]) -> Result<(usize, PresetSlot), StoreError> {
    if key.len() != KEY_LEN {
        return Err(StoreError::InvalidKey(key.len()));
    }
    let camera = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
    Ok((camera as usize, key[4]))
}

impl PresetStore for RocksPresetStore {
    fn get(&self, camera: usize, slot: PresetSlot) -> Result<Option<FocusValue>, StoreError> {
        let cf = self.cf(CF_PRESETS)?;
        match self.db.get_cf(cf, encode_key(camera, slot)?)? {
            Some(bytes) => Ok(Some(StoredPreset::decode(&bytes)?.focus)),
            None => Ok(None),
        }
    }

    fn set(&self, record: PresetRecord) -> Result<(), StoreError> {
        let key = encode_key(record.camera, record.slot)?;
        self.put(CF_PRESETS, key, &StoredPreset::new(record.focus).encode()?)
    }

    fn all(&self) -> Result<Vec<PresetRecord>, StoreError> {
        self.scan(CF_PRESETS)?
            .into_iter()
            .map(|((camera, slot), bytes)| {
                let focus = StoredPreset::decode(&bytes)?.focus;
                Ok(PresetRecord { camera, slot, focus })
            })
            .collect()
    }

    fn set_button(&self, key: ButtonKey, value: &ButtonValue) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put(CF_BUTTONS, encode_key(key.camera, key.slot)?, &bytes)
    }

    fn buttons(&self) -> Result<Vec<(ButtonKey, ButtonValue)>, StoreError> {
        self.scan(CF_BUTTONS)?
            .into_iter()
            .map(|((camera, slot), bytes)| {
                let value: ButtonValue = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok((ButtonKey { camera, slot }, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_open_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksPresetStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(store.path().ends_with("db"));
        assert!(store.all().unwrap().is_empty());
        assert!(store.buttons().unwrap().is_empty());
    }

    #[test]
    fn test_preset_set_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksPresetStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        assert_eq!(store.get(0, 5).unwrap(), None);
        store.set(PresetRecord { camera: 0, slot: 5, focus: 0x0C3F }).unwrap();
        assert_eq!(store.get(0, 5).unwrap(), Some(0x0C3F));

        store.set(PresetRecord { camera: 0, slot: 5, focus: 0x1000 }).unwrap();
        assert_eq!(store.get(0, 5).unwrap(), Some(0x1000));
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn test_all_ordered_by_camera_then_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksPresetStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        // Camera 256 would sort before camera 2 with a little-endian key
        for (camera, slot) in [(256, 0), (2, 9), (2, 1), (0, 200)] {
            store.set(PresetRecord { camera, slot, focus: 1 }).unwrap();
        }

        let keys: Vec<_> = store.all().unwrap().iter().map(|r| (r.camera, r.slot)).collect();
        assert_eq!(keys, vec![(0, 200), (2, 1), (2, 9), (256, 0)]);
    }

    #[test]
    fn test_buttons_roundtrip_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksPresetStore::open(StoreConfig::for_testing(dir.path())).unwrap();

        let key = ButtonKey { camera: 1, slot: 3 };
        let value = json!({"name": "Pulpit", "btn_class": "recalled"});
        store.set_button(key, value.as_object().unwrap()).unwrap();

        let buttons = store.buttons().unwrap();
        assert_eq!(buttons, vec![(key, value.as_object().unwrap().clone())]);
    }

    #[test]
    fn test_presets_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));

        {
            let store = RocksPresetStore::open(config.clone()).unwrap();
            store.set(PresetRecord { camera: 3, slot: 7, focus: 4242 }).unwrap();
            store
                .set_button(ButtonKey { camera: 3, slot: 7 }, json!({"name": "Choir"}).as_object().unwrap())
                .unwrap();
            store.sync().unwrap();
        }

        let store = RocksPresetStore::open(config).unwrap();
        assert_eq!(store.get(3, 7).unwrap(), Some(4242));
        assert_eq!(store.buttons().unwrap()[0].1["name"], "Choir");
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(encode_key(0x0102, 9).unwrap(), [0, 0, 1, 2, 9]);
        assert_eq!(decode_key(&[0, 0, 1, 2, 9]).unwrap(), (0x0102, 9));
        assert_eq!(decode_key(&[1, 2]), Err(StoreError::InvalidKey(2)));
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert!(config.sync_writes);
        assert_eq!(config.path, PathBuf::from("multicam_data"));
    }
}

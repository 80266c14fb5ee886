//! Preset persistence.
//!
//! ```text
//! ┌─────────────┐  get / set / all   ┌──────────────────┐
//! │ camera lane │ ─────────────────► │ dyn PresetStore  │
//! └─────────────┘                    └────────┬─────────┘
//!                                             │
//!                      ┌──────────────────────┴───────────────┐
//!                      ▼                                      ▼
//!            ┌───────────────────┐              ┌──────────────────────────┐
//!            │ MemoryPresetStore │              │ RocksPresetStore         │
//!            │ (volatile)        │              │ CF "presets": focus      │
//!            └───────────────────┘              │ CF "buttons": UI state   │
//!                                               └──────────────────────────┘
//! ```
//!
//! Stores are synchronous and never retry; callers decide what a failure means.

pub mod memory;
pub mod rocks;

pub use memory::MemoryPresetStore;
pub use rocks::{RocksPresetStore, StoreConfig};

use crate::device::{FocusValue, PresetSlot};

/// A stored focus position for one camera memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresetRecord {
    pub camera: usize,
    pub slot: PresetSlot,
    pub focus: FocusValue,
}

/// Identifies one panel button: the `(cam, pos)` of an `update_button`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ButtonKey {
    pub camera: usize,
    pub slot: PresetSlot,
}

/// Client-defined button fields.
pub type ButtonValue = serde_json::Map<String, serde_json::Value>;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid key of {0} bytes")]
    InvalidKey(usize),
    #[error("camera index {0} does not fit a store key")]
    CameraOutOfRange(usize),
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Key-value persistence keyed by `(camera, slot)`.
pub trait PresetStore: Send + Sync {
    fn get(&self, camera: usize, slot: PresetSlot) -> Result<Option<FocusValue>, StoreError>;

    /// Create or overwrite the record for its `(camera, slot)`.
    fn set(&self, record: PresetRecord) -> Result<(), StoreError>;

    /// Every record, ordered by `(camera, slot)`.
    fn all(&self) -> Result<Vec<PresetRecord>, StoreError>;

    fn set_button(&self, key: ButtonKey, value: &ButtonValue) -> Result<(), StoreError>;

    /// Every stored button, ordered by key.
    fn buttons(&self) -> Result<Vec<(ButtonKey, ButtonValue)>, StoreError>;
}

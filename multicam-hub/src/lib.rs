//! # multicam-hub: control-room backend for a multi-camera production
//!
//! Keeps any number of control panels in sync while they drive a fixed set of
//! PTZ cameras, and mirrors each camera's on-air tally to every panel.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐   per-camera lane   ┌─────────────┐
//! │ Panel       │ ◄─────────────────► │ HubServer   │ ──────────────────► │ DeviceLink  │ ──► VISCA/UDP
//! │ (browser)   │     JSON envelope   │ + SyncHub   │                     └─────────────┘
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                      ┌─────────────────────┼─────────────────────┐
//!                      ▼                     ▼                     ▼
//!              ┌───────────────┐     ┌───────────────┐     ┌───────────────┐
//!              │ Connection    │     │ PresetStore   │     │ TallyFeed     │ ◄── TCP tally
//!              │ Registry      │     │ (RocksDB)     │     │ (per camera)  │
//!              └───────────────┘     └───────────────┘     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`hub`]: authoritative state, per-camera intent lanes, fan-out
//! - [`registry`]: session set with isolated bounded outbound queues
//! - [`device`]: retrying command queue per camera, VISCA-over-IP transport
//! - [`tally`]: reconnecting tally subscription per camera
//! - [`storage`]: preset and button persistence
//! - [`protocol`]: JSON envelope types
//! - [`server`]: WebSocket accept loop
//! - [`config`]: TOML configuration

pub mod config;
pub mod device;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;
pub mod tally;

// Re-exports for convenience
pub use config::{CameraConfig, ConfigError, HubConfig};
pub use device::{
    CameraCommand, CameraProtocol, CommandReply, DeviceError, DeviceLink, FocusValue, PresetSlot,
    RetryPolicy, UdpVisca,
};
pub use hub::{
    CameraOutcome, CameraSpec, CameraStatus, FleetReport, HubError, HubOptions, Switch, SyncHub,
    TallySink,
};
pub use protocol::{Intent, PositionRef, PresetRow, ProtocolError, ServerMessage, Snapshot};
pub use registry::{BroadcastReport, ConnectionRegistry, Outbound, RegistryStats, SessionId};
pub use server::{HubServer, ServerConfig};
pub use storage::{
    ButtonKey, ButtonValue, MemoryPresetStore, PresetRecord, PresetStore, RocksPresetStore,
    StoreConfig, StoreError,
};
pub use tally::{Backoff, TallyFeed, TallyStatus, TallyUpdate};

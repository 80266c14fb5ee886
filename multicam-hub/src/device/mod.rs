//! Per-camera command channels.
//!
//! ```text
//!  SyncHub lane ──► DeviceLink (FIFO queue, timeout + retry)
//!                        │
//!                        ▼
//!                  CameraProtocol::execute  (one attempt)
//!                        │
//!                        ▼
//!                  UdpVisca ──UDP──► camera
//! ```
//!
//! A [`DeviceLink`] never has more than one command in flight, so a reply
//! can always be matched to the request that caused it.

pub mod link;
pub mod visca;

pub use link::{CameraCommand, CameraProtocol, CommandReply, DeviceError, DeviceLink, RetryPolicy};
pub use visca::UdpVisca;

/// Focus position as reported by the camera (four VISCA nibbles).
pub type FocusValue = u16;

/// Camera position memory slot.
pub type PresetSlot = u8;

//! Registry of known and discovered watches.
//!
//! This module contains:
//! - The per-watch aggregate and its persisted record
//! - Known-watch stores
//! - Device views and capabilities
//! - Connection factories and firmware update checks
//! - The reconciliation actor

pub mod device;
pub mod factory;
pub mod manager;
pub mod store;
pub mod watch;

pub use device::{Capability, DeviceState, WatchDevice};
pub use factory::{BleConnectionFactory, ConnectionFactory, FirmwareUpdateChecker, NoFirmwareUpdates};
pub use manager::{retry_delay, WatchRegistry, CLEANUP_TIMEOUT, MAX_RETRY_DELAY, MIN_RETRY_DELAY};
pub use store::{JsonFileStore, KnownWatchRecord, KnownWatchStore, MemoryStore};
pub use watch::{ActiveConnection, FirmwareUpdate, KnownProperties, Watch};

// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # watch-link
//!
//! Connection core for companion smartwatches: discovers watches over
//! Bluetooth Low Energy, establishes a paired session, negotiates the
//! application protocol and keeps each watch in the state the user asked
//! for.
//!
//! ## Features
//!
//! - **Discovery**: Scan for watches by vendor manufacturer data
//! - **Session Establishment**: GATT server registration, connectivity
//!   tracking, pairing, connection parameters and MTU negotiation
//! - **Packet Framing**: Reassemble length-prefixed packets from a byte stream
//! - **Handshake**: Version exchange, time sync and recovery-mode detection
//! - **Registry**: Persisted known watches, reconciled against connect goals
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use watch_link::ble::{
//!     BleScanner, ConnectivityBondingAgent, GattServerManager, PassthroughTransportFactory,
//! };
//! use watch_link::connection::ServiceProvider;
//! use watch_link::registry::{BleConnectionFactory, JsonFileStore, WatchRegistry};
//! use watch_link::{ConfigHolder, Result};
//!
//! async fn run(services: Arc<dyn ServiceProvider>) -> Result<()> {
//!     let config = ConfigHolder::load("watch-link.json").await?;
//!     let scanner = BleScanner::new().await?;
//!
//!     // btleplug links leave the GATT server role to the watch, so no
//!     // server backend is needed here.
//!     let factory = BleConnectionFactory::new(
//!         scanner.adapter().clone(),
//!         config.subscribe(),
//!         Arc::new(GattServerManager::new()),
//!         Arc::new(ConnectivityBondingAgent::new()),
//!         Arc::new(PassthroughTransportFactory),
//!         services,
//!     );
//!     let registry = WatchRegistry::new(
//!         Arc::new(factory),
//!         Arc::new(JsonFileStore::new("known-watches.json")),
//!         scanner.radio_state(),
//!         config.subscribe(),
//!     );
//!     registry.start().await?;
//!
//!     let mut scans = scanner.subscribe();
//!     scanner.start_scanning().await?;
//!     while let Ok(scan) = scans.recv().await {
//!         registry.add_scan_result(scan);
//!     }
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::{ConfigHolder, LibConfig, SessionConfig};
pub use error::{ConnectionFailureReason, Error, Result};
pub use transport::{Transport, TransportKind};

// Re-export commonly used types from submodules
pub use ble::{RadioState, ScanResult, WatchScanRecord};
pub use connection::{ConnectedState, ConnectingState, ConnectionStateMachine};
pub use protocol::{Endpoint, FirmwareVersion, WatchInfo};
pub use registry::{Capability, DeviceState, WatchDevice, WatchRegistry};

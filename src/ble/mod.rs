//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy side of a watch connection:
//! discovery, the GATT seams, pairing and the session establishment sequence.

pub mod advertising;
pub mod btleplug_client;
pub mod connection_params;
pub mod connectivity;
pub mod gatt;
pub mod gatt_server;
pub mod mtu;
pub mod pairing;
pub mod scanner;
pub mod session;
pub mod uuids;

pub use advertising::{ExtendedScanRecord, WatchScanRecord};
pub use btleplug_client::{BtleplugConnector, BtleplugGattClient};
pub use connectivity::{ConnectivityStatus, ConnectivityWatcher, PairingErrorCode};
pub use gatt::{ConnectedGattClient, GattConnector, GattService, GattWriteType};
pub use gatt_server::{GattServerBackend, GattServerManager};
pub use mtu::Mtu;
pub use pairing::{BondState, BondingAgent, ConnectivityBondingAgent, Pairing};
pub use scanner::{BleScanner, RadioState, ScanResult};
pub use session::{
    BleSession, LiveChannel, PassthroughTransport, PassthroughTransportFactory, RadioPacketSink,
    TransportConnector, WindowedLink, WindowedTransport, WindowedTransportFactory,
    WindowedTransportParams,
};
pub use uuids::*;

//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for watch communication.

use uuid::Uuid;

// Pairing Service (Standard 16-bit, vendor assigned)
/// Pairing service UUID.
pub const PAIRING_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fed9_0000_1000_8000_00805f9b34fb);
/// Connectivity status characteristic UUID (Read, Notify).
pub const CONNECTIVITY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_0001_328e_0fbb_c642_1aa6699bdada);
/// Pairing trigger characteristic UUID (Read and/or Write).
pub const PAIRING_TRIGGER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_0002_328e_0fbb_c642_1aa6699bdada);
/// MTU characteristic UUID (Read, Write, Notify).
pub const MTU_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000_0003_328e_0fbb_c642_1aa6699bdada);
/// Connection parameters characteristic UUID (Write, Notify).
pub const CONNECTION_PARAMETERS_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_0005_328e_0fbb_c642_1aa6699bdada);

// Windowed transport, watch hosts the GATT server
/// Windowed transport service hosted by the watch.
pub const TRANSPORT_CLIENT_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x3000_0003_328e_0fbb_c642_1aa6699bdada);
/// Characteristic the watch notifies transport packets on.
pub const TRANSPORT_CLIENT_READ_UUID: Uuid =
    Uuid::from_u128(0x3000_0004_328e_0fbb_c642_1aa6699bdada);
/// Characteristic the host writes transport packets to.
pub const TRANSPORT_CLIENT_WRITE_UUID: Uuid =
    Uuid::from_u128(0x3000_0006_328e_0fbb_c642_1aa6699bdada);

// Windowed transport, host hosts the GATT server
/// Windowed transport service hosted by the host.
pub const TRANSPORT_SERVER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x1000_0000_328e_0fbb_c642_1aa6699bdada);
/// Data characteristic of the host-side server.
pub const TRANSPORT_SERVER_DATA_UUID: Uuid =
    Uuid::from_u128(0x1000_0001_328e_0fbb_c642_1aa6699bdada);
/// Metadata characteristic of the host-side server.
pub const TRANSPORT_SERVER_META_UUID: Uuid =
    Uuid::from_u128(0x1000_0002_328e_0fbb_c642_1aa6699bdada);

/// Client characteristic configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Response to a read of the server metadata characteristic.
pub const SERVER_META_RESPONSE: [u8; 19] = [
    0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
];

// Manufacturer IDs for advertising data
/// Original vendor Bluetooth manufacturer ID.
pub const PEBBLE_MANUFACTURER_ID: u16 = 0x0154;
/// Current vendor Bluetooth manufacturer ID.
pub const CORE_MANUFACTURER_ID: u16 = 0x0EEA;

/// Check if a manufacturer ID belongs to a supported watch vendor.
pub fn is_watch_manufacturer(id: u16) -> bool {
    id == PEBBLE_MANUFACTURER_ID || id == CORE_MANUFACTURER_ID
}

/// Services a connected watch must expose.
pub fn required_services() -> [Uuid; 1] {
    [PAIRING_SERVICE_UUID]
}

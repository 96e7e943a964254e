//! Transport identity.
//!
//! A [`Transport`] names one addressable link to a watch and is the key of
//! every per-watch map in the crate.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// The kind of link a transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Bluetooth Low Energy.
    BluetoothLe,
    /// Bluetooth Classic (RFCOMM).
    BluetoothClassic,
    /// TCP socket, used by emulators.
    Socket,
}

impl TransportKind {
    /// Name used in persisted records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BluetoothLe => "BluetoothLe",
            Self::BluetoothClassic => "BluetoothClassic",
            Self::Socket => "Socket",
        }
    }

    /// Parse a persisted name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "BluetoothLe" => Some(Self::BluetoothLe),
            "BluetoothClassic" => Some(Self::BluetoothClassic),
            "Socket" => Some(Self::Socket),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An addressable link to one watch.
///
/// Equality and hashing ignore the display name, so a watch that renames
/// itself keeps its map entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transport {
    kind: TransportKind,
    identifier: String,
    name: String,
}

impl Transport {
    /// A BLE transport identified by its radio address.
    pub fn ble(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(TransportKind::BluetoothLe, address, name)
    }

    /// A Bluetooth Classic transport identified by its radio address.
    pub fn bt_classic(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(TransportKind::BluetoothClassic, address, name)
    }

    /// A socket transport identified by `host:port`.
    pub fn socket(host_port: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(TransportKind::Socket, host_port, name)
    }

    /// Build a transport of any kind.
    pub fn new(kind: TransportKind, identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            name: name.into(),
        }
    }

    /// Link kind.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Platform identifier (radio address or `host:port`).
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this is a BLE transport.
    pub fn is_ble(&self) -> bool {
        self.kind == TransportKind::BluetoothLe
    }
}

impl PartialEq for Transport {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.identifier == other.identifier
    }
}

impl Eq for Transport {}

impl Hash for Transport {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.identifier.hash(state);
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} {})", self.name, self.kind, self.identifier)
    }
}

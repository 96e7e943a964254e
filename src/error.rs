//! Error types for the watch-link crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// I/O error on a byte channel or the known-watch store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to encode or decode persisted JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The requested watch was not found.
    #[error("Watch not found: {identifier}")]
    WatchNotFound {
        /// The transport identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a connection but the watch is not connected.
    #[error("Watch not connected")]
    NotConnected,

    /// A connection attempt is already active for this transport.
    #[error("Connection attempt already active for {transport}")]
    AlreadyConnecting {
        /// The transport that already has a live connection scope.
        transport: String,
    },

    /// The connection to the watch was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// The live byte channel was closed.
    #[error("Byte channel closed")]
    StreamClosed,

    /// Invalid data was received from the watch.
    #[error("Invalid data received: {context}")]
    InvalidData {
        /// Description of what was invalid about the data.
        context: String,
    },

    /// An operation did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// The requested operation is not supported.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a single connection attempt ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionFailureReason {
    /// Could not register the transport with the local GATT server.
    RegisterGattServer,
    /// The physical link could not be opened.
    LinkFailed,
    /// The platform could not resolve the device address.
    DeviceNotFound,
    /// Service discovery did not find the pairing service.
    ServicesMissing,
    /// Requesting a larger MTU failed.
    MtuGattError,
    /// Subscribing to the connectivity characteristic failed.
    SubscribeConnectivity,
    /// No connectivity status value arrived in time.
    ConnectionStatus,
    /// Reading the pairing trigger characteristic failed.
    ReadPairingTrigger,
    /// The platform refused to start bonding.
    CreateBondFailed,
    /// The bond did not complete in time.
    PairingTimedOut,
    /// The windowed transport or the core services could not be started.
    ServiceInit,
    /// The post-link handshake failed or timed out.
    NegotiationFailed,
    /// The link dropped during the attempt.
    LinkLost,
}

impl ConnectionFailureReason {
    /// Pairing failures usually need the user to confirm on the watch.
    pub fn is_pairing_failure(&self) -> bool {
        matches!(
            self,
            Self::ReadPairingTrigger | Self::CreateBondFailed | Self::PairingTimedOut
        )
    }

    /// Whether the registry should keep the connect goal and retry later.
    ///
    /// No failure reason is fatal to the goal.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RegisterGattServer => "register gatt server failed",
            Self::LinkFailed => "link failed",
            Self::DeviceNotFound => "device not found",
            Self::ServicesMissing => "services missing",
            Self::MtuGattError => "mtu request failed",
            Self::SubscribeConnectivity => "connectivity subscribe failed",
            Self::ConnectionStatus => "no connectivity status",
            Self::ReadPairingTrigger => "pairing trigger read failed",
            Self::CreateBondFailed => "create bond failed",
            Self::PairingTimedOut => "pairing timed out",
            Self::ServiceInit => "service init failed",
            Self::NegotiationFailed => "negotiation failed",
            Self::LinkLost => "link lost",
        };
        write!(f, "{}", name)
    }
}

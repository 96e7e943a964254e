//! Connectivity status characteristic.
//!
//! The watch reports link, pairing and bonding state through a 4-byte value:
//! - Byte 0: flags (bit 0 connected, 1 paired, 2 encrypted,
//!   3 has bonded gateway, 4 supports pinning without slave security,
//!   5 remote attempted stale pairing)
//! - Byte 3: pairing error code

use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::ble::gatt::{ConnectedGattClient, NotificationStream};
use crate::ble::uuids::{CONNECTIVITY_CHARACTERISTIC_UUID, PAIRING_SERVICE_UUID};
use crate::connection::scope::ConnectionScope;
use crate::error::{Error, Result};

/// How long to wait for the first status value.
pub const CONNECTIVITY_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Delays before each re-subscription after notifications fail.
const COLLECT_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Pairing error reported by the watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PairingErrorCode {
    /// No error.
    #[default]
    NoError,
    /// Passkey entry failed.
    PasskeyEntryFailed,
    /// OOB data not available.
    OobNotAvailable,
    /// Authentication requirements not met.
    AuthenticationRequirements,
    /// Confirm value failed.
    ConfirmValueFailed,
    /// Pairing not supported.
    PairingNotSupported,
    /// Encryption key size.
    EncryptionKeySize,
    /// Command not supported.
    CommandNotSupported,
    /// Unspecified reason.
    UnspecifiedReason,
    /// Repeated attempts.
    RepeatedAttempts,
    /// Invalid parameters.
    InvalidParameters,
    /// DHKey check failed.
    DhKeyCheckFailed,
    /// Numeric comparison failed.
    NumericComparisonFailed,
    /// BR/EDR pairing in progress.
    BrEdrPairingInProgress,
    /// Cross-transport key derivation not allowed.
    CrossTransportKeyDerivationNotAllowed,
    /// Any other value.
    Unknown,
}

impl PairingErrorCode {
    /// Create from raw byte value.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::NoError,
            1 => Self::PasskeyEntryFailed,
            2 => Self::OobNotAvailable,
            3 => Self::AuthenticationRequirements,
            4 => Self::ConfirmValueFailed,
            5 => Self::PairingNotSupported,
            6 => Self::EncryptionKeySize,
            7 => Self::CommandNotSupported,
            8 => Self::UnspecifiedReason,
            9 => Self::RepeatedAttempts,
            10 => Self::InvalidParameters,
            11 => Self::DhKeyCheckFailed,
            12 => Self::NumericComparisonFailed,
            13 => Self::BrEdrPairingInProgress,
            14 => Self::CrossTransportKeyDerivationNotAllowed,
            _ => Self::Unknown,
        }
    }

    /// Convert to raw byte value.
    pub fn to_raw(&self) -> u8 {
        match self {
            Self::NoError => 0,
            Self::PasskeyEntryFailed => 1,
            Self::OobNotAvailable => 2,
            Self::AuthenticationRequirements => 3,
            Self::ConfirmValueFailed => 4,
            Self::PairingNotSupported => 5,
            Self::EncryptionKeySize => 6,
            Self::CommandNotSupported => 7,
            Self::UnspecifiedReason => 8,
            Self::RepeatedAttempts => 9,
            Self::InvalidParameters => 10,
            Self::DhKeyCheckFailed => 11,
            Self::NumericComparisonFailed => 12,
            Self::BrEdrPairingInProgress => 13,
            Self::CrossTransportKeyDerivationNotAllowed => 14,
            Self::Unknown => 255,
        }
    }
}

/// Decoded connectivity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectivityStatus {
    /// The watch considers itself connected.
    pub connected: bool,
    /// The watch has a pairing record for this host.
    pub paired: bool,
    /// The link is encrypted.
    pub encrypted: bool,
    /// The watch has a bonded gateway.
    pub has_bonded_gateway: bool,
    /// The watch can pin the host address without requesting security.
    pub supports_pinning_without_slave_security: bool,
    /// The host tried to use a pairing the watch no longer has.
    pub has_remote_attempted_stale_pairing: bool,
    /// Last pairing error.
    pub pairing_error_code: PairingErrorCode,
}

impl ConnectivityStatus {
    /// Size of the characteristic value.
    pub const SIZE: usize = 4;

    /// Parse the characteristic value.
    pub fn parse(value: &[u8]) -> Result<Self> {
        if value.len() < Self::SIZE {
            return Err(Error::InvalidData {
                context: format!("Connectivity status too short: {} bytes", value.len()),
            });
        }

        let flags = value[0];
        Ok(Self {
            connected: flags & 0x01 != 0,
            paired: flags & 0x02 != 0,
            encrypted: flags & 0x04 != 0,
            has_bonded_gateway: flags & 0x08 != 0,
            supports_pinning_without_slave_security: flags & 0x10 != 0,
            has_remote_attempted_stale_pairing: flags & 0x20 != 0,
            pairing_error_code: PairingErrorCode::from_raw(value[3]),
        })
    }
}

/// Subscribes to the connectivity characteristic and tracks its value.
pub struct ConnectivityWatcher {
    tx: watch::Sender<Option<ConnectivityStatus>>,
}

impl Default for ConnectivityWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityWatcher {
    /// Create a watcher with no status yet.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Subscribe to status updates and read the current value.
    ///
    /// Fails only if notifications cannot be enabled. A failed read is
    /// logged; the value then arrives through a notification.
    pub async fn subscribe(
        &self,
        client: &Arc<dyn ConnectedGattClient>,
        scope: &ConnectionScope,
    ) -> Result<()> {
        let notifications = client
            .subscribe(PAIRING_SERVICE_UUID, CONNECTIVITY_CHARACTERISTIC_UUID)
            .await?;

        let tx = self.tx.clone();
        let task_client = client.clone();
        scope.spawn("connectivity", async move {
            collect_with_retries(task_client, notifications, tx).await;
        });

        // Some firmware does not notify on subscribe.
        match client
            .read(PAIRING_SERVICE_UUID, CONNECTIVITY_CHARACTERISTIC_UUID)
            .await
        {
            Ok(value) => publish(&self.tx, &value),
            Err(e) => debug!("Connectivity read failed: {}", e),
        }

        Ok(())
    }

    /// Receiver of every status update.
    pub fn status(&self) -> watch::Receiver<Option<ConnectivityStatus>> {
        self.tx.subscribe()
    }

    /// Latest status, if any.
    pub fn current(&self) -> Option<ConnectivityStatus> {
        *self.tx.borrow()
    }

    /// Wait for the first status value.
    pub async fn first_status(&self, timeout: Duration) -> Option<ConnectivityStatus> {
        let mut rx = self.status();
        let wait = async {
            loop {
                let current = *rx.borrow_and_update();
                if let Some(status) = current {
                    return Some(status);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }
}

fn publish(tx: &watch::Sender<Option<ConnectivityStatus>>, value: &[u8]) {
    match ConnectivityStatus::parse(value) {
        Ok(status) => {
            debug!("connectivity: {:?}", status);
            tx.send_replace(Some(status));
        }
        Err(e) => warn!("Ignoring connectivity value: {}", e),
    }
}

/// Collect notifications, re-subscribing after each failure.
async fn collect_with_retries(
    client: Arc<dyn ConnectedGattClient>,
    first: NotificationStream,
    tx: watch::Sender<Option<ConnectivityStatus>>,
) {
    if collect(first, &tx).await {
        return;
    }

    for (attempt, delay) in COLLECT_DELAYS.iter().enumerate() {
        tokio::time::sleep(*delay).await;
        info!("Retrying connectivity subscription (attempt {})", attempt + 1);

        let stream = match client
            .subscribe(PAIRING_SERVICE_UUID, CONNECTIVITY_CHARACTERISTIC_UUID)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Connectivity re-subscribe failed: {}", e);
                continue;
            }
        };

        if collect(stream, &tx).await {
            return;
        }
    }

    warn!("Failed to collect connectivity changes after retries");
}

/// Returns true if the stream ended cleanly.
async fn collect(
    mut stream: NotificationStream,
    tx: &watch::Sender<Option<ConnectivityStatus>>,
) -> bool {
    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => publish(tx, &value),
            Err(e) => {
                warn!("Connectivity notifications failed: {}", e);
                return false;
            }
        }
    }
    true
}

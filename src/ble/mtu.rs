//! MTU negotiation.
//!
//! The MTU is either requested through the platform (native) or read back
//! after the watch negotiates it. Every change is published so the windowed
//! transport can resize its packets.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::ble::gatt::ConnectedGattClient;
use crate::config::{BlePlatformConfig, DEFAULT_MTU};
use crate::error::ConnectionFailureReason;

/// Tracks the MTU of one connection.
pub struct Mtu {
    use_native_mtu: bool,
    tx: watch::Sender<u16>,
}

impl Mtu {
    /// Create with the configured initial MTU.
    pub fn new(config: &BlePlatformConfig) -> Self {
        let initial = config.initial_mtu.max(DEFAULT_MTU);
        let (tx, _) = watch::channel(initial);
        Self {
            use_native_mtu: config.use_native_mtu,
            tx,
        }
    }

    /// Receiver of MTU changes.
    pub fn subscribe(&self) -> watch::Receiver<u16> {
        self.tx.subscribe()
    }

    /// Current MTU.
    pub fn current(&self) -> u16 {
        *self.tx.borrow()
    }

    /// Record an MTU reported by the platform after negotiation.
    pub fn set(&self, mtu: u16) {
        if mtu < DEFAULT_MTU {
            warn!("Ignoring MTU {} below minimum", mtu);
            return;
        }
        self.tx.send_if_modified(|current| {
            if *current == mtu {
                false
            } else {
                debug!("MTU changed: {} -> {}", current, mtu);
                *current = mtu;
                true
            }
        });
    }

    /// Negotiate towards `target`.
    ///
    /// A failed native request fails the connection attempt. A failed
    /// read-back keeps the previous value.
    pub async fn update(
        &self,
        client: &Arc<dyn ConnectedGattClient>,
        target: u16,
    ) -> std::result::Result<(), ConnectionFailureReason> {
        if self.use_native_mtu {
            match client.request_mtu(target).await {
                Ok(granted) => self.set(granted),
                Err(e) => {
                    warn!("Error setting MTU: {}", e);
                    return Err(ConnectionFailureReason::MtuGattError);
                }
            }
        }

        match client.mtu().await {
            Ok(mtu) => self.set(mtu),
            Err(e) => warn!("Error reading MTU: {}", e),
        }
        Ok(())
    }
}

//! Library configuration.
//!
//! Configuration is persisted as a JSON document and published through a
//! `watch` channel so long-lived components always see the latest value.
//! Each connection attempt takes an immutable [`SessionConfig`] snapshot.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::Result;

/// Default ATT MTU before negotiation.
pub const DEFAULT_MTU: u16 = 23;
/// MTU the host asks for when it negotiates natively.
pub const TARGET_MTU: u16 = 339;
/// Largest receive window the windowed transport supports.
pub const MAX_RX_WINDOW: u8 = 25;
/// Largest transmit window the windowed transport supports.
pub const MAX_TX_WINDOW: u8 = 25;

/// Transport-level BLE options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// The watch hosts the windowed transport as GATT server and the host
    /// connects as client. When false the host runs the GATT server.
    pub watch_as_gatt_server: bool,
    /// Log every windowed transport packet.
    pub verbose_transport_logging: bool,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            watch_as_gatt_server: false,
            verbose_transport_logging: false,
        }
    }
}

/// Options that depend on the host platform's BLE stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlePlatformConfig {
    /// Ask the watch to pin the host's radio address.
    pub pin_address: bool,
    /// The host starts OS-level bonding itself.
    pub phone_requests_pairing: bool,
    /// Write the pairing trigger characteristic instead of reading it.
    pub write_pairing_trigger: bool,
    /// Request the MTU through the platform API instead of reading it back.
    pub use_native_mtu: bool,
    /// MTU assumed before negotiation.
    pub initial_mtu: u16,
    /// MTU requested when negotiating natively.
    pub target_mtu: u16,
    /// Transmit window requested from the windowed transport.
    pub desired_tx_window: u8,
    /// Receive window requested from the windowed transport.
    pub desired_rx_window: u8,
    /// Drop all GATT server registrations when a connection ends.
    pub reset_transport_state_on_disconnect: bool,
}

impl Default for BlePlatformConfig {
    fn default() -> Self {
        Self {
            pin_address: true,
            phone_requests_pairing: true,
            write_pairing_trigger: true,
            use_native_mtu: true,
            initial_mtu: DEFAULT_MTU,
            target_mtu: TARGET_MTU,
            desired_tx_window: MAX_TX_WINDOW,
            desired_rx_window: MAX_RX_WINDOW,
            reset_transport_state_on_disconnect: false,
        }
    }
}

/// Fleet-level options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Allow more than one watch to be connected at a time.
    pub multiple_connected_watches_supported: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            multiple_connected_watches_supported: false,
        }
    }
}

/// Complete library configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibConfig {
    /// Transport options.
    pub ble: BleConfig,
    /// Platform options.
    pub platform: BlePlatformConfig,
    /// Fleet options.
    pub watch: WatchConfig,
}

impl LibConfig {
    /// Snapshot the parts a connection attempt reads.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            ble: self.ble.clone(),
            platform: self.platform.clone(),
        }
    }
}

/// Immutable configuration for one connection attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Transport options.
    pub ble: BleConfig,
    /// Platform options.
    pub platform: BlePlatformConfig,
}

impl SessionConfig {
    /// The MTU to request, clamped to the supported range.
    pub fn requested_mtu(&self) -> u16 {
        self.platform.target_mtu.clamp(DEFAULT_MTU, TARGET_MTU)
    }

    /// Transmit window clamped to what the transport supports.
    pub fn tx_window(&self) -> u8 {
        self.platform.desired_tx_window.clamp(1, MAX_TX_WINDOW)
    }

    /// Receive window clamped to what the transport supports.
    pub fn rx_window(&self) -> u8 {
        self.platform.desired_rx_window.clamp(1, MAX_RX_WINDOW)
    }
}

/// Owns the persisted configuration and publishes updates.
pub struct ConfigHolder {
    path: Option<PathBuf>,
    tx: watch::Sender<LibConfig>,
}

impl ConfigHolder {
    /// Hold a fixed configuration that is never written to disk.
    pub fn in_memory(config: LibConfig) -> Self {
        let (tx, _) = watch::channel(config);
        Self { path: None, tx }
    }

    /// Load configuration from `path`.
    ///
    /// A missing or unreadable file yields the defaults, which are then
    /// written back so the file exists for editing.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let config = match fs::read_to_string(&path).await {
            Ok(json) => match serde_json::from_str::<LibConfig>(&json) {
                Ok(config) => {
                    info!("Config loaded from {:?}", path);
                    Some(config)
                }
                Err(e) => {
                    warn!("Config at {:?} is invalid, using defaults: {}", path, e);
                    None
                }
            },
            Err(_) => {
                warn!("Config file not found at {:?}, using defaults", path);
                None
            }
        };

        let (tx, _) = watch::channel(config.clone().unwrap_or_default());
        let holder = Self {
            path: Some(path),
            tx,
        };

        if config.is_none() {
            holder.save().await?;
        }

        Ok(holder)
    }

    /// Current configuration.
    pub fn get(&self) -> LibConfig {
        self.tx.borrow().clone()
    }

    /// Receiver that observes every update.
    pub fn subscribe(&self) -> watch::Receiver<LibConfig> {
        self.tx.subscribe()
    }

    /// Replace the configuration, persist it and notify subscribers.
    pub async fn update(&self, config: LibConfig) -> Result<()> {
        self.tx.send_replace(config);
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&*self.tx.borrow())?;
        fs::write(path, json).await?;

        info!("Config saved to {:?}", path);
        Ok(())
    }
}

//! BLE scanning functionality.
//!
//! Provides the scanner for discovering watches and tracks whether the
//! Bluetooth radio is usable.

use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::ble::advertising::WatchScanRecord;
use crate::ble::uuids::is_watch_manufacturer;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Whether the Bluetooth radio is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RadioState {
    /// Not yet known.
    #[default]
    Unknown,
    /// Powered on.
    Enabled,
    /// Powered off or unavailable.
    Disabled,
}

impl RadioState {
    /// Check if connections can be made.
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl From<CentralState> for RadioState {
    fn from(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => Self::Enabled,
            CentralState::PoweredOff => Self::Disabled,
            _ => Self::Unknown,
        }
    }
}

/// A watch seen in a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// The watch's transport.
    pub transport: Transport,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Parsed scan record, if advertised.
    pub scan_record: Option<WatchScanRecord>,
}

impl ScanResult {
    /// Build a scan result from advertisement fields.
    ///
    /// Returns `None` for devices without a watch vendor's manufacturer data.
    pub fn from_advertisement(
        address: &str,
        local_name: Option<&str>,
        rssi: Option<i16>,
        manufacturer_data: &HashMap<u16, Vec<u8>>,
    ) -> Option<Self> {
        let (_, data) = manufacturer_data
            .iter()
            .find(|(id, _)| is_watch_manufacturer(**id))?;

        let scan_record = match WatchScanRecord::parse(data) {
            Ok(record) => Some(record),
            Err(e) => {
                trace!("Unparsable scan record from {}: {}", address, e);
                None
            }
        };

        let name = local_name.map(str::to_string).unwrap_or_else(|| address.to_string());
        Some(Self {
            transport: Transport::ble(address, name),
            rssi,
            scan_record,
        })
    }
}

/// BLE scanner for discovering watches.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Discovered watches by address.
    discovered: Arc<RwLock<HashMap<String, ScanResult>>>,
    /// Channel for discovery events.
    event_tx: broadcast::Sender<ScanResult>,
    /// Radio state.
    radio_tx: watch::Sender<RadioState>,
    /// Cancels the scan task.
    scan_token: RwLock<Option<CancellationToken>>,
    /// Cancels the radio monitor.
    monitor_token: CancellationToken,
}

impl BleScanner {
    /// Create a new BLE scanner on the first adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a new BLE scanner with a specific adapter.
    ///
    /// The radio is assumed enabled until the adapter reports otherwise.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        let (radio_tx, _) = watch::channel(RadioState::Enabled);

        Self {
            adapter,
            discovered: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            radio_tx,
            scan_token: RwLock::new(None),
            monitor_token: CancellationToken::new(),
        }
    }

    /// Track adapter power state changes.
    pub async fn monitor_radio(&self) -> Result<()> {
        let mut events = self.adapter.events().await?;
        let radio_tx = self.radio_tx.clone();
        let token = self.monitor_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::StateUpdate(state)) => {
                            let state = RadioState::from(state);
                            debug!("Radio state: {:?}", state);
                            radio_tx.send_replace(state);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
            debug!("Radio monitor ended");
        });

        Ok(())
    }

    /// Receiver of radio state changes.
    pub fn radio_state(&self) -> watch::Receiver<RadioState> {
        self.radio_tx.subscribe()
    }

    /// Start scanning for watches.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning cannot be started.
    pub async fn start_scanning(&self) -> Result<()> {
        if self.is_scanning() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for watches");

        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        let token = CancellationToken::new();
        *self.scan_token.write() = Some(token.clone());

        let adapter = self.adapter.clone();
        let discovered = self.discovered.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.next() => {
                        let Some(event) = event else { break };
                        Self::handle_event(event, &adapter, &discovered, &event_tx).await;
                    }
                }
            }
            debug!("Scan event loop ended");
        });

        Ok(())
    }

    /// Stop scanning for watches.
    pub async fn stop_scanning(&self) -> Result<()> {
        let token = self.scan_token.write().take();
        let Some(token) = token else {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        };

        info!("Stopping BLE scan");
        token.cancel();
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;
        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        self.scan_token.read().is_some()
    }

    /// Get all discovered watches.
    pub fn discovered(&self) -> HashMap<String, ScanResult> {
        self.discovered.read().clone()
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanResult> {
        self.event_tx.subscribe()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        discovered: &Arc<RwLock<HashMap<String, ScanResult>>>,
        event_tx: &broadcast::Sender<ScanResult>,
    ) {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            CentralEvent::ManufacturerDataAdvertisement {
                id,
                manufacturer_data,
            } => {
                if !manufacturer_data.keys().any(|k| is_watch_manufacturer(*k)) {
                    return;
                }
                id
            }
            _ => return,
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to read peripheral properties: {}", e);
                return;
            }
        };

        let Some(result) = ScanResult::from_advertisement(
            &properties.address.to_string(),
            properties.local_name.as_deref(),
            properties.rssi,
            &properties.manufacturer_data,
        ) else {
            return;
        };

        trace!("Watch advertisement: {}", result.transport);
        discovered
            .write()
            .insert(result.transport.identifier().to_string(), result.clone());
        let _ = event_tx.send(result);
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.monitor_token.cancel();
        if let Some(token) = self.scan_token.write().take() {
            token.cancel();
        }
    }
}

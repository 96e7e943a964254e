//! btleplug-backed GATT client and connector.
//!
//! Maps the [`GattConnector`] and [`ConnectedGattClient`] seams onto a
//! btleplug adapter and peripheral.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::gatt::{
    CharacteristicProperties, ConnectedGattClient, GattCharacteristic, GattConnector,
    GattService, GattWriteType, NotificationStream,
};
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::transport::Transport;

/// Notification event from a characteristic.
#[derive(Debug, Clone)]
struct NotificationEvent {
    characteristic_uuid: Uuid,
    data: Vec<u8>,
}

/// GATT client over a connected btleplug peripheral.
pub struct BtleplugGattClient {
    /// The peripheral to communicate with.
    peripheral: Peripheral,
    /// Cached characteristics by (service, characteristic).
    characteristics: Arc<RwLock<HashMap<(Uuid, Uuid), Characteristic>>>,
    /// Services from the last discovery.
    services: RwLock<Vec<GattService>>,
    /// Channel for notification events.
    notification_tx: broadcast::Sender<NotificationEvent>,
    /// Handle to the notification listener task.
    listener_handle: RwLock<Option<JoinHandle<()>>>,
}

impl BtleplugGattClient {
    /// Create a client for a connected peripheral.
    pub fn new(peripheral: Peripheral) -> Self {
        let (notification_tx, _) = broadcast::channel(256);

        Self {
            peripheral,
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            services: RwLock::new(Vec::new()),
            notification_tx,
            listener_handle: RwLock::new(None),
        }
    }

    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .get(&(service, characteristic))
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })
    }

    /// Forward peripheral notifications to the broadcast channel.
    async fn start_notifications(&self) -> Result<()> {
        if self.listener_handle.read().is_some() {
            return Ok(());
        }

        let mut notifications = self.peripheral.notifications().await?;
        let notification_tx = self.notification_tx.clone();

        let handle = tokio::spawn(async move {
            debug!("Notification listener starting");
            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );
                let _ = notification_tx.send(NotificationEvent {
                    characteristic_uuid: notification.uuid,
                    data: notification.value,
                });
            }
            debug!("Notification listener stopped");
        });

        *self.listener_handle.write() = Some(handle);
        Ok(())
    }
}

impl Drop for BtleplugGattClient {
    fn drop(&mut self) {
        if let Some(handle) = self.listener_handle.write().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ConnectedGattClient for BtleplugGattClient {
    async fn discover_services(&self) -> Result<Vec<GattService>> {
        self.peripheral.discover_services().await?;

        let mut discovered = Vec::new();
        {
            let mut chars = self.characteristics.write();
            chars.clear();

            for service in self.peripheral.services() {
                let mut characteristics = Vec::new();
                for characteristic in service.characteristics {
                    debug!(
                        "Found characteristic: {} in service {}",
                        characteristic.uuid, service.uuid
                    );
                    characteristics.push(GattCharacteristic {
                        uuid: characteristic.uuid,
                        properties: CharacteristicProperties::from_raw(
                            characteristic.properties.bits(),
                        ),
                    });
                    chars.insert((service.uuid, characteristic.uuid), characteristic);
                }
                discovered.push(GattService {
                    uuid: service.uuid,
                    characteristics,
                });
            }

            debug!("Discovered {} characteristics", chars.len());
        }

        *self.services.write() = discovered.clone();
        self.start_notifications().await?;
        Ok(discovered)
    }

    fn services(&self) -> Vec<GattService> {
        self.services.read().clone()
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream> {
        let target = self.characteristic(service, characteristic)?;

        // Receiver first so nothing sent right after subscribing is lost.
        let rx = self.notification_tx.subscribe();
        self.peripheral.subscribe(&target).await.map_err(|e| {
            debug!("Failed to subscribe to {}: {:?}", characteristic, e);
            Error::Bluetooth(e)
        })?;
        debug!("Subscribed to notifications from {}", characteristic);

        let notifications = stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.characteristic_uuid == characteristic => {
                        return Some((Ok(event.data), rx));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} notifications from {}", skipped, characteristic);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(notifications.boxed())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let target = self.characteristic(service, characteristic)?;
        let data = self.peripheral.read(&target).await?;
        trace!("Read {} bytes from characteristic {}", data.len(), characteristic);
        Ok(data)
    }

    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: GattWriteType,
    ) -> Result<()> {
        let target = self.characteristic(service, characteristic)?;
        let write_type = match write_type {
            GattWriteType::WithResponse => WriteType::WithResponse,
            GattWriteType::NoResponse => WriteType::WithoutResponse,
        };
        self.peripheral.write(&target, value, write_type).await?;
        trace!("Wrote {} bytes to characteristic {}", value.len(), characteristic);
        Ok(())
    }

    async fn request_mtu(&self, _mtu: u16) -> Result<u16> {
        Err(Error::NotSupported {
            operation: "MTU request".to_string(),
        })
    }

    async fn mtu(&self) -> Result<u16> {
        Err(Error::NotSupported {
            operation: "MTU read".to_string(),
        })
    }
}

/// Opens the link to one watch through a btleplug adapter.
pub struct BtleplugConnector {
    adapter: Adapter,
    transport: Transport,
    peripheral: RwLock<Option<Peripheral>>,
    link_closed: CancellationToken,
    watcher_handle: RwLock<Option<JoinHandle<()>>>,
}

impl BtleplugConnector {
    /// Create a connector for `transport`.
    pub fn new(adapter: Adapter, transport: Transport) -> Self {
        Self {
            adapter,
            transport,
            peripheral: RwLock::new(None),
            link_closed: CancellationToken::new(),
            watcher_handle: RwLock::new(None),
        }
    }

    async fn find_peripheral(&self) -> Result<Option<Peripheral>> {
        let wanted = self.transport.identifier();
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string().eq_ignore_ascii_case(wanted)
                || peripheral.id().to_string() == wanted
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    /// Cancel `link_closed` when the adapter reports the disconnection.
    async fn watch_disconnection(&self, peripheral: &Peripheral) -> Result<()> {
        let mut events = self.adapter.events().await?;
        let id = peripheral.id();
        let link_closed = self.link_closed.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = link_closed.cancelled() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(disconnected)) if disconnected == id => {
                            debug!("Device disconnected: {:?}", disconnected);
                            link_closed.cancel();
                            break;
                        }
                        Some(_) => {}
                        None => {
                            warn!("Adapter event stream ended");
                            link_closed.cancel();
                            break;
                        }
                    }
                }
            }
        });

        *self.watcher_handle.write() = Some(handle);
        Ok(())
    }
}

#[async_trait]
impl GattConnector for BtleplugConnector {
    async fn connect(
        &self,
    ) -> std::result::Result<Arc<dyn ConnectedGattClient>, ConnectionFailureReason> {
        let peripheral = match self.find_peripheral().await {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!("{} not known to the adapter", self.transport);
                return Err(ConnectionFailureReason::DeviceNotFound);
            }
            Err(e) => {
                error!("Failed to list peripherals: {}", e);
                return Err(ConnectionFailureReason::LinkFailed);
            }
        };

        if let Err(e) = self.watch_disconnection(&peripheral).await {
            error!("Failed to watch adapter events: {}", e);
            return Err(ConnectionFailureReason::LinkFailed);
        }

        if !peripheral.is_connected().await.unwrap_or(false) {
            if let Err(e) = peripheral.connect().await {
                warn!("Connection to {} failed: {}", self.transport, e);
                return Err(ConnectionFailureReason::LinkFailed);
            }
        }
        info!("Connected to {}", self.transport);

        *self.peripheral.write() = Some(peripheral.clone());
        Ok(Arc::new(BtleplugGattClient::new(peripheral)))
    }

    async fn disconnect(&self) {
        let peripheral = self.peripheral.write().take();
        if let Some(peripheral) = peripheral {
            match peripheral.disconnect().await {
                Ok(()) => info!("Disconnected from {}", self.transport),
                Err(e) => error!("Failed to disconnect: {}", e),
            }
        }
        self.link_closed.cancel();
    }

    fn link_closed(&self) -> CancellationToken {
        self.link_closed.clone()
    }
}

impl Drop for BtleplugConnector {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher_handle.write().take() {
            handle.abort();
        }
    }
}

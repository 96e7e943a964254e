//! Host-side GATT server for the windowed transport.
//!
//! When the host runs the server role, the watch writes transport packets to
//! the server's data characteristic. The manager routes each write to the
//! windowed transport registered for the writing device, and sends outbound
//! packets as notifications through the platform backend.
//!
//! The manager is an owned handle injected into every session that needs it.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::uuids::{
    SERVER_META_RESPONSE, TRANSPORT_SERVER_DATA_UUID, TRANSPORT_SERVER_META_UUID,
    TRANSPORT_SERVER_SERVICE_UUID,
};
use crate::transport::Transport;

/// Platform GATT server.
#[async_trait]
pub trait GattServerBackend: Send + Sync {
    /// Notify `data` on a characteristic to the device at `address`.
    async fn send_data(&self, address: &str, service: Uuid, characteristic: Uuid, data: &[u8])
        -> bool;
}

/// Routes server-role traffic per device.
#[derive(Default)]
pub struct GattServerManager {
    backend: RwLock<Option<Arc<dyn GattServerBackend>>>,
    registrations: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,
}

impl GattServerManager {
    /// Create a manager with no open server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager with an open server.
    pub fn with_backend(backend: Arc<dyn GattServerBackend>) -> Self {
        let manager = Self::new();
        manager.open(backend);
        manager
    }

    /// Attach the platform server.
    pub fn open(&self, backend: Arc<dyn GattServerBackend>) {
        debug!("Opening GATT server");
        *self.backend.write() = Some(backend);
    }

    /// Detach the platform server and drop all registrations.
    pub fn close(&self) {
        debug!("Closing GATT server");
        *self.backend.write() = None;
        self.registrations.write().clear();
    }

    /// Check if a platform server is attached.
    pub fn is_open(&self) -> bool {
        self.backend.read().is_some()
    }

    /// Register the inbound channel for a device.
    ///
    /// Returns false if no server is open.
    pub fn register(&self, transport: &Transport, inbound: mpsc::Sender<Vec<u8>>) -> bool {
        if !self.is_open() {
            warn!("Cannot register {}: GATT server not open", transport);
            return false;
        }
        debug!("Registering {} with GATT server", transport);
        self.registrations
            .write()
            .insert(transport.identifier().to_string(), inbound);
        true
    }

    /// Remove the registration for a device.
    pub fn unregister(&self, transport: &Transport) {
        if self
            .registrations
            .write()
            .remove(transport.identifier())
            .is_some()
        {
            debug!("Unregistered {} from GATT server", transport);
        }
    }

    /// Check if a device is registered.
    pub fn is_registered(&self, transport: &Transport) -> bool {
        self.registrations.read().contains_key(transport.identifier())
    }

    /// Drop every registration.
    pub fn reset(&self) {
        let count = {
            let mut registrations = self.registrations.write();
            let count = registrations.len();
            registrations.clear();
            count
        };
        debug!("Reset GATT server state ({} registrations)", count);
    }

    /// Route a write from the device at `address` to its windowed transport.
    ///
    /// Called by the platform backend. Returns false if the write was dropped.
    pub fn deliver(&self, address: &str, data: Vec<u8>) -> bool {
        let Some(inbound) = self.registrations.read().get(address).cloned() else {
            warn!("Dropping write from unregistered device {}", address);
            return false;
        };
        trace!("Inbound {} bytes from {}", data.len(), address);
        match inbound.try_send(data) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping write from {}: {}", address, e);
                false
            }
        }
    }

    /// Value to answer a characteristic read with.
    pub fn read_response(&self, characteristic: &Uuid) -> Option<&'static [u8]> {
        if *characteristic == TRANSPORT_SERVER_META_UUID {
            Some(&SERVER_META_RESPONSE[..])
        } else {
            None
        }
    }

    /// Send a transport packet to the device at `address`.
    pub async fn send(&self, address: &str, data: &[u8]) -> bool {
        let Some(backend) = self.backend.read().clone() else {
            return false;
        };
        backend
            .send_data(
                address,
                TRANSPORT_SERVER_SERVICE_UUID,
                TRANSPORT_SERVER_DATA_UUID,
                data,
            )
            .await
    }
}

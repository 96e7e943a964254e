//! Per-attempt construction of connection state machines, and firmware
//! update checks.

use async_trait::async_trait;
use btleplug::platform::Adapter;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::ble::btleplug_client::BtleplugConnector;
use crate::ble::gatt_server::GattServerManager;
use crate::ble::pairing::BondingAgent;
use crate::ble::session::{BleSession, WindowedTransportFactory};
use crate::config::{LibConfig, SessionConfig};
use crate::connection::{ConnectionStateMachine, ServiceProvider};
use crate::protocol::WatchInfo;
use crate::registry::watch::FirmwareUpdate;
use crate::transport::Transport;

/// Creates a state machine for each connection attempt.
pub trait ConnectionFactory: Send + Sync {
    /// Build a state machine for `transport`.
    ///
    /// Returns `None` if the transport cannot be addressed on this platform.
    fn create(&self, transport: &Transport) -> Option<ConnectionStateMachine>;
}

/// Wires BLE sessions over a btleplug adapter.
pub struct BleConnectionFactory {
    adapter: Adapter,
    config: watch::Receiver<LibConfig>,
    gatt_server: Arc<GattServerManager>,
    bonding: Arc<dyn BondingAgent>,
    windowed: Arc<dyn WindowedTransportFactory>,
    services: Arc<dyn ServiceProvider>,
}

impl BleConnectionFactory {
    /// Create a factory.
    pub fn new(
        adapter: Adapter,
        config: watch::Receiver<LibConfig>,
        gatt_server: Arc<GattServerManager>,
        bonding: Arc<dyn BondingAgent>,
        windowed: Arc<dyn WindowedTransportFactory>,
        services: Arc<dyn ServiceProvider>,
    ) -> Self {
        Self {
            adapter,
            config,
            gatt_server,
            bonding,
            windowed,
            services,
        }
    }
}

impl ConnectionFactory for BleConnectionFactory {
    fn create(&self, transport: &Transport) -> Option<ConnectionStateMachine> {
        if !transport.is_ble() {
            debug!("No BLE route to {}", transport);
            return None;
        }

        let config = btleplug_session(&self.config.borrow());
        let connector = BtleplugConnector::new(self.adapter.clone(), transport.clone());
        let session = BleSession::new(
            transport.clone(),
            config,
            Arc::new(connector),
            self.gatt_server.clone(),
            self.bonding.clone(),
            self.windowed.clone(),
        );
        Some(ConnectionStateMachine::new(
            transport.clone(),
            Arc::new(session),
            self.services.clone(),
        ))
    }
}

/// Session settings for a btleplug link.
///
/// btleplug can neither host a GATT server nor request an MTU, so the watch
/// always takes the server role.
fn btleplug_session(config: &LibConfig) -> SessionConfig {
    let mut session = config.session();
    session.ble.watch_as_gatt_server = true;
    session.platform.use_native_mtu = false;
    session
}

/// Looks up firmware updates for a connected watch.
#[async_trait]
pub trait FirmwareUpdateChecker: Send + Sync {
    /// The newest update applicable to `watch_info`, if any.
    async fn check_for_updates(&self, watch_info: &WatchInfo) -> Option<FirmwareUpdate>;
}

/// Never reports an update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFirmwareUpdates;

#[async_trait]
impl FirmwareUpdateChecker for NoFirmwareUpdates {
    async fn check_for_updates(&self, _watch_info: &WatchInfo) -> Option<FirmwareUpdate> {
        None
    }
}

//! Pairing and bonding.
//!
//! The watch keeps its own "paired" flag while the host OS keeps a bond
//! record. When the two disagree the host triggers pairing through the
//! pairing trigger characteristic and waits for the OS bond to complete.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::ble::connectivity::ConnectivityStatus;
use crate::ble::gatt::{find_characteristic, ConnectedGattClient, GattWriteType};
use crate::ble::uuids::{PAIRING_SERVICE_UUID, PAIRING_TRIGGER_CHARACTERISTIC_UUID};
use crate::config::SessionConfig;
use crate::error::ConnectionFailureReason;
use crate::transport::Transport;

/// How long to wait for the bond. Requires user interaction.
pub const PENDING_BOND_TIMEOUT: Duration = Duration::from_secs(60);

/// OS-level bond state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BondState {
    /// Not bonded.
    None,
    /// Bonding in progress.
    Bonding,
    /// Bonded.
    Bonded,
}

impl BondState {
    /// Create from the platform's raw bond state value.
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            10 => Some(Self::None),
            11 => Some(Self::Bonding),
            12 => Some(Self::Bonded),
            _ => None,
        }
    }
}

/// Access to the host's bond records.
#[async_trait]
pub trait BondingAgent: Send + Sync {
    /// Whether the host has a bond record for this transport.
    async fn is_bonded(&self, transport: &Transport) -> bool;

    /// Ask the OS to start bonding. Returns false if the request failed.
    async fn create_bond(&self, transport: &Transport) -> bool;

    /// Bond state changes for this transport.
    ///
    /// `connectivity` carries the watch's own view, for platforms that
    /// expose no bond events.
    fn bond_events(
        &self,
        transport: &Transport,
        connectivity: watch::Receiver<Option<ConnectivityStatus>>,
    ) -> BoxStream<'static, BondState>;
}

/// Bonding agent for platforms where the OS bonds implicitly on the first
/// encrypted access and exposes no bond API.
///
/// Bond records are tracked in memory from the watch's connectivity reports.
#[derive(Debug, Default)]
pub struct ConnectivityBondingAgent {
    bonded: Arc<RwLock<HashSet<String>>>,
}

impl ConnectivityBondingAgent {
    /// Create an agent with no known bonds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the bond for a transport.
    pub fn remove_bond(&self, transport: &Transport) {
        self.bonded.write().remove(transport.identifier());
    }
}

#[async_trait]
impl BondingAgent for ConnectivityBondingAgent {
    async fn is_bonded(&self, transport: &Transport) -> bool {
        self.bonded.read().contains(transport.identifier())
    }

    async fn create_bond(&self, transport: &Transport) -> bool {
        debug!("Bond for {} will be created by the OS on first encrypted access", transport);
        true
    }

    fn bond_events(
        &self,
        transport: &Transport,
        connectivity: watch::Receiver<Option<ConnectivityStatus>>,
    ) -> BoxStream<'static, BondState> {
        let bonded = self.bonded.clone();
        let identifier = transport.identifier().to_string();

        // The current status comes first so an existing bond is seen at once.
        stream::unfold((connectivity, true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let status = *rx.borrow_and_update();
            Some((status, (rx, false)))
        })
        .filter_map(move |status| {
            let state = match status {
                Some(s) if s.paired && s.encrypted => {
                    bonded.write().insert(identifier.clone());
                    Some(BondState::Bonded)
                }
                Some(_) => Some(BondState::Bonding),
                None => None,
            };
            futures::future::ready(state)
        })
        .boxed()
    }
}

/// Decide whether explicit pairing is needed.
///
/// Only when both sides agree they are paired can pairing be skipped.
pub fn pairing_required(watch_paired: bool, host_bonded: bool) -> bool {
    match (watch_paired, host_bonded) {
        (true, true) => {
            debug!("Already paired");
            false
        }
        (true, false) => {
            debug!("Watch thinks it is paired, host does not");
            true
        }
        (false, true) => {
            debug!("Host thinks it is paired, watch does not");
            true
        }
        (false, false) => {
            debug!("Needs pairing");
            true
        }
    }
}

/// Flags written to the pairing trigger characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairingTriggerFlags {
    /// Ask the watch to pin the host address.
    pub pin_address: bool,
    /// The host will bond itself; the watch should not request security.
    pub no_security_request: bool,
    /// Let the watch accept future pairing requests automatically.
    pub auto_accept_future_pairing: bool,
    /// The watch hosts the windowed transport GATT server.
    pub watch_as_gatt_server: bool,
}

impl PairingTriggerFlags {
    /// Encode as the single trigger byte.
    pub fn to_byte(&self) -> u8 {
        let mut value = 0u8;
        if self.pin_address {
            value |= 0x01;
        }
        if self.no_security_request {
            value |= 0x02;
        } else {
            // Force security request.
            value |= 0x04;
        }
        if self.auto_accept_future_pairing {
            value |= 0x08;
        }
        if self.watch_as_gatt_server {
            value |= 0x10;
        }
        value
    }
}

/// Runs the pairing protocol for one connection.
pub struct Pairing {
    transport: Transport,
    config: SessionConfig,
    agent: Arc<dyn BondingAgent>,
}

impl Pairing {
    /// Create for `transport`.
    pub fn new(transport: Transport, config: SessionConfig, agent: Arc<dyn BondingAgent>) -> Self {
        Self {
            transport,
            config,
            agent,
        }
    }

    /// Whether the host has a bond record for this transport.
    pub async fn host_bonded(&self) -> bool {
        self.agent.is_bonded(&self.transport).await
    }

    /// Whether an OS-level bond must be created explicitly.
    fn needs_explicit_bond(&self, status: &ConnectivityStatus) -> bool {
        let platform = &self.config.platform;
        !(status.supports_pinning_without_slave_security && platform.phone_requests_pairing)
    }

    /// Trigger pairing and wait for the bond.
    pub async fn request_pairing(
        &self,
        client: &Arc<dyn ConnectedGattClient>,
        status: &ConnectivityStatus,
        connectivity: watch::Receiver<Option<ConnectivityStatus>>,
    ) -> std::result::Result<(), ConnectionFailureReason> {
        debug!("Requesting pairing with {}", self.transport);

        let services = client.services();
        let Some(trigger) = find_characteristic(
            &services,
            &PAIRING_SERVICE_UUID,
            &PAIRING_TRIGGER_CHARACTERISTIC_UUID,
        ) else {
            error!("Pairing trigger characteristic not found");
            return Err(ConnectionFailureReason::ReadPairingTrigger);
        };

        // Subscribe before triggering so the bonded event is not missed.
        let mut bond_events = self.agent.bond_events(&self.transport, connectivity);

        let mut needs_explicit_bond = true;
        if trigger.properties.is_writable() && self.config.platform.write_pairing_trigger {
            needs_explicit_bond = self.needs_explicit_bond(status);
            let flags = PairingTriggerFlags {
                pin_address: self.config.platform.pin_address,
                no_security_request: needs_explicit_bond,
                auto_accept_future_pairing: false,
                watch_as_gatt_server: self.config.ble.watch_as_gatt_server,
            };
            debug!("Writing pairing trigger {:?}", flags);

            if let Err(e) = client
                .write(
                    PAIRING_SERVICE_UUID,
                    PAIRING_TRIGGER_CHARACTERISTIC_UUID,
                    &[flags.to_byte()],
                    GattWriteType::WithResponse,
                )
                .await
            {
                // Pairing usually completes through the bond anyway.
                warn!("Failed to write pairing trigger: {}", e);
            }
        } else if let Err(e) = client
            .read(PAIRING_SERVICE_UUID, PAIRING_TRIGGER_CHARACTERISTIC_UUID)
            .await
        {
            error!("Failed to read pairing trigger: {}", e);
            return Err(ConnectionFailureReason::ReadPairingTrigger);
        }

        if needs_explicit_bond {
            debug!("Explicit bond required");
            if !self.agent.create_bond(&self.transport).await {
                error!("Failed to request bond creation");
                return Err(ConnectionFailureReason::CreateBondFailed);
            }
        }

        debug!("Waiting for bond state");
        let wait = async {
            while let Some(state) = bond_events.next().await {
                trace!("Bond state: {:?}", state);
                if state == BondState::Bonded {
                    return;
                }
            }
            debug!("Bond events ended without a bonded state");
        };

        match tokio::time::timeout(PENDING_BOND_TIMEOUT, wait).await {
            Ok(()) => {
                debug!("Bonded with {}", self.transport);
                Ok(())
            }
            Err(_) => {
                error!("Failed to bond in time");
                Err(ConnectionFailureReason::PairingTimedOut)
            }
        }
    }
}

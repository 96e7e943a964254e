//! Device views handed to callers.
//!
//! A [`WatchDevice`] is a pure projection of the registry's [`Watch`], the
//! state of its connection attempt and whether the radio is usable. What a
//! caller may do with the device follows from [`WatchDevice::capabilities`].

use std::collections::BTreeSet;

use crate::ble::advertising::WatchScanRecord;
use crate::connection::{ConnectedState, ConnectingState};
use crate::error::ConnectionFailureReason;
use crate::registry::watch::{FirmwareUpdate, KnownProperties, Watch};
use crate::transport::Transport;

/// What can currently be done with a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Start connecting.
    Connect,
    /// Stop connecting or disconnect.
    Disconnect,
    /// Remove from the known set.
    Forget,
    /// Send and receive raw protocol messages.
    Messages,
    /// Install firmware.
    Firmware,
    /// Gather logs.
    Logs,
    /// Fetch core dumps.
    CoreDump,
    /// Observe the running app.
    AppRunState,
    /// Set the clock.
    Time,
}

/// Lifecycle phase of a device as a caller sees it.
#[derive(Debug, Clone)]
pub enum DeviceState {
    /// Visible in a scan and not connecting.
    Discovered {
        /// Parsed advertisement, if any.
        scan_record: Option<WatchScanRecord>,
        /// Signal strength in dBm.
        rssi: Option<i16>,
    },
    /// Connected before, not visible and not connecting.
    Known,
    /// Connection attempt in progress.
    Connecting {
        /// The handshake is running.
        negotiating: bool,
    },
    /// Waiting for an attempt to wind down.
    Disconnecting,
    /// Connected in recovery mode.
    ConnectedInRecovery(ConnectedState),
    /// Connected normally.
    Connected(ConnectedState),
}

impl DeviceState {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovered { .. } => "Discovered",
            Self::Known => "Known",
            Self::Connecting { .. } => "Connecting",
            Self::Disconnecting => "Disconnecting",
            Self::ConnectedInRecovery(_) => "ConnectedInRecovery",
            Self::Connected(_) => "Connected",
        }
    }

    /// Check if connected in either mode.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_) | Self::ConnectedInRecovery(_))
    }
}

/// A watch as seen by callers.
#[derive(Debug, Clone)]
pub struct WatchDevice {
    /// The watch's transport.
    pub transport: Transport,
    /// Name to show.
    pub name: String,
    /// Identity from a previous connection.
    pub known: Option<KnownProperties>,
    /// Whether the watch should be connected.
    pub connect_goal: bool,
    /// Lifecycle phase.
    pub state: DeviceState,
    /// Available firmware update.
    pub firmware_update_available: Option<FirmwareUpdate>,
    /// Why the last attempt failed.
    pub last_failure: Option<ConnectionFailureReason>,
}

impl WatchDevice {
    /// Project a watch into its device view.
    pub fn project(watch: &Watch, state: &ConnectingState, radio_enabled: bool) -> Self {
        Self {
            transport: watch.transport.clone(),
            name: watch.display_name().to_string(),
            known: watch.known.clone(),
            connect_goal: watch.connect_goal,
            state: project_state(watch, state, radio_enabled),
            firmware_update_available: watch.firmware_update_available.clone(),
            last_failure: watch.last_failure,
        }
    }

    /// Check if the device has connected before.
    pub fn is_known(&self) -> bool {
        self.known.is_some()
    }

    /// Everything a caller may currently do.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        use Capability::*;
        let mut capabilities = BTreeSet::new();
        match &self.state {
            DeviceState::Discovered { .. } | DeviceState::Known => {
                capabilities.insert(Connect);
            }
            DeviceState::Connecting { .. } => {
                capabilities.insert(Disconnect);
            }
            DeviceState::Disconnecting => {}
            DeviceState::ConnectedInRecovery(_) => {
                capabilities.extend([Disconnect, Firmware, Logs, CoreDump]);
            }
            DeviceState::Connected(_) => {
                capabilities.extend([
                    Disconnect,
                    Messages,
                    Firmware,
                    Logs,
                    CoreDump,
                    AppRunState,
                    Time,
                ]);
            }
        }
        if self.is_known() {
            capabilities.insert(Forget);
        }
        capabilities
    }
}

fn project_state(watch: &Watch, state: &ConnectingState, radio_enabled: bool) -> DeviceState {
    if radio_enabled {
        match state {
            s if !watch.connect_goal && s.is_active() => return DeviceState::Disconnecting,
            ConnectingState::Connected(connected) if connected.is_recovery() => {
                return DeviceState::ConnectedInRecovery(connected.clone())
            }
            ConnectingState::Connected(connected) => {
                return DeviceState::Connected(connected.clone())
            }
            ConnectingState::Connecting | ConnectingState::Negotiating => {
                return DeviceState::Connecting {
                    negotiating: matches!(state, ConnectingState::Negotiating),
                }
            }
            _ if watch.connect_goal => return DeviceState::Connecting { negotiating: false },
            _ => {}
        }
    }

    match (&watch.scan_result, &watch.known) {
        (Some(scan), _) => DeviceState::Discovered {
            scan_record: scan.scan_record.clone(),
            rssi: scan.rssi,
        },
        (None, Some(_)) => DeviceState::Known,
        (None, None) => DeviceState::Discovered {
            scan_record: None,
            rssi: None,
        },
    }
}

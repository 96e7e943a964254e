//! The registry's per-watch aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::ble::scanner::ScanResult;
use crate::connection::{ConnectingState, ConnectionScope, ConnectionStateMachine};
use crate::error::ConnectionFailureReason;
use crate::registry::store::KnownWatchRecord;
use crate::transport::Transport;

/// Identity learned from a watch the first time it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownProperties {
    /// Display name.
    pub name: String,
    /// Last running firmware version tag.
    pub running_fw_version: String,
    /// Serial number.
    pub serial: String,
    /// When the watch last finished connecting.
    pub last_connected: Option<DateTime<Utc>>,
}

/// An available firmware update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareUpdate {
    /// Version tag of the update.
    pub version: String,
    /// Where the bundle can be fetched.
    pub url: String,
    /// Release notes.
    pub notes: String,
}

/// A live connection attempt owned by the registry.
#[derive(Clone)]
pub struct ActiveConnection {
    /// The state machine running the attempt.
    pub machine: Arc<ConnectionStateMachine>,
    /// Tasks of the attempt.
    pub scope: ConnectionScope,
    cleanup_done: Arc<AtomicBool>,
    disconnect_requested: Arc<AtomicBool>,
}

impl ActiveConnection {
    /// Wrap a new attempt.
    pub fn new(machine: Arc<ConnectionStateMachine>, scope: ConnectionScope) -> Self {
        Self {
            machine,
            scope,
            cleanup_done: Arc::new(AtomicBool::new(false)),
            disconnect_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Id of the attempt's scope.
    pub fn id(&self) -> u64 {
        self.scope.id()
    }

    /// Claim the right to clean up. Only the first caller gets true.
    pub fn claim_cleanup(&self) -> bool {
        self.cleanup_done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Check if cleanup has been claimed.
    pub fn is_cleaned_up(&self) -> bool {
        self.cleanup_done.load(Ordering::SeqCst)
    }

    /// Mark a disconnect as requested. Only one caller gets true until
    /// [`ActiveConnection::finish_disconnect`] is called.
    pub fn claim_disconnect(&self) -> bool {
        !self.disconnect_requested.swap(true, Ordering::SeqCst)
    }

    /// Allow the disconnect to be requested again.
    pub fn finish_disconnect(&self) {
        self.disconnect_requested.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("scope", &self.id())
            .field("state", &self.machine.state().name())
            .finish()
    }
}

/// Everything the registry knows about one watch.
///
/// A watch is either currently visible (`scan_result`) or previously known
/// (`known`), and usually both.
#[derive(Debug, Clone)]
pub struct Watch {
    /// The watch's transport.
    pub transport: Transport,
    /// Latest sighting, cleared once connected.
    pub scan_result: Option<ScanResult>,
    /// Whether the watch should be connected.
    pub connect_goal: bool,
    /// Identity learned from a previous connection.
    pub known: Option<KnownProperties>,
    /// The attempt in flight, if any.
    pub active_connection: Option<ActiveConnection>,
    /// The record last written to the store.
    pub as_persisted: Option<KnownWatchRecord>,
    /// Remove once no attempt is in flight.
    pub forget: bool,
    /// Result of the last update check.
    pub firmware_update_available: Option<FirmwareUpdate>,
    /// Why the last attempt failed.
    pub last_failure: Option<ConnectionFailureReason>,
    /// Attempts that failed since the last successful connection.
    pub failed_attempts: u32,
    /// No new attempt is started before this.
    pub retry_at: Option<Instant>,
}

impl Watch {
    /// A watch seen for the first time in a scan.
    pub fn from_scan(scan_result: ScanResult) -> Self {
        Self {
            transport: scan_result.transport.clone(),
            scan_result: Some(scan_result),
            connect_goal: false,
            known: None,
            active_connection: None,
            as_persisted: None,
            forget: false,
            firmware_update_available: None,
            last_failure: None,
            failed_attempts: 0,
            retry_at: None,
        }
    }

    /// A watch loaded from the store.
    pub fn from_record(record: KnownWatchRecord) -> Self {
        Self {
            transport: record.transport(),
            scan_result: None,
            connect_goal: record.connect_goal,
            known: Some(KnownProperties {
                name: record.name.clone(),
                running_fw_version: record.running_fw_version.clone(),
                serial: record.serial.clone(),
                last_connected: record.last_connected,
            }),
            active_connection: None,
            as_persisted: Some(record),
            forget: false,
            firmware_update_available: None,
            last_failure: None,
            failed_attempts: 0,
            retry_at: None,
        }
    }

    /// Check the aggregate's invariant.
    pub fn is_valid(&self) -> bool {
        self.scan_result.is_some() || self.known.is_some()
    }

    /// The record that should be in the store, if the watch is known.
    pub fn as_record(&self) -> Option<KnownWatchRecord> {
        let known = self.known.as_ref()?;
        Some(KnownWatchRecord {
            identifier: self.transport.identifier().to_string(),
            transport_kind: self.transport.kind(),
            name: known.name.clone(),
            running_fw_version: known.running_fw_version.clone(),
            serial: known.serial.clone(),
            connect_goal: self.connect_goal,
            last_connected: known.last_connected,
        })
    }

    /// State of the attempt in flight, or `Inactive`.
    pub fn connecting_state(&self) -> ConnectingState {
        self.active_connection
            .as_ref()
            .map(|active| active.machine.state())
            .unwrap_or_default()
    }

    /// Clear the failure backoff.
    pub fn reset_backoff(&mut self) {
        self.failed_attempts = 0;
        self.retry_at = None;
    }

    /// Name to show for the watch.
    pub fn display_name(&self) -> &str {
        match &self.known {
            Some(known) if !known.name.is_empty() => &known.name,
            _ => self.transport.name(),
        }
    }
}

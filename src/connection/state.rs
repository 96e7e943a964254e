//! Connection lifecycle states.

use crate::connection::services::{ConnectedServices, RecoveryServices};
use crate::error::ConnectionFailureReason;
use crate::protocol::WatchInfo;

/// A negotiated connection.
#[derive(Debug, Clone)]
pub enum ConnectedState {
    /// The watch must be operated in recovery mode.
    InRecovery {
        /// Handshake result.
        watch_info: WatchInfo,
        /// Restricted service bundle.
        services: RecoveryServices,
    },
    /// Normal operation.
    Normal {
        /// Handshake result.
        watch_info: WatchInfo,
        /// Full service bundle.
        services: ConnectedServices,
    },
}

impl ConnectedState {
    /// Handshake result.
    pub fn watch_info(&self) -> &WatchInfo {
        match self {
            Self::InRecovery { watch_info, .. } | Self::Normal { watch_info, .. } => watch_info,
        }
    }

    /// Check if this is the recovery variant.
    pub fn is_recovery(&self) -> bool {
        matches!(self, Self::InRecovery { .. })
    }
}

/// Phase of one transport's connection state machine.
#[derive(Debug, Clone, Default)]
pub enum ConnectingState {
    /// No attempt in progress.
    #[default]
    Inactive,
    /// Establishing the BLE session.
    Connecting,
    /// Running the handshake.
    Negotiating,
    /// The attempt failed.
    Failed(ConnectionFailureReason),
    /// Negotiated and operating.
    Connected(ConnectedState),
}

impl ConnectingState {
    /// Check if an attempt is between `Connecting` and `Connected`.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Negotiating | Self::Connected(_))
    }

    /// Check if negotiated.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    /// Handshake result, once connected.
    pub fn watch_info(&self) -> Option<&WatchInfo> {
        match self {
            Self::Connected(connected) => Some(connected.watch_info()),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Inactive => "Inactive",
            Self::Connecting => "Connecting",
            Self::Negotiating => "Negotiating",
            Self::Failed(_) => "Failed",
            Self::Connected(ConnectedState::InRecovery { .. }) => "Connected.InRecovery",
            Self::Connected(ConnectedState::Normal { .. }) => "Connected.Normal",
        }
    }

    /// Check if moving to `next` is a legal transition.
    ///
    /// A fresh attempt restarts at `Connecting`, and `Connected` can only be
    /// reached from `Negotiating`.
    pub fn can_transition_to(&self, next: &ConnectingState) -> bool {
        use ConnectingState::*;
        matches!(
            (self, next),
            (Inactive | Failed(_), Connecting)
                | (Connecting, Negotiating | Failed(_))
                | (Negotiating, Failed(_) | Connected(_))
                | (Connected(_), Failed(_) | Inactive)
        )
    }
}

impl std::fmt::Display for ConnectingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "Failed({})", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

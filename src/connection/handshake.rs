//! Post-link handshake.

use std::time::Duration;
use tracing::{debug, warn};

use crate::connection::services::{RunStateService, SystemService};
use crate::error::Result;
use crate::protocol::WatchInfo;

/// Upper bound for the whole handshake.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(20);

/// Runs the fixed handshake with a freshly linked watch.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeNegotiator {
    timeout: Duration,
}

impl Default for HandshakeNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeNegotiator {
    /// Create with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(NEGOTIATION_TIMEOUT)
    }

    /// Create with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Exchange versions, set the clock and wait for the running app.
    ///
    /// Returns `None` if any step fails or the timeout elapses. The run state
    /// wait is skipped when the watch runs its recovery firmware.
    pub async fn negotiate(
        &self,
        system: &dyn SystemService,
        run_state: &dyn RunStateService,
    ) -> Option<WatchInfo> {
        debug!("Negotiating with watch");
        match tokio::time::timeout(self.timeout, Self::steps(system, run_state)).await {
            Ok(Ok(info)) => {
                debug!("Negotiation complete: {}", info.running_fw_version);
                Some(info)
            }
            Ok(Err(e)) => {
                warn!("Negotiation failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Negotiation timed out after {:?}", self.timeout);
                None
            }
        }
    }

    async fn steps(system: &dyn SystemService, run_state: &dyn RunStateService) -> Result<WatchInfo> {
        system.wait_for_version_request().await?;
        debug!("Version requested");
        system.send_host_version().await?;
        let info = system.request_watch_version().await?;
        debug!("Watch info: {:?}", info);
        system.update_time().await?;

        if !info.running_fw_version.is_recovery {
            run_state.wait_for_initial_run_state().await?;
            debug!("Initial run state received");
        }
        Ok(info)
    }
}

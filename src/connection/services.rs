//! Service seams of a connected watch.
//!
//! Services are created per connection by a [`ServiceProvider`] and bundled
//! once the handshake completes. The bundles are plain structs of trait
//! objects.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::connection::scope::ConnectionScope;
use crate::error::Result;
use crate::protocol::{Endpoint, InboundMessage, PacketBus, WatchInfo};
use crate::transport::Transport;

/// Version exchange and clock sync.
#[async_trait]
pub trait SystemService: Send + Sync {
    /// Start listening for packets.
    fn init(&self, scope: &ConnectionScope);

    /// Wait for the watch to ask for the host version.
    async fn wait_for_version_request(&self) -> Result<()>;

    /// Answer with the host version.
    async fn send_host_version(&self) -> Result<()>;

    /// Request the watch's version and capabilities.
    async fn request_watch_version(&self) -> Result<WatchInfo>;

    /// Push the current time to the watch.
    async fn update_time(&self) -> Result<()>;
}

/// Which application is running on the watch.
#[async_trait]
pub trait RunStateService: Send + Sync {
    /// Start listening for packets.
    fn init(&self, scope: &ConnectionScope);

    /// Wait until the watch reports its running application.
    async fn wait_for_initial_run_state(&self) -> Result<()>;

    /// Running application, if known.
    fn running_app(&self) -> watch::Receiver<Option<Uuid>>;
}

/// Data logging sessions opened by watch apps.
pub trait DataLoggingService: Send + Sync {
    /// Start listening for packets.
    fn init(&self, scope: &ConnectionScope);

    /// Accept or reject new sessions.
    fn set_accept_sessions(&self, accept: bool);
}

/// Firmware updates.
#[async_trait]
pub trait FirmwareService: Send + Sync {
    /// Hardware platform of the connected watch.
    fn set_platform(&self, platform: Option<u8>);

    /// Install a firmware bundle.
    async fn update_firmware(&self, bundle: &Path) -> Result<()>;
}

/// Watch log retrieval.
#[async_trait]
pub trait LogService: Send + Sync {
    /// Gather logs into a file.
    async fn gather_logs(&self) -> Result<Option<PathBuf>>;
}

/// Core dump retrieval.
#[async_trait]
pub trait CoreDumpService: Send + Sync {
    /// Fetch the latest core dump.
    async fn core_dump(&self, unread_only: bool) -> Result<Option<PathBuf>>;
}

/// Raw protocol messages.
#[async_trait]
pub trait MessageService: Send + Sync {
    /// Send a payload to an endpoint.
    async fn send(&self, endpoint: Endpoint, payload: Bytes) -> Result<()>;

    /// Every inbound packet from now on.
    fn inbound(&self) -> broadcast::Receiver<InboundMessage>;
}

#[async_trait]
impl MessageService for PacketBus {
    async fn send(&self, endpoint: Endpoint, payload: Bytes) -> Result<()> {
        PacketBus::send(self, endpoint, &payload).await
    }

    fn inbound(&self) -> broadcast::Receiver<InboundMessage> {
        self.subscribe()
    }
}

/// Any further service brought up on a normal connection.
pub trait ProtocolService: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Start the service.
    fn init(&self, scope: &ConnectionScope);
}

/// Services every connection starts with.
#[derive(Clone)]
pub struct CoreServices {
    /// Version exchange and time.
    pub system: Arc<dyn SystemService>,
    /// Running application.
    pub run_state: Arc<dyn RunStateService>,
    /// Data logging.
    pub data_logging: Arc<dyn DataLoggingService>,
    /// Firmware updates.
    pub firmware: Arc<dyn FirmwareService>,
    /// Logs.
    pub logs: Arc<dyn LogService>,
    /// Core dumps.
    pub core_dump: Arc<dyn CoreDumpService>,
    /// Raw messages.
    pub messages: Arc<dyn MessageService>,
}

/// Services available while the watch is in recovery mode.
#[derive(Clone)]
pub struct RecoveryServices {
    /// Firmware updates.
    pub firmware: Arc<dyn FirmwareService>,
    /// Logs.
    pub logs: Arc<dyn LogService>,
    /// Core dumps.
    pub core_dump: Arc<dyn CoreDumpService>,
}

impl RecoveryServices {
    /// Pick the recovery subset.
    pub fn from_core(core: &CoreServices) -> Self {
        Self {
            firmware: core.firmware.clone(),
            logs: core.logs.clone(),
            core_dump: core.core_dump.clone(),
        }
    }
}

/// Services available on a normal connection.
#[derive(Clone)]
pub struct ConnectedServices {
    /// Version exchange and time.
    pub system: Arc<dyn SystemService>,
    /// Running application.
    pub run_state: Arc<dyn RunStateService>,
    /// Firmware updates.
    pub firmware: Arc<dyn FirmwareService>,
    /// Logs.
    pub logs: Arc<dyn LogService>,
    /// Core dumps.
    pub core_dump: Arc<dyn CoreDumpService>,
    /// Raw messages.
    pub messages: Arc<dyn MessageService>,
    /// Everything else.
    pub additional: Vec<Arc<dyn ProtocolService>>,
}

impl ConnectedServices {
    /// Assemble the full bundle.
    pub fn new(core: &CoreServices, additional: Vec<Arc<dyn ProtocolService>>) -> Self {
        Self {
            system: core.system.clone(),
            run_state: core.run_state.clone(),
            firmware: core.firmware.clone(),
            logs: core.logs.clone(),
            core_dump: core.core_dump.clone(),
            messages: core.messages.clone(),
            additional,
        }
    }
}

macro_rules! opaque_debug {
    ($($ty:ty),*) => {
        $(impl std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($ty)).finish_non_exhaustive()
            }
        })*
    };
}

opaque_debug!(CoreServices, RecoveryServices, ConnectedServices);

/// Creates the services of one connection.
pub trait ServiceProvider: Send + Sync {
    /// Services needed for the handshake, plus the recovery set.
    fn core_services(&self, transport: &Transport, bus: &PacketBus) -> CoreServices;

    /// Further services for a normal connection.
    fn additional_services(
        &self,
        core: &CoreServices,
        watch_info: &WatchInfo,
        previously_connected: bool,
    ) -> Result<Vec<Arc<dyn ProtocolService>>>;
}

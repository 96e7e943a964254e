//! Per-transport connection state machine.
//!
//! Sequences session establishment, the handshake and service bring-up for
//! one watch, and publishes its [`ConnectingState`] on a `watch` channel.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ble::session::{LiveChannel, TransportConnector};
use crate::connection::handshake::HandshakeNegotiator;
use crate::connection::scope::ConnectionScope;
use crate::connection::services::{ConnectedServices, RecoveryServices, ServiceProvider};
use crate::connection::state::{ConnectedState, ConnectingState};
use crate::error::ConnectionFailureReason;
use crate::protocol::{recovery_reason, EndpointDecoder, PacketBus, PacketDecoder, PacketFramer};
use crate::transport::Transport;

/// Drives one transport from `Inactive` to `Connected` or `Failed`.
pub struct ConnectionStateMachine {
    transport: Transport,
    connector: Arc<dyn TransportConnector>,
    services: Arc<dyn ServiceProvider>,
    negotiator: HandshakeNegotiator,
    decoder: Arc<dyn PacketDecoder>,
    state_tx: watch::Sender<ConnectingState>,
}

impl ConnectionStateMachine {
    /// Create an inactive state machine.
    pub fn new(
        transport: Transport,
        connector: Arc<dyn TransportConnector>,
        services: Arc<dyn ServiceProvider>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectingState::Inactive);
        Self {
            transport,
            connector,
            services,
            negotiator: HandshakeNegotiator::new(),
            decoder: Arc::new(EndpointDecoder),
            state_tx,
        }
    }

    /// Use a different handshake negotiator.
    pub fn with_negotiator(mut self, negotiator: HandshakeNegotiator) -> Self {
        self.negotiator = negotiator;
        self
    }

    /// Use a different packet decoder.
    pub fn with_decoder(mut self, decoder: Arc<dyn PacketDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// The transport this machine connects.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Current state.
    pub fn state(&self) -> ConnectingState {
        self.state_tx.borrow().clone()
    }

    /// Receiver of every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectingState> {
        self.state_tx.subscribe()
    }

    /// Run one connection attempt.
    ///
    /// Returns once the attempt reached `Connected` or `Failed`. If the link
    /// closes first, the sequence is cancelled and the attempt fails with
    /// [`ConnectionFailureReason::LinkLost`].
    pub async fn connect(&self, scope: &ConnectionScope, previously_connected: bool) {
        let link_closed = self.connector.link_closed();

        tokio::select! {
            biased;
            _ = link_closed.cancelled() => {
                let state = self.state();
                if state.is_active() && !state.is_connected() {
                    warn!("Link to {} lost while {}", self.transport, state);
                    self.transition(ConnectingState::Failed(ConnectionFailureReason::LinkLost));
                }
            }
            _ = self.run(scope, previously_connected) => {}
        }
    }

    /// Wait until the link has closed.
    pub async fn disconnected(&self) {
        self.connector.link_closed().cancelled().await;
        if self.state().is_connected() {
            info!("Disconnected from {}", self.transport);
            self.transition(ConnectingState::Inactive);
        }
    }

    /// Ask the link to close.
    pub async fn disconnect(&self) {
        debug!("Disconnect requested for {}", self.transport);
        self.connector.disconnect().await;
    }

    async fn run(&self, scope: &ConnectionScope, previously_connected: bool) {
        if !self.transition(ConnectingState::Connecting) {
            return;
        }

        let LiveChannel { inbound, outbound } = match self.connector.connect(scope).await {
            Ok(channel) => channel,
            Err(reason) => {
                self.fail(reason).await;
                return;
            }
        };
        self.transition(ConnectingState::Negotiating);

        let bus = PacketBus::new(outbound);
        let framer = PacketFramer::new(inbound, self.decoder.clone());
        scope.spawn("packet-framer", framer.run(bus.inbound_sender()));

        let core = self.services.core_services(&self.transport, &bus);
        core.system.init(scope);
        core.run_state.init(scope);
        core.data_logging.init(scope);

        let Some(watch_info) = self
            .negotiator
            .negotiate(core.system.as_ref(), core.run_state.as_ref())
            .await
        else {
            self.fail(ConnectionFailureReason::NegotiationFailed).await;
            return;
        };

        core.firmware.set_platform(watch_info.platform);
        core.data_logging.set_accept_sessions(true);

        if let Some(reason) = recovery_reason(&watch_info) {
            info!("{} connected in recovery mode ({:?})", self.transport, reason);
            self.transition(ConnectingState::Connected(ConnectedState::InRecovery {
                watch_info,
                services: RecoveryServices::from_core(&core),
            }));
            return;
        }

        let additional =
            match self
                .services
                .additional_services(&core, &watch_info, previously_connected)
            {
                Ok(additional) => additional,
                Err(e) => {
                    error!("Failed to start services for {}: {}", self.transport, e);
                    self.fail(ConnectionFailureReason::ServiceInit).await;
                    return;
                }
            };
        for service in &additional {
            debug!("Starting {}", service.name());
            service.init(scope);
        }

        info!("Connected to {} running {}", self.transport, watch_info.running_fw_version);
        self.transition(ConnectingState::Connected(ConnectedState::Normal {
            watch_info,
            services: ConnectedServices::new(&core, additional),
        }));
    }

    async fn fail(&self, reason: ConnectionFailureReason) {
        warn!("Connection to {} failed: {}", self.transport, reason);
        self.transition(ConnectingState::Failed(reason));
        self.connector.disconnect().await;
    }

    /// Move to `next`. Illegal transitions are rejected.
    fn transition(&self, next: ConnectingState) -> bool {
        let mut accepted = false;
        self.state_tx.send_if_modified(|current| {
            if !current.can_transition_to(&next) {
                error!(
                    "Illegal transition for {}: {} -> {}",
                    self.transport, current, next
                );
                return false;
            }
            debug!("{}: {} -> {}", self.transport, current, next);
            *current = next.clone();
            accepted = true;
            true
        });
        accepted
    }
}

impl std::fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("transport", &self.transport)
            .field("state", &self.state().name())
            .finish()
    }
}

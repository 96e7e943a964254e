//! BLE session establishment.
//!
//! [`BleSession`] owns one connection attempt to a watch: it opens the link,
//! checks the services, tunes connection parameters and MTU, reads the
//! connectivity status, reconciles pairing and finally starts the windowed
//! transport. The result is a [`LiveChannel`] carrying protocol bytes, or the
//! reason the attempt failed.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::ble::connection_params;
use crate::ble::connectivity::{ConnectivityWatcher, CONNECTIVITY_UPDATE_TIMEOUT};
use crate::ble::gatt::{ConnectedGattClient, GattConnector, GattWriteType};
use crate::ble::gatt_server::GattServerManager;
use crate::ble::mtu::Mtu;
use crate::ble::pairing::{pairing_required, BondingAgent, Pairing};
use crate::ble::uuids::{
    required_services, TRANSPORT_CLIENT_READ_UUID, TRANSPORT_CLIENT_SERVICE_UUID,
    TRANSPORT_CLIENT_WRITE_UUID,
};
use crate::config::{SessionConfig, DEFAULT_MTU};
use crate::connection::scope::ConnectionScope;
use crate::error::ConnectionFailureReason;
use crate::transport::Transport;

/// Bytes of ATT overhead per radio packet.
const ATT_HEADER_SIZE: u16 = 3;

/// Buffered capacity of the passthrough byte pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// A reliable byte channel to the watch.
pub struct LiveChannel {
    /// Bytes from the watch.
    pub inbound: Box<dyn AsyncRead + Send + Unpin>,
    /// Bytes to the watch.
    pub outbound: mpsc::Sender<Bytes>,
}

impl std::fmt::Debug for LiveChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveChannel").finish_non_exhaustive()
    }
}

/// Opens and closes the reliable byte channel for one transport.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Establish the channel. Background work is spawned into `scope`.
    async fn connect(
        &self,
        scope: &ConnectionScope,
    ) -> std::result::Result<LiveChannel, ConnectionFailureReason>;

    /// Tear the channel down. Safe to call at any point.
    async fn disconnect(&self);

    /// Cancelled once the underlying link has closed.
    fn link_closed(&self) -> CancellationToken;
}

/// Sends one radio packet of the windowed transport.
#[async_trait]
pub trait RadioPacketSink: Send + Sync {
    /// Returns false if the packet could not be sent.
    async fn send_packet(&self, packet: &[u8]) -> bool;
}

/// Writes radio packets to the watch's GATT server.
pub struct ClientPacketSink {
    client: Arc<dyn ConnectedGattClient>,
}

impl ClientPacketSink {
    /// Create over a connected client.
    pub fn new(client: Arc<dyn ConnectedGattClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RadioPacketSink for ClientPacketSink {
    async fn send_packet(&self, packet: &[u8]) -> bool {
        match self
            .client
            .write(
                TRANSPORT_CLIENT_SERVICE_UUID,
                TRANSPORT_CLIENT_WRITE_UUID,
                packet,
                GattWriteType::NoResponse,
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write transport packet: {}", e);
                false
            }
        }
    }
}

/// Notifies radio packets through the host's GATT server.
pub struct ServerPacketSink {
    server: Arc<GattServerManager>,
    address: String,
}

impl ServerPacketSink {
    /// Create for the device at `address`.
    pub fn new(server: Arc<GattServerManager>, address: impl Into<String>) -> Self {
        Self {
            server,
            address: address.into(),
        }
    }
}

#[async_trait]
impl RadioPacketSink for ServerPacketSink {
    async fn send_packet(&self, packet: &[u8]) -> bool {
        self.server.send(&self.address, packet).await
    }
}

/// Parameters handed to the windowed transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowedTransportParams {
    /// MTU before negotiation.
    pub initial_mtu: u16,
    /// Desired transmit window.
    pub tx_window: u8,
    /// Desired receive window.
    pub rx_window: u8,
    /// The watch hosts the GATT server.
    pub watch_as_gatt_server: bool,
    /// Log every packet.
    pub verbose_logging: bool,
}

impl WindowedTransportParams {
    /// Derive from the session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            initial_mtu: config.platform.initial_mtu.max(DEFAULT_MTU),
            tx_window: config.tx_window(),
            rx_window: config.rx_window(),
            watch_as_gatt_server: config.ble.watch_as_gatt_server,
            verbose_logging: config.ble.verbose_transport_logging,
        }
    }
}

/// The windowed reliable transport layered over radio packets.
#[async_trait]
pub trait WindowedTransport: Send + Sync {
    /// Apply a newly negotiated MTU.
    fn update_mtu(&self, mtu: u16);

    /// Start moving data. Tasks are spawned into `scope`.
    fn run(&self, scope: &ConnectionScope, sink: Arc<dyn RadioPacketSink>);

    /// Stop the transport.
    async fn close(&self);
}

/// A freshly created windowed transport and its endpoints.
pub struct WindowedLink {
    /// The transport.
    pub transport: Arc<dyn WindowedTransport>,
    /// Where radio packets from the watch are fed in.
    pub radio_inbound: mpsc::Sender<Vec<u8>>,
    /// The reliable channel the transport exposes upward.
    pub channel: LiveChannel,
}

/// Creates a windowed transport per connection attempt.
pub trait WindowedTransportFactory: Send + Sync {
    /// Create a transport for `transport`.
    fn create(&self, transport: &Transport, params: WindowedTransportParams) -> WindowedLink;
}

struct PassthroughPipes {
    radio_rx: mpsc::Receiver<Vec<u8>>,
    outbound_rx: mpsc::Receiver<Bytes>,
    writer: DuplexStream,
}

/// A windowed transport without windowing.
///
/// Radio packets are passed up unchanged and outbound bytes are split to
/// fit the MTU. Suitable for links that are already reliable.
pub struct PassthroughTransport {
    mtu: Arc<Mutex<u16>>,
    verbose: bool,
    pipes: Mutex<Option<PassthroughPipes>>,
    closed: CancellationToken,
}

impl PassthroughTransport {
    /// Create a transport and its endpoints.
    pub fn create(params: WindowedTransportParams) -> WindowedLink {
        let (radio_inbound, radio_rx) = mpsc::channel(100);
        let (outbound, outbound_rx) = mpsc::channel(100);
        let (reader, writer) = tokio::io::duplex(PIPE_CAPACITY);

        let transport = Arc::new(Self {
            mtu: Arc::new(Mutex::new(params.initial_mtu)),
            verbose: params.verbose_logging,
            pipes: Mutex::new(Some(PassthroughPipes {
                radio_rx,
                outbound_rx,
                writer,
            })),
            closed: CancellationToken::new(),
        });

        WindowedLink {
            transport,
            radio_inbound,
            channel: LiveChannel {
                inbound: Box::new(reader),
                outbound,
            },
        }
    }

    /// Current MTU.
    pub fn mtu(&self) -> u16 {
        *self.mtu.lock()
    }
}

/// Largest radio packet payload for `mtu`.
fn max_chunk(mtu: u16) -> usize {
    usize::from(mtu.saturating_sub(ATT_HEADER_SIZE).max(1))
}

#[async_trait]
impl WindowedTransport for PassthroughTransport {
    fn update_mtu(&self, mtu: u16) {
        debug!("Transport MTU: {}", mtu);
        *self.mtu.lock() = mtu;
    }

    fn run(&self, scope: &ConnectionScope, sink: Arc<dyn RadioPacketSink>) {
        let Some(pipes) = self.pipes.lock().take() else {
            warn!("Transport already running");
            return;
        };
        let PassthroughPipes {
            mut radio_rx,
            mut outbound_rx,
            mut writer,
        } = pipes;

        let verbose = self.verbose;
        let closed = self.closed.clone();
        scope.spawn("transport-inbound", async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    packet = radio_rx.recv() => {
                        let Some(packet) = packet else { break };
                        if verbose {
                            trace!("radio in: {:02X?}", packet);
                        }
                        if let Err(e) = writer.write_all(&packet).await {
                            warn!("Inbound pipe closed: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        let closed = self.closed.clone();
        let mtu = self.mtu.clone();
        scope.spawn("transport-outbound", async move {
            loop {
                tokio::select! {
                    _ = closed.cancelled() => break,
                    bytes = outbound_rx.recv() => {
                        let Some(bytes) = bytes else { break };
                        let chunk = max_chunk(*mtu.lock());
                        for piece in bytes.chunks(chunk) {
                            if verbose {
                                trace!("radio out: {:02X?}", piece);
                            }
                            if !sink.send_packet(piece).await {
                                warn!("Dropped outbound radio packet");
                            }
                        }
                    }
                }
            }
        });
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Factory for [`PassthroughTransport`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTransportFactory;

impl WindowedTransportFactory for PassthroughTransportFactory {
    fn create(&self, _transport: &Transport, params: WindowedTransportParams) -> WindowedLink {
        PassthroughTransport::create(params)
    }
}

/// One BLE connection attempt.
pub struct BleSession {
    transport: Transport,
    config: SessionConfig,
    connector: Arc<dyn GattConnector>,
    gatt_server: Arc<GattServerManager>,
    bonding: Arc<dyn BondingAgent>,
    windowed_factory: Arc<dyn WindowedTransportFactory>,
    mtu: Mtu,
    connectivity: ConnectivityWatcher,
    windowed: RwLock<Option<Arc<dyn WindowedTransport>>>,
}

impl BleSession {
    /// Create a session for `transport`.
    pub fn new(
        transport: Transport,
        config: SessionConfig,
        connector: Arc<dyn GattConnector>,
        gatt_server: Arc<GattServerManager>,
        bonding: Arc<dyn BondingAgent>,
        windowed_factory: Arc<dyn WindowedTransportFactory>,
    ) -> Self {
        let mtu = Mtu::new(&config.platform);
        Self {
            transport,
            config,
            connector,
            gatt_server,
            bonding,
            windowed_factory,
            mtu,
            connectivity: ConnectivityWatcher::new(),
            windowed: RwLock::new(None),
        }
    }

    /// The transport of this session.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Connectivity status of the watch.
    pub fn connectivity(&self) -> &ConnectivityWatcher {
        &self.connectivity
    }

    /// MTU of the link.
    pub fn mtu(&self) -> &Mtu {
        &self.mtu
    }

    async fn establish(
        &self,
        scope: &ConnectionScope,
    ) -> std::result::Result<LiveChannel, ConnectionFailureReason> {
        let watch_as_server = self.config.ble.watch_as_gatt_server;
        debug!("Connecting to {} (watch as GATT server: {})", self.transport, watch_as_server);

        let WindowedLink {
            transport: windowed,
            radio_inbound,
            channel,
        } = self
            .windowed_factory
            .create(&self.transport, WindowedTransportParams::from_config(&self.config));
        *self.windowed.write() = Some(windowed.clone());

        // Inbound data needs a destination as soon as the link exists.
        if !watch_as_server && !self.gatt_server.register(&self.transport, radio_inbound.clone()) {
            return Err(ConnectionFailureReason::RegisterGattServer);
        }

        let client = self.connector.connect().await?;

        let services = client.discover_services().await.map_err(|e| {
            error!("Service discovery failed: {}", e);
            ConnectionFailureReason::ServicesMissing
        })?;
        debug!("Discovered {} services", services.len());

        let mut required = required_services().to_vec();
        if watch_as_server {
            required.push(TRANSPORT_CLIENT_SERVICE_UUID);
        }
        if let Some(missing) = required
            .iter()
            .find(|uuid| !services.iter().any(|s| s.uuid == **uuid))
        {
            error!("Required service {} missing", missing);
            return Err(ConnectionFailureReason::ServicesMissing);
        }

        if let Err(e) = connection_params::subscribe_and_configure(&client, scope).await {
            // Older firmware lacks the characteristic.
            info!("Error setting up connection params: {}", e);
        }

        let mut mtu_rx = self.mtu.subscribe();
        let mtu_target = windowed.clone();
        scope.spawn("mtu-forward", async move {
            loop {
                let mtu = *mtu_rx.borrow_and_update();
                mtu_target.update_mtu(mtu);
                if mtu_rx.changed().await.is_err() {
                    break;
                }
            }
        });
        self.mtu.update(&client, self.config.requested_mtu()).await?;
        debug!("MTU is {}", self.mtu.current());

        if let Err(e) = self.connectivity.subscribe(&client, scope).await {
            error!("Failed to subscribe to connectivity: {}", e);
            return Err(ConnectionFailureReason::SubscribeConnectivity);
        }
        let Some(status) = self
            .connectivity
            .first_status(CONNECTIVITY_UPDATE_TIMEOUT)
            .await
        else {
            error!("No connectivity status from {}", self.transport);
            return Err(ConnectionFailureReason::ConnectionStatus);
        };
        debug!("Connectivity status: {:?}", status);

        let pairing = Pairing::new(
            self.transport.clone(),
            self.config.clone(),
            self.bonding.clone(),
        );
        if pairing_required(status.paired, pairing.host_bonded().await) {
            pairing
                .request_pairing(&client, &status, self.connectivity.status())
                .await?;
        }

        let sink: Arc<dyn RadioPacketSink> = if watch_as_server {
            let mut packets = client
                .subscribe(TRANSPORT_CLIENT_SERVICE_UUID, TRANSPORT_CLIENT_READ_UUID)
                .await
                .map_err(|e| {
                    error!("Failed to subscribe to transport: {}", e);
                    ConnectionFailureReason::LinkFailed
                })?;
            scope.spawn("transport-client-read", async move {
                while let Some(Ok(packet)) = packets.next().await {
                    if radio_inbound.send(packet).await.is_err() {
                        break;
                    }
                }
            });
            Arc::new(ClientPacketSink::new(client.clone()))
        } else {
            Arc::new(ServerPacketSink::new(
                self.gatt_server.clone(),
                self.transport.identifier(),
            ))
        };

        windowed.run(scope, sink);
        info!("Session established with {}", self.transport);
        Ok(channel)
    }
}

#[async_trait]
impl TransportConnector for BleSession {
    async fn connect(
        &self,
        scope: &ConnectionScope,
    ) -> std::result::Result<LiveChannel, ConnectionFailureReason> {
        self.establish(scope).await.map_err(|reason| {
            warn!("Session with {} failed: {}", self.transport, reason);
            reason
        })
    }

    async fn disconnect(&self) {
        debug!("Disconnecting session with {}", self.transport);
        let windowed = self.windowed.write().take();
        if let Some(windowed) = windowed {
            windowed.close().await;
        }
        self.connector.disconnect().await;
        self.gatt_server.unregister(&self.transport);
        if self.config.platform.reset_transport_state_on_disconnect {
            self.gatt_server.reset();
        }
    }

    fn link_closed(&self) -> CancellationToken {
        self.connector.link_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{
        CONNECTION_PARAMETERS_CHARACTERISTIC_UUID, CONNECTIVITY_CHARACTERISTIC_UUID,
        PAIRING_SERVICE_UUID, PAIRING_TRIGGER_CHARACTERISTIC_UUID,
    };
    use crate::config::LibConfig;
    use crate::testing::{
        FakeBondingAgent, FakeConnector, FakeGattClient, FakeGattServerBackend,
        FakeWindowedFactory,
    };
    use tokio::io::AsyncReadExt;

    struct Harness {
        fake: Arc<FakeGattClient>,
        connector: Arc<FakeConnector>,
        server: Arc<GattServerManager>,
        agent: Arc<FakeBondingAgent>,
        windowed: Arc<FakeWindowedFactory>,
        session: BleSession,
        scope: ConnectionScope,
    }

    fn transport() -> Transport {
        Transport::ble("AA:BB:CC:DD:EE:FF", "Pebble Time 1A2B")
    }

    fn harness_with(config: LibConfig, bonded: bool) -> Harness {
        let fake = FakeGattClient::watch();
        let connector = Arc::new(FakeConnector::new(fake.clone()));
        let server = Arc::new(GattServerManager::with_backend(Arc::new(
            FakeGattServerBackend::default(),
        )));
        let agent = Arc::new(FakeBondingAgent::new(bonded));
        agent.bond_on_request();
        let windowed = Arc::new(FakeWindowedFactory::default());
        let session = BleSession::new(
            transport(),
            config.session(),
            connector.clone(),
            server.clone(),
            agent.clone(),
            windowed.clone(),
        );
        Harness {
            fake,
            connector,
            server,
            agent,
            windowed,
            session,
            scope: ConnectionScope::detached(transport()),
        }
    }

    fn harness(bonded: bool) -> Harness {
        harness_with(LibConfig::default(), bonded)
    }

    #[tokio::test]
    async fn test_paired_and_bonded_skips_pairing() {
        let h = harness(true);
        h.fake.set_read(CONNECTIVITY_CHARACTERISTIC_UUID, vec![0x03, 0, 0, 0]);

        let channel = h.session.connect(&h.scope).await;
        assert!(channel.is_ok());
        assert!(h.fake.writes(PAIRING_TRIGGER_CHARACTERISTIC_UUID).is_empty());
        assert_eq!(h.agent.bond_requests(), 0);
        assert!(h.server.is_registered(&transport()));
        assert!(h.windowed.last().unwrap().is_running());
        h.scope.close();
    }

    #[tokio::test]
    async fn test_paired_without_host_bond_runs_pairing() {
        let h = harness(false);
        h.fake.set_read(CONNECTIVITY_CHARACTERISTIC_UUID, vec![0x03, 0, 0, 0]);

        assert!(h.session.connect(&h.scope).await.is_ok());
        assert_eq!(h.fake.writes(PAIRING_TRIGGER_CHARACTERISTIC_UUID).len(), 1);
        h.scope.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_link_bond_completes_pairing() {
        let fake = FakeGattClient::watch();
        // connected, paired and encrypted
        fake.set_read(CONNECTIVITY_CHARACTERISTIC_UUID, vec![0x07, 0, 0, 0]);
        let agent = Arc::new(crate::ble::ConnectivityBondingAgent::new());
        let session = BleSession::new(
            transport(),
            LibConfig::default().session(),
            Arc::new(FakeConnector::new(fake.clone())),
            Arc::new(GattServerManager::with_backend(Arc::new(
                FakeGattServerBackend::default(),
            ))),
            agent.clone(),
            Arc::new(FakeWindowedFactory::default()),
        );
        let scope = ConnectionScope::detached(transport());

        assert!(session.connect(&scope).await.is_ok());
        assert_eq!(fake.writes(PAIRING_TRIGGER_CHARACTERISTIC_UUID).len(), 1);
        assert!(agent.is_bonded(&transport()).await);
        scope.close();
    }

    #[tokio::test]
    async fn test_closed_gatt_server_fails_registration() {
        let h = harness(true);
        h.server.close();

        assert_eq!(
            h.session.connect(&h.scope).await.unwrap_err(),
            ConnectionFailureReason::RegisterGattServer
        );
        assert_eq!(h.connector.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_link_failure_is_returned() {
        let h = harness(true);
        h.connector.fail_with(ConnectionFailureReason::LinkFailed);

        assert_eq!(
            h.session.connect(&h.scope).await.unwrap_err(),
            ConnectionFailureReason::LinkFailed
        );
    }

    #[tokio::test]
    async fn test_missing_pairing_service() {
        let h = harness(true);
        h.fake.remove_service(PAIRING_SERVICE_UUID);

        assert_eq!(
            h.session.connect(&h.scope).await.unwrap_err(),
            ConnectionFailureReason::ServicesMissing
        );
    }

    #[tokio::test]
    async fn test_missing_connection_params_is_not_fatal() {
        let h = harness(true);
        h.fake.remove_characteristic(CONNECTION_PARAMETERS_CHARACTERISTIC_UUID);
        h.fake.set_read(CONNECTIVITY_CHARACTERISTIC_UUID, vec![0x03, 0, 0, 0]);

        assert!(h.session.connect(&h.scope).await.is_ok());
        h.scope.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_connectivity_status() {
        let h = harness(true);

        assert_eq!(
            h.session.connect(&h.scope).await.unwrap_err(),
            ConnectionFailureReason::ConnectionStatus
        );
        h.scope.close();
    }

    #[tokio::test]
    async fn test_mtu_reaches_windowed_transport() {
        let h = harness(true);
        h.fake.set_mtu(185);
        h.fake.set_read(CONNECTIVITY_CHARACTERISTIC_UUID, vec![0x03, 0, 0, 0]);

        h.session.connect(&h.scope).await.unwrap();
        let windowed = h.windowed.last().unwrap();
        for _ in 0..10 {
            if windowed.mtus().contains(&185) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(windowed.mtus().contains(&185));
        h.scope.close();
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_and_resets() {
        let mut config = LibConfig::default();
        config.platform.reset_transport_state_on_disconnect = true;
        let h = harness_with(config, true);
        h.fake.set_read(CONNECTIVITY_CHARACTERISTIC_UUID, vec![0x03, 0, 0, 0]);
        h.session.connect(&h.scope).await.unwrap();

        let other = Transport::ble("11:22:33:44:55:66", "Other");
        let (tx, _rx) = mpsc::channel(1);
        h.server.register(&other, tx);

        h.session.disconnect().await;
        assert!(!h.server.is_registered(&transport()));
        assert!(!h.server.is_registered(&other));
        assert!(h.windowed.last().unwrap().is_closed());
        assert!(h.session.link_closed().is_cancelled());
        h.scope.close();
    }

    #[tokio::test]
    async fn test_client_role_forwards_transport_notifications() {
        let mut config = LibConfig::default();
        config.ble.watch_as_gatt_server = true;
        let h = harness_with(config, true);
        h.fake.set_read(CONNECTIVITY_CHARACTERISTIC_UUID, vec![0x03, 0, 0, 0]);

        h.session.connect(&h.scope).await.unwrap();
        assert!(!h.server.is_registered(&transport()));

        h.fake.notify(TRANSPORT_CLIENT_READ_UUID, vec![0xAB]);
        let received = h.windowed.last().unwrap().next_radio_packet().await;
        assert_eq!(received, Some(vec![0xAB]));
        h.scope.close();
    }

    #[tokio::test]
    async fn test_passthrough_moves_bytes() {
        let scope = ConnectionScope::detached(transport());
        let params = WindowedTransportParams::from_config(&LibConfig::default().session());
        let WindowedLink {
            transport: windowed,
            radio_inbound,
            mut channel,
        } = PassthroughTransport::create(params);

        let server = Arc::new(GattServerManager::with_backend(Arc::new(
            FakeGattServerBackend::default(),
        )));
        windowed.run(&scope, Arc::new(ServerPacketSink::new(server, "AA")));

        radio_inbound.send(vec![1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 3];
        channel.inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3]);

        windowed.close().await;
        scope.close();
    }

    struct RecordingSink(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl RadioPacketSink for RecordingSink {
        async fn send_packet(&self, packet: &[u8]) -> bool {
            self.0.send(packet.to_vec()).is_ok()
        }
    }

    #[tokio::test]
    async fn test_passthrough_follows_mtu_after_start() {
        let scope = ConnectionScope::detached(transport());
        let params = WindowedTransportParams::from_config(&LibConfig::default().session());
        let WindowedLink {
            transport: windowed,
            channel,
            ..
        } = PassthroughTransport::create(params);
        let (tx, mut packets) = mpsc::unbounded_channel();
        windowed.run(&scope, Arc::new(RecordingSink(tx)));

        channel.outbound.send(Bytes::from(vec![0u8; 40])).await.unwrap();
        assert_eq!(packets.recv().await.unwrap().len(), 20);
        assert_eq!(packets.recv().await.unwrap().len(), 20);

        windowed.update_mtu(103);
        channel.outbound.send(Bytes::from(vec![0u8; 100])).await.unwrap();
        assert_eq!(packets.recv().await.unwrap().len(), 100);

        windowed.close().await;
        scope.close();
    }
}

//! In-memory fakes for the collaborator seams.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ble::connectivity::ConnectivityStatus;
use crate::ble::gatt::{
    find_characteristic, CharacteristicProperties, ConnectedGattClient, GattCharacteristic,
    GattConnector, GattService, GattWriteType, NotificationStream,
};
use crate::ble::gatt_server::{GattServerBackend, GattServerManager};
use crate::ble::pairing::{BondState, BondingAgent};
use crate::ble::session::{
    BleSession, LiveChannel, PassthroughTransportFactory, RadioPacketSink, TransportConnector,
    WindowedLink, WindowedTransport, WindowedTransportFactory, WindowedTransportParams,
};
use crate::ble::uuids::{
    CONNECTION_PARAMETERS_CHARACTERISTIC_UUID, CONNECTIVITY_CHARACTERISTIC_UUID,
    MTU_CHARACTERISTIC_UUID, PAIRING_SERVICE_UUID, PAIRING_TRIGGER_CHARACTERISTIC_UUID,
    TRANSPORT_CLIENT_READ_UUID, TRANSPORT_CLIENT_SERVICE_UUID, TRANSPORT_CLIENT_WRITE_UUID,
};
use crate::config::{LibConfig, DEFAULT_MTU};
use crate::connection::{
    ConnectedServices, ConnectionScope, ConnectionStateMachine, CoreDumpService, CoreServices,
    DataLoggingService, FirmwareService, LogService, ProtocolService, RecoveryServices,
    RunStateService, ServiceProvider, SystemService,
};
use crate::error::{ConnectionFailureReason, Error, Result};
use crate::protocol::firmware::tests::watch_info;
use crate::protocol::{FirmwareVersion, PacketBus, WatchInfo};
use crate::registry::factory::ConnectionFactory;
use crate::transport::Transport;

fn characteristic(uuid: Uuid, properties: CharacteristicProperties) -> GattCharacteristic {
    GattCharacteristic { uuid, properties }
}

/// A watch's GATT server.
pub struct FakeGattClient {
    services: RwLock<Vec<GattService>>,
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    read_counts: Mutex<HashMap<Uuid, usize>>,
    writes: Mutex<HashMap<Uuid, Vec<(Vec<u8>, GattWriteType)>>>,
    notifiers: Mutex<HashMap<Uuid, broadcast::Sender<Vec<u8>>>>,
    mtu: Mutex<u16>,
    requested_mtu: Mutex<Option<u16>>,
    fail_mtu_request: AtomicBool,
}

impl FakeGattClient {
    /// A watch exposing the pairing and transport client services.
    pub fn watch() -> Arc<Self> {
        use CharacteristicProperties as P;
        let services = vec![
            GattService {
                uuid: PAIRING_SERVICE_UUID,
                characteristics: vec![
                    characteristic(CONNECTIVITY_CHARACTERISTIC_UUID, P::READ | P::NOTIFY),
                    characteristic(PAIRING_TRIGGER_CHARACTERISTIC_UUID, P::READ | P::WRITE),
                    characteristic(CONNECTION_PARAMETERS_CHARACTERISTIC_UUID, P::WRITE | P::NOTIFY),
                    characteristic(MTU_CHARACTERISTIC_UUID, P::READ | P::NOTIFY),
                ],
            },
            GattService {
                uuid: TRANSPORT_CLIENT_SERVICE_UUID,
                characteristics: vec![
                    characteristic(TRANSPORT_CLIENT_READ_UUID, P::NOTIFY),
                    characteristic(TRANSPORT_CLIENT_WRITE_UUID, P::WRITE_NO_RESPONSE),
                ],
            },
        ];

        Arc::new(Self {
            services: RwLock::new(services),
            values: Mutex::new(HashMap::new()),
            read_counts: Mutex::new(HashMap::new()),
            writes: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
            mtu: Mutex::new(DEFAULT_MTU),
            requested_mtu: Mutex::new(None),
            fail_mtu_request: AtomicBool::new(false),
        })
    }

    pub fn set_read(&self, uuid: Uuid, value: Vec<u8>) {
        self.values.lock().insert(uuid, value);
    }

    pub fn notify(&self, uuid: Uuid, value: Vec<u8>) {
        let _ = self.notifier(uuid).send(value);
    }

    pub fn set_mtu(&self, mtu: u16) {
        *self.mtu.lock() = mtu;
    }

    pub fn requested_mtu(&self) -> Option<u16> {
        *self.requested_mtu.lock()
    }

    pub fn fail_mtu_request(&self) {
        self.fail_mtu_request.store(true, Ordering::SeqCst);
    }

    pub fn writes(&self, uuid: Uuid) -> Vec<(Vec<u8>, GattWriteType)> {
        self.writes.lock().get(&uuid).cloned().unwrap_or_default()
    }

    pub fn reads(&self, uuid: Uuid) -> usize {
        self.read_counts.lock().get(&uuid).copied().unwrap_or(0)
    }

    pub fn remove_characteristic(&self, uuid: Uuid) {
        for service in self.services.write().iter_mut() {
            service.characteristics.retain(|c| c.uuid != uuid);
        }
    }

    pub fn remove_service(&self, uuid: Uuid) {
        self.services.write().retain(|s| s.uuid != uuid);
    }

    pub fn set_properties(&self, uuid: Uuid, properties: CharacteristicProperties) {
        for service in self.services.write().iter_mut() {
            for c in service.characteristics.iter_mut().filter(|c| c.uuid == uuid) {
                c.properties = properties;
            }
        }
    }

    fn notifier(&self, uuid: Uuid) -> broadcast::Sender<Vec<u8>> {
        self.notifiers
            .lock()
            .entry(uuid)
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    fn check(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let services = self.services.read();
        match find_characteristic(&services, &service, &characteristic) {
            Some(_) => Ok(()),
            None => Err(Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ConnectedGattClient for FakeGattClient {
    async fn discover_services(&self) -> Result<Vec<GattService>> {
        Ok(self.services())
    }

    fn services(&self) -> Vec<GattService> {
        self.services.read().clone()
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream> {
        self.check(service, characteristic)?;
        let rx = self.notifier(characteristic).subscribe();
        Ok(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(value) => return Some((Ok::<_, Error>(value), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        self.check(service, characteristic)?;
        *self.read_counts.lock().entry(characteristic).or_insert(0) += 1;
        self.values
            .lock()
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| Error::InvalidData {
                context: format!("no value for {}", characteristic),
            })
    }

    async fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: GattWriteType,
    ) -> Result<()> {
        self.check(service, characteristic)?;
        self.writes
            .lock()
            .entry(characteristic)
            .or_default()
            .push((value.to_vec(), write_type));
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16> {
        if self.fail_mtu_request.load(Ordering::SeqCst) {
            return Err(Error::Timeout);
        }
        *self.requested_mtu.lock() = Some(mtu);
        Ok(*self.mtu.lock())
    }

    async fn mtu(&self) -> Result<u16> {
        Ok(*self.mtu.lock())
    }
}

/// Opens a link to a [`FakeGattClient`].
pub struct FakeConnector {
    client: Arc<FakeGattClient>,
    failure: Mutex<Option<ConnectionFailureReason>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    ignore_disconnect: AtomicBool,
    link_closed: CancellationToken,
}

impl FakeConnector {
    pub fn new(client: Arc<FakeGattClient>) -> Self {
        Self {
            client,
            failure: Mutex::new(None),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            ignore_disconnect: AtomicBool::new(false),
            link_closed: CancellationToken::new(),
        }
    }

    pub fn fail_with(&self, reason: ConnectionFailureReason) {
        *self.failure.lock() = Some(reason);
    }

    /// Keep the link open when asked to disconnect.
    pub fn ignore_disconnect(&self) {
        self.ignore_disconnect.store(true, Ordering::SeqCst);
    }

    /// The watch drops the link.
    pub fn drop_link(&self) {
        self.link_closed.cancel();
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GattConnector for FakeConnector {
    async fn connect(
        &self,
    ) -> std::result::Result<Arc<dyn ConnectedGattClient>, ConnectionFailureReason> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = *self.failure.lock() {
            return Err(reason);
        }
        Ok(self.client.clone())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_disconnect.load(Ordering::SeqCst) {
            self.link_closed.cancel();
        }
    }

    fn link_closed(&self) -> CancellationToken {
        self.link_closed.clone()
    }
}

/// Host bond records under test control.
pub struct FakeBondingAgent {
    bonded: AtomicBool,
    bond_on_request: AtomicBool,
    refuse: AtomicBool,
    requests: AtomicUsize,
    pending: Mutex<Vec<BondState>>,
    events: broadcast::Sender<BondState>,
}

impl FakeBondingAgent {
    pub fn new(bonded: bool) -> Self {
        Self {
            bonded: AtomicBool::new(bonded),
            bond_on_request: AtomicBool::new(false),
            refuse: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            pending: Mutex::new(Vec::new()),
            events: broadcast::channel(16).0,
        }
    }

    /// Report `Bonded` as soon as a bond is requested.
    pub fn bond_on_request(&self) {
        self.bond_on_request.store(true, Ordering::SeqCst);
    }

    /// Fail every bond request.
    pub fn refuse_bond(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Emit `state` first on the next event stream.
    pub fn queue_event(&self, state: BondState) {
        self.pending.lock().push(state);
    }

    pub fn bond_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BondingAgent for FakeBondingAgent {
    async fn is_bonded(&self, _transport: &Transport) -> bool {
        self.bonded.load(Ordering::SeqCst)
    }

    async fn create_bond(&self, _transport: &Transport) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        if self.bond_on_request.load(Ordering::SeqCst) {
            self.bonded.store(true, Ordering::SeqCst);
            let _ = self.events.send(BondState::Bonded);
        }
        true
    }

    fn bond_events(
        &self,
        _transport: &Transport,
        _connectivity: watch::Receiver<Option<ConnectivityStatus>>,
    ) -> BoxStream<'static, BondState> {
        let pending = std::mem::take(&mut *self.pending.lock());
        let rx = self.events.subscribe();
        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(state) => return Some((state, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        stream::iter(pending).chain(live).boxed()
    }
}

/// Platform GATT server that accepts every notification.
#[derive(Default)]
pub struct FakeGattServerBackend;

#[async_trait]
impl GattServerBackend for FakeGattServerBackend {
    async fn send_data(
        &self,
        _address: &str,
        _service: Uuid,
        _characteristic: Uuid,
        _data: &[u8],
    ) -> bool {
        true
    }
}

/// Windowed transport that records what the session does with it.
pub struct FakeWindowedTransport {
    mtus: Mutex<Vec<u16>>,
    running: AtomicBool,
    closed: AtomicBool,
    radio_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    _watch_side: DuplexStream,
}

impl FakeWindowedTransport {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mtus(&self) -> Vec<u16> {
        self.mtus.lock().clone()
    }

    /// Next radio packet fed in from the watch.
    pub async fn next_radio_packet(&self) -> Option<Vec<u8>> {
        self.radio_rx.lock().await.recv().await
    }
}

#[async_trait]
impl WindowedTransport for FakeWindowedTransport {
    fn update_mtu(&self, mtu: u16) {
        self.mtus.lock().push(mtu);
    }

    fn run(&self, _scope: &ConnectionScope, _sink: Arc<dyn RadioPacketSink>) {
        self.running.store(true, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeWindowedFactory {
    created: Mutex<Vec<Arc<FakeWindowedTransport>>>,
}

impl FakeWindowedFactory {
    pub fn last(&self) -> Option<Arc<FakeWindowedTransport>> {
        self.created.lock().last().cloned()
    }
}

impl WindowedTransportFactory for FakeWindowedFactory {
    fn create(&self, _transport: &Transport, _params: WindowedTransportParams) -> WindowedLink {
        let (radio_inbound, radio_rx) = mpsc::channel(16);
        let (outbound, _outbound_rx) = mpsc::channel(16);
        let (host_side, watch_side) = tokio::io::duplex(1024);

        let transport = Arc::new(FakeWindowedTransport {
            mtus: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            radio_rx: tokio::sync::Mutex::new(radio_rx),
            _watch_side: watch_side,
        });
        self.created.lock().push(transport.clone());

        WindowedLink {
            transport,
            radio_inbound,
            channel: LiveChannel {
                inbound: Box::new(host_side),
                outbound,
            },
        }
    }
}

/// Reliable byte channel whose watch side the test drives.
pub struct FakeTransportConnector {
    failure: Mutex<Option<ConnectionFailureReason>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    link_closed: CancellationToken,
    watch_side: tokio::sync::Mutex<Option<DuplexStream>>,
    outbound_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl FakeTransportConnector {
    pub fn new() -> Self {
        Self {
            failure: Mutex::new(None),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            link_closed: CancellationToken::new(),
            watch_side: tokio::sync::Mutex::new(None),
            outbound_rx: tokio::sync::Mutex::new(None),
        }
    }

    pub fn fail_with(&self, reason: ConnectionFailureReason) {
        *self.failure.lock() = Some(reason);
    }

    pub fn drop_link(&self) {
        self.link_closed.cancel();
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Write bytes as if sent by the watch.
    pub async fn inject(&self, bytes: &[u8]) {
        let mut guard = self.watch_side.lock().await;
        let writer = guard.as_mut().expect("not connected");
        writer.write_all(bytes).await.expect("pipe closed");
    }

    /// Next frame the host sent.
    pub async fn next_outbound(&self) -> Option<Bytes> {
        let mut guard = self.outbound_rx.lock().await;
        guard.as_mut()?.recv().await
    }
}

#[async_trait]
impl TransportConnector for FakeTransportConnector {
    async fn connect(
        &self,
        _scope: &ConnectionScope,
    ) -> std::result::Result<LiveChannel, ConnectionFailureReason> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = *self.failure.lock() {
            return Err(reason);
        }

        let (host_side, watch_side) = tokio::io::duplex(4096);
        let (outbound, outbound_rx) = mpsc::channel(16);
        *self.watch_side.lock().await = Some(watch_side);
        *self.outbound_rx.lock().await = Some(outbound_rx);

        Ok(LiveChannel {
            inbound: Box::new(host_side),
            outbound,
        })
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.link_closed.cancel();
    }

    fn link_closed(&self) -> CancellationToken {
        self.link_closed.clone()
    }
}

/// Handshake steps in the order a fake watch saw them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    VersionRequest,
    HostVersion,
    WatchVersion,
    Time,
    RunState,
}

struct ServiceHub {
    watch_info: Mutex<WatchInfo>,
    steps: Mutex<Vec<HandshakeStep>>,
    initialized: Mutex<Vec<&'static str>>,
    stall_run_state: AtomicBool,
    fail_watch_version: AtomicBool,
    fail_additional: AtomicBool,
    platform: Mutex<Option<u8>>,
    accepting_sessions: AtomicBool,
    previously_connected: Mutex<Option<bool>>,
    running_app: watch::Sender<Option<Uuid>>,
}

impl ServiceHub {
    fn step(&self, step: HandshakeStep) {
        self.steps.lock().push(step);
    }

    fn initialized(&self, name: &'static str) {
        self.initialized.lock().push(name);
    }
}

#[async_trait]
impl SystemService for ServiceHub {
    fn init(&self, _scope: &ConnectionScope) {
        self.initialized("system");
    }

    async fn wait_for_version_request(&self) -> Result<()> {
        self.step(HandshakeStep::VersionRequest);
        Ok(())
    }

    async fn send_host_version(&self) -> Result<()> {
        self.step(HandshakeStep::HostVersion);
        Ok(())
    }

    async fn request_watch_version(&self) -> Result<WatchInfo> {
        if self.fail_watch_version.load(Ordering::SeqCst) {
            return Err(Error::Timeout);
        }
        self.step(HandshakeStep::WatchVersion);
        Ok(self.watch_info.lock().clone())
    }

    async fn update_time(&self) -> Result<()> {
        self.step(HandshakeStep::Time);
        Ok(())
    }
}

#[async_trait]
impl RunStateService for ServiceHub {
    fn init(&self, _scope: &ConnectionScope) {
        self.initialized("run_state");
    }

    async fn wait_for_initial_run_state(&self) -> Result<()> {
        if self.stall_run_state.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.step(HandshakeStep::RunState);
        self.running_app.send_replace(Some(Uuid::nil()));
        Ok(())
    }

    fn running_app(&self) -> watch::Receiver<Option<Uuid>> {
        self.running_app.subscribe()
    }
}

impl DataLoggingService for ServiceHub {
    fn init(&self, _scope: &ConnectionScope) {
        self.initialized("data_logging");
    }

    fn set_accept_sessions(&self, accept: bool) {
        self.accepting_sessions.store(accept, Ordering::SeqCst);
    }
}

#[async_trait]
impl FirmwareService for ServiceHub {
    fn set_platform(&self, platform: Option<u8>) {
        *self.platform.lock() = platform;
    }

    async fn update_firmware(&self, _bundle: &Path) -> Result<()> {
        Err(Error::NotSupported {
            operation: "firmware update".to_string(),
        })
    }
}

#[async_trait]
impl LogService for ServiceHub {
    async fn gather_logs(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

#[async_trait]
impl CoreDumpService for ServiceHub {
    async fn core_dump(&self, _unread_only: bool) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

struct FakeProtocolService {
    hub: Arc<ServiceHub>,
}

impl ProtocolService for FakeProtocolService {
    fn name(&self) -> &str {
        "fake"
    }

    fn init(&self, _scope: &ConnectionScope) {
        self.hub.initialized("additional");
    }
}

/// Services of a watch that answers the handshake immediately.
#[derive(Clone)]
pub struct FakeServices {
    hub: Arc<ServiceHub>,
}

impl FakeServices {
    pub fn new() -> Self {
        let mut recovery = FirmwareVersion::from_parts(4, 0, 0);
        recovery.is_recovery = true;
        Self {
            hub: Arc::new(ServiceHub {
                watch_info: Mutex::new(watch_info(
                    FirmwareVersion::from_parts(4, 4, 0),
                    Some(recovery),
                )),
                steps: Mutex::new(Vec::new()),
                initialized: Mutex::new(Vec::new()),
                stall_run_state: AtomicBool::new(false),
                fail_watch_version: AtomicBool::new(false),
                fail_additional: AtomicBool::new(false),
                platform: Mutex::new(None),
                accepting_sessions: AtomicBool::new(false),
                previously_connected: Mutex::new(None),
                running_app: watch::channel(None).0,
            }),
        }
    }

    pub fn system(&self) -> &dyn SystemService {
        self.hub.as_ref()
    }

    pub fn run_state(&self) -> &dyn RunStateService {
        self.hub.as_ref()
    }

    pub fn watch_info(&self) -> WatchInfo {
        self.hub.watch_info.lock().clone()
    }

    pub fn set_watch_info(&self, info: WatchInfo) {
        *self.hub.watch_info.lock() = info;
    }

    pub fn run_recovery_firmware(&self) {
        self.hub.watch_info.lock().running_fw_version.is_recovery = true;
    }

    pub fn stall_run_state(&self) {
        self.hub.stall_run_state.store(true, Ordering::SeqCst);
    }

    pub fn fail_watch_version(&self) {
        self.hub.fail_watch_version.store(true, Ordering::SeqCst);
    }

    pub fn fail_additional(&self) {
        self.hub.fail_additional.store(true, Ordering::SeqCst);
    }

    pub fn steps(&self) -> Vec<HandshakeStep> {
        self.hub.steps.lock().clone()
    }

    pub fn initialized(&self) -> Vec<&'static str> {
        self.hub.initialized.lock().clone()
    }

    pub fn platform(&self) -> Option<u8> {
        *self.hub.platform.lock()
    }

    pub fn accepting_sessions(&self) -> bool {
        self.hub.accepting_sessions.load(Ordering::SeqCst)
    }

    pub fn previously_connected(&self) -> Option<bool> {
        *self.hub.previously_connected.lock()
    }

    pub fn core(&self) -> CoreServices {
        let (outbound, _) = mpsc::channel(1);
        self.core_services(&Transport::ble("AA", "Pebble"), &PacketBus::new(outbound))
    }

    pub fn recovery(&self) -> RecoveryServices {
        RecoveryServices::from_core(&self.core())
    }

    pub fn connected(&self) -> ConnectedServices {
        ConnectedServices::new(&self.core(), Vec::new())
    }
}

impl ServiceProvider for FakeServices {
    fn core_services(&self, _transport: &Transport, bus: &PacketBus) -> CoreServices {
        CoreServices {
            system: self.hub.clone(),
            run_state: self.hub.clone(),
            data_logging: self.hub.clone(),
            firmware: self.hub.clone(),
            logs: self.hub.clone(),
            core_dump: self.hub.clone(),
            messages: Arc::new(bus.clone()),
        }
    }

    fn additional_services(
        &self,
        _core: &CoreServices,
        _watch_info: &WatchInfo,
        previously_connected: bool,
    ) -> Result<Vec<Arc<dyn ProtocolService>>> {
        *self.hub.previously_connected.lock() = Some(previously_connected);
        if self.hub.fail_additional.load(Ordering::SeqCst) {
            return Err(Error::Internal("service start failed".to_string()));
        }
        Ok(vec![Arc::new(FakeProtocolService {
            hub: self.hub.clone(),
        })])
    }
}

/// Builds full BLE sessions against fake watches.
pub struct FakeConnectionFactory {
    services: FakeServices,
    gatt_server: Arc<GattServerManager>,
    bonding: Arc<FakeBondingAgent>,
    connectors: Mutex<Vec<Arc<FakeConnector>>>,
    unaddressable: Mutex<HashSet<String>>,
    ignore_disconnects: AtomicBool,
    link_failure: Mutex<Option<ConnectionFailureReason>>,
}

impl FakeConnectionFactory {
    pub fn new() -> Self {
        Self {
            services: FakeServices::new(),
            gatt_server: Arc::new(GattServerManager::with_backend(Arc::new(
                FakeGattServerBackend::default(),
            ))),
            bonding: Arc::new(FakeBondingAgent::new(true)),
            connectors: Mutex::new(Vec::new()),
            unaddressable: Mutex::new(HashSet::new()),
            ignore_disconnects: AtomicBool::new(false),
            link_failure: Mutex::new(None),
        }
    }

    pub fn services(&self) -> &FakeServices {
        &self.services
    }

    /// Number of state machines created.
    pub fn attempts(&self) -> usize {
        self.connectors.lock().len()
    }

    pub fn last_connector(&self) -> Option<Arc<FakeConnector>> {
        self.connectors.lock().last().cloned()
    }

    pub fn set_unaddressable(&self, transport: &Transport) {
        self.unaddressable
            .lock()
            .insert(transport.identifier().to_string());
    }

    /// Links created from now on stay open when asked to disconnect.
    pub fn ignore_disconnects(&self) {
        self.ignore_disconnects.store(true, Ordering::SeqCst);
    }

    /// Links created from now on fail to open with `reason`, or open again
    /// with `None`.
    pub fn fail_links_with(&self, reason: Option<ConnectionFailureReason>) {
        *self.link_failure.lock() = reason;
    }
}

impl ConnectionFactory for FakeConnectionFactory {
    fn create(&self, transport: &Transport) -> Option<ConnectionStateMachine> {
        if self.unaddressable.lock().contains(transport.identifier()) {
            return None;
        }

        let client = FakeGattClient::watch();
        // connected + paired
        client.set_read(CONNECTIVITY_CHARACTERISTIC_UUID, vec![0x03, 0, 0, 0]);
        let connector = Arc::new(FakeConnector::new(client));
        if self.ignore_disconnects.load(Ordering::SeqCst) {
            connector.ignore_disconnect();
        }
        if let Some(reason) = *self.link_failure.lock() {
            connector.fail_with(reason);
        }
        self.connectors.lock().push(connector.clone());

        let session = BleSession::new(
            transport.clone(),
            LibConfig::default().session(),
            connector,
            self.gatt_server.clone(),
            self.bonding.clone(),
            Arc::new(PassthroughTransportFactory),
        );
        Some(ConnectionStateMachine::new(
            transport.clone(),
            Arc::new(session),
            Arc::new(self.services.clone()),
        ))
    }
}

/// Install a log subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

//! Fleet-level watch registry.
//!
//! The registry owns every [`Watch`] the host knows about and reconciles
//! each one's desired state (connect goal, forget flag) against the actual
//! state of its connection attempt. Reconciliation runs on a single actor
//! task. It wakes on any change to the watch map, the radio state or the
//! configuration, on state changes of a live attempt, and on failures
//! reported by an attempt's scope.

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::ble::scanner::{RadioState, ScanResult};
use crate::config::LibConfig;
use crate::connection::{ConnectingState, ConnectionScope, ScopeFailure};
use crate::error::{Error, Result};
use crate::registry::device::WatchDevice;
use crate::registry::factory::{ConnectionFactory, FirmwareUpdateChecker, NoFirmwareUpdates};
use crate::registry::store::{KnownWatchRecord, KnownWatchStore};
use crate::registry::watch::{ActiveConnection, KnownProperties, Watch};
use crate::transport::Transport;

/// How long cleanup waits for the link to report closed.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait after the first failed attempt. Doubles with each further failure.
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Longest wait between failed attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Wait before the next attempt after `failed_attempts` failures in a row.
pub fn retry_delay(failed_attempts: u32) -> Duration {
    let exponent = failed_attempts.saturating_sub(1).min(16);
    MIN_RETRY_DELAY
        .saturating_mul(1 << exponent)
        .min(MAX_RETRY_DELAY)
}

enum StoreOp {
    Upsert(KnownWatchRecord),
    Delete(String),
}

struct Receivers {
    state_changes: mpsc::UnboundedReceiver<()>,
    failures: mpsc::UnboundedReceiver<ScopeFailure>,
    store_ops: mpsc::UnboundedReceiver<StoreOp>,
}

struct RegistryInner {
    factory: Arc<dyn ConnectionFactory>,
    store: Arc<dyn KnownWatchStore>,
    update_checker: RwLock<Arc<dyn FirmwareUpdateChecker>>,
    radio: watch::Receiver<RadioState>,
    config: watch::Receiver<LibConfig>,
    watches: watch::Sender<HashMap<Transport, Watch>>,
    devices: watch::Sender<Vec<WatchDevice>>,
    state_changes: mpsc::UnboundedSender<()>,
    failures: mpsc::UnboundedSender<ScopeFailure>,
    store_ops: mpsc::UnboundedSender<StoreOp>,
    receivers: Mutex<Option<Receivers>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Registry of known and discovered watches.
///
/// Cheap to clone. Call [`WatchRegistry::start`] once to load known watches
/// and begin reconciling.
#[derive(Clone)]
pub struct WatchRegistry {
    inner: Arc<RegistryInner>,
}

impl WatchRegistry {
    /// Create a registry.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        store: Arc<dyn KnownWatchStore>,
        radio: watch::Receiver<RadioState>,
        config: watch::Receiver<LibConfig>,
    ) -> Self {
        let (state_changes, state_changes_rx) = mpsc::unbounded_channel();
        let (failures, failures_rx) = mpsc::unbounded_channel();
        let (store_ops, store_ops_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(RegistryInner {
                factory,
                store,
                update_checker: RwLock::new(Arc::new(NoFirmwareUpdates)),
                radio,
                config,
                watches: watch::channel(HashMap::new()).0,
                devices: watch::channel(Vec::new()).0,
                state_changes,
                failures,
                store_ops,
                receivers: Mutex::new(Some(Receivers {
                    state_changes: state_changes_rx,
                    failures: failures_rx,
                    store_ops: store_ops_rx,
                })),
                tasks: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Replace the firmware update checker.
    pub fn set_update_checker(&self, checker: Arc<dyn FirmwareUpdateChecker>) {
        *self.inner.update_checker.write() = checker;
    }

    /// Load known watches and start reconciling.
    pub async fn start(&self) -> Result<()> {
        if self.inner.receivers.lock().is_none() {
            debug!("Registry already started");
            return Ok(());
        }

        let records = self.inner.store.load_all().await?;
        let Some(receivers) = self.inner.receivers.lock().take() else {
            return Ok(());
        };
        info!("Loaded {} known watches", records.len());

        self.inner.watches.send_modify(|watches| {
            for record in records {
                let watch = Watch::from_record(record);
                watches.insert(watch.transport.clone(), watch);
            }
        });

        let store = tokio::spawn(run_store(
            self.inner.store.clone(),
            receivers.store_ops,
            self.inner.shutdown.clone(),
        ));
        let actor = tokio::spawn(
            self.inner
                .clone()
                .run(receivers.state_changes, receivers.failures),
        );
        self.inner.tasks.lock().extend([store, actor]);
        Ok(())
    }

    /// Record a sighting of a watch.
    pub fn add_scan_result(&self, result: ScanResult) {
        self.inner.watches.send_if_modified(|watches| {
            match watches.get_mut(&result.transport) {
                Some(watch) if watch.active_connection.is_some() => {
                    trace!("Ignoring scan of {} during connection", result.transport);
                    false
                }
                Some(watch) => {
                    watch.scan_result = Some(result);
                    true
                }
                None => {
                    debug!("Discovered {}", result.transport);
                    watches.insert(result.transport.clone(), Watch::from_scan(result));
                    true
                }
            }
        });
    }

    /// Drop sightings. Watches known only from a scan are removed unless
    /// they are wanted or connecting.
    pub fn clear_scan_results(&self) {
        self.inner.clear_scan_results();
    }

    /// Ask for `transport` to be connected.
    ///
    /// Unless several watches may be connected at once, every other watch's
    /// goal is withdrawn.
    pub fn request_connection(&self, transport: &Transport) -> Result<()> {
        let multiple = self.inner.config.borrow().watch.multiple_connected_watches_supported;
        let found = self.inner.watches.send_if_modified(|watches| {
            if !watches.contains_key(transport) {
                return false;
            }
            for (key, watch) in watches.iter_mut() {
                if key == transport {
                    watch.connect_goal = true;
                    watch.reset_backoff();
                } else if !multiple && watch.connect_goal {
                    debug!("Withdrawing goal for {}", key);
                    watch.connect_goal = false;
                }
            }
            true
        });
        if !found {
            return Err(not_found(transport));
        }
        info!("Connection requested for {}", transport);
        Ok(())
    }

    /// Ask for `transport` to be disconnected.
    pub fn request_disconnection(&self, transport: &Transport) -> Result<()> {
        self.update(transport, |watch| watch.connect_goal = false)?;
        info!("Disconnection requested for {}", transport);
        Ok(())
    }

    /// Disconnect and remove `transport`, including its stored record.
    pub fn forget(&self, transport: &Transport) -> Result<()> {
        self.update(transport, |watch| {
            watch.connect_goal = false;
            watch.forget = true;
        })?;
        info!("Forgetting {}", transport);
        Ok(())
    }

    /// Device views, republished after every reconciliation.
    pub fn devices(&self) -> watch::Receiver<Vec<WatchDevice>> {
        self.inner.devices.subscribe()
    }

    /// Snapshot of one watch.
    pub fn watch(&self, transport: &Transport) -> Option<Watch> {
        self.inner.watches.borrow().get(transport).cloned()
    }

    /// Stop reconciling and tear down every live attempt.
    pub async fn shutdown(&self) {
        info!("Shutting down watch registry");
        self.inner.shutdown.cancel();

        let active: Vec<ActiveConnection> = self
            .inner
            .watches
            .borrow()
            .values()
            .filter_map(|watch| watch.active_connection.clone())
            .collect();
        join_all(active.into_iter().map(|a| self.inner.cleanup(a))).await;

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    fn update(&self, transport: &Transport, f: impl FnOnce(&mut Watch)) -> Result<()> {
        let found = self.inner.watches.send_if_modified(|watches| {
            match watches.get_mut(transport) {
                Some(watch) => {
                    f(watch);
                    true
                }
                None => false,
            }
        });
        if found {
            Ok(())
        } else {
            Err(not_found(transport))
        }
    }
}

fn not_found(transport: &Transport) -> Error {
    Error::WatchNotFound {
        identifier: transport.identifier().to_string(),
    }
}

async fn run_store(
    store: Arc<dyn KnownWatchStore>,
    mut ops: mpsc::UnboundedReceiver<StoreOp>,
    shutdown: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            biased;
            op = ops.recv() => op,
            _ = shutdown.cancelled() => None,
        };
        let Some(op) = op else { break };

        let result = match &op {
            StoreOp::Upsert(record) => store.upsert(record).await,
            StoreOp::Delete(identifier) => store.delete(identifier).await,
        };
        if let Err(e) = result {
            match op {
                StoreOp::Upsert(record) => error!("Failed to store {}: {}", record.identifier, e),
                StoreOp::Delete(identifier) => error!("Failed to delete {}: {}", identifier, e),
            }
        }
    }
    debug!("Store worker stopped");
}

impl RegistryInner {
    async fn run(
        self: Arc<Self>,
        mut state_changes: mpsc::UnboundedReceiver<()>,
        mut failures: mpsc::UnboundedReceiver<ScopeFailure>,
    ) {
        let mut watches = self.watches.subscribe();
        let mut radio = self.radio.clone();
        let mut config = self.config.clone();
        let mut radio_open = true;
        let mut config_open = true;
        let mut previous = HashMap::new();

        let mut next_retry = self.reconcile(&mut previous);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)),
                    if next_retry.is_some() => {}
                changed = watches.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = radio.changed(), if radio_open => {
                    if changed.is_err() {
                        warn!("Radio state source closed");
                        radio_open = false;
                    } else {
                        info!("Radio state: {:?}", *radio.borrow());
                    }
                }
                changed = config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                    }
                }
                Some(()) = state_changes.recv() => {}
                Some(failure) = failures.recv() => self.handle_scope_failure(failure),
            }
            next_retry = self.reconcile(&mut previous);
        }
        debug!("Registry actor stopped");
    }

    /// Returns when the earliest postponed attempt is due.
    fn reconcile(
        self: &Arc<Self>,
        previous: &mut HashMap<Transport, ConnectingState>,
    ) -> Option<Instant> {
        let now = Instant::now();
        let mut next_retry: Option<Instant> = None;
        let radio_enabled = self.radio.borrow().is_enabled();
        let multiple = self.config.borrow().watch.multiple_connected_watches_supported;
        let snapshot: Vec<Watch> = self.watches.borrow().values().cloned().collect();
        let mut any_active = snapshot.iter().any(|w| w.active_connection.is_some());

        previous.retain(|transport, _| snapshot.iter().any(|w| &w.transport == transport));

        for watch in &snapshot {
            let transport = &watch.transport;
            let state = watch.connecting_state();
            let was = previous
                .insert(transport.clone(), state.clone())
                .unwrap_or_default();

            self.persist_if_needed(watch);

            if watch.forget && watch.active_connection.is_none() {
                self.remove(transport);
                previous.remove(transport);
                continue;
            }

            match &watch.active_connection {
                None if watch.connect_goal && radio_enabled => match watch.retry_at {
                    Some(at) if at > now => {
                        trace!("Not connecting {}: backing off", transport);
                        next_retry = Some(next_retry.map_or(at, |next| next.min(at)));
                    }
                    _ if multiple || !any_active => {
                        if self.connect_to(watch) {
                            any_active = true;
                        }
                    }
                    _ => trace!("Not connecting {}: another watch is active", transport),
                },
                Some(active) if !radio_enabled => {
                    if !active.is_cleaned_up() {
                        info!("Radio unavailable, dropping connection to {}", transport);
                        self.spawn_cleanup(active.clone());
                    }
                }
                Some(active) if !watch.connect_goal => {
                    // Repeated on every pass until the link closes.
                    if active.claim_disconnect() {
                        info!("Disconnecting {}", transport);
                        let active = active.clone();
                        tokio::spawn(async move {
                            active.machine.disconnect().await;
                            active.finish_disconnect();
                        });
                    }
                }
                _ => {}
            }

            if let ConnectingState::Failed(reason) = &state {
                if watch.last_failure != Some(*reason) {
                    warn!("Connection to {} failed: {}", transport, reason);
                    let reason = *reason;
                    self.watches.send_if_modified(|watches| match watches.get_mut(transport) {
                        Some(w) if w.last_failure != Some(reason) => {
                            w.last_failure = Some(reason);
                            true
                        }
                        _ => false,
                    });
                }
            }

            if state.is_connected() && !was.is_connected() {
                self.on_connected(watch, &state);
            }
        }

        self.publish_devices(radio_enabled);
        next_retry
    }

    fn persist_if_needed(&self, watch: &Watch) {
        let desired = if watch.forget {
            None
        } else {
            watch.as_record()
        };
        if desired == watch.as_persisted {
            return;
        }

        let op = match &desired {
            Some(record) => StoreOp::Upsert(record.clone()),
            None => StoreOp::Delete(watch.transport.identifier().to_string()),
        };
        if self.store_ops.send(op).is_err() {
            warn!("Store worker gone, not persisting {}", watch.transport);
            return;
        }

        self.watches.send_if_modified(|watches| match watches.get_mut(&watch.transport) {
            Some(w) if w.as_persisted != desired => {
                w.as_persisted = desired;
                true
            }
            _ => false,
        });
    }

    fn remove(&self, transport: &Transport) {
        let removed = self.watches.send_if_modified(|watches| {
            let removable = watches
                .get(transport)
                .is_some_and(|w| w.forget && w.active_connection.is_none());
            if removable {
                watches.remove(transport);
            }
            removable
        });
        if removed {
            info!("Forgot {}", transport);
        }
    }

    /// Start an attempt for `watch`. Returns false if none was started.
    fn connect_to(self: &Arc<Self>, watch: &Watch) -> bool {
        let transport = &watch.transport;
        if watch.active_connection.is_some() {
            warn!("Already connecting to {}", transport);
            return false;
        }

        let Some(machine) = self.factory.create(transport) else {
            warn!("No way to connect to {}", transport);
            self.watches.send_if_modified(|watches| match watches.get_mut(transport) {
                Some(w) if w.known.is_some() => {
                    w.connect_goal = false;
                    w.forget = true;
                    true
                }
                Some(w) if w.connect_goal => {
                    w.connect_goal = false;
                    true
                }
                _ => false,
            });
            return false;
        };

        let machine = Arc::new(machine);
        let scope = ConnectionScope::new(transport.clone(), self.failures.clone());
        let active = ActiveConnection::new(machine.clone(), scope.clone());

        let installed = self.watches.send_if_modified(|watches| match watches.get_mut(transport) {
            Some(w) if w.active_connection.is_none() => {
                w.active_connection = Some(active.clone());
                true
            }
            _ => false,
        });
        if !installed {
            warn!("Already connecting to {}", transport);
            scope.close();
            return false;
        }
        info!("Connecting to {}", transport);

        let mut states = machine.subscribe();
        let state_changes = self.state_changes.clone();
        scope.spawn("state-forward", async move {
            while states.changed().await.is_ok() {
                if state_changes.send(()).is_err() {
                    break;
                }
            }
        });

        let previously_connected = watch.known.is_some();
        let registry = self.clone();
        let task_scope = scope.clone();
        scope.spawn("connection", async move {
            machine.connect(&task_scope, previously_connected).await;
            machine.disconnected().await;
            registry.cleanup(active).await;
        });
        true
    }

    fn spawn_cleanup(self: &Arc<Self>, active: ActiveConnection) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.cleanup(active).await;
        });
    }

    /// Tear an attempt down. Returns true for the one caller that did it.
    async fn cleanup(self: &Arc<Self>, active: ActiveConnection) -> bool {
        if !active.claim_cleanup() {
            warn!(
                "Connection to {} already done cleanup",
                active.scope.transport()
            );
            return false;
        }

        // Runs detached so cancelling the caller cannot stop it halfway.
        let registry = self.clone();
        let release = tokio::spawn(async move { registry.release(active).await });
        if let Err(e) = release.await {
            error!("Cleanup task failed: {}", e);
        }
        true
    }

    async fn release(&self, active: ActiveConnection) {
        let transport = active.scope.transport().clone();
        debug!("Cleaning up connection to {}", transport);

        active.machine.disconnect().await;
        if tokio::time::timeout(CLEANUP_TIMEOUT, active.machine.disconnected())
            .await
            .is_err()
        {
            warn!("Timed out waiting for {} to disconnect", transport);
        }
        active.scope.close();

        let failure = match active.machine.state() {
            ConnectingState::Failed(reason) => Some(reason),
            _ => None,
        };
        let id = active.id();
        self.watches.send_if_modified(|watches| match watches.get_mut(&transport) {
            Some(w) if w.active_connection.as_ref().map(ActiveConnection::id) == Some(id) => {
                w.active_connection = None;
                if let Some(reason) = failure {
                    w.last_failure = Some(reason);
                    w.failed_attempts = w.failed_attempts.saturating_add(1);
                    let delay = retry_delay(w.failed_attempts);
                    debug!("Retrying {} in {:?}", transport, delay);
                    w.retry_at = Some(Instant::now() + delay);
                }
                true
            }
            _ => false,
        });
        debug!("Cleanup of {} complete", transport);
    }

    fn handle_scope_failure(self: &Arc<Self>, failure: ScopeFailure) {
        error!(
            "Connection to {} failed in a background task: {}",
            failure.transport, failure.message
        );
        let active = self
            .watches
            .borrow()
            .get(&failure.transport)
            .and_then(|w| w.active_connection.clone())
            .filter(|a| a.id() == failure.scope_id);
        match active {
            Some(active) => self.spawn_cleanup(active),
            None => debug!("Scope {} is no longer active", failure.scope_id),
        }
    }

    fn on_connected(self: &Arc<Self>, watch: &Watch, state: &ConnectingState) {
        let Some(watch_info) = state.watch_info().cloned() else {
            return;
        };
        let transport = watch.transport.clone();
        info!(
            "Connected to {} running {}",
            transport, watch_info.running_fw_version.string_version
        );

        let known = KnownProperties {
            name: transport.name().to_string(),
            running_fw_version: watch_info.running_fw_version.string_version.clone(),
            serial: watch_info.serial.clone(),
            last_connected: Some(Utc::now()),
        };
        self.watches.send_if_modified(|watches| match watches.get_mut(&transport) {
            Some(w) => {
                w.known = Some(known);
                w.firmware_update_available = None;
                w.last_failure = None;
                w.reset_backoff();
                true
            }
            None => false,
        });
        if watch.scan_result.is_some() {
            self.clear_scan_results();
        }

        let checker = self.update_checker.read().clone();
        let registry = self.clone();
        tokio::spawn(async move {
            let Some(update) = checker.check_for_updates(&watch_info).await else {
                return;
            };
            info!("Firmware {} available for {}", update.version, transport);
            registry.watches.send_if_modified(|watches| match watches.get_mut(&transport) {
                Some(w) => {
                    w.firmware_update_available = Some(update);
                    true
                }
                None => false,
            });
        });
    }

    fn clear_scan_results(&self) {
        self.watches.send_if_modified(|watches| {
            let before = watches.len();
            watches.retain(|_, w| {
                w.known.is_some() || w.active_connection.is_some() || w.connect_goal
            });
            let mut modified = watches.len() != before;
            for watch in watches.values_mut() {
                if watch.known.is_some() && watch.scan_result.is_some() {
                    watch.scan_result = None;
                    modified = true;
                }
            }
            modified
        });
    }

    fn publish_devices(&self, radio_enabled: bool) {
        let mut devices: Vec<WatchDevice> = self
            .watches
            .borrow()
            .values()
            .map(|w| WatchDevice::project(w, &w.connecting_state(), radio_enabled))
            .collect();
        devices.sort_by(|a, b| a.transport.identifier().cmp(b.transport.identifier()));
        self.devices.send_replace(devices);
    }
}

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    codec::{decode_bytes, encode_bytes, WirePayload},
    error::{BikeError, Result},
    protocol::{self, build_difficulty_command, build_start_command, Frame, TelemetryEvent},
    registry::ScanRegistry,
    transport::{BleTransport, ConnectionHandle},
    types::{
        PeripheralRef, ServiceId, SessionConfig, SessionSnapshot, SessionState, TelemetryReading,
    },
    CONNECT_SERVICE, TELEMETRY_CHARACTERISTIC, WRITE_CHARACTERISTIC,
};

/// Session with a single exercise bike
///
/// `BikeSession` owns the connection lifecycle
/// (`Disconnected → Connecting → Connected → Streaming`), the latest
/// [`TelemetryReading`] and the [`ScanRegistry`] of discovered bikes. It drives
/// a [`BleTransport`] and decodes the bike's notification stream.
///
/// All mutable state sits behind one async mutex that is never held across a
/// transport call, so notifications keep flowing while a command is being
/// written. Observers get immutable [`SessionSnapshot`]s through
/// [`BikeSession::subscribe`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use pedalers::{ble::BtleplugTransport, BikeSession, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = Arc::new(BtleplugTransport::new().await?);
///     let session = BikeSession::new(transport, SessionConfig::default());
///
///     session.start_scan().await?;
///     let mut updates = session.subscribe();
///
///     // Wait for the first bike to show up
///     let bike = loop {
///         updates.changed().await?;
///         if let Some(bike) = updates.borrow().devices.first() {
///             break bike.clone();
///         }
///     };
///
///     session.connect(bike).await?;
///     Ok(())
/// }
/// ```
pub struct BikeSession {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn BleTransport>,
    config: SessionConfig,
    core: Mutex<SessionCore>,
    snapshots: watch::Sender<SessionSnapshot>,
}

#[derive(Default)]
struct SessionCore {
    state: SessionState,
    reading: TelemetryReading,
    registry: ScanRegistry,
    connection: Option<ConnectionHandle>,
    /// Bumped by every connect and disconnect; a connect attempt only
    /// applies its transitions while the counter still matches.
    attempt: u64,
    scan_task: Option<JoinHandle<()>>,
    /// Service the running scan filters on
    scan_filter: Option<ServiceId>,
    notification_task: Option<JoinHandle<()>>,
}

impl SessionCore {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state.clone(),
            reading: self.reading,
            devices: self.registry.devices().to_vec(),
            scanning: self.is_scanning(),
        }
    }

    fn is_scanning(&self) -> bool {
        self.scan_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl BikeSession {
    /// Create a disconnected session on top of a transport
    #[must_use]
    pub fn new(transport: Arc<dyn BleTransport>, config: SessionConfig) -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                core: Mutex::new(SessionCore::default()),
                snapshots,
            }),
        }
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Observe session snapshots, starting with the current one
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Current session snapshot
    pub async fn snapshot(&self) -> SessionSnapshot {
        self.shared.core.lock().await.snapshot()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> SessionState {
        self.shared.core.lock().await.state.clone()
    }

    /// Latest readings
    pub async fn reading(&self) -> TelemetryReading {
        self.shared.core.lock().await.reading
    }

    /// Bikes discovered so far, in first-seen order
    pub async fn discovered_devices(&self) -> Vec<PeripheralRef> {
        self.shared.core.lock().await.registry.devices().to_vec()
    }

    /// Scan for bikes advertising the configured service
    ///
    /// # Errors
    ///
    /// See [`BikeSession::start_scan_with_filter`].
    pub async fn start_scan(&self) -> Result<()> {
        self.start_scan_with_filter(self.shared.config.scan_filter)
            .await
    }

    /// Scan for bikes advertising `service`
    ///
    /// Discoveries are added to the scan registry, deduplicated by identifier.
    /// Starting a scan for the service already being scanned does nothing; a
    /// scan for another service replaces the running one. Discovered bikes
    /// are kept either way.
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::PermissionDenied`] if Bluetooth access is refused,
    /// or the transport's error if the scan cannot be started.
    pub async fn start_scan_with_filter(&self, service: ServiceId) -> Result<()> {
        self.shared.transport.ensure_permissions().await?;

        match self.running_scan_filter().await {
            Some(current) if current == service => {
                debug!("Scan for {service} already running");
                return Ok(());
            }
            Some(current) => {
                info!("Replacing scan for {current}");
                self.shared.stop_scan().await?;
            }
            None => {}
        }

        info!("Starting scan for bikes advertising {service}");

        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        self.shared.transport.scan(service, discovery_tx).await?;

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            shared.collect_discoveries(discovery_rx).await;
        });

        let mut core = self.shared.core.lock().await;
        if let Some(previous) = core.scan_task.replace(task) {
            previous.abort();
        }
        core.scan_filter = Some(service);
        self.shared.publish(&core);

        Ok(())
    }

    /// Stop the running scan
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the scan cannot be stopped.
    pub async fn stop_scan(&self) -> Result<()> {
        self.shared.stop_scan().await
    }

    /// Forget all discovered bikes
    pub async fn clear_discovered(&self) {
        let mut core = self.shared.core.lock().await;
        core.registry.clear();
        self.shared.publish(&core);
    }

    /// Connect to a bike and start streaming telemetry
    ///
    /// Only valid while disconnected. On success the session is `Streaming`:
    /// the start command was written and telemetry notifications are being
    /// decoded. A failed attempt leaves the session `Disconnected`; there is
    /// no automatic retry.
    ///
    /// # Errors
    ///
    /// - [`BikeError::PermissionDenied`] if Bluetooth access is refused
    /// - [`BikeError::InvalidState`] if a session is already active, or
    ///   [`BikeSession::disconnect`] was called while connecting
    /// - [`BikeError::Timeout`] if the configured connect timeout expires
    /// - [`BikeError::TransportFailure`] if connect, write or subscribe fail
    pub async fn connect(&self, peripheral: PeripheralRef) -> Result<()> {
        self.shared.transport.ensure_permissions().await?;

        let attempt = {
            let mut core = self.shared.core.lock().await;
            if core.state.is_active() {
                warn!(
                    "Ignoring connect to {peripheral}: session already {}",
                    core.state
                );
                return Err(BikeError::InvalidState {
                    state: core.state.to_string(),
                });
            }

            core.attempt += 1;
            core.state = SessionState::Connecting(peripheral.clone());
            self.shared.publish(&core);
            core.attempt
        };

        info!("Connecting to {peripheral}");

        match self.shared.establish(&peripheral, attempt).await {
            Ok(()) => {
                info!("Streaming telemetry from {peripheral}");
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect to {peripheral}: {e}");
                self.shared.abandon(attempt).await;
                Err(e)
            }
        }
    }

    /// Set the difficulty level
    ///
    /// The local reading is updated immediately. While streaming, a difficulty
    /// command is also written to the bike without waiting for any
    /// acknowledgment; the next difficulty frame from the bike overrides the
    /// local value.
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::TransportFailure`] if the write is rejected, or
    /// [`BikeError::Disconnected`] if the link already dropped. The local
    /// value is kept either way.
    pub async fn set_difficulty(&self, level: u8) -> Result<()> {
        let handle = {
            let mut core = self.shared.core.lock().await;
            core.reading.difficulty_level = level;
            self.shared.publish(&core);

            if core.state.is_streaming() {
                core.connection.clone()
            } else {
                None
            }
        };

        let Some(handle) = handle else {
            debug!("Difficulty set to {level} locally, no bike streaming");
            return Ok(());
        };

        let frame = build_difficulty_command(level);
        debug!("Sending difficulty command: [{frame}]");

        self.shared.write(&handle, &frame).await.inspect_err(|e| {
            warn!("Difficulty command {level} not delivered: {e}");
        })
    }

    /// Raise the difficulty by one level, saturating at the maximum
    ///
    /// # Errors
    ///
    /// See [`BikeSession::set_difficulty`].
    pub async fn increase_difficulty(&self) -> Result<u8> {
        let level = self.reading().await.difficulty_level.saturating_add(1);
        self.set_difficulty(level).await?;
        Ok(level)
    }

    /// Lower the difficulty by one level, stopping at zero
    ///
    /// # Errors
    ///
    /// See [`BikeSession::set_difficulty`].
    pub async fn decrease_difficulty(&self) -> Result<u8> {
        let level = self.reading().await.difficulty_level.saturating_sub(1);
        self.set_difficulty(level).await?;
        Ok(level)
    }

    /// Handle one inbound notification payload
    ///
    /// Undecodable payloads and malformed frames are logged and dropped.
    /// Returns the event that was merged into the reading, if any.
    pub async fn on_notification(&self, payload: WirePayload) -> Option<TelemetryEvent> {
        self.shared.on_notification(payload).await
    }

    /// Disconnect from the bike
    ///
    /// The session is `Disconnected` afterwards, whatever the transport
    /// reports. An in-flight [`BikeSession::connect`] is abandoned. Does
    /// nothing when already disconnected.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if releasing the connection failed.
    pub async fn disconnect(&self) -> Result<()> {
        let handle = {
            let mut core = self.shared.core.lock().await;
            if !core.state.is_active() {
                debug!("Disconnect requested while already disconnected");
                return Ok(());
            }

            info!("Disconnecting from {}", core.state);
            core.attempt += 1;
            core.state = SessionState::Disconnected;
            if let Some(task) = core.notification_task.take() {
                task.abort();
            }
            self.shared.publish(&core);
            core.connection.take()
        };

        if let Some(handle) = handle {
            self.shared.transport.disconnect(&handle).await?;
        }

        Ok(())
    }

    async fn running_scan_filter(&self) -> Option<ServiceId> {
        let core = self.shared.core.lock().await;
        core.scan_filter.filter(|_| core.is_scanning())
    }
}

impl Shared {
    fn publish(&self, core: &SessionCore) {
        self.snapshots.send_replace(core.snapshot());
    }

    /// Run the transport steps of a connect attempt
    async fn establish(self: &Arc<Self>, peripheral: &PeripheralRef, attempt: u64) -> Result<()> {
        let connecting = self.transport.connect(&peripheral.id);
        let handle = match self.config.connect_timeout_ms {
            Some(timeout_ms) => timeout(Duration::from_millis(timeout_ms), connecting)
                .await
                .map_err(|_| BikeError::Timeout { timeout_ms })??,
            None => connecting.await?,
        };

        {
            let mut core = self.core.lock().await;
            if core.attempt != attempt {
                drop(core);
                info!("Connect to {peripheral} abandoned, releasing connection");
                self.release(&handle).await;
                return Err(BikeError::InvalidState {
                    state: SessionState::Disconnected.to_string(),
                });
            }
            core.connection = Some(handle.clone());
        }

        let services = self.transport.discover_services(&handle).await?;
        for service in &services {
            debug!("Service {}", service.uuid);
            for characteristic in &service.characteristics {
                debug!("  Characteristic {characteristic}");
            }
        }

        self.transition(attempt, SessionState::Connected(peripheral.clone()))
            .await?;

        if self.config.stop_scan_on_connect {
            if let Err(e) = self.stop_scan().await {
                warn!("Failed to stop scan after connecting: {e}");
            }
            self.ensure_current(attempt).await?;
        }

        let start = build_start_command();
        debug!("Sending start command: [{start}]");
        self.write(&handle, &start).await?;
        self.ensure_current(attempt).await?;

        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        self.transport
            .subscribe(
                &handle,
                CONNECT_SERVICE,
                TELEMETRY_CHARACTERISTIC,
                notification_tx,
            )
            .await?;

        let mut core = self.core.lock().await;
        Self::check_attempt(&core, attempt)?;

        let shared = self.clone();
        core.notification_task = Some(tokio::spawn(async move {
            shared.pump_notifications(notification_rx, attempt).await;
        }));
        core.state = SessionState::Streaming(peripheral.clone());
        self.publish(&core);

        Ok(())
    }

    /// Apply a transition if the attempt is still current
    async fn transition(&self, attempt: u64, state: SessionState) -> Result<()> {
        let mut core = self.core.lock().await;
        Self::check_attempt(&core, attempt)?;
        core.state = state;
        self.publish(&core);
        Ok(())
    }

    /// Fail if `disconnect` superseded the attempt
    async fn ensure_current(&self, attempt: u64) -> Result<()> {
        Self::check_attempt(&*self.core.lock().await, attempt)
    }

    fn check_attempt(core: &SessionCore, attempt: u64) -> Result<()> {
        if core.attempt == attempt {
            Ok(())
        } else {
            Err(BikeError::InvalidState {
                state: core.state.to_string(),
            })
        }
    }

    /// Return to `Disconnected` after a failed attempt
    async fn abandon(&self, attempt: u64) {
        let handle = {
            let mut core = self.core.lock().await;
            if core.attempt != attempt {
                // Superseded by `disconnect`, which already cleaned up
                return;
            }
            core.state = SessionState::Disconnected;
            if let Some(task) = core.notification_task.take() {
                task.abort();
            }
            self.publish(&core);
            core.connection.take()
        };

        if let Some(handle) = handle {
            self.release(&handle).await;
        }
    }

    async fn release(&self, handle: &ConnectionHandle) {
        if let Err(e) = self.transport.disconnect(handle).await {
            warn!("Failed to release connection to {}: {e}", handle.device());
        }
    }

    async fn write(&self, handle: &ConnectionHandle, frame: &Frame) -> Result<()> {
        let payload = encode_bytes(frame, self.transport.payload_encoding());
        self.transport
            .write_without_response(handle, CONNECT_SERVICE, WRITE_CHARACTERISTIC, payload)
            .await
    }

    async fn stop_scan(&self) -> Result<()> {
        let task = {
            let mut core = self.core.lock().await;
            let task = core.scan_task.take();
            core.scan_filter = None;
            self.publish(&core);
            task
        };

        let Some(task) = task else {
            return Ok(());
        };

        task.abort();
        info!("Stopping scan");
        self.transport.stop_scan().await
    }

    async fn collect_discoveries(&self, mut discoveries: mpsc::UnboundedReceiver<PeripheralRef>) {
        while let Some(peripheral) = discoveries.recv().await {
            let mut core = self.core.lock().await;
            let name = peripheral.to_string();
            if core.registry.insert(peripheral) {
                info!("Found bike: {name}");
                self.publish(&core);
            }
        }
        debug!("Discovery stream ended");
    }

    async fn on_notification(&self, payload: WirePayload) -> Option<TelemetryEvent> {
        let frame = match decode_bytes(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping notification: {e}");
                return None;
            }
        };

        let event = protocol::decode(&frame)?;

        let mut core = self.core.lock().await;
        if event.apply_to(&mut core.reading) {
            self.publish(&core);
        }
        Some(event)
    }

    /// Feed notifications in arrival order until the link closes
    async fn pump_notifications(
        &self,
        mut notifications: mpsc::UnboundedReceiver<WirePayload>,
        attempt: u64,
    ) {
        while let Some(payload) = notifications.recv().await {
            self.on_notification(payload).await;
        }

        let handle = {
            let mut core = self.core.lock().await;
            if core.attempt != attempt || !core.state.is_active() {
                return;
            }
            warn!("Telemetry stream closed, {} lost", core.state);
            // Detach so a concurrent `disconnect` does not abort the release below
            core.notification_task = None;
            core.connection.take()
        };

        if let Some(handle) = handle {
            self.release(&handle).await;
        }

        let mut core = self.core.lock().await;
        if core.attempt == attempt {
            core.attempt += 1;
            core.state = SessionState::Disconnected;
            self.publish(&core);
        }
    }
}

impl Drop for BikeSession {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let shared = self.shared.clone();
        runtime.spawn(async move {
            let (handle, tasks) = {
                let mut core = shared.core.lock().await;
                core.attempt += 1;
                core.state = SessionState::Disconnected;
                let tasks = [core.scan_task.take(), core.notification_task.take()];
                (core.connection.take(), tasks)
            };

            for task in tasks.into_iter().flatten() {
                task.abort();
            }
            if let Some(handle) = handle {
                shared.release(&handle).await;
            }
        });
    }
}

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    codec::{PayloadEncoding, WirePayload},
    error::Result,
    types::{CharacteristicId, PeripheralId, PeripheralRef, ServiceId},
};

/// Handle to an open connection, owned by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    device: PeripheralId,
}

impl ConnectionHandle {
    /// Create a handle for a connected device
    #[must_use]
    pub const fn new(device: PeripheralId) -> Self {
        Self { device }
    }

    /// Connected device identifier
    #[must_use]
    pub const fn device(&self) -> &PeripheralId {
        &self.device
    }
}

/// A GATT service and its characteristics, as discovered after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service identifier
    pub uuid: ServiceId,
    /// Characteristics of the service
    pub characteristics: Vec<CharacteristicId>,
}

/// Capabilities the session needs from a BLE stack
///
/// Discoveries and notifications are delivered through the given channels in
/// the order the stack received them. Dropping the notification sender tells
/// the session the link is gone.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Encoding of payloads crossing this transport
    fn payload_encoding(&self) -> PayloadEncoding {
        PayloadEncoding::Binary
    }

    /// Verify the platform grants Bluetooth access
    ///
    /// # Errors
    ///
    /// Returns [`crate::BikeError::PermissionDenied`] if access was refused.
    async fn ensure_permissions(&self) -> Result<()> {
        Ok(())
    }

    /// Start listening for advertisements of `service`
    async fn scan(
        &self,
        service: ServiceId,
        discoveries: mpsc::UnboundedSender<PeripheralRef>,
    ) -> Result<()>;

    /// Stop the running scan
    async fn stop_scan(&self) -> Result<()>;

    /// Open a connection to a device
    async fn connect(&self, device: &PeripheralId) -> Result<ConnectionHandle>;

    /// Enumerate services and characteristics of a connected device
    async fn discover_services(&self, handle: &ConnectionHandle) -> Result<Vec<ServiceInfo>>;

    /// Write a payload without waiting for a response
    async fn write_without_response(
        &self,
        handle: &ConnectionHandle,
        service: ServiceId,
        characteristic: CharacteristicId,
        payload: WirePayload,
    ) -> Result<()>;

    /// Forward notifications of a characteristic to `notifications`
    async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        service: ServiceId,
        characteristic: CharacteristicId,
        notifications: mpsc::UnboundedSender<WirePayload>,
    ) -> Result<()>;

    /// Release the connection
    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<()>;
}

/// Scripted in-memory transport for exercising the session
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::{
        error::BikeError, CONNECT_SERVICE, TELEMETRY_CHARACTERISTIC, WRITE_CHARACTERISTIC,
    };
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };
    use tokio::sync::Notify;

    /// How `connect` behaves
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum ConnectBehavior {
        Succeed,
        Fail,
        /// Wait until [`ScriptedTransport::release_connect`] is called
        Hang,
    }

    /// A write observed by the transport
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct RecordedWrite {
        pub service: ServiceId,
        pub characteristic: CharacteristicId,
        pub payload: WirePayload,
    }

    #[derive(Debug)]
    pub(crate) struct ScriptedTransport {
        encoding: PayloadEncoding,
        connect_behavior: Mutex<ConnectBehavior>,
        permission_granted: Mutex<bool>,
        fail_subscribe: Mutex<bool>,
        fail_writes: Mutex<bool>,
        release: Notify,
        hold_stop_scan: AtomicBool,
        stop_scan_gate: Notify,
        link_up: AtomicBool,
        calls: Mutex<Vec<&'static str>>,
        scan_filters: Mutex<Vec<ServiceId>>,
        pub connect_calls: AtomicUsize,
        pub disconnect_calls: AtomicUsize,
        pub stop_scan_calls: AtomicUsize,
        writes: Mutex<Vec<RecordedWrite>>,
        discoveries: Mutex<Option<mpsc::UnboundedSender<PeripheralRef>>>,
        notifications: Mutex<Option<mpsc::UnboundedSender<WirePayload>>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(encoding: PayloadEncoding) -> Self {
            Self {
                encoding,
                connect_behavior: Mutex::new(ConnectBehavior::Succeed),
                permission_granted: Mutex::new(true),
                fail_subscribe: Mutex::new(false),
                fail_writes: Mutex::new(false),
                release: Notify::new(),
                hold_stop_scan: AtomicBool::new(false),
                stop_scan_gate: Notify::new(),
                link_up: AtomicBool::new(false),
                calls: Mutex::new(Vec::new()),
                scan_filters: Mutex::new(Vec::new()),
                connect_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
                stop_scan_calls: AtomicUsize::new(0),
                writes: Mutex::new(Vec::new()),
                discoveries: Mutex::new(None),
                notifications: Mutex::new(None),
            }
        }

        pub(crate) fn set_connect_behavior(&self, behavior: ConnectBehavior) {
            *self.connect_behavior.lock().unwrap() = behavior;
        }

        pub(crate) fn deny_permissions(&self) {
            *self.permission_granted.lock().unwrap() = false;
        }

        pub(crate) fn fail_subscribe(&self) {
            *self.fail_subscribe.lock().unwrap() = true;
        }

        pub(crate) fn fail_writes(&self) {
            *self.fail_writes.lock().unwrap() = true;
        }

        /// Let a hanging `connect` complete successfully
        pub(crate) fn release_connect(&self) {
            self.release.notify_one();
        }

        /// Make `stop_scan` wait until [`ScriptedTransport::release_stop_scan`]
        pub(crate) fn hold_stop_scan(&self) {
            self.hold_stop_scan.store(true, Ordering::SeqCst);
        }

        pub(crate) fn release_stop_scan(&self) {
            self.stop_scan_gate.notify_one();
        }

        /// Transport operations in the order they were invoked
        pub(crate) fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        /// Services each scan filtered on
        pub(crate) fn scan_filters(&self) -> Vec<ServiceId> {
            self.scan_filters.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        pub(crate) fn writes(&self) -> Vec<RecordedWrite> {
            self.writes.lock().unwrap().clone()
        }

        /// Simulate an advertisement
        pub(crate) fn advertise(&self, peripheral: PeripheralRef) -> bool {
            self.discoveries
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|tx| tx.send(peripheral).is_ok())
        }

        /// Simulate an inbound notification
        pub(crate) fn notify(&self, payload: WirePayload) -> bool {
            self.notifications
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(|tx| tx.send(payload).is_ok())
        }

        /// Simulate the bike dropping the link
        pub(crate) fn drop_link(&self) {
            self.link_up.store(false, Ordering::SeqCst);
            self.notifications.lock().unwrap().take();
        }
    }

    #[async_trait]
    impl BleTransport for ScriptedTransport {
        fn payload_encoding(&self) -> PayloadEncoding {
            self.encoding
        }

        async fn ensure_permissions(&self) -> Result<()> {
            if *self.permission_granted.lock().unwrap() {
                Ok(())
            } else {
                Err(BikeError::PermissionDenied)
            }
        }

        async fn scan(
            &self,
            service: ServiceId,
            discoveries: mpsc::UnboundedSender<PeripheralRef>,
        ) -> Result<()> {
            self.record("scan");
            self.scan_filters.lock().unwrap().push(service);
            *self.discoveries.lock().unwrap() = Some(discoveries);
            Ok(())
        }

        async fn stop_scan(&self) -> Result<()> {
            self.record("stop_scan");
            self.stop_scan_calls.fetch_add(1, Ordering::SeqCst);
            if self.hold_stop_scan.load(Ordering::SeqCst) {
                self.stop_scan_gate.notified().await;
            }
            self.discoveries.lock().unwrap().take();
            Ok(())
        }

        async fn connect(&self, device: &PeripheralId) -> Result<ConnectionHandle> {
            self.record("connect");
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let behavior = *self.connect_behavior.lock().unwrap();
            match behavior {
                ConnectBehavior::Succeed => {}
                ConnectBehavior::Fail => {
                    return Err(BikeError::TransportFailure("connection refused".into()))
                }
                ConnectBehavior::Hang => self.release.notified().await,
            }
            self.link_up.store(true, Ordering::SeqCst);
            Ok(ConnectionHandle::new(device.clone()))
        }

        async fn discover_services(&self, _handle: &ConnectionHandle) -> Result<Vec<ServiceInfo>> {
            Ok(vec![ServiceInfo {
                uuid: CONNECT_SERVICE,
                characteristics: vec![WRITE_CHARACTERISTIC, TELEMETRY_CHARACTERISTIC],
            }])
        }

        async fn write_without_response(
            &self,
            _handle: &ConnectionHandle,
            service: ServiceId,
            characteristic: CharacteristicId,
            payload: WirePayload,
        ) -> Result<()> {
            self.record("write");
            if !self.link_up.load(Ordering::SeqCst) {
                return Err(BikeError::Disconnected);
            }
            if *self.fail_writes.lock().unwrap() {
                return Err(BikeError::TransportFailure("write rejected".into()));
            }
            self.writes.lock().unwrap().push(RecordedWrite {
                service,
                characteristic,
                payload,
            });
            Ok(())
        }

        async fn subscribe(
            &self,
            _handle: &ConnectionHandle,
            _service: ServiceId,
            _characteristic: CharacteristicId,
            notifications: mpsc::UnboundedSender<WirePayload>,
        ) -> Result<()> {
            self.record("subscribe");
            if *self.fail_subscribe.lock().unwrap() {
                return Err(BikeError::TransportFailure("subscribe rejected".into()));
            }
            *self.notifications.lock().unwrap() = Some(notifications);
            Ok(())
        }

        async fn disconnect(&self, _handle: &ConnectionHandle) -> Result<()> {
            self.record("disconnect");
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            self.link_up.store(false, Ordering::SeqCst);
            self.notifications.lock().unwrap().take();
            Ok(())
        }
    }
}

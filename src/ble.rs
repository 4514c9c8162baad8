use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    codec::{decode_bytes, WirePayload},
    error::{BikeError, Result},
    transport::{BleTransport, ConnectionHandle, ServiceInfo},
    types::{CharacteristicId, PeripheralId, PeripheralRef, ServiceId},
};

/// [`BleTransport`] backed by the platform Bluetooth stack through btleplug
pub struct BtleplugTransport {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<PeripheralId, Peripheral>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    notification_tasks: Mutex<HashMap<PeripheralId, Vec<JoinHandle<()>>>>,
}

impl BtleplugTransport {
    /// Create a transport on the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`BikeError::DeviceNotFound`] if no Bluetooth adapters are available,
    /// [`BikeError::PermissionDenied`] if the platform refuses access,
    /// or [`BikeError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BikeError::DeviceNotFound)?;

        Ok(Self::with_adapter(adapter))
    }

    /// Create a transport on a specific adapter
    #[must_use]
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
            notification_tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a device id to a btleplug peripheral
    async fn peripheral(&self, device: &PeripheralId) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(device) {
            return Ok(peripheral.clone());
        }

        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == device.as_str())
            .ok_or(BikeError::DeviceNotFound)?;

        self.peripherals
            .lock()
            .await
            .insert(device.clone(), peripheral.clone());

        Ok(peripheral)
    }

    /// Find a characteristic of a connected peripheral
    fn characteristic(
        peripheral: &Peripheral,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid() && c.service_uuid == service.uuid())
            .ok_or_else(|| {
                BikeError::TransportFailure(format!(
                    "characteristic {characteristic} not found in service {service}"
                ))
            })
    }
}

/// Build a reference for a peripheral advertising `service`
async fn advertised_bike(peripheral: &Peripheral, service: ServiceId) -> Option<PeripheralRef> {
    let properties = peripheral.properties().await.ok()??;

    // Not every platform applies the scan filter
    if !properties.services.contains(&service.uuid()) {
        return None;
    }

    let id = PeripheralId::new(peripheral.id().to_string());
    let bike = PeripheralRef::new(id, properties.local_name);
    Some(match properties.rssi {
        Some(rssi) => bike.with_rssi(rssi),
        None => bike,
    })
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn ensure_permissions(&self) -> Result<()> {
        let info = self.adapter.adapter_info().await?;
        debug!("Using adapter {info}");
        Ok(())
    }

    async fn scan(
        &self,
        service: ServiceId,
        discoveries: mpsc::UnboundedSender<PeripheralRef>,
    ) -> Result<()> {
        let mut events = self.adapter.events().await?;

        self.adapter
            .start_scan(ScanFilter {
                services: vec![service.uuid()],
            })
            .await
            .map_err(|e| BikeError::TransportFailure(format!("Failed to start scan: {e}")))?;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };

                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };

                if let Some(bike) = advertised_bike(&peripheral, service).await {
                    peripherals
                        .lock()
                        .await
                        .insert(bike.id.clone(), peripheral);

                    if discoveries.send(bike).is_err() {
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.scan_task.lock().await.replace(task) {
            previous.abort();
        }

        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
        }

        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BikeError::TransportFailure(format!("Failed to stop scan: {e}")))
    }

    async fn connect(&self, device: &PeripheralId) -> Result<ConnectionHandle> {
        let peripheral = self.peripheral(device).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| BikeError::TransportFailure(format!("Failed to connect: {e}")))?;

        info!("Connected to {device}");
        Ok(ConnectionHandle::new(device.clone()))
    }

    async fn discover_services(&self, handle: &ConnectionHandle) -> Result<Vec<ServiceInfo>> {
        let peripheral = self.peripheral(handle.device()).await?;

        peripheral.discover_services().await.map_err(|e| {
            BikeError::TransportFailure(format!("Failed to discover services: {e}"))
        })?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid.into(),
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| c.uuid.into())
                    .collect(),
            })
            .collect())
    }

    async fn write_without_response(
        &self,
        handle: &ConnectionHandle,
        service: ServiceId,
        characteristic: CharacteristicId,
        payload: WirePayload,
    ) -> Result<()> {
        let peripheral = self.peripheral(handle.device()).await?;
        if !peripheral.is_connected().await? {
            return Err(BikeError::Disconnected);
        }

        let target = Self::characteristic(&peripheral, service, characteristic)?;
        let frame = decode_bytes(&payload)?;

        debug!("Writing [{frame}] to {characteristic}");

        peripheral
            .write(&target, frame.as_bytes(), WriteType::WithoutResponse)
            .await
            .map_err(|e| BikeError::TransportFailure(format!("Failed to write: {e}")))
    }

    async fn subscribe(
        &self,
        handle: &ConnectionHandle,
        service: ServiceId,
        characteristic: CharacteristicId,
        notifications: mpsc::UnboundedSender<WirePayload>,
    ) -> Result<()> {
        let peripheral = self.peripheral(handle.device()).await?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;

        // Open the streams before subscribing so the first frames are not lost
        let mut stream = peripheral.notifications().await?;
        // The notification stream does not end on every platform when the
        // link drops, the adapter reports it reliably
        let mut events = self.adapter.events().await?;

        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| BikeError::TransportFailure(format!("Failed to subscribe: {e}")))?;

        let uuid = target.uuid;
        let peripheral_id = peripheral.id();
        let device = handle.device().clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = stream.next() => {
                        let Some(notification) = notification else {
                            break;
                        };
                        if notification.uuid != uuid {
                            continue;
                        }
                        let payload = WirePayload::Binary(Bytes::from(notification.value));
                        if notifications.send(payload).is_err() {
                            break;
                        }
                    }
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            info!("{device} dropped the link");
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            // Dropping the sender closes the session's notification channel
            debug!("Notification stream of {device} ended");
        });

        self.notification_tasks
            .lock()
            .await
            .entry(handle.device().clone())
            .or_default()
            .push(task);

        Ok(())
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<()> {
        if let Some(tasks) = self.notification_tasks.lock().await.remove(handle.device()) {
            for task in tasks {
                task.abort();
            }
        }

        let peripheral = self.peripheral(handle.device()).await?;
        self.peripherals.lock().await.remove(handle.device());

        if !peripheral.is_connected().await.unwrap_or(false) {
            debug!("{} already disconnected", handle.device());
            return Ok(());
        }

        if let Err(e) = peripheral.disconnect().await {
            warn!("Disconnect from {} failed: {e}", handle.device());
            return Err(BikeError::TransportFailure(format!(
                "Failed to disconnect: {e}"
            )));
        }

        info!("Disconnected from {}", handle.device());
        Ok(())
    }
}

//! High-level management of multiple devices of mixed protocols.
//! Provides a unified event stream tagged with the device id.

use crate::codec::ProtocolCodec;
use crate::core::DeviceSnapshot;
use crate::device::Device;
use crate::error::{LinkError, Result};
use crate::sink::DeviceEvent;
use futures_util::{Stream, StreamExt};
use log::{info, warn};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

/// An event from any device managed by a [`Manager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerEvent {
    pub device_id: String,
    pub event: DeviceEvent,
}

/// Protocol-independent view of a [`Device`].
trait ManagedDevice: Send + Sync {
    fn is_connected(&self) -> bool;
    fn snapshot(&self) -> DeviceSnapshot;
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;
    fn shutdown(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<C: ProtocolCodec> ManagedDevice for Device<C> {
    fn is_connected(&self) -> bool {
        Device::is_connected(self)
    }

    fn snapshot(&self) -> DeviceSnapshot {
        Device::snapshot(self)
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        Device::subscribe(self)
    }

    fn shutdown(&self) {
        Device::shutdown(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct ManagedEntry {
    device: Arc<dyn ManagedDevice>,
    monitor_token: CancellationToken,
}

/// Owns a set of running devices. No process-wide state: every manager is
/// independent, and dropping the last clone stops its devices.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    devices: RwLock<HashMap<String, ManagedEntry>>,
    event_tx: broadcast::Sender<ManagerEvent>,
    cancel_token: CancellationToken,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                devices: RwLock::new(HashMap::new()),
                event_tx,
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    /// Returns a Stream of events from all managed devices.
    pub fn stream(&self) -> impl Stream<Item = ManagerEvent> + Send + 'static {
        BroadcastStream::new(self.inner.event_tx.subscribe()).filter_map(|res| async move { res.ok() })
    }

    /// Takes ownership of a running device.
    ///
    /// Returns an error if a device with the same ID already exists; the
    /// rejected device keeps running and stays with the caller.
    pub async fn add<C: ProtocolCodec>(&self, device: Device<C>) -> Result<()> {
        let id = device.id().to_string();
        let mut devices = self.inner.devices.write().await;
        if devices.contains_key(&id) {
            return Err(LinkError::DuplicateDevice(id));
        }

        let monitor_token = self.inner.cancel_token.child_token();
        let device: Arc<dyn ManagedDevice> = Arc::new(device);
        self.spawn_device_monitor(&id, device.subscribe(), monitor_token.clone());
        devices.insert(
            id.clone(),
            ManagedEntry {
                device,
                monitor_token,
            },
        );

        info!("Device {} added to manager", id);
        Ok(())
    }

    fn spawn_device_monitor(
        &self,
        id: &str,
        rx: broadcast::Receiver<DeviceEvent>,
        token: CancellationToken,
    ) {
        let device_id = id.to_string();
        let event_tx = self.inner.event_tx.clone();

        tokio::spawn(async move {
            let mut events = BroadcastStream::new(rx);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = events.next() => match next {
                        Some(Ok(event)) => {
                            let _ = event_tx.send(ManagerEvent {
                                device_id: device_id.clone(),
                                event,
                            });
                        }
                        Some(Err(_)) => continue,
                        None => {
                            info!("Event stream for device {} ended", device_id);
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stops a device and removes it from the manager.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut devices = self.inner.devices.write().await;
        match devices.remove(id) {
            Some(entry) => {
                entry.monitor_token.cancel();
                entry.device.shutdown();
                info!("Device {} removed from manager", id);
                Ok(())
            }
            None => {
                warn!("Attempted to remove non-existent device {}", id);
                Err(LinkError::DeviceNotFound(id.to_string()))
            }
        }
    }

    /// Typed access to a managed device. `None` if the id is unknown or the
    /// device speaks a different protocol.
    pub async fn get<C: ProtocolCodec>(&self, id: &str) -> Option<Device<C>> {
        let devices = self.inner.devices.read().await;
        devices
            .get(id)
            .and_then(|entry| entry.device.as_any().downcast_ref::<Device<C>>())
            .cloned()
    }

    /// Device ID -> is connected (local status, no network request).
    pub async fn list(&self) -> HashMap<String, bool> {
        let devices = self.inner.devices.read().await;
        devices
            .iter()
            .map(|(id, entry)| (id.clone(), entry.device.is_connected()))
            .collect()
    }

    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let devices = self.inner.devices.read().await;
        let mut snapshots: Vec<DeviceSnapshot> = devices.values().map(|e| e.device.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Stops every device and event forwarding.
    pub async fn shutdown(&self) {
        self.inner.cancel_token.cancel();
        let mut devices = self.inner.devices.write().await;
        for (id, entry) in devices.drain() {
            entry.device.shutdown();
            info!("Device {} stopped by manager shutdown", id);
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        if let Ok(devices) = self.devices.try_read() {
            for entry in devices.values() {
                entry.device.shutdown();
            }
        }
    }
}

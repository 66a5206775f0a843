//! # BLE Transport (btleplug)
//!
//! Drives the platform Bluetooth stack through btleplug and turns its async
//! API into the fire-and-forget requests and ordered events the manager
//! expects.
//!
//! ## Tasks
//!
//! - one **pump** task reads the adapter's central events and forwards
//!   sightings and disconnects
//! - one task per **connect** request; `cancel_connect` aborts it
//! - one task per **discovery** request
//! - one **writer** task per connected device, so chunks for a device go out
//!   strictly in the order `write` was called
//! - one **sweep** task that reports devices as lost once they stop
//!   advertising for [`LOST_AFTER`] and have no link
//!
//! ## Identifiers
//!
//! btleplug identifies peripherals by a platform id (a MAC address on Linux,
//! a UUID on macOS). Those are mapped to a stable [`DeviceId`] with a UUIDv5
//! over the id's string form.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::{AdapterState, Advertisement, CharacteristicInfo, TransportAdapter, TransportEvent};
use crate::config::ServiceFilter;
use crate::device::{CharacteristicHandle, DeviceId};
use crate::error::TicketlineError;

/// Silence after which an unlinked device counts as gone
pub const LOST_AFTER: Duration = Duration::from_secs(30);

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Stable identifier for a btleplug peripheral.
pub fn device_id(pid: &PeripheralId) -> DeviceId {
    DeviceId::new(Uuid::new_v5(&Uuid::NAMESPACE_OID, pid.to_string().as_bytes()))
}

struct WriteJob {
    characteristic: Characteristic,
    bytes: Vec<u8>,
}

struct Shared {
    adapter: Adapter,
    runtime: Handle,
    events: mpsc::UnboundedSender<TransportEvent>,
    scanning: AtomicBool,
    peripherals: Mutex<HashMap<DeviceId, Peripheral>>,
    last_seen: Mutex<HashMap<DeviceId, Instant>>,
    connecting: Mutex<HashMap<DeviceId, AbortHandle>>,
    writers: Mutex<HashMap<DeviceId, mpsc::UnboundedSender<WriteJob>>>,
}

pub struct BleTransport {
    shared: Arc<Shared>,
    pump: AbortHandle,
    sweep: AbortHandle,
}

impl BleTransport {
    /// Open the first Bluetooth adapter and start listening to it.
    pub async fn open() -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TicketlineError>
    {
        let manager = Manager::new().await.map_err(transport_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(transport_error)?
            .into_iter()
            .next()
            .ok_or_else(|| TicketlineError::Transport("No BLE adapter found".to_string()))?;
        let central_events = adapter.events().await.map_err(transport_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            adapter,
            runtime: Handle::current(),
            events: tx,
            scanning: AtomicBool::new(false),
            peripherals: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            writers: Mutex::new(HashMap::new()),
        });

        shared.emit(TransportEvent::StateChanged(AdapterState::PoweredOn));
        shared.announce_connected().await;

        let pump = tokio::spawn(pump(Arc::clone(&shared), central_events)).abort_handle();
        let sweep = tokio::spawn(sweep(Arc::clone(&shared))).abort_handle();
        tracing::debug!("BLE transport opened");

        Ok((Self { shared, pump, sweep }, rx))
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.pump.abort();
        self.sweep.abort();
        for (_, task) in lock(&self.shared.connecting).drain() {
            task.abort();
        }
    }
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("transport event dropped, manager is gone");
        }
    }

    fn peripheral(&self, id: DeviceId) -> Result<Peripheral, TicketlineError> {
        lock(&self.peripherals)
            .get(&id)
            .cloned()
            .ok_or(TicketlineError::DeviceNotFound(id))
    }

    /// Report links that were already up before the manager started.
    async fn announce_connected(&self) {
        let peripherals = match self.adapter.peripherals().await {
            Ok(peripherals) => peripherals,
            Err(e) => {
                tracing::warn!(error = %e, "could not list known peripherals");
                return;
            }
        };
        for peripheral in peripherals {
            if !peripheral.is_connected().await.unwrap_or(false) {
                continue;
            }
            let id = device_id(&peripheral.id());
            tracing::info!(id = %id, "found existing link");
            lock(&self.peripherals).insert(id, peripheral);
            self.emit(TransportEvent::Connected(id));
        }
    }

    async fn on_sighting(&self, pid: PeripheralId) {
        let peripheral = match self.adapter.peripheral(&pid).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                tracing::trace!(error = %e, "sighted peripheral vanished");
                return;
            }
        };
        let Ok(Some(props)) = peripheral.properties().await else {
            return;
        };

        let id = device_id(&pid);
        lock(&self.peripherals).insert(id, peripheral);
        lock(&self.last_seen).insert(id, Instant::now());
        // btleplug does not expose the connectable flag; scan results are
        // treated as connectable.
        self.emit(TransportEvent::AdvertisementSeen(Advertisement {
            id,
            name: props.local_name,
            services: props.services,
            connectable: true,
            rssi: props.rssi,
        }));
    }

    fn on_link_down(&self, pid: PeripheralId) {
        let id = device_id(&pid);
        lock(&self.writers).remove(&id);
        if let Some(task) = lock(&self.connecting).remove(&id) {
            task.abort();
        }
        self.emit(TransportEvent::Disconnected { id, reason: None });
    }

    /// Forget a silent device unless it is linked or being connected.
    async fn expire(&self, id: DeviceId) {
        if lock(&self.connecting).contains_key(&id) {
            return;
        }
        let Ok(peripheral) = self.peripheral(id) else {
            lock(&self.last_seen).remove(&id);
            return;
        };
        // Linked peripherals stop advertising
        if peripheral.is_connected().await.unwrap_or(false) {
            lock(&self.last_seen).insert(id, Instant::now());
            return;
        }

        lock(&self.peripherals).remove(&id);
        lock(&self.last_seen).remove(&id);
        lock(&self.writers).remove(&id);
        tracing::debug!(id = %id, "device stopped advertising");
        self.emit(TransportEvent::Lost(id));
    }

    fn writer(&self, id: DeviceId, peripheral: Peripheral) -> mpsc::UnboundedSender<WriteJob> {
        lock(&self.writers)
            .entry(id)
            .or_insert_with(|| {
                let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
                self.runtime.spawn(async move {
                    while let Some(job) = rx.recv().await {
                        if let Err(e) = peripheral
                            .write(&job.characteristic, &job.bytes, WriteType::WithoutResponse)
                            .await
                        {
                            tracing::warn!(id = %id, error = %e, "write failed");
                        }
                    }
                    tracing::trace!(id = %id, "writer finished");
                });
                tx
            })
            .clone()
    }
}

async fn pump<S>(shared: Arc<Shared>, mut events: S)
where
    S: futures::Stream<Item = CentralEvent> + Unpin,
{
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(pid) | CentralEvent::DeviceUpdated(pid) => {
                shared.on_sighting(pid).await
            }
            CentralEvent::ServicesAdvertisement { id, .. } => shared.on_sighting(id).await,
            CentralEvent::DeviceDisconnected(pid) => shared.on_link_down(pid),
            // Connect tasks report their own outcome
            _ => {}
        }
    }
    tracing::debug!("central event stream ended");
}

async fn sweep(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let silent = stale_ids(&lock(&shared.last_seen), Instant::now(), LOST_AFTER);
        for id in silent {
            shared.expire(id).await;
        }
    }
}

/// Devices whose last sighting is at least `max_age` before `now`.
fn stale_ids(
    last_seen: &HashMap<DeviceId, Instant>,
    now: Instant,
    max_age: Duration,
) -> Vec<DeviceId> {
    let mut ids: Vec<DeviceId> = last_seen
        .iter()
        .filter(|(_, seen)| now.saturating_duration_since(**seen) >= max_age)
        .map(|(id, _)| *id)
        .collect();
    ids.sort();
    ids
}

impl TransportAdapter for BleTransport {
    fn state(&self) -> AdapterState {
        AdapterState::PoweredOn
    }

    fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    fn scan(&self, filter: &ServiceFilter) -> Result<(), TicketlineError> {
        self.shared.scanning.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let services = filter.to_vec();
        self.shared.runtime.spawn(async move {
            if let Err(e) = shared.adapter.start_scan(ScanFilter { services }).await {
                tracing::error!(error = %e, "scan failed to start");
                shared.scanning.store(false, Ordering::SeqCst);
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TicketlineError> {
        self.shared.scanning.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        self.shared.runtime.spawn(async move {
            if let Err(e) = shared.adapter.stop_scan().await {
                tracing::warn!(error = %e, "stop scan failed");
            }
        });
        Ok(())
    }

    fn connect(&self, id: DeviceId, timeout_hint: Duration) -> Result<(), TicketlineError> {
        let peripheral = self.shared.peripheral(id)?;
        let shared = Arc::clone(&self.shared);
        let task = self.shared.runtime.spawn(async move {
            let outcome = tokio::time::timeout(timeout_hint, peripheral.connect()).await;
            lock(&shared.connecting).remove(&id);
            match outcome {
                Ok(Ok(())) => shared.emit(TransportEvent::Connected(id)),
                Ok(Err(e)) => shared.emit(TransportEvent::FailedToConnect {
                    id,
                    reason: Some(e.to_string()),
                }),
                // The manager's own deadline reports the timeout
                Err(_) => tracing::debug!(id = %id, "connect request timed out"),
            }
        });

        if let Some(previous) = lock(&self.shared.connecting).insert(id, task.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    fn cancel_connect(&self, id: DeviceId) -> Result<(), TicketlineError> {
        if let Some(task) = lock(&self.shared.connecting).remove(&id) {
            task.abort();
        }
        // A link may already be half-established; tear it down too.
        self.disconnect(id)
    }

    fn disconnect(&self, id: DeviceId) -> Result<(), TicketlineError> {
        let peripheral = self.shared.peripheral(id)?;
        if let Some(task) = lock(&self.shared.connecting).remove(&id) {
            task.abort();
        }
        lock(&self.shared.writers).remove(&id);
        self.shared.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                tracing::warn!(id = %id, error = %e, "disconnect failed");
            }
        });
        Ok(())
    }

    fn discover_services(&self, id: DeviceId, filter: &ServiceFilter) -> Result<(), TicketlineError> {
        let peripheral = self.shared.peripheral(id)?;
        let shared = Arc::clone(&self.shared);
        let filter = filter.clone();
        self.shared.runtime.spawn(async move {
            let services = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .services()
                    .into_iter()
                    .map(|s| s.uuid)
                    .filter(|uuid| filter.contains(uuid))
                    .collect()),
                Err(e) => Err(e.to_string()),
            };
            shared.emit(TransportEvent::ServicesDiscovered { id, services });
        });
        Ok(())
    }

    fn discover_characteristics(&self, id: DeviceId, service: Uuid) -> Result<(), TicketlineError> {
        // btleplug resolves characteristics together with services.
        let peripheral = self.shared.peripheral(id)?;
        let characteristics = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| {
                s.characteristics
                    .iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        write_without_response: c
                            .properties
                            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                    })
                    .collect()
            })
            .ok_or_else(|| format!("service {} not discovered", service));

        self.shared.emit(TransportEvent::CharacteristicsDiscovered {
            id,
            service,
            characteristics,
        });
        Ok(())
    }

    fn write(
        &self,
        id: DeviceId,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> Result<(), TicketlineError> {
        let peripheral = self.shared.peripheral(id)?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
            .ok_or_else(|| {
                TicketlineError::Transport(format!(
                    "characteristic {} not found on {}",
                    characteristic.uuid, id
                ))
            })?;

        self.shared
            .writer(id, peripheral)
            .send(WriteJob {
                characteristic: target,
                bytes: bytes.to_vec(),
            })
            .map_err(|_| TicketlineError::Transport(format!("writer for {} stopped", id)))
    }
}

fn transport_error(e: btleplug::Error) -> TicketlineError {
    TicketlineError::Transport(e.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// TESTS
// ============================================================================

//! # Discovery Coordinator
//!
//! Drives a freshly linked device from `Connected` to `Writable`:
//!
//! 1. ask the transport for the configured services
//! 2. ask for the characteristics of every matching service
//! 3. attach the writable characteristic and mark the device `Writable`
//!
//! Discovery problems never tear the link down. A device whose discovery
//! fails or finds nothing simply goes back to `Connected`, where a reconnect
//! can try again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::config::ServiceFilter;
use crate::device::{CharacteristicHandle, ConnectionState, DeviceId, DeviceRecord};
use crate::registry::PeripheralRegistry;
use crate::transport::{CharacteristicInfo, TransportAdapter};

pub struct DiscoveryCoordinator<T: TransportAdapter> {
    transport: Arc<T>,
    registry: Arc<PeripheralRegistry>,
    filter: ServiceFilter,
    writable: Option<Uuid>,
    /// Characteristic lookups still outstanding, per device
    outstanding: Mutex<HashMap<DeviceId, usize>>,
}

impl<T: TransportAdapter> DiscoveryCoordinator<T> {
    pub fn new(
        transport: Arc<T>,
        registry: Arc<PeripheralRegistry>,
        filter: ServiceFilter,
        writable: Option<Uuid>,
    ) -> Self {
        Self {
            transport,
            registry,
            filter,
            writable,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// A link to `id` is up: register it if needed and request services.
    pub fn begin(&self, id: DeviceId) {
        self.registry.upsert(id, DeviceRecord::linked(id, None), |current| {
            current
                .transition(ConnectionState::Connected)
                .unwrap_or_else(|_| current.clone())
        });

        if let Err(e) = self.registry.transition(id, ConnectionState::Discovering) {
            tracing::warn!(id = %id, error = %e, "cannot start discovery");
            return;
        }
        self.lock().remove(&id);

        tracing::debug!(id = %id, "discovering services");
        if let Err(e) = self.transport.discover_services(id, &self.filter) {
            tracing::warn!(id = %id, error = %e, "service discovery request failed");
            self.give_up(id);
        }
    }

    pub fn on_services(&self, id: DeviceId, services: Result<Vec<Uuid>, String>) {
        if !self.is_discovering(id) {
            tracing::trace!(id = %id, "services for device not in discovery ignored");
            return;
        }

        let services = match services {
            Ok(services) => services,
            Err(reason) => {
                tracing::warn!(id = %id, reason = %reason, "service discovery failed");
                self.give_up(id);
                return;
            }
        };

        let matching: Vec<Uuid> = services
            .into_iter()
            .filter(|s| self.filter.contains(s))
            .collect();
        if matching.is_empty() {
            tracing::info!(id = %id, "no target service on device");
            self.give_up(id);
            return;
        }

        self.lock().insert(id, matching.len());
        for service in matching {
            tracing::debug!(id = %id, service = %service, "discovering characteristics");
            if let Err(e) = self.transport.discover_characteristics(id, service) {
                tracing::warn!(id = %id, service = %service, error = %e, "characteristic discovery request failed");
                self.settle_one(id);
            }
        }
    }

    pub fn on_characteristics(
        &self,
        id: DeviceId,
        service: Uuid,
        characteristics: Result<Vec<CharacteristicInfo>, String>,
    ) {
        if !self.is_discovering(id) {
            tracing::trace!(id = %id, "characteristics for device not in discovery ignored");
            return;
        }

        let found = match characteristics {
            Ok(list) => self.select(&list),
            Err(reason) => {
                tracing::warn!(id = %id, service = %service, reason = %reason, "characteristic discovery failed");
                None
            }
        };

        let Some(uuid) = found else {
            self.settle_one(id);
            return;
        };

        self.lock().remove(&id);
        let handle = CharacteristicHandle { service, uuid };
        match self.registry.update(id, |record| record.make_writable(handle)) {
            Ok(_) => tracing::info!(id = %id, characteristic = %uuid, "ready to print"),
            Err(e) => tracing::warn!(id = %id, error = %e, "could not mark writable"),
        }
    }

    /// Drop bookkeeping for a device that lost its link.
    pub fn forget(&self, id: DeviceId) {
        self.lock().remove(&id);
    }

    fn select(&self, list: &[CharacteristicInfo]) -> Option<Uuid> {
        match self.writable {
            Some(target) => list.iter().find(|c| c.uuid == target).map(|c| c.uuid),
            None => list.iter().find(|c| c.write_without_response).map(|c| c.uuid),
        }
    }

    /// One characteristic lookup came back empty.
    fn settle_one(&self, id: DeviceId) {
        let exhausted = {
            let mut outstanding = self.lock();
            match outstanding.get_mut(&id) {
                Some(left) if *left > 1 => {
                    *left -= 1;
                    false
                }
                _ => {
                    outstanding.remove(&id);
                    true
                }
            }
        };
        if exhausted {
            tracing::info!(id = %id, "no writable characteristic found");
            self.give_up(id);
        }
    }

    fn give_up(&self, id: DeviceId) {
        self.lock().remove(&id);
        if let Err(e) = self.registry.transition(id, ConnectionState::Connected) {
            tracing::debug!(id = %id, error = %e, "device left discovery meanwhile");
        }
    }

    fn is_discovering(&self, id: DeviceId) -> bool {
        self.registry
            .get(id)
            .is_some_and(|r| r.state() == ConnectionState::Discovering)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DeviceId, usize>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DeviceChange, EventSink, EventStream, ManagerEvent};
    use crate::transport::{RecordingTransport, TransportCall};

    const SERVICE: Uuid = Uuid::from_u128(0x1000);
    const OTHER_SERVICE: Uuid = Uuid::from_u128(0x2000);
    const WRITE_CHAR: Uuid = Uuid::from_u128(0x1001);
    const NOTIFY_CHAR: Uuid = Uuid::from_u128(0x1002);

    struct Fixture {
        transport: Arc<RecordingTransport>,
        registry: Arc<PeripheralRegistry>,
        coordinator: DiscoveryCoordinator<RecordingTransport>,
        stream: EventStream,
    }

    fn fixture(writable: Option<Uuid>) -> Fixture {
        let (transport, _events) = RecordingTransport::new();
        let transport = Arc::new(transport);
        let (sink, stream) = EventSink::channel();
        let registry = Arc::new(PeripheralRegistry::new(sink));
        let coordinator = DiscoveryCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            ServiceFilter::new([SERVICE, OTHER_SERVICE]),
            writable,
        );
        Fixture {
            transport,
            registry,
            coordinator,
            stream,
        }
    }

    fn id() -> DeviceId {
        DeviceId::new(Uuid::from_u128(7))
    }

    fn write_char() -> CharacteristicInfo {
        CharacteristicInfo {
            uuid: WRITE_CHAR,
            write_without_response: true,
        }
    }

    fn notify_char() -> CharacteristicInfo {
        CharacteristicInfo {
            uuid: NOTIFY_CHAR,
            write_without_response: false,
        }
    }

    fn state(fx: &Fixture) -> ConnectionState {
        fx.registry.get(id()).unwrap().state()
    }

    #[test]
    fn test_unknown_device_registered_lazily() {
        let mut fx = fixture(None);
        fx.coordinator.begin(id());

        match fx.stream.try_recv().unwrap() {
            ManagerEvent::Change(DeviceChange::Added(record)) => {
                assert_eq!(record.state(), ConnectionState::Connected)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(state(&fx), ConnectionState::Discovering);
        assert_eq!(fx.transport.calls(), vec![TransportCall::DiscoverServices(id())]);
    }

    #[test]
    fn test_full_discovery_reaches_writable() {
        let fx = fixture(Some(WRITE_CHAR));
        fx.coordinator.begin(id());
        fx.coordinator.on_services(id(), Ok(vec![SERVICE, Uuid::from_u128(0x9999)]));

        assert_eq!(
            fx.transport.count(|c| matches!(c, TransportCall::DiscoverCharacteristics(_, _))),
            1
        );

        fx.coordinator
            .on_characteristics(id(), SERVICE, Ok(vec![notify_char(), write_char()]));

        let record = fx.registry.get(id()).unwrap();
        assert!(record.is_writable());
        assert_eq!(
            record.characteristic(),
            Some(&CharacteristicHandle {
                service: SERVICE,
                uuid: WRITE_CHAR
            })
        );
    }

    #[test]
    fn test_without_configured_uuid_first_write_without_response_wins() {
        let fx = fixture(None);
        fx.coordinator.begin(id());
        fx.coordinator.on_services(id(), Ok(vec![SERVICE]));
        fx.coordinator
            .on_characteristics(id(), SERVICE, Ok(vec![notify_char(), write_char()]));

        let record = fx.registry.get(id()).unwrap();
        assert_eq!(record.characteristic().map(|c| c.uuid), Some(WRITE_CHAR));
    }

    #[test]
    fn test_service_error_keeps_link() {
        let fx = fixture(None);
        fx.coordinator.begin(id());
        fx.coordinator.on_services(id(), Err("GATT error".into()));

        assert_eq!(state(&fx), ConnectionState::Connected);
        assert_eq!(fx.transport.count(|c| matches!(c, TransportCall::Disconnect(_))), 0);
    }

    #[test]
    fn test_empty_service_list_is_nothing_found() {
        let fx = fixture(None);
        fx.coordinator.begin(id());
        fx.coordinator.on_services(id(), Ok(vec![]));
        assert_eq!(state(&fx), ConnectionState::Connected);
    }

    #[test]
    fn test_waits_for_every_service_before_giving_up() {
        let fx = fixture(Some(WRITE_CHAR));
        fx.coordinator.begin(id());
        fx.coordinator.on_services(id(), Ok(vec![SERVICE, OTHER_SERVICE]));

        fx.coordinator.on_characteristics(id(), OTHER_SERVICE, Ok(vec![]));
        assert_eq!(state(&fx), ConnectionState::Discovering);

        fx.coordinator.on_characteristics(id(), SERVICE, Ok(vec![write_char()]));
        assert_eq!(state(&fx), ConnectionState::Writable);
    }

    #[test]
    fn test_missing_characteristic_falls_back_to_connected() {
        let fx = fixture(Some(WRITE_CHAR));
        fx.coordinator.begin(id());
        fx.coordinator.on_services(id(), Ok(vec![SERVICE]));
        fx.coordinator
            .on_characteristics(id(), SERVICE, Err("insufficient authentication".into()));

        let record = fx.registry.get(id()).unwrap();
        assert_eq!(record.state(), ConnectionState::Connected);
        assert!(record.characteristic().is_none());
    }

    #[test]
    fn test_late_results_after_disconnect_ignored() {
        let fx = fixture(None);
        fx.coordinator.begin(id());
        fx.registry.transition(id(), ConnectionState::Disconnected).unwrap();
        fx.coordinator.forget(id());

        fx.coordinator.on_services(id(), Ok(vec![SERVICE]));
        fx.coordinator.on_characteristics(id(), SERVICE, Ok(vec![write_char()]));

        assert_eq!(state(&fx), ConnectionState::Disconnected);
        assert_eq!(
            fx.transport.count(|c| matches!(c, TransportCall::DiscoverCharacteristics(_, _))),
            0
        );
    }
}

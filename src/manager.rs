//! # Printer Manager
//!
//! The public face of the library. A [`PrinterManager`] owns the registry,
//! the connection supervisor, the discovery coordinator and the dispatcher,
//! and runs one background task (the engine) that consumes transport events
//! and expired connect deadlines strictly in order.
//!
//! ## Event Flow
//!
//! ```text
//! TransportEvent ──► engine ──► registry ──► EventStream (caller's task)
//!                      │
//!                      ├──► supervisor (deadlines, connect outcome)
//!                      └──► discovery  (services ─► characteristics ─► Writable)
//! ```
//!
//! Caller operations (`connect`, `print`, ...) never block: they update the
//! registry, issue a transport request and return. Outcomes arrive on the
//! [`EventStream`] returned by [`PrinterManager::new`].
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use ticketline::{ManagerConfig, PrinterManager, MemoryStore, RecordingTransport};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ticketline::TicketlineError> {
//! let (transport, transport_events) = RecordingTransport::new();
//! let (manager, mut events) = PrinterManager::new(
//!     ManagerConfig::default(),
//!     Arc::new(transport),
//!     transport_events,
//!     Box::new(MemoryStore::new()),
//! )?;
//!
//! manager.start_scan()?;
//! assert!(manager.nearby_devices().is_empty());
//! # drop(events.try_recv());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::autoconnect::{AutoConnectList, AutoConnectStore};
use crate::config::{ManagerConfig, ServiceFilter};
use crate::device::{ConnectionState, DeviceId, DeviceRecord};
use crate::discovery::DiscoveryCoordinator;
use crate::dispatcher::{DispatchSummary, PrintDispatcher, PrintTarget};
use crate::encoder::{CharacterEncoding, PayloadEncoder};
use crate::error::TicketlineError;
use crate::events::{ErrorReport, EventSink, EventStream};
use crate::registry::PeripheralRegistry;
use crate::supervisor::{ConnectionSupervisor, DeadlineExpired};
use crate::transport::{AdapterState, Advertisement, TransportAdapter, TransportEvent};

pub struct PrinterManager<T: TransportAdapter> {
    core: Arc<Core<T>>,
    engine: JoinHandle<()>,
}

struct Core<T: TransportAdapter> {
    filter: ServiceFilter,
    encoding: CharacterEncoding,
    transport: Arc<T>,
    registry: Arc<PeripheralRegistry>,
    supervisor: ConnectionSupervisor<T>,
    discovery: DiscoveryCoordinator<T>,
    dispatcher: PrintDispatcher<T>,
    auto_connect: AutoConnectList,
    sink: EventSink,
}

impl<T: TransportAdapter> PrinterManager<T> {
    /// Build a manager and start its engine on the current tokio runtime.
    ///
    /// `events` is the receiving half created together with `transport`.
    pub fn new(
        config: ManagerConfig,
        transport: Arc<T>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        store: Box<dyn AutoConnectStore>,
    ) -> Result<(Self, EventStream), TicketlineError> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| TicketlineError::Config(format!("no tokio runtime: {}", e)))?;

        let (sink, stream) = EventSink::channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let filter = config.service_filter();
        let registry = Arc::new(PeripheralRegistry::new(sink.clone()));

        let core = Arc::new(Core {
            supervisor: ConnectionSupervisor::new(
                Arc::clone(&transport),
                Arc::clone(&registry),
                sink.clone(),
                runtime.clone(),
                config.connect_timeout(),
                expired_tx,
            ),
            discovery: DiscoveryCoordinator::new(
                Arc::clone(&transport),
                Arc::clone(&registry),
                filter.clone(),
                config.writable_characteristic,
            ),
            dispatcher: PrintDispatcher::new(Arc::clone(&transport), Arc::clone(&registry)),
            auto_connect: AutoConnectList::load(store)?,
            filter,
            encoding: config.encoding,
            transport,
            registry,
            sink,
        });

        let engine = runtime.spawn(run_engine(Arc::clone(&core), events, expired_rx));
        tracing::debug!(services = ?core.filter.to_vec(), "printer manager started");

        Ok((Self { core, engine }, stream))
    }

    /// Scan for devices advertising the configured services.
    pub fn start_scan(&self) -> Result<(), TicketlineError> {
        self.core.start_scan()
    }

    pub fn stop_scan(&self) -> Result<(), TicketlineError> {
        self.core.transport.stop_scan()
    }

    pub fn connect(&self, id: DeviceId) -> Result<(), TicketlineError> {
        self.core.connect(id)
    }

    pub fn disconnect(&self, id: DeviceId) -> Result<(), TicketlineError> {
        self.core.supervisor.disconnect(id)
    }

    pub fn disconnect_all(&self) {
        self.core.supervisor.disconnect_all();
    }

    /// Snapshot of every known device.
    pub fn nearby_devices(&self) -> Vec<DeviceRecord> {
        self.core.registry.snapshot()
    }

    pub fn device(&self, id: DeviceId) -> Option<DeviceRecord> {
        self.core.registry.get(id)
    }

    /// Replace (and persist) the auto-connect list.
    pub fn set_auto_connect_targets<I>(&self, ids: I) -> Result<(), TicketlineError>
    where
        I: IntoIterator<Item = DeviceId>,
    {
        self.core.auto_connect.set(ids)
    }

    pub fn auto_connect_targets(&self) -> Vec<DeviceId> {
        self.core.auto_connect.ids()
    }

    /// True when at least one auto-connect target is writable.
    pub fn can_print(&self) -> bool {
        !self
            .core
            .dispatcher
            .ready(&self.core.auto_connect.ids())
            .is_empty()
    }

    /// Print with the configured character encoding.
    pub fn print<P>(&self, payload: &P, target: PrintTarget) -> DispatchSummary
    where
        P: PayloadEncoder + ?Sized,
    {
        self.print_with_encoding(payload, self.core.encoding, target)
    }

    /// Encode `payload` once and write it to every writable target.
    ///
    /// Targets that are not writable are skipped silently.
    pub fn print_with_encoding<P>(
        &self,
        payload: &P,
        encoding: CharacterEncoding,
        target: PrintTarget,
    ) -> DispatchSummary
    where
        P: PayloadEncoder + ?Sized,
    {
        let targets = match target {
            PrintTarget::Device(id) => vec![id],
            PrintTarget::AutoConnect => self.core.auto_connect.ids(),
        };

        let ready = self.core.dispatcher.ready(&targets);
        if ready.is_empty() {
            tracing::debug!(targets = targets.len(), "no writable target, nothing printed");
            return DispatchSummary::default();
        }

        let chunks = payload.encode(encoding);
        self.core.dispatcher.dispatch(&chunks, &ready)
    }
}

impl<T: TransportAdapter> Drop for PrinterManager<T> {
    fn drop(&mut self) {
        self.engine.abort();
        self.core.supervisor.cancel_all();
        self.core.supervisor.disconnect_all();
        tracing::debug!("printer manager stopped");
    }
}

impl<T: TransportAdapter> Core<T> {
    fn ensure_ready(&self) -> Result<(), TicketlineError> {
        if self.transport.state().is_ready() {
            Ok(())
        } else {
            Err(TicketlineError::DeviceNotReady)
        }
    }

    fn connect(&self, id: DeviceId) -> Result<(), TicketlineError> {
        self.ensure_ready()?;
        self.supervisor.connect(id)
    }

    fn start_scan(&self) -> Result<(), TicketlineError> {
        if self.transport.is_scanning() {
            return Ok(());
        }
        self.ensure_ready()?;
        tracing::info!("scanning for printers");
        self.transport.scan(&self.filter)
    }

    fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => self.on_state(state),
            TransportEvent::AdvertisementSeen(ad) => self.on_advertisement(ad),
            TransportEvent::Connected(id) => {
                if self.supervisor.on_connected(id) {
                    self.discovery.begin(id);
                }
            }
            TransportEvent::FailedToConnect { id, reason } => {
                self.discovery.forget(id);
                self.supervisor.on_failed(id, reason);
            }
            TransportEvent::Disconnected { id, reason } => {
                self.discovery.forget(id);
                self.supervisor.on_disconnected(id, reason);
            }
            TransportEvent::ServicesDiscovered { id, services } => {
                self.discovery.on_services(id, services)
            }
            TransportEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
            } => self.discovery.on_characteristics(id, service, characteristics),
            TransportEvent::Lost(id) => {
                tracing::info!(id = %id, "device lost");
                self.supervisor.forget(id);
                self.discovery.forget(id);
                self.registry.set(id, None);
            }
        }
    }

    fn on_state(&self, state: AdapterState) {
        tracing::info!(state = ?state, "adapter state changed");
        if !state.is_ready() {
            return;
        }
        if let Err(e) = self.start_scan() {
            tracing::warn!(error = %e, "could not start scanning");
            self.sink.error(ErrorReport::DeviceNotReady);
        }
    }

    fn on_advertisement(&self, ad: Advertisement) {
        if !ad.connectable || !self.filter.matches_any(&ad.services) {
            tracing::trace!(id = %ad.id, "advertisement filtered out");
            return;
        }

        let Advertisement { id, name, rssi, .. } = ad;
        let record = self.registry.upsert(
            id,
            DeviceRecord::sighted(id, name.clone(), rssi),
            |current| current.resighted(name, rssi),
        );

        if record.state() == ConnectionState::Disconnected && self.auto_connect.contains(id) {
            tracing::info!(id = %id, "auto-connecting");
            if let Err(e) = self.connect(id) {
                tracing::warn!(id = %id, error = %e, "auto-connect failed");
            }
        }
    }
}

async fn run_engine<T: TransportAdapter>(
    core: Arc<Core<T>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut expired: mpsc::UnboundedReceiver<DeadlineExpired>,
) {
    loop {
        tokio::select! {
            biased;
            Some(deadline) = expired.recv() => {
                core.supervisor.on_deadline(deadline);
            }
            event = events.recv() => match event {
                Some(event) => core.handle(event),
                None => {
                    tracing::debug!("transport event channel closed");
                    break;
                }
            },
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoconnect::MemoryStore;
    use crate::config::DEFAULT_PRINTER_SERVICE;
    use crate::events::{DeviceChange, ManagerEvent};
    use crate::transport::{RecordingTransport, TransportCall};
    use uuid::Uuid;

    fn manager(
        store: MemoryStore,
    ) -> (PrinterManager<RecordingTransport>, Arc<RecordingTransport>, EventStream) {
        let (transport, events) = RecordingTransport::new();
        let transport = Arc::new(transport);
        let (manager, stream) = PrinterManager::new(
            ManagerConfig::default(),
            Arc::clone(&transport),
            events,
            Box::new(store),
        )
        .unwrap();
        (manager, transport, stream)
    }

    fn advertisement(id: DeviceId) -> TransportEvent {
        TransportEvent::AdvertisementSeen(Advertisement {
            id,
            name: Some("PT-210".into()),
            services: vec![DEFAULT_PRINTER_SERVICE],
            connectable: true,
            rssi: Some(-60),
        })
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (transport, events) = RecordingTransport::new();
        let config = ManagerConfig {
            services: Vec::new(),
            ..ManagerConfig::default()
        };
        let result = PrinterManager::new(
            config,
            Arc::new(transport),
            events,
            Box::new(MemoryStore::new()),
        );
        assert!(matches!(result, Err(TicketlineError::Config(_))));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let (transport, events) = RecordingTransport::new();
        let result = PrinterManager::new(
            ManagerConfig::default(),
            Arc::new(transport),
            events,
            Box::new(MemoryStore::new()),
        );
        assert!(matches!(result, Err(TicketlineError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_scan_is_idempotent() {
        let (manager, transport, _stream) = manager(MemoryStore::new());
        manager.start_scan().unwrap();
        manager.start_scan().unwrap();
        assert_eq!(transport.count(|c| matches!(c, TransportCall::Scan(_))), 1);
    }

    #[tokio::test]
    async fn test_connect_requires_powered_adapter() {
        let (manager, transport, _stream) = manager(MemoryStore::new());
        transport.set_state(AdapterState::PoweredOff);
        let id = DeviceId::new(Uuid::from_u128(1));
        assert!(matches!(
            manager.connect(id),
            Err(TicketlineError::DeviceNotReady)
        ));
        assert!(matches!(
            manager.start_scan(),
            Err(TicketlineError::DeviceNotReady)
        ));
    }

    #[tokio::test]
    async fn test_filtered_advertisement_not_registered() {
        let (manager, transport, mut stream) = manager(MemoryStore::new());
        let stranger = DeviceId::new(Uuid::from_u128(1));
        let printer = DeviceId::new(Uuid::from_u128(2));

        transport.emit(TransportEvent::AdvertisementSeen(Advertisement {
            id: stranger,
            name: Some("Headphones".into()),
            services: vec![Uuid::from_u128(0xFFFF)],
            connectable: true,
            rssi: None,
        }));
        transport.emit(advertisement(printer));

        // Events are handled in order, so the printer's Added comes first
        match stream.recv().await.unwrap() {
            ManagerEvent::Change(DeviceChange::Added(record)) => assert_eq!(record.id(), printer),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(manager.device(stranger).is_none());
        assert_eq!(manager.nearby_devices().len(), 1);
    }

    /// States reported for `id` until `barrier` is added.
    ///
    /// Events are handled in order, so once the barrier shows up every
    /// earlier transport event has been processed.
    async fn states_until(
        stream: &mut EventStream,
        id: DeviceId,
        barrier: DeviceId,
    ) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        loop {
            match stream.recv().await.unwrap() {
                ManagerEvent::Change(DeviceChange::Added(r)) if r.id() == barrier => return states,
                ManagerEvent::Change(DeviceChange::Added(r) | DeviceChange::Updated(r))
                    if r.id() == id =>
                {
                    states.push(r.state())
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_auto_connect_on_sighting() {
        let id = DeviceId::new(Uuid::from_u128(7));
        let barrier = DeviceId::new(Uuid::from_u128(8));
        let (manager, transport, mut stream) = manager(MemoryStore::with_ids(vec![id]));
        assert_eq!(manager.auto_connect_targets(), vec![id]);

        transport.emit(advertisement(id));
        transport.emit(advertisement(id));
        transport.emit(advertisement(barrier));

        assert_eq!(
            states_until(&mut stream, id, barrier).await,
            vec![ConnectionState::Disconnected, ConnectionState::Connecting]
        );
        assert_eq!(transport.count(|c| *c == TransportCall::Connect(id)), 1);
    }

    #[tokio::test]
    async fn test_auto_connect_waits_for_powered_adapter() {
        let id = DeviceId::new(Uuid::from_u128(7));
        let barrier = DeviceId::new(Uuid::from_u128(8));
        let (manager, transport, mut stream) = manager(MemoryStore::with_ids(vec![id]));
        transport.set_state(AdapterState::PoweredOff);

        transport.emit(advertisement(id));
        transport.emit(advertisement(barrier));

        assert_eq!(
            states_until(&mut stream, id, barrier).await,
            vec![ConnectionState::Disconnected]
        );
        assert_eq!(transport.count(|c| matches!(c, TransportCall::Connect(_))), 0);
        assert_eq!(manager.device(id).unwrap().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_print_without_writable_target_does_nothing() {
        let (manager, transport, _stream) = manager(MemoryStore::new());
        let id = DeviceId::new(Uuid::from_u128(3));

        let summary = manager.print(&crate::encoder::TextBlock::new("hello"), PrintTarget::Device(id));

        assert_eq!(summary, DispatchSummary::default());
        assert!(!manager.can_print());
        assert_eq!(transport.count(|c| matches!(c, TransportCall::Write(..))), 0);
    }
}

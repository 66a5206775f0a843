//! # Recording Transport
//!
//! An in-process [`TransportAdapter`] that performs no I/O. It logs every
//! request as a [`TransportCall`] and forwards events pushed with
//! [`RecordingTransport::emit`] to the manager, which makes it suitable for
//! tests and dry runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{AdapterState, TransportAdapter, TransportEvent};
use crate::config::ServiceFilter;
use crate::device::{CharacteristicHandle, DeviceId};
use crate::error::TicketlineError;

/// A request observed by the [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Scan(Vec<Uuid>),
    StopScan,
    Connect(DeviceId),
    CancelConnect(DeviceId),
    Disconnect(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId, Uuid),
    Write(DeviceId, CharacteristicHandle, Vec<u8>),
}

pub struct RecordingTransport {
    state: Mutex<AdapterState>,
    scanning: AtomicBool,
    fail_writes: AtomicBool,
    calls: Mutex<Vec<TransportCall>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl RecordingTransport {
    /// A powered-on transport and the event channel the manager consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Mutex::new(AdapterState::PoweredOn),
            scanning: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            events,
        };
        (transport, rx)
    }

    /// Deliver an event as if the hardware produced it.
    pub fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("transport event dropped, manager is gone");
        }
    }

    /// Change the adapter state and announce it.
    pub fn set_state(&self, state: AdapterState) {
        *lock(&self.state) = state;
        if !state.is_ready() {
            self.scanning.store(false, Ordering::SeqCst);
        }
        self.emit(TransportEvent::StateChanged(state));
    }

    /// Make every subsequent `write` fail synchronously.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.calls).clone()
    }

    /// Payloads written to `id`, in order.
    pub fn writes_to(&self, id: DeviceId) -> Vec<Vec<u8>> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write(target, _, bytes) if *target == id => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        lock(&self.calls).iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: TransportCall) {
        lock(&self.calls).push(call);
    }

    fn require_ready(&self) -> Result<(), TicketlineError> {
        if lock(&self.state).is_ready() {
            Ok(())
        } else {
            Err(TicketlineError::DeviceNotReady)
        }
    }
}

impl TransportAdapter for RecordingTransport {
    fn state(&self) -> AdapterState {
        *lock(&self.state)
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn scan(&self, filter: &ServiceFilter) -> Result<(), TicketlineError> {
        self.require_ready()?;
        self.scanning.store(true, Ordering::SeqCst);
        self.record(TransportCall::Scan(filter.to_vec()));
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), TicketlineError> {
        self.scanning.store(false, Ordering::SeqCst);
        self.record(TransportCall::StopScan);
        Ok(())
    }

    fn connect(&self, id: DeviceId, _timeout_hint: Duration) -> Result<(), TicketlineError> {
        self.require_ready()?;
        self.record(TransportCall::Connect(id));
        Ok(())
    }

    fn cancel_connect(&self, id: DeviceId) -> Result<(), TicketlineError> {
        self.record(TransportCall::CancelConnect(id));
        Ok(())
    }

    fn disconnect(&self, id: DeviceId) -> Result<(), TicketlineError> {
        self.record(TransportCall::Disconnect(id));
        Ok(())
    }

    fn discover_services(
        &self,
        id: DeviceId,
        _filter: &ServiceFilter,
    ) -> Result<(), TicketlineError> {
        self.record(TransportCall::DiscoverServices(id));
        Ok(())
    }

    fn discover_characteristics(
        &self,
        id: DeviceId,
        service: Uuid,
    ) -> Result<(), TicketlineError> {
        self.record(TransportCall::DiscoverCharacteristics(id, service));
        Ok(())
    }

    fn write(
        &self,
        id: DeviceId,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> Result<(), TicketlineError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TicketlineError::Transport(format!("write to {} failed", id)));
        }
        self.record(TransportCall::Write(id, *characteristic, bytes.to_vec()));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

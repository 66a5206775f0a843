//! # Connection Supervisor
//!
//! Issues connect/disconnect requests and bounds every connect attempt with a
//! deadline.
//!
//! ## Attempt Lifecycle
//!
//! ```text
//! connect(id) ──► Connecting, deadline armed ──┬── Connected ────────► timer cancelled, discovery
//!                                              ├── FailedToConnect ──► Disconnected + ConnectFailed
//!                                              └── deadline expires ─► Disconnected, cancel-connect
//! ```
//!
//! Whichever terminal event arrives first wins; the other two become no-ops.
//! An attempt that timed out or was cancelled with `disconnect` is remembered
//! as abandoned so that a late `Connected` cannot bring the device back. It is
//! answered with a disconnect. The mark lasts until the next `connect`.
//!
//! Each connecting device has its own deadline. Calling `connect` again for
//! the same device supersedes that device's previous attempt.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::device::{ConnectionState, DeviceId};
use crate::error::TicketlineError;
use crate::events::{ErrorReport, EventSink};
use crate::registry::PeripheralRegistry;
use crate::timer::Deadline;
use crate::transport::TransportAdapter;

/// Message sent when a connect deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineExpired {
    pub id: DeviceId,
    pub attempt: u64,
}

/// A connect attempt still waiting for its outcome.
#[derive(Debug)]
pub struct PendingConnection {
    pub id: DeviceId,
    pub attempt: u64,
    deadline: Deadline,
}

#[derive(Debug, Default)]
struct Attempts {
    pending: HashMap<DeviceId, PendingConnection>,
    abandoned: HashSet<DeviceId>,
}

pub struct ConnectionSupervisor<T: TransportAdapter> {
    transport: Arc<T>,
    registry: Arc<PeripheralRegistry>,
    sink: EventSink,
    runtime: Handle,
    timeout: Duration,
    attempts: Mutex<Attempts>,
    next_attempt: AtomicU64,
    expired: mpsc::UnboundedSender<DeadlineExpired>,
}

impl<T: TransportAdapter> ConnectionSupervisor<T> {
    pub fn new(
        transport: Arc<T>,
        registry: Arc<PeripheralRegistry>,
        sink: EventSink,
        runtime: Handle,
        timeout: Duration,
        expired: mpsc::UnboundedSender<DeadlineExpired>,
    ) -> Self {
        Self {
            transport,
            registry,
            sink,
            runtime,
            timeout,
            attempts: Mutex::new(Attempts::default()),
            next_attempt: AtomicU64::new(1),
            expired,
        }
    }

    /// Start connecting to a known device.
    ///
    /// Devices that already have a link are left alone.
    pub fn connect(&self, id: DeviceId) -> Result<(), TicketlineError> {
        let record = self
            .registry
            .get(id)
            .ok_or(TicketlineError::DeviceNotFound(id))?;
        if record.state().is_linked() {
            tracing::debug!(id = %id, state = ?record.state(), "already connected");
            return Ok(());
        }

        self.registry.transition(id, ConnectionState::Connecting)?;

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let expired = self.expired.clone();
        let deadline = Deadline::arm(&self.runtime, self.timeout, move || {
            if expired.send(DeadlineExpired { id, attempt }).is_err() {
                tracing::trace!(id = %id, "deadline fired after shutdown");
            }
        });

        {
            let mut attempts = self.lock();
            attempts.abandoned.remove(&id);
            if let Some(previous) = attempts.pending.insert(
                id,
                PendingConnection {
                    id,
                    attempt,
                    deadline,
                },
            ) {
                previous.deadline.cancel();
                tracing::debug!(id = %id, attempt = previous.attempt, "superseded pending connect");
            }
        }

        tracing::info!(id = %id, attempt, timeout = ?self.timeout, "connecting");
        if let Err(e) = self.transport.connect(id, self.timeout) {
            self.clear_pending(id, attempt);
            self.revert_disconnected(id);
            return Err(e);
        }
        Ok(())
    }

    /// Handle an expired deadline. Returns whether it caused a transition.
    pub fn on_deadline(&self, expired: DeadlineExpired) -> bool {
        let pending = {
            let mut attempts = self.lock();
            let current = attempts
                .pending
                .get(&expired.id)
                .is_some_and(|p| p.attempt == expired.attempt);
            if current {
                attempts.abandoned.insert(expired.id);
                attempts.pending.remove(&expired.id)
            } else {
                None
            }
        };
        let Some(pending) = pending else {
            tracing::trace!(id = %expired.id, attempt = expired.attempt, "stale deadline ignored");
            return false;
        };
        pending.deadline.cancel();

        tracing::warn!(id = %expired.id, timeout = ?self.timeout, "connect timed out");
        self.revert_disconnected(expired.id);
        if let Err(e) = self.transport.cancel_connect(expired.id) {
            tracing::warn!(id = %expired.id, error = %e, "cancel-connect failed");
        }
        true
    }

    /// The transport reports a link. Returns whether discovery should proceed.
    pub fn on_connected(&self, id: DeviceId) -> bool {
        let (pending, abandoned) = {
            let mut attempts = self.lock();
            (attempts.pending.remove(&id), attempts.abandoned.remove(&id))
        };
        if let Some(pending) = pending {
            pending.deadline.cancel();
        }

        if abandoned {
            tracing::info!(id = %id, "link came up for an abandoned attempt, dropping it");
            if let Err(e) = self.transport.disconnect(id) {
                tracing::warn!(id = %id, error = %e, "disconnect failed");
            }
            return false;
        }

        tracing::info!(id = %id, "connected");
        true
    }

    pub fn on_failed(&self, id: DeviceId, reason: Option<String>) {
        if !self.settle(id) {
            tracing::debug!(id = %id, "connect failure for an abandoned attempt ignored");
            self.revert_disconnected(id);
            return;
        }
        tracing::warn!(id = %id, reason = reason.as_deref().unwrap_or("unknown"), "connect failed");
        self.revert_disconnected(id);
        self.sink.error(ErrorReport::ConnectFailed { id, reason });
    }

    pub fn on_disconnected(&self, id: DeviceId, reason: Option<String>) {
        if !self.settle(id) {
            tracing::debug!(id = %id, "disconnect for an abandoned attempt");
            self.revert_disconnected(id);
            return;
        }
        tracing::info!(id = %id, reason = reason.as_deref().unwrap_or("requested"), "disconnected");
        self.revert_disconnected(id);
    }

    /// Start tearing down the link to a known device.
    ///
    /// A connect still in flight is abandoned: if the link comes up later it
    /// is dropped again.
    pub fn disconnect(&self, id: DeviceId) -> Result<(), TicketlineError> {
        let record = self
            .registry
            .get(id)
            .ok_or(TicketlineError::DeviceNotFound(id))?;

        {
            let mut attempts = self.lock();
            if let Some(pending) = attempts.pending.remove(&id) {
                pending.deadline.cancel();
                attempts.abandoned.insert(id);
                tracing::debug!(id = %id, attempt = pending.attempt, "pending connect abandoned");
            }
        }

        if matches!(
            record.state(),
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return Ok(());
        }

        self.registry.transition(id, ConnectionState::Disconnecting)?;
        tracing::info!(id = %id, "disconnecting");
        self.transport.disconnect(id)
    }

    /// Disconnect every device that is linked or connecting.
    pub fn disconnect_all(&self) {
        for record in self.registry.snapshot() {
            let state = record.state();
            if state.is_linked() || state == ConnectionState::Connecting {
                if let Err(e) = self.disconnect(record.id()) {
                    tracing::warn!(id = %record.id(), error = %e, "disconnect failed");
                }
            }
        }
    }

    /// Drop all supervision state for a device that went away.
    pub fn forget(&self, id: DeviceId) {
        let mut attempts = self.lock();
        if let Some(pending) = attempts.pending.remove(&id) {
            pending.deadline.cancel();
        }
        attempts.abandoned.remove(&id);
    }

    /// Cancel every pending deadline.
    pub fn cancel_all(&self) {
        let mut attempts = self.lock();
        for (_, pending) in attempts.pending.drain() {
            pending.deadline.cancel();
        }
    }

    pub fn is_pending(&self, id: DeviceId) -> bool {
        self.lock().pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Clear the attempt for a terminal transport event.
    ///
    /// Returns `false` when the attempt was abandoned. The mark is kept so a
    /// `Connected` that arrives even later is still dropped.
    fn settle(&self, id: DeviceId) -> bool {
        let mut attempts = self.lock();
        if let Some(pending) = attempts.pending.remove(&id) {
            pending.deadline.cancel();
        }
        !attempts.abandoned.contains(&id)
    }

    fn clear_pending(&self, id: DeviceId, attempt: u64) {
        let mut attempts = self.lock();
        if attempts.pending.get(&id).is_some_and(|p| p.attempt == attempt) {
            if let Some(pending) = attempts.pending.remove(&id) {
                pending.deadline.cancel();
            }
        }
    }

    fn revert_disconnected(&self, id: DeviceId) {
        if !self.registry.contains(id) {
            return;
        }
        if let Err(e) = self.registry.transition(id, ConnectionState::Disconnected) {
            tracing::warn!(id = %id, error = %e, "could not mark disconnected");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Attempts> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRecord;
    use crate::events::{DeviceChange, EventStream, ManagerEvent};
    use crate::transport::{RecordingTransport, TransportCall};
    use uuid::Uuid;

    struct Fixture {
        transport: Arc<RecordingTransport>,
        registry: Arc<PeripheralRegistry>,
        supervisor: ConnectionSupervisor<RecordingTransport>,
        stream: EventStream,
        expired: mpsc::UnboundedReceiver<DeadlineExpired>,
    }

    fn fixture() -> Fixture {
        let (transport, _events) = RecordingTransport::new();
        let transport = Arc::new(transport);
        let (sink, stream) = EventSink::channel();
        let registry = Arc::new(PeripheralRegistry::new(sink.clone()));
        let (tx, expired) = mpsc::unbounded_channel();
        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            sink,
            Handle::current(),
            Duration::from_secs(15),
            tx,
        );
        Fixture {
            transport,
            registry,
            supervisor,
            stream,
            expired,
        }
    }

    fn device(fx: &Fixture, n: u128) -> DeviceId {
        let id = DeviceId::new(Uuid::from_u128(n));
        fx.registry.set(id, Some(DeviceRecord::sighted(id, None, None)));
        id
    }

    fn states(stream: &mut EventStream) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(event) = stream.try_recv() {
            if let ManagerEvent::Change(DeviceChange::Updated(record)) = event {
                states.push(record.state());
            }
        }
        states
    }

    #[tokio::test]
    async fn test_connect_unknown_device() {
        let fx = fixture();
        let id = DeviceId::new(Uuid::from_u128(42));
        assert!(matches!(
            fx.supervisor.connect(id),
            Err(TicketlineError::DeviceNotFound(_))
        ));
        assert!(fx.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_connect_marks_connecting_and_arms_deadline() {
        let mut fx = fixture();
        let id = device(&fx, 1);
        states(&mut fx.stream);

        fx.supervisor.connect(id).unwrap();

        assert_eq!(states(&mut fx.stream), vec![ConnectionState::Connecting]);
        assert!(fx.supervisor.is_pending(id));
        assert_eq!(fx.transport.calls(), vec![TransportCall::Connect(id)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_disconnects_once() {
        let mut fx = fixture();
        let id = device(&fx, 1);
        fx.supervisor.connect(id).unwrap();
        states(&mut fx.stream);

        let expired = fx.expired.recv().await.unwrap();
        assert_eq!(expired.id, id);

        assert!(fx.supervisor.on_deadline(expired));
        assert!(!fx.supervisor.on_deadline(expired));

        assert_eq!(states(&mut fx.stream), vec![ConnectionState::Disconnected]);
        assert_eq!(fx.transport.count(|c| *c == TransportCall::CancelConnect(id)), 1);
        assert!(!fx.supervisor.is_pending(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_connect_after_timeout_is_dropped() {
        let mut fx = fixture();
        let id = device(&fx, 1);
        fx.supervisor.connect(id).unwrap();
        let expired = fx.expired.recv().await.unwrap();
        fx.supervisor.on_deadline(expired);
        states(&mut fx.stream);

        assert!(!fx.supervisor.on_connected(id));
        assert_eq!(fx.transport.count(|c| *c == TransportCall::Disconnect(id)), 1);
        assert_eq!(fx.registry.get(id).unwrap().state(), ConnectionState::Disconnected);
        assert!(states(&mut fx.stream).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_cancels_deadline() {
        let fx = fixture();
        let id = device(&fx, 1);
        fx.supervisor.connect(id).unwrap();

        assert!(fx.supervisor.on_connected(id));
        assert!(!fx.supervisor.is_pending(id));

        // The timer was aborted, so even a stale message would be ignored
        assert!(!fx.supervisor.on_deadline(DeadlineExpired { id, attempt: 1 }));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fx.transport.count(|c| matches!(c, TransportCall::CancelConnect(_))), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_supersedes_previous_deadline() {
        let mut fx = fixture();
        let id = device(&fx, 1);
        fx.supervisor.connect(id).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        fx.supervisor.connect(id).unwrap();
        assert_eq!(fx.supervisor.pending_count(), 1);

        // Only the second attempt's deadline fires, 15s after it was armed
        let expired = fx.expired.recv().await.unwrap();
        assert_eq!(expired.attempt, 2);
        assert!(fx.supervisor.on_deadline(expired));
        assert!(!fx.supervisor.on_deadline(DeadlineExpired { id, attempt: 1 }));
    }

    #[tokio::test]
    async fn test_failed_connect_reports_error() {
        let mut fx = fixture();
        let id = device(&fx, 1);
        fx.supervisor.connect(id).unwrap();
        while fx.stream.try_recv().is_ok() {}

        fx.supervisor.on_failed(id, Some("peer rejected".into()));

        let mut saw_error = false;
        let mut saw_disconnected = false;
        while let Ok(event) = fx.stream.try_recv() {
            match event {
                ManagerEvent::Error(ErrorReport::ConnectFailed { id: failed, reason }) => {
                    assert_eq!(failed, id);
                    assert_eq!(reason.as_deref(), Some("peer rejected"));
                    saw_error = true;
                }
                ManagerEvent::Change(DeviceChange::Updated(record)) => {
                    saw_disconnected = record.state() == ConnectionState::Disconnected;
                }
                _ => {}
            }
        }
        assert!(saw_error && saw_disconnected);
        assert!(!fx.supervisor.is_pending(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_timeout_is_silent() {
        let mut fx = fixture();
        let id = device(&fx, 1);
        fx.supervisor.connect(id).unwrap();
        let expired = fx.expired.recv().await.unwrap();
        fx.supervisor.on_deadline(expired);
        while fx.stream.try_recv().is_ok() {}

        fx.supervisor.on_failed(id, None);
        assert!(fx.stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_requires_known_device() {
        let fx = fixture();
        let id = DeviceId::new(Uuid::from_u128(5));
        assert!(matches!(
            fx.supervisor.disconnect(id),
            Err(TicketlineError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_marks_disconnecting() {
        let mut fx = fixture();
        let id = device(&fx, 1);
        fx.supervisor.connect(id).unwrap();
        fx.supervisor.on_connected(id);
        fx.registry.transition(id, ConnectionState::Connected).unwrap();
        states(&mut fx.stream);

        fx.supervisor.disconnect(id).unwrap();

        assert_eq!(states(&mut fx.stream), vec![ConnectionState::Disconnecting]);
        assert_eq!(fx.transport.count(|c| *c == TransportCall::Disconnect(id)), 1);
    }

    #[tokio::test]
    async fn test_disconnect_all_skips_idle_devices() {
        let fx = fixture();
        let idle = device(&fx, 1);
        let busy = device(&fx, 2);
        fx.supervisor.connect(busy).unwrap();

        fx.supervisor.disconnect_all();

        assert_eq!(fx.transport.count(|c| *c == TransportCall::Disconnect(busy)), 1);
        assert_eq!(fx.transport.count(|c| *c == TransportCall::Disconnect(idle)), 0);
        assert_eq!(fx.supervisor.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_link_after_cancelled_connect_is_dropped() {
        let mut fx = fixture();
        let id = device(&fx, 1);
        fx.supervisor.connect(id).unwrap();
        fx.supervisor.disconnect(id).unwrap();
        fx.supervisor.on_disconnected(id, None);
        assert_eq!(
            states(&mut fx.stream),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );

        // The platform finishes the cancelled connect anyway
        assert!(!fx.supervisor.on_connected(id));

        assert_eq!(fx.registry.get(id).unwrap().state(), ConnectionState::Disconnected);
        assert_eq!(fx.transport.count(|c| *c == TransportCall::Disconnect(id)), 2);
        assert!(states(&mut fx.stream).is_empty());
    }

    #[tokio::test]
    async fn test_connect_after_cancel_is_supervised_again() {
        let fx = fixture();
        let id = device(&fx, 1);
        fx.supervisor.connect(id).unwrap();
        fx.supervisor.disconnect(id).unwrap();
        fx.supervisor.on_disconnected(id, None);

        fx.supervisor.connect(id).unwrap();
        assert!(fx.supervisor.on_connected(id));
    }
}

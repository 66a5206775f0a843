//! # Peripheral Registry
//!
//! Thread-safe map from [`DeviceId`] to [`DeviceRecord`], the single source of
//! truth for which devices exist and what state they are in.
//!
//! The registry is written from the transport's event context and read from
//! caller operations, so every access goes through one mutex. Change
//! notifications are computed while the lock is held and emitted after it is
//! released, so a listener may call back into the registry freely.
//!
//! ## Notifications
//!
//! | Before | After | Notification |
//! |--------|-------|--------------|
//! | absent | present | `Added(record)` |
//! | present | present | `Updated(record)` |
//! | present | absent | `Removed(id)` |
//! | absent | absent | none |

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::device::{ConnectionState, DeviceId, DeviceRecord};
use crate::error::TicketlineError;
use crate::events::{DeviceChange, EventSink};

pub struct PeripheralRegistry {
    devices: Mutex<BTreeMap<DeviceId, DeviceRecord>>,
    sink: EventSink,
}

impl PeripheralRegistry {
    pub fn new(sink: EventSink) -> Self {
        Self {
            devices: Mutex::new(BTreeMap::new()),
            sink,
        }
    }

    pub fn get(&self, id: DeviceId) -> Option<DeviceRecord> {
        self.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Register, replace, or (with `None`) deregister a device.
    pub fn set(&self, id: DeviceId, record: Option<DeviceRecord>) {
        let change = {
            let mut devices = self.lock();
            match record {
                Some(record) => match devices.insert(id, record.clone()) {
                    None => Some(DeviceChange::Added(record)),
                    Some(_) => Some(DeviceChange::Updated(record)),
                },
                None => devices.remove(&id).map(|_| DeviceChange::Removed(id)),
            }
        };

        if let Some(change) = change {
            self.notify(change);
        }
    }

    /// Atomically replace an existing record with `f(current)`.
    ///
    /// No notification fires when the new record equals the old one.
    pub fn update<F>(&self, id: DeviceId, f: F) -> Result<DeviceRecord, TicketlineError>
    where
        F: FnOnce(&DeviceRecord) -> Result<DeviceRecord, TicketlineError>,
    {
        let next = {
            let mut devices = self.lock();
            let current = devices.get(&id).ok_or(TicketlineError::DeviceNotFound(id))?;
            let next = f(current)?;
            if &next == current {
                return Ok(next);
            }
            devices.insert(id, next.clone());
            next
        };

        self.notify(DeviceChange::Updated(next.clone()));
        Ok(next)
    }

    /// Move an existing device to `state`.
    pub fn transition(
        &self,
        id: DeviceId,
        state: ConnectionState,
    ) -> Result<DeviceRecord, TicketlineError> {
        self.update(id, |record| {
            if record.state() == state {
                Ok(record.clone())
            } else {
                record.transition(state)
            }
        })
    }

    /// Insert `fresh` when absent, otherwise replace the record with `refresh(current)`.
    pub fn upsert<F>(&self, id: DeviceId, fresh: DeviceRecord, refresh: F) -> DeviceRecord
    where
        F: FnOnce(&DeviceRecord) -> DeviceRecord,
    {
        let (record, change) = {
            let mut devices = self.lock();
            match devices.get(&id) {
                None => {
                    devices.insert(id, fresh.clone());
                    (fresh.clone(), Some(DeviceChange::Added(fresh)))
                }
                Some(current) => {
                    let next = refresh(current);
                    if &next == current {
                        (next, None)
                    } else {
                        devices.insert(id, next.clone());
                        (next.clone(), Some(DeviceChange::Updated(next)))
                    }
                }
            }
        };

        if let Some(change) = change {
            self.notify(change);
        }
        record
    }

    /// Copy of every record, ordered by identifier.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn notify(&self, change: DeviceChange) {
        match &change {
            DeviceChange::Added(record) => {
                tracing::trace!(id = %record.id(), state = ?record.state(), "device added")
            }
            DeviceChange::Updated(record) => {
                tracing::trace!(id = %record.id(), state = ?record.state(), "device updated")
            }
            DeviceChange::Removed(id) => tracing::trace!(id = %id, "device removed"),
        }
        self.sink.change(change);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<DeviceId, DeviceRecord>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventStream, ManagerEvent};
    use std::sync::Arc;
    use uuid::Uuid;

    fn registry() -> (PeripheralRegistry, EventStream) {
        let (sink, stream) = EventSink::channel();
        (PeripheralRegistry::new(sink), stream)
    }

    fn id(n: u128) -> DeviceId {
        DeviceId::new(Uuid::from_u128(n))
    }

    fn drain(stream: &mut EventStream) -> Vec<DeviceChange> {
        let mut changes = Vec::new();
        while let Ok(event) = stream.try_recv() {
            if let ManagerEvent::Change(change) = event {
                changes.push(change);
            }
        }
        changes
    }

    #[test]
    fn test_added_once_removed_once() {
        let (registry, mut stream) = registry();
        let a = id(1);

        registry.set(a, Some(DeviceRecord::sighted(a, None, Some(-80))));
        registry.set(a, Some(DeviceRecord::sighted(a, None, Some(-70))));
        registry.set(a, Some(DeviceRecord::sighted(a, Some("P".into()), Some(-60))));
        registry.set(a, None);
        registry.set(a, None);

        let changes = drain(&mut stream);
        let added = changes.iter().filter(|c| matches!(c, DeviceChange::Added(_))).count();
        let updated = changes.iter().filter(|c| matches!(c, DeviceChange::Updated(_))).count();
        let removed = changes.iter().filter(|c| matches!(c, DeviceChange::Removed(_))).count();

        assert_eq!(added, 1);
        assert_eq!(updated, 2);
        assert_eq!(removed, 1);
        assert!(matches!(changes.last(), Some(DeviceChange::Removed(r)) if *r == a));
    }

    #[test]
    fn test_removing_unknown_id_is_silent() {
        let (registry, mut stream) = registry();
        registry.set(id(9), None);
        assert!(drain(&mut stream).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_transition_unknown_device() {
        let (registry, _stream) = registry();
        let result = registry.transition(id(3), ConnectionState::Connecting);
        assert!(matches!(result, Err(TicketlineError::DeviceNotFound(_))));
    }

    #[test]
    fn test_transition_same_state_emits_nothing() {
        let (registry, mut stream) = registry();
        let a = id(1);
        registry.set(a, Some(DeviceRecord::sighted(a, None, None)));
        drain(&mut stream);

        registry.transition(a, ConnectionState::Disconnected).unwrap();
        assert!(drain(&mut stream).is_empty());

        registry.transition(a, ConnectionState::Connecting).unwrap();
        let changes = drain(&mut stream);
        assert_eq!(changes.len(), 1);
        match &changes[0] {
            DeviceChange::Updated(record) => assert_eq!(record.state(), ConnectionState::Connecting),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rejected_transition_leaves_record() {
        let (registry, mut stream) = registry();
        let a = id(1);
        registry.set(a, Some(DeviceRecord::sighted(a, None, None)));
        drain(&mut stream);

        assert!(registry.transition(a, ConnectionState::Discovering).is_err());
        assert_eq!(registry.get(a).unwrap().state(), ConnectionState::Disconnected);
        assert!(drain(&mut stream).is_empty());
    }

    #[test]
    fn test_upsert_only_notifies_on_change() {
        let (registry, mut stream) = registry();
        let a = id(1);
        let fresh = DeviceRecord::sighted(a, Some("P".into()), Some(-50));

        registry.upsert(a, fresh.clone(), |r| r.resighted(Some("P".into()), Some(-50)));
        registry.upsert(a, fresh.clone(), |r| r.resighted(Some("P".into()), Some(-50)));
        registry.upsert(a, fresh, |r| r.resighted(None, Some(-40)));

        let changes = drain(&mut stream);
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], DeviceChange::Added(_)));
        assert!(matches!(changes[1], DeviceChange::Updated(_)));
    }

    #[test]
    fn test_snapshot_ordered_by_id() {
        let (registry, _stream) = registry();
        for n in [3, 1, 2] {
            registry.set(id(n), Some(DeviceRecord::sighted(id(n), None, None)));
        }
        let ids: Vec<_> = registry.snapshot().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn test_concurrent_writers_single_added_each() {
        let (registry, mut stream) = registry();
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for n in 0..50u128 {
                        let d = id(n);
                        registry.upsert(d, DeviceRecord::sighted(d, None, None), |r| {
                            r.resighted(None, Some(t))
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let added = drain(&mut stream)
            .into_iter()
            .filter(|c| matches!(c, DeviceChange::Added(_)))
            .count();
        assert_eq!(added, 50);
        assert_eq!(registry.len(), 50);
    }
}

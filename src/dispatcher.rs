//! # Print Dispatcher
//!
//! Sends encoded payload chunks to writable devices.
//!
//! Every chunk becomes exactly one write-without-response call, in the order
//! the encoder produced it. Targets are served one after another, each to
//! completion, so chunks for one device never interleave with another's.
//! Targets that are not `Writable` are skipped without error.

use std::sync::Arc;

use crate::device::DeviceId;
use crate::registry::PeripheralRegistry;
use crate::transport::TransportAdapter;

/// Where a print goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrintTarget {
    /// One specific device
    Device(DeviceId),
    /// Every device on the auto-connect list
    AutoConnect,
}

/// What a dispatch actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Targets that were writable and received the payload
    pub devices: usize,
    /// Write calls issued across all targets
    pub writes: usize,
}

pub struct PrintDispatcher<T: TransportAdapter> {
    transport: Arc<T>,
    registry: Arc<PeripheralRegistry>,
}

impl<T: TransportAdapter> PrintDispatcher<T> {
    pub fn new(transport: Arc<T>, registry: Arc<PeripheralRegistry>) -> Self {
        Self {
            transport,
            registry,
        }
    }

    /// Targets among `ids` that can take a payload right now.
    pub fn ready(&self, ids: &[DeviceId]) -> Vec<DeviceId> {
        ids.iter()
            .copied()
            .filter(|id| self.registry.get(*id).is_some_and(|r| r.is_writable()))
            .collect()
    }

    pub fn dispatch(&self, chunks: &[Vec<u8>], targets: &[DeviceId]) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        for &id in targets {
            let Some(record) = self.registry.get(id) else {
                tracing::debug!(id = %id, "print target unknown, skipped");
                continue;
            };
            let Some(characteristic) = record.characteristic().copied().filter(|_| record.is_writable())
            else {
                tracing::debug!(id = %id, state = ?record.state(), "print target not writable, skipped");
                continue;
            };

            let mut written = 0;
            for chunk in chunks {
                if let Err(e) = self.transport.write(id, &characteristic, chunk) {
                    tracing::warn!(id = %id, chunk = written, error = %e, "write failed, abandoning payload");
                    break;
                }
                written += 1;
            }

            tracing::debug!(id = %id, chunks = written, "payload dispatched");
            summary.devices += 1;
            summary.writes += written;
        }

        summary
    }
}

// ============================================================================
// TESTS
// ============================================================================

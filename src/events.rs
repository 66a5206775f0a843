//! # Manager Events
//!
//! Everything the manager tells its owner travels through one channel of
//! [`ManagerEvent`]s: registry changes and asynchronous error reports.
//! The receiving half is polled on whatever task the caller chooses, which is
//! how events reach the caller's execution context.

use tokio::sync::mpsc;

use crate::device::{DeviceId, DeviceRecord};

/// A change to the set of nearby devices.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceChange {
    Added(DeviceRecord),
    Updated(DeviceRecord),
    /// The record is gone, only the identifier remains
    Removed(DeviceId),
}

/// Failures reported asynchronously rather than returned from a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReport {
    /// Scanning could not start because the adapter is not powered on
    DeviceNotReady,
    /// The transport failed to establish a link
    ConnectFailed {
        id: DeviceId,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    Change(DeviceChange),
    Error(ErrorReport),
}

/// Receiving half handed to the manager's owner.
pub type EventStream = mpsc::UnboundedReceiver<ManagerEvent>;

/// Sending half shared by the components that report upward.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn change(&self, change: DeviceChange) {
        self.emit(ManagerEvent::Change(change));
    }

    pub fn error(&self, report: ErrorReport) {
        self.emit(ManagerEvent::Error(report));
    }

    fn emit(&self, event: ManagerEvent) {
        // A dropped stream only means nobody is listening anymore.
        if self.tx.send(event).is_err() {
            tracing::trace!("event stream closed, dropping event");
        }
    }
}

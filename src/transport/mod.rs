//! # Printer Transport Layer
//!
//! The boundary to the Bluetooth stack. A [`TransportAdapter`] accepts
//! fire-and-forget requests (scan, connect, discover, write) and reports what
//! happened later as [`TransportEvent`]s on a channel created alongside it.
//! Events arrive serially, in the order the hardware produced them.
//!
//! ## Available Transports
//!
//! - [`mock`]: records every request and lets callers inject events
//! - [`ble`] (feature `ble`): the platform BLE stack via btleplug

pub mod mock;

#[cfg(feature = "ble")]
pub mod ble;

use std::time::Duration;

use uuid::Uuid;

use crate::config::ServiceFilter;
use crate::device::{CharacteristicHandle, DeviceId};
use crate::error::TicketlineError;

pub use mock::{RecordingTransport, TransportCall};

/// Power/ready state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_ready(self) -> bool {
        self == AdapterState::PoweredOn
    }
}

/// One advertisement sighting.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub id: DeviceId,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
    pub connectable: bool,
    pub rssi: Option<i16>,
}

/// A characteristic found inside a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub write_without_response: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged(AdapterState),
    AdvertisementSeen(Advertisement),
    /// Link established, either on request or found already up at startup
    Connected(DeviceId),
    FailedToConnect {
        id: DeviceId,
        reason: Option<String>,
    },
    Disconnected {
        id: DeviceId,
        reason: Option<String>,
    },
    ServicesDiscovered {
        id: DeviceId,
        services: Result<Vec<Uuid>, String>,
    },
    CharacteristicsDiscovered {
        id: DeviceId,
        service: Uuid,
        characteristics: Result<Vec<CharacteristicInfo>, String>,
    },
    /// The device is no longer reachable
    Lost(DeviceId),
}

/// Requests into the Bluetooth stack.
///
/// Every method returns as soon as the request is issued; outcomes are
/// delivered as [`TransportEvent`]s. Writes are write-without-response and
/// carry no delivery guarantee.
pub trait TransportAdapter: Send + Sync + 'static {
    fn state(&self) -> AdapterState;

    fn is_scanning(&self) -> bool;

    fn scan(&self, filter: &ServiceFilter) -> Result<(), TicketlineError>;

    fn stop_scan(&self) -> Result<(), TicketlineError>;

    fn connect(&self, id: DeviceId, timeout_hint: Duration) -> Result<(), TicketlineError>;

    fn cancel_connect(&self, id: DeviceId) -> Result<(), TicketlineError>;

    fn disconnect(&self, id: DeviceId) -> Result<(), TicketlineError>;

    fn discover_services(&self, id: DeviceId, filter: &ServiceFilter)
    -> Result<(), TicketlineError>;

    fn discover_characteristics(&self, id: DeviceId, service: Uuid)
    -> Result<(), TicketlineError>;

    fn write(
        &self,
        id: DeviceId,
        characteristic: &CharacteristicHandle,
        bytes: &[u8],
    ) -> Result<(), TicketlineError>;
}

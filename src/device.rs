//! # Device Records
//!
//! The data model for nearby printers: identifiers, connection states and the
//! record the registry stores for each device.
//!
//! ## Connection State Machine
//!
//! ```text
//!                 connect            connected            discovery
//! Disconnected ───────────► Connecting ───────► Connected ─────────► Discovering
//!      ▲                                            ▲                    │
//!      │                                            └── nothing found ───┤
//!      │      disconnected / failed / timeout                            │ characteristic
//!      ├──────────────────────────────────────────── (any state)         ▼ found
//!      │                                                              Writable
//!      └────────────── Disconnecting ◄── disconnect ── (any connected state)
//! ```
//!
//! `Writable` is only reachable from `Discovering`, and only together with a
//! resolved [`CharacteristicHandle`]. Leaving `Writable` drops the handle.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TicketlineError;

/// Opaque, stable identifier of a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<Uuid> for DeviceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DeviceId {
    type Err = TicketlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| TicketlineError::Config(format!("Invalid device identifier '{}': {}", s, e)))
    }
}

/// Location of the characteristic print bytes are written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicHandle {
    /// Service the characteristic belongs to
    pub service: Uuid,
    /// Characteristic identifier
    pub uuid: Uuid,
}

/// Lifecycle state of a device. Exactly one per device at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Discovering,
    Writable,
    Disconnecting,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected | Connecting | Disconnecting, Connecting)
                | (Disconnected | Connecting, Connected)
                | (Connected, Discovering)
                | (Discovering, Connected | Writable)
                | (Connecting | Connected | Discovering | Writable, Disconnecting)
        )
    }

    /// A transport-level link exists.
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Discovering | ConnectionState::Writable
        )
    }
}

/// What the registry knows about one device.
///
/// Fields are read-only from outside; a new record is produced for every
/// state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    id: DeviceId,
    name: Option<String>,
    state: ConnectionState,
    characteristic: Option<CharacteristicHandle>,
    rssi: Option<i16>,
}

impl DeviceRecord {
    /// A device first seen through an advertisement.
    pub fn sighted(id: DeviceId, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id,
            name,
            state: ConnectionState::Disconnected,
            characteristic: None,
            rssi,
        }
    }

    /// A device that is already linked when we first learn about it.
    pub fn linked(id: DeviceId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            state: ConnectionState::Connected,
            characteristic: None,
            rssi: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn characteristic(&self) -> Option<&CharacteristicHandle> {
        self.characteristic.as_ref()
    }

    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Ready for print payloads: writable state with a resolved characteristic.
    pub fn is_writable(&self) -> bool {
        self.state == ConnectionState::Writable && self.characteristic.is_some()
    }

    /// Move to `next`. `Writable` must go through [`DeviceRecord::make_writable`].
    pub fn transition(&self, next: ConnectionState) -> Result<Self, TicketlineError> {
        if next == ConnectionState::Writable || !self.state.can_transition_to(next) {
            return Err(self.invalid(next));
        }
        Ok(Self {
            state: next,
            characteristic: None,
            ..self.clone()
        })
    }

    /// Attach the discovered characteristic and become `Writable`.
    pub fn make_writable(&self, handle: CharacteristicHandle) -> Result<Self, TicketlineError> {
        if !self.state.can_transition_to(ConnectionState::Writable) {
            return Err(self.invalid(ConnectionState::Writable));
        }
        Ok(Self {
            state: ConnectionState::Writable,
            characteristic: Some(handle),
            ..self.clone()
        })
    }

    /// Refresh advertisement data without touching the connection state.
    pub fn resighted(&self, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            name: name.or_else(|| self.name.clone()),
            rssi: rssi.or(self.rssi),
            ..self.clone()
        }
    }

    fn invalid(&self, to: ConnectionState) -> TicketlineError {
        TicketlineError::InvalidTransition {
            id: self.id,
            from: self.state,
            to,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

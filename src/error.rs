//! # Error Types
//!
//! This module defines error types used throughout the ticketline library.

use thiserror::Error;

use crate::device::{ConnectionState, DeviceId};

/// Main error type for ticketline operations
#[derive(Debug, Error)]
pub enum TicketlineError {
    /// The Bluetooth adapter is not powered on (or not usable yet)
    #[error("Bluetooth adapter is not ready")]
    DeviceNotReady,

    /// Transport-level failure to connect; the reason is kept for diagnostics
    #[error("Failed to connect to {id}: {reason}")]
    ConnectFailed { id: DeviceId, reason: String },

    /// Operation referenced an identifier absent from the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// A state change the connection state machine does not allow
    #[error("Invalid state transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: DeviceId,
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Transport errors (adapter, scan, connect, write)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Auto-connect list persistence failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Image processing error
    #[error("Image error: {0}")]
    Image(String),

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

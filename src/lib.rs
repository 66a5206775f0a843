//! # Ticketline - BLE Receipt Printer Manager
//!
//! Ticketline finds Bluetooth LE receipt printers, keeps connections to them
//! under supervision and streams print payloads to every printer that is
//! ready. It provides:
//!
//! - **Discovery**: scan filtered by printer service UUIDs
//! - **Supervision**: connect attempts bounded by a per-device deadline
//! - **Dispatch**: ordered write-without-response chunks to writable printers
//! - **Encoders**: ESC/POS text, key/value rows and raster bitmaps
//! - **Auto-connect**: a persisted list of printers to connect on sight
//!
//! ## Quick Start
//!
//! Requires the `ble` feature.
//!
//! ```ignore
//! use std::sync::Arc;
//! use ticketline::{
//!     JsonFileStore, ManagerConfig, ManagerEvent, PrintTarget, PrinterManager,
//!     encoder::TextBlock,
//!     transport::ble::BleTransport,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), ticketline::TicketlineError> {
//! let config = ManagerConfig::load("ticketline.toml")?;
//! let (transport, transport_events) = BleTransport::open().await?;
//! let (manager, mut events) = PrinterManager::new(
//!     config,
//!     Arc::new(transport),
//!     transport_events,
//!     Box::new(JsonFileStore::new("auto-connect.json")),
//! )?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ManagerEvent::Change(change) = event {
//!         println!("{:?}", change);
//!     }
//!     if manager.can_print() {
//!         manager.print(&TextBlock::new("Hello"), PrintTarget::AutoConnect);
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`manager`] | Public facade and event engine |
//! | [`registry`] | Nearby devices and change notification |
//! | [`supervisor`] | Connect/disconnect with deadlines |
//! | [`discovery`] | Service and characteristic discovery |
//! | [`dispatcher`] | Chunked writes to writable devices |
//! | [`encoder`] | Payload encoders |
//! | [`autoconnect`] | Persisted auto-connect list |
//! | [`transport`] | Bluetooth backends |
//! | [`config`] | Manager configuration |
//! | [`error`] | Error types |

pub mod autoconnect;
pub mod config;
pub mod device;
pub mod discovery;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod events;
pub mod manager;
pub mod registry;
pub mod supervisor;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use autoconnect::{AutoConnectStore, JsonFileStore, MemoryStore};
pub use config::{ManagerConfig, ServiceFilter};
pub use device::{CharacteristicHandle, ConnectionState, DeviceId, DeviceRecord};
pub use dispatcher::{DispatchSummary, PrintTarget};
pub use encoder::{CharacterEncoding, PayloadEncoder};
pub use error::TicketlineError;
pub use events::{DeviceChange, ErrorReport, EventStream, ManagerEvent};
pub use manager::PrinterManager;
pub use transport::{AdapterState, RecordingTransport, TransportAdapter, TransportEvent};

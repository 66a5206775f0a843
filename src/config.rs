//! # Manager Configuration
//!
//! Which services identify a printer, which characteristic receives print
//! bytes, and how long a connect attempt may take.
//!
//! ## File Format
//!
//! ```toml
//! services = ["E7810A71-73AE-499D-8C15-FAA9AEF0C3F2"]
//! writable_characteristic = "BEF8D6C9-9C21-4C9E-B632-BD58C1009F9F"
//! connect_timeout_secs = 15
//! encoding = "gb18030"
//! auto_connect_path = "/var/lib/ticketline/auto-connect.json"
//! ```
//!
//! Every key is optional; missing keys take the defaults below.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::{Uuid, uuid};

use crate::encoder::CharacterEncoding;
use crate::error::TicketlineError;

/// Service advertised by the common family of BLE receipt printers.
pub const DEFAULT_PRINTER_SERVICE: Uuid = uuid!("E7810A71-73AE-499D-8C15-FAA9AEF0C3F2");

/// Seconds a connect attempt may stay pending before it is abandoned.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// A device must advertise at least one of these to be considered
    pub services: Vec<Uuid>,

    /// Characteristic print bytes go to. `None` picks the first
    /// write-without-response characteristic of a matching service.
    pub writable_characteristic: Option<Uuid>,

    /// Deadline for a pending connect
    pub connect_timeout_secs: u64,

    /// Character encoding used when printing text payloads
    pub encoding: CharacterEncoding,

    /// JSON file holding the auto-connect list; in-memory when absent
    pub auto_connect_path: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            services: vec![DEFAULT_PRINTER_SERVICE],
            writable_characteristic: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            encoding: CharacterEncoding::default(),
            auto_connect_path: None,
        }
    }
}

impl ManagerConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TicketlineError> {
        let path = path.as_ref();
        let config = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                TicketlineError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TicketlineError> {
        if self.services.is_empty() {
            return Err(TicketlineError::Config(
                "at least one target service is required".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(TicketlineError::Config(
                "connect_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn service_filter(&self) -> ServiceFilter {
        ServiceFilter::new(self.services.iter().copied())
    }
}

/// The fixed set of services that marks a device as a candidate printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFilter {
    services: BTreeSet<Uuid>,
}

impl ServiceFilter {
    pub fn new<I: IntoIterator<Item = Uuid>>(services: I) -> Self {
        Self {
            services: services.into_iter().collect(),
        }
    }

    pub fn contains(&self, service: &Uuid) -> bool {
        self.services.contains(service)
    }

    /// At least one of `advertised` is a target service.
    pub fn matches_any(&self, advertised: &[Uuid]) -> bool {
        advertised.iter().any(|s| self.services.contains(s))
    }

    pub fn to_vec(&self) -> Vec<Uuid> {
        self.services.iter().copied().collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

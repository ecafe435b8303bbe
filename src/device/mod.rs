//! Device handles consumed by the scan engine.
//!
//! A [`Device`] is one named control-system value. The engine only writes it,
//! reads it and watches it for changes; how the value reaches real hardware is
//! the device driver's business.
//!
//! # Resolution
//!
//! Commands never hold device handles at compile time. They look devices up by name
//! through a [`DeviceProvider`] when they execute, so a scan can be compiled before
//! its devices exist.
//!
//! ```text
//! ScanContext --resolve(name)--> DeviceProvider --> Arc<dyn Device>
//! ```
//!
//! # Thread Safety
//!
//! Handles are shared as `Arc<dyn Device>` across the whole command tree of a scan
//! (and possibly across scans), so implementations must be `Send + Sync`.

pub mod mock;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::DeviceConfig;
use crate::error::{ScanError, ScanResult};

pub use mock::{MockDevice, WriteJournal};

/// Errors reported by device drivers.
///
/// Every variant carries the device name so that wrapped scan errors always
/// identify the offending device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Write was not acknowledged
    #[error("Device '{device}' write failed: {message}")]
    Write {
        /// Device name
        device: String,
        /// Driver message
        message: String,
    },

    /// Value could not be read
    #[error("Device '{device}' read failed: {message}")]
    Read {
        /// Device name
        device: String,
        /// Driver message
        message: String,
    },

    /// Device is not reachable
    #[error("Device '{0}' is disconnected")]
    Disconnected(String),
}

impl DeviceError {
    /// Name of the device that raised the error.
    pub fn device(&self) -> &str {
        match self {
            DeviceError::Write { device, .. } | DeviceError::Read { device, .. } => device,
            DeviceError::Disconnected(device) => device,
        }
    }
}

/// One named control-system value.
#[async_trait]
pub trait Device: Send + Sync {
    /// Device name as used in scan commands.
    fn name(&self) -> &str;

    /// Write a new value. Returns once the device acknowledged the write.
    async fn write(&self, value: f64) -> Result<(), DeviceError>;

    /// Read the current value.
    async fn read(&self) -> Result<f64, DeviceError>;

    /// Subscribe to value changes.
    fn subscribe(&self) -> watch::Receiver<f64>;
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("name", &self.name()).finish()
    }
}

/// Looks up device handles by name.
pub trait DeviceProvider: Send + Sync {
    /// Resolve a device, failing with [`ScanError::UnknownDevice`] if no such device exists.
    fn resolve(&self, name: &str) -> ScanResult<Arc<dyn Device>>;

    /// Names of all known devices, sorted.
    fn device_names(&self) -> Vec<String>;
}

/// In-memory [`DeviceProvider`] backed by a name to handle map.
#[derive(Default, Clone)]
pub struct DeviceRegistry {
    devices: HashMap<String, Arc<dyn Device>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its own name, replacing any previous entry.
    pub fn register(&mut self, device: Arc<dyn Device>) {
        self.devices.insert(device.name().to_string(), device);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_device(mut self, device: Arc<dyn Device>) -> Self {
        self.register(device);
        self
    }

    /// Create simulated devices for every configured entry.
    ///
    /// All simulated devices share one write journal, returned alongside the registry.
    pub fn simulated(configs: &[DeviceConfig]) -> (Self, WriteJournal) {
        let journal = WriteJournal::default();
        let mut registry = Self::new();
        for config in configs {
            let device = MockDevice::new(&config.name, config.initial)
                .with_settle_time(config.settle_time())
                .with_journal(journal.clone());
            registry.register(Arc::new(device));
        }
        (registry, journal)
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if no device is registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.device_names())
            .finish()
    }
}

impl DeviceProvider for DeviceRegistry {
    fn resolve(&self, name: &str) -> ScanResult<Arc<dyn Device>> {
        self.devices
            .get(name)
            .cloned()
            .ok_or_else(|| ScanError::UnknownDevice(name.to_string()))
    }

    fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_registered_devices() {
        let registry = DeviceRegistry::new()
            .with_device(Arc::new(MockDevice::new("motor_y", 0.0)))
            .with_device(Arc::new(MockDevice::new("motor_x", 1.0)));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.device_names(), vec!["motor_x", "motor_y"]);
        assert_eq!(registry.resolve("motor_x").unwrap().name(), "motor_x");
    }

    #[test]
    fn test_registry_unknown_device() {
        let registry = DeviceRegistry::new();
        let result = registry.resolve("ghost");
        assert!(matches!(result, Err(ScanError::UnknownDevice(name)) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_simulated_registry_from_config() {
        let configs = vec![
            DeviceConfig {
                name: "temp".into(),
                initial: 21.5,
                settle_ms: 0,
            },
            DeviceConfig {
                name: "heater".into(),
                initial: 0.0,
                settle_ms: 0,
            },
        ];
        let (registry, journal) = DeviceRegistry::simulated(&configs);

        let temp = registry.resolve("temp").unwrap();
        assert_eq!(temp.read().await.unwrap(), 21.5);

        registry.resolve("heater").unwrap().write(3.0).await.unwrap();
        assert_eq!(journal.entries(), vec![("heater".to_string(), 3.0)]);
    }

    #[test]
    fn test_device_error_names_device() {
        let err = DeviceError::Read {
            device: "pm".into(),
            message: "timeout".into(),
        };
        assert_eq!(err.device(), "pm");
        assert_eq!(err.to_string(), "Device 'pm' read failed: timeout");
    }
}

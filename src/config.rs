//! Scan server configuration using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. built-in defaults
//! 2. a TOML file (optional)
//! 3. environment variables prefixed with `SCAN_SERVER_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! SCAN_SERVER_LOGGING__LEVEL=debug
//! SCAN_SERVER_ENGINE__CONDITION_POLL_MS=20
//! SCAN_SERVER_SERVER__MAX_RETAINED_SCANS=10
//! ```
//!
//! # Example
//!
//! ```toml
//! [server]
//! name = "beamline"
//! max_retained_scans = 50
//!
//! [engine]
//! condition_poll_ms = 50
//! condition_timeout_secs = 30.0
//!
//! [scripting]
//! script_paths = ["scripts"]
//!
//! [[devices]]
//! name = "motor"
//! initial = 0.0
//! settle_ms = 100
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::error::{ScanError, ScanResult};

/// Prefix of environment overrides, e.g. `SCAN_SERVER_ENGINE__CONDITION_POLL_MS`.
pub const ENV_PREFIX: &str = "SCAN_SERVER_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server identity and bookkeeping
    pub server: ServerSettings,
    /// Engine tunables
    pub engine: EngineConfig,
    /// Script lookup and limits
    pub scripting: ScriptingConfig,
    /// Log output
    pub logging: LoggingConfig,
    /// Simulated devices created at startup
    pub devices: Vec<DeviceConfig>,
}

/// Server identity and scan retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Name used in logs
    pub name: String,
    /// Finished scans kept for status queries; older ones are dropped
    pub max_retained_scans: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "scan_server".to_string(),
            max_retained_scans: 100,
        }
    }
}

/// Engine tunables shared by every scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound between two checks of a pending condition
    pub condition_poll_ms: u64,
    /// Timeout for condition waits that do not set one; unbounded if absent
    pub condition_timeout_secs: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            condition_poll_ms: 100,
            condition_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Interval between condition re-reads, at least one millisecond.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.condition_poll_ms.max(1))
    }

    /// Default timeout of condition waits, `None` when unset or out of range.
    pub fn condition_timeout(&self) -> Option<Duration> {
        self.condition_timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|timeout| !timeout.is_zero())
    }
}

/// Scripted command settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptingConfig {
    /// Directories searched for `<name>.rhai`
    pub script_paths: Vec<PathBuf>,
    /// Rhai operation limit per script run
    pub max_operations: u64,
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            script_paths: vec![PathBuf::from("scripts")],
            max_operations: 1_000_000,
        }
    }
}

/// Log output settings; `RUST_LOG` overrides the level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Simulated device definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name used in commands
    pub name: String,
    /// Value before the first write
    #[serde(default)]
    pub initial: f64,
    /// Time for the readback to follow a write
    #[serde(default)]
    pub settle_ms: u64,
}

impl DeviceConfig {
    /// `settle_ms` as a duration.
    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl ServerConfig {
    /// Load defaults, the optional TOML file and environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> ScanResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> ScanResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ScanError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.engine.condition_poll_ms == 0 {
            return Err(ScanError::Configuration(
                "engine.condition_poll_ms must be > 0".to_string(),
            ));
        }
        if let Some(secs) = self.engine.condition_timeout_secs {
            if secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(ScanError::Configuration(format!(
                    "Invalid engine.condition_timeout_secs {}. Must be > 0",
                    secs
                )));
            }
        }
        if self.scripting.max_operations == 0 {
            return Err(ScanError::Configuration(
                "scripting.max_operations must be > 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(ScanError::Configuration(
                    "Device name cannot be empty".to_string(),
                ));
            }
            if !names.insert(device.name.as_str()) {
                return Err(ScanError::Configuration(format!(
                    "Duplicate device name: '{}'",
                    device.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.engine.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.engine.condition_timeout(), None);
    }

    #[test]
    fn test_load_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "server.toml",
                r#"
                [server]
                name = "beamline"

                [engine]
                condition_poll_ms = 20
                condition_timeout_secs = 2.5

                [[devices]]
                name = "motor"
                settle_ms = 50

                [[devices]]
                name = "temp"
                initial = 21.0
                "#,
            )?;
            jail.set_env("SCAN_SERVER_LOGGING__LEVEL", "debug");
            jail.set_env("SCAN_SERVER_SERVER__MAX_RETAINED_SCANS", "7");

            let config = ServerConfig::load(Some(Path::new("server.toml"))).unwrap();

            assert_eq!(config.server.name, "beamline");
            assert_eq!(config.server.max_retained_scans, 7);
            assert_eq!(config.logging.level, "debug");
            assert_eq!(config.engine.poll_interval(), Duration::from_millis(20));
            assert_eq!(config.engine.condition_timeout(), Some(Duration::from_millis(2500)));
            assert_eq!(config.devices.len(), 2);
            assert_eq!(config.devices[0].settle_time(), Duration::from_millis(50));
            assert_eq!(config.devices[1].initial, 21.0);
            assert_eq!(config.scripting, ScriptingConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.engine.condition_poll_ms = 0;
        assert!(matches!(config.validate(), Err(ScanError::Configuration(_))));

        let mut config = ServerConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        let device = DeviceConfig {
            name: "motor".into(),
            initial: 0.0,
            settle_ms: 0,
        };
        config.devices = vec![device.clone(), device];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate device name: 'motor'"));
    }

    #[test]
    fn test_oversize_condition_timeout() {
        let mut config = ServerConfig::default();
        config.engine.condition_timeout_secs = Some(1e20);
        assert!(matches!(config.validate(), Err(ScanError::Configuration(_))));
        // Unvalidated settings fall back to no timeout rather than panicking
        assert_eq!(config.engine.condition_timeout(), None);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file("server.toml", "[engine]\ncondition_poll_ms = \"fast\"\n")?;
            let result = ServerConfig::load(Some(Path::new("server.toml")));
            assert!(matches!(result, Err(ScanError::Config(_))));
            Ok(())
        });
    }
}

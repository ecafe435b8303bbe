//! Declarative scan commands.
//!
//! A scan is submitted as a list of [`ScanCommand`] values. They only describe
//! what should happen; the compiler in [`crate::engine`] turns them into an
//! executable tree. Commands are plain data: cloneable, serialisable and never
//! mutated after submission.
//!
//! # JSON Format
//!
//! ```json
//! [
//!   { "type": "write", "device": "shutter", "value": 1 },
//!   { "type": "loop", "device": "motor", "start": 0, "end": 10, "step": 2,
//!     "body": [ { "type": "log", "devices": ["power"] } ] }
//! ]
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Comparison;
use crate::error::{ScanError, ScanResult};

/// Kind tags accepted in the `type` field.
pub const COMMAND_KINDS: &[&str] = &[
    "comment", "write", "wait", "log", "delay", "loop", "sequence", "script",
];

/// One declarative step of a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanCommand {
    /// No-op that shows up in the scan progress
    Comment {
        /// Text logged when the command runs
        text: String,
    },

    /// Write a value, optionally waiting for the readback to match
    Write {
        /// Target device
        device: String,
        /// Value to write
        value: f64,
        /// Wait for the readback to match before continuing
        #[serde(default)]
        wait: bool,
        /// Readback tolerance when waiting
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tolerance: Option<f64>,
        /// Readback timeout in seconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<f64>,
    },

    /// Wait for a device to satisfy a comparison
    Wait {
        /// Device to watch
        device: String,
        /// How the device value is compared with `value`
        #[serde(default)]
        comparison: Comparison,
        /// Desired value
        value: f64,
        /// Tolerance of `Equals` comparisons
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tolerance: Option<f64>,
        /// Timeout in seconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<f64>,
    },

    /// Read devices and record their values in the scan data
    Log {
        /// Devices read, in order
        devices: Vec<String>,
    },

    /// Pause the scan
    Delay {
        /// Pause length
        seconds: f64,
    },

    /// Step a device from start to end, running the body at every step
    Loop {
        /// Stepped device
        device: String,
        /// First value
        start: f64,
        /// Last value
        end: f64,
        /// Signed step; pointing away from `end` makes the loop reverse after each run
        step: f64,
        /// Commands run at every step
        #[serde(default)]
        body: Vec<ScanCommand>,
    },

    /// Group of commands executed in order
    Sequence {
        /// Name used when wrapping body errors
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Commands run in order
        #[serde(default)]
        body: Vec<ScanCommand>,
    },

    /// User-provided command loaded through the script loader
    Script {
        /// Script name, looked up by the loader
        name: String,
        /// Arguments passed to the script
        #[serde(default)]
        arguments: Vec<String>,
    },
}

impl ScanCommand {
    /// Comment with the given text.
    pub fn comment(text: impl Into<String>) -> Self {
        ScanCommand::Comment { text: text.into() }
    }

    /// Plain write without readback check.
    pub fn write(device: impl Into<String>, value: f64) -> Self {
        ScanCommand::Write {
            device: device.into(),
            value,
            wait: false,
            tolerance: None,
            timeout_secs: None,
        }
    }

    /// Write and wait until the readback is within `tolerance`.
    pub fn write_and_wait(device: impl Into<String>, value: f64, tolerance: f64) -> Self {
        ScanCommand::Write {
            device: device.into(),
            value,
            wait: true,
            tolerance: Some(tolerance),
            timeout_secs: None,
        }
    }

    /// Wait with the default tolerance and no timeout.
    pub fn wait(device: impl Into<String>, comparison: Comparison, value: f64) -> Self {
        ScanCommand::Wait {
            device: device.into(),
            comparison,
            value,
            tolerance: None,
            timeout_secs: None,
        }
    }

    /// Log the listed devices.
    pub fn log<S: AsRef<str>>(devices: &[S]) -> Self {
        ScanCommand::Log {
            devices: devices.iter().map(|d| d.as_ref().to_string()).collect(),
        }
    }

    /// Pause for `seconds`.
    pub fn delay(seconds: f64) -> Self {
        ScanCommand::Delay { seconds }
    }

    /// Loop over `start..=end` in steps of `step`.
    pub fn looping(
        device: impl Into<String>,
        start: f64,
        end: f64,
        step: f64,
        body: Vec<ScanCommand>,
    ) -> Self {
        ScanCommand::Loop {
            device: device.into(),
            start,
            end,
            step,
            body,
        }
    }

    /// Named sequence.
    pub fn sequence(name: impl Into<String>, body: Vec<ScanCommand>) -> Self {
        ScanCommand::Sequence {
            name: Some(name.into()),
            body,
        }
    }

    /// Scripted command.
    pub fn script(name: impl Into<String>, arguments: Vec<String>) -> Self {
        ScanCommand::Script {
            name: name.into(),
            arguments,
        }
    }

    /// The `type` tag of this command.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanCommand::Comment { .. } => "comment",
            ScanCommand::Write { .. } => "write",
            ScanCommand::Wait { .. } => "wait",
            ScanCommand::Log { .. } => "log",
            ScanCommand::Delay { .. } => "delay",
            ScanCommand::Loop { .. } => "loop",
            ScanCommand::Sequence { .. } => "sequence",
            ScanCommand::Script { .. } => "script",
        }
    }

    /// Nested commands of composite kinds.
    pub fn body(&self) -> &[ScanCommand] {
        match self {
            ScanCommand::Loop { body, .. } | ScanCommand::Sequence { body, .. } => body,
            _ => &[],
        }
    }
}

impl fmt::Display for ScanCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanCommand::Comment { text } => write!(f, "Comment '{}'", text),
            ScanCommand::Write {
                device,
                value,
                wait,
                ..
            } => {
                write!(f, "Write '{}' = {}", device, value)?;
                if *wait {
                    f.write_str(" (wait for readback)")?;
                }
                Ok(())
            }
            ScanCommand::Wait {
                device,
                comparison,
                value,
                ..
            } => write!(f, "Wait for '{}' {} {}", device, comparison, value),
            ScanCommand::Log { devices } => {
                f.write_str("Log ")?;
                for (i, device) in devices.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{}'", device)?;
                }
                Ok(())
            }
            ScanCommand::Delay { seconds } => write!(f, "Delay {} s", seconds),
            ScanCommand::Loop {
                device,
                start,
                end,
                step,
                ..
            } => write!(f, "Loop '{}' = {} .. {}, step {}", device, start, end, step),
            ScanCommand::Sequence { name, .. } => match name {
                Some(name) => write!(f, "Sequence '{}'", name),
                None => f.write_str("Sequence"),
            },
            ScanCommand::Script { name, .. } => write!(f, "Script '{}'", name),
        }
    }
}

/// Parse a JSON array of commands.
///
/// Unknown `type` tags are reported as [`ScanError::UnknownCommandKind`], anything
/// else that does not fit the command schema as [`ScanError::MalformedCommand`].
pub fn parse_commands(json: &str) -> ScanResult<Vec<ScanCommand>> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| ScanError::malformed("command list", e.to_string()))?;
    let Value::Array(entries) = &value else {
        return Err(ScanError::malformed(
            "command list",
            "expected a JSON array of commands",
        ));
    };
    check_kinds(entries)?;
    serde_json::from_value(value).map_err(|e| ScanError::malformed("command list", e.to_string()))
}

/// Read and parse a JSON command file.
pub fn load_commands(path: impl AsRef<Path>) -> ScanResult<Vec<ScanCommand>> {
    let json = fs::read_to_string(path)?;
    parse_commands(&json)
}

fn check_kinds(entries: &[Value]) -> ScanResult<()> {
    for (index, entry) in entries.iter().enumerate() {
        let kind = entry
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ScanError::malformed(format!("#{}", index), "missing 'type' tag"))?;
        if !COMMAND_KINDS.contains(&kind) {
            return Err(ScanError::UnknownCommandKind(kind.to_string()));
        }
        if let Some(Value::Array(body)) = entry.get("body") {
            check_kinds(body)?;
        }
    }
    Ok(())
}

//! Error types for the scan server.
//!
//! `ScanError` is the single error type that flows through compilation, execution
//! and the server bookkeeping. Built with `thiserror`, it keeps the categories a
//! client needs to tell apart:
//!
//! - **Compile errors** (`UnknownCommandKind`, `MalformedCommand`, `ScriptLoad`):
//!   raised when a command list is submitted, before any device I/O. The scan never
//!   starts.
//! - **Device errors** (`UnknownDevice`, `Device`): raised the first time a command
//!   touches the device. They fail the scan and are never retried here.
//! - **`ConditionTimeout`**: a bounded condition wait ran out of time.
//! - **`Canceled`**: not a failure. It marks cooperative unwinding after a cancel
//!   request so that an aborted scan is reported differently from a failed one.
//! - **Wrappers** (`CommandFailed`, `BodyFailed`): add the description of the
//!   command that was running when the inner error surfaced.
//!
//! Wrapping goes through [`ScanError::in_command`] and [`ScanError::in_body`], which
//! leave `Canceled` untouched so cancellation stays recognisable at every level.

use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceError;
use crate::engine::ScanState;
use crate::scripting::ScriptError;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Errors raised while compiling, running or managing scans.
#[derive(Error, Debug)]
pub enum ScanError {
    /// No implementation for a command `type`
    #[error("Unknown command kind '{0}'")]
    UnknownCommandKind(String),

    /// Command parameters failed validation
    #[error("Malformed command {command}: {reason}")]
    MalformedCommand {
        /// Offending command
        command: String,
        /// What is wrong with it
        reason: String,
    },

    /// Script loader rejected a `script` command
    #[error("Cannot load script '{name}': {source}")]
    ScriptLoad {
        /// Script name
        name: String,
        /// Loader error
        #[source]
        source: ScriptError,
    },

    /// Device provider has no such device
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    /// Device I/O failure
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Condition wait exceeded its timeout
    #[error("Timeout after {timeout:?} waiting for {condition}")]
    ConditionTimeout {
        /// Description of the condition
        condition: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// Scripted command failed while running
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// Cancellation observed during a blocking wait
    #[error("Scan was canceled")]
    Canceled,

    /// Leaf command failure, wrapped with the command
    #[error("{command} failed: {source}")]
    CommandFailed {
        /// Failing command
        command: String,
        /// Underlying error
        #[source]
        source: Box<ScanError>,
    },

    /// Failure inside a loop or sequence body
    #[error("{command} body failed: {source}")]
    BodyFailed {
        /// Enclosing loop or sequence
        command: String,
        /// Underlying error
        #[source]
        source: Box<ScanError>,
    },

    /// No scan with this id
    #[error("Unknown scan {0}")]
    UnknownScan(u64),

    /// Scan is Idle or Running
    #[error("Scan {0} is still active")]
    ScanStillActive(u64),

    /// State machine transition not allowed
    #[error("Cannot {action} a scan that is {from}")]
    InvalidTransition {
        /// State the scan was in
        from: ScanState,
        /// Requested action
        action: String,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is invalid
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Reading a command file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Shorthand for a `MalformedCommand` error.
    pub fn malformed(command: impl ToString, reason: impl Into<String>) -> Self {
        ScanError::MalformedCommand {
            command: command.to_string(),
            reason: reason.into(),
        }
    }

    /// True if this error is the cancellation signal rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        match self {
            ScanError::Canceled => true,
            ScanError::CommandFailed { source, .. } | ScanError::BodyFailed { source, .. } => {
                source.is_cancellation()
            }
            _ => false,
        }
    }

    /// True for errors raised while compiling a command list.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            ScanError::UnknownCommandKind(_)
                | ScanError::MalformedCommand { .. }
                | ScanError::ScriptLoad { .. }
        )
    }

    /// Wrap with the description of the command that failed.
    pub fn in_command(self, command: impl ToString) -> Self {
        if self.is_cancellation() {
            return self;
        }
        ScanError::CommandFailed {
            command: command.to_string(),
            source: Box::new(self),
        }
    }

    /// Wrap as a failure of the body of a composite or loop command.
    pub fn in_body(self, command: impl ToString) -> Self {
        if self.is_cancellation() {
            return self;
        }
        ScanError::BodyFailed {
            command: command.to_string(),
            source: Box::new(self),
        }
    }
}

impl From<figment::Error> for ScanError {
    fn from(err: figment::Error) -> Self {
        ScanError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::UnknownDevice("motor_x".to_string());
        assert_eq!(err.to_string(), "Unknown device 'motor_x'");
    }

    #[test]
    fn test_cancellation_is_never_wrapped() {
        let err = ScanError::Canceled.in_command("Write 'a' = 1").in_body("Loop 'b'");
        assert!(matches!(err, ScanError::Canceled));
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_wrapping_keeps_device_name() {
        let err = ScanError::from(DeviceError::Write {
            device: "shutter".into(),
            message: "no ack".into(),
        })
        .in_command("Write 'shutter' = 1")
        .in_body("Loop 'motor' = 0 .. 4, step 1");

        let msg = err.to_string();
        assert!(msg.contains("Loop 'motor'"));
        assert!(msg.contains("body failed"));
        assert!(msg.contains("shutter"));
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_compile_error_classification() {
        assert!(ScanError::UnknownCommandKind("teleport".into()).is_compile_error());
        assert!(ScanError::malformed("Loop", "step is zero").is_compile_error());
        assert!(!ScanError::Canceled.is_compile_error());
    }
}

//! Core library for the scan server.
//!
//! A scan is a list of declarative [`ScanCommand`]s (write a device, wait for a
//! condition, log readings, loop over a range, run a script). The [`engine`]
//! compiles the list into an executable command tree and drives it to
//! completion, failure or cancellation while reporting progress in work units.
//! [`ScanServer`] keeps track of many scans for status and control clients.

pub mod command;
pub mod condition;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod logging;
pub mod scripting;
pub mod server;

pub use command::{load_commands, parse_commands, ScanCommand};
pub use condition::Comparison;
pub use config::ServerConfig;
pub use engine::{ScanInfo, ScanState};
pub use error::{ScanError, ScanResult};
pub use server::ScanServer;

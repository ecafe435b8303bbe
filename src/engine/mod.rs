//! Scan command execution engine.
//!
//! ```text
//! [ScanCommand] --ScanCompiler--> CommandImpl tree --ScanExecutor--> ScanContext
//!                                                                    |-> devices
//!                                                                    |-> progress
//!                                                                    '-> DataLog
//! ```
//!
//! The compiler is pure; everything that touches devices happens inside
//! [`CommandImpl::execute`], driven by one [`ScanExecutor`] per scan.

pub mod command_impl;
pub mod compiler;
pub mod context;
pub mod data;
pub mod executor;
pub mod loop_command;

pub use command_impl::CommandImpl;
pub use compiler::ScanCompiler;
pub use context::{ScanContext, ScanProgress};
pub use data::{DataLog, Sample};
pub use executor::{ScanExecutor, ScanInfo, ScanState};
pub use loop_command::LoopCommandImpl;

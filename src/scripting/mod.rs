//! Scripted commands.
//!
//! Users extend the command set with Rhai scripts. The engine only sees the
//! [`ScriptLoader`] and [`ScriptedCommand`] traits; [`RhaiScriptLoader`] is the
//! implementation used by the server.
//!
//! # Architecture
//!
//! ```text
//! ScanCompiler --load(name, args)--> ScriptLoader
//!                                        '-- RhaiScriptLoader
//!                                              '-- RhaiScriptedCommand (CommandImpl::Scripted)
//! ```
//!
//! # Script Layout
//!
//! A `script` command named `Align` loads `align.rhai` from the first configured
//! script directory that has it. The file must define `execute()` and may define
//! `work_units()`:
//!
//! ```text
//! fn work_units() { 2 }
//!
//! fn execute() {
//!     let target = parse_float(args()[0]);
//!     write("motor", target);
//!     log(`motor at ${read("motor")}`);
//! }
//! ```

pub mod rhai_engine;
pub mod script_engine;

pub use rhai_engine::{RhaiScriptLoader, RhaiScriptedCommand};
pub use script_engine::{ScriptError, ScriptLoader, ScriptedCommand};

//! Scripted command interface.
//!
//! The engine never talks to a scripting language directly. A [`ScriptLoader`]
//! is injected into the compiler and turns a `script` command into a
//! [`ScriptedCommand`], which then behaves like any other leaf of the tree.
//!
//! # Example
//!
//! ```rust,ignore
//! use scan_server::engine::ScanCompiler;
//! use scan_server::scripting::RhaiScriptLoader;
//!
//! let loader = RhaiScriptLoader::new(vec!["scripts".into()], 100_000);
//! let compiler = ScanCompiler::new().with_script_loader(Arc::new(loader));
//! let root = compiler.compile(&[ScanCommand::script("Align", vec!["x".into()])])?;
//! ```

use async_trait::async_trait;
use thiserror::Error;

use crate::engine::ScanContext;
use crate::error::ScanResult;

/// Errors raised while loading or running a script.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    /// No `<name>.rhai` in any script path
    #[error("No script named '{0}' in the script paths")]
    NotFound(String),

    /// Script file could not be read
    #[error("Cannot read {path}: {message}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        message: String,
    },

    /// Compilation or parsing error
    #[error("Compilation error: {message}{}", location(.line, .column))]
    CompilationError {
        /// Parser message
        message: String,
        /// 1-based line, if known
        line: Option<usize>,
        /// 1-based column, if known
        column: Option<usize>,
    },

    /// Error raised while the script ran
    #[error("Runtime error: {message}")]
    RuntimeError {
        /// Error message
        message: String,
    },

    /// Script returned a value of the wrong type
    #[error("Type conversion error: expected {expected}, found {found}")]
    TypeConversionError {
        /// Expected type
        expected: String,
        /// Actual type
        found: String,
    },

    /// Required script function is missing
    #[error("Function not found: {name}")]
    FunctionNotFound {
        /// Function name
        name: String,
    },

    /// Stopped by the progress callback (operation limit or cancellation)
    #[error("Script terminated: {reason}")]
    Terminated {
        /// Why the script was stopped
        reason: String,
    },

    /// Blocking task could not be joined
    #[error("Async error: {message}")]
    AsyncError {
        /// Error message
        message: String,
    },
}

fn location(line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!(" at line {}, column {}", line, column),
        (Some(line), None) => format!(" at line {}", line),
        _ => String::new(),
    }
}

/// A command implemented by a script.
#[async_trait]
pub trait ScriptedCommand: Send + Sync {
    /// Work units credited once the script completes.
    fn work_units(&self) -> u64;

    async fn execute(&self, context: &ScanContext) -> ScanResult<()>;
}

/// Builds scripted commands by name.
pub trait ScriptLoader: Send + Sync {
    fn load(&self, name: &str, arguments: &[String])
        -> Result<Box<dyn ScriptedCommand>, ScriptError>;
}

//! Rhai implementation of the script loader.
//!
//! Scripts are compiled once, when the scan is compiled, and executed on a blocking
//! thread when the command runs. Device access from the script blocks that thread on
//! the tokio runtime handle, so the scan task itself never blocks.
//!
//! # Functions available to scripts
//!
//! | Function               | Effect                                   |
//! |------------------------|------------------------------------------|
//! | `read(device)`         | current device value (float)             |
//! | `write(device, value)` | write and wait for the acknowledgment    |
//! | `log(message)`         | message to the server log                |
//! | `cancelled()`          | true once the scan was asked to stop     |
//! | `args()`               | command arguments as an array of strings |
//!
//! # Safety Limits
//!
//! Each run is limited to `max_operations` Rhai operations. Cancellation of the scan
//! also terminates the script at its next operation.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Scope, AST};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::script_engine::{ScriptError, ScriptLoader, ScriptedCommand};
use crate::device::DeviceProvider;
use crate::engine::ScanContext;
use crate::error::{ScanError, ScanResult};

const EXECUTE_FN: &str = "execute";
const WORK_UNITS_FN: &str = "work_units";

/// Loads `<name>.rhai` files from a list of directories.
#[derive(Debug, Clone)]
pub struct RhaiScriptLoader {
    script_paths: Vec<PathBuf>,
    max_operations: u64,
}

impl RhaiScriptLoader {
    /// Loader searching `script_paths` in order.
    pub fn new(script_paths: Vec<PathBuf>, max_operations: u64) -> Self {
        Self {
            script_paths,
            max_operations,
        }
    }

    /// First `<lowercase name>.rhai` found in the script paths.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        let file_name = format!("{}.rhai", name.to_lowercase());
        self.script_paths
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|path| path.is_file())
    }

    fn compile(&self, path: &Path) -> Result<AST, ScriptError> {
        let source = fs::read_to_string(path).map_err(|e| ScriptError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let engine = limited_engine(self.max_operations, None);
        engine
            .compile(&source)
            .map_err(|e| convert_rhai_error(e.into()))
    }
}

impl ScriptLoader for RhaiScriptLoader {
    fn load(
        &self,
        name: &str,
        arguments: &[String],
    ) -> Result<Box<dyn ScriptedCommand>, ScriptError> {
        let path = self
            .locate(name)
            .ok_or_else(|| ScriptError::NotFound(name.to_string()))?;
        let ast = self.compile(&path)?;

        if !has_function(&ast, EXECUTE_FN) {
            return Err(ScriptError::FunctionNotFound {
                name: format!("{}()", EXECUTE_FN),
            });
        }
        let work_units = if has_function(&ast, WORK_UNITS_FN) {
            let engine = limited_engine(self.max_operations, None);
            let units: i64 = engine
                .call_fn(&mut Scope::new(), &ast, WORK_UNITS_FN, ())
                .map_err(convert_rhai_error)?;
            u64::try_from(units).map_err(|_| ScriptError::TypeConversionError {
                expected: "non-negative work units".to_string(),
                found: units.to_string(),
            })?
        } else {
            1
        };

        debug!(script = %name, path = %path.display(), work_units, "Loaded script");
        Ok(Box::new(RhaiScriptedCommand {
            name: name.to_string(),
            ast: Arc::new(ast),
            arguments: arguments.to_vec(),
            work_units,
            max_operations: self.max_operations,
        }))
    }
}

/// Compiled script bound to its arguments.
pub struct RhaiScriptedCommand {
    name: String,
    ast: Arc<AST>,
    arguments: Vec<String>,
    work_units: u64,
    max_operations: u64,
}

#[async_trait]
impl ScriptedCommand for RhaiScriptedCommand {
    fn work_units(&self) -> u64 {
        self.work_units
    }

    async fn execute(&self, context: &ScanContext) -> ScanResult<()> {
        let bindings = ScanBindings {
            name: self.name.clone(),
            devices: context.devices(),
            cancel: context.cancellation().clone(),
            runtime: Handle::current(),
            arguments: self.arguments.clone(),
        };
        let ast = Arc::clone(&self.ast);
        let max_operations = self.max_operations;
        let cancel = context.cancellation().clone();

        let result = tokio::task::spawn_blocking(move || {
            let engine = limited_engine(max_operations, Some(bindings));
            engine
                .call_fn::<Dynamic>(&mut Scope::new(), &ast, EXECUTE_FN, ())
                .map(|_| ())
        })
        .await
        .map_err(|e| ScriptError::AsyncError {
            message: format!("Task join error: {}", e),
        })?;

        match result {
            Ok(()) => Ok(()),
            Err(_) if cancel.is_cancelled() => Err(ScanError::Canceled),
            Err(e) => Err(ScanError::Script(convert_rhai_error(e))),
        }
    }
}

/// Scan resources exposed to one script run.
struct ScanBindings {
    name: String,
    devices: Arc<dyn DeviceProvider>,
    cancel: CancellationToken,
    runtime: Handle,
    arguments: Vec<String>,
}

/// Engine with the operation limit and, for execution, the scan functions.
fn limited_engine(max_operations: u64, bindings: Option<ScanBindings>) -> Engine {
    let mut engine = Engine::new();
    let cancel = bindings.as_ref().map(|b| b.cancel.clone());

    engine.on_progress(move |count| {
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            Some("scan was canceled".into())
        } else if count > max_operations {
            Some(format!("Safety limit exceeded: maximum {} operations", max_operations).into())
        } else {
            None
        }
    });

    if let Some(bindings) = bindings {
        register_scan_functions(&mut engine, bindings);
    }
    engine
}

fn register_scan_functions(engine: &mut Engine, bindings: ScanBindings) {
    let ScanBindings {
        name,
        devices,
        cancel,
        runtime,
        arguments,
    } = bindings;

    let (provider, handle) = (Arc::clone(&devices), runtime.clone());
    engine.register_fn(
        "read",
        move |device: ImmutableString| -> Result<f64, Box<EvalAltResult>> {
            let device = provider.resolve(&device).map_err(|e| e.to_string())?;
            Ok(handle.block_on(device.read()).map_err(|e| e.to_string())?)
        },
    );

    let write = {
        let (provider, handle) = (Arc::clone(&devices), runtime.clone());
        move |device: ImmutableString, value: f64| -> Result<(), Box<EvalAltResult>> {
            let device = provider.resolve(&device).map_err(|e| e.to_string())?;
            Ok(handle.block_on(device.write(value)).map_err(|e| e.to_string())?)
        }
    };
    let write_int = write.clone();
    engine.register_fn("write", write);
    engine.register_fn(
        "write",
        move |device: ImmutableString, value: i64| -> Result<(), Box<EvalAltResult>> {
            write_int(device, value as f64)
        },
    );

    engine.register_fn("log", move |message: ImmutableString| {
        info!(script = %name, "{}", message);
    });
    engine.register_fn("cancelled", move || cancel.is_cancelled());

    let arguments: Array = arguments.into_iter().map(Dynamic::from).collect();
    engine.register_fn("args", move || arguments.clone());
}

fn has_function(ast: &AST, name: &str) -> bool {
    ast.iter_functions()
        .any(|f| f.name == name && f.params.is_empty())
}

/// Convert Rhai's EvalAltResult to our ScriptError type
fn convert_rhai_error(error: Box<EvalAltResult>) -> ScriptError {
    match *error {
        EvalAltResult::ErrorParsing(parse_error, pos) => ScriptError::CompilationError {
            message: parse_error.to_string(),
            line: pos.line(),
            column: pos.position(),
        },
        EvalAltResult::ErrorRuntime(message, _) => ScriptError::RuntimeError {
            message: message.to_string(),
        },
        EvalAltResult::ErrorMismatchDataType(expected, found, _) => {
            ScriptError::TypeConversionError { expected, found }
        }
        // Errors raised inside execute() arrive wrapped in the function call
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => convert_rhai_error(inner),
        EvalAltResult::ErrorTerminated(reason, _) => ScriptError::Terminated {
            reason: reason.to_string(),
        },
        other => ScriptError::RuntimeError {
            message: other.to_string(),
        },
    }
}

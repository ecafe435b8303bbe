//! Command tree compiler.
//!
//! Turns a list of declarative [`ScanCommand`]s into an executable [`CommandImpl`]
//! tree. Compilation validates parameters and loads scripted commands, but never
//! touches a device: device names are resolved by the commands themselves when
//! they execute. Any failure rejects the whole list.

use std::sync::Arc;

use tokio::time::Duration;
use tracing::debug;

use super::command_impl::{
    CommandImpl, CommentCommandImpl, DelayCommandImpl, LogCommandImpl, ScriptedCommandImpl,
    SequenceCommandImpl, WaitCommandImpl, WriteCommandImpl, DEFAULT_WAIT_TOLERANCE,
};
use super::loop_command::LoopCommandImpl;
use crate::command::ScanCommand;
use crate::error::{ScanError, ScanResult};
use crate::scripting::ScriptLoader;

/// Largest number of steps a single loop may take.
pub const MAX_LOOP_STEPS: f64 = 1e12;

/// Builds [`CommandImpl`] trees.
#[derive(Clone, Default)]
pub struct ScanCompiler {
    scripts: Option<Arc<dyn ScriptLoader>>,
}

impl ScanCompiler {
    /// Compiler without scripting support; `script` commands are rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable `script` commands, loaded through `loader`.
    pub fn with_script_loader(mut self, loader: Arc<dyn ScriptLoader>) -> Self {
        self.scripts = Some(loader);
        self
    }

    /// Compile a command list into an unnamed root sequence.
    pub fn compile(&self, commands: &[ScanCommand]) -> ScanResult<CommandImpl> {
        let body = self.implement(commands)?;
        let root = CommandImpl::Sequence(SequenceCommandImpl::new(None, body));
        debug!(
            commands = commands.len(),
            work_units = root.work_units(),
            "Compiled scan"
        );
        Ok(root)
    }

    /// Compile each command of a list.
    pub fn implement(&self, commands: &[ScanCommand]) -> ScanResult<Vec<CommandImpl>> {
        commands.iter().map(|command| self.implement_one(command)).collect()
    }

    fn implement_one(&self, command: &ScanCommand) -> ScanResult<CommandImpl> {
        let implementation = match command {
            ScanCommand::Comment { text } => {
                CommandImpl::Comment(CommentCommandImpl { text: text.clone() })
            }
            ScanCommand::Write {
                device,
                value,
                wait,
                tolerance,
                timeout_secs,
            } => {
                check_device(command, device)?;
                check_finite(command, "value", *value)?;
                if let Some(tolerance) = tolerance {
                    check_tolerance(command, *tolerance)?;
                }
                CommandImpl::Write(WriteCommandImpl {
                    device: device.clone(),
                    value: *value,
                    wait: *wait,
                    tolerance: *tolerance,
                    timeout: timeout(command, *timeout_secs)?,
                })
            }
            ScanCommand::Wait {
                device,
                comparison,
                value,
                tolerance,
                timeout_secs,
            } => {
                check_device(command, device)?;
                check_finite(command, "value", *value)?;
                let tolerance = tolerance.unwrap_or(DEFAULT_WAIT_TOLERANCE);
                check_tolerance(command, tolerance)?;
                CommandImpl::Wait(WaitCommandImpl {
                    device: device.clone(),
                    comparison: *comparison,
                    value: *value,
                    tolerance,
                    timeout: timeout(command, *timeout_secs)?,
                })
            }
            ScanCommand::Log { devices } => {
                if devices.is_empty() {
                    return Err(ScanError::malformed(command, "no devices to log"));
                }
                for device in devices {
                    check_device(command, device)?;
                }
                CommandImpl::Log(LogCommandImpl {
                    devices: devices.clone(),
                })
            }
            ScanCommand::Delay { seconds } => {
                let duration = Duration::try_from_secs_f64(*seconds).map_err(|_| {
                    ScanError::malformed(command, format!("invalid delay of {} seconds", seconds))
                })?;
                CommandImpl::Delay(DelayCommandImpl { duration })
            }
            ScanCommand::Loop {
                device,
                start,
                end,
                step,
                body,
            } => {
                check_device(command, device)?;
                check_finite(command, "start", *start)?;
                check_finite(command, "end", *end)?;
                check_finite(command, "step", *step)?;
                if *step == 0.0 {
                    return Err(ScanError::malformed(command, "step must not be zero"));
                }
                let steps = ((end - start) / step).abs();
                if !steps.is_finite() || steps >= MAX_LOOP_STEPS {
                    return Err(ScanError::malformed(
                        command,
                        format!("range needs more than {} steps", MAX_LOOP_STEPS),
                    ));
                }
                CommandImpl::Loop(LoopCommandImpl::new(
                    device.clone(),
                    *start,
                    *end,
                    *step,
                    self.implement(body)?,
                ))
            }
            ScanCommand::Sequence { name, body } => CommandImpl::Sequence(
                SequenceCommandImpl::new(name.clone(), self.implement(body)?),
            ),
            ScanCommand::Script { name, arguments } => {
                let loader = self
                    .scripts
                    .as_ref()
                    .ok_or_else(|| ScanError::UnknownCommandKind(command.kind().to_string()))?;
                let script =
                    loader
                        .load(name, arguments)
                        .map_err(|source| ScanError::ScriptLoad {
                            name: name.clone(),
                            source,
                        })?;
                CommandImpl::Scripted(ScriptedCommandImpl {
                    name: name.clone(),
                    script,
                })
            }
        };
        Ok(implementation)
    }
}

fn check_device(command: &ScanCommand, device: &str) -> ScanResult<()> {
    if device.trim().is_empty() {
        return Err(ScanError::malformed(command, "device name is empty"));
    }
    Ok(())
}

fn check_finite(command: &ScanCommand, field: &str, value: f64) -> ScanResult<()> {
    if !value.is_finite() {
        return Err(ScanError::malformed(
            command,
            format!("{} must be a finite number", field),
        ));
    }
    Ok(())
}

fn check_tolerance(command: &ScanCommand, tolerance: f64) -> ScanResult<()> {
    if !tolerance.is_finite() || tolerance < 0.0 {
        return Err(ScanError::malformed(
            command,
            format!("invalid tolerance {}", tolerance),
        ));
    }
    Ok(())
}

fn timeout(command: &ScanCommand, seconds: Option<f64>) -> ScanResult<Option<Duration>> {
    match seconds {
        None => Ok(None),
        Some(seconds) => match Duration::try_from_secs_f64(seconds) {
            Ok(duration) if !duration.is_zero() => Ok(Some(duration)),
            _ => Err(ScanError::malformed(
                command,
                format!("invalid timeout of {} seconds", seconds),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScanContext;
    use crate::scripting::{ScriptError, ScriptedCommand};
    use async_trait::async_trait;

    fn end_to_end_commands() -> Vec<ScanCommand> {
        vec![
            ScanCommand::write("a", 5.0),
            ScanCommand::looping("b", 0.0, 4.0, 1.0, vec![ScanCommand::log(&["c"])]),
        ]
    }

    #[test]
    fn test_compile_builds_root_sequence() {
        let root = ScanCompiler::new().compile(&end_to_end_commands()).unwrap();

        assert!(matches!(root, CommandImpl::Sequence(_)));
        assert_eq!(root.children().len(), 2);
        assert_eq!(root.work_units(), 6);
    }

    #[test]
    fn test_compile_is_idempotent() {
        let compiler = ScanCompiler::new();
        let commands = vec![ScanCommand::looping(
            "x",
            0.0,
            10.0,
            -2.0,
            vec![ScanCommand::sequence("inner", end_to_end_commands())],
        )];

        let first = compiler.compile(&commands).unwrap();
        let second = compiler.compile(&commands).unwrap();

        assert_eq!(first.work_units(), second.work_units());
        assert_eq!(first.tree(), second.tree());
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        let compiler = ScanCompiler::new();
        let invalid = vec![
            ScanCommand::looping("x", 0.0, 1.0, 0.0, vec![]),
            ScanCommand::looping("x", 0.0, f64::NAN, 1.0, vec![]),
            ScanCommand::write("", 1.0),
            ScanCommand::delay(-1.0),
            ScanCommand::Log { devices: vec![] },
            ScanCommand::Wait {
                device: "t".into(),
                comparison: Default::default(),
                value: 1.0,
                tolerance: Some(-0.5),
                timeout_secs: None,
            },
            ScanCommand::Write {
                device: "t".into(),
                value: 1.0,
                wait: true,
                tolerance: None,
                timeout_secs: Some(0.0),
            },
            ScanCommand::delay(1e20),
            ScanCommand::delay(f64::INFINITY),
            ScanCommand::Wait {
                device: "t".into(),
                comparison: Default::default(),
                value: 1.0,
                tolerance: None,
                timeout_secs: Some(1e25),
            },
            ScanCommand::looping("x", 0.0, 1e300, 1e-300, vec![]),
            ScanCommand::looping("x", -f64::MAX, f64::MAX, 1.0, vec![]),
            ScanCommand::looping("x", 0.0, 1e13, 1.0, vec![]),
        ];

        for command in invalid {
            let result = compiler.compile(&[command.clone()]);
            assert!(
                matches!(result, Err(ScanError::MalformedCommand { .. })),
                "{} should be rejected",
                command
            );
        }
    }

    #[test]
    fn test_large_but_bounded_loops_compile() {
        let compiler = ScanCompiler::new();

        let single = compiler
            .compile(&[ScanCommand::looping("x", 0.0, 1e9, 1.0, vec![])])
            .unwrap();
        assert_eq!(single.work_units(), 1_000_000_001);

        // Nested estimates saturate instead of overflowing
        let nested = compiler
            .compile(&[
                ScanCommand::looping(
                    "x",
                    0.0,
                    1e11,
                    1.0,
                    vec![ScanCommand::looping("y", 0.0, 1e11, 1.0, vec![ScanCommand::log(&["z"])])],
                ),
                ScanCommand::write("w", 1.0),
            ])
            .unwrap();
        assert_eq!(nested.work_units(), u64::MAX);

        let delay = compiler.compile(&[ScanCommand::delay(0.0)]).unwrap();
        assert_eq!(delay.work_units(), 1);
    }

    #[test]
    fn test_invalid_nested_command_fails_whole_list() {
        let commands = vec![
            ScanCommand::write("a", 1.0),
            ScanCommand::sequence("s", vec![ScanCommand::looping("x", 0.0, 1.0, 0.0, vec![])]),
        ];
        let err = ScanCompiler::new().compile(&commands).unwrap_err();
        assert!(err.is_compile_error());
        assert!(err.to_string().contains("step must not be zero"));
    }

    #[test]
    fn test_script_without_loader_is_unknown_kind() {
        let result = ScanCompiler::new().compile(&[ScanCommand::script("align", vec![])]);
        assert!(matches!(result, Err(ScanError::UnknownCommandKind(kind)) if kind == "script"));
    }

    struct FixedCommand;

    #[async_trait]
    impl ScriptedCommand for FixedCommand {
        fn work_units(&self) -> u64 {
            4
        }

        async fn execute(&self, _context: &ScanContext) -> ScanResult<()> {
            Ok(())
        }
    }

    struct TestLoader;

    impl ScriptLoader for TestLoader {
        fn load(
            &self,
            name: &str,
            _arguments: &[String],
        ) -> Result<Box<dyn ScriptedCommand>, ScriptError> {
            match name {
                "fixed" => Ok(Box::new(FixedCommand)),
                other => Err(ScriptError::NotFound(other.to_string())),
            }
        }
    }

    #[test]
    fn test_script_loader_is_consulted() {
        let compiler = ScanCompiler::new().with_script_loader(Arc::new(TestLoader));

        let root = compiler
            .compile(&[ScanCommand::script("fixed", vec![])])
            .unwrap();
        assert_eq!(root.work_units(), 4);

        let err = compiler
            .compile(&[ScanCommand::script("missing", vec![])])
            .unwrap_err();
        assert!(matches!(err, ScanError::ScriptLoad { ref name, .. } if name == "missing"));
        assert!(err.is_compile_error());
    }
}

//! Executable command tree.
//!
//! [`CommandImpl`] is the compiled counterpart of a [`ScanCommand`]: a closed set
//! of variants, each holding its validated parameters. Device names stay
//! unresolved until execution.
//!
//! # Work Units
//!
//! | Kind     | Units                                        |
//! |----------|----------------------------------------------|
//! | Comment  | 0                                            |
//! | Write, Wait, Log, Delay | 1                             |
//! | Script   | as reported by the loaded script             |
//! | Sequence | sum of the body                              |
//! | Loop     | iterations x body, or iterations if body is 0 |
//!
//! Leaf commands credit their own units once they complete. Composite commands
//! credit nothing themselves, except a loop with an empty body.
//!
//! [`ScanCommand`]: crate::ScanCommand

use std::fmt;

use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::context::ScanContext;
use super::loop_command::LoopCommandImpl;
use crate::condition::{Comparison, DeviceValueCondition};
use crate::error::{ScanError, ScanResult};
use crate::scripting::ScriptedCommand;

/// Tolerance of `Wait` commands that do not specify one.
pub const DEFAULT_WAIT_TOLERANCE: f64 = 0.1;

/// Readback tolerance of a waiting `Write` that does not specify one.
pub fn default_write_tolerance(value: f64) -> f64 {
    (value.abs() * 1e-3).max(1e-3)
}

/// Compiled, executable command.
pub enum CommandImpl {
    /// Logs its text
    Comment(CommentCommandImpl),
    /// Device write
    Write(WriteCommandImpl),
    /// Condition wait
    Wait(WaitCommandImpl),
    /// Device readings into the scan data
    Log(LogCommandImpl),
    /// Cancellable pause
    Delay(DelayCommandImpl),
    /// Stepped device with a body
    Loop(LoopCommandImpl),
    /// Ordered group
    Sequence(SequenceCommandImpl),
    /// Loaded script
    Scripted(ScriptedCommandImpl),
}

impl CommandImpl {
    /// Estimated work units, computed without executing anything.
    pub fn work_units(&self) -> u64 {
        match self {
            CommandImpl::Comment(_) => 0,
            CommandImpl::Write(_)
            | CommandImpl::Wait(_)
            | CommandImpl::Log(_)
            | CommandImpl::Delay(_) => 1,
            CommandImpl::Loop(cmd) => cmd.work_units(),
            CommandImpl::Sequence(cmd) => cmd.work_units(),
            CommandImpl::Scripted(cmd) => cmd.script.work_units(),
        }
    }

    /// Nested commands of composite kinds.
    pub fn children(&self) -> &[CommandImpl] {
        match self {
            CommandImpl::Loop(cmd) => cmd.body(),
            CommandImpl::Sequence(cmd) => &cmd.body,
            _ => &[],
        }
    }

    /// Run the command, crediting leaf work units and wrapping leaf errors.
    pub async fn execute(&self, context: &ScanContext) -> ScanResult<()> {
        match self {
            CommandImpl::Loop(cmd) => cmd.execute(context).await,
            CommandImpl::Sequence(cmd) => cmd.execute(context).await,
            leaf => {
                let result = match leaf {
                    CommandImpl::Comment(cmd) => cmd.execute(),
                    CommandImpl::Write(cmd) => cmd.execute(context).await,
                    CommandImpl::Wait(cmd) => cmd.execute(context).await,
                    CommandImpl::Log(cmd) => cmd.execute(context).await,
                    CommandImpl::Delay(cmd) => cmd.execute(context).await,
                    CommandImpl::Scripted(cmd) => cmd.script.execute(context).await,
                    CommandImpl::Loop(_) | CommandImpl::Sequence(_) => Ok(()),
                };
                result.map_err(|e| e.in_command(leaf))?;
                context.work_performed(leaf.work_units());
                Ok(())
            }
        }
    }

    /// Indented one-line-per-command rendering of the tree.
    pub fn tree(&self) -> String {
        let mut out = String::new();
        self.write_tree(&mut out, 0);
        out
    }

    fn write_tree(&self, out: &mut String, level: usize) {
        out.push_str(&"  ".repeat(level));
        out.push_str(&self.to_string());
        out.push_str(&format!(" [{} units]\n", self.work_units()));
        for child in self.children() {
            child.write_tree(out, level + 1);
        }
    }
}

impl fmt::Display for CommandImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandImpl::Comment(cmd) => write!(f, "Comment '{}'", cmd.text),
            CommandImpl::Write(cmd) => fmt::Display::fmt(cmd, f),
            CommandImpl::Wait(cmd) => fmt::Display::fmt(cmd, f),
            CommandImpl::Log(cmd) => fmt::Display::fmt(cmd, f),
            CommandImpl::Delay(cmd) => write!(f, "Delay {} s", cmd.duration.as_secs_f64()),
            CommandImpl::Loop(cmd) => fmt::Display::fmt(cmd, f),
            CommandImpl::Sequence(cmd) => match &cmd.name {
                Some(name) => write!(f, "Sequence '{}'", name),
                None => f.write_str("Sequence"),
            },
            CommandImpl::Scripted(cmd) => write!(f, "Script '{}'", cmd.name),
        }
    }
}

impl fmt::Debug for CommandImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandImpl")
            .field("command", &self.to_string())
            .field("work_units", &self.work_units())
            .field("children", &self.children())
            .finish()
    }
}

/// Compiled `comment` command.
pub struct CommentCommandImpl {
    pub(crate) text: String,
}

impl CommentCommandImpl {
    fn execute(&self) -> ScanResult<()> {
        info!(comment = %self.text, "Scan comment");
        Ok(())
    }
}

/// Compiled `write` command.
pub struct WriteCommandImpl {
    pub(crate) device: String,
    pub(crate) value: f64,
    pub(crate) wait: bool,
    pub(crate) tolerance: Option<f64>,
    pub(crate) timeout: Option<Duration>,
}

impl WriteCommandImpl {
    async fn execute(&self, context: &ScanContext) -> ScanResult<()> {
        let device = context.device(&self.device)?;
        debug!(device = %self.device, value = self.value, "Write");
        device.write(self.value).await?;

        if self.wait {
            let tolerance = self
                .tolerance
                .unwrap_or_else(|| default_write_tolerance(self.value));
            DeviceValueCondition::new(device, Comparison::Equals, self.value, tolerance)
                .with_timeout(self.timeout.or_else(|| context.condition_timeout()))
                .wait(context.cancellation(), context.poll_interval())
                .await?;
        }
        Ok(())
    }
}

impl fmt::Display for WriteCommandImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Write '{}' = {}", self.device, self.value)?;
        if self.wait {
            f.write_str(" (wait for readback)")?;
        }
        Ok(())
    }
}

/// Compiled `wait` command.
pub struct WaitCommandImpl {
    pub(crate) device: String,
    pub(crate) comparison: Comparison,
    pub(crate) value: f64,
    pub(crate) tolerance: f64,
    pub(crate) timeout: Option<Duration>,
}

impl WaitCommandImpl {
    async fn execute(&self, context: &ScanContext) -> ScanResult<()> {
        let device = context.device(&self.device)?;
        DeviceValueCondition::new(device, self.comparison, self.value, self.tolerance)
            .with_timeout(self.timeout.or_else(|| context.condition_timeout()))
            .wait(context.cancellation(), context.poll_interval())
            .await
    }
}

impl fmt::Display for WaitCommandImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Wait for '{}' {} {}",
            self.device, self.comparison, self.value
        )
    }
}

/// Compiled `log` command.
pub struct LogCommandImpl {
    pub(crate) devices: Vec<String>,
}

impl LogCommandImpl {
    async fn execute(&self, context: &ScanContext) -> ScanResult<()> {
        for name in &self.devices {
            let device = context.device(name)?;
            let value = device.read().await?;
            let serial = context.log_sample(name, value).await;
            debug!(device = %name, value, serial, "Logged sample");
        }
        Ok(())
    }
}

impl fmt::Display for LogCommandImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Log ")?;
        for (i, device) in self.devices.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{}'", device)?;
        }
        Ok(())
    }
}

/// Compiled `delay` command.
pub struct DelayCommandImpl {
    pub(crate) duration: Duration,
}

impl DelayCommandImpl {
    async fn execute(&self, context: &ScanContext) -> ScanResult<()> {
        tokio::select! {
            _ = context.cancellation().cancelled() => Err(ScanError::Canceled),
            _ = sleep(self.duration) => Ok(()),
        }
    }
}

/// Ordered group of commands.
///
/// A named sequence wraps body failures with its name; the unnamed root sequence
/// produced by the compiler passes errors through untouched.
pub struct SequenceCommandImpl {
    pub(crate) name: Option<String>,
    pub(crate) body: Vec<CommandImpl>,
}

impl SequenceCommandImpl {
    /// Sequence over `body`; `None` for the root of a scan.
    pub fn new(name: Option<String>, body: Vec<CommandImpl>) -> Self {
        Self { name, body }
    }

    /// Sum of the body's units, saturating at `u64::MAX`.
    pub fn work_units(&self) -> u64 {
        self.body
            .iter()
            .map(CommandImpl::work_units)
            .fold(0u64, u64::saturating_add)
    }

    async fn execute(&self, context: &ScanContext) -> ScanResult<()> {
        let result = context.execute(&self.body).await;
        match (&self.name, result) {
            (Some(name), Err(e)) if !e.is_cancellation() => {
                warn!(sequence = %name, error = %e, "Sequence failed");
                Err(e.in_body(format!("Sequence '{}'", name)))
            }
            (_, result) => result,
        }
    }
}

/// Command provided by the script loader.
pub struct ScriptedCommandImpl {
    pub(crate) name: String,
    pub(crate) script: Box<dyn ScriptedCommand>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::device::{DeviceRegistry, MockDevice};
    use crate::engine::{DataLog, ScanCompiler, ScanProgress};
    use crate::ScanCommand;
    use std::sync::Arc;

    fn context(devices: Vec<Arc<MockDevice>>, total: u64) -> ScanContext {
        let mut registry = DeviceRegistry::new();
        for device in devices {
            registry.register(device);
        }
        let settings = EngineConfig {
            condition_poll_ms: 5,
            ..EngineConfig::default()
        };
        ScanContext::new(
            Arc::new(registry),
            Arc::new(ScanProgress::new(total)),
            Arc::new(DataLog::new()),
            settings,
        )
    }

    fn compile_one(command: ScanCommand) -> CommandImpl {
        ScanCompiler::new()
            .implement(&[command])
            .unwrap()
            .pop()
            .unwrap()
    }

    #[test]
    fn test_work_units_per_kind() {
        assert_eq!(compile_one(ScanCommand::comment("hi")).work_units(), 0);
        assert_eq!(compile_one(ScanCommand::write("x", 1.0)).work_units(), 1);
        assert_eq!(compile_one(ScanCommand::delay(0.5)).work_units(), 1);
        assert_eq!(
            compile_one(ScanCommand::sequence(
                "prep",
                vec![ScanCommand::write("x", 1.0), ScanCommand::log(&["y"]), ScanCommand::comment("c")]
            ))
            .work_units(),
            2
        );
    }

    #[tokio::test]
    async fn test_write_with_readback_wait() {
        let motor = Arc::new(MockDevice::new("motor", 0.0).with_settle_time(Duration::from_millis(30)));
        let ctx = context(vec![motor.clone()], 1);

        compile_one(ScanCommand::write_and_wait("motor", 2.5, 0.01))
            .execute(&ctx)
            .await
            .unwrap();

        assert_eq!(motor.value(), 2.5);
        assert_eq!(ctx.progress().work_done(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_wrapped_with_command() {
        let shutter = Arc::new(MockDevice::new("shutter", 0.0));
        shutter.set_fail_writes(true);
        let ctx = context(vec![shutter], 1);

        let err = compile_one(ScanCommand::write("shutter", 1.0))
            .execute(&ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::CommandFailed { .. }));
        assert_eq!(
            err.to_string(),
            "Write 'shutter' = 1 failed: Device 'shutter' write failed: simulated write failure"
        );
        assert_eq!(ctx.progress().work_done(), 0);
    }

    #[tokio::test]
    async fn test_log_records_samples() {
        let ctx = context(
            vec![Arc::new(MockDevice::new("power", 0.25)), Arc::new(MockDevice::new("temp", 20.0))],
            1,
        );

        compile_one(ScanCommand::log(&["power", "temp"]))
            .execute(&ctx)
            .await
            .unwrap();

        let samples = ctx.data().samples().await;
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].device, "power");
        assert_eq!(samples[1].value, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_fails_command() {
        let ctx = context(vec![Arc::new(MockDevice::new("temp", 20.0))], 1);
        let command = compile_one(ScanCommand::Wait {
            device: "temp".into(),
            comparison: Comparison::AtLeast,
            value: 30.0,
            tolerance: None,
            timeout_secs: Some(1.0),
        });

        let err = command.execute(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("Timeout after 1s"));
        assert!(!err.is_cancellation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_cancellable() {
        let ctx = context(vec![], 1);
        ctx.cancellation().cancel();

        let result = compile_one(ScanCommand::delay(3600.0)).execute(&ctx).await;
        assert!(matches!(result, Err(ScanError::Canceled)));
    }

    #[tokio::test]
    async fn test_named_sequence_wraps_body_failure() {
        let ctx = context(vec![], 1);
        let err = compile_one(ScanCommand::sequence(
            "prep",
            vec![ScanCommand::write("missing", 1.0)],
        ))
        .execute(&ctx)
        .await
        .unwrap_err();

        assert!(err.to_string().starts_with("Sequence 'prep' body failed: Write 'missing' = 1 failed"));
    }

    #[test]
    fn test_tree_rendering() {
        let root = ScanCompiler::new()
            .compile(&[ScanCommand::looping("m", 0.0, 2.0, 1.0, vec![ScanCommand::log(&["d"])])])
            .unwrap();
        assert_eq!(
            root.tree(),
            "Sequence [3 units]\n  Loop 'm' = 0 .. 2, step 1 [3 units]\n    Log 'd' [1 units]\n"
        );
    }
}

//! Scan executor and status model.
//!
//! A [`ScanExecutor`] owns one compiled command tree and runs it exactly once:
//!
//! ```text
//! Idle --start()--> Running --+--> Succeeded
//!   |                         +--> Failed   (error retained)
//!   |                         +--> Aborted  (after cancel() and unwinding)
//!   +--cancel()--> Aborted
//! ```
//!
//! Terminal states are final. The run happens on its own tokio task; status is
//! published through a `watch` channel so [`ScanExecutor::info`] can be called from
//! anywhere, at any time, without waiting for the scan.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::command_impl::CommandImpl;
use super::context::{ScanContext, ScanProgress};
use super::data::DataLog;
use crate::config::EngineConfig;
use crate::device::DeviceProvider;
use crate::error::{ScanError, ScanResult};

/// Lifecycle state of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// Compiled, not started
    Idle,
    /// Command tree executing
    Running,
    /// Every command completed
    Succeeded,
    /// A command failed; the error is retained
    Failed,
    /// Cancelled before completion
    Aborted,
}

impl ScanState {
    /// Succeeded, Failed or Aborted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Succeeded | ScanState::Failed | ScanState::Aborted
        )
    }

    /// Idle or Running.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Idle => "Idle",
            ScanState::Running => "Running",
            ScanState::Succeeded => "Succeeded",
            ScanState::Failed => "Failed",
            ScanState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

/// Read-only snapshot of a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanInfo {
    /// Scan id
    pub id: u64,
    /// Name given at submission
    pub name: String,
    /// Lifecycle state
    pub state: ScanState,
    /// Estimated work units
    pub work_total: u64,
    /// Units credited so far
    pub work_done: u64,
    /// Description of the command executing now
    pub current_command: Option<String>,
    /// Error message of a failed scan
    pub error: Option<String>,
    /// Submission time
    pub created: DateTime<Utc>,
    /// Time the scan reached a terminal state
    pub finished: Option<DateTime<Utc>>,
}

impl ScanInfo {
    /// Progress in percent, 0 to 100.
    pub fn percentage(&self) -> f64 {
        if self.work_total == 0 {
            return if self.state == ScanState::Succeeded { 100.0 } else { 0.0 };
        }
        (self.work_done as f64 * 100.0 / self.work_total as f64).min(100.0)
    }
}

impl fmt::Display for ScanInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Scan {} '{}': {} ({}/{} units, {:.1}%)",
            self.id,
            self.name,
            self.state,
            self.work_done,
            self.work_total,
            self.percentage()
        )?;
        if let Some(error) = &self.error {
            write!(f, ": {}", error)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ExecutorStatus {
    state: ScanState,
    error: Option<String>,
    finished: Option<DateTime<Utc>>,
}

/// Runs one compiled scan.
pub struct ScanExecutor {
    id: u64,
    name: String,
    created: DateTime<Utc>,
    root: Arc<CommandImpl>,
    devices: Arc<dyn DeviceProvider>,
    settings: EngineConfig,
    progress: Arc<ScanProgress>,
    data: Arc<DataLog>,
    cancel: CancellationToken,
    status: Arc<watch::Sender<ExecutorStatus>>,
}

impl ScanExecutor {
    /// Idle executor for a compiled tree.
    pub fn new(
        id: u64,
        name: impl Into<String>,
        root: CommandImpl,
        devices: Arc<dyn DeviceProvider>,
        settings: EngineConfig,
    ) -> Self {
        let (status, _) = watch::channel(ExecutorStatus {
            state: ScanState::Idle,
            error: None,
            finished: None,
        });
        Self {
            id,
            name: name.into(),
            created: Utc::now(),
            progress: Arc::new(ScanProgress::new(root.work_units())),
            root: Arc::new(root),
            devices,
            settings,
            data: Arc::new(DataLog::new()),
            cancel: CancellationToken::new(),
            status: Arc::new(status),
        }
    }

    /// Scan id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Scan name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ScanState {
        self.status.borrow().state
    }

    /// The compiled command tree.
    pub fn root(&self) -> &CommandImpl {
        &self.root
    }

    /// Samples logged by the scan so far.
    pub fn data(&self) -> Arc<DataLog> {
        Arc::clone(&self.data)
    }

    /// Move Idle to Running and spawn the scan task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> ScanResult<()> {
        let mut from = ScanState::Idle;
        let started = self.status.send_if_modified(|status| {
            if status.state == ScanState::Idle {
                status.state = ScanState::Running;
                true
            } else {
                from = status.state;
                false
            }
        });
        if !started {
            return Err(ScanError::InvalidTransition {
                from,
                action: "start".to_string(),
            });
        }
        info!(scan = self.id, name = %self.name, work_total = self.progress.work_total(), "Scan started");

        let context = ScanContext::new(
            Arc::clone(&self.devices),
            Arc::clone(&self.progress),
            Arc::clone(&self.data),
            self.settings.clone(),
        )
        .with_cancellation(self.cancel.clone());
        let root = Arc::clone(&self.root);
        let status = Arc::clone(&self.status);
        let progress = Arc::clone(&self.progress);
        let span = info_span!("scan", id = self.id, name = %self.name);

        tokio::spawn(
            async move {
                let outcome = AssertUnwindSafe(root.execute(&context)).catch_unwind().await;
                let (state, message) = match outcome {
                    Ok(result) => final_state(result, context.was_interrupted()),
                    Err(_) => (ScanState::Failed, Some("Scan task panicked".to_string())),
                };
                drop(context);
                progress.set_current_command(None);

                match state {
                    ScanState::Succeeded => info!(
                        work_done = progress.work_done(),
                        work_total = progress.work_total(),
                        "Scan succeeded"
                    ),
                    ScanState::Aborted => warn!(work_done = progress.work_done(), "Scan aborted"),
                    _ => error!(error = message.as_deref().unwrap_or(""), "Scan failed"),
                }
                status.send_modify(|status| {
                    status.state = state;
                    status.error = message;
                    status.finished = Some(Utc::now());
                });
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Request cooperative cancellation.
    ///
    /// A running scan keeps its state until the command tree has unwound; an idle
    /// scan is aborted right away. Cancelling a finished scan does nothing.
    pub fn cancel(&self) {
        let aborted_idle = self.status.send_if_modified(|status| {
            if status.state == ScanState::Idle {
                status.state = ScanState::Aborted;
                status.finished = Some(Utc::now());
                true
            } else {
                false
            }
        });
        if aborted_idle {
            info!(scan = self.id, "Idle scan aborted");
        } else if self.state() == ScanState::Running {
            info!(scan = self.id, "Cancellation requested");
        }
        self.cancel.cancel();
    }

    /// Current status snapshot.
    pub fn info(&self) -> ScanInfo {
        let status = self.status.borrow().clone();
        ScanInfo {
            id: self.id,
            name: self.name.clone(),
            state: status.state,
            work_total: self.progress.work_total(),
            work_done: self.progress.work_done(),
            current_command: self.progress.current_command(),
            error: status.error,
            created: self.created,
            finished: status.finished,
        }
    }

    /// Wait for a terminal state and return the final snapshot.
    pub async fn wait_until_done(&self) -> ScanInfo {
        let mut updates = self.status.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = updates.wait_for(|status| status.state.is_terminal()).await;
        self.info()
    }
}

impl fmt::Debug for ScanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanExecutor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Terminal state for the result of the root command.
///
/// `interrupted` is set when cancellation made the tree skip commands. A root that
/// ran every command succeeds even if cancellation was requested afterwards.
fn final_state(result: ScanResult<()>, interrupted: bool) -> (ScanState, Option<String>) {
    match result {
        Ok(()) if interrupted => (ScanState::Aborted, None),
        Ok(()) => (ScanState::Succeeded, None),
        Err(e) if e.is_cancellation() => (ScanState::Aborted, None),
        Err(e) => (ScanState::Failed, Some(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceError, DeviceRegistry, MockDevice};
    use crate::engine::ScanCompiler;
    use async_trait::async_trait;
    use crate::ScanCommand;
    use tokio::time::Duration;
    use tracing_test::traced_test;

    fn executor(registry: DeviceRegistry, commands: &[ScanCommand]) -> ScanExecutor {
        let root = ScanCompiler::new().compile(commands).unwrap();
        let settings = EngineConfig {
            condition_poll_ms: 5,
            ..EngineConfig::default()
        };
        ScanExecutor::new(1, "test", root, Arc::new(registry), settings)
    }

    #[test]
    fn test_state_classification() {
        assert!(ScanState::Idle.is_active());
        assert!(ScanState::Running.is_active());
        assert!(ScanState::Succeeded.is_terminal());
        assert!(ScanState::Failed.is_terminal());
        assert!(ScanState::Aborted.is_terminal());
        assert_eq!(serde_json::to_string(&ScanState::Aborted).unwrap(), "\"aborted\"");
    }

    /// Cancels the scan from inside its own write, after which nothing is left to run.
    struct CancellingDevice {
        token: CancellationToken,
        value: watch::Sender<f64>,
    }

    #[async_trait]
    impl Device for CancellingDevice {
        fn name(&self) -> &str {
            "trigger"
        }

        async fn write(&self, value: f64) -> Result<(), DeviceError> {
            self.value.send_replace(value);
            self.token.cancel();
            Ok(())
        }

        async fn read(&self) -> Result<f64, DeviceError> {
            Ok(*self.value.borrow())
        }

        fn subscribe(&self) -> watch::Receiver<f64> {
            self.value.subscribe()
        }
    }

    #[test]
    fn test_final_state_mapping() {
        assert_eq!(final_state(Ok(()), false).0, ScanState::Succeeded);
        assert_eq!(final_state(Ok(()), true).0, ScanState::Aborted);
        assert_eq!(final_state(Err(ScanError::Canceled.in_body("Loop")), true).0, ScanState::Aborted);

        let (state, message) = final_state(Err(ScanError::UnknownDevice("x".into())), false);
        assert_eq!(state, ScanState::Failed);
        assert_eq!(message.as_deref(), Some("Unknown device 'x'"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_run_to_success() {
        let registry = DeviceRegistry::new()
            .with_device(Arc::new(MockDevice::new("a", 0.0)))
            .with_device(Arc::new(MockDevice::new("b", 0.0)));
        let scan = executor(
            registry,
            &[ScanCommand::write("a", 1.0), ScanCommand::log(&["b"])],
        );
        assert_eq!(scan.state(), ScanState::Idle);

        scan.start().unwrap();
        let info = scan.wait_until_done().await;

        assert_eq!(info.state, ScanState::Succeeded);
        assert_eq!(info.work_done, 2);
        assert_eq!(info.percentage(), 100.0);
        assert!(info.finished.is_some());
        assert!(info.current_command.is_none());
        assert_eq!(scan.data().len().await, 1);
        assert!(logs_contain("Scan succeeded"));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let scan = executor(DeviceRegistry::new(), &[ScanCommand::comment("nothing")]);
        scan.start().unwrap();

        let err = scan.start().unwrap_err();
        assert!(matches!(err, ScanError::InvalidTransition { action, .. } if action == "start"));
        assert_eq!(scan.wait_until_done().await.state, ScanState::Succeeded);
    }

    #[tokio::test]
    async fn test_failure_retains_error() {
        let scan = executor(DeviceRegistry::new(), &[ScanCommand::write("ghost", 1.0)]);
        scan.start().unwrap();

        let info = scan.wait_until_done().await;
        assert_eq!(info.state, ScanState::Failed);
        assert_eq!(
            info.error.as_deref(),
            Some("Write 'ghost' = 1 failed: Unknown device 'ghost'")
        );
    }

    #[tokio::test]
    async fn test_cancel_idle_scan() {
        let scan = executor(DeviceRegistry::new(), &[ScanCommand::comment("nothing")]);
        scan.cancel();

        assert_eq!(scan.state(), ScanState::Aborted);
        assert!(matches!(
            scan.start(),
            Err(ScanError::InvalidTransition { from: ScanState::Aborted, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_scan() {
        let scan = executor(DeviceRegistry::new(), &[ScanCommand::delay(3600.0)]);
        scan.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scan.state(), ScanState::Running);
        assert_eq!(scan.info().current_command.as_deref(), Some("Delay 3600 s"));

        scan.cancel();
        let info = scan.wait_until_done().await;

        assert_eq!(info.state, ScanState::Aborted);
        assert!(info.error.is_none());
        assert_eq!(info.work_done, 0);
    }

    fn with_trigger(token: &CancellationToken, commands: &[ScanCommand]) -> ScanExecutor {
        let (value, _) = watch::channel(0.0);
        let registry = DeviceRegistry::new()
            .with_device(Arc::new(MockDevice::new("a", 0.0)))
            .with_device(Arc::new(CancellingDevice {
                token: token.clone(),
                value,
            }));
        let mut scan = executor(registry, commands);
        scan.cancel = token.clone();
        scan
    }

    #[tokio::test]
    async fn test_cancel_after_last_command_still_succeeds() {
        let token = CancellationToken::new();
        let scan = with_trigger(
            &token,
            &[ScanCommand::write("a", 1.0), ScanCommand::write("trigger", 1.0)],
        );

        scan.start().unwrap();
        let info = scan.wait_until_done().await;

        assert!(token.is_cancelled());
        assert_eq!(info.state, ScanState::Succeeded);
        assert_eq!(info.work_done, 2);
    }

    #[tokio::test]
    async fn test_cancel_before_remaining_commands_aborts() {
        let token = CancellationToken::new();
        let scan = with_trigger(
            &token,
            &[ScanCommand::write("trigger", 1.0), ScanCommand::write("a", 1.0)],
        );

        scan.start().unwrap();
        let info = scan.wait_until_done().await;

        assert_eq!(info.state, ScanState::Aborted);
        assert_eq!(info.work_done, 1);
    }

    #[test]
    fn test_percentage() {
        let mut info = ScanInfo {
            id: 7,
            name: "sweep".into(),
            state: ScanState::Running,
            work_total: 8,
            work_done: 2,
            current_command: None,
            error: None,
            created: Utc::now(),
            finished: None,
        };
        assert_eq!(info.percentage(), 25.0);
        assert_eq!(info.to_string(), "Scan 7 'sweep': Running (2/8 units, 25.0%)");

        info.work_total = 0;
        assert_eq!(info.percentage(), 0.0);
    }
}

//! Per-scan execution context.
//!
//! Exactly one [`ScanContext`] exists for a running scan. Every command in the
//! tree borrows it to resolve devices, observe cancellation, report progress and
//! run nested command lists. The context is created by the executor when the scan
//! starts and dropped when it reaches a terminal state.
//!
//! Progress lives in a separate [`ScanProgress`] shared with the executor, so
//! status snapshots can be taken from outside the scan task at any time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::command_impl::CommandImpl;
use super::data::DataLog;
use crate::config::EngineConfig;
use crate::device::{Device, DeviceProvider};
use crate::error::ScanResult;

/// Work-unit accounting and current command of one scan.
#[derive(Debug)]
pub struct ScanProgress {
    work_total: u64,
    work_done: AtomicU64,
    current: watch::Sender<Option<String>>,
}

impl ScanProgress {
    /// Progress of a scan estimated at `work_total` units.
    pub fn new(work_total: u64) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            work_total,
            work_done: AtomicU64::new(0),
            current,
        }
    }

    /// Estimated units of the whole scan.
    pub fn work_total(&self) -> u64 {
        self.work_total
    }

    /// Units credited so far.
    pub fn work_done(&self) -> u64 {
        self.work_done.load(Ordering::SeqCst)
    }

    /// Add completed units to the counter.
    pub fn add_work(&self, units: u64) {
        self.work_done.fetch_add(units, Ordering::SeqCst);
    }

    /// Description of the command currently executing.
    pub fn current_command(&self) -> Option<String> {
        self.current.borrow().clone()
    }

    /// Publish the command now executing, or `None` once the scan has ended.
    pub fn set_current_command(&self, description: Option<String>) {
        self.current.send_replace(description);
    }
}

/// Shared state of one running scan.
pub struct ScanContext {
    devices: Arc<dyn DeviceProvider>,
    cancel: CancellationToken,
    progress: Arc<ScanProgress>,
    data: Arc<DataLog>,
    settings: EngineConfig,
    interrupted: AtomicBool,
}

impl ScanContext {
    /// Context with its own cancellation token.
    pub fn new(
        devices: Arc<dyn DeviceProvider>,
        progress: Arc<ScanProgress>,
        data: Arc<DataLog>,
        settings: EngineConfig,
    ) -> Self {
        Self {
            devices,
            cancel: CancellationToken::new(),
            progress,
            data,
            settings,
            interrupted: AtomicBool::new(false),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve a device by name.
    pub fn device(&self, name: &str) -> ScanResult<Arc<dyn Device>> {
        self.devices.resolve(name)
    }

    /// Device provider shared with the scan's commands.
    pub fn devices(&self) -> Arc<dyn DeviceProvider> {
        Arc::clone(&self.devices)
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether [`execute`](Self::execute) skipped any command because of cancellation.
    ///
    /// Unlike [`is_cancelled`](Self::is_cancelled) this stays false when cancellation
    /// arrives after the last command has already run.
    pub fn was_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Token that blocking waits select on.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Work-unit accounting of the scan.
    pub fn progress(&self) -> &ScanProgress {
        &self.progress
    }

    /// Credit completed work units.
    pub fn work_performed(&self, units: u64) {
        if units > 0 {
            self.progress.add_work(units);
            trace!(
                done = self.progress.work_done(),
                total = self.progress.work_total(),
                "Work performed"
            );
        }
    }

    /// Append a device reading to the scan data.
    pub async fn log_sample(&self, device: &str, value: f64) -> u64 {
        self.data.record(device, value).await
    }

    /// Samples logged so far.
    pub fn data(&self) -> &DataLog {
        &self.data
    }

    /// Interval at which condition waits re-read their device.
    pub fn poll_interval(&self) -> Duration {
        self.settings.poll_interval()
    }

    /// Timeout applied to condition waits that do not set their own.
    pub fn condition_timeout(&self) -> Option<Duration> {
        self.settings.condition_timeout()
    }

    /// Execute commands strictly in order.
    ///
    /// Checks for cancellation before each command and, if set, returns `Ok(())`
    /// without running the rest, marking the context as interrupted. Errors from a
    /// command end the list immediately.
    pub fn execute<'a>(&'a self, commands: &'a [CommandImpl]) -> BoxFuture<'a, ScanResult<()>> {
        async move {
            for command in commands {
                if self.is_cancelled() {
                    debug!(skipped = %command, "Cancellation requested, skipping remaining commands");
                    self.interrupted.store(true, Ordering::SeqCst);
                    return Ok(());
                }
                self.progress.set_current_command(Some(command.to_string()));
                command.execute(self).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

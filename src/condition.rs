//! Device value conditions with a cancellable wait.
//!
//! A [`DeviceValueCondition`] suspends the scan until a device reaches a value.
//! The wait wakes on every change notification from the device and, as a
//! fallback, at least once per poll interval, so a cancel request or a timeout is
//! noticed promptly even when the device never publishes an update.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::device::Device;
use crate::error::{ScanError, ScanResult};

/// How the device value is compared to the desired value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Within tolerance of the desired value
    #[default]
    Equals,
    /// Greater than or equal
    AtLeast,
    /// Less than or equal
    AtMost,
    /// Strictly greater
    Above,
    /// Strictly less
    Below,
    /// Grown by the desired amount relative to the value when the wait started
    IncreaseBy,
    /// Dropped by the desired amount relative to the value when the wait started
    DecreaseBy,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Comparison::Equals => "=",
            Comparison::AtLeast => ">=",
            Comparison::AtMost => "<=",
            Comparison::Above => ">",
            Comparison::Below => "<",
            Comparison::IncreaseBy => "to increase by",
            Comparison::DecreaseBy => "to decrease by",
        };
        f.write_str(symbol)
    }
}

/// Condition that waits for a device to reach a value.
pub struct DeviceValueCondition {
    device: Arc<dyn Device>,
    comparison: Comparison,
    desired: f64,
    tolerance: f64,
    timeout: Option<Duration>,
}

impl DeviceValueCondition {
    /// Condition without a timeout. Negative tolerances are taken by magnitude.
    pub fn new(
        device: Arc<dyn Device>,
        comparison: Comparison,
        desired: f64,
        tolerance: f64,
    ) -> Self {
        Self {
            device,
            comparison,
            desired,
            tolerance: tolerance.abs(),
            timeout: None,
        }
    }

    /// Fail with [`ScanError::ConditionTimeout`] if the wait takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Change the value to wait for, e.g. for the next loop step.
    pub fn set_desired(&mut self, desired: f64) {
        self.desired = desired;
    }

    /// Value waited for.
    pub fn desired(&self) -> f64 {
        self.desired
    }

    /// Absolute tolerance of `Equals`.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Check `value` against the condition. `initial` is the value at the start of
    /// the wait and only matters for the relative comparisons.
    pub fn is_met(&self, value: f64, initial: f64) -> bool {
        match self.comparison {
            Comparison::Equals => (value - self.desired).abs() <= self.tolerance,
            Comparison::AtLeast => value >= self.desired,
            Comparison::AtMost => value <= self.desired,
            Comparison::Above => value > self.desired,
            Comparison::Below => value < self.desired,
            Comparison::IncreaseBy => value >= initial + self.desired,
            Comparison::DecreaseBy => value <= initial - self.desired,
        }
    }

    /// Block until the condition holds, the token is canceled, or the timeout elapses.
    pub async fn wait(&self, cancel: &CancellationToken, poll_interval: Duration) -> ScanResult<()> {
        let mut updates = self.device.subscribe();
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let initial = self.device.read().await?;
        trace!(condition = %self, initial, "Waiting for condition");

        loop {
            if cancel.is_cancelled() {
                return Err(ScanError::Canceled);
            }
            let value = self.device.read().await?;
            if self.is_met(value, initial) {
                debug!(condition = %self, value, "Condition met");
                return Ok(());
            }

            let mut tick = poll_interval;
            if let (Some(deadline), Some(timeout)) = (deadline, self.timeout) {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ScanError::ConditionTimeout {
                        condition: self.to_string(),
                        timeout,
                    });
                }
                tick = tick.min(deadline - now);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::Canceled),
                changed = updates.changed() => {
                    // Publisher gone, fall back to plain polling
                    if changed.is_err() {
                        sleep(tick).await;
                    }
                }
                _ = sleep(tick) => {}
            }
        }
    }
}

impl fmt::Display for DeviceValueCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' {} {}", self.device.name(), self.comparison, self.desired)?;
        if self.comparison == Comparison::Equals && self.tolerance > 0.0 {
            write!(f, " (+-{})", self.tolerance)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceValueCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceValueCondition")
            .field("device", &self.device.name())
            .field("comparison", &self.comparison)
            .field("desired", &self.desired)
            .field("tolerance", &self.tolerance)
            .field("timeout", &self.timeout)
            .finish()
    }
}

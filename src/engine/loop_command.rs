//! Loop command: steps a device over a range and runs a body at every step.
//!
//! # Iteration
//!
//! The range is normalised to `low = min(start, end)`, `high = max(start, end)`.
//! The effective step is `direction * step`: a positive effective step walks
//! `low, low + step, ..` up to `high`, a negative one walks `high` down to `low`.
//! Step values are computed from the step index rather than by accumulation, so a
//! fractional step does not drift past the end of the range.
//!
//! At every step the loop writes the device, waits until its readback is within
//! `|step| / 10` of the target, then runs the body.
//!
//! # Reversing ("bouncing") loops
//!
//! When the signed step points away from `end` (`start <= end` with a negative
//! step, or `start >= end` with a positive one) the loop is *reversing*: after each
//! complete, uncancelled run it flips its direction, so a loop nested inside an
//! outer loop sweeps back and forth. The direction belongs to this node only.

use std::fmt;
use std::sync::atomic::{AtomicI8, Ordering};

use tracing::{debug, warn};

use super::command_impl::CommandImpl;
use super::context::ScanContext;
use crate::condition::{Comparison, DeviceValueCondition};
use crate::device::Device;
use crate::error::{ScanError, ScanResult};

/// Compiled `loop` command.
pub struct LoopCommandImpl {
    device: String,
    start: f64,
    end: f64,
    step: f64,
    reverse: bool,
    direction: AtomicI8,
    body: Vec<CommandImpl>,
}

impl LoopCommandImpl {
    /// `step` must be finite and non-zero; the compiler checks this.
    pub fn new(device: impl Into<String>, start: f64, end: f64, step: f64, body: Vec<CommandImpl>) -> Self {
        let reverse = (start <= end && step < 0.0) || (start >= end && step > 0.0);
        Self {
            device: device.into(),
            start,
            end,
            step,
            reverse,
            direction: AtomicI8::new(1),
            body,
        }
    }

    /// Number of steps: `1 + round(|(end - start) / step|)`, saturating at `u64::MAX`.
    pub fn iterations(&self) -> u64 {
        // Float to int casts saturate, and a non-finite ratio maps to u64::MAX
        let ratio = ((self.end - self.start) / self.step).abs().round();
        let steps = if ratio.is_nan() { u64::MAX } else { ratio as u64 };
        steps.saturating_add(1)
    }

    /// Estimated work units: iterations times the body's units, or the iteration
    /// count when the body reports none.
    pub fn work_units(&self) -> u64 {
        let iterations = self.iterations();
        let body_units = self
            .body
            .iter()
            .map(CommandImpl::work_units)
            .fold(0u64, u64::saturating_add);
        if body_units == 0 {
            iterations
        } else {
            iterations.saturating_mul(body_units)
        }
    }

    /// Whether the loop flips direction after each complete run.
    pub fn is_reversing(&self) -> bool {
        self.reverse
    }

    /// Current sweep direction, `1` or `-1`.
    pub fn direction(&self) -> i8 {
        self.direction.load(Ordering::SeqCst)
    }

    /// Compiled loop body.
    pub fn body(&self) -> &[CommandImpl] {
        &self.body
    }

    /// Device values of the next run, in execution order.
    ///
    /// Values are produced lazily, one per step.
    pub fn step_values(&self) -> impl Iterator<Item = f64> {
        let low = self.start.min(self.end);
        let high = self.start.max(self.end);
        let step = f64::from(self.direction()) * self.step;
        let slack = step.abs() * 1e-9;

        (0u64..)
            .map(move |i| {
                if step > 0.0 {
                    low + i as f64 * step
                } else {
                    high + i as f64 * step
                }
            })
            .take_while(move |value| *value >= low - slack && *value <= high + slack)
    }

    /// Sweep the device over the range, running the body at every step.
    pub async fn execute(&self, context: &ScanContext) -> ScanResult<()> {
        let device = context.device(&self.device).map_err(|e| e.in_command(self))?;
        let mut reach_value = DeviceValueCondition::new(
            device.clone(),
            Comparison::Equals,
            self.start,
            self.step.abs() / 10.0,
        )
        .with_timeout(context.condition_timeout());

        debug!(
            device = %self.device,
            start = self.start,
            end = self.end,
            step = self.step,
            direction = self.direction(),
            "Loop"
        );

        for value in self.step_values() {
            if context.is_cancelled() {
                return Err(ScanError::Canceled);
            }
            self.execute_step(context, device.as_ref(), &mut reach_value, value)
                .await?;
        }
        // The body stopped early on cancellation without raising
        if context.was_interrupted() {
            return Err(ScanError::Canceled);
        }

        if self.reverse {
            self.direction.store(-self.direction(), Ordering::SeqCst);
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        context: &ScanContext,
        device: &dyn Device,
        reach_value: &mut DeviceValueCondition,
        value: f64,
    ) -> ScanResult<()> {
        context
            .progress()
            .set_current_command(Some(format!("{} @ {}", self, value)));

        device
            .write(value)
            .await
            .map_err(|e| ScanError::from(e).in_command(self))?;
        reach_value.set_desired(value);
        reach_value
            .wait(context.cancellation(), context.poll_interval())
            .await
            .map_err(|e| e.in_command(self))?;

        if let Err(e) = context.execute(&self.body).await {
            if e.is_cancellation() {
                return Err(e);
            }
            warn!(command = %self, device = %self.device, value, error = %e, "Loop body failed");
            return Err(e.in_body(self));
        }

        // Nothing in the body credits work, so count the step itself
        if self.body.is_empty() {
            context.work_performed(1);
        }
        Ok(())
    }
}

impl fmt::Display for LoopCommandImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Loop '{}' = {} .. {}, step {}",
            self.device, self.start, self.end, self.step
        )?;
        if self.reverse {
            f.write_str(" (reversing)")?;
        }
        Ok(())
    }
}

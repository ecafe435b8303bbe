//! Mock Device Implementation
//!
//! Simulated control-system values for testing and for running scans without
//! hardware. All timing uses `tokio::time`, never `std::thread::sleep`.
//!
//! A `MockDevice` separates the write acknowledgment from the readback:
//!
//! - `ack_delay`: how long `write()` takes before it returns
//! - `settle_time`: how long after the write the readback reaches the new value
//! - `stuck`: the readback never follows writes (useful to hold a scan inside a
//!   condition wait)
//!
//! Writes can be made to fail, and every write is recorded in an optional shared
//! [`WriteJournal`] in the order the writes were issued.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, trace};

use super::{Device, DeviceError};

/// Ordered record of `(device, value)` writes shared by several mock devices.
#[derive(Debug, Clone, Default)]
pub struct WriteJournal {
    entries: Arc<Mutex<Vec<(String, f64)>>>,
}

impl WriteJournal {
    fn record(&self, device: &str, value: f64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((device.to_string(), value));
    }

    /// Snapshot of all writes so far.
    pub fn entries(&self) -> Vec<(String, f64)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Values written to one device, in order.
    pub fn values_for(&self, device: &str) -> Vec<f64> {
        self.entries()
            .into_iter()
            .filter(|(name, _)| name == device)
            .map(|(_, value)| value)
            .collect()
    }

    /// Number of recorded writes.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True if nothing was written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Simulated device
///
/// # Example
///
/// ```rust,ignore
/// let motor = MockDevice::new("motor", 0.0).with_settle_time(Duration::from_millis(50));
/// motor.write(10.0).await?;          // returns right away
/// assert_eq!(motor.read().await?, 0.0);
/// sleep(Duration::from_millis(60)).await;
/// assert_eq!(motor.read().await?, 10.0);
/// ```
pub struct MockDevice {
    name: String,
    value: Arc<watch::Sender<f64>>,
    ack_delay: Duration,
    settle_time: Duration,
    stuck: AtomicBool,
    fail_writes: AtomicBool,
    // Bumped on every write so a slow settle task cannot overwrite a newer value
    generation: Arc<AtomicU64>,
    write_count: AtomicUsize,
    journal: Option<WriteJournal>,
}

impl MockDevice {
    /// Create a device whose readback follows writes immediately.
    pub fn new(name: impl Into<String>, initial: f64) -> Self {
        let (value, _) = watch::channel(initial);
        Self {
            name: name.into(),
            value: Arc::new(value),
            ack_delay: Duration::ZERO,
            settle_time: Duration::ZERO,
            stuck: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            generation: Arc::new(AtomicU64::new(0)),
            write_count: AtomicUsize::new(0),
            journal: None,
        }
    }

    /// Delay before `write()` acknowledges.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    /// Delay between the write and the readback reaching the written value.
    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Record writes into a shared journal.
    pub fn with_journal(mut self, journal: WriteJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Make the readback ignore writes.
    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::SeqCst);
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Change the readback directly, as if the value moved on its own.
    pub fn set_value(&self, value: f64) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.value.send_replace(value);
    }

    /// Current readback without going through the async API.
    pub fn value(&self) -> f64 {
        *self.value.borrow()
    }

    /// Number of accepted writes.
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Device for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, value: f64) -> Result<(), DeviceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DeviceError::Write {
                device: self.name.clone(),
                message: "simulated write failure".to_string(),
            });
        }
        if let Some(journal) = &self.journal {
            journal.record(&self.name, value);
        }
        self.write_count.fetch_add(1, Ordering::SeqCst);
        debug!(device = %self.name, value, "MockDevice write");

        if !self.ack_delay.is_zero() {
            sleep(self.ack_delay).await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if self.stuck.load(Ordering::SeqCst) {
            trace!(device = %self.name, "MockDevice readback stuck");
        } else if self.settle_time.is_zero() {
            self.value.send_replace(value);
        } else {
            let sender = self.value.clone();
            let current = self.generation.clone();
            let settle_time = self.settle_time;
            tokio::spawn(async move {
                sleep(settle_time).await;
                if current.load(Ordering::SeqCst) == generation {
                    sender.send_replace(value);
                }
            });
        }
        Ok(())
    }

    async fn read(&self) -> Result<f64, DeviceError> {
        Ok(*self.value.borrow())
    }

    fn subscribe(&self) -> watch::Receiver<f64> {
        self.value.subscribe()
    }
}

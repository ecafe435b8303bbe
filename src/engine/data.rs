//! Scan data log
//!
//! `Log` commands append one [`Sample`] per device read. Samples carry a serial
//! number that increases across the whole scan, so samples taken by the same log
//! command can be lined up afterwards.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// One logged device reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Position in the scan data, starting at 0
    pub serial: u64,
    /// Device read
    pub device: String,
    /// Value read
    pub value: f64,
    /// Time of the reading
    pub timestamp: DateTime<Utc>,
}

/// Append-only sample store of one scan.
#[derive(Debug, Default)]
pub struct DataLog {
    samples: RwLock<Vec<Sample>>,
    next_serial: AtomicU64,
}

impl DataLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reading and return its serial number.
    pub async fn record(&self, device: &str, value: f64) -> u64 {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        self.samples.write().await.push(Sample {
            serial,
            device: device.to_string(),
            value,
            timestamp: Utc::now(),
        });
        serial
    }

    /// All samples, oldest first.
    pub async fn samples(&self) -> Vec<Sample> {
        self.samples.read().await.clone()
    }

    /// Samples of one device, oldest first.
    pub async fn samples_for(&self, device: &str) -> Vec<Sample> {
        self.samples
            .read()
            .await
            .iter()
            .filter(|sample| sample.device == device)
            .cloned()
            .collect()
    }

    /// Number of samples.
    pub async fn len(&self) -> usize {
        self.samples.read().await.len()
    }

    /// True if nothing was logged.
    pub async fn is_empty(&self) -> bool {
        self.samples.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_assigns_increasing_serials() {
        let log = DataLog::new();
        assert!(log.is_empty().await);

        assert_eq!(log.record("power", 0.5).await, 0);
        assert_eq!(log.record("temp", 21.0).await, 1);
        assert_eq!(log.record("power", 0.7).await, 2);

        assert_eq!(log.len().await, 3);
        let power: Vec<f64> = log.samples_for("power").await.iter().map(|s| s.value).collect();
        assert_eq!(power, vec![0.5, 0.7]);
    }
}

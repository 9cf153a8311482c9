//! Operation timing, per-operation statistics, and slow-call alerts.
//!
//! The monitor is a higher-order wrapper: hand [`PerformanceMonitor::observe`]
//! any future and it comes back timed and counted, with a
//! [`SlowOperationAlert`] broadcast (and a tracing warning) when the call
//! exceeds the slow threshold. Alerts are observational only - the
//! wrapped operation's outcome is returned untouched.

use crate::config::MonitorConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of the alert broadcast channel; alerts overflow-drop for slow
/// receivers rather than block the monitored operation.
const ALERT_CHANNEL_CAPACITY: usize = 64;

/// Aggregated statistics for one named operation.
///
/// Monotonic except for explicit [`PerformanceMonitor::reset`].
#[derive(Debug, Clone, Default)]
pub struct PerformanceRecord {
    /// Invocations recorded.
    pub calls: u64,
    /// Invocations that returned an error.
    pub errors: u64,
    /// Sum of all durations.
    pub total_duration: Duration,
    /// Duration of the most recent invocation.
    pub last_duration: Duration,
    /// Shortest invocation seen.
    pub min_duration: Duration,
    /// Longest invocation seen.
    pub max_duration: Duration,
}

impl PerformanceRecord {
    /// Mean duration over all recorded invocations.
    pub fn average(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.calls as u32
        }
    }

    /// Fraction of invocations that succeeded, 0.0 before any call.
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            (self.calls - self.errors) as f64 / self.calls as f64
        }
    }

    fn update(&mut self, duration: Duration, success: bool) {
        if self.calls == 0 {
            self.min_duration = duration;
            self.max_duration = duration;
        } else {
            self.min_duration = self.min_duration.min(duration);
            self.max_duration = self.max_duration.max(duration);
        }
        self.calls += 1;
        if !success {
            self.errors += 1;
        }
        self.total_duration += duration;
        self.last_duration = duration;
    }
}

/// Alert emitted when an operation runs past the slow threshold.
#[derive(Debug, Clone)]
pub struct SlowOperationAlert {
    /// The operation's registered name.
    pub operation: String,
    /// How long the invocation took.
    pub duration: Duration,
    /// The threshold it exceeded.
    pub threshold: Duration,
}

/// Times and counts arbitrary operations, keyed by name.
pub struct PerformanceMonitor {
    records: Mutex<HashMap<String, PerformanceRecord>>,
    slow_threshold: Duration,
    alert_tx: broadcast::Sender<SlowOperationAlert>,
}

impl PerformanceMonitor {
    /// Create a monitor.
    ///
    /// The configuration should be validated by the caller; the service
    /// facade does so as part of its own construction.
    pub fn new(config: MonitorConfig) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            records: Mutex::new(HashMap::new()),
            slow_threshold: config.slow_threshold,
            alert_tx,
        }
    }

    /// Run a fallible operation under timing.
    ///
    /// Records one update (duration, success/failure) and raises an alert
    /// when the duration exceeds the slow threshold. The operation's
    /// result is passed through unchanged.
    pub async fn observe<F, T, E>(&self, name: &str, operation: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let result = operation.await;
        self.record(name, start.elapsed(), result.is_ok());
        result
    }

    /// Run an infallible operation under timing.
    pub async fn measure<F, T>(&self, name: &str, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let start = Instant::now();
        let output = operation.await;
        self.record(name, start.elapsed(), true);
        output
    }

    /// Record one invocation manually.
    pub fn record(&self, name: &str, duration: Duration, success: bool) {
        {
            let mut records = self.records.lock().unwrap();
            records
                .entry(name.to_string())
                .or_default()
                .update(duration, success);
        }

        if duration > self.slow_threshold {
            warn!(
                operation = name,
                duration_ms = duration.as_millis() as u64,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "slow operation"
            );
            let _ = self.alert_tx.send(SlowOperationAlert {
                operation: name.to_string(),
                duration,
                threshold: self.slow_threshold,
            });
        }
    }

    /// Subscribe to slow-operation alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<SlowOperationAlert> {
        self.alert_tx.subscribe()
    }

    /// Statistics for one operation, if it has been recorded.
    pub fn get(&self, name: &str) -> Option<PerformanceRecord> {
        self.records.lock().unwrap().get(name).cloned()
    }

    /// Statistics for every recorded operation.
    pub fn summary(&self) -> HashMap<String, PerformanceRecord> {
        self.records.lock().unwrap().clone()
    }

    /// The configured slow threshold.
    pub fn slow_threshold(&self) -> Duration {
        self.slow_threshold
    }

    /// Reset one operation's record, or all of them.
    pub fn reset(&self, name: Option<&str>) {
        let mut records = self.records.lock().unwrap();
        match name {
            Some(name) => {
                records.remove(name);
            }
            None => records.clear(),
        }
    }
}

//! Metrics collection for resolver monitoring.
//!
//! Producers never wait on metrics: [`MetricsRecorder::record`] does a
//! `try_send` into a bounded channel and drops the event when the channel is
//! full or closed. A single [`MetricsAggregator`] task drains the channel,
//! updates counters and daily rollups, and forwards to a [`MetricsSink`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bridgemenot_common::{now, BridgeError, SwapStatus, Timestamp};

use crate::config::MetricsConfig;

/// What an event measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateSwap,
    Transition(SwapStatus),
    AcquireLock,
    /// An acquire attempt found the lock held.
    LockContended,
    TakeoverLock,
    ReleaseLock,
    ExtendLock,
    ExpireStale,
    /// A resolver lifecycle step towards a status, lock and chain action included.
    Step(SwapStatus),
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateSwap => f.write_str("create_swap"),
            Operation::Transition(status) => write!(f, "transition_{status}"),
            Operation::AcquireLock => f.write_str("acquire_lock"),
            Operation::LockContended => f.write_str("lock_contended"),
            Operation::TakeoverLock => f.write_str("takeover_lock"),
            Operation::ReleaseLock => f.write_str("release_lock"),
            Operation::ExtendLock => f.write_str("extend_lock"),
            Operation::ExpireStale => f.write_str("expire_stale"),
            Operation::Step(status) => write!(f, "step_{status}"),
        }
    }
}

/// One measured operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationEvent {
    pub operation: Operation,
    pub timestamp: Timestamp,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
    pub error_code: Option<&'static str>,
}

impl OperationEvent {
    pub fn success(operation: Operation, duration: Duration) -> Self {
        Self {
            operation,
            timestamp: now(),
            duration,
            success: true,
            error: None,
            error_code: None,
        }
    }

    pub fn failure(operation: Operation, duration: Duration, error: &BridgeError) -> Self {
        Self {
            operation,
            timestamp: now(),
            duration,
            success: false,
            error: Some(error.to_string()),
            error_code: Some(error.error_code()),
        }
    }
}

/// Producer handle; cheap to clone.
#[derive(Clone, Default)]
pub struct MetricsRecorder {
    tx: Option<mpsc::Sender<OperationEvent>>,
    dropped: Arc<AtomicU64>,
}

impl MetricsRecorder {
    /// A recorder that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Enqueue an event without waiting.
    pub fn record(&self, event: OperationEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(operation = %event.operation, "Metrics channel full, event dropped");
            }
            Err(TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(operation = %event.operation, "Metrics channel closed, event dropped");
            }
        }
    }

    /// Record the outcome of an operation that started at `started`.
    pub fn observe<T>(
        &self,
        operation: Operation,
        started: Instant,
        result: &Result<T, BridgeError>,
    ) {
        let duration = started.elapsed();
        let event = match result {
            Ok(_) => OperationEvent::success(operation, duration),
            Err(e) => OperationEvent::failure(operation, duration, e),
        };
        self.record(event);
    }

    /// Events lost to a full or closed channel.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Per-day, per-operation summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyRollup {
    pub day: NaiveDate,
    pub operation: String,
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl DailyRollup {
    fn new(day: NaiveDate, operation: String) -> Self {
        Self {
            day,
            operation,
            count: 0,
            successes: 0,
            failures: 0,
            total_duration_ms: 0,
            max_duration_ms: 0,
        }
    }

    fn add(&mut self, event: &OperationEvent) {
        let millis = event.duration.as_millis() as u64;
        self.count += 1;
        if event.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration_ms += millis;
        self.max_duration_ms = self.max_duration_ms.max(millis);
    }

    pub fn mean_duration_ms(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_duration_ms / self.count
        }
    }
}

#[derive(Debug, Error)]
#[error("metrics sink failed: {0}")]
pub struct SinkError(pub String);

/// Destination for events and rollups.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_event(&self, event: &OperationEvent) -> Result<(), SinkError>;

    async fn record_rollup(&self, rollup: &DailyRollup) -> Result<(), SinkError>;
}

/// Sink that writes events to the trace log.
pub struct TracingSink;

#[async_trait]
impl MetricsSink for TracingSink {
    async fn record_event(&self, event: &OperationEvent) -> Result<(), SinkError> {
        debug!(
            operation = %event.operation,
            success = event.success,
            duration_ms = event.duration.as_millis() as u64,
            error_code = event.error_code.unwrap_or(""),
            "Operation"
        );
        Ok(())
    }

    async fn record_rollup(&self, rollup: &DailyRollup) -> Result<(), SinkError> {
        info!(
            day = %rollup.day,
            operation = %rollup.operation,
            count = rollup.count,
            failures = rollup.failures,
            mean_ms = rollup.mean_duration_ms(),
            "Daily rollup"
        );
        Ok(())
    }
}

/// Sink that keeps everything in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<OperationEvent>>,
    rollups: Mutex<Vec<DailyRollup>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OperationEvent> {
        self.events.lock().clone()
    }

    pub fn rollups(&self) -> Vec<DailyRollup> {
        self.rollups.lock().clone()
    }
}

#[async_trait]
impl MetricsSink for MemorySink {
    async fn record_event(&self, event: &OperationEvent) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn record_rollup(&self, rollup: &DailyRollup) -> Result<(), SinkError> {
        self.rollups.lock().push(rollup.clone());
        Ok(())
    }
}

/// Resolver counters.
pub struct Metrics {
    pub swaps_created: AtomicU64,
    /// Successful transitions, indexed like [`SwapStatus::ALL`].
    pub transitions: [AtomicU64; 7],
    pub completions: AtomicU64,
    pub cancellations: AtomicU64,
    pub failures: AtomicU64,
    pub version_conflicts: AtomicU64,
    pub locks_acquired: AtomicU64,
    pub lock_contention: AtomicU64,
    pub lock_takeovers: AtomicU64,
    pub locks_released: AtomicU64,
    pub locks_extended: AtomicU64,
    pub operation_errors: AtomicU64,
    pub steps: AtomicU64,
    pub failed_steps: AtomicU64,
    /// Failed steps by error code.
    pub step_errors: DashMap<&'static str, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            swaps_created: AtomicU64::new(0),
            transitions: Default::default(),
            completions: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            version_conflicts: AtomicU64::new(0),
            locks_acquired: AtomicU64::new(0),
            lock_contention: AtomicU64::new(0),
            lock_takeovers: AtomicU64::new(0),
            locks_released: AtomicU64::new(0),
            locks_extended: AtomicU64::new(0),
            operation_errors: AtomicU64::new(0),
            steps: AtomicU64::new(0),
            failed_steps: AtomicU64::new(0),
            step_errors: DashMap::new(),
        }
    }

    /// Update counters for one event.
    pub fn apply(&self, event: &OperationEvent) {
        // Steps wrap store operations that are counted on their own.
        if let Operation::Step(_) = event.operation {
            self.steps.fetch_add(1, Ordering::Relaxed);
            if !event.success {
                self.failed_steps.fetch_add(1, Ordering::Relaxed);
                *self
                    .step_errors
                    .entry(event.error_code.unwrap_or("UNKNOWN"))
                    .or_default() += 1;
            }
            return;
        }
        if event.error_code == Some("VERSION_CONFLICT") {
            self.version_conflicts.fetch_add(1, Ordering::Relaxed);
        }
        if !event.success {
            if event.operation != Operation::LockContended {
                self.operation_errors.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        match event.operation {
            Operation::CreateSwap => {
                self.swaps_created.fetch_add(1, Ordering::Relaxed);
            }
            Operation::Transition(status) => {
                self.transitions[status_index(status)].fetch_add(1, Ordering::Relaxed);
                match status {
                    SwapStatus::Completed => self.completions.fetch_add(1, Ordering::Relaxed),
                    SwapStatus::Cancelled => self.cancellations.fetch_add(1, Ordering::Relaxed),
                    SwapStatus::Failed => self.failures.fetch_add(1, Ordering::Relaxed),
                    _ => 0,
                };
            }
            Operation::AcquireLock => {
                self.locks_acquired.fetch_add(1, Ordering::Relaxed);
            }
            Operation::TakeoverLock => {
                self.locks_acquired.fetch_add(1, Ordering::Relaxed);
                self.lock_takeovers.fetch_add(1, Ordering::Relaxed);
            }
            Operation::LockContended => {
                self.lock_contention.fetch_add(1, Ordering::Relaxed);
            }
            Operation::ReleaseLock => {
                self.locks_released.fetch_add(1, Ordering::Relaxed);
            }
            Operation::ExtendLock => {
                self.locks_extended.fetch_add(1, Ordering::Relaxed);
            }
            Operation::ExpireStale | Operation::Step(_) => {}
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut transitions = [0u64; 7];
        for (slot, counter) in transitions.iter_mut().zip(&self.transitions) {
            *slot = counter.load(Ordering::Relaxed);
        }
        MetricsSnapshot {
            swaps_created: self.swaps_created.load(Ordering::Relaxed),
            transitions,
            completions: self.completions.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            version_conflicts: self.version_conflicts.load(Ordering::Relaxed),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            lock_contention: self.lock_contention.load(Ordering::Relaxed),
            lock_takeovers: self.lock_takeovers.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            locks_extended: self.locks_extended.load(Ordering::Relaxed),
            operation_errors: self.operation_errors.load(Ordering::Relaxed),
            steps: self.steps.load(Ordering::Relaxed),
            failed_steps: self.failed_steps.load(Ordering::Relaxed),
            step_errors: self
                .step_errors
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn status_index(status: SwapStatus) -> usize {
    SwapStatus::ALL
        .iter()
        .position(|s| *s == status)
        .unwrap_or_default()
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub swaps_created: u64,
    pub transitions: [u64; 7],
    pub completions: u64,
    pub cancellations: u64,
    pub failures: u64,
    pub version_conflicts: u64,
    pub locks_acquired: u64,
    pub lock_contention: u64,
    pub lock_takeovers: u64,
    pub locks_released: u64,
    pub locks_extended: u64,
    pub operation_errors: u64,
    pub steps: u64,
    pub failed_steps: u64,
    pub step_errors: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn transitions_to(&self, status: SwapStatus) -> u64 {
        self.transitions[status_index(status)]
    }

    /// Export in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP bridgemenot_{name} {help}\n# TYPE bridgemenot_{name} counter\nbridgemenot_{name} {value}\n\n"
            ));
        };
        counter("swaps_created_total", "Swaps committed", self.swaps_created);
        counter("swaps_completed_total", "Swaps completed", self.completions);
        counter("swaps_cancelled_total", "Swaps cancelled", self.cancellations);
        counter("swaps_failed_total", "Swaps failed", self.failures);
        counter(
            "version_conflicts_total",
            "Transitions rejected for a stale version",
            self.version_conflicts,
        );
        counter("locks_acquired_total", "Locks acquired", self.locks_acquired);
        counter(
            "lock_contention_total",
            "Acquire attempts that found the lock held",
            self.lock_contention,
        );
        counter(
            "lock_takeovers_total",
            "Expired locks taken over",
            self.lock_takeovers,
        );
        counter("locks_released_total", "Locks released", self.locks_released);
        counter("locks_extended_total", "Lock extensions", self.locks_extended);
        counter(
            "operation_errors_total",
            "Operations that returned an error",
            self.operation_errors,
        );
        counter("steps_total", "Lifecycle steps driven", self.steps);
        counter("step_failures_total", "Lifecycle steps that failed", self.failed_steps);

        if !self.step_errors.is_empty() {
            out.push_str("# HELP bridgemenot_step_errors_total Failed lifecycle steps by error code\n");
            out.push_str("# TYPE bridgemenot_step_errors_total counter\n");
            for (code, value) in &self.step_errors {
                out.push_str(&format!("bridgemenot_step_errors_total{{code=\"{code}\"}} {value}\n"));
            }
            out.push('\n');
        }

        out.push_str("# HELP bridgemenot_transitions_total Successful transitions by target status\n");
        out.push_str("# TYPE bridgemenot_transitions_total counter\n");
        for (status, value) in SwapStatus::ALL.iter().zip(self.transitions) {
            out.push_str(&format!(
                "bridgemenot_transitions_total{{status=\"{status}\"}} {value}\n"
            ));
        }
        out
    }
}

/// Consumer side of the metrics pipeline.
pub struct MetricsAggregator {
    metrics: Metrics,
    rollups: DashMap<(NaiveDate, String), DailyRollup>,
    /// Days of rollups kept, today included.
    rollup_retention_days: u32,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl MetricsAggregator {
    pub fn new(sink: Option<Arc<dyn MetricsSink>>) -> Self {
        Self::with_retention(sink, MetricsConfig::default().rollup_retention_days)
    }

    pub fn with_retention(sink: Option<Arc<dyn MetricsSink>>, rollup_retention_days: u32) -> Self {
        Self {
            metrics: Metrics::new(),
            rollups: DashMap::new(),
            rollup_retention_days: rollup_retention_days.max(1),
            sink,
        }
    }

    /// Create the channel and spawn the aggregator task.
    ///
    /// With metrics disabled the recorder discards events and no task runs.
    pub fn spawn(
        config: &MetricsConfig,
        sink: Option<Arc<dyn MetricsSink>>,
    ) -> (MetricsRecorder, Arc<Self>, Option<JoinHandle<()>>) {
        let aggregator = Arc::new(Self::with_retention(sink, config.rollup_retention_days));
        if !config.enabled {
            return (MetricsRecorder::disabled(), aggregator, None);
        }

        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let recorder = MetricsRecorder {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let handle = tokio::spawn(aggregator.clone().run(rx));
        (recorder, aggregator, Some(handle))
    }

    /// Drain events until every recorder is dropped, then flush rollups.
    ///
    /// Rollups of days gone by are forwarded and pruned when the day turns.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<OperationEvent>) {
        let mut today = now().date_naive();
        while let Some(event) = rx.recv().await {
            let day = event.timestamp.date_naive();
            if day > today {
                self.flush_rollups().await;
                today = day;
            }
            self.ingest(&event).await;
        }
        self.flush_rollups().await;
        debug!("Metrics aggregator stopped");
    }

    /// Account for one event and forward it to the sink.
    pub async fn ingest(&self, event: &OperationEvent) {
        self.metrics.apply(event);
        self.rollups
            .entry((event.timestamp.date_naive(), event.operation.to_string()))
            .or_insert_with(|| {
                DailyRollup::new(event.timestamp.date_naive(), event.operation.to_string())
            })
            .add(event);

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.record_event(event).await {
                warn!(operation = %event.operation, error = %e, "Metrics sink rejected event");
            }
        }
    }

    /// Forward every rollup to the sink, then drop those past retention.
    pub async fn flush_rollups(&self) {
        if let Some(sink) = &self.sink {
            for rollup in self.rollups() {
                if let Err(e) = sink.record_rollup(&rollup).await {
                    warn!(day = %rollup.day, operation = %rollup.operation, error = %e, "Metrics sink rejected rollup");
                }
            }
        }
        self.prune_rollups(now().date_naive());
    }

    /// Drop rollups older than the retention window ending on `today`.
    pub fn prune_rollups(&self, today: NaiveDate) -> usize {
        let keep = u64::from(self.rollup_retention_days - 1);
        let Some(cutoff) = today.checked_sub_days(Days::new(keep)) else {
            return 0;
        };
        let before = self.rollups.len();
        self.rollups.retain(|(day, _), _| *day >= cutoff);
        let pruned = before - self.rollups.len();
        if pruned > 0 {
            debug!(pruned, %cutoff, "Pruned daily rollups");
        }
        pruned
    }

    /// Rollups ordered by day then operation.
    pub fn rollups(&self) -> Vec<DailyRollup> {
        let mut rollups: Vec<DailyRollup> = self.rollups.iter().map(|r| r.value().clone()).collect();
        rollups.sort_by(|a, b| (a.day, &a.operation).cmp(&(b.day, &b.operation)));
        rollups
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridgemenot_common::SwapId;
    use alloy_primitives::B256;

    struct FailingSink;

    #[async_trait]
    impl MetricsSink for FailingSink {
        async fn record_event(&self, _: &OperationEvent) -> Result<(), SinkError> {
            Err(SinkError("disk full".into()))
        }

        async fn record_rollup(&self, _: &DailyRollup) -> Result<(), SinkError> {
            Err(SinkError("disk full".into()))
        }
    }

    fn ok(operation: Operation) -> OperationEvent {
        OperationEvent::success(operation, Duration::from_millis(4))
    }

    #[tokio::test]
    async fn test_counters_and_rollups() {
        let sink = Arc::new(MemorySink::new());
        let aggregator = MetricsAggregator::new(Some(sink.clone()));

        aggregator.ingest(&ok(Operation::CreateSwap)).await;
        aggregator.ingest(&ok(Operation::CreateSwap)).await;
        aggregator
            .ingest(&ok(Operation::Transition(SwapStatus::Completed)))
            .await;
        aggregator.ingest(&ok(Operation::TakeoverLock)).await;

        let conflict = BridgeError::VersionConflict {
            swap_id: SwapId::new(B256::ZERO),
            expected: 1,
            actual: 2,
        };
        aggregator
            .ingest(&OperationEvent::failure(
                Operation::Transition(SwapStatus::SrcEscrowDeployed),
                Duration::from_millis(1),
                &conflict,
            ))
            .await;

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.swaps_created, 2);
        assert_eq!(snapshot.completions, 1);
        assert_eq!(snapshot.transitions_to(SwapStatus::Completed), 1);
        assert_eq!(snapshot.transitions_to(SwapStatus::SrcEscrowDeployed), 0);
        assert_eq!(snapshot.version_conflicts, 1);
        assert_eq!(snapshot.lock_takeovers, 1);
        assert_eq!(snapshot.locks_acquired, 1);

        let create = aggregator
            .rollups()
            .into_iter()
            .find(|r| r.operation == "create_swap")
            .unwrap();
        assert_eq!(create.count, 2);
        assert_eq!(create.mean_duration_ms(), 4);

        assert_eq!(sink.events().len(), 5);
        aggregator.flush_rollups().await;
        assert_eq!(sink.rollups().len(), aggregator.rollups().len());
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_stop_counting() {
        let aggregator = MetricsAggregator::new(Some(Arc::new(FailingSink)));
        aggregator.ingest(&ok(Operation::CreateSwap)).await;
        aggregator.flush_rollups().await;
        assert_eq!(aggregator.snapshot().swaps_created, 1);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let config = MetricsConfig {
            enabled: true,
            channel_capacity: 2,
            ..MetricsConfig::default()
        };
        let (tx, _rx) = mpsc::channel(config.channel_capacity);
        let recorder = MetricsRecorder {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };

        for _ in 0..5 {
            recorder.record(ok(Operation::AcquireLock));
        }
        assert_eq!(recorder.dropped(), 3);
    }

    #[tokio::test]
    async fn test_pipeline_end_to_end() {
        let sink = Arc::new(MemorySink::new());
        let (recorder, aggregator, handle) =
            MetricsAggregator::spawn(&MetricsConfig::default(), Some(sink.clone()));

        recorder.record(ok(Operation::CreateSwap));
        recorder.record(ok(Operation::LockContended));
        drop(recorder);
        handle.unwrap().await.unwrap();

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.swaps_created, 1);
        assert_eq!(snapshot.lock_contention, 1);
        assert!(!sink.rollups().is_empty());
    }

    #[tokio::test]
    async fn test_old_rollups_are_pruned() {
        let sink = Arc::new(MemorySink::new());
        let aggregator = MetricsAggregator::with_retention(Some(sink.clone()), 7);

        let mut stale = ok(Operation::CreateSwap);
        stale.timestamp = now() - chrono::Duration::days(30);
        aggregator.ingest(&stale).await;
        aggregator.ingest(&ok(Operation::CreateSwap)).await;
        assert_eq!(aggregator.rollups().len(), 2);

        aggregator.flush_rollups().await;
        assert_eq!(sink.rollups().len(), 2);
        let kept = aggregator.rollups();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].day, now().date_naive());
        // Counters are not windowed.
        assert_eq!(aggregator.snapshot().swaps_created, 2);

        let today = now().date_naive();
        aggregator.ingest(&stale).await;
        assert_eq!(aggregator.prune_rollups(today + Days::new(6)), 1);
        assert_eq!(aggregator.prune_rollups(today + Days::new(7)), 1);
        assert!(aggregator.rollups().is_empty());
    }

    #[tokio::test]
    async fn test_steps_are_counted_by_error_code() {
        let aggregator = MetricsAggregator::new(None);
        let conflict = BridgeError::VersionConflict {
            swap_id: SwapId::new(B256::ZERO),
            expected: 1,
            actual: 2,
        }
        .in_transition(SwapId::new(B256::ZERO), SwapStatus::SrcEscrowDeployed);

        aggregator
            .ingest(&ok(Operation::Step(SwapStatus::SrcEscrowDeployed)))
            .await;
        aggregator
            .ingest(&OperationEvent::failure(
                Operation::Step(SwapStatus::SrcEscrowDeployed),
                Duration::from_millis(2),
                &conflict,
            ))
            .await;
        aggregator
            .ingest(&OperationEvent::failure(
                Operation::Step(SwapStatus::DstEscrowDeployed),
                Duration::from_millis(2),
                &BridgeError::LockUnavailable("swap:x".into()),
            ))
            .await;

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.steps, 3);
        assert_eq!(snapshot.failed_steps, 2);
        assert_eq!(snapshot.step_errors.get("VERSION_CONFLICT"), Some(&1));
        assert_eq!(snapshot.step_errors.get("LOCK_UNAVAILABLE"), Some(&1));
        assert_eq!(snapshot.version_conflicts, 0);
        assert_eq!(snapshot.operation_errors, 0);

        let output = snapshot.to_prometheus();
        assert!(output.contains("bridgemenot_steps_total 3"));
        assert!(output.contains("bridgemenot_step_errors_total{code=\"LOCK_UNAVAILABLE\"} 1"));
        assert!(aggregator
            .rollups()
            .iter()
            .any(|r| r.operation == "step_src_escrow_deployed" && r.count == 2));
    }

    #[test]
    fn test_disabled_recorder_is_silent() {
        let recorder = MetricsRecorder::disabled();
        recorder.record(ok(Operation::CreateSwap));
        assert_eq!(recorder.dropped(), 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.apply(&ok(Operation::CreateSwap));
        metrics.apply(&ok(Operation::Transition(SwapStatus::Cancelled)));

        let output = metrics.snapshot().to_prometheus();
        assert!(output.contains("bridgemenot_swaps_created_total 1"));
        assert!(output.contains("bridgemenot_transitions_total{status=\"cancelled\"} 1"));
        assert!(output.contains("bridgemenot_swaps_cancelled_total 1"));
    }
}

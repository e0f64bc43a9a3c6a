//! Performance samples, threshold alerts and periodic reports.
//!
//! ```text
//! record(op, ms, ok) ──► ring buffer (max_samples)
//!                           │
//!                           ├─► slow?          warning / error alert
//!                           ├─► success rate?  error alert (last N samples)
//!                           └─► sample listeners
//!
//! raise_critical(...) ─────► critical alert (data-loss paths)
//!
//! every report_interval_ms ─► generate_report ─► report listeners
//! ```

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::listeners::{Listeners, SubscriptionId};
use crate::runtime::{Clock, NetworkStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Save,
    Load,
    Compress,
    Sync,
    ConflictResolve,
    Batch,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Save => "save",
            Operation::Load => "load",
            Operation::Compress => "compress",
            Operation::Sync => "sync",
            Operation::ConflictResolve => "conflict_resolve",
            Operation::Batch => "batch",
        }
    }
}

/// Latency ceilings (ms) and the success-rate floor (percent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub save_ms: f64,
    pub load_ms: f64,
    pub compress_ms: f64,
    pub sync_ms: f64,
    pub success_rate: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            save_ms: 300.0,
            load_ms: 1000.0,
            compress_ms: 500.0,
            sync_ms: 2000.0,
            success_rate: 99.5,
        }
    }
}

impl Thresholds {
    pub fn latency_for(&self, operation: Operation) -> Option<f64> {
        match operation {
            Operation::Save => Some(self.save_ms),
            Operation::Load => Some(self.load_ms),
            Operation::Compress => Some(self.compress_ms),
            Operation::Sync => Some(self.sync_ms),
            Operation::ConflictResolve | Operation::Batch => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Ring buffer capacity (default: 1000)
    pub max_samples: usize,
    /// Alert history capacity (default: 100)
    pub max_alerts: usize,
    /// Samples per operation considered for success rate (default: 20)
    pub window_size: usize,
    /// Minimum samples before the success rate is judged (default: 10)
    pub min_window_samples: usize,
    /// Slow operations at or above `threshold * factor` escalate to `error`
    pub slow_error_factor: f64,
    /// Periodic report interval (default: 60s)
    pub report_interval_ms: u64,
    /// Start the report loop with the engine
    pub auto_report: bool,
    pub thresholds: Thresholds,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_samples: 1000,
            max_alerts: 100,
            window_size: 20,
            min_window_samples: 10,
            slow_error_factor: 3.0,
            report_interval_ms: 60_000,
            auto_report: false,
            thresholds: Thresholds::default(),
        }
    }
}

impl MetricsConfig {
    pub fn for_testing() -> Self {
        Self {
            max_samples: 200,
            max_alerts: 50,
            report_interval_ms: 1000,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleMetadata {
    pub data_size: Option<usize>,
    pub compression_ratio: Option<f64>,
    pub retry_count: Option<u32>,
    pub network: Option<NetworkStatus>,
    pub conflict_type: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub id: u64,
    pub operation: Operation,
    pub duration_ms: f64,
    pub success: bool,
    pub metadata: SampleMetadata,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub timestamp_ms: u64,
    pub severity: Severity,
    pub operation: Operation,
    pub message: String,
    pub threshold: f64,
    pub actual: f64,
    pub suggestion: Option<String>,
}

/// Sliding-window view of one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStats {
    pub operation: Operation,
    pub count: usize,
    pub average_ms: f64,
    /// Percent, 100.0 when there are no samples
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationBreakdown {
    pub count: usize,
    pub average_ms: f64,
    pub success_rate: f64,
    pub slowest: Option<PerformanceSample>,
    pub fastest: Option<PerformanceSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSummary {
    pub total_operations: usize,
    pub average_ms: f64,
    pub success_rate: f64,
    pub alert_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub generated_at_ms: u64,
    pub window_ms: u64,
    pub summary: ReportSummary,
    pub breakdown: BTreeMap<Operation, OperationBreakdown>,
    pub alerts: Vec<Alert>,
    pub recommendations: Vec<String>,
}

#[derive(Default)]
struct RecorderState {
    samples: VecDeque<PerformanceSample>,
    alerts: VecDeque<Alert>,
    next_sample_id: u64,
    next_alert_id: u64,
}

impl RecorderState {
    fn push_alert(&mut self, mut alert: Alert, cap: usize) -> Alert {
        self.next_alert_id += 1;
        alert.id = self.next_alert_id;
        self.alerts.push_back(alert.clone());
        while self.alerts.len() > cap {
            self.alerts.pop_front();
        }
        alert
    }
}

pub struct MetricRecorder {
    config: MetricsConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<RecorderState>,
    sample_listeners: Listeners<PerformanceSample>,
    alert_listeners: Listeners<Alert>,
    report_listeners: Listeners<PerformanceReport>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl MetricRecorder {
    pub fn new(config: MetricsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(RecorderState::default()),
            sample_listeners: Listeners::new(),
            alert_listeners: Listeners::new(),
            report_listeners: Listeners::new(),
            reporter: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Append a sample and raise any threshold alerts it triggers.
    pub fn record(
        &self,
        operation: Operation,
        duration_ms: f64,
        success: bool,
        metadata: SampleMetadata,
    ) -> PerformanceSample {
        let now = self.clock.now_ms();
        let mut raised = Vec::new();

        let sample = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.next_sample_id += 1;
            let sample = PerformanceSample {
                id: state.next_sample_id,
                operation,
                duration_ms,
                success,
                metadata,
                timestamp_ms: now,
            };
            state.samples.push_back(sample.clone());
            while state.samples.len() > self.config.max_samples {
                state.samples.pop_front();
            }

            if let Some(alert) = self.check_latency(&sample) {
                raised.push(state.push_alert(alert, self.config.max_alerts));
            }
            if !success {
                let low_rate = self.check_success_rate(&state.samples, operation, now);
                if let Some(alert) = low_rate {
                    raised.push(state.push_alert(alert, self.config.max_alerts));
                }
            }
            sample
        };

        self.sample_listeners.emit(&sample);
        for alert in &raised {
            log_alert(alert);
            self.alert_listeners.emit(alert);
        }
        sample
    }

    /// Raise a critical alert (data loss, exhausted retries).
    pub fn raise_critical(
        &self,
        operation: Operation,
        message: impl Into<String>,
        actual: f64,
        suggestion: Option<String>,
    ) -> Alert {
        let alert = Alert {
            id: 0,
            timestamp_ms: self.clock.now_ms(),
            severity: Severity::Critical,
            operation,
            message: message.into(),
            threshold: 0.0,
            actual,
            suggestion,
        };
        let alert = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_alert(alert, self.config.max_alerts);
        log_alert(&alert);
        self.alert_listeners.emit(&alert);
        alert
    }

    fn check_latency(&self, sample: &PerformanceSample) -> Option<Alert> {
        let threshold = self.config.thresholds.latency_for(sample.operation)?;
        if sample.duration_ms <= threshold {
            return None;
        }
        let severity = if sample.duration_ms >= threshold * self.config.slow_error_factor {
            Severity::Error
        } else {
            Severity::Warning
        };
        Some(Alert {
            id: 0,
            timestamp_ms: sample.timestamp_ms,
            severity,
            operation: sample.operation,
            message: format!(
                "{} took {:.0}ms (threshold {:.0}ms)",
                sample.operation.as_str(),
                sample.duration_ms,
                threshold
            ),
            threshold,
            actual: sample.duration_ms,
            suggestion: Some(slow_suggestion(sample.operation, sample.duration_ms / threshold)),
        })
    }

    fn check_success_rate(
        &self,
        samples: &VecDeque<PerformanceSample>,
        operation: Operation,
        now: u64,
    ) -> Option<Alert> {
        let window: Vec<&PerformanceSample> = samples
            .iter()
            .rev()
            .filter(|s| s.operation == operation)
            .take(self.config.window_size)
            .collect();
        if window.len() < self.config.min_window_samples {
            return None;
        }
        let rate = success_percent(window.iter().copied());
        let floor = self.config.thresholds.success_rate;
        if rate >= floor {
            return None;
        }
        Some(Alert {
            id: 0,
            timestamp_ms: now,
            severity: Severity::Error,
            operation,
            message: format!(
                "{} success rate {:.1}% over the last {} operations (floor {:.1}%)",
                operation.as_str(),
                rate,
                window.len(),
                floor
            ),
            threshold: floor,
            actual: rate,
            suggestion: Some(failure_suggestion(operation).to_string()),
        })
    }

    /// Average latency and success rate over the last `window_size` samples.
    pub fn operation_stats(&self, operation: Operation) -> OperationStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let window: Vec<&PerformanceSample> = state
            .samples
            .iter()
            .rev()
            .filter(|s| s.operation == operation)
            .take(self.config.window_size)
            .collect();
        OperationStats {
            operation,
            count: window.len(),
            average_ms: average_ms(window.iter().copied()),
            success_rate: success_percent(window.iter().copied()),
        }
    }

    /// Newest first.
    pub fn recent_samples(&self, n: usize) -> Vec<PerformanceSample> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.samples.iter().rev().take(n).cloned().collect()
    }

    /// Newest first.
    pub fn recent_alerts(&self, n: usize) -> Vec<Alert> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.alerts.iter().rev().take(n).cloned().collect()
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).samples.len()
    }

    /// Aggregate everything recorded in the last `window_ms`.
    pub fn generate_report(&self, window_ms: u64) -> PerformanceReport {
        let now = self.clock.now_ms();
        let since = now.saturating_sub(window_ms);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let samples: Vec<&PerformanceSample> = state
            .samples
            .iter()
            .filter(|s| s.timestamp_ms >= since)
            .collect();
        let alerts: Vec<Alert> = state
            .alerts
            .iter()
            .filter(|a| a.timestamp_ms >= since)
            .cloned()
            .collect();

        let mut grouped: BTreeMap<Operation, Vec<&PerformanceSample>> = BTreeMap::new();
        for sample in &samples {
            grouped.entry(sample.operation).or_default().push(sample);
        }
        let breakdown: BTreeMap<Operation, OperationBreakdown> = grouped
            .into_iter()
            .map(|(op, group)| {
                let breakdown = OperationBreakdown {
                    count: group.len(),
                    average_ms: average_ms(group.iter().copied()),
                    success_rate: success_percent(group.iter().copied()),
                    slowest: group
                        .iter()
                        .max_by(|a, b| a.duration_ms.total_cmp(&b.duration_ms))
                        .map(|s| (*s).clone()),
                    fastest: group
                        .iter()
                        .min_by(|a, b| a.duration_ms.total_cmp(&b.duration_ms))
                        .map(|s| (*s).clone()),
                };
                (op, breakdown)
            })
            .collect();

        let summary = ReportSummary {
            total_operations: samples.len(),
            average_ms: average_ms(samples.iter().copied()),
            success_rate: success_percent(samples.iter().copied()),
            alert_count: alerts.len(),
        };
        let recommendations = self.recommendations(&summary, &breakdown, &samples);

        PerformanceReport {
            generated_at_ms: now,
            window_ms,
            summary,
            breakdown,
            alerts,
            recommendations,
        }
    }

    fn recommendations(
        &self,
        summary: &ReportSummary,
        breakdown: &BTreeMap<Operation, OperationBreakdown>,
        samples: &[&PerformanceSample],
    ) -> Vec<String> {
        let mut out = Vec::new();
        if summary.total_operations == 0 {
            return out;
        }
        if summary.average_ms > 1000.0 {
            out.push(format!(
                "Average latency is {:.0}ms; enable batching or lengthen the debounce interval",
                summary.average_ms
            ));
        }
        if summary.success_rate < 95.0 {
            out.push(format!(
                "Success rate is {:.1}%; check connectivity and server health",
                summary.success_rate
            ));
        }
        for (op, stats) in breakdown {
            if let Some(limit) = self.config.thresholds.latency_for(*op) {
                if stats.average_ms > limit {
                    out.push(format!(
                        "{} averages {:.0}ms against a {:.0}ms budget",
                        op.as_str(),
                        stats.average_ms,
                        limit
                    ));
                }
            }
        }
        let ratios: Vec<f64> = samples
            .iter()
            .filter(|s| s.operation == Operation::Compress)
            .filter_map(|s| s.metadata.compression_ratio)
            .collect();
        if !ratios.is_empty() {
            let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
            if mean < 1.2 {
                out.push(format!(
                    "Compression ratio averages {mean:.2}; raise min_compress_bytes to skip small payloads"
                ));
            }
        }
        out
    }

    // ─── Observers ────────────────────────────────────────────────────

    pub fn subscribe_samples(
        &self,
        listener: impl Fn(&PerformanceSample) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.sample_listeners.subscribe(listener)
    }

    pub fn unsubscribe_samples(&self, id: SubscriptionId) -> bool {
        self.sample_listeners.unsubscribe(id)
    }

    pub fn subscribe_alerts(&self, listener: impl Fn(&Alert) + Send + Sync + 'static) -> SubscriptionId {
        self.alert_listeners.subscribe(listener)
    }

    pub fn unsubscribe_alerts(&self, id: SubscriptionId) -> bool {
        self.alert_listeners.unsubscribe(id)
    }

    pub fn subscribe_reports(
        &self,
        listener: impl Fn(&PerformanceReport) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.report_listeners.subscribe(listener)
    }

    pub fn unsubscribe_reports(&self, id: SubscriptionId) -> bool {
        self.report_listeners.unsubscribe(id)
    }

    // ─── Periodic reporting ───────────────────────────────────────────

    /// Publish a report every `report_interval_ms`. Idempotent.
    pub fn start_reporting(self: &Arc<Self>) {
        let mut reporter = self.reporter.lock().unwrap_or_else(|e| e.into_inner());
        if reporter.is_some() {
            return;
        }
        let interval_ms = self.config.report_interval_ms.max(1);
        let recorder = Arc::downgrade(self);
        *reporter = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(recorder) = recorder.upgrade() else {
                    break;
                };
                let report = recorder.generate_report(interval_ms);
                debug!(
                    "performance report: {} ops, {:.1}% success, {} alerts",
                    report.summary.total_operations,
                    report.summary.success_rate,
                    report.summary.alert_count
                );
                recorder.report_listeners.emit(&report);
            }
        }));
    }

    pub fn stop_reporting(&self) {
        if let Some(handle) = self
            .reporter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// Stop the report loop and drop every listener.
    pub fn close(&self) {
        self.stop_reporting();
        self.sample_listeners.clear();
        self.alert_listeners.clear();
        self.report_listeners.clear();
    }
}

fn log_alert(alert: &Alert) {
    match alert.severity {
        Severity::Warning => warn!("[{}] {}", alert.operation.as_str(), alert.message),
        Severity::Error | Severity::Critical => {
            error!("[{}] {}", alert.operation.as_str(), alert.message)
        }
    }
}

fn average_ms<'a>(samples: impl Iterator<Item = &'a PerformanceSample>) -> f64 {
    let (count, total) = samples.fold((0usize, 0.0), |(n, t), s| (n + 1, t + s.duration_ms));
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

fn success_percent<'a>(samples: impl Iterator<Item = &'a PerformanceSample>) -> f64 {
    let (count, ok) = samples.fold((0usize, 0usize), |(n, ok), s| (n + 1, ok + s.success as usize));
    if count == 0 {
        100.0
    } else {
        ok as f64 * 100.0 / count as f64
    }
}

fn slow_suggestion(operation: Operation, ratio: f64) -> String {
    let base = match operation {
        Operation::Save => "Lengthen the debounce interval or enable batching",
        Operation::Load => "Cache recently loaded content",
        Operation::Compress => "Raise heavy_threshold_bytes so more payloads use LZ4",
        Operation::Sync => "Reduce the batch size or check server latency",
        Operation::ConflictResolve => "Resolve pending conflicts",
        Operation::Batch => "Lower max_batch_size",
    };
    if ratio > 3.0 {
        format!("{base}; latency is {ratio:.1}x the budget, investigate the server")
    } else if ratio > 2.0 {
        format!("{base}; latency is {ratio:.1}x the budget")
    } else {
        base.to_string()
    }
}

fn failure_suggestion(operation: Operation) -> &'static str {
    match operation {
        Operation::Save | Operation::Sync | Operation::Batch => {
            "Check network reachability; failed saves are queued and retried"
        }
        Operation::Compress => "Inspect payloads that fail to compress",
        Operation::Load => "Verify stored content integrity",
        Operation::ConflictResolve => "Review pending conflicts manually",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ManualClock;

    fn recorder() -> (Arc<MetricRecorder>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let recorder = Arc::new(MetricRecorder::new(MetricsConfig::for_testing(), clock.clone()));
        (recorder, clock)
    }

    #[test]
    fn test_fast_sample_raises_nothing() {
        let (recorder, _) = recorder();
        recorder.record(Operation::Save, 50.0, true, SampleMetadata::default());
        assert!(recorder.recent_alerts(10).is_empty());
        assert_eq!(recorder.sample_count(), 1);
    }

    #[test]
    fn test_slow_sample_severity() {
        let (recorder, _) = recorder();
        recorder.record(Operation::Save, 400.0, true, SampleMetadata::default());
        recorder.record(Operation::Save, 950.0, true, SampleMetadata::default());

        let alerts = recorder.recent_alerts(10);
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].severity, Severity::Warning);
        assert_eq!(alerts[0].severity, Severity::Error);
        assert_eq!(alerts[0].threshold, 300.0);
        assert!(alerts[0].suggestion.as_deref().unwrap().contains("investigate"));
    }

    #[test]
    fn test_success_rate_needs_minimum_window() {
        let (recorder, _) = recorder();
        for _ in 0..5 {
            recorder.record(Operation::Sync, 10.0, false, SampleMetadata::default());
        }
        assert!(recorder.recent_alerts(10).is_empty());

        for _ in 0..5 {
            recorder.record(Operation::Sync, 10.0, true, SampleMetadata::default());
        }
        recorder.record(Operation::Sync, 10.0, false, SampleMetadata::default());
        let alerts = recorder.recent_alerts(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Error);
        assert!(alerts[0].actual < 99.5);
    }

    #[test]
    fn test_ring_buffer_capped() {
        let (recorder, _) = recorder();
        for _ in 0..250 {
            recorder.record(Operation::Compress, 1.0, true, SampleMetadata::default());
        }
        assert_eq!(recorder.sample_count(), 200);
        assert_eq!(recorder.recent_samples(1)[0].id, 250);
    }

    #[test]
    fn test_operation_stats_window() {
        let (recorder, _) = recorder();
        for i in 0..30 {
            recorder.record(Operation::Load, i as f64, true, SampleMetadata::default());
        }
        let stats = recorder.operation_stats(Operation::Load);
        assert_eq!(stats.count, 20);
        // Last 20 samples: durations 10..=29
        assert!((stats.average_ms - 19.5).abs() < 1e-9);
        assert_eq!(stats.success_rate, 100.0);

        let empty = recorder.operation_stats(Operation::Batch);
        assert_eq!(empty.count, 0);
        assert_eq!(empty.success_rate, 100.0);
    }

    #[test]
    fn test_critical_alert_emitted() {
        let (recorder, _) = recorder();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        recorder.subscribe_alerts(move |a| s.lock().unwrap().push(a.severity));

        let alert = recorder.raise_critical(Operation::Batch, "lost", 1.0, None);
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(*seen.lock().unwrap(), vec![Severity::Critical]);
    }

    #[test]
    fn test_report_breakdown_and_recommendations() {
        let (recorder, clock) = recorder();
        recorder.record(Operation::Save, 100.0, true, SampleMetadata::default());
        clock.advance(Duration::from_millis(10));
        recorder.record(Operation::Save, 500.0, false, SampleMetadata::default());
        recorder.record(
            Operation::Compress,
            2.0,
            true,
            SampleMetadata {
                compression_ratio: Some(1.05),
                ..SampleMetadata::default()
            },
        );

        let report = recorder.generate_report(60_000);
        assert_eq!(report.summary.total_operations, 3);
        let save = &report.breakdown[&Operation::Save];
        assert_eq!(save.count, 2);
        assert_eq!(save.success_rate, 50.0);
        assert_eq!(save.slowest.as_ref().unwrap().duration_ms, 500.0);
        assert_eq!(save.fastest.as_ref().unwrap().duration_ms, 100.0);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("Success rate")));
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("Compression ratio")));
    }

    #[test]
    fn test_report_window_excludes_old_samples() {
        let (recorder, clock) = recorder();
        recorder.record(Operation::Save, 10.0, true, SampleMetadata::default());
        clock.advance(Duration::from_secs(120));
        recorder.record(Operation::Save, 20.0, true, SampleMetadata::default());

        let report = recorder.generate_report(60_000);
        assert_eq!(report.summary.total_operations, 1);
        assert_eq!(report.summary.average_ms, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_reports() {
        let (recorder, _) = recorder();
        let reports = Arc::new(Mutex::new(0));
        let r = Arc::clone(&reports);
        recorder.subscribe_reports(move |_| *r.lock().unwrap() += 1);

        recorder.start_reporting();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        recorder.close();
        let seen = *reports.lock().unwrap();
        assert_eq!(seen, 3);
    }
}

//! Prometheus-compatible replication metrics.
//!
//! Per-partner counters plus cycle-duration histograms split by outcome.
//! Benign failures (shutdown, lost connection, timeout) are not recorded in
//! the failure histogram.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::conflict::ConflictReport;
use crate::error::ReplError;

/// A single Prometheus metric (counter or gauge).
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name (e.g., "dirsync_repl_entries_applied_total").
    pub name: String,
    /// Help text for the metric.
    pub help: String,
    /// Metric type ("counter" or "gauge").
    pub metric_type: String,
    /// Labels as key=value pairs.
    pub labels: Vec<(String, String)>,
    /// Current value.
    pub value: f64,
}

impl Metric {
    /// Create a new counter metric.
    pub fn counter(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "counter".to_string(),
            labels,
            value,
        }
    }

    /// Create a new gauge metric.
    pub fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "gauge".to_string(),
            labels,
            value,
        }
    }

    /// Format this metric as Prometheus text exposition format.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.metric_type));
        output.push_str(&format!(
            "{}{} {}\n",
            self.name,
            label_block(&self.labels),
            format_value(self.value)
        ));
        output
    }
}

fn label_block(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let inner = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{}}}", inner)
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Bucket upper bounds of the cycle-duration histogram, in milliseconds.
pub const CYCLE_BUCKETS_MS: &[u64] = &[10, 100, 1_000, 10_000, 60_000, 300_000];

/// Cumulative-bucket duration histogram.
#[derive(Debug)]
pub struct DurationHistogram {
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl DurationHistogram {
    /// Creates an empty histogram over [`CYCLE_BUCKETS_MS`].
    pub fn new() -> Self {
        Self {
            buckets: (0..=CYCLE_BUCKETS_MS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records one observation.
    pub fn observe(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let idx = CYCLE_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(CYCLE_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of observations in milliseconds.
    pub fn sum_ms(&self) -> u64 {
        self.sum_ms.load(Ordering::Relaxed)
    }

    fn render(&self, name: &str, help: &str, labels: &[(String, String)]) -> String {
        let mut output = format!("# HELP {} {}\n# TYPE {} histogram\n", name, help, name);
        let mut cumulative = 0;
        for (i, bound) in CYCLE_BUCKETS_MS.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            let mut with_le = labels.to_vec();
            with_le.push(("le".to_string(), bound.to_string()));
            output.push_str(&format!("{}_bucket{} {}\n", name, label_block(&with_le), cumulative));
        }
        let mut with_le = labels.to_vec();
        with_le.push(("le".to_string(), "+Inf".to_string()));
        output.push_str(&format!(
            "{}_bucket{} {}\n",
            name,
            label_block(&with_le),
            self.count()
        ));
        output.push_str(&format!("{}_sum{} {}\n", name, label_block(labels), self.sum_ms()));
        output.push_str(&format!("{}_count{} {}\n", name, label_block(labels), self.count()));
        output
    }
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one partner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartnerStats {
    /// Changes applied from this partner
    pub entries_applied: u64,
    /// Attributes where the local value won
    pub conflicts: u64,
    /// Conflicts whose values already matched
    pub benign_conflicts: u64,
    /// Failed consume attempts
    pub failures: u64,
    /// Unix seconds of the last successful consume, 0 if never
    pub last_success_unix: u64,
}

/// Metrics registry of the replication driver.
#[derive(Debug, Default)]
pub struct ReplicationMetrics {
    partners: DashMap<String, PartnerStats>,
    cycles_ok: DurationHistogram,
    cycles_failed: DurationHistogram,
}

impl ReplicationMetrics {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` applied changes for `partner`.
    pub fn record_applied(&self, partner: &str, count: u64) {
        self.partners.entry(partner.to_string()).or_default().entries_applied += count;
    }

    /// Aggregates the conflicts of one resolution pass.
    pub fn record_conflicts(&self, partner: &str, report: &ConflictReport) {
        let conflicts = report.conflicts() as u64;
        if conflicts == 0 {
            return;
        }
        let mut stats = self.partners.entry(partner.to_string()).or_default();
        stats.conflicts += conflicts;
        stats.benign_conflicts += report.benign_conflicts() as u64;
    }

    /// Records a completed consume of `partner`.
    pub fn record_success(&self, partner: &str) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.partners.entry(partner.to_string()).or_default().last_success_unix = now;
    }

    /// Records a failed consume of `partner`.
    pub fn record_failure(&self, partner: &str) {
        self.partners.entry(partner.to_string()).or_default().failures += 1;
    }

    /// Records one cycle; benign errors are left out of both buckets.
    pub fn record_cycle(&self, duration: Duration, error: Option<&ReplError>) {
        match error {
            None => self.cycles_ok.observe(duration),
            Some(e) if e.is_benign() => {}
            Some(_) => self.cycles_failed.observe(duration),
        }
    }

    /// Snapshot of one partner's counters.
    pub fn partner(&self, partner: &str) -> Option<PartnerStats> {
        self.partners.get(partner).map(|s| s.clone())
    }

    /// Successful cycle histogram.
    pub fn cycles_ok(&self) -> &DurationHistogram {
        &self.cycles_ok
    }

    /// Failed cycle histogram.
    pub fn cycles_failed(&self) -> &DurationHistogram {
        &self.cycles_failed
    }

    /// Per-partner counters as Prometheus metrics, sorted by partner.
    pub fn to_metrics(&self) -> Vec<Metric> {
        let mut partners: Vec<(String, PartnerStats)> = self
            .partners
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        partners.sort_by(|a, b| a.0.cmp(&b.0));

        let mut metrics = Vec::new();
        for (partner, stats) in partners {
            let labels = vec![("partner".to_string(), partner)];
            metrics.push(Metric::counter(
                "dirsync_repl_entries_applied_total",
                "Changes applied from the partner",
                labels.clone(),
                stats.entries_applied as f64,
            ));
            metrics.push(Metric::counter(
                "dirsync_repl_conflicts_total",
                "Attributes where the local value won",
                labels.clone(),
                stats.conflicts as f64,
            ));
            metrics.push(Metric::counter(
                "dirsync_repl_benign_conflicts_total",
                "Conflicts whose values already matched",
                labels.clone(),
                stats.benign_conflicts as f64,
            ));
            metrics.push(Metric::counter(
                "dirsync_repl_failures_total",
                "Failed consume attempts",
                labels.clone(),
                stats.failures as f64,
            ));
            metrics.push(Metric::gauge(
                "dirsync_repl_last_success_timestamp_seconds",
                "Unix time of the last successful consume",
                labels,
                stats.last_success_unix as f64,
            ));
        }
        metrics
    }

    /// Full Prometheus text exposition.
    pub fn format_prometheus(&self) -> String {
        let mut output: String = self.to_metrics().iter().map(|m| m.format()).collect();
        output.push_str(&self.cycles_ok.render(
            "dirsync_repl_cycle_duration_ms",
            "Replication cycle duration",
            &[("outcome".to_string(), "success".to_string())],
        ));
        output.push_str(&self.cycles_failed.render(
            "dirsync_repl_cycle_duration_ms",
            "Replication cycle duration",
            &[("outcome".to_string(), "failure".to_string())],
        ));
        output
    }
}

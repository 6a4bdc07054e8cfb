//! Passive metrics sink observed by every runtime component.
//!
//! Counters end in `_total`, duration histograms in `_seconds`, and every
//! name shares the `toolgate_` namespace. Recording is best-effort and
//! failure-silent: the sink never panics and never propagates an error into
//! the calling code path. Series cardinality is bounded per family; once the
//! bound is hit, new label combinations are counted as dropped instead of
//! allocated.

use std::collections::HashMap;

use parking_lot::RwLock;

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

pub const INVOCATIONS_TOTAL: &str = "toolgate_invocations_total";
pub const INVOCATION_SECONDS: &str = "toolgate_invocation_duration_seconds";
pub const TIMEOUTS_TOTAL: &str = "toolgate_timeouts_total";
pub const VALIDATION_FAILURES_TOTAL: &str = "toolgate_validation_failures_total";
pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "toolgate_rate_limit_rejections_total";
pub const PERMISSION_DENIALS_TOTAL: &str = "toolgate_permission_denials_total";
pub const TASKS_CREATED_TOTAL: &str = "toolgate_tasks_created_total";
pub const TASKS_FINISHED_TOTAL: &str = "toolgate_tasks_finished_total";
pub const TASKS_CANCELLED_TOTAL: &str = "toolgate_tasks_cancelled_total";
pub const TASK_SECONDS: &str = "toolgate_task_duration_seconds";
pub const QUEUE_DEPTH: &str = "toolgate_queue_depth";

/// Maximum distinct label combinations kept per metric family.
const MAX_SERIES_PER_FAMILY: usize = 128;

/// Histogram bucket upper bounds, in seconds.
const BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Histogram {
    /// Per-bucket observation counts (non-cumulative; summed at render time).
    bucket_counts: Vec<u64>,
    /// Observations above the last bucket bound.
    overflow: u64,
    sum: f64,
    count: u64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            bucket_counts: vec![0; BUCKETS.len()],
            overflow: 0,
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        let value = if value.is_finite() && value >= 0.0 {
            value
        } else {
            0.0
        };
        match BUCKETS.iter().position(|bound| value <= *bound) {
            Some(idx) => self.bucket_counts[idx] += 1,
            None => self.overflow = self.overflow.saturating_add(1),
        }
        self.sum += value;
        self.count = self.count.saturating_add(1);
    }
}

// ---------------------------------------------------------------------------
// MetricsSink
// ---------------------------------------------------------------------------

type Family<T> = HashMap<String, T>;

/// Thread-safe registry of counters, gauges and histograms.
///
/// Components hold an `Arc<MetricsSink>` and record transitions as they
/// happen; the HTTP layer renders a snapshot on demand.
#[derive(Debug, Default)]
pub struct MetricsSink {
    counters: RwLock<HashMap<&'static str, Family<u64>>>,
    gauges: RwLock<HashMap<&'static str, Family<i64>>>,
    histograms: RwLock<HashMap<&'static str, Family<Histogram>>>,
    /// Series discarded after a family hit its cardinality bound.
    dropped_series: RwLock<u64>,
}

impl MetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn incr(&self, name: &'static str, labels: &[(&str, &str)]) {
        self.incr_by(name, labels, 1);
    }

    /// Increment a counter by `delta`, saturating.
    pub fn incr_by(&self, name: &'static str, labels: &[(&str, &str)], delta: u64) {
        let key = label_key(labels);
        let mut counters = self.counters.write();
        let family = counters.entry(name).or_default();
        if family.len() >= MAX_SERIES_PER_FAMILY && !family.contains_key(&key) {
            *self.dropped_series.write() += 1;
            return;
        }
        let value = family.entry(key).or_insert(0);
        *value = value.saturating_add(delta);
    }

    /// Add `delta` (possibly negative) to a gauge.
    pub fn gauge_add(&self, name: &'static str, labels: &[(&str, &str)], delta: i64) {
        let key = label_key(labels);
        let mut gauges = self.gauges.write();
        let family = gauges.entry(name).or_default();
        if family.len() >= MAX_SERIES_PER_FAMILY && !family.contains_key(&key) {
            *self.dropped_series.write() += 1;
            return;
        }
        let value = family.entry(key).or_insert(0);
        *value = value.saturating_add(delta);
    }

    /// Record a duration observation, in seconds.
    pub fn observe_seconds(&self, name: &'static str, labels: &[(&str, &str)], seconds: f64) {
        let key = label_key(labels);
        let mut histograms = self.histograms.write();
        let family = histograms.entry(name).or_default();
        if family.len() >= MAX_SERIES_PER_FAMILY && !family.contains_key(&key) {
            *self.dropped_series.write() += 1;
            return;
        }
        family.entry(key).or_insert_with(Histogram::new).observe(seconds);
    }

    // ---- Snapshot accessors (used by tests and the render path) ----

    /// Current value of a counter series, zero if never recorded.
    pub fn counter_value(&self, name: &'static str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(name)
            .and_then(|family| family.get(&label_key(labels)))
            .copied()
            .unwrap_or(0)
    }

    /// Current value of a gauge series, zero if never recorded.
    pub fn gauge_value(&self, name: &'static str, labels: &[(&str, &str)]) -> i64 {
        self.gauges
            .read()
            .get(name)
            .and_then(|family| family.get(&label_key(labels)))
            .copied()
            .unwrap_or(0)
    }

    /// Observation count of a histogram series, zero if never recorded.
    pub fn histogram_count(&self, name: &'static str, labels: &[(&str, &str)]) -> u64 {
        self.histograms
            .read()
            .get(name)
            .and_then(|family| family.get(&label_key(labels)))
            .map(|h| h.count)
            .unwrap_or(0)
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let counters = self.counters.read();
        let mut names: Vec<_> = counters.keys().copied().collect();
        names.sort_unstable();
        for name in names {
            out.push_str(&format!("# TYPE {} counter\n", name));
            let mut series: Vec<_> = counters[name].iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            for (labels, value) in series {
                out.push_str(&render_line(name, labels, &value.to_string()));
            }
        }
        drop(counters);

        let gauges = self.gauges.read();
        let mut names: Vec<_> = gauges.keys().copied().collect();
        names.sort_unstable();
        for name in names {
            out.push_str(&format!("# TYPE {} gauge\n", name));
            let mut series: Vec<_> = gauges[name].iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            for (labels, value) in series {
                out.push_str(&render_line(name, labels, &value.to_string()));
            }
        }
        drop(gauges);

        let histograms = self.histograms.read();
        let mut names: Vec<_> = histograms.keys().copied().collect();
        names.sort_unstable();
        for name in names {
            out.push_str(&format!("# TYPE {} histogram\n", name));
            let mut series: Vec<_> = histograms[name].iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            for (labels, hist) in series {
                let mut cumulative = 0u64;
                for (idx, bound) in BUCKETS.iter().enumerate() {
                    cumulative += hist.bucket_counts[idx];
                    let le = format!("le=\"{}\"", bound);
                    let full = join_labels(labels, &le);
                    out.push_str(&render_line(
                        &format!("{}_bucket", name),
                        &full,
                        &cumulative.to_string(),
                    ));
                }
                let full = join_labels(labels, "le=\"+Inf\"");
                out.push_str(&render_line(
                    &format!("{}_bucket", name),
                    &full,
                    &(cumulative + hist.overflow).to_string(),
                ));
                out.push_str(&render_line(&format!("{}_sum", name), labels, &format!("{}", hist.sum)));
                out.push_str(&render_line(&format!("{}_count", name), labels, &hist.count.to_string()));
            }
        }

        out
    }
}

/// Flatten a label slice into a stable series key, e.g. `tool="x",outcome="ok"`.
fn label_key(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, sanitize_label_value(v)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Strip characters that would corrupt the exposition format.
fn sanitize_label_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '"' || c == '\\' || c == '\n' { '_' } else { c })
        .collect()
}

fn join_labels(existing: &str, extra: &str) -> String {
    if existing.is_empty() {
        extra.to_string()
    } else {
        format!("{},{}", existing, extra)
    }
}

fn render_line(name: &str, labels: &str, value: &str) -> String {
    if labels.is_empty() {
        format!("{} {}\n", name, value)
    } else {
        format!("{}{{{}}} {}\n", name, labels, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let sink = MetricsSink::new();
        sink.incr(INVOCATIONS_TOTAL, &[("tool", "a"), ("outcome", "ok")]);
        sink.incr(INVOCATIONS_TOTAL, &[("tool", "a"), ("outcome", "ok")]);
        sink.incr(INVOCATIONS_TOTAL, &[("tool", "b"), ("outcome", "ok")]);
        assert_eq!(
            sink.counter_value(INVOCATIONS_TOTAL, &[("tool", "a"), ("outcome", "ok")]),
            2
        );
        assert_eq!(
            sink.counter_value(INVOCATIONS_TOTAL, &[("tool", "b"), ("outcome", "ok")]),
            1
        );
    }

    #[test]
    fn test_gauge_add_and_subtract() {
        let sink = MetricsSink::new();
        sink.gauge_add(QUEUE_DEPTH, &[("priority", "normal")], 3);
        sink.gauge_add(QUEUE_DEPTH, &[("priority", "normal")], -1);
        assert_eq!(sink.gauge_value(QUEUE_DEPTH, &[("priority", "normal")]), 2);
    }

    #[test]
    fn test_histogram_observe() {
        let sink = MetricsSink::new();
        sink.observe_seconds(TASK_SECONDS, &[("tool", "a")], 0.02);
        sink.observe_seconds(TASK_SECONDS, &[("tool", "a")], 120.0);
        assert_eq!(sink.histogram_count(TASK_SECONDS, &[("tool", "a")]), 2);
    }

    #[test]
    fn test_naming_conventions() {
        for name in [
            INVOCATIONS_TOTAL,
            TIMEOUTS_TOTAL,
            VALIDATION_FAILURES_TOTAL,
            RATE_LIMIT_REJECTIONS_TOTAL,
            PERMISSION_DENIALS_TOTAL,
            TASKS_CREATED_TOTAL,
            TASKS_FINISHED_TOTAL,
            TASKS_CANCELLED_TOTAL,
        ] {
            assert!(name.starts_with("toolgate_"));
            assert!(name.ends_with("_total"));
        }
        for name in [INVOCATION_SECONDS, TASK_SECONDS] {
            assert!(name.starts_with("toolgate_"));
            assert!(name.ends_with("_seconds"));
        }
        assert!(QUEUE_DEPTH.starts_with("toolgate_"));
    }

    #[test]
    fn test_render_exposition_format() {
        let sink = MetricsSink::new();
        sink.incr(TASKS_CREATED_TOTAL, &[("tool", "a")]);
        sink.gauge_add(QUEUE_DEPTH, &[("priority", "high")], 1);
        sink.observe_seconds(TASK_SECONDS, &[("tool", "a")], 0.3);

        let text = sink.render();
        assert!(text.contains("# TYPE toolgate_tasks_created_total counter"));
        assert!(text.contains("toolgate_tasks_created_total{tool=\"a\"} 1"));
        assert!(text.contains("toolgate_queue_depth{priority=\"high\"} 1"));
        assert!(text.contains("toolgate_task_duration_seconds_count{tool=\"a\"} 1"));
        assert!(text.contains("le=\"+Inf\""));
    }

    #[test]
    fn test_cardinality_bound_is_silent() {
        let sink = MetricsSink::new();
        for i in 0..(MAX_SERIES_PER_FAMILY + 10) {
            let tool = format!("tool_{}", i);
            sink.incr(INVOCATIONS_TOTAL, &[("tool", &tool)]);
        }
        // Existing series keep counting, the excess is dropped without error.
        sink.incr(INVOCATIONS_TOTAL, &[("tool", "tool_0")]);
        assert_eq!(sink.counter_value(INVOCATIONS_TOTAL, &[("tool", "tool_0")]), 2);
        assert!(*sink.dropped_series.read() >= 10);
    }
}

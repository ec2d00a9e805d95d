use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::info;

/// Aggregated samples for one labeled scope.
#[derive(Clone, Debug, Default)]
pub struct ProfileEntry {
    pub label: String,
    pub count: u64,
    pub total_ns: f64,
    pub min_ns: f64,
    pub max_ns: f64,
}

/// Scoped-duration profiler keyed by label.
///
/// The driver emits scopes labeled `Frame`, `Phase:<name>`,
/// `RangeTask:<phase>:<index>` and `Reduction:<phase>` when a profiler is
/// attached; attaching one never changes driver behavior.
#[derive(Debug, Default)]
pub struct Profiler {
    entries: Mutex<HashMap<String, ProfileEntry>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a scope; the sample is recorded when the guard drops.
    pub fn scope(&self, label: impl Into<String>) -> ScopeTimer<'_> {
        ScopeTimer {
            profiler: self,
            label: label.into(),
            start: Instant::now(),
        }
    }

    pub fn record(&self, label: &str, ns: f64) {
        let mut entries = self.entries.lock().expect("profiler entries lock");
        let entry = entries.entry(label.to_string()).or_default();
        if entry.count == 0 {
            entry.label = label.to_string();
            entry.min_ns = ns;
            entry.max_ns = ns;
        } else {
            entry.min_ns = entry.min_ns.min(ns);
            entry.max_ns = entry.max_ns.max(ns);
        }
        entry.total_ns += ns;
        entry.count += 1;
    }

    /// Snapshot of all entries, sorted by label.
    pub fn summary(&self) -> Vec<ProfileEntry> {
        let entries = self.entries.lock().expect("profiler entries lock");
        let mut rows: Vec<ProfileEntry> = entries.values().cloned().collect();
        rows.sort_by(|a, b| a.label.cmp(&b.label));
        rows
    }

    /// Emit the summary table through the logger.
    pub fn log_summary(&self) {
        let rows = self.summary();
        if rows.is_empty() {
            return;
        }
        info!(
            "{:<36} {:>10} {:>12} {:>13} {:>12} {:>12}",
            "section", "count", "avg (us)", "total (ms)", "min (us)", "max (us)"
        );
        for row in rows {
            let avg_us = row.total_ns / row.count.max(1) as f64 / 1e3;
            info!(
                "{:<36} {:>10} {:>12.3} {:>13.3} {:>12.3} {:>12.3}",
                row.label,
                row.count,
                avg_us,
                row.total_ns / 1e6,
                row.min_ns / 1e3,
                row.max_ns / 1e3
            );
        }
    }
}

/// Drop guard that records the elapsed time of one scope.
pub struct ScopeTimer<'a> {
    profiler: &'a Profiler,
    label: String,
    start: Instant,
}

impl Drop for ScopeTimer<'_> {
    fn drop(&mut self) {
        let ns = self.start.elapsed().as_nanos() as f64;
        self.profiler.record(&self.label, ns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn scopes_aggregate_per_label() {
        let profiler = Profiler::new();
        for _ in 0..3 {
            let _guard = profiler.scope("step");
            std::thread::sleep(Duration::from_millis(1));
        }
        {
            let _guard = profiler.scope("other");
        }

        let rows = profiler.summary();
        assert_eq!(rows.len(), 2);
        // Sorted by label.
        assert_eq!(rows[0].label, "other");
        assert_eq!(rows[1].label, "step");
        assert_eq!(rows[1].count, 3);
        assert!(rows[1].min_ns <= rows[1].max_ns);
        assert!(rows[1].total_ns >= 3.0 * rows[1].min_ns);
    }

    #[test]
    fn min_and_max_track_extremes() {
        let profiler = Profiler::new();
        profiler.record("x", 100.0);
        profiler.record("x", 50.0);
        profiler.record("x", 300.0);
        let rows = profiler.summary();
        assert_eq!(rows[0].count, 3);
        assert_eq!(rows[0].min_ns, 50.0);
        assert_eq!(rows[0].max_ns, 300.0);
        assert_eq!(rows[0].total_ns, 450.0);
    }
}

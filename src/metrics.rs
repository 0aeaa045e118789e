//! Abstract metric sink.
//!
//! The engine reports counters and observations through a trait object so
//! the binary can plug in a real registry; the default discards everything.
//! `/metrics` renders whatever the attached sink accumulated.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait MetricSink: Send + Sync {
    fn incr(&self, name: &'static str) {
        self.add(name, 1);
    }
    fn add(&self, name: &'static str, value: u64);
    /// Record one observation of a quantity (bytes, seconds scaled by the
    /// caller); rendered as `<name>_sum` / `<name>_count`.
    fn observe(&self, name: &'static str, value: u64);
    /// Text rendering for the /metrics endpoint.
    fn render(&self) -> String {
        String::new()
    }
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl MetricSink for NoopMetrics {
    fn add(&self, _name: &'static str, _value: u64) {}
    fn observe(&self, _name: &'static str, _value: u64) {}
}

/// In-process counter registry, rendered as `name value` text lines.
#[derive(Default)]
pub struct AtomicMetrics {
    counters: DashMap<&'static str, AtomicU64>,
    observations: DashMap<&'static str, (AtomicU64, AtomicU64)>,
}

impl AtomicMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter(&self, name: &'static str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl MetricSink for AtomicMetrics {
    fn add(&self, name: &'static str, value: u64) {
        self.counters
            .entry(name)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    fn observe(&self, name: &'static str, value: u64) {
        let entry = self
            .observations
            .entry(name)
            .or_insert_with(|| (AtomicU64::new(0), AtomicU64::new(0)));
        entry.0.fetch_add(value, Ordering::Relaxed);
        entry.1.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self) -> String {
        let mut lines: Vec<String> = self
            .counters
            .iter()
            .map(|pair| format!("{} {}", pair.key(), pair.value().load(Ordering::Relaxed)))
            .collect();

        for pair in self.observations.iter() {
            lines.push(format!(
                "{}_sum {}",
                pair.key(),
                pair.value().0.load(Ordering::Relaxed)
            ));
            lines.push(format!(
                "{}_count {}",
                pair.key(),
                pair.value().1.load(Ordering::Relaxed)
            ));
        }

        lines.sort();
        let mut out = lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_render() {
        let metrics = AtomicMetrics::new();
        metrics.incr("downloads_total");
        metrics.incr("downloads_total");
        metrics.add("bytes_sent_total", 512);
        metrics.observe("chunk_bytes", 100);
        metrics.observe("chunk_bytes", 300);

        assert_eq!(metrics.counter("downloads_total"), 2);

        let text = metrics.render();
        assert!(text.contains("downloads_total 2"));
        assert!(text.contains("bytes_sent_total 512"));
        assert!(text.contains("chunk_bytes_sum 400"));
        assert!(text.contains("chunk_bytes_count 2"));
    }

    #[test]
    fn noop_renders_empty() {
        let noop = NoopMetrics;
        noop.incr("whatever");
        assert_eq!(noop.render(), "");
    }
}

//! Timing statistics for repeated runs.
//!
//! The engine appends one duration per stage and call into a
//! [`TimeStats`] map. Profiling harnesses call the same model tens of
//! times with static input, then summarize each series after discarding
//! warm-up and cool-down samples.

use crate::graph::TensorShape;
use std::collections::HashMap;
use std::fmt::Write;

/// Durations in milliseconds keyed by timer name.
pub type TimeStats = HashMap<String, Vec<f64>>;

/// Timer name for the whole GPU part of a run.
pub const TOTAL_GPU_TIMER: &str = "Total GPU runtime";

/// Timer name for the wall-clock duration of a run.
pub const TOTAL_CPU_TIMER: &str = "Total CPU runtime";

/// Name under which a stage's timings are recorded:
/// `<layer>_<inW>x<inH>x<inC>_<outW>x<outH>x<outC>`.
pub fn stage_timer_name(layer: &str, input: TensorShape, output: TensorShape) -> String {
    format!("{layer}_{input}_{output}")
}

/// Mean and spread of one timing series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSummary {
    pub samples: usize,
    pub mean_ms: f64,
    /// Population standard deviation.
    pub std_dev_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl TimingSummary {
    /// Summarize `series` without its first `skip_head` and last `skip_tail`
    /// samples. Returns `None` when nothing is left.
    pub fn from_series(series: &[f64], skip_head: usize, skip_tail: usize) -> Option<Self> {
        let end = series.len().checked_sub(skip_tail)?;
        let window = series.get(skip_head..end)?;
        if window.is_empty() {
            return None;
        }

        let n = window.len() as f64;
        let mean = window.iter().sum::<f64>() / n;
        let variance = window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;

        Some(Self {
            samples: window.len(),
            mean_ms: mean,
            std_dev_ms: variance.sqrt(),
            min_ms: window.iter().copied().fold(f64::INFINITY, f64::min),
            max_ms: window.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

/// Summaries of every series in `stats`, sorted by name.
pub fn summarize(
    stats: &TimeStats,
    skip_head: usize,
    skip_tail: usize,
) -> Vec<(String, TimingSummary)> {
    let mut rows: Vec<_> = stats
        .iter()
        .filter_map(|(name, series)| {
            TimingSummary::from_series(series, skip_head, skip_tail).map(|s| (name.clone(), s))
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

/// Render summaries as an aligned text table.
pub fn format_summary_table(rows: &[(String, TimingSummary)]) -> String {
    let width = rows.iter().map(|(n, _)| n.len()).max().unwrap_or(4).max(4);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<width$}  {:>8}  {:>10}  {:>10}",
        "name", "samples", "mean ms", "std ms"
    );
    for (name, s) in rows {
        let _ = writeln!(
            out,
            "{:<width$}  {:>8}  {:>10.3}  {:>10.3}",
            name, s.samples, s.mean_ms, s.std_dev_ms
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_timer_name() {
        let name = stage_timer_name(
            "conv1",
            TensorShape::new(224, 224, 3),
            TensorShape::new(112, 112, 32),
        );
        assert_eq!(name, "conv1_224x224x3_112x112x32");
    }

    #[test]
    fn test_summary_discards_warmup_and_cooldown() {
        let series = [100.0, 2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0, 50.0];
        let s = TimingSummary::from_series(&series, 1, 1).unwrap();
        assert_eq!(s.samples, 8);
        assert!((s.mean_ms - 5.0).abs() < 1e-12);
        assert!((s.std_dev_ms - 2.0).abs() < 1e-12);
        assert_eq!(s.min_ms, 2.0);
        assert_eq!(s.max_ms, 9.0);
    }

    #[test]
    fn test_summary_of_too_short_series() {
        assert!(TimingSummary::from_series(&[1.0, 2.0], 1, 1).is_none());
        assert!(TimingSummary::from_series(&[1.0], 2, 0).is_none());
        assert!(TimingSummary::from_series(&[], 0, 0).is_none());
    }

    #[test]
    fn test_summarize_sorted_table() {
        let mut stats = TimeStats::new();
        stats.insert("b".to_string(), vec![1.0, 3.0]);
        stats.insert("a".to_string(), vec![2.0]);
        stats.insert("empty".to_string(), vec![]);
        let rows = summarize(&stats, 0, 0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "a");
        assert_eq!(rows[1].1.mean_ms, 2.0);

        let table = format_summary_table(&rows);
        assert!(table.lines().next().unwrap().starts_with("name"));
        assert_eq!(table.lines().count(), 3);
    }
}

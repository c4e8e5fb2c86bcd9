//! Weighted rolling statistics per QoS server.
//!
//! Each server key holds a short, newest-first history of `{latency, loss}`
//! samples plus a weighted moving average: the newest sample gets the
//! configured weight, the older ones share the remainder equally. A result
//! proving the server unreachable evicts the whole history — a dead server
//! must not keep winning region selection on stale good samples.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::probe::{INVALID_LATENCY, INVALID_PACKET_LOSS, ProbeResult};
use pulse_core::config::StatsConfig;

/// One latency/loss observation, or a weighted blend of several.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QosSample {
    pub latency_ms: u32,
    pub packet_loss: f32,
}

#[derive(Debug)]
struct History {
    /// Newest first, capped at `max_results`.
    samples: VecDeque<QosSample>,
    /// Recomputed on every insert so reads are a plain copy.
    weighted: QosSample,
}

/// Thread-safe store of per-server rolling statistics. Readers take
/// per-entry shared access; `process` is the only writer for its key.
pub struct QosStats {
    max_results: usize,
    weight: f32,
    entries: DashMap<String, History>,
}

impl QosStats {
    pub fn new(cfg: &StatsConfig) -> Self {
        Self {
            max_results: cfg.max_results.max(1),
            weight: cfg.weight_of_current_result.clamp(0.0, 1.0),
            entries: DashMap::new(),
        }
    }

    /// Fold one probe result into the server's history. An unreachable
    /// result (no average, no loss ratio) evicts the key entirely.
    pub fn process(&self, key: &str, result: &ProbeResult) {
        let latency_ms = result.average_latency_ms();
        let packet_loss = result.packet_loss();

        if latency_ms == INVALID_LATENCY || packet_loss == INVALID_PACKET_LOSS {
            if self.entries.remove(key).is_some() {
                tracing::debug!(key, "server unreachable, history evicted");
            }
            return;
        }

        let sample = QosSample {
            latency_ms,
            packet_loss,
        };
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| History {
                samples: VecDeque::with_capacity(self.max_results),
                weighted: sample,
            });
        let history = entry.value_mut();
        history.samples.push_front(sample);
        history.samples.truncate(self.max_results);
        history.weighted = weighted_average(&history.samples, self.weight);
    }

    /// The most recently computed weighted average for a key.
    pub fn weighted_average(&self, key: &str) -> Option<QosSample> {
        self.entries.get(key).map(|entry| entry.weighted)
    }

    /// Snapshot of a key's history, newest first.
    pub fn all_samples(&self, key: &str) -> Option<Vec<QosSample>> {
        self.entries
            .get(key)
            .map(|entry| entry.samples.iter().copied().collect())
    }

    /// Keys currently holding history.
    pub fn all_keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Newest sample weighted `w`, each older sample `(1 - w) / (n - 1)`.
/// Latency rounds to nearest; loss is clamped to absorb float drift.
fn weighted_average(samples: &VecDeque<QosSample>, weight: f32) -> QosSample {
    debug_assert!(!samples.is_empty());
    if samples.len() == 1 {
        return samples[0];
    }

    let weight = f64::from(weight);
    let older_share = (1.0 - weight) / (samples.len() - 1) as f64;

    let mut latency = f64::from(samples[0].latency_ms) * weight;
    let mut loss = f64::from(samples[0].packet_loss) * weight;
    for sample in samples.iter().skip(1) {
        latency += f64::from(sample.latency_ms) * older_share;
        loss += f64::from(sample.packet_loss) * older_share;
    }

    QosSample {
        latency_ms: latency.round() as u32,
        packet_loss: (loss as f32).clamp(0.0, 1.0),
    }
}

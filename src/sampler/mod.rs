// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

//! Periodic throughput observation over a sliding sample window.

use std::{collections::VecDeque, num::NonZeroUsize, time::Duration};


/// Aggregate throughput metrics delivered to the observer registered with
/// [`ThrottleGroup::on_throughput_metrics()`](crate::ThrottleGroup::on_throughput_metrics).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputMetrics {
    /// Mean emission rate over the sliding sample window.
    pub average_bytes_per_second: f64,

    /// Fraction of the configured budget in use, in `0.0..=1.0`.
    ///
    /// Zero when the group is unlimited.
    pub utilization: f64,
}

/// Sliding window of bytes-processed deltas.
#[derive(Debug, Default)]
pub(crate) struct ThroughputWindow {
    samples: VecDeque<u64>,
    last_total: u64,
}

impl ThroughputWindow {
    /// Records the current value of the group's byte counter and produces
    /// the updated metrics.
    ///
    /// Returns the metrics plus `true` when the caller should reset its
    /// byte counter to keep it from growing without bound across idle
    /// periods.
    pub(crate) fn record(
        &mut self,
        total_bytes: u64,
        sample_size: NonZeroUsize,
        sample_interval: Duration,
        bytes_per_second: u64,
    ) -> (ThroughputMetrics, bool) {
        let delta = total_bytes.saturating_sub(self.last_total);
        self.samples.push_back(delta);
        let reset = delta == 0;
        self.last_total = if reset { 0 } else { total_bytes };
        while self.samples.len() > sample_size.get() {
            self.samples.pop_front();
        }

        #[expect(clippy::cast_precision_loss)]
        let mean = self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64;
        #[expect(clippy::cast_precision_loss)]
        let samples_per_second = 1000.0 / sample_interval.as_millis() as f64;
        let average_bytes_per_second = mean * samples_per_second;
        #[expect(clippy::cast_precision_loss)]
        let utilization = if bytes_per_second == 0 {
            0.0
        } else {
            (average_bytes_per_second / bytes_per_second as f64).min(1.0)
        };
        (
            ThroughputMetrics {
                average_bytes_per_second,
                utilization,
            },
            reset,
        )
    }
}

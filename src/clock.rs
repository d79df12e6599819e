// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

//! Thin facade over the host runtime's monotonic clock and periodic timer.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Current instant on the monotonic clock.
///
/// Uses the tokio clock so that paused-time test runtimes drive the crate
/// deterministically.
pub(crate) fn now() -> Instant {
    Instant::now()
}

/// Handle of a periodic background timer.
///
/// The timer invokes its callback until the callback returns `false` or the
/// handle is dropped. Missed firings are skipped, not replayed.
#[derive(Debug)]
pub(crate) struct PeriodicTimer {
    task: tokio::task::JoinHandle<()>,
}

impl PeriodicTimer {
    /// Spawns a timer whose first firing happens after `start_delay` and
    /// which fires every `period` afterwards.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn<F>(start_delay: Duration, period: Duration, mut on_fire: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + start_delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !on_fire() {
                    break;
                }
            }
        });
        Self { task }
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

use thiserror::Error;

/// Rejected group configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The tick resolution would result in sub-millisecond ticks.
    #[error("ticks per second must not exceed 1000, got {ticks_per_second}")]
    TickResolutionTooFine {
        /// The rejected resolution.
        ticks_per_second: u32,
    },

    /// The per-throttle buffer could not hold a single second of traffic.
    #[error(
        "max buffer size of {max_buffer_size} bytes is below the rate of {bytes_per_second} bytes per second"
    )]
    MaxBufferBelowRate {
        /// The configured buffer limit.
        max_buffer_size: usize,
        /// The configured rate.
        bytes_per_second: u64,
    },

    /// The throughput sample interval is shorter than one millisecond.
    #[error("throughput sample interval must be at least one millisecond")]
    SampleIntervalTooShort,
}

/// Terminal failure of a single throttle.
///
/// The error is recorded as the throttle's completion result. Siblings in
/// the same group are unaffected, their budget share is simply recomputed
/// on the next tick.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrottleError {
    /// A producer write would have exceeded the buffer limit even after
    /// reclaiming emitted space. The throttle has been torn down and the
    /// rejected chunk was not appended.
    #[error(
        "pending buffer overflow: {pending} buffered + {incoming} incoming bytes exceed the limit of {max_buffer_size} bytes"
    )]
    BufferOverflow {
        /// Bytes buffered at the time of the failing write.
        pending: usize,
        /// Length of the rejected chunk.
        incoming: usize,
        /// The configured buffer limit.
        max_buffer_size: usize,
    },

    /// The throttle was hard-aborted and its buffered bytes discarded.
    #[error("throttle aborted")]
    Aborted,

    /// The throttle (or its whole group) was destroyed mid-stream.
    #[error("throttle destroyed")]
    Destroyed,
}

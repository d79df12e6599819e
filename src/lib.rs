// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

//! Group-coordinated bandwidth throttling for asynchronous byte streams.
//!
//! A [`ThrottleGroup`] owns a global byte-per-second budget and
//! distributes it evenly across all of its in-flight [`Throttle`]s on a
//! sub-second tick clock. Each throttle buffers producer writes and
//! re-emits them downstream at its clocked share of the budget.

use bytes::Bytes;
use futures_core::Stream;

mod clock;

mod config;
pub use self::config::{GroupConfig, GroupConfigUpdate};

mod error;
pub use self::error::{ConfigError, ThrottleError};

mod group;
pub use self::group::ThrottleGroup;

mod partition;
pub use self::partition::partitioned_integer_part;

mod sampler;
pub use self::sampler::ThroughputMetrics;

mod stream;
pub use self::stream::BandwidthThrottled;

mod throttle;
pub use self::throttle::{Throttle, ThrottleOptions, ThrottleOutput};

/// Extension trait for [`Stream`].
pub trait StreamExt: Stream {
    /// Routes this stream of byte chunks through a throttle of `group`,
    /// bounding its emission rate together with all other throttles of
    /// the group.
    ///
    /// The inner stream is only polled while the throttle's pending
    /// buffer has space, so producers faster than the granted rate are
    /// paced instead of buffered without bound.
    fn throttle_bandwidth(
        self,
        group: &ThrottleGroup,
        options: ThrottleOptions,
    ) -> BandwidthThrottled<Self>
    where
        Self: Sized,
        Self::Item: Into<Bytes>,
    {
        BandwidthThrottled::new(self, group, options)
    }
}

impl<S: Stream> StreamExt for S {}

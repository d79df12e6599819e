// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

use std::{
    num::{NonZeroU32, NonZeroUsize},
    time::Duration,
};

use crate::ConfigError;

const MILLIS_PER_SECOND: u32 = 1000;

const DEFAULT_TICKS_PER_SECOND: NonZeroU32 = NonZeroU32::new(10).unwrap();
const DEFAULT_MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;
const DEFAULT_SAMPLE_SIZE: NonZeroUsize = NonZeroUsize::new(8).unwrap();

/// Tuning parameters shared by a throttle group and all of its throttles.
///
/// The configuration is read-mostly: it can be replaced at any time through
/// [`ThrottleGroup::configure()`](crate::ThrottleGroup::configure) and takes
/// effect no later than the next tick. Byte allocations of the current tick
/// may still use the prior values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    /// Aggregate emission ceiling in bytes per second, shared by all
    /// throttles of the group. Zero disables throttling.
    pub bytes_per_second: u64,

    /// Master switch for throttling. When `false` every throttle passes
    /// its input straight through.
    pub is_throttled: bool,

    /// Intra-second emission resolution: how many evenly sized slices a
    /// one-second budget is split into.
    pub ticks_per_second: NonZeroU32,

    /// Upper bound on the unemitted bytes buffered per throttle.
    pub max_buffer_size: usize,

    /// Interval between two throughput samples.
    pub throughput_sample_interval: Duration,

    /// Number of samples in the sliding throughput window.
    pub throughput_sample_size: NonZeroUsize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: 0,
            is_throttled: true,
            ticks_per_second: DEFAULT_TICKS_PER_SECOND,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            throughput_sample_interval: Duration::from_secs(1),
            throughput_sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }
}

impl GroupConfig {
    /// Checks the configuration for internally inconsistent values.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first rejected value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ticks_per_second.get() > MILLIS_PER_SECOND {
            return Err(ConfigError::TickResolutionTooFine {
                ticks_per_second: self.ticks_per_second.get(),
            });
        }
        if (self.max_buffer_size as u64) < self.bytes_per_second {
            return Err(ConfigError::MaxBufferBelowRate {
                max_buffer_size: self.max_buffer_size,
                bytes_per_second: self.bytes_per_second,
            });
        }
        if self.throughput_sample_interval < Duration::from_millis(1) {
            return Err(ConfigError::SampleIntervalTooShort);
        }
        Ok(())
    }

    /// Duration of a single tick.
    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        Duration::from_millis(self.tick_duration_ms())
    }

    pub(crate) fn tick_duration_ms(&self) -> u64 {
        u64::from(MILLIS_PER_SECOND / self.ticks_per_second)
    }

    /// `true` when emission is not rate-bound.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        !self.is_throttled || self.bytes_per_second == 0
    }

    pub(crate) fn merged(&self, update: &GroupConfigUpdate) -> Self {
        let GroupConfigUpdate {
            bytes_per_second,
            is_throttled,
            ticks_per_second,
            max_buffer_size,
            throughput_sample_interval,
            throughput_sample_size,
        } = update;
        Self {
            bytes_per_second: bytes_per_second.unwrap_or(self.bytes_per_second),
            is_throttled: is_throttled.unwrap_or(self.is_throttled),
            ticks_per_second: ticks_per_second.unwrap_or(self.ticks_per_second),
            max_buffer_size: max_buffer_size.unwrap_or(self.max_buffer_size),
            throughput_sample_interval: throughput_sample_interval
                .unwrap_or(self.throughput_sample_interval),
            throughput_sample_size: throughput_sample_size.unwrap_or(self.throughput_sample_size),
        }
    }
}

/// Partial overlay merged into a [`GroupConfig`] by
/// [`ThrottleGroup::configure()`](crate::ThrottleGroup::configure).
///
/// Fields left at `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupConfigUpdate {
    /// See [`GroupConfig::bytes_per_second`].
    pub bytes_per_second: Option<u64>,
    /// See [`GroupConfig::is_throttled`].
    pub is_throttled: Option<bool>,
    /// See [`GroupConfig::ticks_per_second`].
    pub ticks_per_second: Option<NonZeroU32>,
    /// See [`GroupConfig::max_buffer_size`].
    pub max_buffer_size: Option<usize>,
    /// See [`GroupConfig::throughput_sample_interval`].
    pub throughput_sample_interval: Option<Duration>,
    /// See [`GroupConfig::throughput_sample_size`].
    pub throughput_sample_size: Option<NonZeroUsize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(Ok(()), GroupConfig::default().validate());
    }

    #[test]
    fn default_config_is_unlimited_until_a_rate_is_set() {
        assert!(GroupConfig::default().is_unlimited());
        let config = GroupConfig {
            bytes_per_second: 1,
            ..GroupConfig::default()
        };
        assert!(!config.is_unlimited());
        let config = GroupConfig {
            bytes_per_second: 1,
            is_throttled: false,
            ..GroupConfig::default()
        };
        assert!(config.is_unlimited());
    }

    #[test]
    fn tick_duration_is_derived_from_the_resolution() {
        let config = GroupConfig {
            ticks_per_second: NonZeroU32::new(10).unwrap(),
            ..GroupConfig::default()
        };
        assert_eq!(Duration::from_millis(100), config.tick_duration());
        let config = GroupConfig {
            ticks_per_second: NonZeroU32::new(3).unwrap(),
            ..GroupConfig::default()
        };
        assert_eq!(Duration::from_millis(333), config.tick_duration());
    }

    #[test]
    fn rejects_sub_millisecond_ticks() {
        let config = GroupConfig {
            ticks_per_second: NonZeroU32::new(2000).unwrap(),
            ..GroupConfig::default()
        };
        assert_eq!(
            Err(ConfigError::TickResolutionTooFine {
                ticks_per_second: 2000
            }),
            config.validate()
        );
    }

    #[test]
    fn rejects_a_buffer_smaller_than_the_rate() {
        let config = GroupConfig {
            bytes_per_second: 2048,
            max_buffer_size: 1024,
            ..GroupConfig::default()
        };
        assert_eq!(
            Err(ConfigError::MaxBufferBelowRate {
                max_buffer_size: 1024,
                bytes_per_second: 2048,
            }),
            config.validate()
        );
    }

    #[test]
    fn rejects_an_empty_sample_interval() {
        let config = GroupConfig {
            throughput_sample_interval: Duration::ZERO,
            ..GroupConfig::default()
        };
        assert_eq!(Err(ConfigError::SampleIntervalTooShort), config.validate());
    }

    #[test]
    fn merging_an_empty_update_changes_nothing() {
        let config = GroupConfig::default();
        assert_eq!(config, config.merged(&GroupConfigUpdate::default()));
    }

    #[test]
    fn merging_overrides_only_the_given_fields() {
        let config = GroupConfig::default();
        let merged = config.merged(&GroupConfigUpdate {
            bytes_per_second: Some(500),
            max_buffer_size: Some(4096),
            ..GroupConfigUpdate::default()
        });
        assert_eq!(500, merged.bytes_per_second);
        assert_eq!(4096, merged.max_buffer_size);
        assert_eq!(config.ticks_per_second, merged.ticks_per_second);
        assert_eq!(config.is_throttled, merged.is_throttled);
    }
}

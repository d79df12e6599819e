// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

use std::{num::NonZeroU32, time::Duration};

use bytes::Bytes;
use futures::StreamExt as _;
use tokio::time::Instant;

use crate::{GroupConfig, StreamExt as _, ThrottleGroup, ThrottleOptions};

fn throttled_config(
    bytes_per_second: u64,
    ticks_per_second: u32,
    max_buffer_size: usize,
) -> GroupConfig {
    GroupConfig {
        bytes_per_second,
        ticks_per_second: NonZeroU32::new(ticks_per_second).unwrap(),
        max_buffer_size,
        ..GroupConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn passes_chunks_through_unchanged_while_unlimited() {
    let group = ThrottleGroup::new(GroupConfig::default()).unwrap();
    let input = futures::stream::iter([
        Bytes::from_static(b"lorem "),
        Bytes::from_static(b"ipsum "),
        Bytes::from_static(b"dolor"),
    ]);
    let started = Instant::now();

    let collected: Vec<u8> = input
        .throttle_bandwidth(&group, ThrottleOptions::default())
        .collect::<Vec<_>>()
        .await
        .iter()
        .flat_map(|chunk| chunk.iter().copied())
        .collect();

    assert_eq!(b"lorem ipsum dolor".as_slice(), collected.as_slice());
    assert_eq!(Duration::ZERO, started.elapsed());
    assert!(!group.clock_running());
}

#[tokio::test(start_paused = true)]
async fn emission_is_paced_at_the_configured_rate() {
    let group = ThrottleGroup::new(throttled_config(100, 10, 10_000)).unwrap();
    let input = futures::stream::iter([vec![0u8; 40], vec![0u8; 30], vec![0u8; 30]]);
    let started = Instant::now();

    let collected: usize = input
        .throttle_bandwidth(&group, ThrottleOptions::default())
        .map(|chunk| chunk.len())
        .collect::<Vec<_>>()
        .await
        .iter()
        .sum();

    assert_eq!(100, collected);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(900) && elapsed <= Duration::from_millis(1100),
        "drained in {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn a_fast_producer_is_paced_by_buffer_space() {
    // Three seconds worth of data in chunks that each fill the whole
    // buffer: the inner stream must only be polled as space frees up.
    let group = ThrottleGroup::new(throttled_config(1000, 10, 1000)).unwrap();
    let input = futures::stream::iter([vec![0u8; 1000], vec![0u8; 1000], vec![0u8; 1000]]);
    let started = Instant::now();

    let collected: usize = input
        .throttle_bandwidth(&group, ThrottleOptions::default())
        .map(|chunk| chunk.len())
        .collect::<Vec<_>>()
        .await
        .iter()
        .sum();

    assert_eq!(3000, collected);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(2900) && elapsed <= Duration::from_millis(3200),
        "drained in {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn a_chunk_larger_than_the_buffer_ends_the_stream() {
    let group = ThrottleGroup::new(throttled_config(1000, 10, 1000)).unwrap();
    let input = futures::stream::iter([vec![0u8; 2000]]);

    let collected = input
        .throttle_bandwidth(&group, ThrottleOptions::default())
        .collect::<Vec<_>>()
        .await;

    assert!(collected.is_empty());
    assert_eq!(0, group.active_throttles());
}

#[tokio::test(start_paused = true)]
async fn an_empty_input_stream_finishes_without_clock_activity() {
    let group = ThrottleGroup::new(throttled_config(100, 10, 10_000)).unwrap();
    let input = futures::stream::empty::<Bytes>();

    let collected = input
        .throttle_bandwidth(&group, ThrottleOptions::default())
        .collect::<Vec<_>>()
        .await;

    assert!(collected.is_empty());
    assert!(!group.clock_running());
}

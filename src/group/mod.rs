// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

//! Coordinator that distributes a global byte-per-second budget across a
//! dynamically changing set of in-flight throttles.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, Weak},
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::sync::mpsc;

use crate::{
    ConfigError, GroupConfig, GroupConfigUpdate, ThrottleError, ThroughputMetrics,
    clock::{self, PeriodicTimer},
    partition::partitioned_integer_part,
    sampler::ThroughputWindow,
    throttle::{
        DoneSignal, Emit, EmissionHook, Throttle, ThrottleId, ThrottleOptions, ThrottleOutput,
        ThrottleState,
    },
};


type MetricsHook = Arc<dyn Fn(ThroughputMetrics) + Send + Sync>;

/// Group state shared between the public handles and the timer tasks.
///
/// The single mutex is the crate's event loop: tick clock, throughput
/// sampler and producer calls all serialize on it, and it is never held
/// across a suspension point.
pub(crate) struct Shared {
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("group state poisoned")
    }
}

struct Inner {
    self_weak: Weak<Shared>,
    config: GroupConfig,
    /// All attached throttles in creation order.
    throttles: Vec<ThrottleState>,
    /// Currently in-flight throttles in insertion order.
    in_flight: Vec<ThrottleId>,
    clock: Option<PeriodicTimer>,
    tick_index: u32,
    second_index: u64,
    last_tick_at: Option<tokio::time::Instant>,
    total_bytes_processed: u64,
    next_throttle_id: u64,
    window: ThroughputWindow,
    sampler: Option<PeriodicTimer>,
    on_throughput: Option<MetricsHook>,
    destroyed: bool,
}

impl Inner {
    fn state_mut(&mut self, id: ThrottleId) -> Option<&mut ThrottleState> {
        self.throttles.iter_mut().find(|state| state.id() == id)
    }

    /// Registers a throttle as in-flight, starting the clock for the
    /// first one.
    fn on_start(&mut self, id: ThrottleId) {
        trace!("throttle {id:?} became in-flight");
        self.in_flight.push(id);
        if self.in_flight.len() == 1 {
            self.start_clock();
        }
    }

    /// Removes a throttle from the in-flight set, stopping the clock once
    /// the set empties.
    fn on_stop(&mut self, id: ThrottleId) {
        let Some(position) = self.in_flight.iter().position(|in_flight| *in_flight == id) else {
            return;
        };
        self.in_flight.remove(position);
        if self.in_flight.is_empty() && self.clock.take().is_some() {
            debug!("stopping tick clock");
        }
    }

    fn start_clock(&mut self) {
        let tick = self.config.tick_duration();
        debug!("starting tick clock: tick duration {tick:?}");
        self.last_tick_at = None;
        self.tick_index = 0;
        let weak = self.self_weak.clone();
        // Poll at one fifth of the tick duration to stay close to the
        // intended tick edges on jittery host timers; the elapsed-time
        // gate in tick() turns early firings into no-ops, and the
        // catch-up factor makes up for late ones.
        self.clock = Some(PeriodicTimer::spawn(tick, tick / 5, move || {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            run_tick(&shared);
            true
        }));
    }

    /// Resolves the throttle's completion signal, removes it from the
    /// group and closes its downstream channel.
    fn finish_throttle(&mut self, id: ThrottleId, result: Result<(), ThrottleError>) {
        let Some(position) = self.throttles.iter().position(|state| state.id() == id) else {
            return;
        };
        let mut state = self.throttles.remove(position);
        trace!("throttle {id:?} finished: {result:?}");
        state.done().resolve(result);
        state.wake_waiters();
        self.on_stop(id);
    }

    /// Executes one clocked emission round.
    fn tick(&mut self, hooks: &mut Vec<(EmissionHook, Bytes)>) {
        if self.destroyed || self.clock.is_none() {
            return;
        }
        let config = self.config.clone();
        let now = clock::now();
        let tick_ms = config.tick_duration_ms();
        let elapsed_ms = self.last_tick_at.map_or(0, |at| {
            u64::try_from(now.duration_since(at).as_millis()).unwrap_or(u64::MAX)
        });
        let unlimited = config.is_unlimited();
        if !unlimited && self.last_tick_at.is_some() && elapsed_ms < tick_ms {
            return;
        }
        // A host stall of k ticks is caught up in a single emission of
        // k times the quota.
        let catch_up = (elapsed_ms / tick_ms).max(1);

        // Iterate a snapshot: completing throttles mutate the in-flight
        // set mid-loop.
        let in_flight = self.in_flight.clone();
        let count = in_flight.len() as u64;
        if count == 0 {
            return;
        }
        let rotation = self.second_index % count;
        let ticks_per_second = u64::from(config.ticks_per_second.get());
        let tick_index = u64::from(self.tick_index);

        for (i, id) in in_flight.into_iter().enumerate() {
            let mut detached = false;
            let mut emitted: Option<Bytes> = None;
            let mut hook = None;
            let mut drained = false;
            let mut ended = false;
            {
                let Some(state) = self.state_mut(id) else {
                    continue;
                };
                if state.is_detached() {
                    detached = true;
                } else {
                    let quota = if unlimited {
                        usize::MAX
                    } else {
                        // The remainder-heavy slots advance with the
                        // second counter so that uneven shares even out
                        // over a full rotation cycle.
                        let slot = (i as u64 + count - rotation) % count;
                        let per_second =
                            partitioned_integer_part(config.bytes_per_second, count, slot);
                        let per_tick =
                            partitioned_integer_part(per_second, ticks_per_second, tick_index);
                        usize::try_from(per_tick.saturating_mul(catch_up)).unwrap_or(usize::MAX)
                    };
                    match state.emit(quota) {
                        Emit::Emitted(slice) => {
                            hook = state.emission_hook();
                            emitted = Some(slice);
                        }
                        Emit::Nothing => {}
                        Emit::Detached => detached = true,
                    }
                    drained = state.pending_len() == 0;
                    ended = state.input_ended();
                }
            }
            if detached {
                debug!("downstream of throttle {id:?} detached, completing early");
                self.finish_throttle(id, Ok(()));
                continue;
            }
            if let Some(slice) = emitted {
                self.total_bytes_processed += slice.len() as u64;
                if let Some(hook) = hook {
                    hooks.push((hook, slice));
                }
            }
            if drained && ended {
                self.finish_throttle(id, Ok(()));
            } else if unlimited && drained {
                // Pass-through mode: the producer is still active but
                // nothing is left to clock out, so the throttle leaves
                // the in-flight set until a throttled write re-registers
                // it.
                if let Some(state) = self.state_mut(id) {
                    state.mark_stopped();
                }
                self.on_stop(id);
            }
        }

        if self.clock.is_none() {
            // The loop emptied the in-flight set and stopped the clock.
            return;
        }
        self.tick_index += 1;
        if self.tick_index == config.ticks_per_second.get() {
            self.tick_index = 0;
            self.second_index += 1;
        }
        self.last_tick_at = Some(now);
    }
}

/// Runs one tick, invoking emission observers outside the state lock.
fn run_tick(shared: &Shared) {
    let mut hooks: Vec<(EmissionHook, Bytes)> = Vec::new();
    shared.lock().tick(&mut hooks);
    for (hook, slice) in &hooks {
        hook(slice);
    }
}

/// Takes one throughput sample, invoking the observer outside the lock.
fn run_sample(shared: &Shared) {
    let observed = {
        let mut guard = shared.lock();
        let inner = &mut *guard;
        if inner.destroyed {
            return;
        }
        let config = inner.config.clone();
        let budget = if config.is_unlimited() {
            0
        } else {
            config.bytes_per_second
        };
        let (metrics, reset) = inner.window.record(
            inner.total_bytes_processed,
            config.throughput_sample_size,
            config.throughput_sample_interval,
            budget,
        );
        if reset {
            inner.total_bytes_processed = 0;
        }
        trace!("throughput sample: {metrics:?}");
        inner
            .on_throughput
            .as_ref()
            .map(|hook| (Arc::clone(hook), metrics))
    };
    if let Some((hook, metrics)) = observed {
        hook(metrics);
    }
}

fn spawn_sampler(weak: Weak<Shared>, interval: Duration) -> PeriodicTimer {
    PeriodicTimer::spawn(interval, interval, move || {
        let Some(shared) = weak.upgrade() else {
            return false;
        };
        run_sample(&shared);
        true
    })
}

fn recorded_failure(done: &DoneSignal) -> ThrottleError {
    match done.get() {
        Some(Err(err)) => err,
        _ => ThrottleError::Destroyed,
    }
}

impl Shared {
    /// Buffers (or, while unlimited, forwards) a producer chunk.
    ///
    /// Returns the emitted-bytes watermark the caller has to await when
    /// the throttle extends backpressure to its producer.
    pub(crate) fn write_chunk(
        &self,
        id: ThrottleId,
        done: &DoneSignal,
        chunk: Bytes,
    ) -> Result<Option<u64>, ThrottleError> {
        let mut forwarded: Option<(Option<EmissionHook>, Bytes)> = None;
        let result = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.state_mut(id).is_none() {
                return Err(recorded_failure(done));
            }
            let config = inner.config.clone();
            if config.is_unlimited() {
                let outcome = {
                    let state = inner.state_mut(id).expect("present");
                    state.forward(chunk)
                };
                match outcome {
                    Emit::Emitted(slice) => {
                        inner.total_bytes_processed += slice.len() as u64;
                        let hook = inner.state_mut(id).expect("present").emission_hook();
                        forwarded = Some((hook, slice));
                        Ok(None)
                    }
                    Emit::Nothing | Emit::Detached => {
                        // Nobody is listening anymore.
                        inner.finish_throttle(id, Ok(()));
                        Err(ThrottleError::Destroyed)
                    }
                }
            } else {
                let append_result = {
                    let state = inner.state_mut(id).expect("present");
                    state.append(&chunk, config.bytes_per_second, config.max_buffer_size)
                };
                match append_result {
                    Err(err) => {
                        warn!("throttle {id:?} overflowed its pending buffer: {err}");
                        inner.finish_throttle(id, Err(err.clone()));
                        Err(err)
                    }
                    Ok(()) => {
                        let (first_write, emitted_target) = {
                            let state = inner.state_mut(id).expect("present");
                            (
                                state.mark_started(),
                                state.backpressure().then(|| state.bytes_appended()),
                            )
                        };
                        if first_write {
                            inner.on_start(id);
                        }
                        Ok(emitted_target)
                    }
                }
            }
        };
        if let Some((Some(hook), slice)) = forwarded {
            hook(&slice);
        }
        result
    }

    /// Poll-based variant of [`Shared::write_chunk()`] that parks until
    /// buffer space frees up instead of overflowing. Overflow remains
    /// possible only for a chunk that can never fit on its own.
    pub(crate) fn poll_write(
        &self,
        id: ThrottleId,
        done: &DoneSignal,
        cx: &mut Context<'_>,
        chunk: &mut Option<Bytes>,
    ) -> Poll<Result<(), ThrottleError>> {
        let mut forwarded: Option<(Option<EmissionHook>, Bytes)> = None;
        let result = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.state_mut(id).is_none() {
                return Poll::Ready(Err(recorded_failure(done)));
            }
            let config = inner.config.clone();
            if config.is_unlimited() {
                let taken = chunk.take().expect("chunk to feed");
                let outcome = {
                    let state = inner.state_mut(id).expect("present");
                    state.forward(taken)
                };
                match outcome {
                    Emit::Emitted(slice) => {
                        inner.total_bytes_processed += slice.len() as u64;
                        let hook = inner.state_mut(id).expect("present").emission_hook();
                        forwarded = Some((hook, slice));
                        Poll::Ready(Ok(()))
                    }
                    Emit::Nothing | Emit::Detached => {
                        inner.finish_throttle(id, Ok(()));
                        Poll::Ready(Err(ThrottleError::Destroyed))
                    }
                }
            } else {
                let len = chunk.as_ref().expect("chunk to feed").len();
                if len > config.max_buffer_size {
                    let pending = inner.state_mut(id).expect("present").pending_len();
                    let err = ThrottleError::BufferOverflow {
                        pending,
                        incoming: len,
                        max_buffer_size: config.max_buffer_size,
                    };
                    warn!("throttle {id:?} overflowed its pending buffer: {err}");
                    inner.finish_throttle(id, Err(err.clone()));
                    Poll::Ready(Err(err))
                } else {
                    let state = inner.state_mut(id).expect("present");
                    if state.fits(len, config.max_buffer_size) {
                        let taken = chunk.take().expect("chunk to feed");
                        state
                            .append(&taken, config.bytes_per_second, config.max_buffer_size)
                            .expect("chunk must fit after the space check");
                        let first_write = state.mark_started();
                        if first_write {
                            inner.on_start(id);
                        }
                        Poll::Ready(Ok(()))
                    } else {
                        state.register_waiter(cx.waker());
                        Poll::Pending
                    }
                }
            }
        };
        if let Some((Some(hook), slice)) = forwarded {
            hook(&slice);
        }
        result
    }

    /// Waits until the emitted-bytes counter reaches `target`.
    pub(crate) fn poll_emitted(
        &self,
        id: ThrottleId,
        done: &DoneSignal,
        target: u64,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), ThrottleError>> {
        let mut guard = self.lock();
        match guard.state_mut(id) {
            Some(state) => {
                if state.bytes_emitted() >= target {
                    Poll::Ready(Ok(()))
                } else {
                    state.register_waiter(cx.waker());
                    Poll::Pending
                }
            }
            None => Poll::Ready(done.get().unwrap_or(Err(ThrottleError::Destroyed))),
        }
    }

    /// Waits for the throttle's completion signal.
    pub(crate) fn poll_done(
        &self,
        id: ThrottleId,
        done: &DoneSignal,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), ThrottleError>> {
        let mut guard = self.lock();
        match guard.state_mut(id) {
            Some(state) => {
                state.register_waiter(cx.waker());
                Poll::Pending
            }
            None => Poll::Ready(done.get().unwrap_or(Err(ThrottleError::Destroyed))),
        }
    }

    /// Marks end-of-input. Completes the throttle right away when there
    /// is nothing left to clock out (or the group is unlimited).
    pub(crate) fn end_input(&self, id: ThrottleId) {
        let mut flushed: Option<(Option<EmissionHook>, Bytes)> = None;
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let unlimited = inner.config.is_unlimited();
            let drained;
            {
                let Some(state) = inner.state_mut(id) else {
                    return;
                };
                if state.input_ended() {
                    return;
                }
                state.end_input();
                if unlimited && state.pending_len() > 0 {
                    // Leftover from an earlier throttled phase.
                    match state.emit(usize::MAX) {
                        Emit::Emitted(slice) => {
                            flushed = Some((state.emission_hook(), slice));
                        }
                        Emit::Nothing | Emit::Detached => {}
                    }
                }
                drained = state.pending_len() == 0;
            }
            if let Some((_, slice)) = &flushed {
                inner.total_bytes_processed += slice.len() as u64;
            }
            if unlimited || drained {
                inner.finish_throttle(id, Ok(()));
            }
        }
        if let Some((Some(hook), slice)) = flushed {
            hook(&slice);
        }
    }

    pub(crate) fn abort_throttle(&self, id: ThrottleId, error: ThrottleError) {
        let mut guard = self.lock();
        if guard.state_mut(id).is_some() {
            debug!("aborting throttle {id:?}: {error}");
            guard.finish_throttle(id, Err(error));
        }
    }

    pub(crate) fn graceful_abort_throttle(&self, id: ThrottleId) {
        let mut guard = self.lock();
        if guard.state_mut(id).is_some() {
            debug!("gracefully aborting throttle {id:?}");
            guard.finish_throttle(id, Ok(()));
        }
    }

    pub(crate) fn set_emission_hook(&self, id: ThrottleId, hook: EmissionHook) {
        if let Some(state) = self.lock().state_mut(id) {
            state.set_emission_hook(hook);
        }
    }
}

/// Coordinator owning a global byte-per-second budget, the tick clock and
/// a registry of throttles.
///
/// Quota per throttle and tick is derived by two exact integer partitions:
/// the budget over the in-flight throttles (with the remainder slot
/// rotating every second), then each per-second share over the ticks of
/// the second. Over a full rotation cycle every throttle therefore
/// receives the same number of bytes, without rounding drift.
///
/// The group must be created from within a tokio runtime. Dropping it
/// destroys every attached throttle.
pub struct ThrottleGroup {
    shared: Arc<Shared>,
}

impl fmt::Debug for ThrottleGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.shared.lock();
        f.debug_struct("ThrottleGroup")
            .field("config", &guard.config)
            .field("throttles", &guard.throttles.len())
            .field("in_flight", &guard.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl ThrottleGroup {
    /// Creates a group with the given configuration and starts its
    /// throughput sampler.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the configuration is rejected by
    /// [`GroupConfig::validate()`].
    pub fn new(config: GroupConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let sample_interval = config.throughput_sample_interval;
        let shared = Arc::new_cyclic(|self_weak| Shared {
            inner: Mutex::new(Inner {
                self_weak: self_weak.clone(),
                config,
                throttles: Vec::new(),
                in_flight: Vec::new(),
                clock: None,
                tick_index: 0,
                second_index: 0,
                last_tick_at: None,
                total_bytes_processed: 0,
                next_throttle_id: 0,
                window: ThroughputWindow::default(),
                sampler: None,
                on_throughput: None,
                destroyed: false,
            }),
        });
        let sampler = spawn_sampler(Arc::downgrade(&shared), sample_interval);
        shared.lock().sampler = Some(sampler);
        Ok(Self { shared })
    }

    /// Creates a new throttle attached to this group and returns its
    /// producer and consumer ends.
    #[expect(clippy::needless_pass_by_value)]
    pub fn create_throttle(&self, options: ThrottleOptions) -> (Throttle, ThrottleOutput) {
        let (tx, rx) = mpsc::unbounded_channel();
        let done = Arc::new(DoneSignal::default());
        let id = {
            let mut guard = self.shared.lock();
            let inner = &mut *guard;
            let id = ThrottleId(inner.next_throttle_id);
            inner.next_throttle_id += 1;
            if inner.destroyed {
                done.resolve(Err(ThrottleError::Destroyed));
            } else {
                trace!("created throttle {id:?}");
                let state = ThrottleState::new(id, &options, &inner.config, tx, Arc::clone(&done));
                inner.throttles.push(state);
            }
            id
        };
        (
            Throttle::new(Arc::clone(&self.shared), id, done),
            ThrottleOutput::new(rx),
        )
    }

    /// Merges `update` into the group configuration.
    ///
    /// Takes effect no later than the next tick; allocations of the
    /// current tick may still use the prior values. Changing the tick
    /// resolution or the sample interval restarts the respective timer.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the merged configuration is
    /// invalid; the current configuration is kept in that case.
    pub fn configure(&self, update: GroupConfigUpdate) -> Result<(), ConfigError> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        if inner.destroyed {
            return Ok(());
        }
        let merged = inner.config.merged(&update);
        merged.validate()?;
        let previous = std::mem::replace(&mut inner.config, merged);
        debug!("reconfigured group: {:?}", inner.config);
        if inner.config.tick_duration() != previous.tick_duration() && inner.clock.is_some() {
            inner.start_clock();
        }
        if inner.config.throughput_sample_interval != previous.throughput_sample_interval {
            inner.sampler = Some(spawn_sampler(
                Arc::downgrade(&self.shared),
                inner.config.throughput_sample_interval,
            ));
        }
        Ok(())
    }

    /// Returns a snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> GroupConfig {
        self.shared.lock().config.clone()
    }

    /// Registers the observer invoked with every throughput sample.
    pub fn on_throughput_metrics(&self, hook: impl Fn(ThroughputMetrics) + Send + Sync + 'static) {
        self.shared.lock().on_throughput = Some(Arc::new(hook));
    }

    /// Number of throttles currently eligible for quota.
    #[must_use]
    pub fn active_throttles(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    /// Bytes pushed downstream since creation or the last idle reset of
    /// the throughput sampler.
    #[must_use]
    pub fn total_bytes_processed(&self) -> u64 {
        self.shared.lock().total_bytes_processed
    }

    #[cfg(test)]
    pub(crate) fn clock_running(&self) -> bool {
        self.shared.lock().clock.is_some()
    }

    /// Destroys every attached throttle and stops the clock and the
    /// sampler. Idempotent.
    pub fn destroy(&self) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        debug!(
            "destroying throttle group with {} attached throttles",
            inner.throttles.len()
        );
        for mut state in std::mem::take(&mut inner.throttles) {
            state.done().resolve(Err(ThrottleError::Destroyed));
            state.wake_waiters();
        }
        inner.in_flight.clear();
        inner.clock = None;
        inner.sampler = None;
    }
}

impl Drop for ThrottleGroup {
    fn drop(&mut self) {
        self.destroy();
    }
}

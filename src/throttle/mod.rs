// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

//! Per-stream transformer: buffers producer writes and re-emits them
//! downstream at the rate clocked by the owning group.

use std::{
    fmt,
    future::poll_fn,
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll, Waker},
};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tokio::sync::mpsc;

use crate::{GroupConfig, ThrottleError, group::Shared};


/// Identifier of a throttle within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThrottleId(pub(crate) u64);

/// Options for creating a throttle with
/// [`ThrottleGroup::create_throttle()`](crate::ThrottleGroup::create_throttle).
#[derive(Debug, Clone, Default)]
pub struct ThrottleOptions {
    /// Expected total stream length in bytes, used to size the initial
    /// pending buffer. Streams shorter than one second of budget avoid
    /// over-allocation this way.
    pub content_length: Option<u64>,

    /// When `true`, [`Throttle::write()`] completes only once the written
    /// chunk has been emitted downstream, extending backpressure all the
    /// way to the producer. When `false` a write completes as soon as the
    /// bytes are buffered.
    pub backpressure: bool,
}

pub(crate) type EmissionHook = Arc<dyn Fn(&Bytes) + Send + Sync>;

/// One-shot completion signal shared between the handle and the group.
#[derive(Debug, Default)]
pub(crate) struct DoneSignal {
    result: OnceLock<Result<(), ThrottleError>>,
}

impl DoneSignal {
    pub(crate) fn get(&self) -> Option<Result<(), ThrottleError>> {
        self.result.get().cloned()
    }

    /// Records the completion result. Only the first resolution sticks.
    pub(crate) fn resolve(&self, result: Result<(), ThrottleError>) {
        let _: Result<_, _> = self.result.set(result);
    }
}

/// Outcome of draining a slice from the pending buffer.
pub(crate) enum Emit {
    /// Nothing to emit (empty buffer or zero quota).
    Nothing,
    /// A slice was pushed downstream.
    Emitted(Bytes),
    /// The downstream receiver is gone; nothing was pushed.
    Detached,
}

/// Per-stream state owned by the group registry.
///
/// All mutation happens under the group lock; the public handles only ever
/// reach this state through [`Shared`](crate::group::Shared).
pub(crate) struct ThrottleState {
    id: ThrottleId,
    pending: BytesMut,
    buffer_capacity: usize,
    backpressure: bool,
    started: bool,
    input_ended: bool,
    bytes_appended: u64,
    bytes_emitted: u64,
    output: mpsc::UnboundedSender<Bytes>,
    done: Arc<DoneSignal>,
    on_bytes_written: Option<EmissionHook>,
    waiters: Vec<Waker>,
}

impl fmt::Debug for ThrottleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleState")
            .field("id", &self.id)
            .field("pending", &self.pending.len())
            .field("buffer_capacity", &self.buffer_capacity)
            .field("started", &self.started)
            .field("input_ended", &self.input_ended)
            .field("bytes_appended", &self.bytes_appended)
            .field("bytes_emitted", &self.bytes_emitted)
            .finish_non_exhaustive()
    }
}

impl ThrottleState {
    pub(crate) fn new(
        id: ThrottleId,
        options: &ThrottleOptions,
        config: &GroupConfig,
        output: mpsc::UnboundedSender<Bytes>,
        done: Arc<DoneSignal>,
    ) -> Self {
        let initial_capacity = initial_capacity(options, config);
        Self {
            id,
            pending: BytesMut::with_capacity(initial_capacity),
            buffer_capacity: initial_capacity,
            backpressure: options.backpressure,
            started: false,
            input_ended: false,
            bytes_appended: 0,
            bytes_emitted: 0,
            output,
            done,
            on_bytes_written: None,
            waiters: Vec::new(),
        }
    }

    pub(crate) const fn id(&self) -> ThrottleId {
        self.id
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) const fn input_ended(&self) -> bool {
        self.input_ended
    }

    pub(crate) const fn backpressure(&self) -> bool {
        self.backpressure
    }

    pub(crate) const fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }

    pub(crate) const fn bytes_emitted(&self) -> u64 {
        self.bytes_emitted
    }

    pub(crate) fn done(&self) -> Arc<DoneSignal> {
        Arc::clone(&self.done)
    }

    pub(crate) fn emission_hook(&self) -> Option<EmissionHook> {
        self.on_bytes_written.as_ref().map(Arc::clone)
    }

    pub(crate) fn set_emission_hook(&mut self, hook: EmissionHook) {
        self.on_bytes_written = Some(hook);
    }

    /// `true` once the downstream receiver has been dropped.
    pub(crate) fn is_detached(&self) -> bool {
        self.output.is_closed()
    }

    /// Marks the first producer write. Returns `true` exactly once.
    pub(crate) fn mark_started(&mut self) -> bool {
        if self.started {
            return false;
        }
        self.started = true;
        true
    }

    /// Forgets the started mark so that a later write registers again.
    pub(crate) fn mark_stopped(&mut self) {
        self.started = false;
    }

    pub(crate) fn end_input(&mut self) {
        self.input_ended = true;
    }

    /// `true` while the chunk of the given length fits the buffer limit.
    pub(crate) fn fits(&self, len: usize, max_buffer_size: usize) -> bool {
        self.pending.len() + len <= max_buffer_size
    }

    /// Appends `chunk` to the pending buffer, growing its capacity in
    /// whole rate-sized steps up to `max_buffer_size`.
    ///
    /// On overflow nothing is appended and the caller is expected to tear
    /// the throttle down.
    pub(crate) fn append(
        &mut self,
        chunk: &Bytes,
        bytes_per_second: u64,
        max_buffer_size: usize,
    ) -> Result<(), ThrottleError> {
        let needed = self.pending.len() + chunk.len();
        if needed > max_buffer_size {
            return Err(ThrottleError::BufferOverflow {
                pending: self.pending.len(),
                incoming: chunk.len(),
                max_buffer_size,
            });
        }
        if needed > self.buffer_capacity {
            let step = usize::try_from(bytes_per_second).unwrap_or(usize::MAX).max(1);
            let target = needed
                .div_ceil(step)
                .saturating_mul(step)
                .min(max_buffer_size);
            self.buffer_capacity = target;
        }
        // Reserving up to the bookkept capacity keeps reallocation in
        // rate-sized steps instead of the allocator's doubling.
        let spare = self.buffer_capacity - self.pending.len();
        if self.pending.capacity() < self.buffer_capacity {
            self.pending.reserve(spare);
        }
        self.pending.extend_from_slice(chunk);
        self.bytes_appended += chunk.len() as u64;
        Ok(())
    }

    /// Emits at most `max_bytes` from the pending buffer downstream.
    pub(crate) fn emit(&mut self, max_bytes: usize) -> Emit {
        let n = max_bytes.min(self.pending.len());
        if n == 0 {
            return Emit::Nothing;
        }
        let slice = self.pending.split_to(n).freeze();
        if self.output.send(slice.clone()).is_err() {
            // The receiver disappeared after the detachment check.
            return Emit::Detached;
        }
        self.bytes_emitted += n as u64;
        self.wake_waiters();
        Emit::Emitted(slice)
    }

    /// Sends a chunk straight downstream, bypassing the pending buffer.
    /// Used while the group is unlimited.
    pub(crate) fn forward(&mut self, chunk: Bytes) -> Emit {
        if self.output.send(chunk.clone()).is_err() {
            return Emit::Detached;
        }
        self.bytes_appended += chunk.len() as u64;
        self.bytes_emitted += chunk.len() as u64;
        self.wake_waiters();
        Emit::Emitted(chunk)
    }

    pub(crate) fn register_waiter(&mut self, waker: &Waker) {
        if !self.waiters.iter().any(|known| known.will_wake(waker)) {
            self.waiters.push(waker.clone());
        }
    }

    pub(crate) fn wake_waiters(&mut self) {
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }
}

fn initial_capacity(options: &ThrottleOptions, config: &GroupConfig) -> usize {
    let hint = options.content_length.unwrap_or(config.bytes_per_second);
    usize::try_from(hint)
        .unwrap_or(usize::MAX)
        .min(config.max_buffer_size)
}

/// Producer-side handle of a single throttled byte stream.
///
/// Dropping the handle signals end-of-input; already buffered bytes still
/// drain at the clocked rate. Use [`Throttle::abort()`] to discard them
/// instead.
pub struct Throttle {
    group: Arc<Shared>,
    id: ThrottleId,
    done: Arc<DoneSignal>,
}

impl fmt::Debug for Throttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Throttle {
    pub(crate) fn new(group: Arc<Shared>, id: ThrottleId, done: Arc<DoneSignal>) -> Self {
        Self { group, id, done }
    }

    /// Appends `chunk` to the pending buffer, or forwards it downstream
    /// immediately while the group is unlimited.
    ///
    /// With [`ThrottleOptions::backpressure`] enabled the returned future
    /// completes once the chunk has been emitted downstream; otherwise it
    /// completes as soon as the bytes are buffered.
    ///
    /// # Errors
    ///
    /// [`ThrottleError::BufferOverflow`] when the chunk does not fit the
    /// buffer limit even after reclaiming emitted space; the throttle is
    /// torn down. [`ThrottleError::Aborted`] or
    /// [`ThrottleError::Destroyed`] when the throttle ended before the
    /// chunk could be delivered.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<(), ThrottleError> {
        let chunk: Bytes = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        let Some(emitted_target) = self.group.write_chunk(self.id, &self.done, chunk)? else {
            return Ok(());
        };
        poll_fn(|cx| {
            self.group
                .poll_emitted(self.id, &self.done, emitted_target, cx)
        })
        .await
    }

    /// Signals end-of-input and waits until the last buffered byte has
    /// been emitted.
    ///
    /// # Errors
    ///
    /// Reports the recorded completion result when the throttle ended
    /// early, e.g. [`ThrottleError::Aborted`] after [`Throttle::abort()`].
    pub async fn finish(&self) -> Result<(), ThrottleError> {
        self.group.end_input(self.id);
        poll_fn(|cx| self.group.poll_done(self.id, &self.done, cx)).await
    }

    /// Hard abort: tears the throttle down immediately and discards any
    /// buffered bytes.
    ///
    /// Idempotent; aborting a finished or destroyed throttle has no
    /// effect.
    pub fn abort(&self) {
        self.group.abort_throttle(self.id, ThrottleError::Aborted);
    }

    /// Graceful abort: completes the throttle successfully without
    /// emitting the remaining buffered bytes.
    ///
    /// The group takes the same path when it notices that the downstream
    /// consumer has detached.
    pub fn graceful_abort(&self) {
        self.group.graceful_abort_throttle(self.id);
    }

    /// Registers an observer invoked with every emitted slice.
    pub fn on_bytes_written(&self, hook: impl Fn(&Bytes) + Send + Sync + 'static) {
        self.group.set_emission_hook(self.id, Arc::new(hook));
    }

    /// Feeds a chunk without awaiting, parking until buffer space frees
    /// up instead of overflowing. `chunk` is taken on success.
    pub(crate) fn poll_write(
        &self,
        cx: &mut Context<'_>,
        chunk: &mut Option<Bytes>,
    ) -> Poll<Result<(), ThrottleError>> {
        self.group.poll_write(self.id, &self.done, cx, chunk)
    }

    pub(crate) fn end_input(&self) {
        self.group.end_input(self.id);
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        // Dropping the producer end closes the input; buffered bytes keep
        // draining and the throttle completes on its own.
        self.group.end_input(self.id);
    }
}

/// Consumer-side end of a throttle: the clocked stream of emitted slices.
///
/// The stream terminates when the producer finished and the buffer
/// drained, or when the throttle was aborted or destroyed. Dropping the
/// output detaches the consumer; the group then completes the producer
/// side gracefully on its next tick.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled or .awaited"]
pub struct ThrottleOutput {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ThrottleOutput {
    pub(crate) const fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { rx }
    }
}

impl Stream for ThrottleOutput {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

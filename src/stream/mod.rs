// SPDX-FileCopyrightText: The bandwidth-throttle authors
// SPDX-License-Identifier: MPL-2.0

//! Combinator that pipes a stream of byte chunks through a group
//! throttle.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_core::Stream;
use pin_project_lite::pin_project;

use crate::{Throttle, ThrottleGroup, ThrottleOptions, ThrottleOutput};

#[cfg(test)]
mod tests;

pin_project! {
    /// Result of [`StreamExt::throttle_bandwidth()`](crate::StreamExt::throttle_bandwidth).
    ///
    /// Chunks pulled from the inner stream are buffered by a group
    /// throttle and re-emitted at the clocked rate. The inner stream is
    /// not polled while the pending buffer is full, so a fast producer is
    /// paced instead of overflowing; only a single chunk larger than the
    /// whole buffer limit tears the throttle down and ends the stream
    /// early.
    #[derive(Debug)]
    #[must_use = "streams do nothing unless polled or .awaited"]
    pub struct BandwidthThrottled<S> {
        #[pin]
        stream: Option<S>,
        throttle: Option<Throttle>,
        output: ThrottleOutput,
        chunk: Option<Bytes>,
    }
}

impl<S> BandwidthThrottled<S> {
    pub(crate) fn new(stream: S, group: &ThrottleGroup, options: ThrottleOptions) -> Self {
        let (throttle, output) = group.create_throttle(options);
        Self {
            stream: Some(stream),
            throttle: Some(throttle),
            output,
            chunk: None,
        }
    }
}

impl<S> Stream for BandwidthThrottled<S>
where
    S: Stream,
    S::Item: Into<Bytes>,
{
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        // Feed the pending buffer while the inner stream yields chunks
        // and the buffer has space for them.
        while let Some(throttle) = this.throttle.as_ref() {
            if this.chunk.is_none() {
                let Some(stream) = this.stream.as_mut().as_pin_mut() else {
                    break;
                };
                match stream.poll_next(cx) {
                    Poll::Ready(Some(item)) => {
                        let bytes = item.into();
                        if bytes.is_empty() {
                            continue;
                        }
                        *this.chunk = Some(bytes);
                    }
                    Poll::Ready(None) => {
                        this.stream.set(None);
                        throttle.end_input();
                        *this.throttle = None;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
            match throttle.poll_write(cx, this.chunk) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(_)) => {
                    // The throttle has been torn down; drain whatever was
                    // emitted before the failure and finish.
                    *this.chunk = None;
                    this.stream.set(None);
                    *this.throttle = None;
                }
                // Waiting for buffer space; emission progress wakes us.
                Poll::Pending => break,
            }
        }

        Pin::new(this.output).poll_next(cx)
    }
}

//! JSONL stream - bounded line buffer between a bus and an async consumer
//!
//! Each delivered event is encoded as one JSON line (newline terminated). When
//! the consumer falls behind, lines are dropped from the head and a
//! `run/truncated` line at the front records how many that pass lost. Markers
//! the consumer has not read yet fold into one line right behind it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, warn};

use super::bus::{EventBus, Subscription};
use super::types::{RunEvent, TruncationReason};

/// Upper bound on the encoded size of a marker line
const MARKER_RESERVE: usize = 256;

/// Bounds for buffered lines awaiting a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonlLimits {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for JsonlLimits {
    fn default() -> Self {
        Self {
            max_lines: 2000,
            max_bytes: 1_000_000,
        }
    }
}

struct Line {
    text: String,
    dropped: Option<u64>,
}

#[derive(Default)]
struct Buffer {
    lines: VecDeque<Line>,
    bytes: usize,
    closed: bool,
}

struct Inner {
    limits: JsonlLimits,
    buffer: Mutex<Buffer>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, event: &RunEvent) {
        let text = match serde_json::to_string(event) {
            Ok(json) => json + "\n",
            Err(e) => {
                warn!(event_type = %event.event_type(), error = %e, "JsonlStream: failed to encode event");
                return;
            }
        };

        let mut buf = self.lock();
        if buf.closed {
            return;
        }
        buf.bytes += text.len();
        buf.lines.push_back(Line { text, dropped: None });

        let limits = self.limits;
        if buf.lines.len() > limits.max_lines || buf.bytes > limits.max_bytes {
            let reason = if buf.lines.len() > limits.max_lines {
                TruncationReason::MaxEvents
            } else {
                TruncationReason::MaxBytes
            };

            // Earlier markers still waiting for the consumer fold into one
            let mut prior: Option<Line> = None;
            while let Some(count) = buf.lines.front().and_then(|l| l.dropped) {
                let Some(old) = buf.lines.pop_front() else {
                    break;
                };
                buf.bytes -= old.text.len();
                prior = Some(match prior {
                    None => old,
                    Some(p) => marker_line(event, p.dropped.unwrap_or(0) + count, reason).unwrap_or(p),
                });
            }
            let (prior_slot, prior_bytes) = prior.as_ref().map_or((0, 0), |p| (1, p.text.len()));

            let mut dropped = 0;
            // Leave room for the new marker line and the earlier one
            while buf.lines.len() + 1 + prior_slot > limits.max_lines
                || buf.bytes + MARKER_RESERVE + prior_bytes > limits.max_bytes
            {
                let Some(old) = buf.lines.pop_front() else {
                    break;
                };
                buf.bytes -= old.text.len();
                dropped += 1;
            }

            if let Some(prior) = prior {
                buf.bytes += prior.text.len();
                buf.lines.push_front(prior);
            }
            if dropped > 0
                && let Some(line) = marker_line(event, dropped, reason)
            {
                buf.bytes += line.text.len();
                buf.lines.push_front(line);
            }
            debug!(dropped, ?reason, "JsonlStream: buffer over bounds, dropped lines");
        }
        drop(buf);
        self.notify.notify_one();
    }
}

fn marker_line(event: &RunEvent, dropped: u64, reason: TruncationReason) -> Option<Line> {
    let marker = RunEvent::truncation_marker(event.run_id().clone(), dropped, reason);
    match serde_json::to_string(&marker) {
        Ok(json) => Some(Line {
            text: json + "\n",
            dropped: Some(dropped),
        }),
        Err(e) => {
            warn!(error = %e, "JsonlStream: failed to encode truncation marker");
            None
        }
    }
}

/// Async line stream fed by a bus subscription
pub struct JsonlStream {
    inner: Arc<Inner>,
    subscription: Mutex<Option<Subscription>>,
}

impl JsonlStream {
    /// Subscribe to `bus`; only events delivered after this call are streamed
    pub fn subscribe(bus: &dyn EventBus, limits: JsonlLimits) -> Self {
        debug!(?limits, "JsonlStream::subscribe");
        let inner = Arc::new(Inner {
            limits,
            buffer: Mutex::new(Buffer::default()),
            notify: Notify::new(),
        });
        let sink = Arc::clone(&inner);
        let subscription = bus.on(Arc::new(move |event: &RunEvent| sink.push(event)));
        Self {
            inner,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    /// Next buffered line, waiting for one if necessary; `None` once closed and drained
    pub async fn next_line(&self) -> Option<String> {
        loop {
            {
                let mut buf = self.inner.lock();
                if let Some(line) = buf.lines.pop_front() {
                    buf.bytes -= line.text.len();
                    return Some(line.text);
                }
                if buf.closed {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Pop a line without waiting
    pub fn try_next_line(&self) -> Option<String> {
        let mut buf = self.inner.lock();
        let line = buf.lines.pop_front()?;
        buf.bytes -= line.text.len();
        Some(line.text)
    }

    pub fn buffered_lines(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    /// Stop receiving events. Lines already buffered can still be read.
    pub fn close(&self) {
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sub) = subscription {
            sub.unsubscribe();
        }
        self.inner.lock().closed = true;
        self.inner.notify.notify_one();
        debug!("JsonlStream::close");
    }

    /// Handle that can close this stream from another task
    pub fn closer(&self) -> JsonlCloser {
        JsonlCloser {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Closes a [`JsonlStream`] without owning it
///
/// Unlike [`JsonlStream::close`] this leaves the bus subscription in place; the
/// listener simply ignores further events.
#[derive(Clone)]
pub struct JsonlCloser {
    inner: Arc<Inner>,
}

impl JsonlCloser {
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.notify.notify_one();
    }
}

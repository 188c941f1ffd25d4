//! Ordered progress events for one caller

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::types::{LineKind, ProgressEvent};

/// Producer half of a progress channel.
///
/// Emits exactly one `starting` (on open) and exactly one terminal event.
/// The terminal methods consume the streamer, so nothing can follow them;
/// dropping it without one emits a `failure`. Non-terminal sends take
/// `&self` so a retry hook and a line forwarder can share one streamer.
#[derive(Debug)]
pub struct ProgressStreamer {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    connected: AtomicBool,
    emitted: AtomicUsize,
    finished: bool,
}

/// Consumer half; ends after the terminal event
pub struct ProgressStream {
    inner: UnboundedReceiverStream<ProgressEvent>,
    done: bool,
}

impl ProgressStreamer {
    /// Open a channel and emit `starting`
    pub fn open(message: impl Into<String>) -> (Self, ProgressStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let streamer = Self {
            tx,
            connected: AtomicBool::new(true),
            emitted: AtomicUsize::new(0),
            finished: false,
        };
        streamer.send(ProgressEvent::Starting {
            message: message.into(),
        });

        let stream = ProgressStream {
            inner: UnboundedReceiverStream::new(rx),
            done: false,
        };
        (streamer, stream)
    }

    /// Forward one worker output line
    pub fn line(&self, text: impl Into<String>, source: LineKind, attempt: u32) {
        self.send(ProgressEvent::Processing {
            log: text.into(),
            source,
            attempt,
        });
    }

    /// Announce that the failed attempt will be retried after `delay_ms`
    pub fn retrying(&self, message: impl Into<String>, attempt: u32, max_attempts: u32, delay_ms: u64) {
        self.send(ProgressEvent::Retrying {
            message: message.into(),
            attempt,
            max_attempts,
            delay_ms,
        });
    }

    pub fn success(mut self, message: impl Into<String>, document_id: Option<Uuid>) {
        self.finish(ProgressEvent::Success {
            message: message.into(),
            document_id,
        });
    }

    pub fn failure(mut self, message: impl Into<String>, document_id: Option<Uuid>) {
        self.finish(ProgressEvent::Failure {
            message: message.into(),
            document_id,
        });
    }

    /// Whether the consumer is still receiving
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    /// Events handed to the channel so far
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::Relaxed)
    }

    fn finish(&mut self, event: ProgressEvent) {
        self.send(event);
        self.finished = true;
    }

    fn send(&self, event: ProgressEvent) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.send(event).is_err() {
            tracing::debug!("Progress consumer disconnected; continuing without it");
            self.connected.store(false, Ordering::Relaxed);
            return;
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ProgressStreamer {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Progress stream closed without a terminal event");
            self.finish(ProgressEvent::Failure {
                message: "processing ended unexpectedly".to_string(),
                document_id: None,
            });
        }
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.done = true;
                }
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for ProgressStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStream")
            .field("done", &self.done)
            .finish()
    }
}

//! Ordered buffer between the network producer and the turn consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use chatstream_core::packets::Packet;
use chatstream_core::source::PacketStream;

/// Unbounded FIFO with producer-set completion flags.
#[derive(Default)]
pub struct PacketQueue {
    packets: Mutex<VecDeque<Packet>>,
    complete: AtomicBool,
    error: Mutex<Option<String>>,
    notify: Notify,
}

/// Result of waiting on the queue.
#[derive(Debug)]
pub enum Next {
    Packet(Packet),
    /// Producer finished and every packet has been consumed.
    Drained,
    Cancelled,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: Packet) {
        self.packets.lock().push_back(packet);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Packet> {
        self.packets.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Terminal transport failure recorded by the producer, if any.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Mark the stream as ended. Must be called after the last `push`.
    pub fn finish(&self, error: Option<String>) {
        if let Some(e) = error {
            *self.error.lock() = Some(e);
        }
        self.complete.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Wait for the next packet without spinning. Cancellation is checked
    /// before every packet is handed out.
    pub async fn next(&self, cancel: &CancellationToken) -> Next {
        loop {
            if cancel.is_cancelled() {
                return Next::Cancelled;
            }
            if let Some(packet) = self.pop() {
                return Next::Packet(packet);
            }
            if self.is_complete() {
                // A push may have landed between the pop and the flag read.
                return match self.pop() {
                    Some(packet) => Next::Packet(packet),
                    None => Next::Drained,
                };
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return Next::Cancelled,
            }
        }
    }
}

/// Drive `stream` into `queue` on a background task until it ends, fails,
/// or `cancel` fires. The queue is always marked complete on exit.
pub fn spawn_producer(
    mut stream: PacketStream,
    queue: Arc<PacketQueue>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut error = None;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("stream aborted");
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(packet)) => queue.push(packet),
                    Some(Err(e)) if e.is_cancelled() => break,
                    Some(Err(e)) => {
                        debug!(error = %e, kind = e.error_kind(), "stream failed");
                        error = Some(e.to_string());
                        break;
                    }
                    None => break,
                },
            }
        }
        queue.finish(error);
    })
}

//! Priority interest queue.
//!
//! Outbound fetch requests are not expressed directly: producer-side code
//! enqueues them with a priority, and a single dedicated dispatcher task
//! drains the queue in priority order, issuing each request to the
//! network layer. This keeps interest pacing in one place and lets urgent
//! fetches (recovery, key frames) overtake bulk pipelining.
//!
//! Ordering is a max-heap over the priority value with FIFO order on
//! ties, via a monotonically increasing sequence number in the heap key.
//! The lock is held only for the push/pop critical section; expressing
//! the request to the transport happens outside it. When the queue is
//! empty the dispatcher parks on a [`Notify`] rather than spinning, and
//! is woken immediately by a new entry or by shutdown.
//!
//! Shutdown is cooperative: cancelling the token makes the dispatch loop
//! exit after draining its current wake-up. Requests already handed to
//! the network layer are not cancelled here; in-flight lifecycle is the
//! network layer's responsibility.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::stats::{FrequencyMeter, QueueStatistics};
use crate::transport::{Interest, NetworkTransport, OnData, OnTimeout};
use crate::{Result, RtcError};

/// One pending fetch request, owned by the queue until dispatch.
struct QueueEntry {
    interest: Interest,
    priority: u32,
    sequence: u64,
    enqueued_at: Instant,
    on_data: OnData,
    on_timeout: OnTimeout,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on priority; FIFO on equal priority.
        (self.priority, Reverse(self.sequence)).cmp(&(other.priority, Reverse(other.sequence)))
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    next_sequence: u64,
    dispatched: u64,
    meter: FrequencyMeter,
}

/// Thread-safe priority queue of pending fetch requests with a dedicated
/// dispatcher task.
///
/// Shared by many enqueueing tasks and exactly one dispatcher.
pub struct InterestQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    cancel: CancellationToken,
    transport: Arc<dyn NetworkTransport>,
}

impl InterestQueue {
    /// Create the queue and spawn its dispatcher task.
    ///
    /// The dispatcher runs until `cancel` fires. Must be called from
    /// within a tokio runtime.
    pub fn spawn(transport: Arc<dyn NetworkTransport>, cancel: CancellationToken) -> Arc<Self> {
        let queue = Arc::new(Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_sequence: 0,
                dispatched: 0,
                meter: FrequencyMeter::with_default_window(),
            }),
            notify: Notify::new(),
            cancel,
            transport,
        });

        let dispatcher = Arc::clone(&queue);
        tokio::spawn(async move {
            dispatcher.dispatch_loop().await;
        });

        queue
    }

    /// Append a request with the given priority.
    ///
    /// Callback ownership stays with the queue until dispatch, then
    /// transfers to the network layer. Fails once the channel is shut
    /// down.
    pub fn enqueue(
        &self,
        interest: Interest,
        priority: u32,
        on_data: OnData,
        on_timeout: OnTimeout,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RtcError::Shutdown);
        }

        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            inner.heap.push(QueueEntry {
                interest,
                priority,
                sequence,
                enqueued_at: Instant::now(),
                on_data,
                on_timeout,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Entries awaiting dispatch.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recent-window request-rate meter plus queue depth.
    pub fn statistics(&self) -> QueueStatistics {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        QueueStatistics {
            request_rate_hz: inner.meter.rate(),
            pending: inner.heap.len(),
            dispatched: inner.dispatched,
        }
    }

    async fn dispatch_loop(&self) {
        info!("interest dispatcher started");
        loop {
            let entry = {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                let entry = inner.heap.pop();
                if entry.is_some() {
                    inner.dispatched += 1;
                    inner.meter.tick();
                }
                entry
            };

            if let Some(entry) = entry {
                // Express outside the lock; the transport may block or
                // call back inline.
                trace!(
                    name = %entry.interest.name,
                    priority = entry.priority,
                    queued_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                    lifetime_ms = entry.interest.lifetime.as_millis() as u64,
                    "express"
                );
                self.transport
                    .express_request(entry.interest, entry.on_data, entry.on_timeout);
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.notify.notified() => {}
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }
        let pending = self.len();
        debug!(pending, "interest dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Transport double that records dispatch order.
    struct RecordingTransport {
        expressed: StdMutex<Vec<String>>,
        notify: Notify,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { expressed: StdMutex::new(Vec::new()), notify: Notify::new() })
        }

        fn names(&self) -> Vec<String> {
            self.expressed.lock().unwrap().clone()
        }

        async fn wait_for(&self, count: usize) {
            loop {
                if self.expressed.lock().unwrap().len() >= count {
                    return;
                }
                self.notify.notified().await;
            }
        }
    }

    impl NetworkTransport for RecordingTransport {
        fn express_request(&self, interest: Interest, _on_data: OnData, _on_timeout: OnTimeout) {
            self.expressed.lock().unwrap().push(interest.name);
            self.notify.notify_waiters();
        }

        fn publish_segment(&self, _name: &str, _segment: crate::packet::NetworkData) -> Result<()> {
            Ok(())
        }
    }

    fn noop_callbacks() -> (OnData, OnTimeout) {
        (Box::new(|_| {}), Box::new(|_| {}))
    }

    fn interest(name: &str) -> Interest {
        Interest::new(name, Duration::from_secs(4))
    }

    #[tokio::test]
    async fn drains_in_priority_order() {
        let transport = RecordingTransport::new();
        let cancel = CancellationToken::new();
        let queue = InterestQueue::spawn(transport.clone() as Arc<dyn NetworkTransport>, cancel.clone());

        // Load the queue before the dispatcher can drain: enqueue happens
        // synchronously, the dispatcher task has not been polled yet.
        for (name, priority) in [("p5", 5u32), ("p1", 1), ("p9", 9), ("p3", 3)] {
            let (on_data, on_timeout) = noop_callbacks();
            queue.enqueue(interest(name), priority, on_data, on_timeout).unwrap();
        }

        transport.wait_for(4).await;
        assert_eq!(transport.names(), vec!["p9", "p5", "p3", "p1"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn equal_priorities_dispatch_fifo() {
        let transport = RecordingTransport::new();
        let cancel = CancellationToken::new();
        let queue = InterestQueue::spawn(transport.clone() as Arc<dyn NetworkTransport>, cancel.clone());

        for name in ["a", "b", "c", "d"] {
            let (on_data, on_timeout) = noop_callbacks();
            queue.enqueue(interest(name), 7, on_data, on_timeout).unwrap();
        }

        transport.wait_for(4).await;
        assert_eq!(transport.names(), vec!["a", "b", "c", "d"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn empty_queue_blocks_until_enqueue() {
        let transport = RecordingTransport::new();
        let cancel = CancellationToken::new();
        let queue = InterestQueue::spawn(transport.clone() as Arc<dyn NetworkTransport>, cancel.clone());

        // Let the dispatcher reach its empty-queue wait.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.names().is_empty());

        let (on_data, on_timeout) = noop_callbacks();
        queue.enqueue(interest("late"), 1, on_data, on_timeout).unwrap();
        transport.wait_for(1).await;
        assert_eq!(transport.names(), vec!["late"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn shutdown_stops_dispatch_and_rejects_enqueue() {
        let transport = RecordingTransport::new();
        let cancel = CancellationToken::new();
        let queue = InterestQueue::spawn(transport.clone() as Arc<dyn NetworkTransport>, cancel.clone());

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (on_data, on_timeout) = noop_callbacks();
        assert!(matches!(
            queue.enqueue(interest("x"), 1, on_data, on_timeout),
            Err(RtcError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn statistics_report_rate_and_depth() {
        let transport = RecordingTransport::new();
        let cancel = CancellationToken::new();
        let queue = InterestQueue::spawn(transport.clone() as Arc<dyn NetworkTransport>, cancel.clone());

        for i in 0..5 {
            let (on_data, on_timeout) = noop_callbacks();
            queue.enqueue(interest(&format!("i{i}")), i, on_data, on_timeout).unwrap();
        }
        transport.wait_for(5).await;

        let stats = queue.statistics();
        assert_eq!(stats.dispatched, 5);
        assert_eq!(stats.pending, 0);
        assert!(stats.request_rate_hz > 0.0);
        cancel.cancel();
    }
}

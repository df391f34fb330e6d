//! Bounded asynchronous side-effect sink
//!
//! A fixed-capacity queue feeding one dedicated consumer thread. Producers on
//! the request path never wait: a full queue drops the new item.

use log::{debug, error, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::assets::SINK_FLUSH_POLL;
use crate::error::Result;

/// Outcome of handing an item to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSend {
    Queued,
    /// No room left; the item was dropped
    Full,
    /// The consumer is gone
    Closed,
}

impl SinkSend {
    pub fn is_queued(self) -> bool {
        matches!(self, SinkSend::Queued)
    }

    pub fn is_full(self) -> bool {
        matches!(self, SinkSend::Full)
    }

    pub fn is_closed(self) -> bool {
        matches!(self, SinkSend::Closed)
    }
}

/// Side effect performed by a sink consumer for each dequeued item
pub trait SinkHandler<T>: Send + 'static {
    fn handle(&mut self, item: T);
}

pub struct AsyncSink<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    pending: Arc<AtomicUsize>,
}

impl<T: Send + 'static> AsyncSink<T> {
    /// Start the consumer thread for `handler`
    pub fn spawn<H>(name: &'static str, capacity: usize, mut handler: H) -> Result<Self>
    where
        H: SinkHandler<T>,
    {
        let (tx, mut rx) = mpsc::channel::<T>(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let consumer_pending = Arc::clone(&pending);

        thread::Builder::new()
            .name(format!("{}-sink", name))
            .spawn(move || {
                debug!("{} sink: consumer started", name);
                // parks while empty, exits once every producer is gone
                while let Some(item) = rx.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(|| handler.handle(item))).is_err() {
                        error!("{} sink: handler panicked, item discarded", name);
                    }
                    consumer_pending.fetch_sub(1, Ordering::AcqRel);
                }
                debug!("{} sink: consumer stopped", name);
            })?;

        Ok(Self { name, tx, pending })
    }

    /// Queue an item without blocking; the item is dropped when the queue is full
    pub fn try_enqueue(&self, item: T) -> SinkSend {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let outcome = match self.tx.try_send(item) {
            Ok(()) => SinkSend::Queued,
            Err(TrySendError::Full(_)) => SinkSend::Full,
            Err(TrySendError::Closed(_)) => SinkSend::Closed,
        };
        self.settle(outcome)
    }

    /// Queue an item, waiting up to `timeout` for room
    ///
    /// For control items that must not be lost to a momentarily full queue.
    pub async fn enqueue(&self, item: T, timeout: Duration) -> SinkSend {
        self.pending.fetch_add(1, Ordering::AcqRel);
        let outcome = match tokio::time::timeout(timeout, self.tx.send(item)).await {
            Ok(Ok(())) => SinkSend::Queued,
            Ok(Err(_)) => SinkSend::Closed,
            Err(_) => SinkSend::Full,
        };
        self.settle(outcome)
    }

    fn settle(&self, outcome: SinkSend) -> SinkSend {
        if !outcome.is_queued() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        if outcome.is_closed() {
            warn!("{} sink: consumer closed", self.name);
        }
        outcome
    }

    /// Items queued or being handled
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until every queued item is handled, at most `timeout`
    ///
    /// Returns false when the deadline passed with work still pending.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                debug!("{} sink: flush timed out with {} pending", self.name, self.pending());
                return false;
            }
            tokio::time::sleep(SINK_FLUSH_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::mpsc as std_mpsc;

    struct Collect(Arc<Mutex<Vec<u32>>>);

    impl SinkHandler<u32> for Collect {
        fn handle(&mut self, item: u32) {
            self.0.lock().unwrap().push(item);
        }
    }

    /// Blocks on a gate before each item so the queue can be filled
    struct Gated {
        gate: std_mpsc::Receiver<()>,
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl SinkHandler<u32> for Gated {
        fn handle(&mut self, item: u32) {
            let _ = self.gate.recv();
            self.seen.lock().unwrap().push(item);
        }
    }

    struct Panicky;

    impl SinkHandler<u32> for Panicky {
        fn handle(&mut self, item: u32) {
            if item == 0 {
                panic!("boom");
            }
        }
    }

    #[tokio::test]
    async fn test_items_are_handled_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = AsyncSink::spawn("collect", 5, Collect(Arc::clone(&seen))).unwrap();

        for i in 0..3 {
            assert!(sink.try_enqueue(i).is_queued());
        }
        assert!(sink.flush(Duration::from_secs(2)).await);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(sink.pending(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_new_items() {
        let (gate_tx, gate_rx) = std_mpsc::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = AsyncSink::spawn(
            "gated",
            2,
            Gated {
                gate: gate_rx,
                seen: Arc::clone(&seen),
            },
        )
        .unwrap();

        // the consumer holds at most one item while blocked on the gate
        let results: Vec<SinkSend> = (0..6).map(|i| sink.try_enqueue(i)).collect();
        assert!(results.iter().any(|r| r.is_full()));
        let accepted = results.iter().filter(|r| r.is_queued()).count();
        assert!(accepted <= 3);
        assert_eq!(sink.pending(), accepted);

        // the flush deadline is advisory
        assert!(!sink.flush(Duration::from_millis(20)).await);

        for _ in 0..accepted {
            gate_tx.send(()).unwrap();
        }
        assert!(sink.flush(Duration::from_secs(2)).await);
        assert_eq!(seen.lock().unwrap().len(), accepted);
    }

    #[tokio::test]
    async fn test_enqueue_waits_for_room() {
        let (gate_tx, gate_rx) = std_mpsc::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = AsyncSink::spawn(
            "gated",
            1,
            Gated {
                gate: gate_rx,
                seen: Arc::clone(&seen),
            },
        )
        .unwrap();

        // the consumer takes one item and blocks on the gate, the next fills the queue
        let mut accepted = 0;
        for _ in 0..2 {
            while sink.try_enqueue(accepted).is_queued() {
                accepted += 1;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // no room and no progress: the wait gives up
        assert!(sink.enqueue(99, Duration::from_millis(20)).await.is_full());
        assert_eq!(sink.pending(), accepted as usize);

        let release = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            for _ in 0..=accepted {
                gate_tx.send(()).unwrap();
            }
        };
        let (outcome, ()) = tokio::join!(sink.enqueue(99, Duration::from_secs(2)), release);
        assert!(outcome.is_queued());

        assert!(sink.flush(Duration::from_secs(2)).await);
        assert_eq!(seen.lock().unwrap().last(), Some(&99));
    }

    #[tokio::test]
    async fn test_closed_consumer_is_reported() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        let closed = AsyncSink {
            name: "closed",
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
        };

        assert!(closed.try_enqueue(1).is_closed());
        assert!(closed.enqueue(1, Duration::from_millis(20)).await.is_closed());
        assert_eq!(closed.pending(), 0);
    }

    #[tokio::test]
    async fn test_handler_panic_keeps_consumer_alive() {
        let sink = AsyncSink::spawn("panicky", 5, Panicky).unwrap();

        assert!(sink.try_enqueue(0).is_queued());
        assert!(sink.try_enqueue(1).is_queued());
        assert!(sink.flush(Duration::from_secs(2)).await);
    }
}

//! Rate-limited batching queue.
//!
//! A `BatchQueue` collects items from synchronous callers and hands them to a
//! `BatchProcessor` in batches. One worker task per queue runs the cycle:
//!
//! 1. wait for the first item (unbounded),
//! 2. wait `delay` so more items can pile up,
//! 3. swap the pending buffer out and process it,
//! 4. wait `max(0, holdoff - delay)` before the next cycle.
//!
//! Every wait is cut short by `close()`, after which the worker flushes once
//! more if anything is pending and exits.

use std::cmp::Reverse;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::Result;

/// Items that can travel through a `BatchQueue`.
pub trait BatchItem: Send + 'static {
    /// Item queued in place of the first rejected one in a cycle.
    fn overflow_marker() -> Option<Self>
    where
        Self: Sized,
    {
        None
    }

    /// Batches are stably sorted by descending priority before processing.
    fn priority(&self) -> u8 {
        0
    }
}

/// Action invoked once per flush cycle.
#[async_trait]
pub trait BatchProcessor<T: Send + 'static>: Send + Sync {
    async fn process(&self, batch: Vec<T>, overflowed: bool) -> Result<()>;
}

/// Timing and capacity of a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchQueueConfig {
    /// Collection window after the first item of a cycle.
    pub delay: Duration,
    /// Minimum spacing between the starts of consecutive flushes.
    pub holdoff: Duration,
    /// Items accepted per cycle beyond the first one.
    pub queue_size: usize,
}

impl BatchQueueConfig {
    pub fn new(delay: Duration, holdoff: Duration, queue_size: usize) -> Self {
        Self {
            delay,
            holdoff,
            queue_size,
        }
    }

    /// Extra wait after a flush; the delay already counts toward the holdoff.
    pub fn holdoff_after_flush(&self) -> Duration {
        self.holdoff.saturating_sub(self.delay)
    }
}

impl Default for BatchQueueConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            holdoff: Duration::from_secs(5),
            queue_size: 10,
        }
    }
}

/// Worker state, exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Collecting,
    Flushing,
    HoldingOff,
    Stopped,
}

struct Pending<T> {
    items: Vec<T>,
    overflowed: bool,
    closed: bool,
    state: QueueState,
}

struct Shared<T> {
    name: String,
    queue_size: usize,
    pending: Mutex<Pending<T>>,
    wake: Notify,
    cancel: CancellationToken,
}

impl<T> Shared<T> {
    fn is_empty(&self) -> bool {
        self.pending.lock().items.is_empty()
    }

    fn set_state(&self, state: QueueState) {
        self.pending.lock().state = state;
    }

    /// Swap the buffer for an empty one and reset the overflow flag.
    fn take(&self) -> (Vec<T>, bool) {
        let mut pending = self.pending.lock();
        let items = std::mem::take(&mut pending.items);
        let overflowed = std::mem::replace(&mut pending.overflowed, false);
        (items, overflowed)
    }
}

/// Batching queue with a dedicated worker task.
pub struct BatchQueue<T: BatchItem> {
    shared: Arc<Shared<T>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: BatchItem> BatchQueue<T> {
    /// Start a queue and its worker. Must be called within a tokio runtime.
    pub fn spawn(
        name: impl Into<String>,
        config: BatchQueueConfig,
        processor: Arc<dyn BatchProcessor<T>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            queue_size: config.queue_size,
            pending: Mutex::new(Pending {
                items: Vec::new(),
                overflowed: false,
                closed: false,
                state: QueueState::Idle,
            }),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        });

        debug!(
            queue = %shared.name,
            delay = ?config.delay,
            holdoff = ?config.holdoff,
            queue_size = config.queue_size,
            "starting batch queue"
        );

        let handle = tokio::spawn(run_worker(Arc::clone(&shared), processor, config));

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue an item without waiting. Returns whether it was accepted.
    pub fn add(&self, item: T) -> bool {
        let mut pending = self.shared.pending.lock();
        if pending.closed {
            return false;
        }

        if pending.items.len() > self.shared.queue_size {
            if !pending.overflowed {
                pending.overflowed = true;
                if let Some(marker) = T::overflow_marker() {
                    pending.items.push(marker);
                }
                debug!(queue = %self.shared.name, "queue overflow");
            }
            return false;
        }

        pending.items.push(item);
        drop(pending);
        self.shared.wake.notify_one();
        true
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().items.len()
    }

    pub fn is_overflowed(&self) -> bool {
        self.shared.pending.lock().overflowed
    }

    pub fn state(&self) -> QueueState {
        self.shared.pending.lock().state
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// Items pending at this point are flushed once; later `add` calls are
    /// rejected.
    pub async fn close(&self) {
        self.shared.pending.lock().closed = true;
        self.shared.cancel.cancel();
        self.shared.wake.notify_one();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(queue = %self.shared.name, "batch queue worker ended abnormally: {}", e);
            }
        }
        debug!(queue = %self.shared.name, "batch queue closed");
    }

    /// Stop the worker without flushing. Pending items are discarded; an
    /// in-flight flush still completes.
    pub fn abort(&self) {
        let mut pending = self.shared.pending.lock();
        pending.closed = true;
        pending.overflowed = false;
        let discarded = std::mem::take(&mut pending.items).len();
        drop(pending);
        self.shared.cancel.cancel();
        debug!(queue = %self.shared.name, discarded, "batch queue aborted");
    }
}

impl<T: BatchItem> Drop for BatchQueue<T> {
    fn drop(&mut self) {
        self.shared.pending.lock().closed = true;
        self.shared.cancel.cancel();
    }
}

async fn run_worker<T: BatchItem>(
    shared: Arc<Shared<T>>,
    processor: Arc<dyn BatchProcessor<T>>,
    config: BatchQueueConfig,
) {
    let holdoff = config.holdoff_after_flush();
    let mut stopping = false;

    loop {
        if !stopping && shared.is_empty() {
            shared.set_state(QueueState::Idle);
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = shared.cancel.cancelled() => stopping = true,
            }
            // A wake-up stored while the worker was busy finds nothing new.
            if !stopping && shared.is_empty() {
                continue;
            }
        }

        if !stopping {
            shared.set_state(QueueState::Collecting);
            tokio::select! {
                _ = tokio::time::sleep(config.delay) => {}
                _ = shared.cancel.cancelled() => stopping = true,
            }
        }

        let (mut batch, overflowed) = shared.take();
        if batch.is_empty() {
            if stopping {
                break;
            }
            continue;
        }

        shared.set_state(QueueState::Flushing);
        batch.sort_by_key(|item| Reverse(item.priority()));
        let count = batch.len();

        match AssertUnwindSafe(processor.process(batch, overflowed))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => debug!(queue = %shared.name, count, overflowed, "flushed batch"),
            Ok(Err(e)) => error!(
                queue = %shared.name,
                "Failed to process {} items: {}", count, e
            ),
            Err(_) => error!(
                queue = %shared.name,
                "Processing of {} items panicked", count
            ),
        }

        if !stopping && !holdoff.is_zero() {
            shared.set_state(QueueState::HoldingOff);
            tokio::select! {
                _ = tokio::time::sleep(holdoff) => {}
                _ = shared.cancel.cancelled() => stopping = true,
            }
        }

        if stopping && shared.is_empty() {
            break;
        }
    }

    shared.set_state(QueueState::Stopped);
    debug!(queue = %shared.name, "batch queue worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::events::{AlarmEvent, AlarmReason};
    use tokio::time::{Instant, sleep};

    #[derive(Debug, Clone, PartialEq)]
    struct Item(u32);

    impl BatchItem for Item {}

    struct Recorder<T> {
        flushes: Mutex<Vec<(Instant, Vec<T>, bool)>>,
        fail: bool,
        panic: bool,
    }

    impl<T> Recorder<T> {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                flushes: Mutex::new(Vec::new()),
                fail: false,
                panic: false,
            })
        }

        fn failing(fail: bool, panic: bool) -> Arc<Self> {
            Arc::new(Self {
                flushes: Mutex::new(Vec::new()),
                fail,
                panic,
            })
        }

        fn count(&self) -> usize {
            self.flushes.lock().len()
        }
    }

    #[async_trait]
    impl<T: Send + Sync + 'static> BatchProcessor<T> for Recorder<T> {
        async fn process(&self, batch: Vec<T>, overflowed: bool) -> Result<()> {
            self.flushes.lock().push((Instant::now(), batch, overflowed));
            if self.panic {
                panic!("processor exploded");
            }
            if self.fail {
                return Err(crate::Error::transport("refused"));
            }
            Ok(())
        }
    }

    fn config(delay_ms: u64, holdoff_ms: u64, queue_size: usize) -> BatchQueueConfig {
        BatchQueueConfig::new(
            Duration::from_millis(delay_ms),
            Duration::from_millis(holdoff_ms),
            queue_size,
        )
    }

    #[test]
    fn test_holdoff_after_flush() {
        assert_eq!(
            config(1000, 5000, 1).holdoff_after_flush(),
            Duration::from_millis(4000)
        );
        assert_eq!(config(5000, 1000, 1).holdoff_after_flush(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_within_delay_window() {
        let recorder = Recorder::new();
        let queue = BatchQueue::spawn("test", config(1000, 1000, 10), recorder.clone());

        assert!(queue.add(Item(1)));
        sleep(Duration::from_millis(300)).await;
        assert!(queue.add(Item(2)));
        assert_eq!(recorder.count(), 0);

        sleep(Duration::from_millis(800)).await;
        {
            let flushes = recorder.flushes.lock();
            assert_eq!(flushes.len(), 1);
            assert_eq!(flushes[0].1, vec![Item(1), Item(2)]);
            assert!(!flushes[0].2);
        }
        queue.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_marks_once_then_drops() {
        let recorder = Recorder::new();
        let queue = BatchQueue::spawn("test", config(1000, 1000, 3), recorder.clone());

        for _ in 0..4 {
            assert!(queue.add(AlarmEvent::internal(AlarmReason::Cleared)));
        }
        assert!(!queue.add(AlarmEvent::internal(AlarmReason::Cleared)));
        assert!(queue.is_overflowed());
        assert_eq!(queue.pending_len(), 5);
        for _ in 0..10 {
            assert!(!queue.add(AlarmEvent::internal(AlarmReason::Cleared)));
        }
        assert_eq!(queue.pending_len(), 5);

        sleep(Duration::from_millis(1100)).await;
        {
            let flushes = recorder.flushes.lock();
            assert_eq!(flushes.len(), 1);
            let (_, batch, overflowed) = &flushes[0];
            assert!(*overflowed);
            assert_eq!(batch.len(), 5);
            assert_eq!(batch[0].reason(), AlarmReason::QueueOverflow);
            assert_eq!(
                batch
                    .iter()
                    .filter(|e| e.reason() == AlarmReason::QueueOverflow)
                    .count(),
                1
            );
        }

        // Drained: the flag is reset and new items are accepted.
        assert!(!queue.is_overflowed());
        assert!(queue.add(AlarmEvent::internal(AlarmReason::Cleared)));
        queue.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_without_marker() {
        let recorder = Recorder::new();
        let queue = BatchQueue::spawn("test", config(1000, 1000, 1), recorder.clone());

        assert!(queue.add(Item(1)));
        assert!(queue.add(Item(2)));
        assert!(!queue.add(Item(3)));
        assert_eq!(queue.pending_len(), 2);

        sleep(Duration::from_millis(1100)).await;
        let flushes = recorder.flushes.lock();
        assert_eq!(flushes[0].1, vec![Item(1), Item(2)]);
        assert!(flushes[0].2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_sorted_by_descending_priority() {
        let recorder = Recorder::new();
        let queue = BatchQueue::spawn("test", config(1000, 1000, 10), recorder.clone());

        queue.add(AlarmEvent::internal(AlarmReason::Cleared));
        queue.add(AlarmEvent::internal(AlarmReason::SeverityIncreased));
        queue.add(AlarmEvent::internal(AlarmReason::Disconnected));

        sleep(Duration::from_millis(1100)).await;
        let flushes = recorder.flushes.lock();
        let order: Vec<AlarmReason> = flushes[0].1.iter().map(AlarmEvent::reason).collect();
        assert_eq!(
            order,
            vec![
                AlarmReason::Disconnected,
                AlarmReason::SeverityIncreased,
                AlarmReason::Cleared,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_holdoff_spaces_flushes() {
        let recorder = Recorder::new();
        let queue = BatchQueue::spawn("test", config(1000, 5000, 10), recorder.clone());

        queue.add(Item(1));
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(recorder.count(), 1);

        // Arrives during the holdoff window.
        queue.add(Item(2));
        sleep(Duration::from_millis(2000)).await;
        assert_eq!(recorder.count(), 1);

        sleep(Duration::from_millis(4000)).await;
        let flushes = recorder.flushes.lock();
        assert_eq!(flushes.len(), 2);
        assert!(flushes[1].0 - flushes[0].0 >= Duration::from_millis(5000));
        assert_eq!(flushes[1].1, vec![Item(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_pending_once() {
        let recorder = Recorder::new();
        let queue = BatchQueue::spawn("test", config(60_000, 60_000, 10), recorder.clone());

        queue.add(Item(1));
        queue.add(Item(2));
        queue.add(Item(3));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.state(), QueueState::Collecting);

        queue.close().await;
        let flushes = recorder.flushes.lock();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].1, vec![Item(1), Item(2), Item(3)]);
        assert_eq!(queue.state(), QueueState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_idle_and_reject_after() {
        let recorder = Recorder::new();
        let queue = BatchQueue::spawn("test", config(1000, 1000, 10), recorder.clone());
        sleep(Duration::from_millis(10)).await;

        queue.close().await;
        assert_eq!(recorder.count(), 0);
        assert!(!queue.add(Item(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_holdoff_flushes_late_items() {
        let recorder = Recorder::new();
        let queue = BatchQueue::spawn("test", config(1000, 60_000, 10), recorder.clone());

        queue.add(Item(1));
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(queue.state(), QueueState::HoldingOff);
        queue.add(Item(2));

        queue.close().await;
        let flushes = recorder.flushes.lock();
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[1].1, vec![Item(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_after_flush_despite_early_add() {
        let recorder = Recorder::new();
        let queue = BatchQueue::spawn("test", config(5000, 5000, 10), recorder.clone());

        // Added before the worker first waits for work.
        assert!(queue.add(Item(1)));
        sleep(Duration::from_millis(6000)).await;
        assert_eq!(recorder.count(), 1);
        assert_eq!(queue.state(), QueueState::Idle);

        // The next item still gets a full delay.
        assert!(queue.add(Item(2)));
        sleep(Duration::from_millis(4000)).await;
        assert_eq!(recorder.count(), 1);
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(recorder.count(), 2);
        queue.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_discards_pending() {
        let recorder = Recorder::new();
        let queue = BatchQueue::spawn("test", config(1000, 1000, 10), recorder.clone());

        assert!(queue.add(Item(1)));
        queue.abort();
        assert_eq!(queue.pending_len(), 0);
        assert!(!queue.add(Item(2)));

        sleep(Duration::from_millis(2000)).await;
        assert_eq!(recorder.count(), 0);
        assert_eq!(queue.state(), QueueState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_worker() {
        for (fail, panic) in [(true, false), (false, true)] {
            let recorder = Recorder::failing(fail, panic);
            let queue = BatchQueue::spawn("test", config(100, 100, 10), recorder.clone());

            queue.add(Item(1));
            sleep(Duration::from_millis(150)).await;
            queue.add(Item(2));
            sleep(Duration::from_millis(150)).await;

            let flushes = recorder.flushes.lock();
            assert_eq!(flushes.len(), 2);
            assert_eq!(flushes[1].1, vec![Item(2)]);
            drop(flushes);
            queue.close().await;
        }
    }
}

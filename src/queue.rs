use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::pipeline::{ItemOutcome, Processor, WorkItem};
use crate::status::{ItemStatus, StatusTracker};

/// How often the worker loop re-checks the pause flag and the queue head.
/// Bounds stop/pause latency well under a second.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct QueueInner {
    pending: Mutex<VecDeque<WorkItem>>,
    paused: AtomicBool,
    /// Set by `stop()`; an item mid-attempt finishes that attempt, then
    /// terminates instead of retrying.
    cancel: AtomicBool,
    inflight: AtomicUsize,
    started: AtomicBool,
    processor: Arc<Processor>,
    tracker: StatusTracker,
    workers: usize,
}

/// FIFO work queue with a background worker per concurrency slot
/// (one by default — rate limits make parallel submission counter-productive).
///
/// Mutation discipline: callers touch the queue only through
/// `enqueue`/`requeue`/`remove`/`stop`; in-flight status is mutated only by
/// the worker, via the processor.
#[derive(Clone)]
pub struct ProcessingQueue {
    inner: Arc<QueueInner>,
}

impl ProcessingQueue {
    pub fn new(processor: Arc<Processor>, tracker: StatusTracker, workers: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(VecDeque::new()),
                paused: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                inflight: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                processor,
                tracker,
                workers: workers.max(1),
            }),
        }
    }

    /// Spawn the worker task(s). Idempotent; requires a tokio runtime.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for _ in 0..self.inner.workers {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(worker_loop(inner));
        }
    }

    /// Add a file to the tail of the queue.
    ///
    /// Rejected (logged, `false`) when the path is already tracked — queued,
    /// in flight, or finished and not yet cleared.
    pub fn enqueue(&self, item: WorkItem) -> bool {
        if !self.inner.tracker.insert_pending(&item.path) {
            log::info!("already queued or processed, skipping: {}", item.path.display());
            return false;
        }
        self.inner.pending.lock().unwrap().push_back(item);
        self.inner.tracker.queue_changed();
        true
    }

    /// Re-enqueue a file for a manual retry with a fresh budget. Any queued
    /// instance of the same path is removed first, so a path never has two
    /// live work items; the record resets to pending and the item goes to
    /// the tail.
    pub fn requeue(&self, item: WorkItem) {
        {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.retain(|queued| queued.path != item.path);
            self.inner
                .tracker
                .set_status(&item.path, ItemStatus::Pending);
            pending.push_back(item);
        }
        self.inner.tracker.queue_changed();
    }

    /// Drop a file from the queue and from the tracked (dedup) set.
    pub fn remove(&self, path: &Path) {
        self.inner
            .pending
            .lock()
            .unwrap()
            .retain(|queued| queued.path != path);
        self.inner.tracker.remove(path);
        self.inner.tracker.queue_changed();
    }

    /// Stop pulling new items; queued items stay put.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        self.inner.tracker.log("processing paused");
    }

    pub fn resume(&self) {
        self.inner.cancel.store(false, Ordering::SeqCst);
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.tracker.log("processing resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Drain all pending items immediately and pause the worker. The item in
    /// flight, if any, finishes its current attempt and then terminates.
    /// Safe to call repeatedly.
    pub fn stop(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        self.inner.cancel.store(true, Ordering::SeqCst);
        let dropped = {
            let mut pending = self.inner.pending.lock().unwrap();
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            self.inner
                .tracker
                .log(format!("queue stopped, {dropped} pending item(s) dropped"));
        }
        self.inner.tracker.queue_changed();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Paths currently queued, head first.
    pub fn queued_paths(&self) -> Vec<PathBuf> {
        self.inner
            .pending
            .lock()
            .unwrap()
            .iter()
            .map(|item| item.path.clone())
            .collect()
    }

    /// Wait until nothing is queued (or the queue is paused) and nothing is
    /// in flight.
    pub async fn wait_for_idle(&self) {
        loop {
            let pending_done =
                self.inner.pending.lock().unwrap().is_empty() || self.is_paused();
            if pending_done && self.inner.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

async fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        if inner.paused.load(Ordering::SeqCst) {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }

        let item = inner.pending.lock().unwrap().pop_front();
        let Some(item) = item else {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        };

        inner.inflight.fetch_add(1, Ordering::SeqCst);
        let outcome = inner.processor.process_item(&item, &inner.cancel).await;
        inner.inflight.fetch_sub(1, Ordering::SeqCst);

        if let ItemOutcome::Exhausted = outcome {
            // further items would fail identically; halt the whole queue
            inner.tracker.log("all credentials exhausted, stopping the queue");
            inner.paused.store(true, Ordering::SeqCst);
            inner.cancel.store(true, Ordering::SeqCst);
            let mut pending = inner.pending.lock().unwrap();
            pending.clear();
        }

        // refresh the queue view after every item, whatever the outcome
        inner.tracker.queue_changed();
    }
}

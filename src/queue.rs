//! Two-stage work queue: `collection` and `matching`, each with priority,
//! retry/backoff, a per-job timeout, and stalled-job detection.
//!
//! A real KV-backed work queue is out of scope; this is the in-process
//! queue the engine runs against, built so its externally observable
//! behavior (ordering is best-effort, retries exhaust before failing,
//! `.finished()` can time out while the job keeps running) matches what a
//! KV-backed queue would produce for a single instance.

use futures::future::BoxFuture;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify, Semaphore};

use crate::clock::Clock;
use crate::error::EngineError;

pub type ProcessorFn<T, R> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<R, EngineError>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Stalled,
}

#[derive(Debug, Clone)]
pub struct EnqueueOpts {
    /// Lower value wins when a worker is free.
    pub priority: u8,
    pub attempts: u32,
    pub backoff_base_ms: u64,
    pub job_timeout: Duration,
    pub max_stalled_count: u32,
}

impl Default for EnqueueOpts {
    fn default() -> Self {
        Self {
            priority: 2,
            attempts: 3,
            backoff_base_ms: 500,
            job_timeout: Duration::from_secs(60),
            max_stalled_count: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueueEvent<R> {
    Completed(u64, R),
    Failed(u64, String),
    Stalled(u64),
}

struct HeapItem<T, R> {
    id: u64,
    priority: u8,
    seq: u64,
    payload: T,
    opts: EnqueueOpts,
    attempts_left: u32,
    stalls_left: u32,
    enqueued_at: u64,
    state: Arc<Mutex<JobState>>,
    result_tx: Option<oneshot::Sender<Result<R, EngineError>>>,
}

impl<T, R> PartialEq for HeapItem<T, R> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl<T, R> Eq for HeapItem<T, R> {}
impl<T, R> PartialOrd for HeapItem<T, R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T, R> Ord for HeapItem<T, R> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; lower priority value must win, and
        // within equal priority, earlier-enqueued (lower seq) wins, so we
        // invert both comparisons.
        other.priority.cmp(&self.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct JobHandle<R> {
    rx: oneshot::Receiver<Result<R, EngineError>>,
    state: Arc<Mutex<JobState>>,
}

impl<R> JobHandle<R> {
    pub async fn finished(self) -> Result<R, EngineError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Transient("queue worker dropped the job".into())),
        }
    }

    pub fn get_state(&self) -> JobState {
        *self.state.lock().expect("job state lock poisoned")
    }
}

/// Races `.finished()` against a client-side deadline: when the timer wins
/// the caller sees `Timeout`, but the job may still complete on
/// the worker (the queue doesn't know or care that the caller stopped
/// waiting).
pub async fn finished_with_timeout<R: Send + 'static>(
    handle: JobHandle<R>,
    timeout: Duration,
) -> Result<R, EngineError> {
    match tokio::time::timeout(timeout, handle.finished()).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(timeout)),
    }
}

struct QueueInner<T, R> {
    heap: Mutex<BinaryHeap<HeapItem<T, R>>>,
    notify: Notify,
    processor: ProcessorFn<T, R>,
    events: broadcast::Sender<QueueEvent<R>>,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
    active: AtomicU64,
}

/// Snapshot used by the control surface's `diagnostics()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: u64,
    /// Age, in seconds, of the longest-waiting queued job. `None` when empty.
    pub oldest_waiting_secs: Option<u64>,
}

/// One named priority queue (`collection` or `matching`).
pub struct Queue<T, R> {
    inner: Arc<QueueInner<T, R>>,
}

impl<T, R> Clone for Queue<T, R> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, R> Queue<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub fn new(clock: Arc<dyn Clock>, concurrency: usize, processor: ProcessorFn<T, R>) -> Self {
        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(QueueInner {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            processor,
            events,
            seq: AtomicU64::new(0),
            clock,
            active: AtomicU64::new(0),
        });

        for _ in 0..concurrency.max(1) {
            let inner = inner.clone();
            tokio::spawn(async move {
                worker_loop(inner).await;
            });
        }

        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent<R>> {
        self.inner.events.subscribe()
    }

    /// Snapshot of queue depth, in-flight count, and the longest-waiting
    /// job's age, for `diagnostics()`.
    pub fn stats(&self) -> QueueStats {
        let now = self.inner.clock.now_unix();
        let heap = self.inner.heap.lock().expect("queue heap lock poisoned");
        let oldest_waiting_secs = heap.iter().map(|item| now.saturating_sub(item.enqueued_at)).max();
        QueueStats {
            waiting: heap.len(),
            active: self.inner.active.load(AtomicOrdering::SeqCst),
            oldest_waiting_secs,
        }
    }

    pub fn enqueue(&self, payload: T, opts: EnqueueOpts) -> JobHandle<R> {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.seq.fetch_add(1, AtomicOrdering::SeqCst);
        let state = Arc::new(Mutex::new(JobState::Waiting));

        let item = HeapItem {
            id,
            priority: opts.priority,
            seq: id,
            payload,
            attempts_left: opts.attempts.max(1),
            stalls_left: opts.max_stalled_count,
            enqueued_at: self.inner.clock.now_unix(),
            opts,
            state: state.clone(),
            result_tx: Some(tx),
        };

        self.inner.heap.lock().expect("queue heap lock poisoned").push(item);
        self.inner.notify.notify_one();

        JobHandle { rx, state }
    }
}

async fn worker_loop<T, R>(inner: Arc<QueueInner<T, R>>)
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    loop {
        let item = {
            let mut heap = inner.heap.lock().expect("queue heap lock poisoned");
            heap.pop()
        };

        let Some(mut item) = item else {
            inner.notify.notified().await;
            continue;
        };

        *item.state.lock().expect("job state lock poisoned") = JobState::Active;

        inner.active.fetch_add(1, AtomicOrdering::SeqCst);
        let fut = (inner.processor)(item.payload.clone());
        let outcome = tokio::time::timeout(item.opts.job_timeout, fut).await;
        inner.active.fetch_sub(1, AtomicOrdering::SeqCst);

        match outcome {
            Ok(Ok(value)) => {
                *item.state.lock().expect("job state lock poisoned") = JobState::Completed;
                let _ = inner.events.send(QueueEvent::Completed(item.id, value.clone()));
                if let Some(tx) = item.result_tx.take() {
                    let _ = tx.send(Ok(value));
                }
            }
            Ok(Err(err)) if err.retriable() && item.attempts_left > 1 => {
                requeue_with_backoff(&inner, item, err).await;
            }
            Ok(Err(err)) => {
                fail_job(&inner, item, err.to_string());
            }
            Err(_elapsed) => {
                // Job ran past its timeout: treat it as a stall. Retried up
                // to max_stalled_count before being treated as a normal
                // failure, standing in for heartbeat-based stall detection
                // against a processor we can't introspect.
                let _ = inner.events.send(QueueEvent::Stalled(item.id));
                if item.stalls_left > 0 {
                    item.stalls_left -= 1;
                    let err = EngineError::Timeout(item.opts.job_timeout);
                    requeue_with_backoff(&inner, item, err).await;
                } else {
                    fail_job(&inner, item, "job stalled repeatedly past its timeout".to_string());
                }
            }
        }
    }
}

async fn requeue_with_backoff<T, R>(inner: &Arc<QueueInner<T, R>>, mut item: HeapItem<T, R>, err: EngineError)
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    item.attempts_left -= 1;
    let attempt_number = item.opts.attempts - item.attempts_left;
    let delay_ms = item.opts.backoff_base_ms.saturating_mul(1u64 << attempt_number.min(16));
    tracing::debug!(job_id = item.id, attempt_number, delay_ms, error = %err, "retrying job after backoff");

    *item.state.lock().expect("job state lock poisoned") = JobState::Waiting;
    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        inner.heap.lock().expect("queue heap lock poisoned").push(item);
        inner.notify.notify_one();
    });
}

fn fail_job<T, R>(inner: &Arc<QueueInner<T, R>>, mut item: HeapItem<T, R>, reason: String)
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    *item.state.lock().expect("job state lock poisoned") = JobState::Failed;
    let _ = inner.events.send(QueueEvent::Failed(item.id, reason.clone()));
    if let Some(tx) = item.result_tx.take() {
        let _ = tx.send(Err(EngineError::Transient(reason)));
    }
}

/// Fallback gate used when the queue substrate itself is unreachable:
/// direct in-process execution bounded by two semaphores instead of the
/// priority queue. Preserves rate discipline (still bounded concurrency)
/// but loses cross-instance fairness and priority ordering.
pub struct FallbackGate {
    pub collection: Arc<Semaphore>,
    pub llm: Arc<Semaphore>,
}

impl FallbackGate {
    pub fn new(collection_capacity: usize, llm_capacity: usize) -> Self {
        Self {
            collection: Arc::new(Semaphore::new(collection_capacity)),
            llm: Arc::new(Semaphore::new(llm_capacity)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::sync::atomic::AtomicUsize;

    fn processor_counting(calls: Arc<AtomicUsize>, fail_times: usize) -> ProcessorFn<i32, i32> {
        Arc::new(move |payload: i32| {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, AtomicOrdering::SeqCst);
                if n < fail_times {
                    Err(EngineError::Transient("induced failure".into()))
                } else {
                    Ok(payload * 2)
                }
            })
        })
    }

    #[tokio::test]
    async fn priority_ordering_is_respected_when_a_single_worker_is_free() {
        let clock = Arc::new(FakeClock::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let processor: ProcessorFn<i32, i32> = Arc::new(move |payload: i32| {
            let order = order_clone.clone();
            Box::pin(async move {
                order.lock().unwrap().push(payload);
                Ok(payload)
            })
        });
        let queue: Queue<i32, i32> = Queue::new(clock, 1, processor);

        // Enqueue out of priority order; priority 1 beats priority 3.
        let low = queue.enqueue(100, EnqueueOpts { priority: 3, ..Default::default() });
        let high = queue.enqueue(1, EnqueueOpts { priority: 1, ..Default::default() });

        assert_eq!(high.finished().await.unwrap(), 1);
        assert_eq!(low.finished().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn retries_up_to_attempts_then_succeeds() {
        let clock = Arc::new(FakeClock::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let processor = processor_counting(calls.clone(), 2);
        let queue: Queue<i32, i32> = Queue::new(clock, 2, processor);

        let handle = queue.enqueue(
            21,
            EnqueueOpts {
                attempts: 5,
                backoff_base_ms: 1,
                ..Default::default()
            },
        );
        assert_eq!(handle.finished().await.unwrap(), 42);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_attempts_surfaces_as_a_failure() {
        let clock = Arc::new(FakeClock::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let processor = processor_counting(calls.clone(), 100);
        let queue: Queue<i32, i32> = Queue::new(clock, 1, processor);

        let handle = queue.enqueue(
            1,
            EnqueueOpts {
                attempts: 3,
                backoff_base_ms: 1,
                ..Default::default()
            },
        );
        assert!(handle.finished().await.is_err());
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stats_reports_waiting_depth() {
        let clock = Arc::new(FakeClock::new(0));
        let (gate_tx, _gate_rx) = tokio::sync::watch::channel(false);
        let processor: ProcessorFn<i32, i32> = Arc::new(move |payload: i32| {
            let mut gate_rx = gate_tx.subscribe();
            Box::pin(async move {
                let _ = gate_rx.changed().await;
                Ok(payload)
            })
        });
        let queue: Queue<i32, i32> = Queue::new(clock.clone(), 1, processor);

        let _held = queue.enqueue(1, EnqueueOpts::default());
        let _waiting = queue.enqueue(2, EnqueueOpts::default());
        tokio::task::yield_now().await;
        clock.advance(5);

        let stats = queue.stats();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.oldest_waiting_secs, Some(5));
    }

    #[tokio::test]
    async fn stats_reports_no_oldest_waiting_when_queue_is_empty() {
        let clock = Arc::new(FakeClock::new(0));
        let processor: ProcessorFn<i32, i32> = Arc::new(|payload: i32| Box::pin(async move { Ok(payload) }));
        let queue: Queue<i32, i32> = Queue::new(clock, 1, processor);

        tokio::task::yield_now().await;
        assert_eq!(queue.stats().oldest_waiting_secs, None);
    }

    #[tokio::test]
    async fn client_side_timeout_fires_while_job_keeps_running() {
        let clock = Arc::new(FakeClock::new(0));
        let processor: ProcessorFn<i32, i32> = Arc::new(|payload: i32| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(payload)
            })
        });
        let queue: Queue<i32, i32> = Queue::new(
            clock,
            1,
            processor,
        );
        let handle = queue.enqueue(
            7,
            EnqueueOpts {
                job_timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );

        let result = finished_with_timeout(handle, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }
}

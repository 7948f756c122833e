//! Per-file operation queue
//!
//! Tasks run one at a time in submission order on a drain task spawned onto
//! the Tokio runtime. A task that fails or panics never blocks the ones behind
//! it.

use crate::error::{Result, StorageError};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, warn};

type BoxedRun = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Job {
    id: u64,
    started: Arc<AtomicBool>,
    run: Box<dyn FnOnce() -> BoxedRun + Send>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    /// A drain task exists
    running: bool,
    /// A job is executing right now
    executing: bool,
    paused: bool,
    cleared: bool,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    next_id: AtomicU64,
    /// Signalled whenever the drain task exits
    idle: Notify,
    /// Signalled whenever a job settles
    settled: Notify,
    stall_threshold: Option<Duration>,
}

/// Concurrency-1 FIFO task runner
///
/// Cloning yields another reference to the same queue.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<QueueInner>,
}

/// Result of a queued task
///
/// The task is already enqueued when this value is created; dropping it does
/// not cancel the task.
#[must_use = "the task runs regardless, but its result is lost"]
pub struct TaskFuture<T> {
    rx: Option<oneshot::Receiver<Result<T>>>,
    started: Arc<AtomicBool>,
}

impl<T> TaskFuture<T> {
    fn rejected() -> Self {
        TaskFuture {
            rx: None,
            started: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<T> Future for TaskFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(StorageError::QueueCleared));
        };

        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The sender was dropped: either before the job started (cleared)
            // or while it was unwinding
            Poll::Ready(Err(_)) if this.started.load(Ordering::SeqCst) => {
                Poll::Ready(Err(StorageError::TaskAborted))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(StorageError::QueueCleared)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl OperationQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_stall_threshold(name, None)
    }

    /// Queue whose tasks log a warning each time they run longer than `threshold`
    pub fn with_stall_threshold(name: impl Into<String>, threshold: Option<Duration>) -> Self {
        OperationQueue {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                next_id: AtomicU64::new(1),
                idle: Notify::new(),
                settled: Notify::new(),
                stall_threshold: threshold,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue `task` and return a future of its result
    ///
    /// The task is placed in the queue before this returns. On a cleared
    /// queue the task is dropped and the future resolves to `QueueCleared`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn add_task<F, Fut, T>(&self, task: F) -> TaskFuture<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let started = Arc::new(AtomicBool::new(false));
        let job = Job {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            started: Arc::clone(&started),
            run: Box::new(move || {
                Box::pin(async move {
                    let _ = tx.send(task().await);
                }) as BoxedRun
            }),
        };

        {
            let mut state = self.inner.state.lock();
            if state.cleared {
                debug!("Queue {} is cleared, rejecting task {}", self.inner.name, job.id);
                return TaskFuture::rejected();
            }
            state.pending.push_back(job);
        }
        self.kick();

        TaskFuture {
            rx: Some(rx),
            started,
        }
    }

    /// Stop starting new tasks; the executing task runs to completion
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.inner.state.lock().paused = false;
        self.kick();
    }

    /// Drop every task not yet started and reject further submissions until [`reset`](Self::reset)
    pub fn clear(&self) {
        let dropped: Vec<Job> = {
            let mut state = self.inner.state.lock();
            state.cleared = true;
            state.pending.drain(..).collect()
        };
        if !dropped.is_empty() {
            debug!(
                "Cleared {} pending task(s) from queue {}",
                dropped.len(),
                self.inner.name
            );
        }
        // Dropping the jobs drops their senders outside the lock
        drop(dropped);
        self.inner.idle.notify_waiters();
    }

    /// Accept submissions again after [`clear`](Self::clear), unpausing as well
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.lock();
            state.cleared = false;
            state.paused = false;
        }
        self.kick();
    }

    /// Wait until no task is executing and none can start
    ///
    /// Returns with tasks still pending when the queue is paused.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock();
                if !state.running && (state.pending.is_empty() || state.paused) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Wait for the executing task, if any, to settle
    pub async fn wait_current(&self) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.inner.state.lock().executing {
                return;
            }
            notified.await;
        }
    }

    /// Run `f` only while the queue is paused with nothing executing
    ///
    /// The check and `f` happen under the queue lock, so no task can start in
    /// between. Returns whether `f` ran.
    pub fn run_while_paused<F: FnOnce()>(&self, f: F) -> bool {
        let state = self.inner.state.lock();
        if state.paused && !state.executing {
            f();
            true
        } else {
            false
        }
    }

    /// Number of tasks waiting to start
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().pending.is_empty()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    pub fn is_executing(&self) -> bool {
        self.inner.state.lock().executing
    }

    pub fn is_cleared(&self) -> bool {
        self.inner.state.lock().cleared
    }

    fn kick(&self) {
        let job = {
            let mut state = self.inner.state.lock();
            if state.running || state.paused {
                return;
            }
            match state.pending.pop_front() {
                Some(job) => {
                    state.running = true;
                    state.executing = true;
                    job
                }
                None => return,
            }
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drain(job).await });
    }
}

impl QueueInner {
    async fn drain(self: Arc<Self>, first: Job) {
        let mut next = Some(first);
        while let Some(job) = next {
            self.run_job(job).await;

            next = {
                let mut state = self.state.lock();
                let job = if state.paused {
                    None
                } else {
                    state.pending.pop_front()
                };
                state.executing = job.is_some();
                if job.is_none() {
                    state.running = false;
                }
                job
            };
            self.settled.notify_waiters();
        }
        self.idle.notify_waiters();
    }

    async fn run_job(&self, job: Job) {
        let Job { id, started, run } = job;
        started.store(true, Ordering::SeqCst);

        let fut = AssertUnwindSafe(run()).catch_unwind();
        tokio::pin!(fut);

        let outcome = match self.stall_threshold {
            None => fut.await,
            Some(threshold) => {
                let began = Instant::now();
                loop {
                    match tokio::time::timeout(threshold, &mut fut).await {
                        Ok(outcome) => break outcome,
                        Err(_) => warn!(
                            "Task {} on queue {} has been running for {:?}",
                            id,
                            self.name,
                            began.elapsed()
                        ),
                    }
                }
            }
        };

        if outcome.is_err() {
            error!("Task {} on queue {} panicked", id, self.name);
        }
    }
}

//! Coalesces jobs enqueued in the same scheduling turn into bounded batches.
//!
//! The first `enqueue` of an idle batcher spawns a drain cycle. The cycle yields
//! once before cutting any batch, so every job enqueued by call sites running in
//! the same turn lands in the same batch. It then drains the queue into chunks of
//! at most `batch_size_limit` jobs and executes them one after another until the
//! queue is empty. Jobs enqueued while a chunk executes are picked up by the same
//! cycle.
//!
//! On the multi-threaded runtime the drain task may start on another worker
//! while the enqueuing task is still running, so a yield alone does not mark
//! the end of its turn. There the cycle waits at least
//! [`MULTI_THREAD_MIN_WINDOW`] before cutting a batch. A non-zero
//! `batch_window` widens the coalescing window on either runtime.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error};

use crate::error::SceneError;
use crate::trace::report_event;

/// Shortest coalescing window on the multi-threaded runtime.
pub const MULTI_THREAD_MIN_WINDOW: Duration = Duration::from_millis(2);

/// Future returned by a batch-execute function.
pub type BatchFuture = BoxFuture<'static, Result<(), SceneError>>;

type BatchExecute<T> = dyn Fn(Vec<T>) -> BatchFuture + Send + Sync;

/// Best-effort in-memory job coalescer. Nothing is persisted.
pub struct JobBatcher<T> {
    inner: Arc<BatcherInner<T>>,
}

struct BatcherInner<T> {
    batch_size_limit: usize,
    batch_window: Duration,
    batch_execute: Box<BatchExecute<T>>,
    state: Mutex<QueueState<T>>,
}

struct QueueState<T> {
    pending: VecDeque<T>,
    draining: bool,
}

impl<T> Clone for JobBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> JobBatcher<T> {
    /// Create a batcher.
    ///
    /// A `batch_size_limit` of 0 is treated as 1. Failures of `batch_execute`,
    /// returned or panicked, are reported and never reach the enqueuing caller:
    /// the function is responsible for settling its own jobs.
    pub fn new<F>(batch_size_limit: usize, batch_window: Duration, batch_execute: F) -> Self
    where
        F: Fn(Vec<T>) -> BatchFuture + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(BatcherInner {
                batch_size_limit: batch_size_limit.max(1),
                batch_window,
                batch_execute: Box::new(batch_execute),
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    /// Queue `job`, starting a drain cycle when none is running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, job: T) {
        let start = {
            let mut state = self.inner.state.lock();
            state.pending.push_back(job);
            !std::mem::replace(&mut state.draining, true)
        };
        if start {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.drain());
        }
    }

    /// Number of jobs waiting for the next batch.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining
    }
}

impl<T: Send + 'static> BatcherInner<T> {
    async fn drain(self: Arc<Self>) {
        tokio::task::yield_now().await;
        let window = coalescing_window(self.batch_window, Handle::current().runtime_flavor());
        if !window.is_zero() {
            tokio::time::sleep(window).await;
        }
        loop {
            let jobs: Vec<T> = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    // Cleared under the same lock as the check so a concurrent
                    // enqueue either lands in this cycle or starts a new one.
                    state.draining = false;
                    return;
                }
                state.pending.drain(..).collect()
            };
            for chunk in into_chunks(jobs, self.batch_size_limit) {
                self.execute_chunk(chunk).await;
            }
        }
    }

    async fn execute_chunk(&self, chunk: Vec<T>) {
        let size = chunk.len();
        debug!(batch_size = size, "Executing batch");
        let run = async { (self.batch_execute)(chunk).await };
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(batch_size = size, error = %e, "Batch execution failed");
                report_event(
                    "failed to execute batch",
                    json!({ "batch_size": size, "error": e.to_string() }),
                    None,
                );
            }
            Err(_) => {
                error!(batch_size = size, "Batch execution panicked");
                report_event(
                    "batch execution panicked",
                    json!({ "batch_size": size }),
                    None,
                );
            }
        }
    }
}

/// How long a drain cycle waits after its first yield before cutting a batch.
fn coalescing_window(configured: Duration, flavor: RuntimeFlavor) -> Duration {
    match flavor {
        RuntimeFlavor::CurrentThread => configured,
        _ => configured.max(MULTI_THREAD_MIN_WINDOW),
    }
}

fn into_chunks<T>(mut jobs: Vec<T>, limit: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::with_capacity(jobs.len() / limit + 1);
    while jobs.len() > limit {
        let rest = jobs.split_off(limit);
        chunks.push(std::mem::replace(&mut jobs, rest));
    }
    if !jobs.is_empty() {
        chunks.push(jobs);
    }
    chunks
}

//! Batch scheduler: bounded, chunked release of units to an engine and
//! deterministic ordering of the finished rows.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;

use super::dispatch::scatter_gather;
use super::table::{ResultTable, UnitKey};

pub const DEFAULT_WORKERS: usize = 50;

/// Shape of the per-unit fan-out, used to derive the unit batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    /// Global budget of simultaneous raw model calls.
    pub workers: usize,
    pub reviewers: usize,
    /// Fan-out calls one reviewer issues before its synthesis call.
    pub calls_per_reviewer: usize,
}

impl BatchPlan {
    pub fn new(workers: usize, reviewers: usize, calls_per_reviewer: usize) -> Self {
        Self {
            workers,
            reviewers,
            calls_per_reviewer,
        }
    }

    /// Units allowed in flight at once, never less than 1.
    pub fn batch_size(&self) -> usize {
        let per_unit = self.reviewers.max(1) * self.calls_per_reviewer.max(1);
        (self.workers / per_unit).max(1)
    }
}

pub type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Completed-unit counter. Advances once per finished unit.
pub struct BatchProgress {
    completed: AtomicUsize,
    total: usize,
    callback: Option<ProgressFn>,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            completed: AtomicUsize::new(0),
            total,
            callback: None,
        }
    }

    pub fn with_callback(mut self, callback: Option<ProgressFn>) -> Self {
        self.callback = callback;
        self
    }

    pub fn tick(&self) -> usize {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(completed = done, total = self.total, "Unit finished");
        if let Some(ref callback) = self.callback {
            callback(done, self.total);
        }
        done
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// Run `op` for every id, `plan.batch_size()` units at a time, and return
/// the rows sorted by id.
pub async fn run_batch<K, R, F, Fut>(
    plan: &BatchPlan,
    ids: &[K],
    progress: &BatchProgress,
    op: F,
) -> ResultTable<K, R>
where
    K: UnitKey,
    F: Fn(K) -> Fut,
    Fut: Future<Output = R>,
{
    let batch_size = plan.batch_size();
    let semaphore = Semaphore::new(batch_size);
    let mut rows = Vec::with_capacity(ids.len());

    tracing::info!(
        units = ids.len(),
        batch_size,
        workers = plan.workers,
        reviewers = plan.reviewers,
        calls_per_reviewer = plan.calls_per_reviewer,
        "Starting batch"
    );

    let semaphore = &semaphore;
    let op = &op;
    for (index, chunk) in ids.chunks(batch_size).enumerate() {
        tracing::debug!(chunk = index, size = chunk.len(), "Releasing chunk");
        let finished = scatter_gather(chunk.iter().cloned(), move |id| async move {
            let _permit = semaphore.acquire().await.ok();
            let record = op(id.clone()).await;
            progress.tick();
            (id, record)
        })
        .await;
        rows.extend(finished);
    }

    tracing::info!(units = rows.len(), "Batch complete");
    ResultTable::from_unordered(rows)
}

use crate::buffer::{BufferError, BufferHandle, BufferStats};
use crate::data_source::SharedLogQuery;
use crate::metrics::SharedMetrics;
use crate::range_query::{RangeQueryError, RangeQueryWorker, Recipient};
use crate::BlockRange;
use feed_protocol::EventCategory;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Every category has been fetched over `range` into the shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaughtUp {
    pub range: BlockRange,
    pub stats: BufferStats,
}

#[derive(Debug, Error)]
pub enum CatchUpError {
    #[error("catch-up of {category} over {range} failed after {attempts} attempts")]
    WorkerExhausted {
        category: EventCategory,
        range: BlockRange,
        attempts: u32,
    },
    #[error("shared catch-up buffer failed: {0}")]
    BufferFailed(#[from] BufferError),
}

type WorkerOutcome = (EventCategory, u32, Result<Result<usize, RangeQueryError>, String>);

/// Backfills `[known_watermark, head]` for every category into one shared buffer.
#[derive(bon::Builder)]
pub struct CatchUpCoordinator {
    query: SharedLogQuery,
    buffer: BufferHandle,
    categories: Vec<EventCategory>,
    known_watermark: u64,
    /// Re-spawns allowed per category after the first attempt.
    #[builder(default = 3)]
    max_worker_retries: u32,
    #[builder(default = Duration::from_secs(1))]
    retry_delay: Duration,
    metrics: SharedMetrics,
}

impl CatchUpCoordinator {
    pub async fn run(&self, head: u64) -> Result<CaughtUp, CatchUpError> {
        let range = BlockRange::new(self.known_watermark, head);
        if range.is_empty() {
            let stats = self.buffer.stats().await?;
            info!(%range, "Nothing to catch up");
            return Ok(CaughtUp { range, stats });
        }
        info!(
            %range,
            blocks = range.len(),
            categories = self.categories.len(),
            "Catch-up started"
        );

        // dropping the set aborts whatever is still running
        let mut workers = JoinSet::new();
        for &category in &self.categories {
            self.spawn_worker(&mut workers, category, range, 0);
        }

        while let Some(joined) = workers.join_next().await {
            let (category, attempt, outcome) = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(%err, "Catch-up worker task failed");
                    return Err(CatchUpError::BufferFailed(BufferError::Unavailable));
                }
            };
            let failure = match outcome {
                Ok(Ok(count)) => {
                    debug!(%category, count, "Catch-up worker finished");
                    continue;
                }
                Ok(Err(RangeQueryError::RecipientGone { .. })) => {
                    error!(%category, %range, "Shared buffer is gone, aborting catch-up");
                    return Err(CatchUpError::BufferFailed(BufferError::Unavailable));
                }
                Ok(Err(err)) => err.to_string(),
                Err(panic) => {
                    self.metrics.increment_range_queries_failed();
                    panic
                }
            };
            if attempt >= self.max_worker_retries {
                error!(
                    %category,
                    %range,
                    attempts = attempt + 1,
                    %failure,
                    "Catch-up worker exhausted retries"
                );
                return Err(CatchUpError::WorkerExhausted {
                    category,
                    range,
                    attempts: attempt + 1,
                });
            }
            warn!(%category, attempt, %failure, "Catch-up worker failed, retrying");
            self.spawn_worker(&mut workers, category, range, attempt + 1);
        }

        let stats = self.buffer.stats().await?;
        self.metrics.increment_catch_ups_completed();
        info!(
            %range,
            events = stats.count,
            min_key = ?stats.min_key,
            max_key = ?stats.max_key,
            "Caught up"
        );
        Ok(CaughtUp { range, stats })
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<WorkerOutcome>,
        category: EventCategory,
        range: BlockRange,
        attempt: u32,
    ) {
        let worker = RangeQueryWorker::new(
            self.query.clone(),
            category,
            range,
            Recipient::Buffer(self.buffer.clone()),
            self.metrics.clone(),
        );
        let delay = (attempt > 0).then_some(self.retry_delay);
        workers.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let outcome = AssertUnwindSafe(worker.run())
                .catch_unwind()
                .await
                .map_err(|panic| panic_message(panic.as_ref()));
            (category, attempt, outcome)
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

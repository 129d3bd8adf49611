use crate::buffer::BufferHandle;
use crate::data_source::SharedLogQuery;
use crate::metrics::SharedMetrics;
use crate::BlockRange;
use feed_protocol::{Event, EventCategory};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeQueryResult {
    Events(Vec<Event>),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQueryReport {
    pub category: EventCategory,
    pub range: BlockRange,
    pub result: RangeQueryResult,
}

/// Where a worker delivers its result.
#[derive(Clone)]
pub enum Recipient {
    /// Insert the events into a buffer; `Empty` results insert nothing.
    Buffer(BufferHandle),
    Channel(flume::Sender<RangeQueryReport>),
}

#[derive(Debug, Error)]
pub enum RangeQueryError {
    #[error("range query {category} {range} failed: {err:#}")]
    Query {
        category: EventCategory,
        range: BlockRange,
        err: anyhow::Error,
    },
    #[error("recipient of range query {category} {range} is gone")]
    RecipientGone {
        category: EventCategory,
        range: BlockRange,
    },
}

/// One-shot fetch of a category's events over a block range.
pub struct RangeQueryWorker {
    query: SharedLogQuery,
    category: EventCategory,
    range: BlockRange,
    recipient: Recipient,
    metrics: SharedMetrics,
}

impl RangeQueryWorker {
    pub fn new(
        query: SharedLogQuery,
        category: EventCategory,
        range: BlockRange,
        recipient: Recipient,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            query,
            category,
            range,
            recipient,
            metrics,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<usize, RangeQueryError>> {
        tokio::spawn(self.run())
    }

    /// Fetches and delivers once, returning the number of events delivered.
    pub async fn run(self) -> Result<usize, RangeQueryError> {
        let (category, range) = (self.category, self.range);
        debug!(%category, from = range.from, to = range.to, "Querying events");
        self.metrics.increment_range_queries();

        let mut events = self
            .query
            .query_logs(category, range)
            .await
            .inspect_err(|err| warn!(%category, %range, err = ?err, "Range query failed"))
            .map_err(|err| {
                self.metrics.increment_range_queries_failed();
                RangeQueryError::Query {
                    category,
                    range,
                    err,
                }
            })?;
        events.sort_by_key(|event| event.key);
        let count = events.len();

        let result = if events.is_empty() {
            RangeQueryResult::Empty
        } else {
            RangeQueryResult::Events(events)
        };
        let delivered = match self.recipient {
            Recipient::Buffer(buffer) => match result {
                RangeQueryResult::Events(events) => buffer.insert_batch(events).await.is_ok(),
                RangeQueryResult::Empty => !buffer.is_closed(),
            },
            Recipient::Channel(tx) => tx
                .send_async(RangeQueryReport {
                    category,
                    range,
                    result,
                })
                .await
                .is_ok(),
        };
        if !delivered {
            return Err(RangeQueryError::RecipientGone { category, range });
        }
        if count > 0 {
            info!(%category, from = range.from, to = range.to, count, "Fetched events");
        }
        Ok(count)
    }
}

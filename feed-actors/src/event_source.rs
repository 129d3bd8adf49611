use crate::buffer::BufferHandle;
use crate::data_source::SharedLogQuery;
use crate::metrics::SharedMetrics;
use crate::range_query::{RangeQueryReport, RangeQueryResult, RangeQueryWorker, Recipient};
use crate::ticker::NewBlock;
use crate::BlockRange;
use anyhow::{anyhow, Context};
use feed_protocol::{Event, EventCategory};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// Events of one category up to and including `watermark`, in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveBatch {
    pub category: EventCategory,
    pub watermark: u64,
    pub events: Vec<Event>,
}

/// Follows the chain head for one category: every new block triggers one range query
/// covering everything after the watermark.
///
/// Cycles through waiting for a tick, fetching the range and publishing the batch.
#[derive(bon::Builder)]
pub struct EventSource {
    category: EventCategory,
    query: SharedLogQuery,
    /// Scratch buffer for ordering and de-duplicating one fetch.
    buffer: BufferHandle,
    ticks: broadcast::Receiver<NewBlock>,
    live_tx: flume::Sender<LiveBatch>,
    shutdown: oneshot::Receiver<()>,
    metrics: SharedMetrics,
    /// Last fully incorporated block; the first tick sets it to `tick - 1` when unset.
    watermark: Option<u64>,
    /// Head to fetch before waiting for the first tick. Ignored unless above the watermark.
    pending_head: Option<u64>,
    #[builder(skip)]
    ticks_closed: bool,
}

impl EventSource {
    pub async fn process(mut self) -> anyhow::Result<()> {
        info!(category = %self.category, watermark = ?self.watermark, "Event source started");
        if let (Some(head), Some(watermark)) = (self.pending_head, self.watermark) {
            if head <= watermark {
                debug!(
                    category = %self.category,
                    head,
                    watermark,
                    "Initial head already covered"
                );
                self.pending_head = None;
            }
        }
        loop {
            let head = match self.pending_head.take() {
                Some(head) => head,
                None => match self.wait_for_tick().await {
                    Some(head) => head,
                    None => return Ok(()),
                },
            };
            if !self.fetch(head).await? {
                return Ok(());
            }
        }
    }

    /// `None` means the source should stop.
    async fn wait_for_tick(&mut self) -> Option<u64> {
        if self.ticks_closed {
            info!(category = %self.category, "Tick source closed, event source stopping");
            return None;
        }
        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => {
                    info!(category = %self.category, "Event source received shutdown");
                    return None;
                }
                tick = self.ticks.recv() => match tick {
                    Ok(NewBlock { height }) => return Some(height),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(category = %self.category, skipped, "Event source lagged behind ticks");
                    }
                    Err(RecvError::Closed) => {
                        info!(category = %self.category, "Tick source closed, event source stopping");
                        return None;
                    }
                }
            }
        }
    }

    /// Returns `Ok(false)` when shutdown arrived while fetching.
    async fn fetch(&mut self, head: u64) -> anyhow::Result<bool> {
        let watermark = *self.watermark.get_or_insert(head.saturating_sub(1));
        if head <= watermark {
            warn!(category = %self.category, head, watermark, "Ignoring stale block tick");
            return Ok(true);
        }
        let range = BlockRange::new(watermark + 1, head);
        let (report_tx, report_rx) = flume::bounded(1);
        let mut worker = RangeQueryWorker::new(
            self.query.clone(),
            self.category,
            range,
            Recipient::Channel(report_tx),
            self.metrics.clone(),
        )
        .spawn();

        let joined = loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => {
                    worker.abort();
                    info!(category = %self.category, %range, "Event source received shutdown while fetching");
                    return Ok(false);
                }
                joined = &mut worker => break joined,
                tick = self.ticks.recv(), if !self.ticks_closed => match tick {
                    Ok(NewBlock { height }) => {
                        self.pending_head = Some(self.pending_head.map_or(height, |h| h.max(height)));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(category = %self.category, skipped, "Event source lagged behind ticks");
                    }
                    Err(RecvError::Closed) => self.ticks_closed = true,
                },
            }
        };

        match joined {
            Ok(Ok(_)) => match report_rx.try_recv() {
                Ok(report) => self.publish(report, head).await?,
                Err(_) => {
                    warn!(category = %self.category, %range, "Range query ended without a report")
                }
            },
            Ok(Err(err)) => {
                warn!(
                    category = %self.category,
                    %err,
                    "Range query failed, range is retried on the next block"
                );
            }
            Err(err) => {
                self.metrics.increment_range_queries_failed();
                error!(category = %self.category, %range, %err, "Range query worker crashed");
            }
        }
        Ok(true)
    }

    async fn publish(&mut self, report: RangeQueryReport, head: u64) -> anyhow::Result<()> {
        if let RangeQueryResult::Events(events) = report.result {
            self.buffer
                .insert_batch(events)
                .await
                .context("event source buffer failed")?;
        }
        self.watermark = Some(head);
        let events = self
            .buffer
            .take_all()
            .await
            .context("event source buffer failed")?;
        debug!(
            category = %self.category,
            range = %report.range,
            events = events.len(),
            "Publishing live batch"
        );
        self.metrics.increment_live_batches();
        self.live_tx
            .send_async(LiveBatch {
                category: self.category,
                watermark: head,
                events,
            })
            .await
            .map_err(|_| anyhow!("live stream of {} closed", self.category))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::EventBuffer;
    use crate::feed::FeedTimeouts;
    use crate::metrics::create_shared_metrics;
    use crate::testing::{event, keys, MockChain};
    use crate::ticker::BlockTicker;
    use feed_protocol::Key;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        ticks: broadcast::Sender<NewBlock>,
        live: flume::Receiver<LiveBatch>,
        shutdown: oneshot::Sender<()>,
        task: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    fn start(chain: Arc<MockChain>, category: EventCategory, watermark: Option<u64>) -> Harness {
        start_at(chain, category, watermark, None)
    }

    fn start_at(
        chain: Arc<MockChain>,
        category: EventCategory,
        watermark: Option<u64>,
        pending_head: Option<u64>,
    ) -> Harness {
        let (ticks, ticks_rx) = broadcast::channel(16);
        let (live_tx, live) = flume::unbounded();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let metrics = create_shared_metrics();
        let (buffer, _) = EventBuffer::spawn("source", FeedTimeouts::default(), metrics.clone());
        let source = EventSource::builder()
            .category(category)
            .query(chain)
            .buffer(buffer)
            .ticks(ticks_rx)
            .live_tx(live_tx)
            .shutdown(shutdown_rx)
            .metrics(metrics)
            .maybe_watermark(watermark)
            .maybe_pending_head(pending_head)
            .build();
        Harness {
            ticks,
            live,
            shutdown,
            task: tokio::spawn(source.process()),
        }
    }

    #[tokio::test]
    async fn test_first_tick_fetches_only_that_block() {
        let chain = MockChain::new();
        chain.push([
            event(EventCategory::Trust, 100, 0),
            event(EventCategory::Trust, 101, 2),
            event(EventCategory::Trust, 101, 1),
        ]);
        let harness = start(chain.clone(), EventCategory::Trust, None);

        harness.ticks.send(NewBlock { height: 101 }).unwrap();
        let batch = harness.live.recv_async().await.unwrap();
        assert_eq!(batch.watermark, 101);
        assert_eq!(keys(&batch.events), vec![Key::new(101, 1), Key::new(101, 2)]);
        assert_eq!(chain.calls_for(EventCategory::Trust), vec![BlockRange::new(101, 101)]);

        harness.shutdown.send(()).unwrap();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_crashed_worker_keeps_watermark() {
        let chain = MockChain::new();
        chain.push([event(EventCategory::Signup, 101, 0), event(EventCategory::Signup, 102, 0)]);
        chain.panic_queries(EventCategory::Signup, 1);
        let harness = start(chain.clone(), EventCategory::Signup, Some(100));

        harness.ticks.send(NewBlock { height: 101 }).unwrap();
        harness.ticks.send(NewBlock { height: 102 }).unwrap();
        let batch = harness.live.recv_async().await.unwrap();
        assert_eq!(batch.watermark, 102);
        assert_eq!(keys(&batch.events), vec![Key::new(101, 0), Key::new(102, 0)]);
        assert_eq!(
            chain.calls_for(EventCategory::Signup),
            vec![BlockRange::new(101, 101), BlockRange::new(101, 102)]
        );
        harness.shutdown.send(()).unwrap();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_query_extends_next_range() {
        let chain = MockChain::new();
        chain.fail_queries(EventCategory::Transfer, 1);
        let harness = start(chain.clone(), EventCategory::Transfer, Some(50));

        harness.ticks.send(NewBlock { height: 52 }).unwrap();
        harness.ticks.send(NewBlock { height: 53 }).unwrap();
        let batch = harness.live.recv_async().await.unwrap();
        assert_eq!(batch.watermark, 53);
        assert!(batch.events.is_empty());
        assert_eq!(
            chain.calls_for(EventCategory::Transfer),
            vec![BlockRange::new(51, 52), BlockRange::new(51, 53)]
        );
        harness.shutdown.send(()).unwrap();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_ticks_are_ignored() {
        let chain = MockChain::new();
        let harness = start(chain.clone(), EventCategory::Signup, Some(10));

        harness.ticks.send(NewBlock { height: 9 }).unwrap();
        harness.ticks.send(NewBlock { height: 10 }).unwrap();
        harness.ticks.send(NewBlock { height: 11 }).unwrap();
        let batch = harness.live.recv_async().await.unwrap();
        assert_eq!(batch.watermark, 11);
        assert_eq!(chain.calls_for(EventCategory::Signup), vec![BlockRange::new(11, 11)]);
        harness.shutdown.send(()).unwrap();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_initial_head_above_watermark_is_fetched() {
        let chain = MockChain::new();
        chain.push([event(EventCategory::Trust, 22, 0)]);
        let harness = start_at(chain.clone(), EventCategory::Trust, Some(20), Some(22));

        let batch = harness.live.recv_async().await.unwrap();
        assert_eq!(batch.watermark, 22);
        assert_eq!(keys(&batch.events), vec![Key::new(22, 0)]);
        assert_eq!(chain.calls_for(EventCategory::Trust), vec![BlockRange::new(21, 22)]);
        harness.shutdown.send(()).unwrap();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_initial_head_at_watermark_waits_for_tick() {
        let chain = MockChain::new();
        let harness = start_at(chain.clone(), EventCategory::Signup, Some(20), Some(20));

        harness.ticks.send(NewBlock { height: 21 }).unwrap();
        let batch = harness.live.recv_async().await.unwrap();
        assert_eq!(batch.watermark, 21);
        assert_eq!(chain.calls_for(EventCategory::Signup), vec![BlockRange::new(21, 21)]);
        harness.shutdown.send(()).unwrap();
        harness.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_head_triggers_single_fetch() {
        let chain = MockChain::new();
        chain.set_head(100);
        let metrics = create_shared_metrics();
        let (ticker_shutdown, ticker_shutdown_rx) = oneshot::channel();
        let (ticker, hub) = BlockTicker::new(
            chain.clone(),
            Duration::from_secs(1),
            ticker_shutdown_rx,
            metrics.clone(),
        );
        let (live_tx, live) = flume::unbounded();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (buffer, _) = EventBuffer::spawn("source", FeedTimeouts::default(), metrics.clone());
        let source = EventSource::builder()
            .category(EventCategory::OrganizationSignup)
            .query(chain.clone())
            .buffer(buffer)
            .ticks(hub.subscribe())
            .live_tx(live_tx)
            .shutdown(shutdown_rx)
            .metrics(metrics)
            .build();
        let ticker_task = tokio::spawn(ticker.process());
        let source_task = tokio::spawn(source.process());

        assert_eq!(hub.wait_for_head().await.unwrap(), 100);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(live.is_empty());
        chain.set_head(101);

        let batch = live.recv_async().await.unwrap();
        assert_eq!(batch.watermark, 101);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(live.is_empty());
        assert_eq!(
            chain.calls_for(EventCategory::OrganizationSignup),
            vec![BlockRange::new(101, 101)]
        );

        shutdown.send(()).unwrap();
        ticker_shutdown.send(()).unwrap();
        source_task.await.unwrap().unwrap();
        ticker_task.await.unwrap().unwrap();
    }
}

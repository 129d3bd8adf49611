use crate::buffer::{BufferError, BufferHandle, EventBuffer};
use crate::catch_up::{CatchUpCoordinator, CatchUpError};
use crate::data_source::{SharedChainHead, SharedLogQuery};
use crate::event_source::{EventSource, LiveBatch};
use crate::feed::consumer::{
    Consumer, ConsumerEnd, ConsumerError, ConsumerReport, EventSink, SinkAck,
};
use crate::feed::{connection, FeedError, FeedMode, FeedModes, FeedReport, FeedTimeouts};
use crate::feed::{GoodbyeReason, Handshake};
use crate::live_merger::LiveMerger;
use crate::metrics::SharedMetrics;
use crate::ticker::{BlockTicker, TickHub};
use anyhow::anyhow;
use feed_protocol::{Event, EventCategory, Key};
use futures_util::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no event categories configured")]
    NoCategories,
    #[error(transparent)]
    CatchUp(#[from] CatchUpError),
    #[error("shared buffer failed: {0}")]
    Buffer(#[from] BufferError),
    #[error("feed failed: {0}")]
    Feed(#[from] FeedError),
    #[error("consumer failed: {0}")]
    Consumer(#[from] ConsumerError),
    #[error("feed session closed unexpectedly ({0:?})")]
    SessionClosed(GoodbyeReason),
    #[error("pipeline task failed: {0:#}")]
    Task(anyhow::Error),
    #[error("sink was lost with its consumer task")]
    SinkLost,
    #[error("giving up after {restarts} restarts")]
    RestartsExhausted {
        restarts: u32,
        #[source]
        last: Box<PipelineError>,
    },
}

impl PipelineError {
    fn is_restartable(&self) -> bool {
        !matches!(
            self,
            PipelineError::NoCategories
                | PipelineError::SinkLost
                | PipelineError::RestartsExhausted { .. }
        )
    }
}

/// How an attempt ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptEnd {
    Shutdown,
    SinkCancelled,
}

/// Wraps the downstream sink, skipping keys that were already delivered by an earlier attempt.
struct DeliveryTracker<S> {
    inner: S,
    last_key: Option<Key>,
    metrics: SharedMetrics,
}

impl<S> DeliveryTracker<S> {
    /// Block to resume catch-up from. It is re-queried since it may be partially delivered.
    fn checkpoint(&self, start_block: u64) -> u64 {
        self.last_key
            .map_or(start_block, |key| key.block_height.max(start_block))
    }

    fn is_behind(&self, max_key: Option<Key>) -> bool {
        match (max_key, self.last_key) {
            (Some(max), Some(last)) => max > last,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

impl<S: EventSink<Event>> EventSink<Event> for DeliveryTracker<S> {
    fn accept(
        &mut self,
        handshake: Handshake,
        event: Event,
    ) -> BoxFuture<'_, anyhow::Result<SinkAck>> {
        Box::pin(async move {
            let key = event.key;
            if self.last_key.is_some_and(|last| key <= last) {
                debug!(%key, "Skipping already delivered event");
                return Ok(SinkAck::Continue);
            }
            let ack = self.inner.accept(handshake, event).await?;
            self.last_key = Some(key);
            self.metrics.record_delivered(key.block_height);
            Ok(ack)
        })
    }
}

type ConsumerOutcome<S> = (Result<ConsumerReport, ConsumerError>, DeliveryTracker<S>);

struct ActiveSession<S> {
    done: oneshot::Receiver<Result<FeedReport, FeedError>>,
    cancel_tx: oneshot::Sender<()>,
    consumer: JoinHandle<ConsumerOutcome<S>>,
}

/// Everything one attempt spawned. Torn down as a whole before a restart.
struct Attempt<S> {
    shared: BufferHandle,
    shared_task: Option<JoinHandle<Result<(), BufferError>>>,
    sources: JoinSet<(EventCategory, anyhow::Result<()>)>,
    source_stops: Vec<oneshot::Sender<()>>,
    merger_stop: Option<oneshot::Sender<()>>,
    merger_task: Option<JoinHandle<Result<(), BufferError>>>,
    session: Option<ActiveSession<S>>,
    idle_sink: Option<DeliveryTracker<S>>,
}

impl<S: EventSink<Event> + 'static> Attempt<S> {
    async fn teardown(mut self) -> Option<DeliveryTracker<S>> {
        for stop in self.source_stops.drain(..) {
            _ = stop.send(());
        }
        while let Some(joined) = self.sources.join_next().await {
            if let Err(err) = joined {
                debug!(%err, "Event source task ended abnormally");
            }
        }
        if let Some(stop) = self.merger_stop.take() {
            _ = stop.send(());
        }
        if let Some(task) = self.merger_task.take() {
            _ = task.await;
        }
        if let Some(session) = self.session.take() {
            _ = session.cancel_tx.send(());
            match session.consumer.await {
                Ok((_, sink)) => self.idle_sink = Some(sink),
                Err(err) => error!(%err, "Consumer task failed, sink is lost"),
            }
        }
        _ = self.shared.shutdown().await;
        if let Some(task) = self.shared_task.take() {
            _ = task.await;
        }
        self.idle_sink
    }
}

async fn join_task<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *task = None;
    result
}

async fn join_consumer<S>(
    session: &mut Option<ActiveSession<S>>,
) -> Result<ConsumerOutcome<S>, JoinError> {
    match session.as_mut() {
        Some(active) => (&mut active.consumer).await,
        None => std::future::pending().await,
    }
}

/// Runs the whole chain: ticker, catch-up, live sources, merger, feed and consumer.
/// Fatal failures restart everything except the ticker from the last delivered block.
///
/// `max_restarts` bounds consecutive failed attempts. An attempt that delivered an event or
/// stayed up for `healthy_after` resets the count.
#[derive(bon::Builder)]
pub struct Pipeline {
    chain: SharedChainHead,
    query: SharedLogQuery,
    categories: Vec<EventCategory>,
    #[builder(default)]
    start_block: u64,
    #[builder(default = Duration::from_secs(2))]
    poll_interval: Duration,
    #[builder(default)]
    timeouts: FeedTimeouts,
    #[builder(default = FeedMode::Infinite)]
    mode: FeedMode,
    #[builder(default = true)]
    consume: bool,
    #[builder(default = 3)]
    max_worker_retries: u32,
    #[builder(default = Duration::from_secs(1))]
    retry_delay: Duration,
    #[builder(default = 5)]
    max_restarts: u32,
    #[builder(default = Duration::from_secs(5))]
    restart_delay: Duration,
    #[builder(default = Duration::from_secs(60))]
    healthy_after: Duration,
    metrics: SharedMetrics,
}

impl Pipeline {
    /// Delivers events into `sink` until shutdown, a sink cancel or an unrecoverable error.
    pub async fn run<S>(
        self,
        sink: S,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<(), PipelineError>
    where
        S: EventSink<Event> + 'static,
    {
        if self.categories.is_empty() {
            return Err(PipelineError::NoCategories);
        }
        info!(
            categories = ?self.categories,
            start_block = self.start_block,
            mode = %self.mode,
            consume = self.consume,
            "Pipeline started"
        );

        let (ticker_stop, ticker_stop_rx) = oneshot::channel();
        let (ticker, hub) = BlockTicker::new(
            self.chain.clone(),
            self.poll_interval,
            ticker_stop_rx,
            self.metrics.clone(),
        );
        let ticker_task = tokio::spawn(ticker.process());

        let mut sink = Some(DeliveryTracker {
            inner: sink,
            last_key: None,
            metrics: self.metrics.clone(),
        });
        let mut restarts = 0;
        let mut number = 0;
        let result = loop {
            number += 1;
            let delivered_before = sink.as_ref().and_then(|s| s.last_key);
            let started = Instant::now();
            let err = match self.run_attempt(number, &hub, &mut sink, &mut shutdown).await {
                Ok(end) => {
                    info!(attempt = number, ?end, "Pipeline stopped");
                    break Ok(());
                }
                Err(err) => err,
            };
            if !err.is_restartable() {
                break Err(err);
            }
            let delivered = sink.as_ref().and_then(|s| s.last_key) != delivered_before;
            if restarts > 0 && (delivered || started.elapsed() >= self.healthy_after) {
                debug!(
                    attempt = number,
                    restarts,
                    delivered,
                    "Attempt made progress, restart budget reset"
                );
                restarts = 0;
            }
            if restarts >= self.max_restarts {
                break Err(PipelineError::RestartsExhausted {
                    restarts,
                    last: Box::new(err),
                });
            }
            restarts += 1;
            self.metrics.increment_pipeline_restarts();
            warn!(
                attempt = number,
                restarts,
                %err,
                delay_ms = self.restart_delay.as_millis() as u64,
                "Pipeline attempt failed, restarting from checkpoint"
            );
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Pipeline received shutdown while waiting to restart");
                    break Ok(());
                }
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        };

        _ = ticker_stop.send(());
        match ticker_task.await {
            Ok(Err(err)) => warn!(err = ?err, "Block ticker failed"),
            Err(err) => warn!(%err, "Block ticker task failed"),
            Ok(Ok(())) => {}
        }
        if let Err(err) = &result {
            error!(%err, "Pipeline failed");
        }
        result
    }

    async fn run_attempt<S>(
        &self,
        number: u32,
        hub: &TickHub,
        slot: &mut Option<DeliveryTracker<S>>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<AttemptEnd, PipelineError>
    where
        S: EventSink<Event> + 'static,
    {
        let sink = slot.take().ok_or(PipelineError::SinkLost)?;
        let checkpoint = sink.checkpoint(self.start_block);
        let (shared, shared_task) = EventBuffer::spawn(
            format!("shared#{number}"),
            self.timeouts,
            self.metrics.clone(),
        );
        let mut attempt = Attempt {
            shared,
            shared_task: Some(shared_task),
            sources: JoinSet::new(),
            source_stops: Vec::new(),
            merger_stop: None,
            merger_task: None,
            session: None,
            idle_sink: Some(sink),
        };
        info!(attempt = number, checkpoint, "Pipeline attempt started");

        let result = self.drive(&mut attempt, checkpoint, hub, shutdown).await;
        *slot = attempt.teardown().await;
        result
    }

    async fn drive<S>(
        &self,
        attempt: &mut Attempt<S>,
        checkpoint: u64,
        hub: &TickHub,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Result<AttemptEnd, PipelineError>
    where
        S: EventSink<Event> + 'static,
    {
        let head = tokio::select! {
            biased;
            _ = &mut *shutdown => return Ok(AttemptEnd::Shutdown),
            head = hub.wait_for_head() => head.map_err(PipelineError::Task)?,
        };

        let coordinator = CatchUpCoordinator::builder()
            .query(self.query.clone())
            .buffer(attempt.shared.clone())
            .categories(self.categories.clone())
            .known_watermark(checkpoint)
            .max_worker_retries(self.max_worker_retries)
            .retry_delay(self.retry_delay)
            .metrics(self.metrics.clone())
            .build();
        let caught_up = tokio::select! {
            biased;
            _ = &mut *shutdown => return Ok(AttemptEnd::Shutdown),
            caught_up = coordinator.run(head) => caught_up?,
        };

        let (live_tx, live_rx) = flume::unbounded();
        for &category in &self.categories {
            self.spawn_source(attempt, category, head, hub, live_tx.clone());
        }
        drop(live_tx);

        let (merger_stop, merger_stop_rx) = oneshot::channel();
        let (merger, mut released) = LiveMerger::new(
            attempt.shared.clone(),
            live_rx,
            &self.categories,
            head,
            merger_stop_rx,
        );
        attempt.merger_stop = Some(merger_stop);
        attempt.merger_task = Some(tokio::spawn(merger.process()));
        debug!(events = caught_up.stats.count, head, "Live stage started");

        self.maybe_start_session(attempt).await?;
        let mut released_closed = false;

        loop {
            tokio::select! {
                biased;
                _ = &mut *shutdown => {
                    info!("Pipeline received shutdown");
                    return Ok(AttemptEnd::Shutdown);
                }
                joined = join_task(&mut attempt.shared_task) => {
                    return Err(match joined {
                        Ok(Err(err)) => PipelineError::Buffer(err),
                        Ok(Ok(())) => PipelineError::Buffer(BufferError::Unavailable),
                        Err(err) => PipelineError::Task(err.into()),
                    });
                }
                joined = join_consumer(&mut attempt.session) => {
                    if let Some(end) = self.on_session_end(attempt, joined).await? {
                        return Ok(end);
                    }
                }
                changed = released.changed(), if !released_closed => match changed {
                    Ok(()) => self.on_released(attempt, &mut released).await?,
                    Err(_) => released_closed = true,
                },
                joined = join_task(&mut attempt.merger_task) => {
                    return Err(match joined {
                        Ok(Err(err)) => PipelineError::Buffer(err),
                        Ok(Ok(())) => PipelineError::Task(anyhow!("live merger stopped")),
                        Err(err) => PipelineError::Task(err.into()),
                    });
                }
                Some(joined) = attempt.sources.join_next() => {
                    return Err(PipelineError::Task(match joined {
                        Ok((category, Ok(()))) => anyhow!("event source {category} stopped"),
                        Ok((category, Err(err))) => err.context(format!("event source {category}")),
                        Err(err) => err.into(),
                    }));
                }
            }
        }
    }

    fn spawn_source<S>(
        &self,
        attempt: &mut Attempt<S>,
        category: EventCategory,
        watermark: u64,
        hub: &TickHub,
        live_tx: flume::Sender<LiveBatch>,
    ) {
        let (buffer, _) = EventBuffer::spawn(
            format!("source:{category}"),
            self.timeouts,
            self.metrics.clone(),
        );
        let (stop, stop_rx) = oneshot::channel();
        // subscribe before reading the head so no tick falls in between
        let ticks = hub.subscribe();
        let source = EventSource::builder()
            .category(category)
            .query(self.query.clone())
            .buffer(buffer)
            .ticks(ticks)
            .live_tx(live_tx)
            .shutdown(stop_rx)
            .metrics(self.metrics.clone())
            .watermark(watermark)
            .maybe_pending_head(hub.head())
            .build();
        attempt.source_stops.push(stop);
        attempt
            .sources
            .spawn(async move { (category, source.process().await) });
    }

    /// Starts a session when none is active. A finite feed only starts when something is
    /// left to deliver.
    async fn maybe_start_session<S>(&self, attempt: &mut Attempt<S>) -> Result<(), PipelineError>
    where
        S: EventSink<Event> + 'static,
    {
        let Some(sink) = attempt.idle_sink.take() else {
            return Ok(());
        };
        if self.mode == FeedMode::Finite {
            let stats = match attempt.shared.stats().await {
                Ok(stats) => stats,
                Err(err) => {
                    attempt.idle_sink = Some(sink);
                    return Err(err.into());
                }
            };
            if !sink.is_behind(stats.max_key) {
                attempt.idle_sink = Some(sink);
                return Ok(());
            }
        }

        let modes = FeedModes::from(self.mode);
        let (feed_end, consumer_end) = connection();
        let session = match attempt.shared.start_feed(feed_end, modes, self.consume).await {
            Ok(session) => session,
            Err(err) => {
                attempt.idle_sink = Some(sink);
                return Err(err.into());
            }
        };
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let mut consumer = Consumer::new(
            format!("sink#{}", session.id),
            consumer_end,
            sink,
            modes,
            cancel_rx,
        );
        let consumer = tokio::spawn(async move {
            let result = consumer.run().await;
            (result, consumer.into_sink())
        });
        attempt.session = Some(ActiveSession {
            done: session.done,
            cancel_tx,
            consumer,
        });
        Ok(())
    }

    async fn on_released<S>(
        &self,
        attempt: &mut Attempt<S>,
        released: &mut watch::Receiver<u64>,
    ) -> Result<(), PipelineError>
    where
        S: EventSink<Event> + 'static,
    {
        let height = *released.borrow_and_update();
        debug!(height, "Live events released");
        if self.mode == FeedMode::Finite {
            self.maybe_start_session(attempt).await?;
        }
        Ok(())
    }

    /// Returns `Some` when the attempt should stop without an error.
    async fn on_session_end<S>(
        &self,
        attempt: &mut Attempt<S>,
        joined: Result<ConsumerOutcome<S>, JoinError>,
    ) -> Result<Option<AttemptEnd>, PipelineError>
    where
        S: EventSink<Event> + 'static,
    {
        let Some(session) = attempt.session.take() else {
            return Ok(None);
        };
        let (consumed, sink) = match joined {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(%err, "Consumer task failed");
                return Err(PipelineError::SinkLost);
            }
        };
        attempt.idle_sink = Some(sink);
        let fed = session
            .done
            .await
            .map_err(|_| PipelineError::Buffer(BufferError::Unavailable));

        match (consumed, fed) {
            (Ok(report), Ok(Ok(feed))) => {
                info!(
                    received = report.received,
                    items = feed.stats.items,
                    throughput = feed.stats.throughput(),
                    end = ?report.end,
                    "Feed session finished"
                );
                match report.end {
                    ConsumerEnd::SinkCancelled => Ok(Some(AttemptEnd::SinkCancelled)),
                    ConsumerEnd::Eof => {
                        self.maybe_start_session(attempt).await?;
                        Ok(None)
                    }
                    ConsumerEnd::FeedGoodbye(reason) => Err(PipelineError::SessionClosed(reason)),
                    ConsumerEnd::Cancelled => {
                        Err(PipelineError::SessionClosed(GoodbyeReason::Cancel))
                    }
                }
            }
            (_, Ok(Err(err))) => {
                self.metrics.increment_feeds_failed();
                Err(err.into())
            }
            (Err(err), _) => {
                self.metrics.increment_feeds_failed();
                Err(err.into())
            }
            (Ok(_), Err(err)) => {
                self.metrics.increment_feeds_failed();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::create_shared_metrics;
    use crate::testing::{event, keys, MockChain};
    use crate::BlockRange;
    use anyhow::bail;
    use std::sync::Arc;

    struct CollectingSink {
        tx: flume::Sender<Event>,
        cancel_after: usize,
        fail_at: Vec<usize>,
        seen: usize,
        delivered: usize,
    }

    impl CollectingSink {
        fn new(cancel_after: usize) -> (Self, flume::Receiver<Event>) {
            let (tx, rx) = flume::unbounded();
            let sink = Self {
                tx,
                cancel_after,
                fail_at: Vec::new(),
                seen: 0,
                delivered: 0,
            };
            (sink, rx)
        }
    }

    impl EventSink<Event> for CollectingSink {
        fn accept(
            &mut self,
            _handshake: Handshake,
            event: Event,
        ) -> BoxFuture<'_, anyhow::Result<SinkAck>> {
            Box::pin(async move {
                self.seen += 1;
                if self.fail_at.contains(&self.seen) {
                    bail!("sink rejected {}", event.key);
                }
                self.tx.send_async(event).await?;
                self.delivered += 1;
                if self.delivered >= self.cancel_after {
                    Ok(SinkAck::Cancel)
                } else {
                    Ok(SinkAck::Continue)
                }
            })
        }
    }

    fn history(chain: &MockChain) {
        chain.set_head(10);
        chain.push([
            event(EventCategory::Trust, 5, 0),
            event(EventCategory::Signup, 3, 1),
            event(EventCategory::Trust, 3, 0),
        ]);
    }

    fn pipeline(chain: Arc<MockChain>, mode: FeedMode, max_restarts: u32) -> Pipeline {
        Pipeline::builder()
            .chain(chain.clone())
            .query(chain)
            .categories(vec![EventCategory::Signup, EventCategory::Trust])
            .start_block(1)
            .poll_interval(Duration::from_millis(100))
            .mode(mode)
            .retry_delay(Duration::from_millis(10))
            .max_restarts(max_restarts)
            .restart_delay(Duration::from_millis(50))
            .metrics(create_shared_metrics())
            .build()
    }

    async fn delivers_history_then_live(mode: FeedMode) {
        let chain = MockChain::new();
        history(&chain);
        let (sink, delivered) = CollectingSink::new(5);
        let (_shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(pipeline(chain.clone(), mode, 0).run(sink, shutdown_rx));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(delivered.recv_async().await.unwrap());
        }
        assert_eq!(
            keys(&seen),
            vec![Key::new(3, 0), Key::new(3, 1), Key::new(5, 0)]
        );

        chain.push([
            event(EventCategory::Signup, 12, 0),
            event(EventCategory::Trust, 11, 4),
        ]);
        chain.set_head(12);
        for _ in 0..2 {
            seen.push(delivered.recv_async().await.unwrap());
        }
        assert_eq!(
            keys(&seen[3..]),
            vec![Key::new(11, 4), Key::new(12, 0)]
        );

        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_pipeline_delivers_history_then_live() {
        delivers_history_then_live(FeedMode::Infinite).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_finite_pipeline_delivers_history_then_live() {
        delivers_history_then_live(FeedMode::Finite).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_without_duplicates() {
        let chain = MockChain::new();
        history(&chain);
        let (mut sink, delivered) = CollectingSink::new(3);
        sink.fail_at = vec![2];
        let metrics = create_shared_metrics();
        let pipeline = Pipeline::builder()
            .chain(chain.clone())
            .query(chain.clone())
            .categories(vec![EventCategory::Signup, EventCategory::Trust])
            .start_block(1)
            .poll_interval(Duration::from_millis(100))
            .max_restarts(2)
            .restart_delay(Duration::from_millis(50))
            .metrics(metrics.clone())
            .build();
        let (_shutdown, shutdown_rx) = oneshot::channel();

        pipeline.run(sink, shutdown_rx).await.unwrap();
        let seen: Vec<Event> = delivered.drain().collect();
        assert_eq!(
            keys(&seen),
            vec![Key::new(3, 0), Key::new(3, 1), Key::new(5, 0)]
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pipeline_restarts, 1);
        assert_eq!(snapshot.feeds_failed, 1);
        assert_eq!(snapshot.last_delivered_block, 5);
        // second attempt resumes from the block of the last delivered event
        assert_eq!(
            chain.calls_for(EventCategory::Trust),
            vec![BlockRange::new(1, 10), BlockRange::new(3, 10)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_resets_restart_budget() {
        let chain = MockChain::new();
        history(&chain);
        let (mut sink, delivered) = CollectingSink::new(3);
        // one failure per attempt, each after a fresh delivery
        sink.fail_at = vec![2, 4];
        let metrics = create_shared_metrics();
        let pipeline = Pipeline::builder()
            .chain(chain.clone())
            .query(chain)
            .categories(vec![EventCategory::Signup, EventCategory::Trust])
            .start_block(1)
            .poll_interval(Duration::from_millis(100))
            .max_restarts(1)
            .restart_delay(Duration::from_millis(50))
            .metrics(metrics.clone())
            .build();
        let (_shutdown, shutdown_rx) = oneshot::channel();

        pipeline.run(sink, shutdown_rx).await.unwrap();
        let seen: Vec<Event> = delivered.drain().collect();
        assert_eq!(
            keys(&seen),
            vec![Key::new(3, 0), Key::new(3, 1), Key::new(5, 0)]
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pipeline_restarts, 2);
        assert_eq!(snapshot.feeds_failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_chain_keeps_infinite_session_alive() {
        let chain = MockChain::new();
        history(&chain);
        let (sink, delivered) = CollectingSink::new(100);
        let metrics = create_shared_metrics();
        let pipeline = Pipeline::builder()
            .chain(chain.clone())
            .query(chain.clone())
            .categories(vec![EventCategory::OrganizationSignup, EventCategory::Trust])
            .start_block(1)
            .poll_interval(Duration::from_millis(100))
            .timeouts(FeedTimeouts {
                continue_after_eof: Some(Duration::from_secs(1)),
                ..FeedTimeouts::default()
            })
            .max_restarts(0)
            .metrics(metrics.clone())
            .build();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(pipeline.run(sink, shutdown_rx));

        for _ in 0..2 {
            delivered.recv_async().await.unwrap();
        }
        // new blocks keep coming, none of them carries a selected event
        for height in 11..=40 {
            chain.set_head(height);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert!(!task.is_finished());
        assert!(delivered.is_empty());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.feeds_failed, 0);
        assert_eq!(snapshot.pipeline_restarts, 0);

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_restarts() {
        let chain = MockChain::new();
        history(&chain);
        let (mut sink, _delivered) = CollectingSink::new(10);
        sink.fail_at = (1..=10).collect();
        let (_shutdown, shutdown_rx) = oneshot::channel();

        let err = pipeline(chain, FeedMode::Infinite, 2)
            .run(sink, shutdown_rx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::RestartsExhausted { restarts: 2, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_cleanly() {
        let chain = MockChain::new();
        history(&chain);
        let (sink, delivered) = CollectingSink::new(100);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(pipeline(chain, FeedMode::Infinite, 0).run(sink, shutdown_rx));

        for _ in 0..3 {
            delivered.recv_async().await.unwrap();
        }
        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_requires_categories() {
        let chain = MockChain::new();
        let (sink, _delivered) = CollectingSink::new(1);
        let (_shutdown, shutdown_rx) = oneshot::channel();
        let err = Pipeline::builder()
            .chain(chain.clone())
            .query(chain)
            .categories(Vec::new())
            .metrics(create_shared_metrics())
            .build()
            .run(sink, shutdown_rx)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoCategories));
    }
}

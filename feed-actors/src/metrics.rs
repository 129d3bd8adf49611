use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of the feed metrics.
/// This structure contains a copy of all metric counters as simple u64 values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeedMetricsSnapshot {
    /// Events accepted by any buffer
    pub events_buffered: u64,
    /// Inserts rejected because the key was already present
    pub duplicates_ignored: u64,
    /// Events acknowledged by the downstream sink
    pub events_delivered: u64,
    /// Batches published by the event sources
    pub live_batches: u64,
    pub range_queries: u64,
    pub range_queries_failed: u64,
    pub feeds_started: u64,
    pub feeds_failed: u64,
    pub catch_ups_completed: u64,
    pub pipeline_restarts: u64,
    /// Latest chain head observed by the ticker
    pub latest_block: u64,
    /// Block of the most recent event acknowledged by the sink
    pub last_delivered_block: u64,
}

impl Display for FeedMetricsSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Feed Metrics Snapshot:")?;
        writeln!(f, "  Events buffered: {}", self.events_buffered)?;
        writeln!(f, "  Duplicates ignored: {}", self.duplicates_ignored)?;
        writeln!(f, "  Events delivered: {}", self.events_delivered)?;
        writeln!(f, "  Live batches: {}", self.live_batches)?;
        writeln!(
            f,
            "  Range queries: {} ({} failed)",
            self.range_queries, self.range_queries_failed
        )?;
        writeln!(
            f,
            "  Feeds started: {} ({} failed)",
            self.feeds_started, self.feeds_failed
        )?;
        writeln!(f, "  Catch-ups completed: {}", self.catch_ups_completed)?;
        writeln!(f, "  Pipeline restarts: {}", self.pipeline_restarts)?;
        writeln!(f, "  Latest block: {}", self.latest_block)?;
        write!(f, "  Last delivered block: {}", self.last_delivered_block)
    }
}

/// Metrics structure containing atomic counters shared by every pipeline stage
#[derive(Debug, Default)]
pub struct FeedMetrics {
    pub events_buffered: AtomicU64,
    pub duplicates_ignored: AtomicU64,
    pub events_delivered: AtomicU64,
    pub live_batches: AtomicU64,
    pub range_queries: AtomicU64,
    pub range_queries_failed: AtomicU64,
    pub feeds_started: AtomicU64,
    pub feeds_failed: AtomicU64,
    pub catch_ups_completed: AtomicU64,
    pub pipeline_restarts: AtomicU64,
    pub latest_block: AtomicU64,
    pub last_delivered_block: AtomicU64,
}

impl FeedMetrics {
    /// Create a new metrics instance with all counters initialized to zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a snapshot of the current metrics
    pub fn snapshot(&self) -> FeedMetricsSnapshot {
        FeedMetricsSnapshot {
            events_buffered: self.events_buffered.load(Ordering::Relaxed),
            duplicates_ignored: self.duplicates_ignored.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            live_batches: self.live_batches.load(Ordering::Relaxed),
            range_queries: self.range_queries.load(Ordering::Relaxed),
            range_queries_failed: self.range_queries_failed.load(Ordering::Relaxed),
            feeds_started: self.feeds_started.load(Ordering::Relaxed),
            feeds_failed: self.feeds_failed.load(Ordering::Relaxed),
            catch_ups_completed: self.catch_ups_completed.load(Ordering::Relaxed),
            pipeline_restarts: self.pipeline_restarts.load(Ordering::Relaxed),
            latest_block: self.latest_block.load(Ordering::Relaxed),
            last_delivered_block: self.last_delivered_block.load(Ordering::Relaxed),
        }
    }

    pub fn increment_events_buffered(&self) {
        self.events_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_duplicates_ignored(&self) {
        self.duplicates_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_live_batches(&self) {
        self.live_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_range_queries(&self) {
        self.range_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_range_queries_failed(&self) {
        self.range_queries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_feeds_started(&self) {
        self.feeds_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_feeds_failed(&self) {
        self.feeds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_catch_ups_completed(&self) {
        self.catch_ups_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pipeline_restarts(&self) {
        self.pipeline_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Set latest observed chain head
    pub fn set_latest_block(&self, height: u64) {
        self.latest_block.store(height, Ordering::Relaxed);
    }

    /// Record one delivered event; the delivered block only moves forward
    pub fn record_delivered(&self, block_height: u64) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
        self.last_delivered_block
            .fetch_max(block_height, Ordering::Relaxed);
    }
}

/// Type alias for shared metrics
pub type SharedMetrics = Arc<FeedMetrics>;

/// Create a new shared metrics instance
pub fn create_shared_metrics() -> SharedMetrics {
    Arc::new(FeedMetrics::new())
}

use crate::feed::{
    FactoryResult, Feed, FeedControl, FeedEndpoint, FeedModes, FeedTimeouts, Handshake,
    ItemFactory,
};
use crate::metrics::SharedMetrics;
use feed_protocol::{Event, Key};
use futures_util::future::BoxFuture;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::ops::Bound;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod message;

pub(crate) use message::BufferCommand;
pub use message::{BufferHandle, FeedSession};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("event {0} is already buffered")]
    DuplicateKey(Key),
    #[error("event {key} is at or below the active feed boundary {boundary}")]
    OrderingViolation { key: Key, boundary: Key },
    #[error("a feed is already active on this buffer")]
    FeedAlreadyActive,
    #[error("feed could not be started: {0}")]
    InvalidFeed(String),
    #[error("buffer is unavailable")]
    Unavailable,
}

/// Highest key a feed session may deliver, captured when the feed starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedBoundary {
    /// Nothing was buffered at capture time.
    Empty,
    UpTo(Key),
}

impl FeedBoundary {
    pub fn capture(max_key: Option<Key>) -> Self {
        match max_key {
            Some(key) => FeedBoundary::UpTo(key),
            None => FeedBoundary::Empty,
        }
    }

    pub fn admits(&self, key: Key) -> bool {
        matches!(self, FeedBoundary::UpTo(boundary) if key <= *boundary)
    }

    /// Boundary after new data arrived; never moves backwards.
    pub fn advance(self, max_key: Option<Key>) -> Self {
        match (self, max_key) {
            (FeedBoundary::UpTo(boundary), Some(max)) => FeedBoundary::UpTo(boundary.max(max)),
            (FeedBoundary::Empty, max) => FeedBoundary::capture(max),
            (boundary, None) => boundary,
        }
    }
}

impl Display for FeedBoundary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedBoundary::Empty => f.write_str("empty"),
            FeedBoundary::UpTo(key) => write!(f, "{key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferStats {
    pub min_key: Option<Key>,
    pub max_key: Option<Key>,
    pub count: usize,
}

impl BufferStats {
    pub const EMPTY: BufferStats = BufferStats {
        min_key: None,
        max_key: None,
        count: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Events sorted by key, unique per key, with an optional insert guard for an active feed.
#[derive(Debug, Default)]
pub struct OrderedKeyedBuffer {
    entries: BTreeMap<Key, Event>,
    guard: Option<FeedBoundary>,
}

impl OrderedKeyedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, event: Event) -> Result<(), BufferError> {
        if let Some(FeedBoundary::UpTo(boundary)) = self.guard {
            if event.key <= boundary {
                return Err(BufferError::OrderingViolation {
                    key: event.key,
                    boundary,
                });
            }
        }
        match self.entries.entry(event.key) {
            Entry::Vacant(entry) => {
                entry.insert(event);
                Ok(())
            }
            Entry::Occupied(entry) => Err(BufferError::DuplicateKey(*entry.key())),
        }
    }

    pub fn stats(&self) -> BufferStats {
        match (self.entries.keys().next(), self.entries.keys().next_back()) {
            (Some(min), Some(max)) => BufferStats {
                min_key: Some(*min),
                max_key: Some(*max),
                count: self.entries.len(),
            },
            _ => BufferStats::EMPTY,
        }
    }

    pub fn max_key(&self) -> Option<Key> {
        self.entries.keys().next_back().copied()
    }

    /// Smallest event strictly after `after`, or the smallest event when `after` is unset.
    pub fn find_next(&self, after: Option<Key>) -> Option<&Event> {
        match after {
            None => self.entries.values().next(),
            Some(after) => self
                .entries
                .range((Bound::Excluded(after), Bound::Unbounded))
                .next()
                .map(|(_, event)| event),
        }
    }

    pub fn remove_and_find_next(&mut self, after: Option<Key>) -> Option<&Event> {
        if let Some(after) = after {
            self.entries.remove(&after);
        }
        self.find_next(after)
    }

    /// Empties the buffer, yielding events in key order.
    pub fn drain(&mut self) -> impl Iterator<Item = Event> {
        std::mem::take(&mut self.entries).into_values()
    }

    pub fn guard(&self) -> Option<FeedBoundary> {
        self.guard
    }

    fn set_guard(&mut self, guard: Option<FeedBoundary>) {
        self.guard = guard;
    }
}

struct ActiveFeed {
    id: u64,
    control_tx: flume::Sender<FeedControl>,
}

/// Actor owning an [`OrderedKeyedBuffer`]; every operation arrives through a [`BufferHandle`].
pub struct EventBuffer {
    name: Arc<str>,
    buffer: OrderedKeyedBuffer,
    command_rx: flume::Receiver<BufferCommand>,
    timeouts: FeedTimeouts,
    metrics: SharedMetrics,
    session: Option<ActiveFeed>,
    last_session_id: u64,
}

impl EventBuffer {
    pub fn new(
        name: impl Into<Arc<str>>,
        timeouts: FeedTimeouts,
        metrics: SharedMetrics,
    ) -> (Self, BufferHandle) {
        let (command_tx, command_rx) = flume::unbounded();
        let buffer = Self {
            name: name.into(),
            buffer: OrderedKeyedBuffer::new(),
            command_rx,
            timeouts,
            metrics,
            session: None,
            last_session_id: 0,
        };
        (buffer, BufferHandle { command_tx })
    }

    pub fn spawn(
        name: impl Into<Arc<str>>,
        timeouts: FeedTimeouts,
        metrics: SharedMetrics,
    ) -> (BufferHandle, JoinHandle<Result<(), BufferError>>) {
        let (buffer, handle) = Self::new(name, timeouts, metrics);
        (handle, tokio::spawn(buffer.process()))
    }

    /// Serves commands until shutdown or until every handle is dropped.
    /// An ordering violation stops the buffer with that error.
    pub async fn process(mut self) -> Result<(), BufferError> {
        debug!(buffer = %self.name, "Event buffer started");
        while let Ok(command) = self.command_rx.recv_async().await {
            match self.handle_command(command).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(buffer = %self.name, "Event buffer received shutdown");
                    self.end_session(FeedControl::Cancel);
                    return Ok(());
                }
                Err(err) => {
                    error!(buffer = %self.name, %err, "Event buffer failed");
                    self.end_session(FeedControl::Abort);
                    return Err(err);
                }
            }
        }
        debug!(buffer = %self.name, "All buffer handles dropped");
        Ok(())
    }

    /// Returns `Ok(false)` on shutdown.
    async fn handle_command(&mut self, command: BufferCommand) -> Result<bool, BufferError> {
        match command {
            BufferCommand::Insert(event) => self.insert(event)?,
            BufferCommand::InsertBatch(events) => {
                for event in events {
                    self.insert(event)?;
                }
            }
            BufferCommand::Stats { response_channel } => {
                _ = response_channel.send(self.buffer.stats());
            }
            BufferCommand::FindNext {
                after,
                response_channel,
            } => {
                _ = response_channel.send(self.buffer.find_next(after).cloned());
            }
            BufferCommand::RemoveAndFindNext {
                after,
                response_channel,
            } => {
                _ = response_channel.send(self.buffer.remove_and_find_next(after).cloned());
            }
            BufferCommand::DumpAll {
                sink,
                response_channel,
            } => {
                let result = self.dump_all(sink).await;
                _ = response_channel.send(result);
            }
            BufferCommand::StartFeed {
                endpoint,
                modes,
                consume,
                handle,
                response_channel,
            } => {
                let result = self.start_feed(endpoint, modes, consume, handle);
                _ = response_channel.send(result);
            }
            BufferCommand::AdvanceFeedBoundary {
                session,
                response_channel,
            } => {
                let boundary = self.advance_feed_boundary(session);
                _ = response_channel.send(boundary);
            }
            BufferCommand::ContinueFeed => self.signal_session(FeedControl::Continue),
            BufferCommand::CancelFeed => self.signal_session(FeedControl::Cancel),
            BufferCommand::FeedFinished { session } => {
                if self.session.as_ref().is_some_and(|s| s.id == session) {
                    debug!(buffer = %self.name, session, "Feed session finished");
                    self.session = None;
                    self.buffer.set_guard(None);
                }
            }
            BufferCommand::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn insert(&mut self, event: Event) -> Result<(), BufferError> {
        match self.buffer.insert(event) {
            Ok(()) => {
                self.metrics.increment_events_buffered();
                Ok(())
            }
            Err(BufferError::DuplicateKey(key)) => {
                warn!(buffer = %self.name, %key, "Ignoring duplicate event");
                self.metrics.increment_duplicates_ignored();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn dump_all(&mut self, sink: flume::Sender<Event>) -> Result<usize, BufferError> {
        if self.session.is_some() {
            return Err(BufferError::FeedAlreadyActive);
        }
        let mut dumped = 0;
        for event in self.buffer.drain() {
            if sink.send_async(event).await.is_err() {
                warn!(buffer = %self.name, dumped, "Dump sink closed, dropping the rest");
                break;
            }
            dumped += 1;
        }
        Ok(dumped)
    }

    fn start_feed(
        &mut self,
        endpoint: FeedEndpoint<Event>,
        modes: FeedModes,
        consume: bool,
        handle: BufferHandle,
    ) -> Result<FeedSession, BufferError> {
        if self.session.is_some() {
            return Err(BufferError::FeedAlreadyActive);
        }
        let id = self.last_session_id + 1;
        let boundary = FeedBoundary::capture(self.buffer.max_key());
        let (control_tx, control_rx) = flume::unbounded();
        let reader = BufferReader {
            handle: handle.clone(),
            session: id,
            consume,
            boundary,
            last_key: None,
        };
        let feed = Feed::new(
            format!("{}#{id}", self.name),
            endpoint,
            control_rx,
            reader,
            modes,
            self.timeouts.for_modes(modes),
        )
        .map_err(|err| BufferError::InvalidFeed(err.to_string()))?;

        let (done_tx, done_rx) = oneshot::channel();
        let finished = SessionFinished { id, handle };
        tokio::spawn(async move {
            let result = feed.run().await;
            // the buffer must learn about the end before the owner does
            drop(finished);
            _ = done_tx.send(result);
        });

        self.last_session_id = id;
        self.buffer.set_guard(Some(boundary));
        self.session = Some(ActiveFeed { id, control_tx });
        self.metrics.increment_feeds_started();
        info!(buffer = %self.name, session = id, %boundary, consume, "Feed started");
        Ok(FeedSession {
            id,
            boundary,
            done: done_rx,
        })
    }

    fn advance_feed_boundary(&mut self, session: u64) -> FeedBoundary {
        let current = self.buffer.guard().unwrap_or(FeedBoundary::Empty);
        if !self.session.as_ref().is_some_and(|s| s.id == session) {
            return current;
        }
        let advanced = current.advance(self.buffer.max_key());
        if advanced != current {
            debug!(buffer = %self.name, session, %advanced, "Feed boundary advanced");
        }
        self.buffer.set_guard(Some(advanced));
        advanced
    }

    fn signal_session(&self, control: FeedControl) {
        match &self.session {
            Some(session) => {
                _ = session.control_tx.send(control);
            }
            None => debug!(buffer = %self.name, ?control, "No active feed to signal"),
        }
    }

    fn end_session(&mut self, control: FeedControl) {
        if let Some(session) = self.session.take() {
            _ = session.control_tx.send(control);
        }
        self.buffer.set_guard(None);
    }
}

/// Tells the buffer its session ended, even if the feed task panicked.
struct SessionFinished {
    id: u64,
    handle: BufferHandle,
}

impl Drop for SessionFinished {
    fn drop(&mut self) {
        _ = self
            .handle
            .command_tx
            .send(BufferCommand::FeedFinished { session: self.id });
    }
}

/// Item factory of a buffer feed: walks the buffer in key order up to the session boundary.
struct BufferReader {
    handle: BufferHandle,
    session: u64,
    consume: bool,
    boundary: FeedBoundary,
    last_key: Option<Key>,
}

impl ItemFactory<Event> for BufferReader {
    fn next_item(
        &mut self,
        _handshake: Handshake,
    ) -> BoxFuture<'_, anyhow::Result<FactoryResult<Event>>> {
        Box::pin(async move {
            let next = if self.consume {
                self.handle.remove_and_find_next(self.last_key).await?
            } else {
                self.handle.find_next(self.last_key).await?
            };
            match next {
                Some(event) if self.boundary.admits(event.key) => {
                    self.last_key = Some(event.key);
                    Ok(FactoryResult::Item(event))
                }
                _ => Ok(FactoryResult::Eof),
            }
        })
    }

    fn resume(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.boundary = self.handle.advance_feed_boundary(self.session).await?;
            Ok(())
        })
    }
}

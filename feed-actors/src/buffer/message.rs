use crate::buffer::{BufferError, BufferStats, FeedBoundary};
use crate::feed::{FeedEndpoint, FeedError, FeedModes, FeedReport};
use feed_protocol::{Event, Key};
use tokio::sync::oneshot;

pub(crate) enum BufferCommand {
    Insert(Event),
    InsertBatch(Vec<Event>),
    Stats {
        response_channel: oneshot::Sender<BufferStats>,
    },
    FindNext {
        after: Option<Key>,
        response_channel: oneshot::Sender<Option<Event>>,
    },
    RemoveAndFindNext {
        after: Option<Key>,
        response_channel: oneshot::Sender<Option<Event>>,
    },
    DumpAll {
        sink: flume::Sender<Event>,
        response_channel: oneshot::Sender<Result<usize, BufferError>>,
    },
    StartFeed {
        endpoint: FeedEndpoint<Event>,
        modes: FeedModes,
        consume: bool,
        handle: BufferHandle,
        response_channel: oneshot::Sender<Result<FeedSession, BufferError>>,
    },
    AdvanceFeedBoundary {
        session: u64,
        response_channel: oneshot::Sender<FeedBoundary>,
    },
    ContinueFeed,
    CancelFeed,
    FeedFinished {
        session: u64,
    },
    Shutdown,
}

/// A feed started on a buffer. `done` resolves once the session has closed.
pub struct FeedSession {
    pub id: u64,
    pub boundary: FeedBoundary,
    pub done: oneshot::Receiver<Result<FeedReport, FeedError>>,
}

/// Cloneable address of an [`EventBuffer`](crate::buffer::EventBuffer).
#[derive(Clone)]
pub struct BufferHandle {
    pub(crate) command_tx: flume::Sender<BufferCommand>,
}

impl BufferHandle {
    pub async fn insert(&self, event: Event) -> Result<(), BufferError> {
        self.send(BufferCommand::Insert(event)).await
    }

    pub async fn insert_batch(&self, events: Vec<Event>) -> Result<(), BufferError> {
        if events.is_empty() {
            return Ok(());
        }
        self.send(BufferCommand::InsertBatch(events)).await
    }

    pub async fn stats(&self) -> Result<BufferStats, BufferError> {
        self.request(|response_channel| BufferCommand::Stats { response_channel })
            .await
    }

    pub async fn find_next(&self, after: Option<Key>) -> Result<Option<Event>, BufferError> {
        self.request(|response_channel| BufferCommand::FindNext {
            after,
            response_channel,
        })
        .await
    }

    pub async fn remove_and_find_next(
        &self,
        after: Option<Key>,
    ) -> Result<Option<Event>, BufferError> {
        self.request(|response_channel| BufferCommand::RemoveAndFindNext {
            after,
            response_channel,
        })
        .await
    }

    /// Streams every buffered event in key order into `sink`, then clears the buffer.
    pub async fn dump_all(&self, sink: flume::Sender<Event>) -> Result<usize, BufferError> {
        self.request(|response_channel| BufferCommand::DumpAll {
            sink,
            response_channel,
        })
        .await?
    }

    /// Convenience wrapper around [`Self::dump_all`] collecting into a vector.
    pub async fn take_all(&self) -> Result<Vec<Event>, BufferError> {
        let (tx, rx) = flume::unbounded();
        self.dump_all(tx).await?;
        Ok(rx.drain().collect())
    }

    pub async fn start_feed(
        &self,
        endpoint: FeedEndpoint<Event>,
        modes: FeedModes,
        consume: bool,
    ) -> Result<FeedSession, BufferError> {
        let handle = self.clone();
        self.request(|response_channel| BufferCommand::StartFeed {
            endpoint,
            modes,
            consume,
            handle,
            response_channel,
        })
        .await?
    }

    pub(crate) async fn advance_feed_boundary(
        &self,
        session: u64,
    ) -> Result<FeedBoundary, BufferError> {
        self.request(|response_channel| BufferCommand::AdvanceFeedBoundary {
            session,
            response_channel,
        })
        .await
    }

    /// Wakes an infinite feed parked on EOF.
    pub async fn continue_feed(&self) -> Result<(), BufferError> {
        self.send(BufferCommand::ContinueFeed).await
    }

    pub async fn cancel_feed(&self) -> Result<(), BufferError> {
        self.send(BufferCommand::CancelFeed).await
    }

    pub async fn shutdown(&self) -> Result<(), BufferError> {
        self.send(BufferCommand::Shutdown).await
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_disconnected()
    }

    async fn send(&self, command: BufferCommand) -> Result<(), BufferError> {
        self.command_tx
            .send_async(command)
            .await
            .map_err(|_| BufferError::Unavailable)
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> BufferCommand,
    ) -> Result<R, BufferError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| BufferError::Unavailable)
    }
}

use crate::feed::{
    ConsumerEndpoint, ConsumerMessage, FeedMessage, FeedMode, FeedModes, FeedSide, GoodbyeReason,
    Handshake,
};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkAck {
    Continue,
    /// Stop the session; the consumer answers with `Goodbye(Cancel)`.
    Cancel,
}

/// Downstream target of a [`Consumer`].
pub trait EventSink<T>: Send {
    fn accept(&mut self, handshake: Handshake, item: T)
        -> BoxFuture<'_, anyhow::Result<SinkAck>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    WaitingForConnection,
    Ready,
    WaitingForSink,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEnd {
    Eof,
    /// The sink asked to stop.
    SinkCancelled,
    /// Cancelled through the local cancel signal.
    Cancelled,
    FeedGoodbye(GoodbyeReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerReport {
    pub mode: Option<FeedMode>,
    pub received: u64,
    pub end: ConsumerEnd,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("sink failed: {0:#}")]
    SinkFailed(anyhow::Error),
    #[error("no common feed mode, feed offered {offered:?}")]
    NoCommonMode { offered: FeedModes },
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("feed endpoint is gone")]
    FeedGone,
}

enum Wakeup<T> {
    Feed(Result<FeedMessage<T>, flume::RecvError>),
    Sink(anyhow::Result<SinkAck>),
    Cancel,
}

/// Receiving side of a pull session. Requests one item at a time and hands it to the sink.
pub struct Consumer<T, S> {
    name: String,
    endpoint: ConsumerEndpoint<T>,
    sink: S,
    supported: FeedModes,
    cancel_rx: oneshot::Receiver<()>,
    cancel_closed: bool,
    state: ConsumerState,
    handshake: Option<Handshake>,
    received: u64,
}

impl<T, S> Consumer<T, S>
where
    T: Send,
    S: EventSink<T>,
{
    pub fn new(
        name: impl Into<String>,
        endpoint: ConsumerEndpoint<T>,
        sink: S,
        supported: FeedModes,
        cancel_rx: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            sink,
            supported,
            cancel_rx,
            cancel_closed: false,
            state: ConsumerState::WaitingForConnection,
            handshake: None,
            received: 0,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub async fn run(&mut self) -> Result<ConsumerReport, ConsumerError> {
        let result = self.drive().await;
        if let Err(err) = &result {
            if !matches!(err, ConsumerError::FeedGone) {
                self.say_goodbye(GoodbyeReason::Error);
            }
            warn!(
                consumer = %self.name,
                %err,
                received = self.received,
                "Consumer closed with error"
            );
        } else {
            info!(consumer = %self.name, received = self.received, "Consumer closed");
        }
        self.state = ConsumerState::Closed;
        result.map(|end| ConsumerReport {
            mode: self.handshake.map(|h| h.mode),
            received: self.received,
            end,
        })
    }

    async fn drive(&mut self) -> Result<ConsumerEnd, ConsumerError> {
        loop {
            match self.state {
                ConsumerState::WaitingForConnection => {
                    match self.next_wakeup().await {
                        Wakeup::Feed(Ok(FeedMessage::Hello {
                            side: FeedSide::Sender,
                            modes,
                        })) => {
                            let Some(mode) = self.supported.negotiate(modes) else {
                                return Err(ConsumerError::NoCommonMode { offered: modes });
                            };
                            self.handshake = Some(Handshake {
                                offered: modes,
                                mode,
                            });
                            self.send(ConsumerMessage::Hello {
                                side: FeedSide::Receiver,
                                mode,
                            })?;
                            info!(consumer = %self.name, %mode, "Connected to feed");
                            self.state = ConsumerState::Ready;
                        }
                        Wakeup::Feed(Ok(FeedMessage::Hello { .. })) => {
                            return Err(ConsumerError::Protocol(
                                "peer announced itself as a receiver",
                            ));
                        }
                        other => {
                            if let Some(end) = self.on_unexpected(other)? {
                                return Ok(end);
                            }
                        }
                    }
                }
                ConsumerState::Ready => {
                    self.send(ConsumerMessage::Next)?;
                    match self.next_wakeup().await {
                        Wakeup::Feed(Ok(FeedMessage::Item(item))) => {
                            self.received += 1;
                            self.state = ConsumerState::WaitingForSink;
                            if let Some(end) = self.deliver(item).await? {
                                return Ok(end);
                            }
                        }
                        other => {
                            if let Some(end) = self.on_unexpected(other)? {
                                return Ok(end);
                            }
                        }
                    }
                }
                ConsumerState::WaitingForSink | ConsumerState::Closed => {
                    return Err(ConsumerError::Protocol("consumer driven in an invalid state"))
                }
            }
        }
    }

    async fn deliver(&mut self, item: T) -> Result<Option<ConsumerEnd>, ConsumerError> {
        let Some(handshake) = self.handshake else {
            return Err(ConsumerError::Protocol("item received before handshake"));
        };
        let wakeup = {
            let mut accept = self.sink.accept(handshake, item);
            loop {
                tokio::select! {
                    ack = &mut accept => break Wakeup::Sink(ack),
                    msg = self.endpoint.rx.recv_async() => break Wakeup::Feed(msg),
                    r = &mut self.cancel_rx, if !self.cancel_closed => match r {
                        Ok(()) => break Wakeup::Cancel,
                        Err(_) => self.cancel_closed = true,
                    },
                }
            }
        };
        match wakeup {
            Wakeup::Sink(Ok(SinkAck::Continue)) => {
                self.state = ConsumerState::Ready;
                Ok(None)
            }
            Wakeup::Sink(Ok(SinkAck::Cancel)) => {
                info!(consumer = %self.name, "Sink requested cancellation");
                self.say_goodbye(GoodbyeReason::Cancel);
                Ok(Some(ConsumerEnd::SinkCancelled))
            }
            Wakeup::Sink(Err(err)) => Err(ConsumerError::SinkFailed(err)),
            other => self.on_unexpected(other),
        }
    }

    fn on_unexpected(&mut self, wakeup: Wakeup<T>) -> Result<Option<ConsumerEnd>, ConsumerError> {
        match wakeup {
            Wakeup::Feed(Ok(FeedMessage::Goodbye(GoodbyeReason::Eof))) => {
                Ok(Some(ConsumerEnd::Eof))
            }
            Wakeup::Feed(Ok(FeedMessage::Goodbye(reason))) => {
                warn!(consumer = %self.name, ?reason, "Feed said goodbye");
                Ok(Some(ConsumerEnd::FeedGoodbye(reason)))
            }
            Wakeup::Feed(Ok(FeedMessage::Hello { .. })) => {
                Err(ConsumerError::Protocol("duplicate hello"))
            }
            Wakeup::Feed(Ok(FeedMessage::Item(_))) => {
                Err(ConsumerError::Protocol("item without next"))
            }
            Wakeup::Feed(Err(_)) => Err(ConsumerError::FeedGone),
            Wakeup::Cancel => {
                self.say_goodbye(GoodbyeReason::Cancel);
                Ok(Some(ConsumerEnd::Cancelled))
            }
            Wakeup::Sink(_) => Err(ConsumerError::Protocol("sink result outside delivery")),
        }
    }

    async fn next_wakeup(&mut self) -> Wakeup<T> {
        loop {
            tokio::select! {
                msg = self.endpoint.rx.recv_async() => return Wakeup::Feed(msg),
                r = &mut self.cancel_rx, if !self.cancel_closed => match r {
                    Ok(()) => return Wakeup::Cancel,
                    Err(_) => self.cancel_closed = true,
                },
            }
        }
    }

    fn send(&self, msg: ConsumerMessage) -> Result<(), ConsumerError> {
        self.endpoint.tx.send(msg).map_err(|_| ConsumerError::FeedGone)
    }

    fn say_goodbye(&self, reason: GoodbyeReason) {
        _ = self.endpoint.tx.send(ConsumerMessage::Goodbye(reason));
    }
}

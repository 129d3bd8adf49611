use futures_util::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod consumer;
mod message;

pub use message::*;

/// What the item factory produced for one pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactoryResult<T> {
    Item(T),
    Eof,
}

/// Source of items for a [`Feed`]. The returned future is polled by the session
/// and dropped if the session closes while it is pending.
pub trait ItemFactory<T>: Send {
    fn next_item(
        &mut self,
        handshake: Handshake,
    ) -> BoxFuture<'_, anyhow::Result<FactoryResult<T>>>;

    /// Called on `Continue` before pulling again after an EOF (infinite mode only).
    fn resume(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedTimeouts {
    /// Bound on the wait for the consumer's hello.
    pub connect: Option<Duration>,
    /// Bound on the wait for `Continue` after an EOF, infinite mode only.
    pub continue_after_eof: Option<Duration>,
}

impl Default for FeedTimeouts {
    fn default() -> Self {
        Self {
            connect: Some(Duration::from_secs(2)),
            continue_after_eof: None,
        }
    }
}

impl FeedTimeouts {
    /// Drops the continue timeout when the offered modes cannot park on EOF.
    pub fn for_modes(self, modes: FeedModes) -> Self {
        if modes.contains(FeedMode::Infinite) {
            self
        } else {
            Self {
                continue_after_eof: None,
                ..self
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connecting,
    Connected,
    WaitingForFactory,
    WaitForContinue,
    Eof,
    Closed,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid feed configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("consumer did not connect within {0:?}")]
    ConnectTimeout(Duration),
    #[error("no continue received within {0:?} after eof")]
    ContinueTimeout(Duration),
    #[error("item factory failed: {0:#}")]
    Factory(anyhow::Error),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("feed aborted by its owner")]
    Aborted,
    #[error("consumer endpoint is gone")]
    ConsumerGone,
}

impl FeedError {
    /// Whether the peer should be told `Goodbye(Error)` when the session ends with this error.
    fn notifies_consumer(&self) -> bool {
        !matches!(self, FeedError::ConsumerGone | FeedError::InvalidConfig(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEnd {
    /// Finite session drained its items.
    Eof,
    /// Cancelled through the control channel.
    Cancelled,
    /// The consumer closed the session.
    ConsumerGoodbye(GoodbyeReason),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeedStats {
    pub items: u64,
    started: Option<Instant>,
    last_item: Option<Instant>,
}

impl FeedStats {
    fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    fn record_item(&mut self) {
        self.items += 1;
        self.last_item = Some(Instant::now());
    }

    /// Time between the handshake and the latest delivered item.
    pub fn elapsed(&self) -> Duration {
        match (self.started, self.last_item) {
            (Some(started), Some(last)) => last.saturating_duration_since(started),
            _ => Duration::ZERO,
        }
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.items as f64 / secs
        } else {
            self.items as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeedReport {
    pub mode: Option<FeedMode>,
    pub stats: FeedStats,
    pub end: FeedEnd,
}

enum Wakeup<T> {
    Consumer(Result<ConsumerMessage, flume::RecvError>),
    Control(Result<FeedControl, flume::RecvError>),
    Factory(anyhow::Result<FactoryResult<T>>),
    Timeout,
}

/// Producer side of a pull session.
pub struct Feed<T, F> {
    name: String,
    endpoint: FeedEndpoint<T>,
    control_rx: flume::Receiver<FeedControl>,
    factory: F,
    supported: FeedModes,
    timeouts: FeedTimeouts,
    state: FeedState,
    handshake: Option<Handshake>,
    continue_latched: bool,
    connect_deadline: Option<Instant>,
    continue_deadline: Option<Instant>,
    stats: FeedStats,
}

impl<T, F> Feed<T, F>
where
    T: Send,
    F: ItemFactory<T>,
{
    pub fn new(
        name: impl Into<String>,
        endpoint: FeedEndpoint<T>,
        control_rx: flume::Receiver<FeedControl>,
        factory: F,
        supported: FeedModes,
        timeouts: FeedTimeouts,
    ) -> Result<Self, FeedError> {
        if supported.is_empty() {
            return Err(FeedError::InvalidConfig("feed must support at least one mode"));
        }
        if timeouts.continue_after_eof.is_some() && !supported.contains(FeedMode::Infinite) {
            return Err(FeedError::InvalidConfig(
                "continue timeout is only allowed for infinite feeds",
            ));
        }
        Ok(Self {
            name: name.into(),
            endpoint,
            control_rx,
            factory,
            supported,
            timeouts,
            state: FeedState::Connecting,
            handshake: None,
            continue_latched: false,
            connect_deadline: None,
            continue_deadline: None,
            stats: FeedStats::default(),
        })
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    /// Drives the session until it closes. `Goodbye(Error)` has already been sent to
    /// the consumer when this returns an error other than [`FeedError::ConsumerGone`].
    pub async fn run(mut self) -> Result<FeedReport, FeedError> {
        self.connect_deadline = self.timeouts.connect.map(|t| Instant::now() + t);
        let hello = FeedMessage::Hello {
            side: FeedSide::Sender,
            modes: self.supported,
        };
        let result = match self.endpoint.tx.send_async(hello).await {
            Ok(()) => self.drive().await,
            Err(_) => Err(FeedError::ConsumerGone),
        };
        if let Err(err) = &result {
            if err.notifies_consumer() {
                self.say_goodbye(GoodbyeReason::Error);
            }
        }
        self.state = FeedState::Closed;

        let mode = self.handshake.map(|h| h.mode);
        match &result {
            Ok(end) => info!(
                feed = %self.name,
                ?end,
                items = self.stats.items,
                elapsed_ms = self.stats.elapsed().as_millis() as u64,
                throughput = self.stats.throughput(),
                "Feed closed"
            ),
            Err(err) => warn!(
                feed = %self.name,
                %err,
                items = self.stats.items,
                "Feed closed with error"
            ),
        }
        result.map(|end| FeedReport {
            mode,
            stats: self.stats,
            end,
        })
    }

    async fn drive(&mut self) -> Result<FeedEnd, FeedError> {
        loop {
            let end = match self.state {
                FeedState::Connecting => self.on_connecting().await?,
                FeedState::Connected => self.on_connected().await?,
                FeedState::WaitingForFactory => self.on_waiting_for_factory().await?,
                FeedState::WaitForContinue => self.on_wait_for_continue().await?,
                FeedState::Eof => {
                    self.say_goodbye(GoodbyeReason::Eof);
                    Some(FeedEnd::Eof)
                }
                FeedState::Closed => return Err(FeedError::Protocol("session already closed")),
            };
            if let Some(end) = end {
                return Ok(end);
            }
        }
    }

    async fn on_connecting(&mut self) -> Result<Option<FeedEnd>, FeedError> {
        let wakeup: Wakeup<T> = tokio::select! {
            msg = self.endpoint.rx.recv_async() => Wakeup::Consumer(msg),
            ctrl = self.control_rx.recv_async() => Wakeup::Control(ctrl),
            _ = sleep_until_or_pending(self.connect_deadline) => Wakeup::Timeout,
        };
        match wakeup {
            Wakeup::Consumer(Ok(ConsumerMessage::Hello {
                side: FeedSide::Receiver,
                mode,
            })) => {
                if !self.supported.contains(mode) {
                    return Err(FeedError::Protocol("consumer chose an unsupported mode"));
                }
                self.handshake = Some(Handshake {
                    offered: self.supported,
                    mode,
                });
                self.stats.start();
                self.state = FeedState::Connected;
                info!(feed = %self.name, %mode, "Consumer connected");
                Ok(None)
            }
            Wakeup::Consumer(Ok(ConsumerMessage::Hello { .. })) => {
                Err(FeedError::Protocol("peer announced itself as a sender"))
            }
            Wakeup::Consumer(msg) => self.on_unexpected_consumer_message(msg),
            Wakeup::Control(ctrl) => self.on_control(ctrl),
            Wakeup::Timeout | Wakeup::Factory(_) => Err(FeedError::ConnectTimeout(
                self.timeouts.connect.unwrap_or_default(),
            )),
        }
    }

    async fn on_connected(&mut self) -> Result<Option<FeedEnd>, FeedError> {
        let wakeup: Wakeup<T> = tokio::select! {
            msg = self.endpoint.rx.recv_async() => Wakeup::Consumer(msg),
            ctrl = self.control_rx.recv_async() => Wakeup::Control(ctrl),
        };
        match wakeup {
            Wakeup::Consumer(Ok(ConsumerMessage::Next)) => {
                self.state = FeedState::WaitingForFactory;
                Ok(None)
            }
            Wakeup::Consumer(msg) => self.on_unexpected_consumer_message(msg),
            Wakeup::Control(ctrl) => self.on_control(ctrl),
            Wakeup::Factory(_) | Wakeup::Timeout => Ok(None),
        }
    }

    async fn on_waiting_for_factory(&mut self) -> Result<Option<FeedEnd>, FeedError> {
        let Some(handshake) = self.handshake else {
            return Err(FeedError::Protocol("item requested before handshake"));
        };
        let wakeup = {
            let mut next = self.factory.next_item(handshake);
            loop {
                tokio::select! {
                    result = &mut next => break Wakeup::Factory(result),
                    msg = self.endpoint.rx.recv_async() => break Wakeup::Consumer(msg),
                    ctrl = self.control_rx.recv_async() => match ctrl {
                        // the pending pull must not be interrupted by a wake-up
                        Ok(FeedControl::Continue) => self.continue_latched = true,
                        other => break Wakeup::Control(other),
                    },
                }
            }
        };
        match wakeup {
            Wakeup::Factory(Ok(FactoryResult::Item(item))) => {
                self.endpoint
                    .tx
                    .send_async(FeedMessage::Item(item))
                    .await
                    .map_err(|_| FeedError::ConsumerGone)?;
                self.stats.record_item();
                self.state = FeedState::Connected;
                Ok(None)
            }
            Wakeup::Factory(Ok(FactoryResult::Eof)) => {
                match handshake.mode {
                    FeedMode::Finite => self.state = FeedState::Eof,
                    FeedMode::Infinite => {
                        debug!(
                            feed = %self.name,
                            items = self.stats.items,
                            throughput = self.stats.throughput(),
                            "Feed reached eof, waiting for continue"
                        );
                        self.continue_deadline = self
                            .timeouts
                            .continue_after_eof
                            .map(|t| Instant::now() + t);
                        self.state = FeedState::WaitForContinue;
                    }
                }
                Ok(None)
            }
            Wakeup::Factory(Err(err)) => Err(FeedError::Factory(err)),
            Wakeup::Consumer(msg) => self.on_unexpected_consumer_message(msg),
            Wakeup::Control(ctrl) => self.on_control(ctrl),
            Wakeup::Timeout => Ok(None),
        }
    }

    async fn on_wait_for_continue(&mut self) -> Result<Option<FeedEnd>, FeedError> {
        if self.continue_latched {
            self.continue_latched = false;
            return self.resume().await;
        }
        let wakeup: Wakeup<T> = tokio::select! {
            ctrl = self.control_rx.recv_async() => Wakeup::Control(ctrl),
            msg = self.endpoint.rx.recv_async() => Wakeup::Consumer(msg),
            _ = sleep_until_or_pending(self.continue_deadline) => Wakeup::Timeout,
        };
        match wakeup {
            Wakeup::Control(Ok(FeedControl::Continue)) => self.resume().await,
            Wakeup::Control(ctrl) => self.on_control(ctrl),
            Wakeup::Consumer(msg) => self.on_unexpected_consumer_message(msg),
            Wakeup::Timeout | Wakeup::Factory(_) => Err(FeedError::ContinueTimeout(
                self.timeouts.continue_after_eof.unwrap_or_default(),
            )),
        }
    }

    async fn resume(&mut self) -> Result<Option<FeedEnd>, FeedError> {
        self.factory.resume().await.map_err(FeedError::Factory)?;
        self.continue_deadline = None;
        self.state = FeedState::WaitingForFactory;
        Ok(None)
    }

    fn on_control(
        &mut self,
        ctrl: Result<FeedControl, flume::RecvError>,
    ) -> Result<Option<FeedEnd>, FeedError> {
        match ctrl {
            Ok(FeedControl::Continue) => {
                self.continue_latched = true;
                Ok(None)
            }
            Ok(FeedControl::Cancel) => {
                self.say_goodbye(GoodbyeReason::Cancel);
                Ok(Some(FeedEnd::Cancelled))
            }
            Ok(FeedControl::Abort) | Err(_) => Err(FeedError::Aborted),
        }
    }

    fn on_unexpected_consumer_message(
        &mut self,
        msg: Result<ConsumerMessage, flume::RecvError>,
    ) -> Result<Option<FeedEnd>, FeedError> {
        match msg {
            Ok(ConsumerMessage::Goodbye(reason)) => {
                info!(feed = %self.name, ?reason, "Consumer said goodbye");
                Ok(Some(FeedEnd::ConsumerGoodbye(reason)))
            }
            Ok(ConsumerMessage::Hello { .. }) => Err(FeedError::Protocol("duplicate hello")),
            Ok(ConsumerMessage::Next) => Err(FeedError::Protocol("unexpected next")),
            Err(_) => Err(FeedError::ConsumerGone),
        }
    }

    fn say_goodbye(&self, reason: GoodbyeReason) {
        _ = self.endpoint.tx.send(FeedMessage::Goodbye(reason));
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

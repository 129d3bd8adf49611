use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSide {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedMode {
    /// Session ends at the first EOF.
    Finite,
    /// EOF parks the session until the producer is told to continue.
    Infinite,
}

impl Display for FeedMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedMode::Finite => f.write_str("finite"),
            FeedMode::Infinite => f.write_str("infinite"),
        }
    }
}

impl std::str::FromStr for FeedMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "finite" => Ok(FeedMode::Finite),
            "infinite" => Ok(FeedMode::Infinite),
            other => anyhow::bail!("unknown feed mode `{other}`"),
        }
    }
}

/// Set of modes one side of a session supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedModes {
    finite: bool,
    infinite: bool,
}

impl FeedModes {
    pub const NONE: FeedModes = FeedModes {
        finite: false,
        infinite: false,
    };
    pub const FINITE: FeedModes = FeedModes {
        finite: true,
        infinite: false,
    };
    pub const INFINITE: FeedModes = FeedModes {
        finite: false,
        infinite: true,
    };
    pub const BOTH: FeedModes = FeedModes {
        finite: true,
        infinite: true,
    };

    pub fn contains(&self, mode: FeedMode) -> bool {
        match mode {
            FeedMode::Finite => self.finite,
            FeedMode::Infinite => self.infinite,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.finite && !self.infinite
    }

    pub fn intersection(&self, other: FeedModes) -> FeedModes {
        FeedModes {
            finite: self.finite && other.finite,
            infinite: self.infinite && other.infinite,
        }
    }

    /// Infinite wins whenever both sides allow it.
    pub fn negotiate(&self, offered: FeedModes) -> Option<FeedMode> {
        let common = self.intersection(offered);
        if common.infinite {
            Some(FeedMode::Infinite)
        } else if common.finite {
            Some(FeedMode::Finite)
        } else {
            None
        }
    }
}

impl From<FeedMode> for FeedModes {
    fn from(mode: FeedMode) -> Self {
        match mode {
            FeedMode::Finite => FeedModes::FINITE,
            FeedMode::Infinite => FeedModes::INFINITE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoodbyeReason {
    Eof,
    Cancel,
    Error,
}

/// Producer to consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage<T> {
    Hello { side: FeedSide, modes: FeedModes },
    Item(T),
    Goodbye(GoodbyeReason),
}

/// Consumer to producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerMessage {
    Hello { side: FeedSide, mode: FeedMode },
    Next,
    Goodbye(GoodbyeReason),
}

/// Out-of-band signals for a running producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedControl {
    /// New data may be available, resume pulling after EOF.
    Continue,
    /// Close the session with `Goodbye(Cancel)`.
    Cancel,
    /// The owner of the data is gone, close with `Goodbye(Error)`.
    Abort,
}

/// Outcome of mode negotiation, fixed for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub offered: FeedModes,
    pub mode: FeedMode,
}

pub struct FeedEndpoint<T> {
    pub(crate) tx: flume::Sender<FeedMessage<T>>,
    pub(crate) rx: flume::Receiver<ConsumerMessage>,
}

pub struct ConsumerEndpoint<T> {
    pub(crate) tx: flume::Sender<ConsumerMessage>,
    pub(crate) rx: flume::Receiver<FeedMessage<T>>,
}

/// Creates both ends of a session link. At most one item is in flight at a time,
/// so the link itself never accumulates data.
pub fn connection<T>() -> (FeedEndpoint<T>, ConsumerEndpoint<T>) {
    let (feed_tx, feed_rx) = flume::unbounded();
    let (consumer_tx, consumer_rx) = flume::unbounded();
    (
        FeedEndpoint {
            tx: feed_tx,
            rx: consumer_rx,
        },
        ConsumerEndpoint {
            tx: consumer_tx,
            rx: feed_rx,
        },
    )
}

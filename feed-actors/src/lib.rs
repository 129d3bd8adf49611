pub mod buffer;
pub mod catch_up;
pub mod data_source;
pub mod event_source;
pub mod feed;
pub mod live_merger;
pub mod metrics;
pub mod pipeline;
pub mod range_query;
pub mod ticker;

pub mod util;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt::{Display, Formatter};

/// Inclusive block interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn is_empty(&self) -> bool {
        self.from > self.to
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.to - self.from + 1
        }
    }

    pub fn contains(&self, block_height: u64) -> bool {
        self.from <= block_height && block_height <= self.to
    }
}

impl Display for BlockRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

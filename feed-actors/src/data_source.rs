use crate::BlockRange;
use feed_protocol::{Event, EventCategory};
use futures_util::future::BoxFuture;
use std::sync::Arc;

mod json_rpc;

pub use json_rpc::{CategoryTopics, JsonRpcDataSource, TRANSFER_TOPIC};

/// Reports the current chain head.
pub trait ChainHead: Send + Sync + 'static {
    fn block_number(&self) -> BoxFuture<'_, anyhow::Result<u64>>;
}

/// Fetches the decoded events of one category emitted within a block range.
pub trait LogQuery: Send + Sync + 'static {
    fn query_logs(
        &self,
        category: EventCategory,
        range: BlockRange,
    ) -> BoxFuture<'_, anyhow::Result<Vec<Event>>>;
}

pub type SharedChainHead = Arc<dyn ChainHead>;
pub type SharedLogQuery = Arc<dyn LogQuery>;

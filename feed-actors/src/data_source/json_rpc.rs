use crate::data_source::{ChainHead, LogQuery};
use crate::util::{format_quantity, parse_hex_bytes, parse_quantity, parse_word, ToHex};
use crate::BlockRange;
use anyhow::{anyhow, Context};
use feed_protocol::{decode_log, Address, Event, EventCategory, RawLog};
use futures_util::future::BoxFuture;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// topic0 of the ERC-20 `Transfer(address,address,uint256)` event.
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// topic0 per category; categories without a topic cannot be queried.
#[derive(Debug, Clone, Default)]
pub struct CategoryTopics(HashMap<EventCategory, [u8; 32]>);

impl CategoryTopics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, category: EventCategory, topic: &str) -> anyhow::Result<Self> {
        let topic = parse_word(topic).with_context(|| format!("invalid {category} topic"))?;
        self.0.insert(category, topic);
        Ok(self)
    }

    pub fn get(&self, category: EventCategory) -> Option<&[u8; 32]> {
        self.0.get(&category)
    }

    pub fn contains(&self, category: EventCategory) -> bool {
        self.0.contains_key(&category)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

impl RpcLog {
    fn into_raw(self) -> anyhow::Result<RawLog> {
        let block_number = self.block_number.context("log without block number")?;
        let log_index = self.log_index.context("log without log index")?;
        Ok(RawLog {
            block_height: parse_quantity(&block_number)?,
            log_index: parse_quantity(&log_index)?,
            address: self
                .address
                .parse::<Address>()
                .map_err(|err| anyhow!("{err}"))?,
            topics: self
                .topics
                .iter()
                .map(|t| parse_word(t))
                .collect::<anyhow::Result<_>>()?,
            data: parse_hex_bytes(&self.data)?,
        })
    }
}

/// Ethereum JSON-RPC implementation of [`ChainHead`] and [`LogQuery`].
#[derive(Debug, Clone)]
pub struct JsonRpcDataSource {
    client: HttpClient,
    topics: CategoryTopics,
    /// Emitter filter for hub events; transfers come from every token contract.
    hub_address: Option<Address>,
}

impl JsonRpcDataSource {
    pub fn new(
        url: &str,
        request_timeout: Duration,
        topics: CategoryTopics,
        hub_address: Option<Address>,
    ) -> anyhow::Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(request_timeout)
            .build(url)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;
        Ok(Self {
            client,
            topics,
            hub_address,
        })
    }

    async fn get_block_number(&self) -> anyhow::Result<u64> {
        let head: String = self
            .client
            .request("eth_blockNumber", rpc_params![])
            .await
            .context("eth_blockNumber failed")?;
        parse_quantity(&head)
    }

    async fn get_logs(
        &self,
        category: EventCategory,
        range: BlockRange,
    ) -> anyhow::Result<Vec<Event>> {
        let topic = self
            .topics
            .get(category)
            .with_context(|| format!("no topic configured for {category}"))?;
        let mut filter = serde_json::json!({
            "fromBlock": format_quantity(range.from),
            "toBlock": format_quantity(range.to),
            "topics": [topic.to_prefixed_hex()],
        });
        if category != EventCategory::Transfer {
            if let Some(hub) = self.hub_address {
                filter["address"] = serde_json::Value::String(hub.to_string());
            }
        }

        let logs: Vec<RpcLog> = self
            .client
            .request("eth_getLogs", rpc_params![filter])
            .await
            .with_context(|| format!("eth_getLogs {category} {range} failed"))?;
        debug!(%category, %range, logs = logs.len(), "Fetched logs");

        let mut events = Vec::with_capacity(logs.len());
        for log in logs.into_iter().filter(|log| !log.removed) {
            let raw = match log.into_raw() {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(%category, %range, ?err, "Skipping malformed log");
                    continue;
                }
            };
            match decode_log(category, &raw) {
                Ok(event) => events.push(event),
                Err(err) => warn!(
                    %category,
                    block = raw.block_height,
                    log_index = raw.log_index,
                    %err,
                    "Skipping undecodable log"
                ),
            }
        }
        events.sort_by_key(|event| event.key);
        Ok(events)
    }
}

impl ChainHead for JsonRpcDataSource {
    fn block_number(&self) -> BoxFuture<'_, anyhow::Result<u64>> {
        Box::pin(self.get_block_number())
    }
}

impl LogQuery for JsonRpcDataSource {
    fn query_logs(
        &self,
        category: EventCategory,
        range: BlockRange,
    ) -> BoxFuture<'_, anyhow::Result<Vec<Event>>> {
        Box::pin(self.get_logs(category, range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_log_into_raw() {
        let log: RpcLog = serde_json::from_value(serde_json::json!({
            "address": "0x1111111111111111111111111111111111111111",
            "topics": [
                TRANSFER_TOPIC,
                "0x0000000000000000000000002222222222222222222222222222222222222222",
                "0x0000000000000000000000003333333333333333333333333333333333333333"
            ],
            "data": "0x0000000000000000000000000000000000000000000000000000000000000064",
            "blockNumber": "0x10",
            "logIndex": "0x2",
            "transactionHash": "0xabc"
        }))
        .unwrap();
        let raw = log.into_raw().unwrap();
        assert_eq!(raw.block_height, 16);
        assert_eq!(raw.log_index, 2);
        assert_eq!(raw.topics.len(), 3);

        let event = decode_log(EventCategory::Transfer, &raw).unwrap();
        let feed_protocol::EventPayload::Transfer { from, amount, .. } = event.payload else {
            panic!("expected transfer");
        };
        assert_eq!(from, Address([0x22; 20]));
        assert_eq!(amount.to_u128(), Some(100));
    }

    #[test]
    fn test_pending_log_is_rejected() {
        let log: RpcLog = serde_json::from_value(serde_json::json!({
            "address": "0x1111111111111111111111111111111111111111",
            "topics": [TRANSFER_TOPIC],
            "data": "0x",
            "blockNumber": null,
            "logIndex": null
        }))
        .unwrap();
        assert!(log.into_raw().is_err());
    }

    #[test]
    fn test_category_topics() {
        let topics = CategoryTopics::new()
            .with(EventCategory::Transfer, TRANSFER_TOPIC)
            .unwrap();
        assert!(topics.contains(EventCategory::Transfer));
        assert!(!topics.contains(EventCategory::Trust));
        assert!(CategoryTopics::new()
            .with(EventCategory::Trust, "0x12")
            .is_err());
    }
}

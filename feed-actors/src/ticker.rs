use crate::data_source::SharedChainHead;
use crate::metrics::SharedMetrics;
use futures_util::FutureExt;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Published whenever the observed chain head changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBlock {
    pub height: u64,
}

/// Subscription point for block ticks.
#[derive(Clone)]
pub struct TickHub {
    block_tx: broadcast::Sender<NewBlock>,
    head_rx: watch::Receiver<Option<u64>>,
}

impl TickHub {
    pub fn subscribe(&self) -> broadcast::Receiver<NewBlock> {
        self.block_tx.subscribe()
    }

    /// Latest observed head, including the silent first observation.
    pub fn head(&self) -> Option<u64> {
        *self.head_rx.borrow()
    }

    pub async fn wait_for_head(&self) -> anyhow::Result<u64> {
        let mut head_rx = self.head_rx.clone();
        let head = *head_rx.wait_for(Option::is_some).await?;
        head.ok_or_else(|| anyhow::anyhow!("head watch yielded no value"))
    }
}

pub struct BlockTicker {
    chain: SharedChainHead,
    interval: Duration,
    last_observed: Option<u64>,
    block_tx: broadcast::Sender<NewBlock>,
    head_tx: watch::Sender<Option<u64>>,
    shutdown: oneshot::Receiver<()>,
    metrics: SharedMetrics,
}

impl BlockTicker {
    pub fn new(
        chain: SharedChainHead,
        interval: Duration,
        shutdown: oneshot::Receiver<()>,
        metrics: SharedMetrics,
    ) -> (Self, TickHub) {
        let (block_tx, _) = broadcast::channel(64);
        let (head_tx, head_rx) = watch::channel(None);
        let hub = TickHub {
            block_tx: block_tx.clone(),
            head_rx,
        };
        let ticker = Self {
            chain,
            interval,
            last_observed: None,
            block_tx,
            head_tx,
            shutdown,
            metrics,
        };
        (ticker, hub)
    }

    /// Records an observed height and returns the tick to publish, if any.
    /// The first observation only sets the baseline.
    pub fn observe(&mut self, height: u64) -> Option<NewBlock> {
        self.head_tx.send_replace(Some(height));
        self.metrics.set_latest_block(height);
        match self.last_observed.replace(height) {
            None => None,
            Some(last) if last == height => None,
            Some(last) => {
                if height < last {
                    warn!(last, height, "Chain head moved backwards");
                }
                Some(NewBlock { height })
            }
        }
    }

    pub async fn process(mut self) -> anyhow::Result<()> {
        info!(interval_ms = self.interval.as_millis() as u64, "Block ticker started");
        let mut t = tokio::time::interval(self.interval);
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = (&mut self.shutdown).fuse() => {
                    info!("Block ticker received shutdown");
                    return Ok(());
                }
                _ = t.tick() => {
                    match self.chain.block_number().await {
                        Ok(height) => {
                            if let Some(tick) = self.observe(height) {
                                debug!(height, "New block");
                                // no subscribers is fine, sources may not be running yet
                                _ = self.block_tx.send(tick);
                            }
                        }
                        Err(err) => error!(err = ?err, "Error polling chain head"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::create_shared_metrics;
    use crate::testing::MockChain;

    fn ticker(chain: std::sync::Arc<MockChain>) -> (BlockTicker, TickHub, oneshot::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ticker, hub) = BlockTicker::new(
            chain,
            Duration::from_secs(1),
            shutdown_rx,
            create_shared_metrics(),
        );
        (ticker, hub, shutdown_tx)
    }

    #[test]
    fn test_repeated_height_is_not_published() {
        let (mut ticker, hub, _shutdown) = ticker(MockChain::new());
        assert_eq!(ticker.observe(100), None);
        assert_eq!(ticker.observe(100), None);
        assert_eq!(ticker.observe(101), Some(NewBlock { height: 101 }));
        assert_eq!(ticker.observe(101), None);
        assert_eq!(hub.head(), Some(101));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_publishes_changes_and_survives_errors() {
        let chain = MockChain::new();
        chain.set_head(100);
        let (ticker, hub, shutdown) = ticker(chain.clone());
        let mut ticks = hub.subscribe();
        let task = tokio::spawn(ticker.process());

        assert_eq!(hub.wait_for_head().await.unwrap(), 100);
        chain.fail_head(2);
        chain.set_head(101);
        assert_eq!(ticks.recv().await.unwrap(), NewBlock { height: 101 });
        chain.set_head(103);
        assert_eq!(ticks.recv().await.unwrap(), NewBlock { height: 103 });

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(ticks.try_recv().is_err());
    }
}

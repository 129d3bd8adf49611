use crate::buffer::{BufferError, BufferHandle};
use crate::event_source::LiveBatch;
use feed_protocol::{Event, EventCategory, Key};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Joins the per-category live streams into the shared buffer.
///
/// Sources advance at their own pace, so events are held back until every category has
/// reached their block. Only blocks at or below the lowest watermark are released, which
/// keeps inserts into the shared buffer strictly above anything a feed already streamed.
pub struct LiveMerger {
    buffer: BufferHandle,
    live_rx: flume::Receiver<LiveBatch>,
    watermarks: HashMap<EventCategory, u64>,
    pending: BTreeMap<Key, Event>,
    released: u64,
    released_tx: watch::Sender<u64>,
    shutdown: oneshot::Receiver<()>,
}

impl LiveMerger {
    /// `caught_up` is the last block already present in the shared buffer.
    pub fn new(
        buffer: BufferHandle,
        live_rx: flume::Receiver<LiveBatch>,
        categories: &[EventCategory],
        caught_up: u64,
        shutdown: oneshot::Receiver<()>,
    ) -> (Self, watch::Receiver<u64>) {
        let (released_tx, released_rx) = watch::channel(caught_up);
        let merger = Self {
            buffer,
            live_rx,
            watermarks: categories.iter().map(|&c| (c, caught_up)).collect(),
            pending: BTreeMap::new(),
            released: caught_up,
            released_tx,
            shutdown,
        };
        (merger, released_rx)
    }

    pub async fn process(mut self) -> Result<(), BufferError> {
        info!(released = self.released, "Live merger started");
        loop {
            tokio::select! {
                biased;
                _ = &mut self.shutdown => {
                    info!(released = self.released, "Live merger received shutdown");
                    return Ok(());
                }
                batch = self.live_rx.recv_async() => match batch {
                    Ok(batch) => {
                        if let Some((height, events)) = self.accept(batch) {
                            self.release(height, events).await?;
                        }
                    }
                    Err(_) => {
                        info!(released = self.released, "All live streams closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Folds a batch in and returns what became releasable.
    fn accept(&mut self, batch: LiveBatch) -> Option<(u64, Vec<Event>)> {
        let Some(watermark) = self.watermarks.get_mut(&batch.category) else {
            warn!(category = %batch.category, "Ignoring batch of an unmerged category");
            return None;
        };
        *watermark = (*watermark).max(batch.watermark);
        for event in batch.events {
            if event.key.block_height <= self.released {
                warn!(key = %event.key, released = self.released, "Dropping late live event");
                continue;
            }
            self.pending.insert(event.key, event);
        }

        let lowest = self.watermarks.values().copied().min()?;
        if lowest <= self.released {
            return None;
        }
        let held = self.pending.split_off(&Key::block_start(lowest + 1));
        let ready = std::mem::replace(&mut self.pending, held);
        Some((lowest, ready.into_values().collect()))
    }

    /// A parked feed is woken on every release, even an empty one, so quiet blocks
    /// still count as progress for its continue timeout.
    async fn release(&mut self, height: u64, events: Vec<Event>) -> Result<(), BufferError> {
        let count = events.len();
        if count > 0 {
            self.buffer.insert_batch(events).await?;
        }
        self.buffer.continue_feed().await?;
        self.released = height;
        self.released_tx.send_replace(height);
        debug!(height, events = count, held = self.pending.len(), "Released live events");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferCommand, EventBuffer};
    use crate::feed::FeedTimeouts;
    use crate::metrics::create_shared_metrics;
    use crate::testing::{event, keys};

    fn batch(category: EventCategory, watermark: u64, blocks: &[(u64, u64)]) -> LiveBatch {
        LiveBatch {
            category,
            watermark,
            events: blocks.iter().map(|&(b, i)| event(category, b, i)).collect(),
        }
    }

    #[test]
    fn test_holds_events_until_every_category_caught_up() {
        let (buffer, _rx) = {
            let (command_tx, command_rx) = flume::unbounded();
            (BufferHandle { command_tx }, command_rx)
        };
        let (_, live_rx) = flume::unbounded();
        let (_shutdown, shutdown_rx) = oneshot::channel();
        let categories = [EventCategory::Signup, EventCategory::Trust];
        let (mut merger, _) = LiveMerger::new(buffer, live_rx, &categories, 100, shutdown_rx);

        let trust = batch(EventCategory::Trust, 105, &[(103, 0), (105, 1)]);
        assert_eq!(merger.accept(trust), None);

        let signup = batch(EventCategory::Signup, 104, &[(104, 0), (101, 2)]);
        let (height, events) = merger.accept(signup).unwrap();
        assert_eq!(height, 104);
        assert_eq!(
            keys(&events),
            vec![Key::new(101, 2), Key::new(103, 0), Key::new(104, 0)]
        );
        assert_eq!(merger.pending.len(), 1);
    }

    #[test]
    fn test_late_events_are_dropped() {
        let (command_tx, _command_rx) = flume::unbounded();
        let (_, live_rx) = flume::unbounded();
        let (_shutdown, shutdown_rx) = oneshot::channel();
        let (mut merger, _) = LiveMerger::new(
            BufferHandle { command_tx },
            live_rx,
            &[EventCategory::Transfer],
            50,
            shutdown_rx,
        );
        let (height, events) = merger
            .accept(batch(EventCategory::Transfer, 52, &[(50, 0), (51, 0)]))
            .unwrap();
        assert_eq!(height, 52);
        assert_eq!(keys(&events), vec![Key::new(51, 0)]);
        assert_eq!(
            merger.accept(batch(EventCategory::Signup, 60, &[(55, 0)])),
            None
        );
    }

    #[tokio::test]
    async fn test_empty_release_still_continues_feed() {
        let (command_tx, command_rx) = flume::unbounded();
        let (live_tx, live_rx) = flume::unbounded();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let (merger, mut released) = LiveMerger::new(
            BufferHandle { command_tx },
            live_rx,
            &[EventCategory::OrganizationSignup],
            30,
            shutdown_rx,
        );
        let task = tokio::spawn(merger.process());

        live_tx
            .send(batch(EventCategory::OrganizationSignup, 31, &[]))
            .unwrap();
        released.wait_for(|h| *h == 31).await.unwrap();
        let commands: Vec<BufferCommand> = command_rx.drain().collect();
        assert_eq!(commands.len(), 1);
        assert!(matches!(commands[0], BufferCommand::ContinueFeed));

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_releases_into_shared_buffer() {
        let metrics = create_shared_metrics();
        let (buffer, _) = EventBuffer::spawn("shared", FeedTimeouts::default(), metrics);
        let (live_tx, live_rx) = flume::unbounded();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let categories = [EventCategory::Signup, EventCategory::Trust];
        let (merger, mut released) =
            LiveMerger::new(buffer.clone(), live_rx, &categories, 10, shutdown_rx);
        let task = tokio::spawn(merger.process());

        live_tx
            .send(batch(EventCategory::Signup, 12, &[(11, 0), (12, 0)]))
            .unwrap();
        live_tx
            .send(batch(EventCategory::Trust, 11, &[(11, 1)]))
            .unwrap();
        let height = *released.wait_for(|h| *h == 11).await.unwrap();
        assert_eq!(height, 11);
        assert_eq!(
            keys(&buffer.take_all().await.unwrap()),
            vec![Key::new(11, 0), Key::new(11, 1)]
        );

        shutdown.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}

use crate::data_source::{ChainHead, LogQuery};
use crate::BlockRange;
use anyhow::{anyhow, bail};
use feed_protocol::{Address, Amount, Event, EventCategory, EventPayload, Key};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) fn event(category: EventCategory, block_height: u64, log_index: u64) -> Event {
    let who = Address([block_height as u8; 20]);
    let payload = match category {
        EventCategory::Signup => EventPayload::Signup {
            user: who,
            token: Address([0xaa; 20]),
        },
        EventCategory::OrganizationSignup => EventPayload::OrganizationSignup { organization: who },
        EventCategory::Trust => EventPayload::Trust {
            can_send_to: who,
            user: Address([0xbb; 20]),
            limit: 100,
        },
        EventCategory::Transfer => EventPayload::Transfer {
            token: Address([0xcc; 20]),
            from: who,
            to: Address([0xdd; 20]),
            amount: Amount::default(),
        },
    };
    Event {
        key: Key::new(block_height, log_index),
        address: Address([0xee; 20]),
        payload,
    }
}

pub(crate) fn keys(events: &[Event]) -> Vec<Key> {
    events.iter().map(|e| e.key).collect()
}

#[derive(Default)]
struct MockState {
    head: Option<u64>,
    head_errors: u32,
    events: Vec<Event>,
    query_errors: HashMap<EventCategory, u32>,
    query_panics: HashMap<EventCategory, u32>,
    calls: Vec<(EventCategory, BlockRange)>,
}

/// Scriptable in-memory chain.
#[derive(Default)]
pub(crate) struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().head = Some(head);
    }

    pub fn fail_head(&self, times: u32) {
        self.state.lock().head_errors = times;
    }

    pub fn push(&self, events: impl IntoIterator<Item = Event>) {
        self.state.lock().events.extend(events);
    }

    pub fn fail_queries(&self, category: EventCategory, times: u32) {
        self.state.lock().query_errors.insert(category, times);
    }

    pub fn panic_queries(&self, category: EventCategory, times: u32) {
        self.state.lock().query_panics.insert(category, times);
    }

    pub fn calls_for(&self, category: EventCategory) -> Vec<BlockRange> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(c, _)| *c == category)
            .map(|(_, range)| *range)
            .collect()
    }
}

fn take_one(counter: Option<&mut u32>) -> bool {
    match counter {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

impl ChainHead for MockChain {
    fn block_number(&self) -> BoxFuture<'_, anyhow::Result<u64>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.head_errors > 0 {
                state.head_errors -= 1;
                bail!("head unavailable");
            }
            state.head.ok_or_else(|| anyhow!("no head yet"))
        })
    }
}

impl LogQuery for MockChain {
    fn query_logs(
        &self,
        category: EventCategory,
        range: BlockRange,
    ) -> BoxFuture<'_, anyhow::Result<Vec<Event>>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.calls.push((category, range));
            if take_one(state.query_panics.get_mut(&category)) {
                drop(state);
                panic!("scripted query panic for {category} {range}");
            }
            if take_one(state.query_errors.get_mut(&category)) {
                bail!("scripted query failure for {category} {range}");
            }
            let mut events: Vec<Event> = state
                .events
                .iter()
                .filter(|e| e.category() == category && range.contains(e.key.block_height))
                .cloned()
                .collect();
            events.sort_by_key(|e| e.key);
            Ok(events)
        })
    }
}

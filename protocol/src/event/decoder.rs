use crate::event::{Address, Amount, Event, EventCategory, EventPayload, Key};
use thiserror::Error;

/// Undecoded log as returned by the chain, already filtered to one category's topic0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub block_height: u64,
    pub log_index: u64,
    pub address: Address,
    pub topics: Vec<[u8; 32]>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("log has {found} topics, expected at least {expected}")]
    MissingTopic { expected: usize, found: usize },
    #[error("log data has {found} bytes, expected at least {expected}")]
    DataTooShort { expected: usize, found: usize },
    #[error("field `{field}` does not fit into u64")]
    ValueOverflow { field: &'static str },
}

pub fn decode_log(category: EventCategory, log: &RawLog) -> Result<Event, DecodeError> {
    let expected_topics = category.indexed_fields() + 1;
    if log.topics.len() < expected_topics {
        return Err(DecodeError::MissingTopic {
            expected: expected_topics,
            found: log.topics.len(),
        });
    }
    let topic_address = |i: usize| Address::from_word(&log.topics[i]);

    let payload = match category {
        EventCategory::Signup => EventPayload::Signup {
            user: topic_address(1),
            token: Address::from_word(&data_word(&log.data, 0)?),
        },
        EventCategory::OrganizationSignup => EventPayload::OrganizationSignup {
            organization: topic_address(1),
        },
        EventCategory::Trust => EventPayload::Trust {
            can_send_to: topic_address(1),
            user: topic_address(2),
            limit: word_to_u64(&data_word(&log.data, 0)?, "limit")?,
        },
        EventCategory::Transfer => EventPayload::Transfer {
            token: log.address,
            from: topic_address(1),
            to: topic_address(2),
            amount: Amount(data_word(&log.data, 0)?),
        },
    };

    Ok(Event {
        key: Key::new(log.block_height, log.log_index),
        address: log.address,
        payload,
    })
}

fn data_word(data: &[u8], index: usize) -> Result<[u8; 32], DecodeError> {
    let end = (index + 1) * 32;
    let slice = data.get(index * 32..end).ok_or(DecodeError::DataTooShort {
        expected: end,
        found: data.len(),
    })?;
    let mut word = [0u8; 32];
    word.copy_from_slice(slice);
    Ok(word)
}

fn word_to_u64(word: &[u8; 32], field: &'static str) -> Result<u64, DecodeError> {
    let (high, low) = word.split_at(24);
    if high.iter().any(|b| *b != 0) {
        return Err(DecodeError::ValueOverflow { field });
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(low);
    Ok(u64::from_be_bytes(bytes))
}

use serde::{Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

pub mod decoder;

/// Position of an event in the chain log: block height first, then log index within the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct Key {
    pub block_height: u64,
    pub log_index: u64,
}

impl Key {
    pub const fn new(block_height: u64, log_index: u64) -> Self {
        Self {
            block_height,
            log_index,
        }
    }

    /// Smallest key of the given block.
    pub const fn block_start(block_height: u64) -> Self {
        Self::new(block_height, 0)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.block_height, self.log_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Signup,
    OrganizationSignup,
    Trust,
    Transfer,
}

impl EventCategory {
    pub const ALL: [EventCategory; 4] = [
        EventCategory::Signup,
        EventCategory::OrganizationSignup,
        EventCategory::Trust,
        EventCategory::Transfer,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Signup => "signup",
            EventCategory::OrganizationSignup => "organization_signup",
            EventCategory::Trust => "trust",
            EventCategory::Transfer => "transfer",
        }
    }

    /// Number of indexed topics following topic0 in the emitted log.
    pub const fn indexed_fields(&self) -> usize {
        match self {
            EventCategory::Signup | EventCategory::OrganizationSignup => 1,
            EventCategory::Trust | EventCategory::Transfer => 2,
        }
    }
}

impl Display for EventCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event category `{0}`")]
pub struct UnknownCategory(pub String);

impl FromStr for EventCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventCategory::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Takes the low 20 bytes of an abi-encoded word.
    pub fn from_word(word: &[u8; 32]) -> Self {
        let mut inner = [0u8; 20];
        inner.copy_from_slice(&word[12..]);
        Self(inner)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", faster_hex::hex_string(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address `{0}`")]
pub struct InvalidAddress(pub String);

impl FromStr for Address {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("0x").unwrap_or(s);
        let mut inner = [0u8; 20];
        if hex.len() != inner.len() * 2 {
            return Err(InvalidAddress(s.to_string()));
        }
        faster_hex::hex_decode(hex.as_bytes(), &mut inner)
            .map_err(|_| InvalidAddress(s.to_string()))?;
        Ok(Self(inner))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Unsigned 256-bit big-endian value as found in log data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(pub [u8; 32]);

impl Amount {
    pub fn to_u128(&self) -> Option<u128> {
        let (high, low) = self.0.split_at(16);
        if high.iter().any(|b| *b != 0) {
            return None;
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(low);
        Some(u128::from_be_bytes(bytes))
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let hex = faster_hex::hex_string(&self.0);
        let trimmed = hex.trim_start_matches('0');
        if trimmed.is_empty() {
            f.write_str("0x0")
        } else {
            write!(f, "0x{trimmed}")
        }
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum EventPayload {
    Signup {
        user: Address,
        token: Address,
    },
    OrganizationSignup {
        organization: Address,
    },
    Trust {
        can_send_to: Address,
        user: Address,
        limit: u64,
    },
    Transfer {
        token: Address,
        from: Address,
        to: Address,
        amount: Amount,
    },
}

impl EventPayload {
    pub fn category(&self) -> EventCategory {
        match self {
            EventPayload::Signup { .. } => EventCategory::Signup,
            EventPayload::OrganizationSignup { .. } => EventCategory::OrganizationSignup,
            EventPayload::Trust { .. } => EventCategory::Trust,
            EventPayload::Transfer { .. } => EventCategory::Transfer,
        }
    }
}

/// A decoded chain event. Identity is the key; two events with the same key are the same event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub key: Key,
    /// Contract that emitted the log.
    pub address: Address,
    pub payload: EventPayload,
}

impl Event {
    pub fn category(&self) -> EventCategory {
        self.payload.category()
    }
}

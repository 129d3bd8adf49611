use anyhow::{bail, Context};
use feed_actors::data_source::{CategoryTopics, TRANSFER_TOPIC};
use feed_actors::feed::{FeedMode, FeedTimeouts};
use feed_protocol::{Address, EventCategory};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;

/// Comma separated category names, e.g. `signup,trust`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryList(pub Vec<EventCategory>);

impl Default for CategoryList {
    fn default() -> Self {
        Self(EventCategory::ALL.to_vec())
    }
}

impl FromStr for CategoryList {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut categories = Vec::new();
        for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            let category = name.parse::<EventCategory>()?;
            if !categories.contains(&category) {
                categories.push(category);
            }
        }
        if categories.is_empty() {
            bail!("category list is empty");
        }
        Ok(Self(categories))
    }
}

impl Display for CategoryList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, category) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{category}")?;
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct FeederConfig {
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_rust_log")]
    pub rust_log: LevelFilter,
    /// Daily rolling log files are written here when set.
    pub log_dir: Option<PathBuf>,

    pub rpc_url: String,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub hub_address: Option<Address>,
    pub signup_topic: Option<String>,
    pub organization_signup_topic: Option<String>,
    pub trust_topic: Option<String>,
    #[serde(default = "default_transfer_topic")]
    pub transfer_topic: String,

    #[serde(default)]
    pub start_block: u64,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub categories: CategoryList,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Unset means an infinite feed waits for new blocks without limit.
    pub continue_timeout_ms: Option<u64>,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_feed_mode")]
    pub feed_mode: FeedMode,
    #[serde(default = "default_consume")]
    pub consume: bool,
    #[serde(default = "default_max_worker_retries")]
    pub max_worker_retries: u32,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_healthy_after_secs")]
    pub healthy_after_secs: u64,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

impl FeederConfig {
    pub fn topics(&self) -> anyhow::Result<CategoryTopics> {
        let mut topics = CategoryTopics::new();
        for &category in &self.categories.0 {
            let topic = match category {
                EventCategory::Signup => self.signup_topic.as_deref(),
                EventCategory::OrganizationSignup => self.organization_signup_topic.as_deref(),
                EventCategory::Trust => self.trust_topic.as_deref(),
                EventCategory::Transfer => Some(self.transfer_topic.as_str()),
            };
            let topic = topic.with_context(|| {
                format!("{} is selected but has no topic configured", category)
            })?;
            topics = topics.with(category, topic)?;
        }
        Ok(topics)
    }

    pub fn timeouts(&self) -> FeedTimeouts {
        FeedTimeouts {
            connect: Some(Duration::from_millis(self.connect_timeout_ms)),
            continue_after_eof: self.continue_timeout_ms.map(Duration::from_millis),
        }
    }
}

fn default_rust_log() -> LevelFilter {
    LevelFilter::INFO
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_transfer_topic() -> String {
    TRANSFER_TOPIC.to_string()
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_feed_mode() -> FeedMode {
    FeedMode::Infinite
}

fn default_consume() -> bool {
    true
}

fn default_max_worker_retries() -> u32 {
    3
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay_ms() -> u64 {
    5_000
}

fn default_healthy_after_secs() -> u64 {
    60
}

fn default_metrics_interval_secs() -> u64 {
    60
}

pub fn get_feeder_config() -> anyhow::Result<FeederConfig> {
    Ok(envy::from_env::<FeederConfig>()?)
}

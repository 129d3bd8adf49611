use feed_actors::data_source::{CategoryTopics, TRANSFER_TOPIC};
use feed_protocol::{Address, EventCategory};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use tracing::level_filters::LevelFilter;

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct CliConfig {
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_rust_log")]
    pub rust_log: LevelFilter,
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
}

impl CliConfig {
    /// Topics of every category that has one configured.
    pub fn topics(&self) -> anyhow::Result<CategoryTopics> {
        let configured = [
            (EventCategory::Signup, self.signup_topic.as_deref()),
            (
                EventCategory::OrganizationSignup,
                self.organization_signup_topic.as_deref(),
            ),
            (EventCategory::Trust, self.trust_topic.as_deref()),
            (EventCategory::Transfer, Some(self.transfer_topic.as_str())),
        ];
        let mut topics = CategoryTopics::new();
        for (category, topic) in configured {
            if let Some(topic) = topic {
                topics = topics.with(category, topic)?;
            }
        }
        Ok(topics)
    }
}

fn default_rust_log() -> LevelFilter {
    LevelFilter::WARN
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_transfer_topic() -> String {
    TRANSFER_TOPIC.to_string()
}

pub fn get_cli_config() -> anyhow::Result<CliConfig> {
    Ok(envy::from_env::<CliConfig>()?)
}

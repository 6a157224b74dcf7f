use std::time::Duration;

use anyhow::Result;
use serde_derive::Deserialize;

/// Settings of one ephemeral reply queue.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReplyQueueConfig {
    /// Prefix of the generated queue name, a random suffix is appended per
    /// queue instance.
    pub name: String,
    /// Queue-level retention of undelivered responses, in seconds.
    pub message_retention_period: u64,
    /// Age at which a parked response is evicted, in seconds.
    pub seconds_before_cleaning: u64,
    /// Number of parked responses above which the oldest are evicted.
    pub num_messages_before_cleaning: usize,
    /// Pause between heartbeat refreshes, in seconds.
    pub heartbeat_interval_seconds: u64,
    /// Name of the shared tracking queue this reply queue announces itself
    /// on.
    pub tracking_queue: String,
}

impl Default for ReplyQueueConfig {
    fn default() -> ReplyQueueConfig {
        ReplyQueueConfig {
            name: "replymq-reply".to_string(),
            message_retention_period: 600,
            seconds_before_cleaning: 60,
            num_messages_before_cleaning: 200,
            heartbeat_interval_seconds: 30,
            tracking_queue: "replymq-tracking".to_string(),
        }
    }
}

impl ReplyQueueConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn cleaning_age(&self) -> Duration {
        Duration::from_secs(self.seconds_before_cleaning)
    }
}

/// Settings of the orphan sweeper.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Name of the tracking queue the sweeper scans.
    pub tracking_queue: String,
    /// Seconds a queue may go without a heartbeat before it is considered
    /// orphaned. Queues announcing a longer heartbeat interval get twice
    /// that interval instead.
    pub grace_period_seconds: u64,
    /// Pause between sweep passes, in seconds.
    pub sweep_interval_seconds: u64,
}

impl Default for SweeperConfig {
    fn default() -> SweeperConfig {
        SweeperConfig {
            tracking_queue: "replymq-tracking".to_string(),
            grace_period_seconds: 90,
            sweep_interval_seconds: 60,
        }
    }
}

impl SweeperConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Top level of a TOML configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub reply_queue: ReplyQueueConfig,
    pub sweeper: SweeperConfig,
}

pub fn parse_config(path: &str) -> Result<Config> {
    let cfg = std::fs::read_to_string(path)?;
    let config = toml::from_str::<Config>(&cfg)?;

    Ok(config)
}

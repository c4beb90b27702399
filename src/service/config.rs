extern crate config as _;

use std::path::Path;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<RelayConfig> = OnceCell::new();
pub fn global_config() -> &'static RelayConfig {
    GLOBAL_CONFIG.get().unwrap()
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct SourceConfig {
    pub bootstrap_servers: String,
    pub topic: String,
    pub group_id: String,
    /// capacity of the in-memory event channel behind `ChannelSource`
    pub channel_capacity: usize,
    pub synthetic: SyntheticConfig,
}

/// Knobs for the demo binary's synthetic record feeder.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct SyntheticConfig {
    pub partitions: i32,
    pub records_per_batch: usize,
    pub batch_interval_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
pub struct DownstreamConfig {
    pub endpoint: String,
    /// per-call timeout, distinct from any retry delay
    pub timeout_ms: u64,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    /// upper bound on simultaneously active dispatch tasks
    pub max_concurrency: usize,
    /// upper bound on simultaneously active dispatch tasks per partition
    pub per_partition_limit: usize,
    pub dead_letter_capacity: usize,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub poll_max_wait_ms: u64,
    /// how often committable watermarks are flushed to the source
    pub commit_interval_ms: u64,
    /// consecutive commit failures tolerated before the pipeline gives up
    pub max_commit_failures: u32,
    pub shutdown_grace_ms: u64,
    /// backoff applied to the poll loop after a broker error
    pub poll_backoff_ms: u64,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    pub source: SourceConfig,
    pub downstream: DownstreamConfig,
    pub dispatcher: DispatcherConfig,
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
}

impl RelayConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<RelayConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let relay_config: RelayConfig = config.try_deserialize()?;

        Ok(relay_config)
    }
}

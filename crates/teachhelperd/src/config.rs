//! Daemon configuration from flags and `TEACHHELPER_*` environment variables.

use std::time::Duration;

use clap::Parser;
use teachhelper_core::{BatchConfig, RetryPolicy};
use tracing::Level;

/// Upper bound on task record retention (ten years).
const MAX_RETENTION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Parser, Debug, Clone)]
#[command(name = "teachhelperd")]
#[command(author = "TeachHelper Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "TeachHelper batch evaluation daemon", long_about = None)]
pub struct DaemonConfig {
    /// Emit JSON-formatted log lines
    #[arg(long, env = "TEACHHELPER_LOG_JSON")]
    pub log_json: bool,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "TEACHHELPER_LOG_LEVEL", default_value = "info")]
    pub log_level: Level,

    /// Evaluations running at once within one batch
    #[arg(long, env = "TEACHHELPER_MAX_CONCURRENCY", default_value_t = 4)]
    pub max_concurrency: usize,

    /// Attempts per evaluation, including the first
    #[arg(long, env = "TEACHHELPER_MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Base retry backoff; attempt n waits n times this
    #[arg(long, env = "TEACHHELPER_RETRY_BACKOFF_MS", default_value_t = 1000)]
    pub retry_backoff_ms: u64,

    /// How many task updates a slow subscriber may lag behind
    #[arg(long, env = "TEACHHELPER_UPDATE_CAPACITY", default_value_t = 256)]
    pub update_capacity: usize,

    /// Seconds between task record pruning runs
    #[arg(long, env = "TEACHHELPER_PRUNE_INTERVAL_SECS", default_value_t = 60)]
    pub prune_interval_secs: u64,

    /// Seconds a finished task record is kept
    #[arg(long, env = "TEACHHELPER_TASK_RETENTION_SECS", default_value_t = 3600)]
    pub task_retention_secs: u64,

    /// Seconds between runtime stats reports
    #[arg(long, env = "TEACHHELPER_STATS_INTERVAL_SECS", default_value_t = 60)]
    pub stats_interval_secs: u64,
}

impl DaemonConfig {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_concurrency: self.max_concurrency.max(1),
            retry: RetryPolicy {
                max_attempts: self.max_attempts.max(1),
                backoff: Duration::from_millis(self.retry_backoff_ms),
            },
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.task_retention_secs.min(MAX_RETENTION_SECS) as i64)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }
}

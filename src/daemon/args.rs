use std::path::PathBuf;

use clap::Parser;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
pub struct DaemonArgs {
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// Seconds without input before the user counts as idle.
    #[arg(long = "idle-threshold", default_value_t = 300.0)]
    pub idle_threshold: f64,
    /// Milliseconds between focus probe samples.
    #[arg(long = "poll-interval", default_value_t = 1000)]
    pub poll_interval_ms: u64,
    /// When set, partitions older than this many days are deleted on startup.
    #[arg(long = "retention-days")]
    pub retention_days: Option<u32>,
    /// This option is for debugging purposes only.
    #[arg(long = "log-console")]
    pub log_console: bool,
    #[arg(long = "log-filter")]
    pub log: Option<LevelFilter>,
}

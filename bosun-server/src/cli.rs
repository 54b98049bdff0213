use std::path::PathBuf;

use anyhow::Context;
use bosun_config::{BosunConfig, BosunConfigSource};
use bosun_model::LogLevel;
use clap::Parser;

/// CLI entry point
#[derive(Parser, Debug, Default)]
#[command(name = "bosun")]
#[command(about = "Runs workspace jobs and supervises project processes")]
pub struct Cli {
    /// Config file (TOML or JSON). Without it `BOSUN_CONFIG_PATH`,
    /// `BOSUN_CONFIG_JSON` and the default locations are tried.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of jobs allowed to run at once (overrides config)
    #[arg(long, env = "BOSUN_JOB_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Minimum level recorded in the logbook (overrides config)
    #[arg(long, env = "BOSUN_LOG_LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Logbook entries to retain (overrides config)
    #[arg(long, env = "BOSUN_LOG_CAP")]
    pub log_cap: Option<usize>,

    /// Bus messages retained for replay (overrides config)
    #[arg(long, env = "BOSUN_HISTORY_CAP")]
    pub history_cap: Option<usize>,

    /// Root directory for project checkouts (overrides config)
    #[arg(long, env = "BOSUN_WORKSPACES_DIR")]
    pub workspaces_dir: Option<PathBuf>,

    /// Graceful shutdown budget in milliseconds (overrides config)
    #[arg(long)]
    pub shutdown_timeout_ms: Option<u64>,
}

impl Cli {
    /// Loads the configuration and applies command-line overrides.
    pub fn load_config(&self) -> anyhow::Result<(BosunConfig, BosunConfigSource)> {
        let (mut config, source) = match &self.config {
            Some(path) => {
                let config = BosunConfig::load_from_file(path)
                    .with_context(|| format!("loading --config {}", path.display()))?;
                (config, BosunConfigSource::File(path.clone()))
            }
            None => BosunConfig::load_from_env()?,
        };
        self.apply_overrides(&mut config);
        Ok((config, source))
    }

    pub fn apply_overrides(&self, config: &mut BosunConfig) {
        let runtime = &mut config.runtime;
        if let Some(concurrency) = self.concurrency {
            runtime.jobs.concurrency = concurrency;
        }
        if let Some(level) = self.log_level {
            runtime.log.level = level;
        }
        if let Some(cap) = self.log_cap {
            runtime.log.cap = cap;
        }
        if let Some(cap) = self.history_cap {
            runtime.bus.history_cap = cap;
        }
        if let Some(dir) = &self.workspaces_dir {
            runtime.workspaces_dir = Some(dir.clone());
        }
        if let Some(timeout) = self.shutdown_timeout_ms {
            runtime.process.graceful_shutdown_timeout_ms = timeout;
        }
    }
}

use std::path::PathBuf;
use std::time::Duration;

use bosun_model::LogLevel;
use serde::{Deserialize, Serialize};

/// Knobs for every runtime component.
///
/// Each section defaults independently so a config file only needs the
/// values it wants to change.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub jobs: JobsConfig,
    pub bus: BusConfig,
    pub log: LogConfig,
    pub process: ProcessConfig,
    /// Root under which project checkouts live. `None` lets the loader pick
    /// a per-user default.
    pub workspaces_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Number of jobs allowed to run at the same time.
    pub concurrency: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self { concurrency: 2 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Messages retained for replay.
    pub history_cap: usize,
    /// Per-subscriber delivery buffer; overflow is dropped.
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_cap: 1_000,
            subscriber_buffer: 1_024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Entries below this level are dropped.
    pub level: LogLevel,
    /// Entries retained in the logbook.
    pub cap: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            cap: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub shell: String,
    /// Arguments placed before the command string.
    pub shell_args: Vec<String>,
    /// Pause after forwarding each output line.
    pub line_delay_ms: u64,
    /// How long `clean` waits for stopped processes to exit.
    pub stop_timeout_ms: u64,
    /// Upper bound for the whole shutdown sequence of the daemon.
    pub graceful_shutdown_timeout_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            shell_args: vec!["-l".to_string(), "-c".to_string()],
            line_delay_ms: 10,
            stop_timeout_ms: 10_000,
            graceful_shutdown_timeout_ms: 20_000,
        }
    }
}

impl ProcessConfig {
    pub fn line_delay(&self) -> Duration {
        Duration::from_millis(self.line_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }
}

use anyhow::{Context, anyhow};
use bosun_core::RuntimeConfig;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Where the daemon configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BosunConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

/// Daemon settings: the runtime knobs plus process-level concerns.
///
/// Runtime sections (`[jobs]`, `[bus]`, `[log]`, `[process]`) sit at the top
/// level of the file next to the daemon keys.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BosunConfig {
    /// `tracing` filter used when `RUST_LOG` is unset, e.g. `info` or
    /// `bosun=debug,info`.
    pub log_filter: String,
    #[serde(flatten)]
    pub runtime: RuntimeConfig,
}

impl Default for BosunConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Names a config file to load.
pub const CONFIG_PATH_ENV: &str = "BOSUN_CONFIG_PATH";
/// Holds a whole config as inline JSON.
pub const CONFIG_JSON_ENV: &str = "BOSUN_CONFIG_JSON";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

impl Format {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    fn parse(self, text: &str) -> anyhow::Result<BosunConfig> {
        match self {
            Self::Toml => toml::from_str(text).context("invalid TOML"),
            Self::Json => serde_json::from_str(text).context("invalid JSON"),
        }
    }
}

impl BosunConfig {
    /// Resolves the daemon configuration. The file named by
    /// `BOSUN_CONFIG_PATH` wins, then inline `BOSUN_CONFIG_JSON`, then the
    /// first existing default location. Without any of them the built-in
    /// defaults apply.
    pub fn load_from_env() -> anyhow::Result<(Self, BosunConfigSource)> {
        if let Some(path) = non_empty_env(CONFIG_PATH_ENV).map(PathBuf::from) {
            let config = Self::load_from_file(&path)?;
            return Ok((config, BosunConfigSource::EnvPath(path)));
        }

        if let Some(raw) = non_empty_env(CONFIG_JSON_ENV) {
            let config = Self::parse_json(&raw)
                .with_context(|| format!("{CONFIG_JSON_ENV} does not hold a valid config"))?;
            return Ok((config, BosunConfigSource::EnvInline));
        }

        match default_locations().into_iter().find(|path| path.is_file()) {
            Some(path) => {
                let config = Self::load_from_file(&path)?;
                Ok((config, BosunConfigSource::File(path)))
            }
            None => Ok((Self::default(), BosunConfigSource::Default)),
        }
    }

    /// Reads a `.toml` or `.json` file. Any other extension is sniffed with
    /// [`BosunConfig::parse_from_str`].
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let parsed = match Format::from_path(path) {
            Some(format) => format.parse(&text),
            None => Self::parse_from_str(&text),
        };
        parsed.with_context(|| format!("bad bosun config {}", path.display()))
    }

    /// Parses config text of unknown format, trying TOML before JSON.
    pub fn parse_from_str(text: &str) -> anyhow::Result<Self> {
        Format::Toml.parse(text).or_else(|toml_err| {
            Format::Json.parse(text).map_err(|json_err| {
                anyhow!("neither TOML ({toml_err:#}) nor JSON ({json_err:#})")
            })
        })
    }

    pub fn parse_json(text: &str) -> anyhow::Result<Self> {
        Format::Json.parse(text)
    }

    /// Checkout root: the configured directory or `~/bosun/workspaces`.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.runtime
            .workspaces_dir
            .clone()
            .unwrap_or_else(default_workspaces_dir)
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Working-directory candidates first, then the user config dir.
fn default_locations() -> Vec<PathBuf> {
    let mut locations: Vec<PathBuf> = [
        "bosun.toml",
        "bosun.json",
        "config/bosun.toml",
        "config/bosun.json",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect();
    locations.extend(dirs::config_dir().map(|dir| dir.join("bosun").join("bosun.toml")));
    locations
}

fn default_workspaces_dir() -> PathBuf {
    let base = match dirs::home_dir() {
        Some(home) => home.join("bosun"),
        None => {
            tracing::warn!("home directory unavailable; using ./workspaces for checkouts");
            PathBuf::from(".")
        }
    };
    base.join("workspaces")
}

#[cfg(test)]
mod tests {
    use bosun_core::config::LogConfig;
    use bosun_core::RuntimeConfig;

    use super::*;

    #[test]
    fn defaults_match_runtime_defaults() {
        let config = BosunConfig::default();
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.runtime, RuntimeConfig::default());
        assert_eq!(config.runtime.jobs.concurrency, 2);
        assert_eq!(config.runtime.bus.history_cap, 1_000);
        assert_eq!(config.runtime.log, LogConfig::default());
        assert_eq!(config.runtime.process.graceful_shutdown_timeout_ms, 20_000);
    }

    #[test]
    fn parses_toml_with_partial_sections() {
        let raw = r#"
            log_filter = "bosun=debug,info"
            workspaces_dir = "/srv/bosun"

            [jobs]
            concurrency = 6

            [process]
            shell = "zsh"
        "#;
        let config = BosunConfig::parse_from_str(raw).expect("toml");

        assert_eq!(config.log_filter, "bosun=debug,info");
        assert_eq!(config.runtime.jobs.concurrency, 6);
        assert_eq!(config.runtime.process.shell, "zsh");
        assert_eq!(config.runtime.process.shell_args, ["-l", "-c"]);
        assert_eq!(config.workspaces_dir(), PathBuf::from("/srv/bosun"));
    }

    #[test]
    fn falls_back_to_json() {
        let config = BosunConfig::parse_from_str(r#"{"log":{"cap":50}}"#).expect("json");
        assert_eq!(config.runtime.log.cap, 50);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn unknown_extension_reports_both_formats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.conf");
        fs::write(&path, "jobs = [").expect("write");

        let err = BosunConfig::load_from_file(&path).expect_err("invalid");
        let message = format!("{err:#}");
        assert!(message.contains("broken.conf"));
        assert!(message.contains("neither TOML"));
        assert!(message.contains("nor JSON"));
    }

    #[test]
    fn extension_pins_the_format() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bosun.toml");
        fs::write(&path, r#"{"log":{"cap":50}}"#).expect("write");

        assert!(BosunConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn loads_by_extension() {
        let dir = tempfile::tempdir().expect("tempdir");

        let toml_path = dir.path().join("bosun.toml");
        fs::write(&toml_path, "[bus]\nhistory_cap = 5\n").expect("write");
        assert_eq!(
            BosunConfig::load_from_file(&toml_path).expect("toml").runtime.bus.history_cap,
            5
        );

        let json_path = dir.path().join("bosun.json");
        fs::write(&json_path, r#"{"bus":{"subscriber_buffer":7}}"#).expect("write");
        assert_eq!(
            BosunConfig::load_from_file(&json_path)
                .expect("json")
                .runtime
                .bus
                .subscriber_buffer,
            7
        );

        let missing = dir.path().join("missing.toml");
        assert!(BosunConfig::load_from_file(&missing).is_err());
    }

    #[test]
    fn default_workspaces_dir_ends_in_workspaces() {
        assert!(BosunConfig::default().workspaces_dir().ends_with("workspaces"));
    }
}

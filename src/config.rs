use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub harvest: HarvestSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// What a harvesting pass does when one of its workers fails.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerFailurePolicy {
    /// Wait for the remaining workers, then fail the pass.
    #[default]
    FailPass,
    /// Log the failure and report the pass as partial.
    LogAndContinue,
}

/// Tuning for the harvesting engine, shared by every connector instance.
#[derive(Debug, Deserialize, Clone)]
pub struct HarvestSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_list_retries")]
    pub list_retries: u32,
    #[serde(default)]
    pub on_worker_failure: WorkerFailurePolicy,
    #[serde(default)]
    pub pass_timeout_secs: Option<u64>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            list_retries: default_list_retries(),
            on_worker_failure: WorkerFailurePolicy::default(),
            pass_timeout_secs: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    10
}
fn default_batch_size() -> usize {
    50
}
fn default_page_size() -> usize {
    200
}
fn default_list_retries() -> u32 {
    3
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    /// A config pointing at `db_path` with default harvest settings.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            harvest: HarvestSettings::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let h = &config.harvest;
    if h.workers == 0 {
        anyhow::bail!("harvest.workers must be > 0");
    }
    if h.batch_size == 0 {
        anyhow::bail!("harvest.batch_size must be > 0");
    }
    if h.page_size == 0 {
        anyhow::bail!("harvest.page_size must be > 0");
    }
    if h.list_retries == 0 {
        anyhow::bail!("harvest.list_retries must be >= 1");
    }
    if h.pass_timeout_secs == Some(0) {
        anyhow::bail!("harvest.pass_timeout_secs must be > 0 when set");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_without_harvest_section() {
        let cfg: Config = toml::from_str("[db]\npath = \"/tmp/h.sqlite\"\n").unwrap();
        assert_eq!(cfg.harvest.workers, 10);
        assert_eq!(cfg.harvest.batch_size, 50);
        assert_eq!(cfg.harvest.page_size, 200);
        assert_eq!(cfg.harvest.list_retries, 3);
        assert_eq!(cfg.harvest.on_worker_failure, WorkerFailurePolicy::FailPass);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_policy_parses_snake_case() {
        let cfg: Config = toml::from_str(
            "[db]\npath = \"h.sqlite\"\n[harvest]\non_worker_failure = \"log_and_continue\"\n",
        )
        .unwrap();
        assert_eq!(
            cfg.harvest.on_worker_failure,
            WorkerFailurePolicy::LogAndContinue
        );
    }

    #[test]
    fn test_zero_workers_rejected() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"h.sqlite\"\n[harvest]\nworkers = 0\n").unwrap();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("harvest.workers"));
    }
}

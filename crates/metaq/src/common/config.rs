use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::error::config_error;

const DEFAULT_NUM_WORKERS: usize = 8;
const DEFAULT_DAEMON_INTERVAL_SECS: u64 = 5;

/// Name of the directory (relative to the home directory) that holds the agent files by default.
const DEFAULT_AGENT_DIR: &str = ".metaq";
const CONFIG_FILE_NAME: &str = "agent.toml";
const AGENT_LOG_FILE_NAME: &str = "metaq-agent.log";
const JOB_CACHE_DIR: &str = "cache";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Name of this agent instance, written into `run_system` of claimed jobs.
    #[serde(default)]
    pub name: String,
    /// Local scheduler driver. Defaults to the agent name.
    pub backend: Option<String>,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Seconds between two cycles in daemon mode.
    #[serde(default = "default_daemon_interval")]
    pub daemon_interval: u64,
    pub cache_dir: Option<PathBuf>,
    pub bucket: BucketConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketConfig {
    /// `s3://<bucket>`, `file:///<path>` or `memory://`
    pub url: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    #[serde(default = "default_conditional_claims")]
    pub conditional_claims: bool,
}

fn default_num_workers() -> usize {
    DEFAULT_NUM_WORKERS
}

fn default_daemon_interval() -> u64 {
    DEFAULT_DAEMON_INTERVAL_SECS
}

fn default_conditional_claims() -> bool {
    true
}

pub fn default_config_path() -> PathBuf {
    default_agent_dir().join(CONFIG_FILE_NAME)
}

fn default_agent_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_AGENT_DIR)
}

/// Expands a leading `~` to the home directory of the current user.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: AgentConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Checks mandatory settings and their lower bounds.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return config_error("agent name is not set".to_string());
        }
        if self.num_workers < 1 {
            return config_error(format!(
                "num_workers must be at least 1, got {}",
                self.num_workers
            ));
        }
        if self.daemon_interval < 1 {
            return config_error(format!(
                "daemon_interval must be at least 1 second, got {}",
                self.daemon_interval
            ));
        }
        if self.bucket.url.trim().is_empty() {
            return config_error("bucket url is not set".to_string());
        }
        Ok(())
    }

    pub fn backend_name(&self) -> &str {
        self.backend.as_deref().unwrap_or(&self.name)
    }

    pub fn daemon_interval(&self) -> Duration {
        Duration::from_secs(self.daemon_interval)
    }

    /// Root directory of agent-local files.
    pub fn agent_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => expand_home(dir),
            None => default_agent_dir(),
        }
    }

    /// Directory that holds working directories of jobs.
    pub fn job_cache_dir(&self) -> PathBuf {
        self.agent_dir().join(JOB_CACHE_DIR)
    }

    pub fn log_file(&self) -> PathBuf {
        self.agent_dir().join(AGENT_LOG_FILE_NAME)
    }
}

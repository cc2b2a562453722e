//! Configuration for the recap service.
//!
//! Configuration sources (highest priority first):
//! 1. Explicit path (`--config`)
//! 2. `RECAP_CONFIG` environment variable
//! 3. `recap.yaml` found in the current directory or any parent
//!
//! A few operational knobs (worker count, poll interval, metrics address)
//! can additionally be overridden with `RECAP_*` environment variables,
//! which beat the file.
//!
//! Secrets never live in the file; they are read from `RECAP_*`
//! environment variables at startup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::core::StagePolicies;
use crate::ingest::PollerSettings;

pub const CONFIG_FILE_NAME: &str = "recap.yaml";
pub const CONFIG_PATH_ENV: &str = "RECAP_CONFIG";

pub const ENV_CATALOG_API_KEY: &str = "RECAP_CATALOG_API_KEY";
pub const ENV_WAREHOUSE_TOKEN: &str = "RECAP_WAREHOUSE_TOKEN";
pub const ENV_SUMMARIZER_API_KEY: &str = "RECAP_SUMMARIZER_API_KEY";
pub const ENV_DOCSTORE_TOKEN: &str = "RECAP_DOCSTORE_TOKEN";
pub const ENV_MAILER_TOKEN: &str = "RECAP_MAILER_TOKEN";

pub const ENV_WORKERS: &str = "RECAP_WORKERS";
pub const ENV_POLL_INTERVAL: &str = "RECAP_POLL_INTERVAL_SECS";
pub const ENV_METRICS_ADDR: &str = "RECAP_METRICS_ADDR";

/// Full config file schema (matches YAML structure).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub poller: PollerSettings,

    pub catalog: EndpointConfig,
    pub warehouse: EndpointConfig,
    pub summarizer: SummarizerConfig,
    pub docstore: EndpointConfig,
    pub mailer: MailerConfig,

    #[serde(default)]
    pub retries: StagePolicies,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Bounded queue capacity
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_queue_capacity() -> usize {
    64
}
fn default_workers() -> usize {
    1
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Base URL, scheme included
    pub base_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SummarizerConfig {
    pub base_url: String,

    /// Model identifier sent with each completion request
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_summarizer_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailerConfig {
    pub base_url: String,

    /// Sender address on outgoing messages
    pub from: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}
fn default_summarizer_timeout() -> u64 {
    120
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Listen address for the scrape endpoint
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,

    /// Disable the endpoint entirely
    #[serde(default)]
    pub disabled: bool,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9184".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_metrics_addr(),
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Seconds workers get to finish their current item after a signal
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

fn default_grace_secs() -> u64 {
    30
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
        }
    }
}

impl EndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl SummarizerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl MailerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs.max(1))
    }
}

impl Config {
    /// Loads config from the explicit path, the env override, or discovery.
    ///
    /// Returns the config together with the path it came from.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, PathBuf)> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match std::env::var(CONFIG_PATH_ENV) {
                Ok(p) if !p.is_empty() => PathBuf::from(p),
                _ => find_config_file().with_context(|| {
                    format!(
                        "no {CONFIG_FILE_NAME} found in the current directory or any parent \
                         (set {CONFIG_PATH_ENV} or pass --config)"
                    )
                })?,
            },
        };

        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok((config, path))
    }

    /// Parses a config file without validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Applies `RECAP_*` operational overrides on top of file values.
    ///
    /// Runs before [`Config::validate`] so an overridden value is checked
    /// like any other.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(workers) = env_override(ENV_WORKERS) {
            self.queue.workers = workers
                .parse()
                .with_context(|| format!("{ENV_WORKERS} is not a number: {workers:?}"))?;
        }
        if let Some(interval) = env_override(ENV_POLL_INTERVAL) {
            self.poller.interval_secs = interval
                .parse()
                .with_context(|| format!("{ENV_POLL_INTERVAL} is not a number: {interval:?}"))?;
        }
        if let Some(addr) = env_override(ENV_METRICS_ADDR) {
            self.metrics.listen_addr = addr;
        }
        Ok(())
    }

    /// Rejects configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.queue.capacity == 0 {
            bail!("queue.capacity must be at least 1");
        }
        if self.queue.workers == 0 {
            bail!("queue.workers must be at least 1");
        }
        if self.poller.lookback_secs == 0 {
            bail!("poller.lookback_secs must be at least 1");
        }
        if self.poller.lookback_secs > PollerSettings::MAX_LOOKBACK_SECS {
            bail!(
                "poller.lookback_secs must be at most {} (got {})",
                PollerSettings::MAX_LOOKBACK_SECS,
                self.poller.lookback_secs
            );
        }

        for (name, url) in [
            ("catalog", &self.catalog.base_url),
            ("warehouse", &self.warehouse.base_url),
            ("summarizer", &self.summarizer.base_url),
            ("docstore", &self.docstore.base_url),
            ("mailer", &self.mailer.base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("{name}.base_url must start with http:// or https:// (got {url:?})");
            }
        }

        if self.mailer.from.split_once('@').is_none() {
            bail!("mailer.from must be an email address (got {:?})", self.mailer.from);
        }

        for (stage, policy) in [
            ("enrich", &self.retries.enrich),
            ("summarize", &self.retries.summarize),
            ("document", &self.retries.document),
            ("notify", &self.retries.notify),
        ] {
            if policy.max_attempts == 0 {
                bail!("retries.{stage}.max_attempts must be at least 1");
            }
            if policy.backoff_multiplier < 1.0 {
                bail!("retries.{stage}.backoff_multiplier must be >= 1.0");
            }
            if !(0.0..1.0).contains(&policy.jitter) {
                bail!("retries.{stage}.jitter must be in [0.0, 1.0)");
            }
        }

        if !self.metrics.disabled {
            self.metrics_addr()?;
        }

        Ok(())
    }

    /// The parsed scrape-endpoint address.
    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics
            .listen_addr
            .parse()
            .with_context(|| {
                format!(
                    "metrics.listen_addr is not a socket address: {:?}",
                    self.metrics.listen_addr
                )
            })
    }
}

/// Secrets, read from the environment and never from the config file.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub catalog_api_key: String,
    pub warehouse_token: String,
    pub summarizer_api_key: String,
    pub docstore_token: String,
    pub mailer_token: String,
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            catalog_api_key: required_env(ENV_CATALOG_API_KEY)?,
            warehouse_token: required_env(ENV_WAREHOUSE_TOKEN)?,
            summarizer_api_key: required_env(ENV_SUMMARIZER_API_KEY)?,
            docstore_token: required_env(ENV_DOCSTORE_TOKEN)?,
            mailer_token: required_env(ENV_MAILER_TOKEN)?,
        })
    }
}

pub fn required_env(name: &str) -> Result<String> {
    let value = std::env::var(name)
        .with_context(|| format!("missing required environment variable {name}"))?;
    if value.trim().is_empty() {
        bail!("environment variable {name} is set but empty");
    }
    Ok(value)
}

fn env_override(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

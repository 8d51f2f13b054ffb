//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credential tokens are read from the env var named by `token_env` or from
//! `token_file`, never from the TOML itself.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use access_pool::{QuotaConfig, SchedulerConfig};
use common::Secret;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Interval between quota status reports (gauges + debug log)
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

/// One upstream credential and the quota it is subject to
#[derive(Debug, Deserialize)]
pub struct CredentialConfig {
    pub id: String,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    pub quota: QuotaConfig,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
}

/// Header to inject into proxied requests
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

impl From<HeaderInjection> for transport::HeaderInjection {
    fn from(h: HeaderInjection) -> Self {
        Self {
            name: h.name,
            value: h.value,
        }
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_report_interval() -> u64 {
    30
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve each
    /// credential's token.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        for credential in &mut config.credentials {
            credential.token = Some(Secret::resolve(
                &credential.id,
                credential.token_env.as_deref(),
                credential.token_file.as_deref(),
            )?);
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.proxy.upstream_url.starts_with("http://")
            && !self.proxy.upstream_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.proxy.upstream_url
            )));
        }

        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.proxy.report_interval_secs == 0 {
            return Err(common::Error::Config(
                "report_interval_secs must be greater than 0".into(),
            ));
        }

        self.scheduler
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;

        if self.credentials.is_empty() {
            return Err(common::Error::Config(
                "at least one [[credentials]] entry is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for credential in &self.credentials {
            if credential.id.trim().is_empty() {
                return Err(common::Error::Config("credential id must not be empty".into()));
            }
            if !seen.insert(credential.id.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate credential id: {}",
                    credential.id
                )));
            }
            credential
                .quota
                .validate(&credential.id)
                .map_err(|e| common::Error::Config(e.to_string()))?;
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("quota-proxy.toml")
    }
}

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use estimate_ledger_client::{
    ClientConfig, DEFAULT_ESTIMATES_PATH, DEFAULT_LIST_ACTION, DEFAULT_TIMEOUT_SECS,
};
use estimate_ledger_core::{CallerIdentity, Scope, ScopePolicy};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Connection and visibility settings shared by the CLI commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub base_url: String,
    pub estimates_path: String,
    pub list_action: String,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub caller: CallerIdentity,
    pub scope: Scope,
    pub privileged: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            estimates_path: DEFAULT_ESTIMATES_PATH.to_string(),
            list_action: DEFAULT_LIST_ACTION.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            caller: CallerIdentity::default(),
            scope: Scope::default(),
            privileged: false,
        }
    }
}

impl LedgerConfig {
    /// Read and validate a YAML config file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, is not valid YAML, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&body).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when `body` is not a valid config document.
    pub fn from_yaml(body: &str) -> Result<Self> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(body).context("failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let base_url = self.base_url.trim();
        ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "base_url MUST start with http:// or https://"
        );
        ensure!(self.estimates_path.starts_with('/'), "estimates_path MUST start with /");
        ensure!(!self.list_action.trim().is_empty(), "list_action MUST be provided");
        ensure!(self.timeout_secs > 0, "timeout_secs MUST be greater than zero");
        ensure!(self.poll_interval_secs > 0, "poll_interval_secs MUST be greater than zero");
        Ok(())
    }

    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.base_url.trim().to_string(),
            estimates_path: self.estimates_path.clone(),
            list_action: self.list_action.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }

    #[must_use]
    pub fn scope_policy(&self) -> ScopePolicy {
        ScopePolicy {
            scope: self.scope,
            caller: self.caller.clone(),
            privileged: self.privileged,
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

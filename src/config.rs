//! Configuration management for the transaction lifecycle service
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::finality::DEFAULT_CONFIRMATION_RISK_THRESHOLD;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service: ServiceConfig,
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub instance_id: String,
    /// Interval between new-block polls
    pub poll_interval_ms: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub network_id: u64,
    pub rpc_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the signing key
    pub private_key_env: Option<String>,
}

/// Lifecycle and reconciliation policy constants
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Consecutive skew-only sweeps before a transaction counts as dropped
    pub drop_confirmation_sweeps: u32,
    /// Resubmission waits until `base^retry_count + offset` blocks have passed
    pub resubmit_backoff_base: u64,
    pub resubmit_backoff_offset: u64,
    pub confirmation_risk_threshold: f64,
    /// Minimum gas price increase for a replacement transaction
    pub min_gas_bump_percent: u64,
    pub gas_limit_buffer_percent: u64,
    /// Terminal transactions kept per address
    pub tx_history_limit: usize,
    /// Upper bound on tracked drop-debounce entries
    pub debounce_capacity: usize,
    /// Extra "already known" broadcast error fragments
    pub known_broadcast_errors: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            drop_confirmation_sweeps: 3,
            resubmit_backoff_base: 2,
            resubmit_backoff_offset: 4,
            confirmation_risk_threshold: DEFAULT_CONFIRMATION_RISK_THRESHOLD,
            min_gas_bump_percent: 10,
            gas_limit_buffer_percent: 0,
            tx_history_limit: 40,
            debounce_capacity: 4096,
            known_broadcast_errors: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Blocks that must pass before resubmission attempt `retry_count`
    pub fn resubmit_threshold(&self, retry_count: u32) -> u64 {
        self.resubmit_backoff_base
            .saturating_pow(retry_count)
            .saturating_add(self.resubmit_backoff_offset)
    }

    fn validate(&self) -> Result<()> {
        if self.drop_confirmation_sweeps == 0 {
            anyhow::bail!("policy.drop_confirmation_sweeps must be at least 1");
        }
        if self.resubmit_backoff_base < 2 {
            anyhow::bail!("policy.resubmit_backoff_base must be at least 2");
        }
        if !(0.0..=1.0).contains(&self.confirmation_risk_threshold) {
            anyhow::bail!("policy.confirmation_risk_threshold must be within [0, 1]");
        }
        if self.min_gas_bump_percent == 0 {
            anyhow::bail!("policy.min_gas_bump_percent must be positive");
        }
        if self.tx_history_limit == 0 {
            anyhow::bail!("policy.tx_history_limit must be at least 1");
        }
        if self.debounce_capacity == 0 {
            anyhow::bail!("policy.debounce_capacity must be at least 1");
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TX_LIFECYCLE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.network.rpc_urls.is_empty() {
            anyhow::bail!("Network {} has no RPC URLs configured", self.network.name);
        }

        if self.wallet.private_key_env.is_none() {
            tracing::warn!("No wallet configured - approvals will fail to sign");
        }

        self.policy.validate()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .context("Invalid substitution pattern")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}

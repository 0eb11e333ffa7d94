// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : portfolio_sync — scheduled exchange sync + trade ledger in Rust
Module  : config.rs
Version : 0.1.0
Author  : portfolio_sync maintainers
License : MIT

Summary : Runs periodic exchange sync jobs (Hyperliquid, Kraken, mock) under
          a pausable/triggerable scheduler, aggregates fills into canonical
          trades, books them into a spot/futures position ledger, exposes
          Prometheus metrics, and records JSONL events.
=============================================================================
*/
use std::env;
use std::sync::RwLock;

use ahash::AHashMap as HashMap;
use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid wallet entry {0:?} (expected label:address)")]
    InvalidWallet(String),
}

#[derive(Parser, Debug, Clone)]
#[command(name = "portfolio_sync", version, about = "Scheduled exchange sync + trade ledger")]
pub struct Args {
    /// Prometheus text exposition port
    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    /// JSONL event file (recorder disabled when unset)
    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,

    /// Where last-run timestamps survive restarts
    #[arg(long, env = "LAST_RUN_FILE", default_value = "last_runs.json")]
    pub last_run_file: String,

    /// Executions kept in the registry history
    #[arg(long, env = "HISTORY_LIMIT", default_value_t = 100)]
    pub history_limit: usize,
}

pub fn load() -> Args {
    // .env first so clap's env fallbacks see it
    let _ = dotenv();
    Args::parse()
}

// ===== Jobs =====

/// (name, default interval secs, enabled by default)
pub const JOB_CATALOG: &[(&str, u64, bool)] = &[
    ("update_hyperliquid", 300, false),
    ("update_kraken", 600, false),
    ("mock_sync", 60, true),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    pub enabled: bool,
    pub interval_secs: u64,
}

/// Read-only view of job configuration. `None` = job unknown to configuration.
pub trait ConfigProvider: Send + Sync + 'static {
    fn job_settings(&self, name: &str) -> Option<JobSettings>;

    fn is_enabled(&self, name: &str) -> bool {
        // unknown jobs are not gated by configuration
        self.job_settings(name).map(|s| s.enabled).unwrap_or(true)
    }
}

/// Reads `JOB_<NAME>_ENABLED` / `JOB_<NAME>_INTERVAL` on every call.
#[derive(Debug, Clone, Default)]
pub struct EnvConfigProvider;

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn job_settings(&self, name: &str) -> Option<JobSettings> {
        let &(_, interval, enabled) = JOB_CATALOG.iter().find(|(n, _, _)| *n == name)?;
        let prefix = format!("JOB_{}", name.to_ascii_uppercase());

        let enabled = env::var(format!("{prefix}_ENABLED"))
            .ok()
            .and_then(|v| parse_bool(&v))
            .unwrap_or(enabled);
        let interval_secs = env::var(format!("{prefix}_INTERVAL"))
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(interval);

        Some(JobSettings { enabled, interval_secs })
    }
}

/// In-memory configuration, mutable at runtime.
#[derive(Debug, Default)]
pub struct StaticConfigProvider {
    jobs: RwLock<HashMap<String, JobSettings>>,
}

impl StaticConfigProvider {
    pub fn new() -> Self { Self::default() }

    pub fn with_job(self, name: &str, enabled: bool, interval_secs: u64) -> Self {
        self.set(name, JobSettings { enabled, interval_secs });
        self
    }

    pub fn set(&self, name: &str, settings: JobSettings) {
        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(name.to_string(), settings);
        }
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) {
        if let Ok(mut jobs) = self.jobs.write() {
            if let Some(s) = jobs.get_mut(name) {
                s.enabled = enabled;
            }
        }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn job_settings(&self, name: &str) -> Option<JobSettings> {
        self.jobs.read().ok()?.get(name).copied()
    }
}

// ===== Wallets =====

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    pub label: String,
    pub address: String,
}

/// `label:address,label2:address2`. Blank entries are skipped.
pub fn parse_wallets(raw: &str) -> Result<Vec<Wallet>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((label, address)) if !label.trim().is_empty() && !address.trim().is_empty() => Ok(Wallet {
                label: label.trim().to_string(),
                address: address.trim().to_string(),
            }),
            _ => Err(ConfigError::InvalidWallet(entry.to_string())),
        })
        .collect()
}

pub fn hyperliquid_wallets() -> Result<Vec<Wallet>, ConfigError> {
    parse_wallets(&env::var("HYPERLIQUID_WALLETS").unwrap_or_default())
}

/// Kraken API credentials; `None` when either half is missing.
pub fn kraken_credentials() -> Option<(String, String)> {
    let key = env::var("KRAKEN_API_KEY").ok().filter(|s| !s.is_empty())?;
    let secret = env::var("KRAKEN_API_SECRET").ok().filter(|s| !s.is_empty())?;
    Some((key, secret))
}

pub fn hyperliquid_api_url() -> String {
    env::var("HYPERLIQUID_API_URL").unwrap_or_else(|_| "https://api.hyperliquid.xyz".to_string())
}

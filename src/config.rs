//! Configuration loading from TOML with environment variable overrides.
//!
//! Reads `hoopsync.toml` (optional) into strongly-typed structs, then
//! applies overrides from the environment. The API key is referenced by
//! env-var name in the config and resolved at runtime.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::retry::BackoffPolicy;
use crate::types::{EntityKind, SyncFilters};

/// Largest page the API serves.
pub const MAX_PER_PAGE: u32 = 100;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub per_page: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.balldontlie.io/v1".to_string(),
            api_key_env: "API_KEY".to_string(),
            per_page: MAX_PER_PAGE,
            timeout_secs: 30,
            max_retries: 4,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl ApiConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.max_retries, self.base_backoff_ms, self.max_backoff_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub db_url: String,
    /// Payloads per upsert transaction.
    pub batch_size: usize,
    pub max_connections: u32,
    pub write_timeout_secs: u64,
    /// How long SQLite waits on a locked database before reporting busy.
    pub busy_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite://hoopsync.db".to_string(),
            batch_size: 100,
            max_connections: 4,
            write_timeout_secs: 30,
            busy_timeout_ms: 5_000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Resume from stored checkpoints instead of restarting.
    pub resume: bool,
    /// Entity types processed concurrently within a stage.
    pub workers: usize,
    pub entities: Vec<EntityKind>,
    pub season: Option<i32>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Where to write the JSON run report, if anywhere.
    pub report_path: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resume: true,
            workers: 2,
            entities: EntityKind::ALL.to_vec(),
            season: None,
            start_date: None,
            end_date: None,
            report_path: None,
        }
    }
}

impl SyncConfig {
    pub fn filters(&self) -> SyncFilters {
        SyncFilters {
            season: self.season,
            start_date: self.start_date,
            end_date: self.end_date,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Full startup path: file, then process environment, then validation.
    pub fn from_env(path: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("API_BASE_URL") {
            self.api.base_url = url;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.store.db_url = url;
        }
        if let Some(raw) = lookup("SYNC_RESUME") {
            self.sync.resume = parse_bool(&raw)
                .with_context(|| format!("Invalid SYNC_RESUME value: {raw}"))?;
        }
        if let Some(raw) = lookup("SYNC_BATCH_SIZE") {
            self.store.batch_size = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid SYNC_BATCH_SIZE value: {raw}"))?;
        }
        if let Some(raw) = lookup("SYNC_WORKERS") {
            self.sync.workers = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid SYNC_WORKERS value: {raw}"))?;
        }
        if let Some(raw) = lookup("SYNC_SEASON") {
            self.sync.season = Some(
                raw.trim()
                    .parse()
                    .with_context(|| format!("Invalid SYNC_SEASON value: {raw}"))?,
            );
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.trim().is_empty() {
            anyhow::bail!("api.base_url must not be empty");
        }
        if self.api.per_page == 0 || self.api.per_page > MAX_PER_PAGE {
            anyhow::bail!("api.per_page must be between 1 and {MAX_PER_PAGE}");
        }
        if self.store.db_url.trim().is_empty() {
            anyhow::bail!("store.db_url must not be empty");
        }
        if self.store.batch_size == 0 {
            anyhow::bail!("store.batch_size must be at least 1");
        }
        if self.sync.workers == 0 {
            anyhow::bail!("sync.workers must be at least 1");
        }
        if self.sync.entities.is_empty() {
            anyhow::bail!("sync.entities must name at least one entity type");
        }
        if let (Some(start), Some(end)) = (self.sync.start_date, self.sync.end_date) {
            if start > end {
                anyhow::bail!("sync.start_date {start} is after sync.end_date {end}");
            }
        }
        Ok(())
    }

    /// Resolve the API key from the environment variable named in config.
    /// Absent or empty keys are allowed: some endpoints are public.
    pub fn api_key(&self) -> Option<SecretString> {
        Self::resolve_env(&self.api.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::new)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Origins cap a single response at this many rows regardless of the requested limit.
pub const HARD_PAGE_CAP: usize = 1000;

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub base_url: String,
    pub table: String,
    pub token: String,
    pub fetch_limit: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Grid cell side in degrees.
    pub cell_size: f64,
    pub partition_size: usize,
    pub assign_batch_size: usize,
    /// RUNNING ledger rows older than this are treated as abandoned.
    pub run_lease: chrono::Duration,
}

impl DatabaseSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let settings = Self {
            url: required("DATABASE_URL")?,
            max_connections: parsed("DB_MAX_CONNECTIONS", 5)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Constraint("DATABASE_URL is empty"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Constraint("DB_MAX_CONNECTIONS must be > 0"));
        }
        Ok(())
    }
}

impl Default for OriginSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            table: "locations".to_string(),
            token: String::new(),
            fetch_limit: 50_000,
            timeout: Duration::from_secs(60),
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl OriginSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let settings = Self {
            base_url: required("ORIGIN_URL")?,
            table: optional("ORIGIN_TABLE").unwrap_or(defaults.table),
            token: required("ORIGIN_TOKEN")?,
            fetch_limit: parsed("ORIGIN_FETCH_LIMIT", defaults.fetch_limit)?,
            timeout: Duration::from_secs(parsed("ORIGIN_TIMEOUT_SECS", defaults.timeout.as_secs())?),
            max_retries: parsed("EXTRACT_MAX_RETRIES", defaults.max_retries)?,
            backoff_base_ms: parsed("EXTRACT_BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_max_ms: parsed("EXTRACT_BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Constraint("ORIGIN_URL is empty"));
        }
        if self.table.trim().is_empty() {
            return Err(ConfigError::Constraint("ORIGIN_TABLE is empty"));
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::Constraint("ORIGIN_TOKEN is empty"));
        }
        if self.fetch_limit == 0 {
            return Err(ConfigError::Constraint("ORIGIN_FETCH_LIMIT must be > 0"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Constraint("ORIGIN_TIMEOUT_SECS must be > 0"));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Constraint(
                "EXTRACT_BACKOFF_MAX_MS must be >= EXTRACT_BACKOFF_BASE_MS",
            ));
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.fetch_limit.min(HARD_PAGE_CAP)
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.base_url.trim_end_matches('/'),
            self.table
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base_ms: self.backoff_base_ms,
            backoff_max_ms: self.backoff_max_ms,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cell_size: 0.01,
            partition_size: 5_000,
            assign_batch_size: 5_000,
            run_lease: chrono::Duration::minutes(120),
        }
    }
}

impl PipelineSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let settings = Self {
            cell_size: parsed("GRID_CELL_SIZE", defaults.cell_size)?,
            partition_size: parsed("CLASSIFY_PARTITION_SIZE", defaults.partition_size)?,
            assign_batch_size: parsed("ASSIGN_BATCH_SIZE", defaults.assign_batch_size)?,
            run_lease: chrono::Duration::minutes(parsed(
                "RUN_LEASE_MINUTES",
                defaults.run_lease.num_minutes(),
            )?),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err(ConfigError::Constraint("GRID_CELL_SIZE must be a positive number"));
        }
        if self.partition_size == 0 {
            return Err(ConfigError::Constraint("CLASSIFY_PARTITION_SIZE must be > 0"));
        }
        if self.assign_batch_size == 0 {
            return Err(ConfigError::Constraint("ASSIGN_BATCH_SIZE must be > 0"));
        }
        if self.run_lease <= chrono::Duration::zero() {
            return Err(ConfigError::Constraint("RUN_LEASE_MINUTES must be > 0"));
        }
        Ok(())
    }
}

fn optional(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

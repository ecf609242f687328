//! Runtime configuration loaded once at start-up and injected into services
//!
//! Nothing below `main` reads the process environment; services receive
//! these structs at construction time.

use std::env;
use std::time::Duration;

use crate::error::EngineError;
use crate::models::job::JobKind;

/// Per-transaction unit cap imposed by the ledger network
pub const DEFAULT_BATCH_SIZE_CAP: usize = 5;
pub const DEFAULT_MAX_PARALLEL: usize = 5;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRY_JITTER_CEILING_MS: u64 = 100;
pub const DEFAULT_PAYMENT_TOKEN_DECIMALS: u32 = 2;

/// 16:00 UTC is midnight in UTC+8, where the collateral desk operates
pub const DEFAULT_DAILY_CHECK_HOUR_UTC: u32 = 16;
pub const DEFAULT_STALLED_JOB_SECS: u64 = 30;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Environment variable names
const ENV_BATCH_SIZE_CAP: &str = "LEDGER_BATCH_SIZE_CAP";
const ENV_MAX_PARALLEL: &str = "MINT_MAX_PARALLEL";
const ENV_RETRY_MAX_ATTEMPTS: &str = "RETRY_MAX_ATTEMPTS";
const ENV_RETRY_BASE_DELAY_MS: &str = "RETRY_BASE_DELAY_MS";
const ENV_RETRY_JITTER_CEILING_MS: &str = "RETRY_JITTER_CEILING_MS";
const ENV_PAYMENT_TOKEN_ID: &str = "PAYMENT_TOKEN_ID";
const ENV_PAYMENT_TOKEN_DECIMALS: &str = "PAYMENT_TOKEN_DECIMALS";
const ENV_DATABASE_URL: &str = "DATABASE_URL";
const ENV_BIND_ADDRESS: &str = "BIND_ADDRESS";
const ENV_LEDGER_GATEWAY_URL: &str = "LEDGER_GATEWAY_URL";
const ENV_DAILY_CHECK_HOUR_UTC: &str = "DAILY_CHECK_HOUR_UTC";
const ENV_STALLED_JOB_SECS: &str = "STALLED_JOB_SECS";

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_required(name: &str) -> Result<String, EngineError> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| EngineError::Config(format!("{} must be set", name)))
}

/// Retry knobs for transient ledger faults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the original attempt (5 means 6 tries in total)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter_ceiling: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            jitter_ceiling: Duration::from_millis(DEFAULT_RETRY_JITTER_CEILING_MS),
        }
    }
}

/// Configuration shared by the mint engine and purchase pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub batch_size_cap: usize,
    pub default_max_parallel: usize,
    pub retry: RetryConfig,
    /// Fungible token used to pay for collateral units
    pub payment_token_id: String,
    /// Ledger amounts for the payment token are integers scaled by 10^decimals
    pub payment_token_decimals: u32,
}

impl EngineConfig {
    pub fn new(payment_token_id: impl Into<String>) -> Self {
        Self {
            batch_size_cap: DEFAULT_BATCH_SIZE_CAP,
            default_max_parallel: DEFAULT_MAX_PARALLEL,
            retry: RetryConfig::default(),
            payment_token_id: payment_token_id.into(),
            payment_token_decimals: DEFAULT_PAYMENT_TOKEN_DECIMALS,
        }
    }

    pub fn from_env() -> Result<Self, EngineError> {
        let config = Self {
            batch_size_cap: env_parse(ENV_BATCH_SIZE_CAP).unwrap_or(DEFAULT_BATCH_SIZE_CAP),
            default_max_parallel: env_parse(ENV_MAX_PARALLEL).unwrap_or(DEFAULT_MAX_PARALLEL),
            retry: RetryConfig {
                max_attempts: env_parse(ENV_RETRY_MAX_ATTEMPTS)
                    .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS),
                base_delay: Duration::from_millis(
                    env_parse(ENV_RETRY_BASE_DELAY_MS).unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
                ),
                jitter_ceiling: Duration::from_millis(
                    env_parse(ENV_RETRY_JITTER_CEILING_MS)
                        .unwrap_or(DEFAULT_RETRY_JITTER_CEILING_MS),
                ),
            },
            payment_token_id: env_required(ENV_PAYMENT_TOKEN_ID)?,
            payment_token_decimals: env_parse(ENV_PAYMENT_TOKEN_DECIMALS)
                .unwrap_or(DEFAULT_PAYMENT_TOKEN_DECIMALS),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.batch_size_cap == 0 {
            return Err(EngineError::Config(
                "batch size cap must be at least 1".to_string(),
            ));
        }
        if self.default_max_parallel == 0 {
            return Err(EngineError::Config(
                "max parallel workers must be at least 1".to_string(),
            ));
        }
        if self.payment_token_decimals > 18 {
            return Err(EngineError::Config(format!(
                "payment token decimals out of range: {}",
                self.payment_token_decimals
            )));
        }
        Ok(())
    }
}

/// Per-queue worker and retention settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Jobs of this kind processed concurrently
    pub concurrency: usize,
    /// Total handler runs before a job is marked failed
    pub attempts: u32,
    /// First retry delay; doubles on every further retry
    pub backoff_base: Duration,
    /// Completed jobs retained for inspection
    pub keep_completed: usize,
    /// Failed jobs retained for inspection
    pub keep_failed: usize,
}

impl QueueConfig {
    pub fn defaults_for(kind: JobKind) -> Self {
        match kind {
            JobKind::Purchase => Self {
                concurrency: 3,
                attempts: 3,
                backoff_base: Duration::from_millis(2000),
                keep_completed: 100,
                keep_failed: 50,
            },
            JobKind::Mint => Self {
                concurrency: 2,
                attempts: 2,
                backoff_base: Duration::from_millis(3000),
                keep_completed: 50,
                keep_failed: 25,
            },
            JobKind::DailyCheck => Self {
                concurrency: 1,
                attempts: 2,
                backoff_base: Duration::ZERO,
                keep_completed: 10,
                keep_failed: 5,
            },
        }
    }

    /// Defaults with `<KIND>_CONCURRENCY` applied, e.g. `PURCHASE_CONCURRENCY`
    pub fn from_env(kind: JobKind) -> Self {
        let mut config = Self::defaults_for(kind);
        let var = format!("{}_CONCURRENCY", kind.as_str().to_uppercase().replace('-', "_"));
        if let Some(concurrency) = env_parse::<usize>(&var).filter(|c| *c > 0) {
            config.concurrency = concurrency;
        }
        config
    }
}

/// Process-level settings for the binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_address: String,
    pub ledger_gateway_url: String,
    pub daily_check_hour_utc: u32,
    pub stalled_after: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        let daily_check_hour_utc: u32 =
            env_parse(ENV_DAILY_CHECK_HOUR_UTC).unwrap_or(DEFAULT_DAILY_CHECK_HOUR_UTC);
        if daily_check_hour_utc > 23 {
            return Err(EngineError::Config(format!(
                "{} must be 0-23, got {}",
                ENV_DAILY_CHECK_HOUR_UTC, daily_check_hour_utc
            )));
        }

        Ok(Self {
            database_url: env_required(ENV_DATABASE_URL)?,
            bind_address: env::var(ENV_BIND_ADDRESS)
                .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string()),
            ledger_gateway_url: env_required(ENV_LEDGER_GATEWAY_URL)?,
            daily_check_hour_utc,
            stalled_after: Duration::from_secs(
                env_parse(ENV_STALLED_JOB_SECS).unwrap_or(DEFAULT_STALLED_JOB_SECS),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::new("0.0.1001");
        assert_eq!(config.batch_size_cap, 5);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_cap() {
        let mut config = EngineConfig::new("0.0.1001");
        config.batch_size_cap = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_queue_defaults() {
        assert_eq!(QueueConfig::defaults_for(JobKind::Purchase).concurrency, 3);
        assert_eq!(QueueConfig::defaults_for(JobKind::Mint).attempts, 2);
        assert_eq!(QueueConfig::defaults_for(JobKind::DailyCheck).concurrency, 1);
    }
}

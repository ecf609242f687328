//! Transient/fatal classification of ledger errors and exponential backoff

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::{EngineError, LedgerError};

/// Signatures of faults that clear up on their own: congestion, fee spikes,
/// expired transactions, throttling, and the per-transaction unit cap
const TRANSIENT_SIGNATURES: &[&str] = &[
    "BUSY",
    "PLATFORM_TRANSACTION_NOT_CREATED",
    "PLATFORM_NOT_ACTIVE",
    "INSUFFICIENT_TX_FEE",
    "TRANSACTION_EXPIRED",
    "BATCH_SIZE_LIMIT_EXCEEDED",
    "THROTTLED",
    "RATE_LIMIT",
];

/// Signatures meaning the target is already in the requested state
const ALREADY_IN_STATE_SIGNATURES: &[&str] = &[
    "TOKEN_ALREADY_ASSOCIATED_TO_ACCOUNT",
    "ALREADY_ASSOCIATED",
    "ACCOUNT_NOT_FROZEN_FOR_TOKEN",
    "NOT_FROZEN",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

pub fn classify(err: &LedgerError) -> ErrorClass {
    if err.matches_any(TRANSIENT_SIGNATURES) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

/// "Already associated" / "not frozen" style errors, benign where the caller
/// expects them
pub fn is_already_in_state(err: &LedgerError) -> bool {
    err.matches_any(ALREADY_IN_STATE_SIGNATURES)
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    jitter_ceiling: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            jitter_ceiling: config.jitter_ceiling,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before retry number `attempt` (1-based):
    /// `base * 2^(attempt-1) + jitter`, jitter in `[0, jitter_ceiling)`
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let backoff = self.base_delay.saturating_mul(1u32 << exponent);

        let ceiling_ms = self.jitter_ceiling.as_millis() as u64;
        let jitter_ms = if ceiling_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..ceiling_ms)
        };

        backoff.saturating_add(Duration::from_millis(jitter_ms))
    }

    /// Run `f` until it succeeds, fails fatally, or transient retries run out.
    ///
    /// Exhausted retries surface the last ledger error as `LedgerTransient`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut retries = 0;

        loop {
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if is_already_in_state(&err) {
                return Err(EngineError::AlreadyInState(err));
            }

            if classify(&err) == ErrorClass::Fatal {
                error!(operation = %operation, error = %err, "Ledger call failed (not retryable)");
                return Err(EngineError::LedgerFatal(err));
            }

            if retries >= self.max_attempts {
                error!(
                    operation = %operation,
                    attempts = retries + 1,
                    error = %err,
                    "Max retries exceeded"
                );
                return Err(EngineError::LedgerTransient(err));
            }

            retries += 1;
            let delay = self.next_delay(retries);
            warn!(
                operation = %operation,
                attempt = retries,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient ledger error, retrying..."
            );
            tokio::time::sleep(delay).await;
        }
    }
}

//! Error taxonomy shared by the mint engine, purchase pipeline and job layer

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::retry_policy::{self, ErrorClass};

/// Error returned by the ledger network for a submitted transaction or query
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct LedgerError {
    /// Ledger status code (e.g. `BUSY`, `INSUFFICIENT_TX_FEE`)
    pub code: String,
    /// Human readable message from the ledger or gateway
    pub message: String,
}

impl LedgerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// True when the code or message contains any of the given signatures.
    ///
    /// Comparison ignores case and treats spaces as underscores, so
    /// `"already associated"` matches `ALREADY_ASSOCIATED`.
    pub fn matches_any(&self, signatures: &[&str]) -> bool {
        let haystack = format!("{} {}", self.code, self.message)
            .to_uppercase()
            .replace(' ', "_");
        signatures
            .iter()
            .any(|sig| haystack.contains(&sig.to_uppercase().replace(' ', "_")))
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i64),

    #[error("Transient ledger error (retries exhausted): {0}")]
    LedgerTransient(LedgerError),

    #[error("Ledger error: {0}")]
    LedgerFatal(LedgerError),

    #[error("Insufficient balance: {available} < {required}")]
    InsufficientBalance { available: Decimal, required: Decimal },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Already in requested state: {0}")]
    AlreadyInState(LedgerError),

    #[error("Job {0} cannot be cancelled in its current state")]
    NotCancelable(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Invalid config: {0}")]
    Config(String),
}

impl EngineError {
    /// Wire code used in job results and error events
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidQuantity(_) => "invalid_quantity",
            EngineError::LedgerTransient(_) => "ledger_transient",
            EngineError::LedgerFatal(_) => "ledger_fatal",
            EngineError::InsufficientBalance { .. } => "insufficient_balance",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyInState(_) => "already_in_state",
            EngineError::NotCancelable(_) => "not_cancelable",
            EngineError::Validation(_) => "validation",
            EngineError::DeliveryFailed(_) => "delivery_failed",
            EngineError::Repository(_) => "repository",
            EngineError::Config(_) => "config",
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        if retry_policy::is_already_in_state(&err) {
            return EngineError::AlreadyInState(err);
        }
        match retry_policy::classify(&err) {
            ErrorClass::Transient => EngineError::LedgerTransient(err),
            ErrorClass::Fatal => EngineError::LedgerFatal(err),
        }
    }
}

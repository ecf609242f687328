//! Batch minting models: request, planned batches and per-batch outcomes

use serde::{Deserialize, Serialize};

use crate::models::ledger::KeyRef;

/// Request to issue `total_quantity` units of a collateral token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRequest {
    pub collateral_token_id: String,
    pub total_quantity: i64,
    pub signing_key_ref: KeyRef,
    /// Metadata attached to every issued unit (typically an IPFS CID)
    #[serde(default)]
    pub metadata: Option<String>,
    /// Overrides the configured fan-out for this request
    #[serde(default)]
    pub max_parallel_workers: Option<usize>,
}

/// A bounded group of units submitted as one ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// 1-based, contiguous
    pub batch_number: usize,
    /// Position of the first unit of this batch within the request
    pub offset: usize,
    pub size: usize,
}

impl Batch {
    /// Index range of this batch's units within the request
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.size
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_number: usize,
    pub success: bool,
    /// Unit ids issued (or delivered) by this batch; empty on failure
    pub issued_unit_ids: Vec<i64>,
    pub transaction_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchOutcome {
    pub fn succeeded(batch_number: usize, unit_ids: Vec<i64>, transaction_ref: String) -> Self {
        Self {
            batch_number,
            success: true,
            issued_unit_ids: unit_ids,
            transaction_ref,
            error: None,
        }
    }

    pub fn failed(batch_number: usize, error: impl Into<String>) -> Self {
        Self {
            batch_number,
            success: false,
            issued_unit_ids: Vec::new(),
            transaction_ref: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Result of running every planned batch, in batch order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateMintResult {
    pub all_issued_unit_ids: Vec<i64>,
    pub transaction_refs: Vec<String>,
    pub outcomes_by_batch: Vec<BatchOutcome>,
    pub overall_success: bool,
    pub total_issued: usize,
    pub total_failed_batches: usize,
}

impl AggregateMintResult {
    /// Builds the aggregate from outcomes in any completion order
    pub fn from_outcomes(mut outcomes: Vec<BatchOutcome>) -> Self {
        outcomes.sort_by_key(|o| o.batch_number);

        let mut all_issued_unit_ids = Vec::new();
        let mut transaction_refs = Vec::new();
        let mut total_failed_batches = 0;

        for outcome in &outcomes {
            if outcome.success {
                all_issued_unit_ids.extend_from_slice(&outcome.issued_unit_ids);
                transaction_refs.push(outcome.transaction_ref.clone());
            } else {
                total_failed_batches += 1;
            }
        }

        Self {
            total_issued: all_issued_unit_ids.len(),
            all_issued_unit_ids,
            transaction_refs,
            overall_success: total_failed_batches == 0,
            total_failed_batches,
            outcomes_by_batch: outcomes,
        }
    }

    /// Error messages of failed batches, in batch order
    pub fn failure_messages(&self) -> Vec<String> {
        self.outcomes_by_batch
            .iter()
            .filter(|o| !o.success)
            .map(|o| {
                format!(
                    "batch {}: {}",
                    o.batch_number,
                    o.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} units issued across {} batches ({} failed)",
            self.total_issued,
            self.outcomes_by_batch.len(),
            self.total_failed_batches
        )
    }
}

//! Progress event shapes streamed to the user that owns an operation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Long-running operation kinds that report progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Mint,
    Purchase,
}

impl OperationKind {
    pub fn progress_event(&self) -> &'static str {
        match self {
            OperationKind::Mint => "token-mint-progress",
            OperationKind::Purchase => "token-purchase-progress",
        }
    }

    pub fn complete_event(&self) -> &'static str {
        match self {
            OperationKind::Mint => "token-mint-complete",
            OperationKind::Purchase => "token-purchase-complete",
        }
    }

    pub fn error_event(&self) -> &'static str {
        match self {
            OperationKind::Mint => "token-mint-error",
            OperationKind::Purchase => "token-purchase-error",
        }
    }
}

/// Mint job stages
///
/// validating (10) → minting_tokens (20 → 90) → updating_records (95) → complete (100)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MintStage {
    Validating,
    MintingTokens,
    UpdatingRecords,
    Complete,
}

pub const MINTING_PROGRESS_START: u8 = 20;
pub const MINTING_PROGRESS_END: u8 = 90;

impl MintStage {
    pub fn checkpoint(&self) -> u8 {
        match self {
            MintStage::Validating => 10,
            MintStage::MintingTokens => MINTING_PROGRESS_START,
            MintStage::UpdatingRecords => 95,
            MintStage::Complete => 100,
        }
    }
}

impl std::fmt::Display for MintStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MintStage::Validating => write!(f, "validating"),
            MintStage::MintingTokens => write!(f, "minting_tokens"),
            MintStage::UpdatingRecords => write!(f, "updating_records"),
            MintStage::Complete => write!(f, "complete"),
        }
    }
}

/// Batch-level detail attached to progress events during fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_batch: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_batches: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_units: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_units: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unit_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent<S> {
    pub job_id: String,
    /// Collateral token the operation acts on
    pub subject_id: String,
    pub stage: S,
    /// 0-100, never decreases within one operation
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ProgressDetails>,
}

/// Terminal success (or partial success) event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: String,
    pub subject_id: String,
    pub success: bool,
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub result: Value,
}

/// Terminal failure event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub job_id: String,
    pub subject_id: String,
    /// Stage the operation was in when it aborted
    pub stage: String,
    pub code: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Event routed to one user's progress room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEvent {
    pub user_id: String,
    pub event: String,
    pub payload: Value,
}

/// Linear position of `done / total` inside the `start..=end` band
pub fn interpolate(start: u8, end: u8, done: usize, total: usize) -> u8 {
    if total == 0 || end <= start {
        return end.max(start);
    }
    let span = (end - start) as usize;
    let step = span * done.min(total) / total;
    start + step as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(OperationKind::Purchase.progress_event(), "token-purchase-progress");
        assert_eq!(OperationKind::Purchase.error_event(), "token-purchase-error");
        assert_eq!(OperationKind::Mint.complete_event(), "token-mint-complete");
    }

    #[test]
    fn test_interpolate() {
        assert_eq!(interpolate(30, 80, 0, 4), 30);
        assert_eq!(interpolate(30, 80, 2, 4), 55);
        assert_eq!(interpolate(30, 80, 4, 4), 80);
        assert_eq!(interpolate(30, 80, 9, 4), 80);
        assert_eq!(interpolate(30, 80, 0, 0), 80);
    }

    #[test]
    fn test_progress_event_serializes_stage_snake_case() {
        let event = ProgressEvent {
            job_id: "job-1".to_string(),
            subject_id: "0.0.5005".to_string(),
            stage: MintStage::MintingTokens,
            progress: 20,
            message: "Minting".to_string(),
            timestamp: Utc::now(),
            details: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "minting_tokens");
        assert!(json.get("details").is_none());
    }
}

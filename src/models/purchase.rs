//! Investor purchase of collateral units: request, stages and result

use serde::{Deserialize, Serialize};

use crate::models::mint::BatchOutcome;

/// Purchase request as enqueued by the API layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub owner_user_id: String,
    pub collateral_token_id: String,
    pub quantity: i64,
    /// Buy exactly this unit; only valid with `quantity == 1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<i64>,
}

/// Purchase pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStage {
    Validating,
    CheckingBalance,
    ProcessingPayment,
    DeliveringNfts,
    FreezingTokens,
    UpdatingDatabase,
    Complete,
}

/// Progress band for unit delivery; interpolated per executor chunk
pub const DELIVERY_PROGRESS_START: u8 = 30;
pub const DELIVERY_PROGRESS_END: u8 = 80;

impl PurchaseStage {
    /// Progress reported when the stage starts
    pub fn checkpoint(&self) -> u8 {
        match self {
            PurchaseStage::Validating => 10,
            PurchaseStage::CheckingBalance => 20,
            PurchaseStage::ProcessingPayment => 30,
            PurchaseStage::DeliveringNfts => DELIVERY_PROGRESS_START,
            PurchaseStage::FreezingTokens => 85,
            PurchaseStage::UpdatingDatabase => 95,
            PurchaseStage::Complete => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStage::Validating => "validating",
            PurchaseStage::CheckingBalance => "checking_balance",
            PurchaseStage::ProcessingPayment => "processing_payment",
            PurchaseStage::DeliveringNfts => "delivering_nfts",
            PurchaseStage::FreezingTokens => "freezing_tokens",
            PurchaseStage::UpdatingDatabase => "updating_database",
            PurchaseStage::Complete => "complete",
        }
    }
}

impl std::fmt::Display for PurchaseStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ledger transaction committed by a pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransaction {
    pub stage: PurchaseStage,
    pub kind: String,
    pub transaction_ref: String,
}

/// Live state of one purchase, owned by the pipeline driving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseOperation {
    pub owner_user_id: String,
    pub collateral_token_id: String,
    pub requested_quantity: i64,
    pub unit_id: Option<i64>,
    pub current_stage: PurchaseStage,
    pub current_stage_progress: u8,
    pub side_effects: Vec<StageTransaction>,
}

impl PurchaseOperation {
    pub fn new(request: &PurchaseRequest) -> Self {
        Self {
            owner_user_id: request.owner_user_id.clone(),
            collateral_token_id: request.collateral_token_id.clone(),
            requested_quantity: request.quantity,
            unit_id: request.unit_id,
            current_stage: PurchaseStage::Validating,
            current_stage_progress: 0,
            side_effects: Vec::new(),
        }
    }

    pub fn enter(&mut self, stage: PurchaseStage) {
        self.current_stage = stage;
        self.current_stage_progress = self.current_stage_progress.max(stage.checkpoint());
    }

    pub fn set_progress(&mut self, percent: u8) {
        self.current_stage_progress = self.current_stage_progress.max(percent.min(100));
    }

    pub fn record(&mut self, kind: &str, transaction_ref: impl Into<String>) {
        self.side_effects.push(StageTransaction {
            stage: self.current_stage,
            kind: kind.to_string(),
            transaction_ref: transaction_ref.into(),
        });
    }

    /// First transaction of the given kind, if any stage committed one
    pub fn transaction(&self, kind: &str) -> Option<String> {
        self.side_effects
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.transaction_ref.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseResult {
    pub success: bool,
    pub token_id: String,
    /// Units that reached the investor's account
    pub unit_ids: Vec<i64>,
    pub investor_account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_transaction_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub association_transaction_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freeze_transaction_ref: Option<String>,
    pub batches: Vec<BatchOutcome>,
    pub transactions: Vec<StageTransaction>,
    /// Stage that aborted the pipeline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<PurchaseStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

//! Investor purchase of collateral units
//!
//! Stages run in a fixed order, each reported at its progress checkpoint:
//!
//! validating (10) → checking_balance (20) → processing_payment (30)
//! → delivering_nfts (30 → 80) → freezing_tokens (85)
//! → updating_database (95) → complete (100)
//!
//! Failures up to and including delivery abort the run with an error event.
//! Effects already committed on the ledger (e.g. the payment) are not
//! reversed. After delivery, freeze and bookkeeping failures are logged and
//! reported in the result instead of aborting.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::collateral::{CollateralRecord, LedgerAccount};
use crate::models::ledger::{LedgerReceipt, LedgerTransaction};
use crate::models::mint::{AggregateMintResult, BatchOutcome};
use crate::models::progress::{interpolate, ProgressDetails};
use crate::models::purchase::{
    PurchaseOperation, PurchaseRequest, PurchaseResult, PurchaseStage, DELIVERY_PROGRESS_END,
    DELIVERY_PROGRESS_START,
};
use crate::services::batch_executor::{BatchExecutor, ChunkObserver, ChunkProgress};
use crate::services::batch_planner::plan_batches;
use crate::services::ledger_client::LedgerClient;
use crate::services::progress::ProgressReporter;
use crate::services::repository::{AccountBalanceUpdate, PurchaseSettlement, Repository};
use crate::services::retry_policy::RetryPolicy;

/// Side-effect labels recorded on the operation
const TX_PAYMENT_ASSOCIATION: &str = "payment_association";
const TX_PAYMENT: &str = "payment";
const TX_UNFREEZE: &str = "unfreeze";
const TX_ASSOCIATION: &str = "association";
const TX_DELIVERY: &str = "delivery";
const TX_FREEZE: &str = "freeze";

/// Accounts and collateral resolved during validation
struct Parties {
    investor: LedgerAccount,
    beneficiary: LedgerAccount,
    collateral: CollateralRecord,
}

/// What the balance check settled on
struct Quote {
    unit_ids: Vec<i64>,
    /// Payment amount in minor units
    amount: u64,
}

struct Delivery {
    aggregate: AggregateMintResult,
}

/// Mutable state of one run, kept outside the stage functions so an abort
/// can still report what happened
struct RunState {
    op: PurchaseOperation,
    investor_account_id: String,
    delivered: Vec<i64>,
    batches: Vec<BatchOutcome>,
}

impl RunState {
    fn result(&self, success: bool, error: Option<String>) -> PurchaseResult {
        PurchaseResult {
            success,
            token_id: self.op.collateral_token_id.clone(),
            unit_ids: self.delivered.clone(),
            investor_account_id: self.investor_account_id.clone(),
            payment_transaction_ref: self.op.transaction(TX_PAYMENT),
            association_transaction_ref: self.op.transaction(TX_ASSOCIATION),
            freeze_transaction_ref: self.op.transaction(TX_FREEZE),
            batches: self.batches.clone(),
            transactions: self.op.side_effects.clone(),
            failed_stage: None,
            error,
        }
    }
}

pub struct PurchasePipeline {
    ledger: Arc<dyn LedgerClient>,
    repository: Arc<dyn Repository>,
    retry: RetryPolicy,
    config: EngineConfig,
}

impl PurchasePipeline {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        repository: Arc<dyn Repository>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            repository,
            retry: RetryPolicy::new(&config.retry),
            config,
        }
    }

    /// Run the purchase to a terminal state. Never returns an error: aborts
    /// come back as `success == false` after the error event was sent.
    pub async fn run(
        &self,
        request: &PurchaseRequest,
        reporter: &ProgressReporter<PurchaseStage>,
    ) -> PurchaseResult {
        let mut state = RunState {
            op: PurchaseOperation::new(request),
            investor_account_id: String::new(),
            delivered: Vec::new(),
            batches: Vec::new(),
        };

        info!(
            job_id = %reporter.job_id(),
            user_id = %request.owner_user_id,
            token_id = %request.collateral_token_id,
            quantity = request.quantity,
            unit_id = ?request.unit_id,
            "Starting token purchase"
        );

        match self.execute(request, reporter, &mut state).await {
            Ok(result) => result,
            Err(err) => {
                error!(
                    job_id = %reporter.job_id(),
                    stage = %state.op.current_stage,
                    code = err.code(),
                    error = %err,
                    "Token purchase aborted"
                );
                reporter.fail(&err).await;
                let mut result = state.result(false, Some(err.to_string()));
                result.failed_stage = Some(state.op.current_stage);
                result
            }
        }
    }

    async fn execute(
        &self,
        request: &PurchaseRequest,
        reporter: &ProgressReporter<PurchaseStage>,
        state: &mut RunState,
    ) -> Result<PurchaseResult, EngineError> {
        self.enter(state, reporter, PurchaseStage::Validating, "Validating purchase request...")
            .await;
        let parties = self.validate(request).await?;
        state.investor_account_id = parties.investor.ledger_account_id.clone();

        self.enter(
            state,
            reporter,
            PurchaseStage::CheckingBalance,
            "Checking available units and balance...",
        )
        .await;
        let quote = self.check_balance(request, &parties).await?;

        self.enter(state, reporter, PurchaseStage::ProcessingPayment, "Processing payment...")
            .await;
        self.process_payment(&parties, &quote, state).await?;

        self.enter(
            state,
            reporter,
            PurchaseStage::DeliveringNfts,
            format!("Delivering {} units...", quote.unit_ids.len()),
        )
        .await;
        let delivery = self.deliver(&parties, &quote, state, reporter).await?;
        let full_delivery = delivery.aggregate.overall_success;

        if full_delivery {
            self.enter(
                state,
                reporter,
                PurchaseStage::FreezingTokens,
                "Freezing delivered tokens...",
            )
            .await;
            self.freeze(&parties, state).await;
        } else {
            warn!(
                job_id = %reporter.job_id(),
                failed_batches = delivery.aggregate.total_failed_batches,
                "Partial delivery, investor account left unfrozen"
            );
        }

        self.enter(
            state,
            reporter,
            PurchaseStage::UpdatingDatabase,
            "Updating system records and balances...",
        )
        .await;
        let settlement_error = match self.settle(&parties, state.delivered.len()).await {
            Ok(()) => None,
            Err(e) => {
                error!(job_id = %reporter.job_id(), error = %e, "Failed to persist purchase");
                Some(format!("units delivered but records not updated: {}", e))
            }
        };

        let mut errors = delivery.aggregate.failure_messages();
        errors.extend(settlement_error);
        let success = errors.is_empty();
        let result = state.result(success, (!success).then(|| errors.join("; ")));

        self.enter(
            state,
            reporter,
            PurchaseStage::Complete,
            if success {
                "Token purchase completed successfully!".to_string()
            } else {
                format!("Token purchase completed with issues: {}", errors.join("; "))
            },
        )
        .await;
        reporter
            .complete(
                success,
                format!("{} units delivered", result.unit_ids.len()),
                job_result(&result),
            )
            .await;

        info!(
            job_id = %reporter.job_id(),
            success,
            delivered = result.unit_ids.len(),
            "Token purchase finished"
        );
        Ok(result)
    }

    async fn enter(
        &self,
        state: &mut RunState,
        reporter: &ProgressReporter<PurchaseStage>,
        stage: PurchaseStage,
        message: impl Into<String>,
    ) {
        state.op.enter(stage);
        reporter.stage(stage, stage.checkpoint(), message).await;
    }

    async fn validate(&self, request: &PurchaseRequest) -> Result<Parties, EngineError> {
        if request.unit_id.is_some() && request.quantity > 1 {
            return Err(EngineError::Validation(
                "a specific unit can only be bought with quantity 1".to_string(),
            ));
        }
        if request.quantity <= 0 {
            return Err(EngineError::InvalidQuantity(request.quantity));
        }

        let investor = self
            .repository
            .find_account_by_user(&request.owner_user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("Investor account".to_string()))?;

        let collateral = self
            .repository
            .find_collateral_by_token(&request.collateral_token_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("Collateral {}", request.collateral_token_id))
            })?;

        let beneficiary = self
            .repository
            .find_account_by_ledger_id(&collateral.beneficiary_account_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("Beneficiary account".to_string()))?;

        Ok(Parties {
            investor,
            beneficiary,
            collateral,
        })
    }

    async fn check_balance(
        &self,
        request: &PurchaseRequest,
        parties: &Parties,
    ) -> Result<Quote, EngineError> {
        let token_id = &parties.collateral.token_id;
        let holder = &parties.beneficiary.ledger_account_id;

        let unit_ids = match request.unit_id {
            Some(unit_id) => {
                let available = self
                    .retry
                    .run("available units", || {
                        self.ledger.available_units(token_id, holder, None)
                    })
                    .await?;
                if !available.contains(&unit_id) {
                    return Err(EngineError::NotFound(format!(
                        "Unit {} of {}",
                        unit_id, token_id
                    )));
                }
                vec![unit_id]
            }
            None => {
                let wanted = request.quantity as usize;
                let mut available = self
                    .retry
                    .run("available units", || {
                        self.ledger.available_units(token_id, holder, Some(wanted))
                    })
                    .await?;
                available.sort_unstable();
                available.truncate(wanted);
                available
            }
        };

        if unit_ids.is_empty() {
            return Err(EngineError::NotFound(format!("Available units of {}", token_id)));
        }
        if (unit_ids.len() as i64) < request.quantity {
            warn!(
                token_id = %token_id,
                requested = request.quantity,
                available = unit_ids.len(),
                "Fewer units available than requested"
            );
        }

        let required = parties.collateral.unit_price * Decimal::from(unit_ids.len() as u64);
        let balance_minor = self
            .retry
            .run("payment balance", || {
                self.ledger.account_balance(
                    &parties.investor.ledger_account_id,
                    &self.config.payment_token_id,
                )
            })
            .await?;
        let available = self.to_major(balance_minor);

        if available < required {
            return Err(EngineError::InsufficientBalance {
                available,
                required,
            });
        }

        let amount = self.to_minor(required)?;
        debug!(
            units = unit_ids.len(),
            required = %required,
            available = %available,
            amount,
            "Balance check passed"
        );
        Ok(Quote { unit_ids, amount })
    }

    async fn process_payment(
        &self,
        parties: &Parties,
        quote: &Quote,
        state: &mut RunState,
    ) -> Result<(), EngineError> {
        let payment_token = &self.config.payment_token_id;

        let associate = LedgerTransaction::Associate {
            token_id: payment_token.clone(),
            account_id: parties.beneficiary.ledger_account_id.clone(),
            signer: parties.beneficiary.key_ref.clone(),
        };
        if let Some(receipt) = self.submit_tolerant("associate payment token", associate).await? {
            state.op.record(TX_PAYMENT_ASSOCIATION, receipt.transaction_ref);
        }

        let transfer = LedgerTransaction::TransferFungible {
            token_id: payment_token.clone(),
            from_account_id: parties.investor.ledger_account_id.clone(),
            to_account_id: parties.beneficiary.ledger_account_id.clone(),
            amount: quote.amount,
            signer: parties.investor.key_ref.clone(),
        };
        let receipt = self.submit("payment transfer", transfer).await?;
        info!(tx = %receipt.transaction_ref, amount = quote.amount, "Payment transferred");
        state.op.record(TX_PAYMENT, receipt.transaction_ref);
        Ok(())
    }

    async fn deliver(
        &self,
        parties: &Parties,
        quote: &Quote,
        state: &mut RunState,
        reporter: &ProgressReporter<PurchaseStage>,
    ) -> Result<Delivery, EngineError> {
        let token_id = &parties.collateral.token_id;
        let investor = &parties.investor;
        let beneficiary = &parties.beneficiary;

        let unfreeze = LedgerTransaction::Unfreeze {
            token_id: token_id.clone(),
            account_id: investor.ledger_account_id.clone(),
            freeze_key: beneficiary.key_ref.clone(),
        };
        if let Some(receipt) = self.submit_tolerant("unfreeze investor", unfreeze).await? {
            state.op.record(TX_UNFREEZE, receipt.transaction_ref);
        }

        let associate = LedgerTransaction::Associate {
            token_id: token_id.clone(),
            account_id: investor.ledger_account_id.clone(),
            signer: investor.key_ref.clone(),
        };
        if let Some(receipt) = self.submit_tolerant("associate investor", associate).await? {
            state.op.record(TX_ASSOCIATION, receipt.transaction_ref);
        }

        let units = &quote.unit_ids;
        let batches = plan_batches(units.len() as i64, self.config.batch_size_cap)?;
        let executor = BatchExecutor::new(self.config.default_max_parallel);
        let mut observer = DeliveryObserver {
            reporter,
            delivered: Vec::new(),
        };

        let aggregate = executor
            .execute(
                &batches,
                |batch| {
                    self.transfer_batch(
                        token_id,
                        units[batch.range()].to_vec(),
                        batch.batch_number,
                        beneficiary,
                        investor,
                    )
                },
                &mut observer,
            )
            .await;

        for outcome in aggregate.outcomes_by_batch.iter().filter(|o| o.success) {
            state.op.record(TX_DELIVERY, outcome.transaction_ref.clone());
        }
        state.delivered = aggregate.all_issued_unit_ids.clone();
        state.batches = aggregate.outcomes_by_batch.clone();
        state.op.set_progress(DELIVERY_PROGRESS_END);

        if aggregate.total_issued == 0 {
            return Err(EngineError::DeliveryFailed(
                aggregate.failure_messages().join("; "),
            ));
        }

        Ok(Delivery { aggregate })
    }

    async fn transfer_batch(
        &self,
        token_id: &str,
        unit_ids: Vec<i64>,
        batch_number: usize,
        from: &LedgerAccount,
        to: &LedgerAccount,
    ) -> BatchOutcome {
        let tx = LedgerTransaction::TransferUnits {
            token_id: token_id.to_string(),
            unit_ids: unit_ids.clone(),
            from_account_id: from.ledger_account_id.clone(),
            to_account_id: to.ledger_account_id.clone(),
            signers: vec![from.key_ref.clone(), to.key_ref.clone()],
        };

        match self.submit(&format!("deliver batch {}", batch_number), tx).await {
            Ok(receipt) => BatchOutcome::succeeded(batch_number, unit_ids, receipt.transaction_ref),
            Err(e) => {
                warn!(batch = batch_number, error = %e, "Delivery batch failed");
                BatchOutcome::failed(batch_number, e.to_string())
            }
        }
    }

    async fn freeze(&self, parties: &Parties, state: &mut RunState) {
        let tx = LedgerTransaction::Freeze {
            token_id: parties.collateral.token_id.clone(),
            account_id: parties.investor.ledger_account_id.clone(),
            freeze_key: parties.beneficiary.key_ref.clone(),
        };
        match self.submit("freeze investor", tx).await {
            Ok(receipt) => state.op.record(TX_FREEZE, receipt.transaction_ref),
            Err(e) => warn!(
                account = %parties.investor.ledger_account_id,
                error = %e,
                "Failed to freeze delivered tokens"
            ),
        }
    }

    /// Re-read balances from the ledger and persist them with the sold count
    async fn settle(&self, parties: &Parties, units_sold: usize) -> Result<(), EngineError> {
        let payment_token = &self.config.payment_token_id;
        let investor_id = &parties.investor.ledger_account_id;
        let beneficiary_id = &parties.beneficiary.ledger_account_id;

        let (supply, investor_balance, beneficiary_balance) = tokio::try_join!(
            self.retry.run("payment token supply", || {
                self.ledger.token_total_supply(payment_token)
            }),
            self.retry.run("investor balance", || {
                self.ledger.account_balance(investor_id, payment_token)
            }),
            self.retry.run("beneficiary balance", || {
                self.ledger.account_balance(beneficiary_id, payment_token)
            }),
        )?;

        let settlement = PurchaseSettlement {
            collateral_token_id: parties.collateral.token_id.clone(),
            units_sold: units_sold as i64,
            payment_token_id: payment_token.clone(),
            payment_token_decimals: self.config.payment_token_decimals,
            payment_token_supply: self.to_major(supply),
            balances: vec![
                AccountBalanceUpdate {
                    ledger_account_id: investor_id.clone(),
                    balance: self.to_major(investor_balance),
                },
                AccountBalanceUpdate {
                    ledger_account_id: beneficiary_id.clone(),
                    balance: self.to_major(beneficiary_balance),
                },
            ],
        };

        self.repository.settle_purchase(&settlement).await?;
        Ok(())
    }

    async fn submit(
        &self,
        operation: &str,
        tx: LedgerTransaction,
    ) -> Result<LedgerReceipt, EngineError> {
        self.retry
            .run(operation, || self.ledger.submit(tx.clone()))
            .await
    }

    /// Submit where "already in that state" counts as done
    async fn submit_tolerant(
        &self,
        operation: &str,
        tx: LedgerTransaction,
    ) -> Result<Option<LedgerReceipt>, EngineError> {
        match self.submit(operation, tx).await {
            Ok(receipt) => Ok(Some(receipt)),
            Err(EngineError::AlreadyInState(e)) => {
                debug!(operation = %operation, reason = %e, "Already in requested state, continuing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn to_major(&self, minor: u64) -> Decimal {
        Decimal::from_i128_with_scale(minor as i128, self.config.payment_token_decimals)
    }

    fn to_minor(&self, major: Decimal) -> Result<u64, EngineError> {
        let scale = Decimal::from(10u64.pow(self.config.payment_token_decimals));
        (major * scale)
            .round()
            .to_u64()
            .ok_or_else(|| EngineError::Validation(format!("payment amount out of range: {}", major)))
    }
}

/// Maps executor chunks onto the 30 → 80 delivery band
struct DeliveryObserver<'a> {
    reporter: &'a ProgressReporter<PurchaseStage>,
    delivered: Vec<i64>,
}

#[async_trait]
impl<'a> ChunkObserver for DeliveryObserver<'a> {
    async fn chunk_started(&mut self, progress: ChunkProgress) {
        let percent = interpolate(
            DELIVERY_PROGRESS_START,
            DELIVERY_PROGRESS_END,
            progress.completed_batches,
            progress.total_batches,
        );
        self.reporter
            .stage_with_details(
                PurchaseStage::DeliveringNfts,
                percent,
                format!(
                    "Delivering batch group {} of {}",
                    progress.chunk_number, progress.total_chunks
                ),
                Some(ProgressDetails {
                    current_batch: Some(progress.completed_batches + 1),
                    total_batches: Some(progress.total_batches),
                    processed_units: Some(progress.processed_units),
                    total_units: Some(progress.total_units),
                    unit_ids: Vec::new(),
                }),
            )
            .await;
    }

    async fn chunk_settled(&mut self, progress: ChunkProgress, outcomes: &[BatchOutcome]) {
        for outcome in outcomes.iter().filter(|o| o.success) {
            self.delivered.extend_from_slice(&outcome.issued_unit_ids);
        }
        let percent = interpolate(
            DELIVERY_PROGRESS_START,
            DELIVERY_PROGRESS_END,
            progress.completed_batches,
            progress.total_batches,
        );
        self.reporter
            .stage_with_details(
                PurchaseStage::DeliveringNfts,
                percent,
                format!(
                    "Delivered {} of {} units",
                    self.delivered.len(),
                    progress.total_units
                ),
                Some(ProgressDetails {
                    current_batch: Some(progress.completed_batches),
                    total_batches: Some(progress.total_batches),
                    processed_units: Some(progress.processed_units),
                    total_units: Some(progress.total_units),
                    unit_ids: self.delivered.clone(),
                }),
            )
            .await;
    }
}

/// Result payload stored on the job
pub fn job_result(result: &PurchaseResult) -> serde_json::Value {
    serde_json::to_value(result).unwrap_or_else(|e| {
        json!({ "success": result.success, "error": format!("result encoding failed: {}", e) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct NoLedger;

    #[async_trait]
    impl LedgerClient for NoLedger {
        async fn submit(
            &self,
            _tx: LedgerTransaction,
        ) -> Result<LedgerReceipt, crate::error::LedgerError> {
            unreachable!()
        }
        async fn account_balance(&self, _: &str, _: &str) -> Result<u64, crate::error::LedgerError> {
            unreachable!()
        }
        async fn token_total_supply(&self, _: &str) -> Result<u64, crate::error::LedgerError> {
            unreachable!()
        }
        async fn available_units(
            &self,
            _: &str,
            _: &str,
            _: Option<usize>,
        ) -> Result<Vec<i64>, crate::error::LedgerError> {
            unreachable!()
        }
    }

    struct NoRepository;

    #[async_trait]
    impl Repository for NoRepository {
        async fn find_account_by_user(
            &self,
            _: &str,
        ) -> Result<Option<LedgerAccount>, crate::services::repository::RepositoryError> {
            Ok(None)
        }
        async fn find_account_by_ledger_id(
            &self,
            _: &str,
        ) -> Result<Option<LedgerAccount>, crate::services::repository::RepositoryError> {
            Ok(None)
        }
        async fn find_collateral_by_token(
            &self,
            _: &str,
        ) -> Result<Option<CollateralRecord>, crate::services::repository::RepositoryError> {
            Ok(None)
        }
        async fn collateral_expiring_between(
            &self,
            _: chrono::DateTime<chrono::Utc>,
            _: chrono::DateTime<chrono::Utc>,
        ) -> Result<Vec<CollateralRecord>, crate::services::repository::RepositoryError> {
            Ok(Vec::new())
        }
        async fn record_minted_units(
            &self,
            _: &str,
            _: &[i64],
        ) -> Result<(), crate::services::repository::RepositoryError> {
            Ok(())
        }
        async fn settle_purchase(
            &self,
            _: &PurchaseSettlement,
        ) -> Result<(), crate::services::repository::RepositoryError> {
            Ok(())
        }
    }

    fn pipeline() -> PurchasePipeline {
        PurchasePipeline::new(
            Arc::new(NoLedger),
            Arc::new(NoRepository),
            EngineConfig::new("0.0.1001"),
        )
    }

    #[test]
    fn test_minor_major_conversion() {
        let pipeline = pipeline();
        assert_eq!(pipeline.to_major(12345), dec!(123.45));
        assert_eq!(pipeline.to_minor(dec!(123.45)).unwrap(), 12345);
        assert_eq!(pipeline.to_minor(dec!(0.005)).unwrap(), 0);
        assert!(pipeline.to_minor(dec!(-1)).is_err());
    }

    #[tokio::test]
    async fn test_unknown_investor_aborts_in_validation() {
        let broadcaster = crate::services::progress::ProgressBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        let reporter = ProgressReporter::new(
            broadcaster.clone(),
            crate::models::progress::OperationKind::Purchase,
            "user-1",
            "job-1",
            "0.0.5005",
        );
        let request = PurchaseRequest {
            owner_user_id: "user-1".to_string(),
            collateral_token_id: "0.0.5005".to_string(),
            quantity: 2,
            unit_id: None,
        };

        let result = pipeline().run(&request, &reporter).await;

        assert!(!result.success);
        assert_eq!(result.failed_stage, Some(PurchaseStage::Validating));
        assert_eq!(result.error.as_deref(), Some("Investor account not found"));

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.event);
        }
        assert_eq!(names, vec!["token-purchase-progress", "token-purchase-error"]);
    }
}

//! Concurrent minting of collateral units in ledger-sized batches

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::models::ledger::LedgerTransaction;
use crate::models::mint::{AggregateMintResult, Batch, BatchOutcome, MintRequest};
use crate::services::batch_executor::{BatchExecutor, ChunkObserver};
use crate::services::batch_planner::plan_batches;
use crate::services::ledger_client::LedgerClient;
use crate::services::retry_policy::RetryPolicy;

pub struct MintService {
    ledger: Arc<dyn LedgerClient>,
    retry: RetryPolicy,
    batch_size_cap: usize,
    default_max_parallel: usize,
}

impl MintService {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: &EngineConfig) -> Self {
        Self {
            ledger,
            retry: RetryPolicy::new(&config.retry),
            batch_size_cap: config.batch_size_cap,
            default_max_parallel: config.default_max_parallel,
        }
    }

    /// Issue `request.total_quantity` units. Only planning errors are
    /// returned as `Err`; batch failures are reported in the result.
    pub async fn mint<O>(
        &self,
        request: &MintRequest,
        observer: &mut O,
    ) -> Result<AggregateMintResult, EngineError>
    where
        O: ChunkObserver + ?Sized,
    {
        let batches = plan_batches(request.total_quantity, self.batch_size_cap)?;
        let executor = BatchExecutor::new(
            request
                .max_parallel_workers
                .unwrap_or(self.default_max_parallel),
        );

        info!(
            token_id = %request.collateral_token_id,
            total_quantity = request.total_quantity,
            batches = batches.len(),
            max_parallel = executor.max_parallel(),
            "Starting concurrent mint"
        );

        let result = executor
            .execute(&batches, |batch| self.mint_batch(request, batch), observer)
            .await;

        info!(
            token_id = %request.collateral_token_id,
            summary = %result.summary(),
            "Concurrent mint finished"
        );
        Ok(result)
    }

    async fn mint_batch(&self, request: &MintRequest, batch: Batch) -> BatchOutcome {
        let metadata = request
            .metadata
            .as_ref()
            .map(|m| vec![m.clone(); batch.size])
            .unwrap_or_default();

        let tx = LedgerTransaction::MintUnits {
            token_id: request.collateral_token_id.clone(),
            count: batch.size,
            metadata,
            supply_key: request.signing_key_ref.clone(),
        };

        let operation = format!("mint batch {}", batch.batch_number);
        match self
            .retry
            .run(&operation, || self.ledger.submit(tx.clone()))
            .await
        {
            Ok(receipt) if receipt.issued_unit_ids.is_empty() => {
                warn!(batch = batch.batch_number, tx = %receipt.transaction_ref, "Mint receipt has no serial numbers");
                BatchOutcome::failed(batch.batch_number, "no serial numbers returned")
            }
            Ok(receipt) => {
                if receipt.issued_unit_ids.len() != batch.size {
                    warn!(
                        batch = batch.batch_number,
                        expected = batch.size,
                        issued = receipt.issued_unit_ids.len(),
                        "Ledger issued an unexpected number of units"
                    );
                }
                BatchOutcome::succeeded(
                    batch.batch_number,
                    receipt.issued_unit_ids,
                    receipt.transaction_ref,
                )
            }
            Err(e) => {
                warn!(batch = batch.batch_number, error = %e, "Mint batch failed");
                BatchOutcome::failed(batch.batch_number, e.to_string())
            }
        }
    }
}

//! Mint queue handler: validate, mint in batches, record the issued units

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::error::{EngineError, LedgerError};
use crate::jobs::store::JobStore;
use crate::jobs::worker::JobHandler;
use crate::models::job::{Job, JobPayload, MintJobData};
use crate::models::mint::BatchOutcome;
use crate::models::progress::{
    interpolate, MintStage, OperationKind, ProgressDetails, MINTING_PROGRESS_END,
    MINTING_PROGRESS_START,
};
use crate::services::batch_executor::{ChunkObserver, ChunkProgress};
use crate::services::mint_service::MintService;
use crate::services::progress::{ProgressBroadcaster, ProgressReporter};
use crate::services::repository::Repository;

pub struct MintJobHandler {
    mint_service: Arc<MintService>,
    repository: Arc<dyn Repository>,
    broadcaster: ProgressBroadcaster,
    store: Arc<dyn JobStore>,
}

impl MintJobHandler {
    pub fn new(
        mint_service: Arc<MintService>,
        repository: Arc<dyn Repository>,
        broadcaster: ProgressBroadcaster,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            mint_service,
            repository,
            broadcaster,
            store,
        }
    }

    async fn run(
        &self,
        data: &MintJobData,
        reporter: &ProgressReporter<MintStage>,
    ) -> Result<Value, EngineError> {
        let request = &data.request;
        let token_id = &request.collateral_token_id;

        reporter
            .stage(
                MintStage::Validating,
                MintStage::Validating.checkpoint(),
                "Validating mint request...",
            )
            .await;
        if request.total_quantity <= 0 {
            return Err(EngineError::InvalidQuantity(request.total_quantity));
        }
        self.repository
            .find_collateral_by_token(token_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Collateral {}", token_id)))?;

        reporter
            .stage(
                MintStage::MintingTokens,
                MintStage::MintingTokens.checkpoint(),
                format!("Minting {} units concurrently...", request.total_quantity),
            )
            .await;
        let mut observer = MintObserver { reporter };
        let result = self.mint_service.mint(request, &mut observer).await?;

        if result.total_issued == 0 {
            return Err(EngineError::LedgerFatal(LedgerError::new(
                "MINT_FAILED",
                result.failure_messages().join("; "),
            )));
        }

        reporter
            .stage(
                MintStage::UpdatingRecords,
                MintStage::UpdatingRecords.checkpoint(),
                "Updating collateral records...",
            )
            .await;
        let mut errors = result.failure_messages();
        if let Err(e) = self
            .repository
            .record_minted_units(token_id, &result.all_issued_unit_ids)
            .await
        {
            error!(token_id = %token_id, error = %e, "Failed to record minted units");
            errors.push(format!("units minted but records not updated: {}", e));
        }

        let success = errors.is_empty();
        let payload = json!({
            "success": success,
            "token_id": token_id,
            "unit_ids": result.all_issued_unit_ids,
            "transaction_refs": result.transaction_refs,
            "batches": result.outcomes_by_batch,
            "total_issued": result.total_issued,
            "failed_batches": result.total_failed_batches,
            "error": (!success).then(|| errors.join("; ")),
        });

        reporter
            .stage(MintStage::Complete, MintStage::Complete.checkpoint(), result.summary())
            .await;
        reporter.complete(success, result.summary(), payload.clone()).await;

        info!(
            token_id = %token_id,
            success,
            total_issued = result.total_issued,
            "Mint job finished"
        );
        Ok(payload)
    }
}

#[async_trait]
impl JobHandler for MintJobHandler {
    /// Business failures come back as `Ok` with `success: false`; retrying
    /// would mint the same units again
    async fn handle(&self, job: &Job) -> Result<Value, EngineError> {
        let JobPayload::Mint(data) = &job.payload else {
            return Err(EngineError::Validation(format!("job {} is not a mint", job.id)));
        };

        let reporter = ProgressReporter::new(
            self.broadcaster.clone(),
            OperationKind::Mint,
            &data.owner_user_id,
            &job.id,
            &data.request.collateral_token_id,
        )
        .with_job_store(self.store.clone());

        match self.run(data, &reporter).await {
            Ok(payload) => Ok(payload),
            Err(e) => {
                warn!(job_id = %job.id, code = e.code(), error = %e, "Mint job aborted");
                reporter.fail(&e).await;
                Ok(json!({
                    "success": false,
                    "token_id": data.request.collateral_token_id,
                    "code": e.code(),
                    "error": e.to_string(),
                }))
            }
        }
    }
}

/// Maps executor chunks onto the 20 → 90 minting band
struct MintObserver<'a> {
    reporter: &'a ProgressReporter<MintStage>,
}

#[async_trait]
impl<'a> ChunkObserver for MintObserver<'a> {
    async fn chunk_started(&mut self, progress: ChunkProgress) {
        let percent = interpolate(
            MINTING_PROGRESS_START,
            MINTING_PROGRESS_END,
            progress.completed_batches,
            progress.total_batches,
        );
        self.reporter
            .stage_with_details(
                MintStage::MintingTokens,
                percent,
                format!(
                    "Minting batch group {} of {}",
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
        let percent = interpolate(
            MINTING_PROGRESS_START,
            MINTING_PROGRESS_END,
            progress.completed_batches,
            progress.total_batches,
        );
        let unit_ids: Vec<i64> = outcomes
            .iter()
            .filter(|o| o.success)
            .flat_map(|o| o.issued_unit_ids.iter().copied())
            .collect();

        self.reporter
            .stage_with_details(
                MintStage::MintingTokens,
                percent,
                format!(
                    "Minted batch group {} of {}",
                    progress.chunk_number, progress.total_chunks
                ),
                Some(ProgressDetails {
                    current_batch: Some(progress.completed_batches),
                    total_batches: Some(progress.total_batches),
                    processed_units: Some(progress.processed_units),
                    total_units: Some(progress.total_units),
                    unit_ids,
                }),
            )
            .await;
    }
}

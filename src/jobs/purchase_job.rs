//! Purchase queue handler

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::jobs::store::JobStore;
use crate::jobs::worker::JobHandler;
use crate::models::job::{Job, JobPayload};
use crate::models::progress::OperationKind;
use crate::services::progress::{ProgressBroadcaster, ProgressReporter};
use crate::services::purchase_pipeline::{job_result, PurchasePipeline};

pub struct PurchaseJobHandler {
    pipeline: Arc<PurchasePipeline>,
    broadcaster: ProgressBroadcaster,
    store: Arc<dyn JobStore>,
}

impl PurchaseJobHandler {
    pub fn new(
        pipeline: Arc<PurchasePipeline>,
        broadcaster: ProgressBroadcaster,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            pipeline,
            broadcaster,
            store,
        }
    }
}

#[async_trait]
impl JobHandler for PurchaseJobHandler {
    /// Always `Ok`: a failed purchase is a result, and re-running it could
    /// repeat ledger transfers
    async fn handle(&self, job: &Job) -> Result<Value, EngineError> {
        let JobPayload::Purchase(request) = &job.payload else {
            return Err(EngineError::Validation(format!(
                "job {} is not a purchase",
                job.id
            )));
        };

        let reporter = ProgressReporter::new(
            self.broadcaster.clone(),
            OperationKind::Purchase,
            &request.owner_user_id,
            &job.id,
            &request.collateral_token_id,
        )
        .with_job_store(self.store.clone());

        let result = self.pipeline.run(request, &reporter).await;
        Ok(job_result(&result))
    }
}

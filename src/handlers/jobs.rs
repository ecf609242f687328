//! Job submission and scheduler operator endpoints

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::jobs::scheduler::trigger_daily_check;
use crate::jobs::store::JobStoreError;
use crate::models::job::{EnqueueOptions, EnqueueOutcome, JobKind, JobPayload, MintJobData};
use crate::models::mint::MintRequest;
use crate::models::purchase::PurchaseRequest;
use crate::AppState;

type ApiResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

#[derive(Debug, Deserialize)]
pub struct EnqueuePurchaseBody {
    #[serde(flatten)]
    pub request: PurchaseRequest,
    /// Caller-assigned id; resubmitting the same id never buys twice
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueMintBody {
    pub owner_user_id: String,
    #[serde(flatten)]
    pub request: MintRequest,
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriggerDailyCheckBody {
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub job_id: Option<String>,
}

fn bad_request(code: &str, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "success": false,
            "code": code,
            "error": message.into(),
        })),
    )
}

fn store_error(e: JobStoreError) -> (StatusCode, Json<Value>) {
    let (status, code) = match &e {
        JobStoreError::NotFound(_) => (StatusCode::NOT_FOUND, "JOB_NOT_FOUND"),
        JobStoreError::NotCancelable(_) => (StatusCode::CONFLICT, "JOB_NOT_CANCELABLE"),
        JobStoreError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_JOB_STATE"),
        JobStoreError::Serialization(_) => {
            error!(error = %e, "Job store error");
            (StatusCode::INTERNAL_SERVER_ERROR, "JOB_STORE_ERROR")
        }
    };
    (
        status,
        Json(json!({
            "success": false,
            "code": code,
            "error": e.to_string(),
        })),
    )
}

fn queued(outcome: EnqueueOutcome) -> (StatusCode, Json<Value>) {
    let status = if outcome.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({
            "success": true,
            "data": {
                "job_id": outcome.job.id,
                "status": outcome.job.state,
                "created": outcome.created,
            },
        })),
    )
}

/// POST /api/purchases - Queue an investor purchase
pub async fn enqueue_purchase(
    State(state): State<AppState>,
    Json(body): Json<EnqueuePurchaseBody>,
) -> ApiResult {
    let request = body.request;
    if request.quantity <= 0 {
        return Err(bad_request(
            "INVALID_QUANTITY",
            format!("quantity must be positive, got {}", request.quantity),
        ));
    }
    if request.unit_id.is_some() && request.quantity != 1 {
        return Err(bad_request(
            "VALIDATION",
            "unit_id can only be combined with quantity 1",
        ));
    }

    info!(
        user_id = %request.owner_user_id,
        token_id = %request.collateral_token_id,
        quantity = request.quantity,
        "Queueing purchase"
    );

    let outcome = state
        .jobs
        .enqueue(
            JobPayload::Purchase(request),
            EnqueueOptions {
                id: body.job_id,
                ..Default::default()
            },
        )
        .await
        .map_err(store_error)?;
    Ok(queued(outcome))
}

/// POST /api/mints - Queue a batch mint
pub async fn enqueue_mint(
    State(state): State<AppState>,
    Json(body): Json<EnqueueMintBody>,
) -> ApiResult {
    if body.request.total_quantity <= 0 {
        return Err(bad_request(
            "INVALID_QUANTITY",
            format!(
                "total_quantity must be positive, got {}",
                body.request.total_quantity
            ),
        ));
    }

    info!(
        user_id = %body.owner_user_id,
        token_id = %body.request.collateral_token_id,
        quantity = body.request.total_quantity,
        "Queueing mint"
    );

    let outcome = state
        .jobs
        .enqueue(
            JobPayload::Mint(MintJobData {
                owner_user_id: body.owner_user_id,
                request: body.request,
            }),
            EnqueueOptions {
                id: body.job_id,
                ..Default::default()
            },
        )
        .await
        .map_err(store_error)?;
    Ok(queued(outcome))
}

/// POST /api/scheduler/trigger-daily-check
pub async fn trigger_daily_check_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult {
    // An empty body means a plain, non-forced trigger
    let body: TriggerDailyCheckBody = if body.iter().all(u8::is_ascii_whitespace) {
        TriggerDailyCheckBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| bad_request("INVALID_BODY", format!("Invalid request body: {}", e)))?
    };

    let outcome = trigger_daily_check(state.jobs.as_ref(), body.force, body.job_id)
        .await
        .map_err(store_error)?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": "Daily token check triggered successfully",
            "data": {
                "job_id": outcome.job.id,
                "status": outcome.job.state,
                "created": outcome.created,
                "timestamp": Utc::now(),
            },
        })),
    ))
}

/// GET /api/scheduler/status - Per-queue job counts
pub async fn scheduler_status(State(state): State<AppState>) -> ApiResult {
    let mut queues = serde_json::Map::new();
    for kind in JobKind::ALL {
        let counts = state.jobs.counts(kind).await.map_err(store_error)?;
        queues.insert(kind.as_str().to_string(), json!(counts));
    }

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "data": {
                "queues": queues,
                "timestamp": Utc::now(),
            },
        })),
    ))
}

/// GET /api/scheduler/job/{id}
pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match state.jobs.get(&id).await.map_err(store_error)? {
        Some(job) => Ok((
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": job,
            })),
        )),
        None => Err(store_error(JobStoreError::NotFound(id))),
    }
}

/// DELETE /api/scheduler/job/{id} - Cancel a job that has not started
pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let job = state.jobs.remove(&id).await.map_err(|e| {
        warn!(job_id = %id, error = %e, "Job cancellation rejected");
        store_error(e)
    })?;

    info!(job_id = %id, "Job cancelled");
    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "message": format!("Job {} cancelled", job.id),
        })),
    ))
}

/// POST /api/scheduler/cleanup-stalled
pub async fn cleanup_stalled(State(state): State<AppState>) -> ApiResult {
    let report = state
        .jobs
        .cleanup_stalled(state.stalled_after)
        .await
        .map_err(store_error)?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "data": report,
        })),
    ))
}

/// POST /api/scheduler/process-job/{id} - Run a delayed or failed job now
pub async fn process_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let outcome = state.jobs.process_now(&id).await.map_err(store_error)?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "data": {
                "job_id": id,
                "outcome": outcome,
            },
        })),
    ))
}

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use collateral_backend::jobs::daily_check::DailyCheckHandler;
use collateral_backend::jobs::purchase_job::PurchaseJobHandler;
use collateral_backend::jobs::scheduler::trigger_daily_check;
use collateral_backend::jobs::store::{JobStore, MemoryJobStore};
use collateral_backend::jobs::worker::WorkerPool;
use collateral_backend::models::job::{
    DailyCheckJobData, EnqueueOptions, JobKind, JobPayload, JobState,
};
use collateral_backend::models::purchase::PurchaseRequest;
use collateral_backend::services::progress::ProgressBroadcaster;
use collateral_backend::services::purchase_pipeline::PurchasePipeline;

use crate::common::*;

fn purchase_pool(
    ledger: Arc<FakeLedger>,
    repository: Arc<MemoryRepository>,
    store: Arc<MemoryJobStore>,
    broadcaster: ProgressBroadcaster,
) -> WorkerPool {
    let pipeline = Arc::new(PurchasePipeline::new(ledger, repository, engine_config()));
    let handler = PurchaseJobHandler::new(pipeline, broadcaster, store.clone());
    WorkerPool::new(store, JobKind::Purchase, 1, Arc::new(handler))
}

fn purchase(quantity: i64) -> JobPayload {
    JobPayload::Purchase(PurchaseRequest {
        owner_user_id: INVESTOR_USER.to_string(),
        collateral_token_id: COLLATERAL_TOKEN.to_string(),
        quantity,
        unit_id: None,
    })
}

#[tokio::test]
async fn test_duplicate_purchase_id_runs_once() {
    let (ledger, repository) = seeded();
    let ledger = Arc::new(ledger);
    let store = Arc::new(MemoryJobStore::new());
    let pool = purchase_pool(
        ledger.clone(),
        Arc::new(repository),
        store.clone(),
        ProgressBroadcaster::new(),
    );

    let options = EnqueueOptions {
        id: Some("order-77".to_string()),
        ..Default::default()
    };
    assert!(store.enqueue(purchase(2), options.clone()).await.unwrap().created);
    assert!(pool.run_once().await.unwrap());

    // resubmitted after completion
    let again = store.enqueue(purchase(2), options).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.job.state, JobState::Completed);
    assert!(!pool.run_once().await.unwrap());

    assert_eq!(ledger.count("transfer_fungible"), 1);
    assert_eq!(ledger.units_of(COLLATERAL_TOKEN, INVESTOR_ACCOUNT), vec![1, 2]);
}

#[tokio::test]
async fn test_failed_purchase_completes_without_retry() {
    let (ledger, repository) = seeded();
    ledger.set_balance(INVESTOR_ACCOUNT, PAYMENT_TOKEN, 0);
    let store = Arc::new(MemoryJobStore::new());
    let broadcaster = ProgressBroadcaster::new();
    let mut rx = broadcaster.subscribe();
    let pool = purchase_pool(
        Arc::new(ledger),
        Arc::new(repository),
        store.clone(),
        broadcaster,
    );

    let job = store
        .enqueue(purchase(1), EnqueueOptions::default())
        .await
        .unwrap()
        .job;
    pool.run_once().await.unwrap();

    let job = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 1);
    let result = job.result.unwrap();
    assert_eq!(result["success"], false);
    assert_eq!(result["failed_stage"], "checking_balance");
    assert!(job.failure_reason.is_none());

    let events = drain(&mut rx);
    assert!(events.iter().all(|e| e.payload["job_id"] == job.id.as_str()));
    assert_eq!(events.last().unwrap().event, "token-purchase-error");
}

#[tokio::test]
async fn test_cancelled_job_never_reaches_the_ledger() {
    let (ledger, repository) = seeded();
    let ledger = Arc::new(ledger);
    let store = Arc::new(MemoryJobStore::new());
    let pool = purchase_pool(
        ledger.clone(),
        Arc::new(repository),
        store.clone(),
        ProgressBroadcaster::new(),
    );

    let job = store
        .enqueue(purchase(1), EnqueueOptions::default())
        .await
        .unwrap()
        .job;
    store.remove(&job.id).await.unwrap();

    assert!(!pool.run_once().await.unwrap());
    assert_eq!(ledger.total_calls(), 0);
    assert!(store.get(&job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_daily_check_finds_collateral_expiring_today() {
    let (_, repository) = seeded();
    repository.add_collateral(jewelry_collateral("0.0.6006", Some(Utc::now())));
    repository.add_collateral(jewelry_collateral(
        "0.0.6007",
        Some(Utc::now() + Duration::days(3)),
    ));
    let store = Arc::new(MemoryJobStore::new());
    let pool = WorkerPool::new(
        store.clone(),
        JobKind::DailyCheck,
        1,
        Arc::new(DailyCheckHandler::new(Arc::new(repository))),
    );

    let job = store
        .enqueue(
            JobPayload::DailyCheck(DailyCheckJobData::default()),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
        .job;
    pool.run_once().await.unwrap();

    let result = store.get(&job.id).await.unwrap().unwrap().result.unwrap();
    assert_eq!(result["message"], "Daily token check completed");
    assert_eq!(result["tokens_found"], 1);
    assert_eq!(result["token_ids"][0], "0.0.6006");
    assert_eq!(result["is_manual"], false);
}

#[tokio::test]
async fn test_forced_manual_check_with_nothing_expiring() {
    let (_, repository) = seeded();
    let store = Arc::new(MemoryJobStore::new());
    let pool = WorkerPool::new(
        store.clone(),
        JobKind::DailyCheck,
        1,
        Arc::new(DailyCheckHandler::new(Arc::new(repository))),
    );

    let outcome = trigger_daily_check(store.as_ref(), true, None).await.unwrap();
    pool.run_once().await.unwrap();

    let result = store.get(&outcome.job.id).await.unwrap().unwrap().result.unwrap();
    assert_eq!(
        result["message"],
        "Force mode enabled but no tokens expiring today"
    );
    assert_eq!(result["tokens_found"], 0);
    assert_eq!(result["is_manual"], true);
    assert_eq!(result["force"], true);
}

#[tokio::test]
async fn test_daily_check_repository_error_is_retried() {
    let (_, repository) = seeded();
    repository.fail_reads();
    let store = Arc::new(MemoryJobStore::new());
    let pool = WorkerPool::new(
        store.clone(),
        JobKind::DailyCheck,
        1,
        Arc::new(DailyCheckHandler::new(Arc::new(repository))),
    );

    let job = store
        .enqueue(
            JobPayload::DailyCheck(DailyCheckJobData::default()),
            EnqueueOptions::default(),
        )
        .await
        .unwrap()
        .job;

    // zero backoff for this queue: straight back to waiting, then failed
    pool.run_once().await.unwrap();
    assert_eq!(
        store.get(&job.id).await.unwrap().unwrap().state,
        JobState::Waiting
    );
    pool.run_once().await.unwrap();
    let job = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 2);
}

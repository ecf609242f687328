use std::collections::HashMap;
use std::sync::Arc;

use collateral_backend::config::{EngineConfig, QueueConfig, ServerConfig};
use collateral_backend::handlers;
use collateral_backend::jobs::daily_check::DailyCheckHandler;
use collateral_backend::jobs::mint_job::MintJobHandler;
use collateral_backend::jobs::purchase_job::PurchaseJobHandler;
use collateral_backend::jobs::scheduler::{spawn_daily_scheduler, spawn_stalled_sweep};
use collateral_backend::jobs::store::{JobStore, MemoryJobStore};
use collateral_backend::jobs::worker::{JobHandler, WorkerPool};
use collateral_backend::models::job::JobKind;
use collateral_backend::services::ledger_client::{GatewayLedgerClient, LedgerClient};
use collateral_backend::services::mint_service::MintService;
use collateral_backend::services::progress::ProgressBroadcaster;
use collateral_backend::services::purchase_pipeline::PurchasePipeline;
use collateral_backend::services::repository::{Repository, SeaOrmRepository};
use collateral_backend::AppState;
use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,collateral_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let server_config = ServerConfig::from_env().expect("Invalid server configuration");
    let engine_config = EngineConfig::from_env().expect("Invalid engine configuration");

    tracing::info!("Connecting to database...");
    let db = Database::connect(&server_config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running migrations...");
    migration::Migrator::up(&db, None)
        .await
        .expect("Failed to run migrations");

    let repository: Arc<dyn Repository> = Arc::new(SeaOrmRepository::new(db));
    let ledger: Arc<dyn LedgerClient> = Arc::new(
        GatewayLedgerClient::new(&server_config.ledger_gateway_url)
            .expect("Failed to build ledger gateway client"),
    );

    let queues: HashMap<JobKind, QueueConfig> = JobKind::ALL
        .into_iter()
        .map(|kind| (kind, QueueConfig::from_env(kind)))
        .collect();
    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::with_queues(queues.clone()));
    let broadcaster = ProgressBroadcaster::new();

    let mint_service = Arc::new(MintService::new(ledger.clone(), &engine_config));
    let pipeline = Arc::new(PurchasePipeline::new(
        ledger.clone(),
        repository.clone(),
        engine_config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    for kind in JobKind::ALL {
        let handler: Arc<dyn JobHandler> = match kind {
            JobKind::Purchase => Arc::new(PurchaseJobHandler::new(
                pipeline.clone(),
                broadcaster.clone(),
                store.clone(),
            )),
            JobKind::Mint => Arc::new(MintJobHandler::new(
                mint_service.clone(),
                repository.clone(),
                broadcaster.clone(),
                store.clone(),
            )),
            JobKind::DailyCheck => Arc::new(DailyCheckHandler::new(repository.clone())),
        };
        let concurrency = queues
            .get(&kind)
            .map(|q| q.concurrency)
            .unwrap_or(1);
        tasks.extend(
            WorkerPool::new(store.clone(), kind, concurrency, handler)
                .with_heartbeat(server_config.stalled_after / 3)
                .spawn(shutdown_rx.clone()),
        );
    }

    tasks.push(spawn_daily_scheduler(
        store.clone(),
        server_config.daily_check_hour_utc,
        shutdown_rx.clone(),
    ));
    tasks.push(spawn_stalled_sweep(
        store.clone(),
        server_config.stalled_after,
        shutdown_rx.clone(),
    ));

    let state = AppState {
        jobs: store,
        broadcaster,
        stalled_after: server_config.stalled_after,
    };
    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&server_config.bind_address)
        .await
        .expect("Failed to bind listener");

    tracing::info!("Server listening on {}", server_config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");

    // Workers finish the job they are running before exiting
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("Shutdown complete");
}

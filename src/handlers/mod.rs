pub mod jobs;
pub mod progress_ws;

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/purchases", post(jobs::enqueue_purchase))
        .route("/api/mints", post(jobs::enqueue_mint))
        .route(
            "/api/scheduler/trigger-daily-check",
            post(jobs::trigger_daily_check_handler),
        )
        .route("/api/scheduler/status", get(jobs::scheduler_status))
        .route(
            "/api/scheduler/job/{id}",
            get(jobs::get_job).delete(jobs::cancel_job),
        )
        .route("/api/scheduler/cleanup-stalled", post(jobs::cleanup_stalled))
        .route("/api/scheduler/process-job/{id}", post(jobs::process_job))
        .route("/api/progress/ws", get(progress_ws::progress_websocket))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "Collateral backend is running"
}

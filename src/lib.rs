// src/lib.rs

use std::sync::Arc;
use std::time::Duration;

use jobs::store::JobStore;
use services::progress::ProgressBroadcaster;

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobStore>,
    pub broadcaster: ProgressBroadcaster,
    /// Heartbeat age after which an active job counts as stalled
    pub stalled_after: Duration,
}

pub mod config;
pub mod error;

pub mod entities {
    pub mod collateral_records;
    pub mod ledger_accounts;
    pub mod payment_tokens;
}

pub mod services {
    pub mod batch_executor;
    pub mod batch_planner;
    pub mod ledger_client;
    pub mod mint_service;
    pub mod progress;
    pub mod purchase_pipeline;
    pub mod repository;
    pub mod retry_policy;
}

pub mod models;
pub mod jobs;
pub mod handlers;

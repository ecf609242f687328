//! Worker pool pulling jobs of one kind from the job store

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::jobs::store::{JobStore, JobStoreError};
use crate::models::job::{Job, JobKind};

const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(1);
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// Runs one job; `Err` asks the store to retry (or fail) the job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value, EngineError>;
}

#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    kind: JobKind,
    concurrency: usize,
    handler: Arc<dyn JobHandler>,
    idle_poll: Duration,
    heartbeat_every: Duration,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        kind: JobKind,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            store,
            kind,
            concurrency: concurrency.max(1),
            handler,
            idle_poll: DEFAULT_IDLE_POLL,
            heartbeat_every: DEFAULT_HEARTBEAT,
        }
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// How often a running job's heartbeat is refreshed; keep it well under
    /// the stalled-job threshold
    pub fn with_heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat_every = every.max(MIN_HEARTBEAT);
        self
    }

    /// Spawn one task per concurrency slot. Slots finish their current job
    /// before honouring shutdown.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(kind = %self.kind, concurrency = self.concurrency, "Starting job workers");

        (0..self.concurrency)
            .map(|slot| {
                let pool = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }

                        match pool.run_once().await {
                            Ok(true) => continue,
                            Ok(false) => {}
                            Err(e) => {
                                error!(kind = %pool.kind, slot, error = %e, "Job store error");
                            }
                        }

                        tokio::select! {
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = pool.store.wait_for_work(pool.kind, pool.idle_poll) => {}
                        }
                    }
                    info!(kind = %pool.kind, slot, "Job worker stopped");
                })
            })
            .collect()
    }

    /// Claim and run at most one job; true when a job was claimed
    pub async fn run_once(&self) -> Result<bool, JobStoreError> {
        let Some(job) = self.store.claim(self.kind).await? else {
            return Ok(false);
        };

        match self.store.begin(&job.id).await {
            Ok(()) => {}
            Err(JobStoreError::NotFound(_)) => {
                info!(job_id = %job.id, "Job cancelled before it started");
                return Ok(true);
            }
            Err(e) => return Err(e),
        }

        info!(job_id = %job.id, kind = %self.kind, attempt = job.attempts_made, "Processing job");

        let handler = AssertUnwindSafe(self.handler.handle(&job)).catch_unwind();
        tokio::pin!(handler);

        let mut beat = tokio::time::interval(self.heartbeat_every);
        beat.tick().await;
        let outcome = loop {
            tokio::select! {
                outcome = &mut handler => break outcome,
                _ = beat.tick() => {
                    if let Err(e) = self.store.heartbeat(&job.id).await {
                        debug!(job_id = %job.id, error = %e, "Heartbeat not recorded");
                    }
                }
            }
        };

        match outcome {
            Ok(Ok(result)) => {
                if let Err(e) = self.store.complete(&job.id, result.clone()).await {
                    error!(
                        job_id = %job.id,
                        error = %e,
                        result = %result,
                        "Job finished but its result could not be stored"
                    );
                    return Err(e);
                }
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, code = e.code(), error = %e, "Job handler failed");
                self.record_failure(&job.id, &e.to_string()).await?;
            }
            Err(_) => {
                error!(job_id = %job.id, "Job handler panicked");
                self.record_failure(&job.id, "handler panicked").await?;
            }
        }

        Ok(true)
    }

    async fn record_failure(&self, id: &str, reason: &str) -> Result<(), JobStoreError> {
        if let Err(e) = self.store.fail(id, reason).await {
            error!(job_id = %id, error = %e, reason = %reason, "Job failure could not be stored");
            return Err(e);
        }
        Ok(())
    }
}

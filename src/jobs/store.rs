//! Durable job queue seam and its in-process implementation
//!
//! One queue per `JobKind`. Jobs move waiting → active → completed/failed,
//! with `delayed` for retry backoff and scheduled runs. A caller-assigned id
//! that already exists never creates a second job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::EngineError;
use crate::models::job::{
    CleanupReport, DEFAULT_PRIORITY, EnqueueOptions, EnqueueOutcome, Job, JobKind, JobPayload,
    JobState, ProcessOutcome, QueueCounts,
};

/// Failure reason set by the stalled sweep
pub const STALLED_REASON: &str = "stalled";

#[derive(Debug, Clone, Error)]
pub enum JobStoreError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {0} cannot be cancelled in its current state")]
    NotCancelable(String),

    #[error("Job {id} is {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: JobState,
        expected: JobState,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<JobStoreError> for EngineError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => EngineError::NotFound(format!("Job {}", id)),
            JobStoreError::NotCancelable(id) => EngineError::NotCancelable(id),
            other => EngineError::Repository(other.to_string()),
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Add a job; an existing id returns that job with `created == false`
    async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, JobStoreError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError>;

    /// Jobs in `state`, in the order they would be claimed
    async fn list_by_state(
        &self,
        kind: Option<JobKind>,
        state: JobState,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn counts(&self, kind: JobKind) -> Result<QueueCounts, JobStoreError>;

    /// Cancel a job that has not started running
    async fn remove(&self, id: &str) -> Result<Job, JobStoreError>;

    /// Take the next due job of `kind` (lowest priority value first, then FIFO)
    async fn claim(&self, kind: JobKind) -> Result<Option<Job>, JobStoreError>;

    /// Mark a claimed job as running its handler; from here on it is not
    /// cancelable and a stall fails it instead of re-queueing it
    async fn begin(&self, id: &str) -> Result<(), JobStoreError>;

    /// Record progress; also refreshes the job's heartbeat
    async fn update_progress(&self, id: &str, progress: u8) -> Result<(), JobStoreError>;

    /// Refresh the heartbeat of an active job whose worker is still running it
    async fn heartbeat(&self, id: &str) -> Result<(), JobStoreError>;

    /// Record the handler's result. A job the stalled sweep failed while its
    /// worker was still running is completed as well.
    async fn complete(&self, id: &str, result: Value) -> Result<Job, JobStoreError>;

    /// Record a handler error; the job is re-queued with backoff while
    /// attempts remain, otherwise it is failed
    async fn fail(&self, id: &str, reason: &str) -> Result<Job, JobStoreError>;

    /// Operator request to run a job now
    async fn process_now(&self, id: &str) -> Result<ProcessOutcome, JobStoreError>;

    /// Handle active jobs whose heartbeat is older than `older_than`
    async fn cleanup_stalled(&self, older_than: Duration) -> Result<CleanupReport, JobStoreError>;

    /// Resolve when work for `kind` may be available, or after `timeout`
    async fn wait_for_work(&self, kind: JobKind, timeout: Duration);
}

struct Entry {
    job: Job,
    seq: u64,
    /// When a delayed job becomes due
    due_at: Option<Instant>,
    last_beat: Instant,
    finished_seq: u64,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Entry>,
    /// Finished jobs dropped by retention, without their result. Their ids
    /// stay taken so a resubmission is still a no-op.
    retired: HashMap<String, Job>,
    seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut Entry, JobStoreError> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))
    }

    fn promote_due(&mut self, kind: JobKind, now: Instant) {
        for entry in self.jobs.values_mut() {
            if entry.job.kind == kind
                && entry.job.state == JobState::Delayed
                && entry.due_at.is_none_or(|due| due <= now)
            {
                entry.job.state = JobState::Waiting;
                entry.job.run_at = None;
                entry.due_at = None;
            }
        }
    }

    /// Drop the oldest finished jobs beyond the retention limit
    fn trim(&mut self, kind: JobKind, state: JobState, keep: usize) {
        let mut finished: Vec<(u64, String)> = self
            .jobs
            .iter()
            .filter(|(_, e)| e.job.kind == kind && e.job.state == state)
            .map(|(id, e)| (e.finished_seq, id.clone()))
            .collect();

        if finished.len() <= keep {
            return;
        }

        finished.sort();
        let excess = finished.len() - keep;
        for (_, id) in finished.into_iter().take(excess) {
            if let Some(mut entry) = self.jobs.remove(&id) {
                entry.job.result = None;
                self.retired.insert(id, entry.job);
            }
        }
    }
}

/// In-process job store
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    queues: HashMap<JobKind, QueueConfig>,
    notifiers: HashMap<JobKind, Arc<Notify>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        let queues = JobKind::ALL
            .iter()
            .map(|kind| (*kind, QueueConfig::defaults_for(*kind)))
            .collect();
        Self::with_queues(queues)
    }

    pub fn with_queues(mut queues: HashMap<JobKind, QueueConfig>) -> Self {
        for kind in JobKind::ALL {
            queues
                .entry(kind)
                .or_insert_with(|| QueueConfig::defaults_for(kind));
        }
        let notifiers = JobKind::ALL
            .iter()
            .map(|kind| (*kind, Arc::new(Notify::new())))
            .collect();

        Self {
            inner: Mutex::new(Inner::default()),
            queues,
            notifiers,
        }
    }

    pub fn queue_config(&self, kind: JobKind) -> &QueueConfig {
        // every kind is filled in by the constructor
        &self.queues[&kind]
    }

    fn notify(&self, kind: JobKind) {
        if let Some(notify) = self.notifiers.get(&kind) {
            notify.notify_waiters();
            notify.notify_one();
        }
    }

    fn sorted(mut jobs: Vec<(u32, u64, Job)>) -> Vec<Job> {
        jobs.sort_by_key(|(priority, seq, _)| (*priority, *seq));
        jobs.into_iter().map(|(_, _, job)| job).collect()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36500))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, JobStoreError> {
        let kind = payload.kind();
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let outcome = {
            let mut inner = self.inner.lock();
            let existing = inner
                .jobs
                .get(&id)
                .map(|e| &e.job)
                .or_else(|| inner.retired.get(&id));
            if let Some(existing) = existing {
                debug!(job_id = %id, state = %existing.state, "Job id already used, not enqueuing");
                return Ok(EnqueueOutcome {
                    job: existing.clone(),
                    created: false,
                });
            }

            let now = Utc::now();
            let delay = options.delay.filter(|d| !d.is_zero());
            let job = Job {
                id: id.clone(),
                kind,
                payload,
                priority: options.priority.unwrap_or(DEFAULT_PRIORITY),
                state: if delay.is_some() {
                    JobState::Delayed
                } else {
                    JobState::Waiting
                },
                attempts_made: 0,
                max_attempts: self.queue_config(kind).attempts.max(1),
                progress: 0,
                result: None,
                failure_reason: None,
                started: false,
                created_at: now,
                run_at: delay.map(|d| now + to_chrono(d)),
                processed_at: None,
                heartbeat_at: None,
                finished_at: None,
            };

            let seq = inner.next_seq();
            inner.jobs.insert(
                id.clone(),
                Entry {
                    job: job.clone(),
                    seq,
                    due_at: delay.map(|d| Instant::now() + d),
                    last_beat: Instant::now(),
                    finished_seq: 0,
                },
            );
            EnqueueOutcome { job, created: true }
        };

        info!(job_id = %id, kind = %kind, priority = outcome.job.priority, "Job enqueued");
        self.notify(kind);
        Ok(outcome)
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        Ok(self.inner.lock().jobs.get(id).map(|e| e.job.clone()))
    }

    async fn list_by_state(
        &self,
        kind: Option<JobKind>,
        state: JobState,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.inner.lock();
        let jobs = inner
            .jobs
            .values()
            .filter(|e| e.job.state == state && kind.is_none_or(|k| e.job.kind == k))
            .map(|e| (e.job.priority, e.seq, e.job.clone()))
            .collect();
        Ok(Self::sorted(jobs))
    }

    async fn counts(&self, kind: JobKind) -> Result<QueueCounts, JobStoreError> {
        let inner = self.inner.lock();
        let mut counts = QueueCounts::default();
        for entry in inner.jobs.values().filter(|e| e.job.kind == kind) {
            match entry.job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Delayed => counts.delayed += 1,
            }
        }
        Ok(counts)
    }

    async fn remove(&self, id: &str) -> Result<Job, JobStoreError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(id)?;

        let cancelable = match entry.job.state {
            JobState::Waiting | JobState::Delayed => true,
            JobState::Active => !entry.job.started,
            JobState::Completed | JobState::Failed => false,
        };
        if !cancelable {
            return Err(JobStoreError::NotCancelable(id.to_string()));
        }

        let removed = inner
            .jobs
            .remove(id)
            .map(|e| e.job)
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        info!(job_id = %id, state = %removed.state, "Job removed");
        Ok(removed)
    }

    async fn claim(&self, kind: JobKind) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.promote_due(kind, now);

        let next = inner
            .jobs
            .iter()
            .filter(|(_, e)| e.job.kind == kind && e.job.state == JobState::Waiting)
            .min_by_key(|(_, e)| (e.job.priority, e.seq))
            .map(|(id, _)| id.clone());

        let Some(id) = next else {
            return Ok(None);
        };

        let entry = inner.entry_mut(&id)?;
        let wall = Utc::now();
        entry.job.state = JobState::Active;
        entry.job.attempts_made += 1;
        entry.job.started = false;
        entry.job.processed_at = Some(wall);
        entry.job.heartbeat_at = Some(wall);
        entry.last_beat = now;

        debug!(job_id = %id, kind = %kind, attempt = entry.job.attempts_made, "Job claimed");
        Ok(Some(entry.job.clone()))
    }

    async fn begin(&self, id: &str) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(id)?;
        if entry.job.state != JobState::Active {
            return Err(JobStoreError::InvalidState {
                id: id.to_string(),
                state: entry.job.state,
                expected: JobState::Active,
            });
        }
        entry.job.started = true;
        entry.job.heartbeat_at = Some(Utc::now());
        entry.last_beat = Instant::now();
        Ok(())
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(id)?;
        entry.job.progress = entry.job.progress.max(progress.min(100));
        entry.job.heartbeat_at = Some(Utc::now());
        entry.last_beat = Instant::now();
        Ok(())
    }

    async fn heartbeat(&self, id: &str) -> Result<(), JobStoreError> {
        let mut inner = self.inner.lock();
        let entry = inner.entry_mut(id)?;
        if entry.job.state != JobState::Active {
            return Err(JobStoreError::InvalidState {
                id: id.to_string(),
                state: entry.job.state,
                expected: JobState::Active,
            });
        }
        entry.job.heartbeat_at = Some(Utc::now());
        entry.last_beat = Instant::now();
        Ok(())
    }

    async fn complete(&self, id: &str, result: Value) -> Result<Job, JobStoreError> {
        let mut inner = self.inner.lock();
        let finished_seq = inner.next_seq();
        let entry = inner.entry_mut(id)?;
        let swept = entry.job.state == JobState::Failed
            && entry.job.failure_reason.as_deref() == Some(STALLED_REASON);
        if entry.job.state != JobState::Active && !swept {
            return Err(JobStoreError::InvalidState {
                id: id.to_string(),
                state: entry.job.state,
                expected: JobState::Active,
            });
        }
        if swept {
            warn!(job_id = %id, "Job finished after the stalled sweep failed it, recording its result");
        }

        entry.job.state = JobState::Completed;
        entry.job.progress = 100;
        entry.job.result = Some(result);
        entry.job.failure_reason = None;
        entry.job.finished_at = Some(Utc::now());
        entry.finished_seq = finished_seq;
        let job = entry.job.clone();

        let keep = self.queue_config(job.kind).keep_completed;
        inner.trim(job.kind, JobState::Completed, keep);

        info!(job_id = %id, kind = %job.kind, attempts = job.attempts_made, "Job completed");
        Ok(job)
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<Job, JobStoreError> {
        let mut inner = self.inner.lock();
        let finished_seq = inner.next_seq();
        let entry = inner.entry_mut(id)?;
        if entry.job.state != JobState::Active {
            return Err(JobStoreError::InvalidState {
                id: id.to_string(),
                state: entry.job.state,
                expected: JobState::Active,
            });
        }

        let kind = entry.job.kind;
        let config = self.queue_config(kind);
        entry.job.failure_reason = Some(reason.to_string());
        entry.job.started = false;

        if entry.job.attempts_made < entry.job.max_attempts {
            let exponent = entry.job.attempts_made.saturating_sub(1).min(16);
            let backoff = config.backoff_base.saturating_mul(1u32 << exponent);

            if backoff.is_zero() {
                entry.job.state = JobState::Waiting;
                entry.due_at = None;
                entry.job.run_at = None;
            } else {
                entry.job.state = JobState::Delayed;
                entry.due_at = Some(Instant::now() + backoff);
                entry.job.run_at = Some(Utc::now() + to_chrono(backoff));
            }

            let job = entry.job.clone();
            drop(inner);
            warn!(
                job_id = %id,
                attempt = job.attempts_made,
                max_attempts = job.max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                reason = %reason,
                "Job failed, scheduling retry"
            );
            self.notify(kind);
            return Ok(job);
        }

        entry.job.state = JobState::Failed;
        entry.job.finished_at = Some(Utc::now());
        entry.finished_seq = finished_seq;
        let job = entry.job.clone();
        inner.trim(kind, JobState::Failed, config.keep_failed);

        warn!(job_id = %id, attempts = job.attempts_made, reason = %reason, "Job failed permanently");
        Ok(job)
    }

    async fn process_now(&self, id: &str) -> Result<ProcessOutcome, JobStoreError> {
        let (outcome, kind) = {
            let mut inner = self.inner.lock();
            let entry = inner.entry_mut(id)?;
            let outcome = match entry.job.state {
                JobState::Completed => ProcessOutcome::AlreadyCompleted,
                JobState::Active => ProcessOutcome::AlreadyActive,
                JobState::Waiting => ProcessOutcome::AlreadyWaiting,
                JobState::Delayed => {
                    entry.job.state = JobState::Waiting;
                    entry.job.run_at = None;
                    entry.due_at = None;
                    ProcessOutcome::Promoted
                }
                JobState::Failed => {
                    entry.job.state = JobState::Waiting;
                    entry.job.attempts_made = 0;
                    entry.job.progress = 0;
                    entry.job.result = None;
                    entry.job.failure_reason = None;
                    entry.job.started = false;
                    entry.job.finished_at = None;
                    ProcessOutcome::Retried
                }
            };
            (outcome, entry.job.kind)
        };

        info!(job_id = %id, outcome = ?outcome, "Manual job processing requested");
        if matches!(outcome, ProcessOutcome::Promoted | ProcessOutcome::Retried) {
            self.notify(kind);
        }
        Ok(outcome)
    }

    async fn cleanup_stalled(&self, older_than: Duration) -> Result<CleanupReport, JobStoreError> {
        let mut report = CleanupReport::default();
        let mut requeued_kinds = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let mut finished = Vec::new();

            for (id, entry) in inner.jobs.iter_mut() {
                if entry.job.state != JobState::Active
                    || now.saturating_duration_since(entry.last_beat) < older_than
                {
                    continue;
                }

                if entry.job.started {
                    // ledger work may be half done; never replay it
                    entry.job.state = JobState::Failed;
                    entry.job.failure_reason = Some(STALLED_REASON.to_string());
                    entry.job.finished_at = Some(Utc::now());
                    finished.push(id.clone());
                    report.failed.push(id.clone());
                } else {
                    entry.job.state = JobState::Waiting;
                    entry.job.attempts_made = entry.job.attempts_made.saturating_sub(1);
                    requeued_kinds.push(entry.job.kind);
                    report.requeued.push(id.clone());
                }
            }

            for id in finished {
                let seq = inner.next_seq();
                if let Some(entry) = inner.jobs.get_mut(&id) {
                    entry.finished_seq = seq;
                }
            }
        }

        for kind in requeued_kinds {
            self.notify(kind);
        }
        info!(
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "Stalled job cleanup finished"
        );
        Ok(report)
    }

    async fn wait_for_work(&self, kind: JobKind, timeout: Duration) {
        if let Some(notify) = self.notifiers.get(&kind) {
            let _ = tokio::time::timeout(timeout, notify.notified()).await;
        } else {
            tokio::time::sleep(timeout).await;
        }
    }
}

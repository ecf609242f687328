//! Durable job records and the payloads each job kind carries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::mint::MintRequest;
use crate::models::purchase::PurchaseRequest;

/// Job kinds, one queue each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Mint,
    Purchase,
    DailyCheck,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Mint, JobKind::Purchase, JobKind::DailyCheck];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Mint => "mint",
            JobKind::Purchase => "purchase",
            JobKind::DailyCheck => "daily_check",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "mint" => Ok(JobKind::Mint),
            "purchase" => Ok(JobKind::Purchase),
            "daily_check" | "dailycheck" => Ok(JobKind::DailyCheck),
            _ => Err(format!("Unknown job kind: {}", s)),
        }
    }
}

/// Job lifecycle
///
/// waiting → active → completed
///             ↘ delayed (retry backoff) → waiting
///             ↘ failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Delayed => write!(f, "delayed"),
            JobState::Active => write!(f, "active"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// Mint job: issue units and report progress to the requesting user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintJobData {
    pub owner_user_id: String,
    pub request: MintRequest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCheckJobData {
    #[serde(default)]
    pub manual: bool,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    Mint(MintJobData),
    Purchase(PurchaseRequest),
    DailyCheck(DailyCheckJobData),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Mint(_) => JobKind::Mint,
            JobPayload::Purchase(_) => JobKind::Purchase,
            JobPayload::DailyCheck(_) => JobKind::DailyCheck,
        }
    }

    /// User whose progress room receives this job's events
    pub fn owner_user_id(&self) -> Option<&str> {
        match self {
            JobPayload::Mint(data) => Some(&data.owner_user_id),
            JobPayload::Purchase(request) => Some(&request.owner_user_id),
            JobPayload::DailyCheck(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
    /// Lower runs first
    pub priority: u32,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Set once a worker has started the handler; from then on the job
    /// may have ledger side effects and can no longer be cancelled
    pub started: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Caller-controlled enqueue options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Caller-assigned id; re-using an id never runs the job twice
    pub id: Option<String>,
    pub priority: Option<u32>,
    pub delay: Option<std::time::Duration>,
}

pub const DEFAULT_PRIORITY: u32 = 10;
pub const MANUAL_PRIORITY: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnqueueOutcome {
    pub job: Job,
    /// False when a job with the same id already existed
    pub created: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

/// Result of an operator asking for a job to be processed now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessOutcome {
    AlreadyCompleted,
    AlreadyActive,
    AlreadyWaiting,
    Promoted,
    Retried,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Stalled before their handler started; back in the queue
    pub requeued: Vec<String>,
    /// Stalled mid-handler; failed rather than replayed
    pub failed: Vec<String>,
}

//! Per-user progress broadcasting
//!
//! `ProgressBroadcaster` fans events out to every websocket; each socket keeps
//! only the events of the user it subscribed for. Delivery is fire-and-forget:
//! the job record is the durable outcome, events are a UX convenience.
//!
//! `ProgressReporter` wraps the broadcaster for one operation and enforces the
//! event contract: percentages never decrease and exactly one terminal event
//! (complete or error) is sent.

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::jobs::store::JobStore;
use crate::models::progress::{
    CompletionEvent, ErrorEvent, OperationKind, ProgressDetails, ProgressEvent, UserEvent,
};

#[derive(Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<UserEvent>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self { tx }
    }

    /// Send `event_name` to the room of `owner_user_id`
    pub fn emit(&self, owner_user_id: &str, event_name: &str, payload: Value) {
        debug!(user_id = %owner_user_id, event = %event_name, "Emitting progress event");
        // No subscribers is fine
        let _ = self.tx.send(UserEvent {
            user_id: owner_user_id.to_string(),
            event: event_name.to_string(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserEvent> {
        self.tx.subscribe()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

struct ReporterState<S> {
    last_percent: u8,
    stage: Option<S>,
    terminated: bool,
}

/// Progress events for a single operation run by a job
pub struct ProgressReporter<S> {
    broadcaster: ProgressBroadcaster,
    kind: OperationKind,
    owner_user_id: String,
    job_id: String,
    subject_id: String,
    job_store: Option<Arc<dyn JobStore>>,
    state: Mutex<ReporterState<S>>,
}

impl<S> ProgressReporter<S>
where
    S: Serialize + Display + Copy + Send + Sync,
{
    pub fn new(
        broadcaster: ProgressBroadcaster,
        kind: OperationKind,
        owner_user_id: impl Into<String>,
        job_id: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            broadcaster,
            kind,
            owner_user_id: owner_user_id.into(),
            job_id: job_id.into(),
            subject_id: subject_id.into(),
            job_store: None,
            state: Mutex::new(ReporterState {
                last_percent: 0,
                stage: None,
                terminated: false,
            }),
        }
    }

    /// Mirror progress onto the job record (also serves as its heartbeat)
    pub fn with_job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn last_percent(&self) -> u8 {
        self.state.lock().last_percent
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub async fn stage(&self, stage: S, percent: u8, message: impl Into<String>) {
        self.stage_with_details(stage, percent, message, None).await;
    }

    pub async fn stage_with_details(
        &self,
        stage: S,
        percent: u8,
        message: impl Into<String>,
        details: Option<ProgressDetails>,
    ) {
        let percent = {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            state.last_percent = state.last_percent.max(percent.min(100));
            state.stage = Some(stage);
            state.last_percent
        };

        let event = ProgressEvent {
            job_id: self.job_id.clone(),
            subject_id: self.subject_id.clone(),
            stage,
            progress: percent,
            message: message.into(),
            timestamp: Utc::now(),
            details,
        };
        self.send(self.kind.progress_event(), &event);
        self.touch_job(percent).await;
    }

    /// Terminal completion; false when a terminal event was already sent
    pub async fn complete(&self, success: bool, message: impl Into<String>, result: Value) -> bool {
        {
            let mut state = self.state.lock();
            if state.terminated {
                return false;
            }
            state.terminated = true;
            state.last_percent = 100;
        }

        let event = CompletionEvent {
            job_id: self.job_id.clone(),
            subject_id: self.subject_id.clone(),
            success,
            progress: 100,
            message: message.into(),
            timestamp: Utc::now(),
            result,
        };
        self.send(self.kind.complete_event(), &event);
        self.touch_job(100).await;
        true
    }

    /// Terminal failure; false when a terminal event was already sent
    pub async fn fail(&self, error: &EngineError) -> bool {
        let stage = {
            let mut state = self.state.lock();
            if state.terminated {
                return false;
            }
            state.terminated = true;
            state
                .stage
                .map(|s| s.to_string())
                .unwrap_or_else(|| "queued".to_string())
        };

        let event = ErrorEvent {
            job_id: self.job_id.clone(),
            subject_id: self.subject_id.clone(),
            stage,
            code: error.code().to_string(),
            error: error.to_string(),
            timestamp: Utc::now(),
        };
        self.send(self.kind.error_event(), &event);
        true
    }

    fn send<T: Serialize>(&self, event_name: &str, event: &T) {
        match serde_json::to_value(event) {
            Ok(payload) => self.broadcaster.emit(&self.owner_user_id, event_name, payload),
            Err(e) => warn!(job_id = %self.job_id, error = %e, "Failed to encode progress event"),
        }
    }

    async fn touch_job(&self, percent: u8) {
        if let Some(store) = &self.job_store {
            if let Err(e) = store.update_progress(&self.job_id, percent).await {
                warn!(job_id = %self.job_id, error = %e, "Failed to record job progress");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::progress::MintStage;

    fn reporter(broadcaster: &ProgressBroadcaster) -> ProgressReporter<MintStage> {
        ProgressReporter::new(
            broadcaster.clone(),
            OperationKind::Mint,
            "user-7",
            "job-1",
            "0.0.5005",
        )
    }

    fn drain(rx: &mut broadcast::Receiver<UserEvent>) -> Vec<UserEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let broadcaster = ProgressBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        let reporter = reporter(&broadcaster);

        reporter.stage(MintStage::MintingTokens, 50, "half").await;
        reporter.stage(MintStage::MintingTokens, 30, "late chunk").await;
        reporter.stage(MintStage::UpdatingRecords, 150, "overflow").await;

        let percents: Vec<u64> = drain(&mut rx)
            .iter()
            .map(|e| e.payload["progress"].as_u64().unwrap())
            .collect();
        assert_eq!(percents, vec![50, 50, 100]);
    }

    #[tokio::test]
    async fn test_single_terminal_event() {
        let broadcaster = ProgressBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        let reporter = reporter(&broadcaster);

        reporter.stage(MintStage::Validating, 10, "validating").await;
        assert!(reporter.fail(&EngineError::InvalidQuantity(0)).await);
        assert!(!reporter.complete(true, "done", Value::Null).await);
        reporter.stage(MintStage::Complete, 100, "ignored").await;

        let events = drain(&mut rx);
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["token-mint-progress", "token-mint-error"]);
        assert_eq!(events[1].payload["stage"], "validating");
        assert_eq!(events[1].payload["code"], "invalid_quantity");
        assert_eq!(events[1].user_id, "user-7");
    }
}

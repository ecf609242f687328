//! Daily collateral expiry check

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::info;

use crate::error::EngineError;
use crate::jobs::worker::JobHandler;
use crate::models::job::{Job, JobPayload};
use crate::services::repository::Repository;

pub struct DailyCheckHandler {
    repository: Arc<dyn Repository>,
}

impl DailyCheckHandler {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }
}

/// `[00:00, 24:00)` UTC of the day containing `now`
pub fn utc_day_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        .and_utc();
    (start, start + Duration::days(1))
}

fn summary_message(tokens_found: usize, force: bool) -> &'static str {
    match (tokens_found, force) {
        (0, false) => "No tokens expiring today",
        (0, true) => "Force mode enabled but no tokens expiring today",
        _ => "Daily token check completed",
    }
}

#[async_trait]
impl JobHandler for DailyCheckHandler {
    async fn handle(&self, job: &Job) -> Result<Value, EngineError> {
        let JobPayload::DailyCheck(data) = &job.payload else {
            return Err(EngineError::Validation(format!(
                "job {} is not a daily check",
                job.id
            )));
        };

        let (from, to) = utc_day_window(Utc::now());
        info!(
            job_id = %job.id,
            manual = data.manual,
            force = data.force,
            "Starting daily token expiration check"
        );

        // repository errors propagate so the queue retries the check
        let expiring = self.repository.collateral_expiring_between(from, to).await?;
        let token_ids: Vec<String> = expiring.iter().map(|c| c.token_id.clone()).collect();

        info!(job_id = %job.id, tokens_found = token_ids.len(), "Daily token check finished");

        Ok(json!({
            "message": summary_message(token_ids.len(), data.force),
            "tokens_found": token_ids.len(),
            "token_ids": token_ids,
            "is_manual": data.manual,
            "force": data.force,
            "window_start": from,
            "window_end": to,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_utc_day_window() {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 17, 45, 0).unwrap();
        let (from, to) = utc_day_window(now);
        assert_eq!(from, Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap());
        assert_eq!(to, Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_summary_message() {
        assert_eq!(summary_message(0, false), "No tokens expiring today");
        assert_eq!(summary_message(0, true), "Force mode enabled but no tokens expiring today");
        assert_eq!(summary_message(3, false), "Daily token check completed");
    }
}

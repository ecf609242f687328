//! Daily check scheduling, manual triggers and the stalled-job sweep

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::jobs::store::{JobStore, JobStoreError};
use crate::models::job::{
    DailyCheckJobData, EnqueueOptions, EnqueueOutcome, JobPayload, DEFAULT_PRIORITY,
    MANUAL_PRIORITY,
};

/// Next `hour:00` UTC strictly after `now`
pub fn next_daily_run(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour.min(23), 0, 0)
        .unwrap_or_default()
        .and_utc();
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

/// One scheduled check per UTC day
pub fn daily_check_job_id(date: NaiveDate) -> String {
    format!("daily-token-check-{}", date.format("%Y-%m-%d"))
}

pub async fn enqueue_scheduled_daily_check(
    store: &dyn JobStore,
    date: NaiveDate,
) -> Result<EnqueueOutcome, JobStoreError> {
    store
        .enqueue(
            JobPayload::DailyCheck(DailyCheckJobData::default()),
            EnqueueOptions {
                id: Some(daily_check_job_id(date)),
                priority: Some(DEFAULT_PRIORITY),
                delay: None,
            },
        )
        .await
}

/// Operator-triggered check; runs ahead of queued scheduled work
pub async fn trigger_daily_check(
    store: &dyn JobStore,
    force: bool,
    job_id: Option<String>,
) -> Result<EnqueueOutcome, JobStoreError> {
    let id = job_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("manual-daily-check-{}", Utc::now().timestamp_millis()));

    let outcome = store
        .enqueue(
            JobPayload::DailyCheck(DailyCheckJobData {
                manual: true,
                force,
            }),
            EnqueueOptions {
                id: Some(id),
                priority: Some(MANUAL_PRIORITY),
                delay: None,
            },
        )
        .await?;

    info!(job_id = %outcome.job.id, force, created = outcome.created, "Manual daily check triggered");
    Ok(outcome)
}

pub fn spawn_daily_scheduler(
    store: Arc<dyn JobStore>,
    hour_utc: u32,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(hour_utc, "Daily token check scheduler started");

        loop {
            let now = Utc::now();
            let next = next_daily_run(now, hour_utc);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next_run = %next, "Next daily token check scheduled");

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match enqueue_scheduled_daily_check(store.as_ref(), next.date_naive()).await {
                Ok(outcome) if outcome.created => {
                    info!(job_id = %outcome.job.id, "Scheduled daily token check enqueued");
                }
                Ok(outcome) => {
                    warn!(job_id = %outcome.job.id, "Daily token check already enqueued for today");
                }
                Err(e) => error!(error = %e, "Failed to enqueue daily token check"),
            }
        }

        info!("Daily token check scheduler stopped");
    })
}

/// Periodically recover jobs whose worker stopped heart-beating
pub fn spawn_stalled_sweep(
    store: Arc<dyn JobStore>,
    stalled_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(stalled_after.max(Duration::from_secs(1)));
        // First tick fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match store.cleanup_stalled(stalled_after).await {
                        Ok(report) if report.requeued.is_empty() && report.failed.is_empty() => {}
                        Ok(report) => warn!(
                            requeued = report.requeued.len(),
                            failed = report.failed.len(),
                            "Recovered stalled jobs"
                        ),
                        Err(e) => error!(error = %e, "Stalled job sweep failed"),
                    }
                }
            }
        }
    })
}

use std::sync::Arc;

use futures_util::future::join_all;
use mfeed_core::{FeedKind, RunStatus};
use mfeed_storage::{CleanupOutcome, FeedGateway};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};

use crate::job::{JobStatus, RunOutcome, RunPermit, SingleFlight, TickOutcome};
use crate::JobSchedule;

pub const DEFAULT_RETENTION_DAYS: u32 = 15;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedCleanup {
    pub feed: FeedKind,
    #[serde(flatten)]
    pub outcome: CleanupOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionReport {
    pub status: RunStatus,
    pub days_to_keep: u32,
    /// Sum over successful cleanups only.
    pub total_deleted: u64,
    pub results: Vec<FeedCleanup>,
}

impl RetentionReport {
    fn from_results(days_to_keep: u32, results: Vec<FeedCleanup>) -> Self {
        let succeeded = results.iter().filter(|r| r.outcome.success).count();
        let status = if succeeded == results.len() {
            RunStatus::Success
        } else if succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::PartialSuccess
        };
        let total_deleted = results
            .iter()
            .filter(|r| r.outcome.success)
            .map(|r| r.outcome.deleted)
            .sum();
        Self {
            status,
            days_to_keep,
            total_deleted,
            results,
        }
    }

    fn run_outcome(&self) -> RunOutcome {
        let failures = self
            .results
            .iter()
            .filter(|r| !r.outcome.success)
            .map(|r| format!("{}: {}", r.feed, r.outcome.message))
            .collect::<Vec<_>>();
        RunOutcome {
            status: self.status,
            saved_count: None,
            rows_skipped: None,
            error: (!failures.is_empty()).then(|| failures.join("; ")),
        }
    }
}

/// Daily deletion of rows older than the retention window, across every
/// feed table, behind its own guard.
pub struct RetentionJob {
    gateways: Vec<FeedGateway>,
    days_to_keep: u32,
    schedule: JobSchedule,
    flight: Arc<SingleFlight>,
}

impl RetentionJob {
    pub fn new(gateways: Vec<FeedGateway>, days_to_keep: u32, schedule: JobSchedule) -> Self {
        Self {
            gateways,
            days_to_keep,
            schedule,
            flight: SingleFlight::new(),
        }
    }

    pub fn days_to_keep(&self) -> u32 {
        self.days_to_keep
    }

    pub fn schedule(&self) -> &JobSchedule {
        &self.schedule
    }

    /// Cleans every table concurrently without touching the guard.
    pub async fn run_cleanup(&self) -> RetentionReport {
        let days = self.days_to_keep;
        let results = join_all(self.gateways.iter().map(|gw| async move {
            FeedCleanup {
                feed: gw.feed(),
                outcome: gw.cleanup_old_data(days).await,
            }
        }))
        .await;
        RetentionReport::from_results(days, results)
    }

    pub async fn tick(&self) -> TickOutcome<RetentionReport> {
        match self.flight.try_acquire() {
            Some(permit) => TickOutcome::Completed(self.execute(permit).await),
            None => {
                info!("cleanup still in progress; skipping");
                TickOutcome::Skipped
            }
        }
    }

    pub async fn trigger_manual_run(&self) -> TickOutcome<RetentionReport> {
        self.tick().await
    }

    pub fn spawn_manual_run(self: &Arc<Self>) -> bool {
        let Some(permit) = self.flight.try_acquire() else {
            info!("manual cleanup ignored; run in progress");
            return false;
        };
        let job = Arc::clone(self);
        tokio::spawn(async move {
            job.execute(permit).await;
        });
        true
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::new("cleanup", &self.schedule, self.flight.snapshot())
    }

    async fn execute(&self, permit: RunPermit) -> RetentionReport {
        let span = info_span!("retention_run", days_to_keep = self.days_to_keep, run = permit.run_number());
        async move {
            info!("starting cleanup");
            let report = self.run_cleanup().await;
            if report.status == RunStatus::Success {
                info!(total_deleted = report.total_deleted, "cleanup finished");
            } else {
                error!(
                    status = %report.status,
                    total_deleted = report.total_deleted,
                    "cleanup finished with failures"
                );
            }
            permit.finish(report.run_outcome());
            report
        }
        .instrument(span)
        .await
    }
}

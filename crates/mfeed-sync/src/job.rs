use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mfeed_adapters::{extract_rows, Extraction, FeedSpec};
use mfeed_core::{FeedKind, RunStatus};
use mfeed_storage::{FeedGateway, HttpFetcher, SaveOutcome};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};

use crate::JobSchedule;

/// In-memory run bookkeeping for one job. Lost on restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobRunState {
    pub is_running: bool,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub run_count: u64,
    pub skipped_count: u64,
    pub last_duration_ms: Option<u64>,
    pub last_saved_count: Option<usize>,
    pub last_rows_skipped: Option<usize>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub saved_count: Option<usize>,
    pub rows_skipped: Option<usize>,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            saved_count: None,
            rows_skipped: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome<T> {
    /// A previous run still held the guard.
    Skipped,
    Completed(T),
}

impl<T> TickOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped)
    }
}

/// Non-overlap guard plus run statistics for one job.
///
/// The mutex is only held for state transitions, never across an await.
#[derive(Debug, Default)]
pub struct SingleFlight {
    state: Mutex<JobRunState>,
}

impl SingleFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Moves the job to running and hands out the permit, or records a
    /// skipped tick when a run is already in progress.
    pub fn try_acquire(self: &Arc<Self>) -> Option<RunPermit> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_running {
            state.skipped_count += 1;
            return None;
        }
        state.is_running = true;
        state.run_count += 1;
        state.last_run_time = Some(Utc::now());
        Some(RunPermit {
            flight: Arc::clone(self),
            started: Instant::now(),
            outcome: None,
        })
    }

    pub fn snapshot(&self) -> JobRunState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Held for the duration of one run. Dropping it always returns the job to
/// idle; a permit dropped without [`RunPermit::finish`] marks the run failed.
#[derive(Debug)]
pub struct RunPermit {
    flight: Arc<SingleFlight>,
    started: Instant,
    outcome: Option<RunOutcome>,
}

impl RunPermit {
    pub fn run_number(&self) -> u64 {
        self.flight.snapshot().run_count
    }

    pub fn finish(mut self, outcome: RunOutcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        let outcome = self
            .outcome
            .take()
            .unwrap_or_else(|| RunOutcome::failed("run aborted before completion"));
        let mut state = self
            .flight
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.is_running = false;
        state.last_duration_ms = Some(self.started.elapsed().as_millis() as u64);
        state.last_run_status = Some(outcome.status);
        state.last_saved_count = outcome.saved_count;
        state.last_rows_skipped = outcome.rows_skipped;
        state.last_error = outcome.error;
    }
}

/// What one pass of a feed pipeline produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub scraped: usize,
    pub rows_skipped: usize,
    pub rows_dropped: usize,
    pub save: Option<SaveOutcome>,
}

impl PipelineReport {
    /// Success needs at least one record and a successful save.
    pub fn outcome(&self) -> RunOutcome {
        let (status, error) = match &self.save {
            Some(save) if self.scraped > 0 && save.success => (RunStatus::Success, None),
            Some(save) => (RunStatus::Failed, Some(save.message.clone())),
            None => (RunStatus::Failed, Some("no records scraped".to_string())),
        };
        RunOutcome {
            status,
            saved_count: Some(self.save.as_ref().map(|s| s.saved_count).unwrap_or(0)),
            rows_skipped: Some(self.rows_skipped),
            error,
        }
    }
}

#[async_trait]
pub trait FeedPipeline: Send + Sync {
    fn feed(&self) -> FeedKind;

    async fn run(&self) -> Result<PipelineReport>;
}

/// Fetch, extract and save for one feed.
pub struct ScrapePipeline {
    spec: FeedSpec,
    fetcher: Arc<HttpFetcher>,
    gateway: FeedGateway,
}

impl ScrapePipeline {
    pub fn new(spec: FeedSpec, fetcher: Arc<HttpFetcher>, gateway: FeedGateway) -> Self {
        Self {
            spec,
            fetcher,
            gateway,
        }
    }

    pub fn spec(&self) -> &FeedSpec {
        &self.spec
    }

    /// Fetch and extract without persisting.
    pub async fn scrape(&self) -> Result<Extraction> {
        let feed = self.spec.feed;
        let html = self
            .fetcher
            .fetch_html(feed, &self.spec.url, &self.spec.profile)
            .await
            .with_context(|| format!("fetching {feed} page"))?;
        let extraction =
            extract_rows(&html, &self.spec).with_context(|| format!("extracting {feed} rows"))?;
        info!(
            feed = %feed,
            records = extraction.records.len(),
            rows_seen = extraction.rows_seen,
            rows_skipped = extraction.rows_skipped,
            rows_dropped = extraction.rows_dropped,
            "extracted rows"
        );
        Ok(extraction)
    }
}

#[async_trait]
impl FeedPipeline for ScrapePipeline {
    fn feed(&self) -> FeedKind {
        self.spec.feed
    }

    async fn run(&self) -> Result<PipelineReport> {
        let extraction = self.scrape().await?;
        let save = if extraction.records.is_empty() {
            warn!(feed = %self.spec.feed, "no records scraped; nothing to save");
            None
        } else {
            Some(self.gateway.save(&extraction.records).await)
        };
        Ok(PipelineReport {
            scraped: extraction.records.len(),
            rows_skipped: extraction.rows_skipped,
            rows_dropped: extraction.rows_dropped,
            save,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job: String,
    pub schedule: String,
    pub timezone: String,
    #[serde(flatten)]
    pub state: JobRunState,
    pub next_run_in: String,
}

impl JobStatus {
    pub(crate) fn new(job: impl Into<String>, schedule: &JobSchedule, state: JobRunState) -> Self {
        let next_run_in = if state.is_running {
            "running now".to_string()
        } else {
            schedule.cadence_hint()
        };
        Self {
            job: job.into(),
            schedule: schedule.cron.clone(),
            timezone: schedule.timezone.name().to_string(),
            state,
            next_run_in,
        }
    }
}

/// A feed pipeline behind its single-flight guard.
pub struct FeedJob {
    feed: FeedKind,
    schedule: JobSchedule,
    pipeline: Arc<dyn FeedPipeline>,
    flight: Arc<SingleFlight>,
}

impl FeedJob {
    pub fn new(schedule: JobSchedule, pipeline: Arc<dyn FeedPipeline>) -> Self {
        Self {
            feed: pipeline.feed(),
            schedule,
            pipeline,
            flight: SingleFlight::new(),
        }
    }

    pub fn feed(&self) -> FeedKind {
        self.feed
    }

    pub fn schedule(&self) -> &JobSchedule {
        &self.schedule
    }

    /// One scheduler tick: runs the pipeline unless a run is in progress.
    pub async fn tick(&self) -> TickOutcome<RunOutcome> {
        match self.flight.try_acquire() {
            Some(permit) => TickOutcome::Completed(self.execute(permit).await),
            None => {
                info!(feed = %self.feed, "previous run still in progress; skipping");
                TickOutcome::Skipped
            }
        }
    }

    /// Same guard and bookkeeping as a scheduled tick.
    pub async fn trigger_manual_run(&self) -> TickOutcome<RunOutcome> {
        self.tick().await
    }

    /// Acquires the guard now and runs in the background. Returns false when
    /// a run is already in progress.
    pub fn spawn_manual_run(self: &Arc<Self>) -> bool {
        let Some(permit) = self.flight.try_acquire() else {
            info!(feed = %self.feed, "manual trigger ignored; run in progress");
            return false;
        };
        let job = Arc::clone(self);
        tokio::spawn(async move {
            job.execute(permit).await;
        });
        true
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::new(self.feed.slug(), &self.schedule, self.flight.snapshot())
    }

    async fn execute(&self, permit: RunPermit) -> RunOutcome {
        let span = info_span!("feed_run", feed = %self.feed, run = permit.run_number());
        async move {
            info!("starting run");
            let outcome = match self.pipeline.run().await {
                Ok(report) => {
                    let outcome = report.outcome();
                    info!(
                        status = %outcome.status,
                        scraped = report.scraped,
                        saved = outcome.saved_count.unwrap_or(0),
                        rows_skipped = report.rows_skipped,
                        "run finished"
                    );
                    outcome
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "run failed");
                    RunOutcome::failed(format!("{err:#}"))
                }
            };
            permit.finish(outcome.clone());
            outcome
        }
        .instrument(span)
        .await
    }
}

//! Scheduling and orchestration: per-feed single-flight jobs, the retention
//! job, configuration and the `feeds.yaml` registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use mfeed_adapters::{feed_spec, FeedSpec};
use mfeed_core::FeedKind;
use mfeed_storage::{
    FeedGateway, FeedStore, HttpClientConfig, HttpFetcher, MemoryStore, PgStore, RestStore,
    RestStoreConfig,
};
use serde::Deserialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

mod job;
mod retention;

pub use job::{
    FeedJob, FeedPipeline, JobRunState, JobStatus, PipelineReport, RunOutcome, RunPermit,
    ScrapePipeline, SingleFlight, TickOutcome,
};
pub use retention::{FeedCleanup, RetentionJob, RetentionReport, DEFAULT_RETENTION_DAYS};

pub const CRATE_NAME: &str = "mfeed-sync";

pub const DEFAULT_RETENTION_CRON: &str = "0 0 1 * * *";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Rest,
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rest" | "supabase" => Ok(StoreBackend::Rest),
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => bail!("unknown store backend `{other}` (expected rest, postgres or memory)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_backend: StoreBackend,
    pub store_url: Option<String>,
    pub store_service_key: Option<String>,
    pub store_anon_key: Option<String>,
    pub database_url: Option<String>,
    pub database_write_url: Option<String>,
    pub scheduler_enabled: bool,
    pub run_on_start: bool,
    pub retention_days: Option<u32>,
    pub retention_cron: Option<String>,
    pub http_timeout_secs: u64,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

fn flag(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let store_backend = match non_empty("MFEED_STORE_BACKEND") {
            Some(v) => v.parse()?,
            None => StoreBackend::Rest,
        };
        Ok(Self {
            store_backend,
            store_url: non_empty("MFEED_STORE_URL"),
            store_service_key: non_empty("MFEED_STORE_SERVICE_KEY"),
            store_anon_key: non_empty("MFEED_STORE_ANON_KEY"),
            database_url: non_empty("DATABASE_URL"),
            database_write_url: non_empty("DATABASE_WRITE_URL"),
            scheduler_enabled: flag(non_empty("MFEED_SCHEDULER_ENABLED"), true),
            run_on_start: flag(non_empty("MFEED_RUN_ON_START"), true),
            retention_days: non_empty("MFEED_RETENTION_DAYS")
                .map(|v| v.trim().parse().with_context(|| format!("parsing MFEED_RETENTION_DAYS={v}")))
                .transpose()?,
            retention_cron: non_empty("MFEED_RETENTION_CRON"),
            http_timeout_secs: non_empty("MFEED_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            web_port: non_empty("MFEED_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(3000),
            workspace_root: non_empty("MFEED_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("feeds.yaml")
    }
}

/// A 6-field cron expression (with seconds) evaluated in a timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSchedule {
    pub cron: String,
    pub timezone: Tz,
}

impl JobSchedule {
    pub fn new(cron: impl Into<String>, timezone: Tz) -> Self {
        Self {
            cron: cron.into(),
            timezone,
        }
    }

    pub fn default_for(feed: FeedKind) -> Self {
        match feed {
            FeedKind::UsIndices => Self::new("0 */2 * * * *", chrono_tz::America::New_York),
            FeedKind::BrazilIndices | FeedKind::Currencies => {
                Self::new("0 */2 * * * *", chrono_tz::America::Sao_Paulo)
            }
            FeedKind::Commodities => Self::new("0 */5 * * * *", chrono_tz::America::Sao_Paulo),
        }
    }

    pub fn retention_default() -> Self {
        Self::new(DEFAULT_RETENTION_CRON, chrono_tz::UTC)
    }

    /// Rough hint of when the next tick fires, for status output.
    pub fn cadence_hint(&self) -> String {
        let fields = self.cron.split_whitespace().collect::<Vec<_>>();
        match fields.as_slice() {
            [_, minute, "*", "*", "*", "*", ..] if minute.starts_with("*/") => {
                format!("within {} minutes", minute.trim_start_matches("*/"))
            }
            [_, minute, hour, "*", "*", "*", ..] if minute.parse::<u32>().is_ok() && hour.parse::<u32>().is_ok() => {
                format!("daily at {:0>2}:{:0>2} {}", hour, minute, self.timezone.name())
            }
            _ => format!("per schedule `{}` ({})", self.cron, self.timezone.name()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{job}: unknown timezone `{value}`")]
    Timezone { job: String, value: String },
    #[error("{job}: cron `{cron}` must have 6 or 7 fields (seconds first)")]
    Cron { job: String, cron: String },
    #[error("{0} is listed more than once")]
    Duplicate(FeedKind),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedRegistry {
    #[serde(default)]
    pub feeds: Vec<FeedEntry>,
    #[serde(default)]
    pub retention: Option<RetentionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedEntry {
    pub feed: FeedKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetentionEntry {
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub days_to_keep: Option<u32>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFeed {
    pub feed: FeedKind,
    pub enabled: bool,
    pub schedule: JobSchedule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionSettings {
    pub days_to_keep: u32,
    pub schedule: JobSchedule,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            days_to_keep: DEFAULT_RETENTION_DAYS,
            schedule: JobSchedule::retention_default(),
        }
    }
}

/// Reads `feeds.yaml`; a missing file means built-in defaults.
pub fn load_registry(path: impl AsRef<Path>) -> Result<FeedRegistry, RegistryError> {
    let path = path.as_ref();
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no feed registry; using defaults");
            return Ok(FeedRegistry::default());
        }
        Err(source) => {
            return Err(RegistryError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_yaml::from_str(&text).map_err(|source| RegistryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_timezone(job: &str, value: &str) -> Result<Tz, RegistryError> {
    value.trim().parse::<Tz>().map_err(|_| RegistryError::Timezone {
        job: job.to_string(),
        value: value.to_string(),
    })
}

fn check_cron(job: &str, cron: &str) -> Result<(), RegistryError> {
    match cron.split_whitespace().count() {
        6 | 7 => Ok(()),
        _ => Err(RegistryError::Cron {
            job: job.to_string(),
            cron: cron.to_string(),
        }),
    }
}

impl FeedRegistry {
    /// Every feed with its effective schedule; feeds the file does not list
    /// keep their defaults and stay enabled.
    pub fn resolve_feeds(&self) -> Result<Vec<ResolvedFeed>, RegistryError> {
        let mut entries = BTreeMap::new();
        for entry in &self.feeds {
            if entries.insert(entry.feed, entry).is_some() {
                return Err(RegistryError::Duplicate(entry.feed));
            }
        }

        FeedKind::ALL
            .into_iter()
            .map(|feed| {
                let default = JobSchedule::default_for(feed);
                let Some(entry) = entries.get(&feed) else {
                    return Ok(ResolvedFeed {
                        feed,
                        enabled: true,
                        schedule: default,
                    });
                };
                let cron = entry.cron.clone().unwrap_or(default.cron);
                check_cron(feed.slug(), &cron)?;
                let timezone = match &entry.timezone {
                    Some(tz) => parse_timezone(feed.slug(), tz)?,
                    None => default.timezone,
                };
                Ok(ResolvedFeed {
                    feed,
                    enabled: entry.enabled,
                    schedule: JobSchedule::new(cron, timezone),
                })
            })
            .collect()
    }

    /// Retention settings with environment overrides applied on top.
    pub fn resolve_retention(&self, config: &SyncConfig) -> Result<RetentionSettings, RegistryError> {
        let entry = self.retention.clone().unwrap_or_default();
        let defaults = RetentionSettings::default();
        let cron = config
            .retention_cron
            .clone()
            .or(entry.cron)
            .unwrap_or(defaults.schedule.cron);
        check_cron("cleanup", &cron)?;
        let timezone = match &entry.timezone {
            Some(tz) => parse_timezone("cleanup", tz)?,
            None => defaults.schedule.timezone,
        };
        Ok(RetentionSettings {
            days_to_keep: config
                .retention_days
                .or(entry.days_to_keep)
                .unwrap_or(defaults.days_to_keep),
            schedule: JobSchedule::new(cron, timezone),
        })
    }
}

/// Chooses and configures the persistence backend.
pub fn build_store(config: &SyncConfig) -> Result<Arc<dyn FeedStore>> {
    let store: Arc<dyn FeedStore> = match config.store_backend {
        StoreBackend::Rest => {
            let base_url = config
                .store_url
                .clone()
                .context("MFEED_STORE_URL is required for the rest backend")?;
            if config.store_service_key.is_none() {
                warn!("MFEED_STORE_SERVICE_KEY is not set; saves and cleanup will fail");
            }
            Arc::new(
                RestStore::new(RestStoreConfig {
                    base_url,
                    service_key: config.store_service_key.clone(),
                    anon_key: config.store_anon_key.clone(),
                    timeout: Duration::from_secs(config.http_timeout_secs),
                })
                .context("building rest store client")?,
            )
        }
        StoreBackend::Postgres => {
            let read_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;
            let write_url = config.database_write_url.as_deref().or(Some(read_url));
            Arc::new(PgStore::connect_lazy(read_url, write_url).context("configuring postgres pools")?)
        }
        StoreBackend::Memory => {
            warn!("using the in-memory store; data is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

/// Gateways for every feed plus the jobs that are enabled.
pub struct Services {
    pub gateways: BTreeMap<FeedKind, FeedGateway>,
    pub jobs: BTreeMap<FeedKind, Arc<FeedJob>>,
    pub retention: Arc<RetentionJob>,
}

impl Services {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = load_registry(config.registry_path())?;
        let feeds = registry.resolve_feeds()?;
        let retention = registry.resolve_retention(config)?;
        let store = build_store(config)?;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            ..Default::default()
        })
        .context("building http client")?;
        Ok(Self::assemble(store, Arc::new(fetcher), &feeds, retention, feed_spec))
    }

    /// Wires scrape pipelines for the enabled feeds; `spec_for` supplies the
    /// page description of each feed.
    pub fn assemble(
        store: Arc<dyn FeedStore>,
        fetcher: Arc<HttpFetcher>,
        feeds: &[ResolvedFeed],
        retention: RetentionSettings,
        spec_for: impl Fn(FeedKind) -> FeedSpec,
    ) -> Self {
        let gateways = FeedKind::ALL
            .into_iter()
            .map(|feed| (feed, FeedGateway::new(feed, Arc::clone(&store))))
            .collect::<BTreeMap<_, _>>();

        let jobs = feeds
            .iter()
            .filter(|f| f.enabled)
            .map(|f| {
                let pipeline = ScrapePipeline::new(
                    spec_for(f.feed),
                    Arc::clone(&fetcher),
                    gateways[&f.feed].clone(),
                );
                (f.feed, Arc::new(FeedJob::new(f.schedule.clone(), Arc::new(pipeline))))
            })
            .collect();

        let retention = Arc::new(RetentionJob::new(
            gateways.values().cloned().collect(),
            retention.days_to_keep,
            retention.schedule,
        ));

        Self {
            gateways,
            jobs,
            retention,
        }
    }

    pub fn gateway(&self, feed: FeedKind) -> Option<&FeedGateway> {
        self.gateways.get(&feed)
    }

    pub fn job(&self, feed: FeedKind) -> Option<&Arc<FeedJob>> {
        self.jobs.get(&feed)
    }

    pub fn backend(&self) -> &'static str {
        self.gateways
            .values()
            .next()
            .map(FeedGateway::backend)
            .unwrap_or("none")
    }

    /// Kicks off one background run per enabled feed.
    pub fn run_startup_scrapes(&self) {
        for job in self.jobs.values() {
            if job.spawn_manual_run() {
                info!(feed = %job.feed(), "initial run started");
            }
        }
    }

    /// Registers every job with a started scheduler.
    pub async fn start_scheduler(&self) -> Result<SchedulerHandle> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let mut registered = Vec::with_capacity(self.jobs.len() + 1);

        for job in self.jobs.values() {
            let schedule = job.schedule().clone();
            let runner = Arc::clone(job);
            let cron_job = Job::new_async_tz(schedule.cron.as_str(), schedule.timezone, move |_uuid, _l| {
                let runner = Arc::clone(&runner);
                Box::pin(async move {
                    runner.tick().await;
                })
            })
            .with_context(|| format!("creating {} job for cron {}", job.feed(), schedule.cron))?;
            sched.add(cron_job).await.context("adding scheduler job")?;
            info!(feed = %job.feed(), cron = %schedule.cron, timezone = %schedule.timezone, "scheduled feed");
            registered.push(job.feed().slug().to_string());
        }

        let schedule = self.retention.schedule().clone();
        let runner = Arc::clone(&self.retention);
        let cleanup_job = Job::new_async_tz(schedule.cron.as_str(), schedule.timezone, move |_uuid, _l| {
            let runner = Arc::clone(&runner);
            Box::pin(async move {
                runner.tick().await;
            })
        })
        .with_context(|| format!("creating cleanup job for cron {}", schedule.cron))?;
        sched.add(cleanup_job).await.context("adding cleanup job")?;
        info!(cron = %schedule.cron, days_to_keep = self.retention.days_to_keep(), "scheduled cleanup");
        registered.push("cleanup".to_string());

        sched.start().await.context("starting scheduler")?;
        info!(jobs = registered.len(), "scheduler started");
        Ok(SchedulerHandle {
            scheduler: sched,
            registered,
        })
    }
}

/// A running scheduler and the names of the jobs it fires.
pub struct SchedulerHandle {
    scheduler: JobScheduler,
    registered: Vec<String>,
}

impl SchedulerHandle {
    /// Feed slugs in registration order, then `cleanup`.
    pub fn registered(&self) -> &[String] {
        &self.registered
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler.shutdown().await.context("stopping scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> SyncConfig {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        SyncConfig::from_lookup(|k| vars.get(k).cloned()).unwrap()
    }

    #[test]
    fn config_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg.store_backend, StoreBackend::Rest);
        assert!(cfg.scheduler_enabled);
        assert!(cfg.run_on_start);
        assert_eq!(cfg.http_timeout_secs, 20);
        assert_eq!(cfg.web_port, 3000);
        assert_eq!(cfg.retention_days, None);
        assert_eq!(cfg.registry_path(), PathBuf::from("./feeds.yaml"));
    }

    #[test]
    fn config_reads_overrides_and_ignores_blank_values() {
        let cfg = config(&[
            ("MFEED_STORE_BACKEND", "memory"),
            ("MFEED_SCHEDULER_ENABLED", "false"),
            ("MFEED_RETENTION_DAYS", "30"),
            ("MFEED_STORE_SERVICE_KEY", "  "),
            ("MFEED_WEB_PORT", "8080"),
        ]);
        assert_eq!(cfg.store_backend, StoreBackend::Memory);
        assert!(!cfg.scheduler_enabled);
        assert_eq!(cfg.retention_days, Some(30));
        assert_eq!(cfg.store_service_key, None);
        assert_eq!(cfg.web_port, 8080);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let vars = HashMap::from([("MFEED_STORE_BACKEND".to_string(), "mongo".to_string())]);
        assert!(SyncConfig::from_lookup(|k| vars.get(k).cloned()).is_err());
    }

    #[test]
    fn default_schedules_match_feed_cadences() {
        let resolved = FeedRegistry::default().resolve_feeds().unwrap();
        assert_eq!(resolved.len(), 4);
        let by_feed = resolved.into_iter().map(|r| (r.feed, r)).collect::<BTreeMap<_, _>>();
        assert_eq!(by_feed[&FeedKind::UsIndices].schedule.timezone, chrono_tz::America::New_York);
        assert_eq!(by_feed[&FeedKind::Currencies].schedule.timezone, chrono_tz::America::Sao_Paulo);
        assert_eq!(by_feed[&FeedKind::Commodities].schedule.cron, "0 */5 * * * *");
        assert!(by_feed.values().all(|r| r.enabled));
    }

    #[test]
    fn cadence_hints() {
        assert_eq!(JobSchedule::default_for(FeedKind::UsIndices).cadence_hint(), "within 2 minutes");
        assert_eq!(JobSchedule::retention_default().cadence_hint(), "daily at 01:00 UTC");
        assert!(JobSchedule::new("0 15 9 * * Mon-Fri", chrono_tz::UTC)
            .cadence_hint()
            .starts_with("per schedule"));
    }

    #[test]
    fn retention_env_overrides_registry() {
        let registry: FeedRegistry = serde_yaml::from_str(
            "retention:\n  days_to_keep: 7\n  cron: \"0 30 2 * * *\"\n  timezone: America/Sao_Paulo\n",
        )
        .unwrap();
        let from_file = registry.resolve_retention(&config(&[])).unwrap();
        assert_eq!(from_file.days_to_keep, 7);
        assert_eq!(from_file.schedule.cron, "0 30 2 * * *");

        let overridden = registry
            .resolve_retention(&config(&[("MFEED_RETENTION_DAYS", "20")]))
            .unwrap();
        assert_eq!(overridden.days_to_keep, 20);
        assert_eq!(overridden.schedule.timezone, chrono_tz::America::Sao_Paulo);
    }
}

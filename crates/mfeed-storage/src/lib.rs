//! Upstream HTTP fetching and the persistence gateway for scraped feeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use mfeed_core::{FeedKind, FeedRecord, RemoteSchema};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span, warn, Instrument};

mod memory;
mod pg;
mod rest;

pub use memory::MemoryStore;
pub use pg::PgStore;
pub use rest::{RestStore, RestStoreConfig};

pub const CRATE_NAME: &str = "mfeed-storage";

pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

const DESKTOP_CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";
const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";

/// Request headers that make a GET look like a desktop browser visit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub accept: String,
    pub accept_language: String,
    pub accept_encoding: String,
    pub connection: String,
    pub upgrade_insecure_requests: String,
}

impl BrowserProfile {
    pub fn english() -> Self {
        Self::with_language("en-US,en;q=0.5")
    }

    pub fn brazilian_portuguese() -> Self {
        Self::with_language("pt-BR,pt;q=0.9,en-US;q=0.8,en;q=0.7")
    }

    fn with_language(accept_language: &str) -> Self {
        Self {
            user_agent: DESKTOP_CHROME_UA.to_string(),
            accept: HTML_ACCEPT.to_string(),
            accept_language: accept_language.to_string(),
            accept_encoding: "gzip, deflate, br".to_string(),
            connection: "keep-alive".to_string(),
            upgrade_insecure_requests: "1".to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let pairs = [
            (header::USER_AGENT, &self.user_agent),
            (header::ACCEPT, &self.accept),
            (header::ACCEPT_LANGUAGE, &self.accept_language),
            (header::ACCEPT_ENCODING, &self.accept_encoding),
            (header::CONNECTION, &self.connection),
            (header::UPGRADE_INSECURE_REQUESTS, &self.upgrade_insecure_requests),
        ];
        for (name, value) in pairs {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    headers.insert(name, v);
                }
                Err(_) => warn!(header = %name, "dropping browser header with invalid value"),
            }
        }
        headers
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        headers: Vec<(String, String)>,
    },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request { source, .. } => source.status().map(|s| s.as_u16()),
        }
    }
}

/// Single-shot GET client shared by every feed. There is no retry here: a
/// failed fetch fails the run that issued it.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .timeout(config.timeout)
            .build()
            .map_err(|source| FetchError::Request {
                url: String::from("<client builder>"),
                source,
            })?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn fetch_html(
        &self,
        feed: FeedKind,
        url: &str,
        profile: &BrowserProfile,
    ) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", feed = %feed, url);
        async {
            let _permit = self
                .global_limit
                .acquire()
                .await
                .expect("semaphore not closed");

            info!("fetching upstream page");
            let resp = self
                .client
                .get(url)
                .headers(profile.headers())
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                let headers = resp
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("<binary>").to_string()))
                    .collect::<Vec<_>>();
                error!(status = status.as_u16(), ?headers, "upstream returned an error status");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    headers,
                });
            }

            resp.text().await.map_err(|source| FetchError::Request {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("privileged store credential is not configured; writes are disabled")]
    MissingPrivilegedCredential,
    #[error("public store credential is not configured; reads are disabled")]
    MissingPublicCredential,
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store rejected {operation} (status {status}): {message}")]
    Remote {
        operation: String,
        status: u16,
        message: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unexpected store response for {operation}: {detail}")]
    Decode { operation: String, detail: String },
}

/// Remote persistence reached through a table insert plus the feed's stored
/// procedures. Implementations never interpret row shapes beyond what the
/// procedures return.
#[async_trait]
pub trait FeedStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn insert_rows(
        &self,
        schema: &RemoteSchema,
        rows: Vec<JsonMap<String, JsonValue>>,
    ) -> Result<usize, StoreError>;

    async fn latest(&self, schema: &RemoteSchema) -> Result<Vec<JsonValue>, StoreError>;

    async fn history(
        &self,
        schema: &RemoteSchema,
        name: &str,
        limit: u32,
    ) -> Result<Vec<JsonValue>, StoreError>;

    async fn by_date_range(
        &self,
        schema: &RemoteSchema,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<JsonValue>, StoreError>;

    async fn cleanup_older_than(
        &self,
        schema: &RemoteSchema,
        days_to_keep: u32,
    ) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveOutcome {
    pub success: bool,
    pub saved_count: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub success: bool,
    pub message: String,
    pub data: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupOutcome {
    pub success: bool,
    pub message: String,
    pub deleted: u64,
}

impl SaveOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            saved_count: 0,
            message: message.into(),
        }
    }
}

impl QueryOutcome {
    fn from_result(result: Result<Vec<JsonValue>, StoreError>, describe: impl FnOnce(usize) -> String) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                message: describe(data.len()),
                data,
            },
            Err(err) => Self {
                success: false,
                message: err.to_string(),
                data: Vec::new(),
            },
        }
    }
}

/// Per-feed persistence facade. Every operation answers with an envelope;
/// expected failures never escape as errors.
#[derive(Clone)]
pub struct FeedGateway {
    feed: FeedKind,
    store: Arc<dyn FeedStore>,
}

impl FeedGateway {
    pub fn new(feed: FeedKind, store: Arc<dyn FeedStore>) -> Self {
        Self { feed, store }
    }

    pub fn feed(&self) -> FeedKind {
        self.feed
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    fn schema(&self) -> &'static RemoteSchema {
        self.feed.remote_schema()
    }

    pub async fn save(&self, records: &[FeedRecord]) -> SaveOutcome {
        if records.is_empty() {
            return SaveOutcome::failed(format!("No {} data to save", self.feed.display_name()));
        }
        if let Some(stray) = records.iter().find(|r| r.feed != self.feed) {
            return SaveOutcome::failed(format!(
                "record for feed {} passed to the {} gateway",
                stray.feed, self.feed
            ));
        }

        let rows = records.iter().map(FeedRecord::to_row).collect::<Vec<_>>();
        match self.store.insert_rows(self.schema(), rows).await {
            Ok(saved_count) => {
                info!(feed = %self.feed, saved_count, "saved records");
                SaveOutcome {
                    success: true,
                    saved_count,
                    message: format!("Saved {saved_count} {}", self.feed.display_name()),
                }
            }
            Err(err) => {
                error!(feed = %self.feed, error = %err, "saving records failed");
                SaveOutcome::failed(err.to_string())
            }
        }
    }

    pub async fn get_latest(&self) -> QueryOutcome {
        let result = self.store.latest(self.schema()).await;
        if let Err(err) = &result {
            error!(feed = %self.feed, error = %err, "fetching latest rows failed");
        }
        let label = self.feed.display_name();
        QueryOutcome::from_result(result, |n| format!("Retrieved {n} {label}"))
    }

    pub async fn get_history(&self, name: &str, limit: Option<u32>) -> QueryOutcome {
        let limit = limit.filter(|l| *l > 0).unwrap_or(DEFAULT_HISTORY_LIMIT);
        let result = self.store.history(self.schema(), name, limit).await;
        if let Err(err) = &result {
            error!(feed = %self.feed, name, error = %err, "fetching history failed");
        }
        QueryOutcome::from_result(result, |n| format!("Retrieved {n} records for {name}"))
    }

    pub async fn get_by_date_range(&self, start: NaiveDate, end: NaiveDate) -> QueryOutcome {
        let result = self.store.by_date_range(self.schema(), start, end).await;
        if let Err(err) = &result {
            error!(feed = %self.feed, %start, %end, error = %err, "fetching date range failed");
        }
        QueryOutcome::from_result(result, |n| format!("Retrieved {n} records"))
    }

    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> CleanupOutcome {
        match self.store.cleanup_older_than(self.schema(), days_to_keep).await {
            Ok(deleted) => {
                info!(feed = %self.feed, deleted, days_to_keep, "cleaned up old rows");
                CleanupOutcome {
                    success: true,
                    message: format!("Deleted {deleted} old records"),
                    deleted,
                }
            }
            Err(err) => {
                error!(feed = %self.feed, error = %err, "cleanup failed");
                CleanupOutcome {
                    success: false,
                    message: err.to_string(),
                    deleted: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn gateway(feed: FeedKind) -> (FeedGateway, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (FeedGateway::new(feed, store.clone()), store)
    }

    fn record(name: &str, last: f64, minutes_ago: i64) -> FeedRecord {
        FeedRecord::new(
            FeedKind::UsIndices,
            name,
            Utc::now() - ChronoDuration::minutes(minutes_ago),
        )
        .with_metric("last", Some(last))
    }

    #[test]
    fn browser_profiles_differ_only_in_language() {
        let en = BrowserProfile::english();
        let pt = BrowserProfile::brazilian_portuguese();
        assert_eq!(en.user_agent, pt.user_agent);
        assert!(pt.accept_language.starts_with("pt-BR"));
        let headers = en.headers();
        assert_eq!(headers[header::ACCEPT_LANGUAGE], "en-US,en;q=0.5");
        assert_eq!(headers[header::UPGRADE_INSECURE_REQUESTS], "1");
        assert_eq!(headers.len(), 6);
    }

    #[tokio::test]
    async fn save_rejects_empty_batches() {
        let (gw, _) = gateway(FeedKind::UsIndices);
        let outcome = gw.save(&[]).await;
        assert!(!outcome.success);
        assert_eq!(outcome.saved_count, 0);
    }

    #[tokio::test]
    async fn save_rejects_records_from_another_feed() {
        let (gw, store) = gateway(FeedKind::Currencies);
        let outcome = gw.save(&[record("Dow Jones", 1.0, 0)]).await;
        assert!(!outcome.success);
        assert_eq!(store.row_count("currencies"), 0);
    }

    #[tokio::test]
    async fn latest_returns_newest_row_per_name() {
        let (gw, _) = gateway(FeedKind::UsIndices);
        let saved = gw
            .save(&[
                record("Dow Jones", 1.0, 10),
                record("Dow Jones", 2.0, 1),
                record("Nasdaq", 3.0, 5),
            ])
            .await;
        assert!(saved.success);
        assert_eq!(saved.saved_count, 3);

        let latest = gw.get_latest().await;
        assert!(latest.success);
        assert_eq!(latest.data.len(), 2);
        let dow = latest.data.iter().find(|r| r["name"] == "Dow Jones").unwrap();
        assert_eq!(dow["last"], serde_json::json!(2.0));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_bounded() {
        let (gw, _) = gateway(FeedKind::UsIndices);
        let batch = (0..5).map(|i| record("Dow Jones", i as f64, i)).collect::<Vec<_>>();
        assert!(gw.save(&batch).await.success);

        let history = gw.get_history("Dow Jones", Some(3)).await;
        assert!(history.success);
        let lasts = history.data.iter().map(|r| r["last"].as_f64().unwrap()).collect::<Vec<_>>();
        assert_eq!(lasts, vec![0.0, 1.0, 2.0]);

        let defaulted = gw.get_history("Dow Jones", Some(0)).await;
        assert_eq!(defaulted.data.len(), 5);
    }

    #[tokio::test]
    async fn date_range_is_inclusive_of_both_days() {
        let (gw, _) = gateway(FeedKind::UsIndices);
        let at = |d: u32, h: u32| Utc.with_ymd_and_hms(2026, 3, d, h, 0, 0).single().unwrap();
        let rows = [(1, 23), (2, 0), (3, 23), (4, 0)]
            .into_iter()
            .map(|(d, h)| FeedRecord::new(FeedKind::UsIndices, "Dow Jones", at(d, h)).with_metric("last", Some(d as f64)))
            .collect::<Vec<_>>();
        assert!(gw.save(&rows).await.success);

        let start = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let end = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();
        let ranged = gw.get_by_date_range(start, end).await;
        assert!(ranged.success);
        assert_eq!(ranged.data.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_deletes_only_expired_rows() {
        let (gw, store) = gateway(FeedKind::UsIndices);
        let old = FeedRecord::new(FeedKind::UsIndices, "Dow Jones", Utc::now() - ChronoDuration::days(20))
            .with_metric("last", Some(1.0));
        assert!(gw.save(&[old, record("Dow Jones", 2.0, 0)]).await.success);

        let outcome = gw.cleanup_old_data(15).await;
        assert!(outcome.success);
        assert_eq!(outcome.deleted, 1);
        assert_eq!(store.row_count("us_indices"), 1);
    }
}

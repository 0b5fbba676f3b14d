//! JSON API over the feed gateways and job status.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, SecondsFormat, Utc};
use mfeed_core::FeedKind;
use mfeed_storage::{FeedGateway, QueryOutcome};
use mfeed_sync::{FeedJob, JobStatus, Services};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{self, CorsLayer};
use tracing::{error, info};

pub const CRATE_NAME: &str = "mfeed-web";

pub type AppState = Arc<Services>;

pub fn app(services: AppState) -> Router {
    let routes = Router::new()
        .route("/", get(index_handler))
        .route("/api/health", get(health_handler))
        .route("/api/cleanup/cron/status", get(cleanup_status_handler))
        .route("/api/cleanup/cron/trigger", post(cleanup_trigger_handler))
        .route("/api/{feed}/latest", get(latest_handler))
        .route("/api/{feed}/history/{name}", get(history_handler))
        .route("/api/{feed}/range", get(range_handler))
        .route("/api/{feed}/cron/status", get(feed_status_handler))
        .route("/api/{feed}/cron/trigger", post(feed_trigger_handler))
        .fallback(not_found_handler)
        .with_state(services);
    with_middleware(routes)
}

/// Panics become JSON 500s; CORS sits outermost so every answer carries it.
fn with_middleware(router: Router) -> Router {
    let cors_layer = CorsLayer::new()
        .allow_origin(cors::Any)
        .allow_methods(cors::Any)
        .allow_headers(cors::Any);
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors_layer)
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "handler panicked");
    failure(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

/// [`Path`] with its rejection rendered as the JSON envelope.
struct ApiPath<T>(T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Path::<T>::from_request_parts(parts, state)
            .await
            .map(|Path(value)| ApiPath(value))
            .map_err(|rejection| failure(rejection.status(), rejection.body_text()))
    }
}

/// [`Query`] with its rejection rendered as the JSON envelope.
struct ApiQuery<T>(T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Query::<T>::from_request_parts(parts, state)
            .await
            .map(|Query(value)| ApiQuery(value))
            .map_err(|rejection| failure(rejection.status(), rejection.body_text()))
    }
}

/// Binds `0.0.0.0:port` and serves until `shutdown` resolves.
pub async fn serve(
    services: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "api listening");
    axum::serve(listener, app(services))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn reply(status: StatusCode, body: JsonValue) -> Response {
    (status, Json(body)).into_response()
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    reply(status, json!({ "success": false, "message": message.into() }))
}

fn query_reply(outcome: QueryOutcome) -> Response {
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(outcome)).into_response()
}

fn gateway<'a>(services: &'a Services, slug: &str) -> Result<&'a FeedGateway, Response> {
    slug.parse::<FeedKind>()
        .ok()
        .and_then(|feed| services.gateway(feed))
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, format!("unknown feed `{slug}`")))
}

fn feed_job<'a>(services: &'a Services, slug: &str) -> Result<&'a Arc<FeedJob>, Response> {
    let feed = slug
        .parse::<FeedKind>()
        .map_err(|err| failure(StatusCode::NOT_FOUND, err.to_string()))?;
    services
        .job(feed)
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, format!("{feed} is disabled; no job is scheduled")))
}

fn status_reply(status: JobStatus) -> Response {
    match serde_json::to_value(status) {
        Ok(JsonValue::Object(mut body)) => {
            body.insert("success".into(), JsonValue::Bool(true));
            reply(StatusCode::OK, JsonValue::Object(body))
        }
        Ok(_) => failure(StatusCode::INTERNAL_SERVER_ERROR, "job status is not an object"),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn trigger_reply(job: &str, started: bool) -> Response {
    if started {
        reply(
            StatusCode::ACCEPTED,
            json!({ "success": true, "message": format!("Manual {job} run triggered") }),
        )
    } else {
        failure(
            StatusCode::CONFLICT,
            format!("{job} run already in progress; trigger skipped"),
        )
    }
}

async fn index_handler() -> Json<JsonValue> {
    let feeds = FeedKind::ALL
        .into_iter()
        .map(|feed| {
            let slug = feed.slug();
            (
                slug.to_string(),
                json!({
                    "name": feed.display_name(),
                    "latest": format!("/api/{slug}/latest"),
                    "history": format!("/api/{slug}/history/{{name}}?limit=N"),
                    "range": format!("/api/{slug}/range?start=YYYY-MM-DD&end=YYYY-MM-DD"),
                    "cron_status": format!("/api/{slug}/cron/status"),
                    "cron_trigger": format!("/api/{slug}/cron/trigger"),
                }),
            )
        })
        .collect::<serde_json::Map<_, _>>();
    Json(json!({
        "message": "Market feed API",
        "endpoints": {
            "health": "/api/health",
            "feeds": feeds,
            "cleanup": {
                "cron_status": "/api/cleanup/cron/status",
                "cron_trigger": "/api/cleanup/cron/trigger",
            },
        },
    }))
}

async fn health_handler(State(services): State<AppState>) -> Json<JsonValue> {
    Json(json!({
        "status": "OK",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "backend": services.backend(),
    }))
}

async fn latest_handler(State(services): State<AppState>, ApiPath(feed): ApiPath<String>) -> Response {
    match gateway(&services, &feed) {
        Ok(gw) => query_reply(gw.get_latest().await),
        Err(resp) => resp,
    }
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    limit: Option<String>,
}

async fn history_handler(
    State(services): State<AppState>,
    ApiPath((feed, name)): ApiPath<(String, String)>,
    ApiQuery(query): ApiQuery<HistoryQuery>,
) -> Response {
    let gw = match gateway(&services, &feed) {
        Ok(gw) => gw,
        Err(resp) => return resp,
    };
    // unparsable limits fall back to the gateway default
    let limit = query.limit.and_then(|l| l.trim().parse::<u32>().ok());
    query_reply(gw.get_history(&name, limit).await)
}

#[derive(Debug, Deserialize, Default)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

fn parse_day(label: &str, value: &str) -> Result<NaiveDate, Response> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        failure(
            StatusCode::BAD_REQUEST,
            format!("{label} must be a date in YYYY-MM-DD format, got `{value}`"),
        )
    })
}

async fn range_handler(
    State(services): State<AppState>,
    ApiPath(feed): ApiPath<String>,
    ApiQuery(query): ApiQuery<RangeQuery>,
) -> Response {
    let gw = match gateway(&services, &feed) {
        Ok(gw) => gw,
        Err(resp) => return resp,
    };
    let (Some(start), Some(end)) = (query.start, query.end) else {
        return failure(StatusCode::BAD_REQUEST, "Both start and end dates are required");
    };
    let dates = parse_day("start", &start).and_then(|s| Ok((s, parse_day("end", &end)?)));
    match dates {
        Ok((start, end)) => query_reply(gw.get_by_date_range(start, end).await),
        Err(resp) => resp,
    }
}

async fn feed_status_handler(State(services): State<AppState>, ApiPath(feed): ApiPath<String>) -> Response {
    match feed_job(&services, &feed) {
        Ok(job) => status_reply(job.status()),
        Err(resp) => resp,
    }
}

async fn feed_trigger_handler(State(services): State<AppState>, ApiPath(feed): ApiPath<String>) -> Response {
    match feed_job(&services, &feed) {
        Ok(job) => trigger_reply(job.feed().slug(), job.spawn_manual_run()),
        Err(resp) => resp,
    }
}

async fn cleanup_status_handler(State(services): State<AppState>) -> Response {
    status_reply(services.retention.status())
}

async fn cleanup_trigger_handler(State(services): State<AppState>) -> Response {
    trigger_reply("cleanup", services.retention.spawn_manual_run())
}

async fn not_found_handler() -> Response {
    failure(StatusCode::NOT_FOUND, "Route not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{Duration, TimeZone};
    use http_body_util::BodyExt;
    use mfeed_adapters::feed_spec;
    use mfeed_core::FeedRecord;
    use mfeed_storage::{HttpClientConfig, HttpFetcher, MemoryStore};
    use mfeed_sync::{
        FeedPipeline, JobSchedule, PipelineReport, ResolvedFeed, RetentionJob, RetentionSettings,
        TickOutcome,
    };
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn memory_services(enabled: bool) -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let feeds = FeedKind::ALL
            .into_iter()
            .map(|feed| ResolvedFeed {
                feed,
                enabled,
                schedule: JobSchedule::default_for(feed),
            })
            .collect::<Vec<_>>();
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let services = Services::assemble(
            store.clone(),
            fetcher,
            &feeds,
            RetentionSettings::default(),
            |feed| feed_spec(feed).with_url("http://127.0.0.1:9/unreachable"),
        );
        (Arc::new(services), store)
    }

    async fn seed_us(services: &Services) {
        let gw = services.gateway(FeedKind::UsIndices).unwrap();
        let base = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();
        let records = [
            FeedRecord::new(FeedKind::UsIndices, "Dow Jones", base - Duration::days(1))
                .with_metric("last", Some(34800.0)),
            FeedRecord::new(FeedKind::UsIndices, "Dow Jones", base).with_metric("last", Some(35000.5)),
            FeedRecord::new(FeedKind::UsIndices, "Nasdaq", base).with_metric("last", Some(16200.25)),
        ];
        assert!(gw.save(&records).await.success);
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn index_and_health_respond() {
        let (services, _) = memory_services(true);
        let (status, body) = call(app(services.clone()), "GET", "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["endpoints"]["feeds"]["commodities"]["latest"],
            "/api/commodities/latest"
        );

        let (status, body) = call(app(services), "GET", "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert_eq!(body["backend"], "memory");
        assert!(body["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn latest_returns_one_row_per_name() {
        let (services, _) = memory_services(true);
        seed_us(&services).await;
        let (status, body) = call(app(services), "GET", "/api/us-indices/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let rows = body["data"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        let dow = rows.iter().find(|r| r["name"] == "Dow Jones").unwrap();
        assert_eq!(dow["last"].as_f64(), Some(35000.5));
    }

    #[tokio::test]
    async fn history_honours_limit_and_ignores_garbage() {
        let (services, _) = memory_services(true);
        seed_us(&services).await;

        let (status, body) =
            call(app(services.clone()), "GET", "/api/us-indices/history/Dow%20Jones?limit=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["last"].as_f64(), Some(35000.5));

        let (status, body) =
            call(app(services), "GET", "/api/us-indices/history/Dow%20Jones?limit=lots").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn range_validates_its_dates() {
        let (services, _) = memory_services(true);
        seed_us(&services).await;

        let (status, body) = call(app(services.clone()), "GET", "/api/us-indices/range?start=2026-03-01").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Both start and end dates are required");

        let (status, body) =
            call(app(services.clone()), "GET", "/api/us-indices/range?start=2026-03-01&end=03/02/2026").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().starts_with("end must be a date"));

        let (status, body) =
            call(app(services), "GET", "/api/us-indices/range?start=2026-03-02&end=2026-03-02").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_feeds_and_routes_are_json_404s() {
        let (services, _) = memory_services(true);
        let (status, body) = call(app(services.clone()), "GET", "/api/bonds/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (status, body) = call(app(services), "GET", "/api/us-indices/nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "Route not found");
    }

    #[tokio::test]
    async fn cron_status_reports_schedule_and_idle_state() {
        let (services, _) = memory_services(true);
        let (status, body) = call(app(services.clone()), "GET", "/api/commodities/cron/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["job"], "commodities");
        assert_eq!(body["schedule"], "0 */5 * * * *");
        assert_eq!(body["timezone"], "America/Sao_Paulo");
        assert_eq!(body["is_running"], false);
        assert_eq!(body["run_count"], 0);
        assert_eq!(body["next_run_in"], "within 5 minutes");

        let (status, body) = call(app(services), "GET", "/api/cleanup/cron/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"], "cleanup");
        assert_eq!(body["next_run_in"], "daily at 01:00 UTC");
    }

    #[tokio::test]
    async fn disabled_feed_has_data_but_no_job() {
        let (services, _) = memory_services(false);
        let (status, _) = call(app(services.clone()), "GET", "/api/currencies/latest").await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(app(services), "POST", "/api/currencies/cron/trigger").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("disabled"));
    }

    struct GatedPipeline {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl FeedPipeline for GatedPipeline {
        fn feed(&self) -> FeedKind {
            FeedKind::Currencies
        }

        async fn run(&self) -> anyhow::Result<PipelineReport> {
            self.started.notify_one();
            self.release.notified().await;
            anyhow::bail!("released")
        }
    }

    #[tokio::test]
    async fn trigger_is_skipped_while_a_run_is_in_flight() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let gateways = FeedKind::ALL
            .into_iter()
            .map(|feed| (feed, FeedGateway::new(feed, store.clone())))
            .collect::<BTreeMap<_, _>>();
        let pipeline = Arc::new(GatedPipeline {
            started: Notify::new(),
            release: Notify::new(),
        });
        let job = Arc::new(FeedJob::new(
            JobSchedule::default_for(FeedKind::Currencies),
            pipeline.clone(),
        ));
        let services = Arc::new(Services {
            retention: Arc::new(RetentionJob::new(
                gateways.values().cloned().collect(),
                15,
                JobSchedule::retention_default(),
            )),
            gateways,
            jobs: BTreeMap::from([(FeedKind::Currencies, job.clone())]),
        });

        let running = tokio::spawn({
            let job = job.clone();
            async move { job.tick().await }
        });
        pipeline.started.notified().await;

        let (status, body) = call(app(services.clone()), "POST", "/api/currencies/cron/trigger").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (_, body) = call(app(services), "GET", "/api/currencies/cron/status").await;
        assert_eq!(body["is_running"], true);
        assert_eq!(body["next_run_in"], "running now");
        assert_eq!(body["run_count"], 1);
        assert_eq!(body["skipped_count"], 1);

        pipeline.release.notify_one();
        assert!(matches!(running.await.unwrap(), TickOutcome::Completed(_)));
        assert!(!job.status().state.is_running);
    }

    #[tokio::test]
    async fn cross_origin_requests_are_allowed() {
        let (services, _) = memory_services(true);
        let resp = app(services.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/us-indices/latest")
                    .header("origin", "http://dashboard.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");

        let preflight = app(services)
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/us-indices/cron/trigger")
                    .header("origin", "http://dashboard.example")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(preflight.status().is_success());
        assert_eq!(preflight.headers()["access-control-allow-origin"], "*");
        assert!(preflight.headers().contains_key("access-control-allow-methods"));
    }

    #[tokio::test]
    async fn extractor_rejections_use_the_json_envelope() {
        let (services, _) = memory_services(true);
        let (status, body) = call(
            app(services.clone()),
            "GET",
            "/api/us-indices/history/Dow?limit=1&limit=2",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("limit"));

        let (status, body) = call(app(services), "GET", "/api/%FF/latest").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn handler_panics_become_json_500s() {
        async fn explode() -> &'static str {
            panic!("handler bug")
        }
        let router = with_middleware(Router::new().route("/explode", get(explode)));
        let (status, body) = call(router, "GET", "/explode").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Internal server error");
    }

    #[tokio::test]
    async fn cleanup_trigger_runs_in_background() {
        let (services, _) = memory_services(true);
        let (status, body) = call(app(services.clone()), "POST", "/api/cleanup/cron/trigger").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);
        assert_eq!(services.retention.status().state.run_count, 1);
    }
}

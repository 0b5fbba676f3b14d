use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mfeed_adapters::{extract_rows, feed_spec, fixture_page_path, load_fixture_page};
use mfeed_core::{FeedKind, RunStatus};
use mfeed_storage::{HttpClientConfig, HttpFetcher};
use mfeed_sync::{load_registry, Services, SyncConfig, TickOutcome};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod table;

#[derive(Debug, Parser)]
#[command(name = "mfeed-cli")]
#[command(about = "Market feed scraper: scheduled scrapes, retention and the JSON API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// API server plus the scheduler (default).
    Serve,
    /// Fetch and print one feed without saving.
    Scrape {
        feed: FeedKind,
        /// Read a saved page instead of fetching. With no value, uses the
        /// feed's sample under fixtures/.
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        fixture: Option<PathBuf>,
    },
    /// One guarded run of a feed, saved to the store.
    Run { feed: FeedKind },
    /// One retention pass over every feed table.
    Cleanup,
    /// Effective feed schedules after feeds.yaml.
    Feeds,
    /// Apply migrations/ to DATABASE_URL.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mfeed=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Scrape { feed, fixture } => scrape(&config, feed, fixture).await?,
        Commands::Run { feed } => run_feed(&config, feed).await?,
        Commands::Cleanup => cleanup(&config).await?,
        Commands::Feeds => list_feeds(&config)?,
        Commands::Migrate => migrate(&config).await?,
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn serve(config: SyncConfig) -> Result<()> {
    let services = Arc::new(Services::from_config(&config)?);
    info!(backend = services.backend(), feeds = services.jobs.len(), "services ready");

    let scheduler = if config.scheduler_enabled {
        Some(services.start_scheduler().await?)
    } else {
        warn!("scheduler disabled; only manual triggers will run");
        None
    };
    if config.run_on_start {
        services.run_startup_scrapes();
    }

    mfeed_web::serve(Arc::clone(&services), config.web_port, shutdown_signal()).await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await?;
    }
    Ok(())
}

async fn scrape(config: &SyncConfig, feed: FeedKind, fixture: Option<PathBuf>) -> Result<()> {
    let spec = feed_spec(feed);
    let html = match fixture {
        Some(path) if path.as_os_str().is_empty() => {
            load_fixture_page(fixture_page_path(&config.workspace_root, feed))?
        }
        Some(path) => load_fixture_page(path)?,
        None => {
            let fetcher = HttpFetcher::new(HttpClientConfig {
                timeout: std::time::Duration::from_secs(config.http_timeout_secs),
                ..Default::default()
            })?;
            fetcher
                .fetch_html(feed, &spec.url, &spec.profile)
                .await
                .with_context(|| format!("fetching {feed} page"))?
        }
    };
    let extraction = extract_rows(&html, &spec).with_context(|| format!("extracting {feed} rows"))?;
    print!("{}", table::render_records(&spec, &extraction.records));
    println!(
        "rows seen {}, skipped {}, dropped {}",
        extraction.rows_seen, extraction.rows_skipped, extraction.rows_dropped
    );
    Ok(())
}

async fn run_feed(config: &SyncConfig, feed: FeedKind) -> Result<()> {
    let services = Services::from_config(config)?;
    let Some(job) = services.job(feed) else {
        bail!("{feed} is disabled in {}", config.registry_path().display());
    };
    let TickOutcome::Completed(outcome) = job.trigger_manual_run().await else {
        bail!("{feed} run already in progress");
    };
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if outcome.status == RunStatus::Failed {
        bail!("{feed} run failed");
    }
    Ok(())
}

async fn cleanup(config: &SyncConfig) -> Result<()> {
    let services = Services::from_config(config)?;
    let TickOutcome::Completed(report) = services.retention.trigger_manual_run().await else {
        bail!("cleanup already in progress");
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status == RunStatus::Failed {
        bail!("cleanup failed for every feed");
    }
    Ok(())
}

fn list_feeds(config: &SyncConfig) -> Result<()> {
    let registry = load_registry(config.registry_path())?;
    for resolved in registry.resolve_feeds()? {
        println!(
            "{:<15} {:<8} {:<16} {:<20} {}",
            resolved.feed.slug(),
            if resolved.enabled { "enabled" } else { "disabled" },
            resolved.schedule.cron,
            resolved.schedule.timezone.name(),
            feed_spec(resolved.feed).url
        );
    }
    let retention = registry.resolve_retention(config)?;
    println!(
        "{:<15} {:<8} {:<16} {:<20} keep {} days",
        "cleanup",
        "enabled",
        retention.schedule.cron,
        retention.schedule.timezone.name(),
        retention.days_to_keep
    );
    Ok(())
}

async fn migrate(config: &SyncConfig) -> Result<()> {
    let url = config
        .database_write_url
        .as_deref()
        .or(config.database_url.as_deref())
        .context("DATABASE_URL is required for migrate")?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(url)
        .await
        .context("connecting to postgres")?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

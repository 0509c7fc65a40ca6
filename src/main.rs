//! idmap - operator CLI for the identity mapping cache
//!
//! - `status`: staleness breakdown of the snapshot
//! - `refresh`: batch-refresh stale mappings against the source system

use anyhow::Context;
use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use idmap_cache::cache::{classify, IdentityCache, SnapshotFile, StaleReason};
use idmap_cache::config::{CacheConfig, RawConfig};
use idmap_cache::metrics::create_metrics;
use idmap_cache::services::identity::HttpIdentitySource;
use idmap_cache::services::local::{DirectoryResolver, LocalResolver, NoopResolver};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// idmap - staleness-aware identity mapping cache
#[derive(Parser, Debug)]
#[command(name = "idmap")]
#[command(author, version, about = "Staleness-aware identity mapping cache", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, global = true)]
    json_logs: bool,

    /// JSON config file; IDMAP_* environment variables take precedence
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print how many cached mappings are fresh or stale, and why
    Status,
    /// Refresh stale mappings and print the batch report as JSON
    Refresh(RefreshArgs),
}

#[derive(ClapArgs, Debug)]
struct RefreshArgs {
    /// Source system base URL (falls back to IDMAP_SOURCE_URL)
    #[arg(long)]
    source_url: Option<String>,

    /// Bearer token for the source system (falls back to IDMAP_SOURCE_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// JSON file mapping local emails to local user ids
    #[arg(long)]
    directory: Option<PathBuf>,

    /// Refresh at most this many stale mappings
    #[arg(long)]
    limit: Option<usize>,

    /// Retry override for this batch
    #[arg(long)]
    max_retries: Option<u32>,

    /// Print Prometheus metrics after the report
    #[arg(long)]
    metrics: bool,

    /// Usernames to check; every cached mapping when empty
    usernames: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first so IDMAP_* variables are visible to the config
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting idmap v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Status => status(&config).await,
        Command::Refresh(refresh_args) => refresh(config, refresh_args).await,
    }
}

fn load_config(file: Option<&PathBuf>) -> anyhow::Result<CacheConfig> {
    let mut raw = RawConfig::from_env()?;
    if let Some(path) = file {
        raw = raw.or(RawConfig::from_file(path)?);
    }
    let config = raw.build().context("invalid configuration")?;

    info!(
        refresh_interval_secs = config.refresh_interval.as_secs(),
        fallback = %config.fallback,
        max_concurrent_refreshes = config.max_concurrent_refreshes,
        snapshot = ?config.snapshot_path,
        "Configuration loaded"
    );
    Ok(config)
}

async fn status(config: &CacheConfig) -> anyhow::Result<()> {
    let Some(path) = &config.snapshot_path else {
        anyhow::bail!("no snapshot configured (set IDMAP_SNAPSHOT_PATH or snapshot_path)");
    };

    let records = SnapshotFile::new(path.clone())
        .load(Utc::now())
        .await
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;

    let now = Utc::now();
    let mut counts: BTreeMap<StaleReason, usize> = BTreeMap::new();
    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in records.values() {
        *counts
            .entry(classify(Some(record), now, config.refresh_interval))
            .or_insert(0) += 1;
        *by_status.entry(record.status.as_str()).or_insert(0) += 1;
    }

    let stale: usize = counts
        .iter()
        .filter(|(reason, _)| reason.is_stale())
        .map(|(_, count)| count)
        .sum();

    println!("Snapshot: {}", path.display());
    println!("Mappings: {} ({} stale)", records.len(), stale);
    for (reason, count) in &counts {
        println!("  {:<18} {}", reason.as_str(), count);
    }
    println!("By status:");
    for (status, count) in &by_status {
        println!("  {:<18} {}", status, count);
    }
    Ok(())
}

async fn refresh(config: CacheConfig, args: RefreshArgs) -> anyhow::Result<()> {
    let source_url = args
        .source_url
        .or_else(|| std::env::var("IDMAP_SOURCE_URL").ok())
        .context("no source URL (use --source-url or IDMAP_SOURCE_URL)")?;
    let token = args
        .token
        .or_else(|| std::env::var("IDMAP_SOURCE_TOKEN").ok());

    if config.snapshot_path.is_none() {
        warn!("No snapshot configured, refreshed mappings will not be saved");
    }

    let resolver: Arc<dyn LocalResolver> = match &args.directory {
        Some(path) => Arc::new(DirectoryResolver::load_from_file(path)?),
        None => {
            info!("No local directory given, new mappings stay unmapped");
            Arc::new(NoopResolver)
        }
    };

    let metrics = create_metrics()?;
    let source = Arc::new(HttpIdentitySource::new(&source_url, token));
    let cache = Arc::new(IdentityCache::open(config, source, resolver, metrics.clone()).await);

    // Ctrl-C stops new lookups; the batch then finishes with what it has
    let signal_cache = cache.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight lookups and saving");
            signal_cache.close();
        }
    });

    let usernames = (!args.usernames.is_empty()).then_some(args.usernames);
    let report = cache
        .batch_refresh(usernames, args.max_retries, args.limit)
        .await;

    let staleness: BTreeMap<&'static str, usize> = cache
        .staleness_report(Utc::now())
        .await
        .into_iter()
        .map(|(reason, count)| (reason.as_str(), count))
        .collect();

    let output = json!({
        "report": report,
        "table": {
            "mappings": cache.len().await,
            "staleness": staleness,
        },
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    cache
        .shutdown()
        .await
        .context("failed to save mapping snapshot")?;
    info!("idmap shutdown complete");

    if args.metrics {
        print!("{}", metrics.render());
    }
    Ok(())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    // Logs go to stderr so the JSON report on stdout stays parseable
    let filter = EnvFilter::new(format!(
        "idmap={level},idmap_cache={level},reqwest=warn,hyper=warn"
    ));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    Ok(())
}

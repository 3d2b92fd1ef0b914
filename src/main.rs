//! CLI entry point for the transit vehicle-position tracker.
//!
//! `ingest` polls the feed and publishes positions to the stream log,
//! `persist` consumes the log into PostgreSQL, and `run` does both in one
//! process. `decode` and `init-db` are one-shot helpers.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_tracker::{
    codec::{SchemaVersion, codec_for},
    config::{ConsumerArgs, FeedArgs, StoreArgs, StreamArgs},
    consumer::Consumer,
    fetch::{BasicClient, build_client, load_feed},
    output::append_positions,
    poller::FeedPoller,
    publisher::Publisher,
    store::{PgStore, create_pool},
    stream::{JetStreamLog, MemoryStreamLog, StreamLog},
};

#[derive(Parser)]
#[command(name = "transit_tracker")]
#[command(about = "Ingest GTFS-Realtime vehicle positions into PostgreSQL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the feed and publish positions to the stream log
    Ingest {
        #[command(flatten)]
        feed: FeedArgs,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Consume positions from the stream log and upsert them into the store
    Persist {
        #[command(flatten)]
        stream: StreamArgs,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        consumer: ConsumerArgs,
    },
    /// Ingest and persist in one process
    Run {
        #[command(flatten)]
        feed: FeedArgs,
        #[command(flatten)]
        stream: StreamArgs,
        #[command(flatten)]
        store: StoreArgs,
        #[command(flatten)]
        consumer: ConsumerArgs,

        /// Use an in-process stream log instead of NATS (not durable)
        #[arg(long, default_value_t = false)]
        in_memory_log: bool,
    },
    /// Decode a feed from a file or URL and append its positions to a CSV file
    Decode {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        /// CSV file to append results to
        #[arg(short, long, default_value = "positions.csv")]
        output: String,

        #[arg(long, value_enum, default_value_t = SchemaVersion::V2)]
        schema: SchemaVersion,
    },
    /// Create the store tables if they are missing
    InitDb {
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/transit_tracker.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("transit_tracker.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest { feed, stream } => {
            let log = connect_log(&stream).await?;
            let shutdown = spawn_shutdown_listener();
            build_poller(&feed, &stream, log)?.run(shutdown).await;
        }
        Commands::Persist {
            stream,
            store,
            consumer,
        } => {
            let log = connect_log(&stream).await?;
            let pg = connect_store(&store).await?;
            let config = consumer.consumer_config(&stream)?;
            let shutdown = spawn_shutdown_listener();
            Consumer::new(log, pg, config).run(shutdown).await?;
        }
        Commands::Run {
            feed,
            stream,
            store,
            consumer,
            in_memory_log,
        } => {
            let log: Arc<dyn StreamLog> = if in_memory_log {
                warn!("Using in-memory stream log; unconsumed positions are lost on exit");
                Arc::new(MemoryStreamLog::new())
            } else {
                connect_log(&stream).await?
            };
            let pg = connect_store(&store).await?;
            let poller = build_poller(&feed, &stream, Arc::clone(&log))?;
            let consumer = Consumer::new(log, pg, consumer.consumer_config(&stream)?);

            let shutdown = spawn_shutdown_listener();
            let (_, consumed) = tokio::join!(poller.run(shutdown.clone()), consumer.run(shutdown));
            consumed?;
        }
        Commands::Decode {
            source,
            output,
            schema,
        } => {
            decode(&source, &output, schema).await?;
        }
        Commands::InitDb { store } => {
            connect_store(&store).await?;
        }
    }

    Ok(())
}

/// Decodes one feed and appends the positions to `output`.
#[tracing::instrument(fields(source = %source))]
async fn decode(source: &str, output: &str, schema: SchemaVersion) -> Result<()> {
    let client = BasicClient::new();
    let bytes = load_feed(&client, source)
        .await
        .with_context(|| format!("loading feed from {source}"))?;
    let decoded = codec_for(schema)
        .decode(&bytes, Utc::now())
        .context("decoding feed")?;

    for e in &decoded.errors {
        warn!(error = %e, "Skipped feed entity");
    }
    append_positions(output, &decoded.positions)?;

    info!(
        header_version = %decoded.header_version,
        positions = decoded.positions.len(),
        entity_errors = decoded.errors.len(),
        ignored = decoded.ignored,
        output,
        "Feed decoded"
    );
    Ok(())
}

async fn connect_log(stream: &StreamArgs) -> Result<Arc<dyn StreamLog>> {
    let log = JetStreamLog::connect(&stream.nats_url, stream.retention()?).await?;
    log.ensure_stream(&stream.topic()?).await?;
    Ok(Arc::new(log))
}

/// Opens the pool and makes sure the tables exist.
async fn connect_store(store: &StoreArgs) -> Result<Arc<PgStore>> {
    let pool = create_pool(&store.store_config()?)?;
    let pg = PgStore::new(pool);
    pg.ensure_schema().await.context("ensuring store schema")?;
    Ok(Arc::new(pg))
}

fn build_poller(feed: &FeedArgs, stream: &StreamArgs, log: Arc<dyn StreamLog>) -> Result<FeedPoller> {
    let client = build_client(feed.auth(), feed.fetch_timeout()?)?;
    let publisher = Arc::new(Publisher::new(log, feed.publisher_config(stream)?));
    Ok(FeedPoller::new(
        client,
        codec_for(feed.feed_schema),
        publisher,
        feed.poller_config()?,
    ))
}

/// Flips the returned receiver to `true` on SIGTERM or ctrl-c.
fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = tx.send(true);
        // Receivers treat a dropped sender as shutdown too; keep it alive
        // until the process exits.
        std::future::pending::<()>().await;
    });
    rx
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = tokio::signal::ctrl_c() => info!("ctrl-c received"),
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, waiting for ctrl-c only");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}

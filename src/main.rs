//! QuerySync Daemon
//!
//! Runs a sync engine fed by a JSON-lines push stream and exposes its
//! metrics over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         querysync                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  JSON-lines  │───▶│    Local     │───▶│   Realtime   │       │
//! │  │     feed     │    │  transport   │    │    bridge    │       │
//! │  └──────────────┘    └──────────────┘    └──────┬───────┘       │
//! │                                                 ▼               │
//! │  ┌──────────────┐                        ┌──────────────┐       │
//! │  │   /metrics   │◀───────────────────────│  CacheStore  │       │
//! │  └──────────────┘                        └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use querysync::adapters::{feed, PrometheusExporter};
use querysync::{EngineConfig, SyncEngine, UpdateStrategy};

// =============================================================================
// CLI Arguments
// =============================================================================

/// QuerySync - client-side data synchronization engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML engine configuration
    #[arg(long, env = "QUERYSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the expiry sweep interval
    #[arg(long, env = "SWEEP_INTERVAL_SECONDS")]
    sweep_interval_seconds: Option<u64>,

    /// Metrics and health endpoint address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Bind a cache key to push topics: KEY=TOPIC[,TOPIC][:STRATEGY]
    #[arg(long = "bind", value_name = "BINDING")]
    bindings: Vec<String>,

    /// Push feed (JSON lines); "-" reads stdin
    #[arg(long, default_value = "-")]
    feed: String,

    /// Print the cache as JSON and exit when the feed ends
    #[arg(long)]
    exit_on_eof: bool,
}

/// A parsed `--bind` argument.
#[derive(Debug, PartialEq)]
struct Binding {
    key: String,
    topics: Vec<String>,
    strategy: UpdateStrategy,
}

impl Binding {
    /// The strategy suffix is optional; topic patterns may themselves
    /// contain `:`, so only a recognised strategy name is split off.
    fn parse(raw: &str) -> anyhow::Result<Self> {
        let Some((key, rest)) = raw.split_once('=') else {
            bail!("binding '{}' is missing '='", raw);
        };
        let (topics, strategy) = match rest.rsplit_once(':') {
            Some((topics, name)) => match name.parse::<UpdateStrategy>() {
                Ok(strategy) => (topics, strategy),
                Err(_) => (rest, UpdateStrategy::Replace),
            },
            None => (rest, UpdateStrategy::Replace),
        };

        let topics: Vec<String> = topics
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        if key.trim().is_empty() || topics.is_empty() {
            bail!("binding '{}' needs a key and at least one topic", raw);
        }

        Ok(Self {
            key: key.trim().to_string(),
            topics,
            strategy,
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    info!("Starting QuerySync");

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(seconds) = args.sweep_interval_seconds {
        config = config.with_sweep_interval(Duration::from_secs(seconds));
    }
    info!("  Sweep interval: {:?}", config.sweep_interval());
    info!("  Default strategy: {}", config.default_strategy);
    info!("  Key classes: {}", config.key_classes.len());

    let bindings = args
        .bindings
        .iter()
        .map(|raw| Binding::parse(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let (engine, transport) = SyncEngine::with_local_transport(config)?;
    engine.start_sweeper();

    for binding in &bindings {
        engine
            .bind(&binding.key, binding.topics.clone(), binding.strategy)
            .await
            .with_context(|| format!("Failed to bind {}", binding.key))?;
        info!(
            "  Bound {} to {:?} ({})",
            binding.key, binding.topics, binding.strategy
        );
    }

    let shutdown = CancellationToken::new();

    // Start metrics server
    let exporter = Arc::new(PrometheusExporter::new(Arc::clone(engine.store()))?);
    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .with_context(|| format!("Invalid metrics address {}", args.metrics_addr))?;
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, exporter, server_shutdown).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    // Start feed
    let reader = open_feed(&args.feed).await?;
    let feed_transport = Arc::clone(&transport);
    let feed_shutdown = shutdown.clone();
    let replay = tokio::spawn(async move {
        feed::replay(reader, &feed_transport, &feed_shutdown).await
    });

    if args.exit_on_eof {
        let stats = replay.await.context("Feed task panicked")??;
        let report = serde_json::json!({
            "feed": stats,
            "entries": engine.store().summaries(),
            "metrics": engine.snapshot(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Shutdown signal received");
    }

    shutdown.cancel();
    engine.shutdown().await;
    if let Err(e) = server.await {
        warn!("Metrics server task ended abnormally: {}", e);
    }

    info!("QuerySync shutdown complete");
    Ok(())
}

async fn open_feed(source: &str) -> anyhow::Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if source == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }
    let file = tokio::fs::File::open(source)
        .await
        .with_context(|| format!("Failed to open feed {}", source))?;
    Ok(Box::new(BufReader::new(file)))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

    // Logs go to stderr so stdout stays clean for the report
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    exporter: Arc<PrometheusExporter>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Request;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind metrics server on {}", addr))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context("Metrics server accept error")?,
        };

        let io = TokioIo::new(stream);
        let exporter = Arc::clone(&exporter);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let exporter = Arc::clone(&exporter);
                async move { Ok::<_, Infallible>(respond(&exporter, req.uri().path())) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}

fn respond(
    exporter: &PrometheusExporter,
    path: &str,
) -> hyper::Response<http_body_util::Full<hyper::body::Bytes>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::{Response, StatusCode};

    let (status, content_type, body) = match path {
        "/metrics" => match exporter.render() {
            Ok(text) => (StatusCode::OK, exporter.content_type(), text),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain".to_string(),
                e.to_string(),
            ),
        },
        "/healthz" | "/livez" | "/readyz" => {
            (StatusCode::OK, "text/plain".to_string(), "ok".to_string())
        }
        _ => (
            StatusCode::NOT_FOUND,
            "text/plain".to_string(),
            "not found".to_string(),
        ),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

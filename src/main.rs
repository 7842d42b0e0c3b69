use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use miniflightradar::auth::{self, AuthService};
use miniflightradar::shutdown::{GRACE_PERIOD, SessionRegistry, ShutdownCoordinator};
use miniflightradar::web::{self, AppState};
use miniflightradar::{FlightStore, Ingester, OpenSkyClient, OpenSkyConfig, UpdateBus};

#[derive(Parser, Debug)]
#[command(
    name = "miniflightradar",
    version,
    about = "Live aircraft tracking server"
)]
struct Cli {
    /// Listen address (host:port, or :port for all interfaces)
    #[arg(long, default_value = ":8080")]
    listen: String,

    /// Proxy for upstream requests (http, https or socks5 URL)
    #[arg(long)]
    proxy: Option<String>,

    /// OTLP trace collector endpoint (host:port or full URL)
    #[arg(long)]
    tracing: Option<String>,

    /// Position database file
    #[arg(long, default_value = "./data/flight.db")]
    db: PathBuf,

    /// Upstream poll interval in seconds
    #[arg(long, default_value_t = 60)]
    interval: u64,

    /// Position history retention in hours
    #[arg(long, default_value_t = 168)]
    retention: u64,

    /// Upstream account name (registered accounts get better rate limits)
    #[arg(long)]
    opensky_user: Option<String>,

    /// Upstream account password
    #[arg(long)]
    opensky_pass: Option<String>,

    /// Session signing secret; overrides the secret file
    #[arg(long)]
    jwt_secret: Option<String>,

    /// Where the generated session secret is persisted
    #[arg(long, default_value = "./data/jwt.secret")]
    jwt_file: PathBuf,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "miniflightradar=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("Startup failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let metrics_handle = miniflightradar::metrics::init_metrics();
    miniflightradar::metrics::initialize_metrics();

    let retention = Duration::from_secs(cli.retention.max(1) * 3600);
    let poll_interval = Duration::from_secs(cli.interval.max(1));

    let secret = auth::resolve_secret(cli.jwt_secret.as_deref(), &cli.jwt_file)?;
    let auth_service = Arc::new(AuthService::new(&secret));

    let store = match FlightStore::open(&cli.db, retention).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            // Degraded but alive: the API answers 500 and sessions stream
            // nothing until the next restart fixes the path.
            error!("Failed to open store at {}: {:#}", cli.db.display(), e);
            Arc::new(FlightStore::offline(retention))
        }
    };

    let bus = UpdateBus::new();
    let registry = SessionRegistry::new();

    let client = OpenSkyClient::new(OpenSkyConfig {
        proxy: cli.proxy.clone(),
        username: cli.opensky_user.clone(),
        password: cli.opensky_pass.clone(),
        cache_ttl: poll_interval,
        ..Default::default()
    })?;

    let ingest_cancel = CancellationToken::new();
    let ingester = Ingester::new(client, Arc::clone(&store), bus.clone(), poll_interval);
    let ingester_task = tokio::spawn(ingester.run(ingest_cancel.clone()));

    let sweep_store = Arc::clone(&store);
    let sweep_cancel = ingest_cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = sweep_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweep_store.sweep().await {
                        debug!("Sweep failed: {:#}", e);
                    }
                }
            }
        }
    });

    let http_cancel = CancellationToken::new();
    let coordinator = ShutdownCoordinator::new(
        registry.clone(),
        ingest_cancel.clone(),
        http_cancel.clone(),
    );

    let state = AppState {
        store: Arc::clone(&store),
        auth: auth_service,
        bus,
        registry,
        metrics: metrics_handle,
        http: reqwest::Client::new(),
        trace_collector: cli.tracing.as_deref().map(web::normalize_collector),
    };
    let app = web::build_router(state);

    let addr = web::normalize_listen_addr(&cli.listen);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on http://{}", addr);

    tokio::spawn(async move {
        coordinator.wait_for_signal().await;
        coordinator.begin();
    });

    let drain_trigger = http_cancel.clone();
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move { drain_trigger.cancelled().await });

    tokio::select! {
        result = serve => result.context("serving HTTP")?,
        _ = async {
            http_cancel.cancelled().await;
            tokio::time::sleep(GRACE_PERIOD).await;
        } => {
            warn!("Grace period elapsed before all connections drained");
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), ingester_task).await;
    if let Err(e) = store.close().await {
        warn!("Failed to close store cleanly: {:#}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

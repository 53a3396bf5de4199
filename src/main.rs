use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tsuru_api::config::{self, AppConfig};
use tsuru_api::database::DatabaseManager;
use tsuru_api::event::postgres::PgEventStore;
use tsuru_api::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "tsuru-api", version, about = "PaaS control plane HTTP API")]
struct Args {
    /// YAML configuration file used in place of the environment
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so cargo run picks up DATABASE_URL and TSURU_* settings.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config: AppConfig = match &args.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => config::config().clone(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    info!("Starting tsuru API in {:?} mode", config.environment);

    let mut builder = AppState::builder(config.clone());
    if config.database.url.is_some() {
        let pool = DatabaseManager::pool(&config.database).await?;
        let store = PgEventStore::connect(pool).await?;
        info!("journaling events in database {}", config.database.name);
        builder = builder.event_store(Arc::new(store));
    }
    let state = builder.build()?;
    let tracker = state.tracker.clone();
    let app = tsuru_api::app(state);

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!("tsuru API listening on http://{}", bind_addr);

    let stop = Arc::new(Notify::new());
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let stop = stop.clone();
        async move { stop.notified().await }
    });
    let mut server = tokio::spawn(server.into_future());

    tokio::select! {
        joined = &mut server => return Ok(joined??),
        _ = shutdown_signal() => {}
    }

    let closed = tracker.shutdown();
    info!("shutting down, closed {} log listeners", closed);
    stop.notify_one();

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined??,
        Err(_) => warn!("in-flight requests still running after {:?}, exiting", grace),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("unable to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#![allow(dead_code)]

use clap::Parser;
use distribution::config::validate_config;
use distribution::core::migration::{MigrationDriver, SinkHandler};
use distribution::domain::migration::SqliteMigrationSink;
use distribution::utils::cli::{Args, Command};
use distribution::utils::state::AppState;
use distribution::api;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let args = Args::parse();
    let config = validate_config(&args).await?;

    let pool = SqlitePoolOptions::new()
        .max_connections(12)
        .connect(&config.db_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let state = Arc::new(AppState::new(config, Arc::new(pool)).await);

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(args, state).await,
        Command::Migrate { from_scratch } => run_migration(state, !from_scratch).await,
        Command::PurgeUploads => purge_uploads(state).await,
    }
}

async fn serve(args: Args, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", args.host, args.port)).await?;

    tracing::info!("listening on {}", listener.local_addr()?);

    let app = api::create_router(state).layer(TraceLayer::new_for_http());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Walks every repository and tag once, emitting a catalog row for each
/// via `domain::migration::SqliteMigrationSink`, resuming from the last
/// persisted marker unless `--from-scratch` was passed.
async fn run_migration(state: Arc<AppState>, resume: bool) -> anyhow::Result<()> {
    let migration = MigrationDriver::new(state.driver.clone(), state.manifests.clone());
    let sink = Arc::new(SqliteMigrationSink::new(state.pool.clone()));
    let handler = SinkHandler::new(sink);

    let outcome = migration.migrate(&handler, resume).await;
    match outcome.error {
        None => {
            tracing::info!(last_repository = ?outcome.last_repository, "migration pass complete");
            Ok(())
        }
        Some(e) => {
            tracing::error!(last_repository = ?outcome.last_repository, error = %e, "migration pass failed");
            Err(e.into())
        }
    }
}

async fn purge_uploads(state: Arc<AppState>) -> anyhow::Result<()> {
    let cutoff_secs = state.config.upload_stale_cutoff_secs;
    let cutoff = std::time::SystemTime::now() - Duration::from_secs(cutoff_secs);
    let report = state.blobs.purge_stale_uploads(cutoff).await?;
    tracing::info!(
        deleted = report.deleted.len(),
        errors = report.errors.len(),
        "purged stale uploads"
    );
    for item in &report.errors {
        tracing::warn!(upload = %item.key, error = %item.message, "failed to purge upload");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down...");
}

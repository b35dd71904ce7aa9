//! Dicelog Engine - Main entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderValue, Method};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dicelog_domain::CommandKind;
use dicelog_engine::app::{App, Repositories};
use dicelog_engine::infrastructure::{
    clock::SystemClock,
    config::AppConfig,
    persistence::{self, SqliteRollRepo, SqliteSessionRepo, SqliteStatsRepo},
    ports::ClockPort,
    queues::QueueFactory,
};
use dicelog_engine::use_cases::{commands::spawn_workers, CommandQueues};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment from repo root (the engine may be run from `crates/engine`).
    load_dotenv_from_repo_root();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dicelog_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Dicelog Engine");

    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();
    setup_shutdown_signal(cancel_token.clone());

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!("Configuration loaded");
    tracing::info!("  Database: {}", config.database_path);
    tracing::info!(
        "  Queues: {} ({})",
        config.queue.backend,
        config.queue.sqlite_path
    );

    let clock: Arc<dyn ClockPort> = Arc::new(SystemClock::new());

    // Open the persistence gateway
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pool = persistence::connect(&config.database_path).await?;
    persistence::ensure_schema(&pool).await?;

    let repositories = Repositories {
        sessions: Arc::new(SqliteSessionRepo::new(pool.clone())),
        rolls: Arc::new(SqliteRollRepo::new(pool.clone())),
        stats: Arc::new(SqliteStatsRepo::new(pool.clone())),
    };

    // Durable command queues
    let queue_factory = QueueFactory::new(config.queue.clone(), clock.clone()).await?;
    let queues = CommandQueues::new(
        queue_factory.create(CommandKind::Roll).await?,
        queue_factory.create(CommandKind::EndSession).await?,
    );

    let cors_layer = build_cors_layer(&config.cors_allowed_origins);
    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    let recovery_interval = Duration::from_secs(config.queue.recovery_poll_interval_seconds);

    let app = Arc::new(App::new(config, repositories, queues, clock));
    app.recover().await?;
    tracing::info!("Application state initialized");

    // Start one worker per command queue
    let workers = spawn_workers(
        app.dispatcher.clone(),
        &app.queues,
        recovery_interval,
        cancel_token.clone(),
    );

    // Build HTTP router
    let mut router = dicelog_engine::api::http::routes()
        .with_state(app.clone())
        .layer(TraceLayer::new_for_http());
    if let Some(cors) = cors_layer {
        router = router.layer(cors);
    }

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server_cancel = cancel_token.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        server_cancel.cancelled().await;
        tracing::info!("HTTP server received shutdown signal");
    });

    // Run server until shutdown, then wait for workers to finish
    if let Err(e) = server.await {
        tracing::error!("Server error: {}", e);
        cancel_token.cancel();
    }

    tracing::info!("Waiting for workers to complete...");

    // Workers finish their in-flight envelope before observing cancellation
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        for worker in workers {
            let _ = worker.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Workers did not stop in time; unacked commands will be redelivered");
    }

    queue_factory.close().await;
    pool.close().await;

    tracing::info!("Dicelog Engine shutdown complete");
    Ok(())
}

/// Spawns a task that cancels `cancel_token` on SIGTERM/SIGINT
fn setup_shutdown_signal(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }

        cancel_token.cancel();
    });
}

fn load_dotenv_from_repo_root() {
    let repo_root = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..");

    // Prefer local overrides.
    for filename in [".env.local", ".env"] {
        let path = repo_root.join(filename);
        if path.exists() {
            let _ = dotenvy::from_path(path);
        }
    }
    // Then the working directory
    let _ = dotenvy::dotenv();
}

fn build_cors_layer(allowed_origins: &[String]) -> Option<CorsLayer> {
    if allowed_origins.is_empty() {
        return None;
    }

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    if allowed_origins.iter().any(|origin| origin == "*") {
        tracing::warn!("CORS configured to allow ANY origin");
        return Some(cors.allow_origin(Any));
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect();
    if origins.is_empty() {
        return None;
    }

    tracing::info!("CORS configured for origins: {:?}", allowed_origins);
    Some(cors.allow_origin(origins))
}

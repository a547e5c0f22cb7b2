use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kneepipe_api::config::{ServerConfig, StorageConfig};
use kneepipe_api::router::build_app_router;
use kneepipe_api::state::AppState;
use kneepipe_db::Stores;
use kneepipe_worker::{GpuReleaser, JobOrchestrator, PipelineConfig, Worker};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "kneepipe_api=debug,kneepipe_worker=debug,tower_http=debug".into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let storage = StorageConfig::from_env();
    let mut pipeline = PipelineConfig::from_env();
    pipeline.results_dir = storage.results_dir.clone();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    for dir in [&storage.upload_dir, &storage.temp_dir, &storage.results_dir] {
        std::fs::create_dir_all(dir)
            .unwrap_or_else(|e| panic!("Failed to create {}: {e}", dir.display()));
    }

    // --- Store ---
    let stores = match &storage.database_url {
        Some(url) => {
            let pool = kneepipe_db::create_pool(url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            kneepipe_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");
            Stores::postgres(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Stores::memory()
        }
    };
    if let Err(e) = stores.stats.startup_time().await {
        tracing::warn!(error = %e, "Failed to record startup time");
    }

    // --- Orchestrator and worker ---
    let releaser = Arc::new(GpuReleaser::new(
        pipeline.gpu_cleanup_command.clone(),
        pipeline.gpu_settle,
    ));
    let worker_poll_interval = pipeline.worker_poll_interval;
    let orchestrator = Arc::new(JobOrchestrator::new(
        stores.clone(),
        Arc::new(pipeline),
        releaser,
    ));

    let worker_cancel = CancellationToken::new();
    let worker_handle = storage.run_worker.then(|| {
        let worker = Worker::new(Arc::clone(&orchestrator), worker_poll_interval);
        let cancel = worker_cancel.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    });
    if worker_handle.is_none() {
        tracing::info!("Embedded worker disabled; jobs run in a separate worker process");
    }

    // --- App state ---
    let state = AppState {
        stores,
        orchestrator,
        config: Arc::new(config.clone()),
        storage: Arc::new(storage.clone()),
        worker_enabled: worker_handle.is_some(),
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    worker_cancel.cancel();
    if let Some(handle) = worker_handle {
        let timeout = Duration::from_secs(config.shutdown_timeout_secs);
        if tokio::time::timeout(timeout, handle).await.is_err() {
            tracing::warn!(
                timeout_secs = config.shutdown_timeout_secs,
                "Worker did not stop in time; abandoning in-flight job",
            );
        }
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

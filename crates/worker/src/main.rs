use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kneepipe_db::Stores;
use kneepipe_worker::{GpuReleaser, JobOrchestrator, PipelineConfig, Worker};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kneepipe_worker=debug,kneepipe_db=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // --- Configuration ---
    let config = PipelineConfig::from_env();
    tracing::info!(
        program = %config.program,
        results_dir = %config.results_dir.display(),
        timeout_secs = config.timeout.as_secs(),
        max_retries = config.max_retries,
        "Loaded pipeline configuration",
    );

    // --- Database ---
    // A standalone worker only makes sense against the shared queue.
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = kneepipe_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    tracing::info!("Database connection pool created");

    kneepipe_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Orchestrator ---
    let releaser = Arc::new(GpuReleaser::new(
        config.gpu_cleanup_command.clone(),
        config.gpu_settle,
    ));
    let poll_interval = config.worker_poll_interval;
    let orchestrator = Arc::new(JobOrchestrator::new(
        Stores::postgres(pool),
        Arc::new(config),
        releaser,
    ));

    // --- Run ---
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        Worker::new(orchestrator, poll_interval)
            .run(worker_cancel)
            .await;
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C, stopping worker"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
    }
    cancel.cancel();

    if let Err(e) = handle.await {
        tracing::error!(error = %e, "Worker task panicked");
    }
    tracing::info!("Worker stopped");
}

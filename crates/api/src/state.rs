use std::sync::Arc;

use kneepipe_db::Stores;
use kneepipe_worker::JobOrchestrator;

use crate::config::{ServerConfig, StorageConfig};

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    /// Creates jobs on upload; also drives the embedded worker if enabled.
    pub orchestrator: Arc<JobOrchestrator>,
    pub config: Arc<ServerConfig>,
    pub storage: Arc<StorageConfig>,
    /// Whether this process runs the worker loop itself.
    pub worker_enabled: bool,
}

use std::path::PathBuf;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `300`, uploads are large).
    pub request_timeout_secs: u64,
    /// How long to wait for the embedded worker after the server stops
    /// (default: `30`).
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `8000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:3000`    |
    /// | `REQUEST_TIMEOUT_SECS` | `300`                      |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "8000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "300".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let shutdown_timeout_secs: u64 = std::env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("SHUTDOWN_TIMEOUT_SECS must be a valid u64");

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
        }
    }
}

/// Where uploads and results live, and which store backs the service.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Raw uploads, one directory per job.
    pub upload_dir: PathBuf,
    /// Scratch space for extracted archives, one directory per job.
    pub temp_dir: PathBuf,
    /// Root of per-job pipeline outputs.
    pub results_dir: PathBuf,
    /// Largest accepted upload in megabytes.
    pub max_upload_size_mb: u64,
    /// Postgres connection string; the in-memory store is used when unset.
    pub database_url: Option<String>,
    /// Run the worker inside the API process.
    pub run_worker: bool,
}

impl StorageConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var              | Default        |
    /// |----------------------|----------------|
    /// | `UPLOAD_DIR`         | `data/uploads` |
    /// | `TEMP_DIR`           | `data/temp`    |
    /// | `RESULTS_DIR`        | `data/results` |
    /// | `MAX_UPLOAD_SIZE_MB` | `600`          |
    /// | `DATABASE_URL`       | unset (memory) |
    /// | `RUN_WORKER`         | `true`         |
    pub fn from_env() -> Self {
        let dir = |key: &str, default: &str| {
            PathBuf::from(std::env::var(key).unwrap_or_else(|_| default.into()))
        };

        let max_upload_size_mb: u64 = std::env::var("MAX_UPLOAD_SIZE_MB")
            .unwrap_or_else(|_| "600".into())
            .parse()
            .expect("MAX_UPLOAD_SIZE_MB must be a valid u64");

        let run_worker: bool = std::env::var("RUN_WORKER")
            .unwrap_or_else(|_| "true".into())
            .parse()
            .expect("RUN_WORKER must be true or false");

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Self {
            upload_dir: dir("UPLOAD_DIR", "data/uploads"),
            temp_dir: dir("TEMP_DIR", "data/temp"),
            results_dir: dir("RESULTS_DIR", "data/results"),
            max_upload_size_mb,
            database_url,
            run_worker,
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb * 1024 * 1024
    }
}

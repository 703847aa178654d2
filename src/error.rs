use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("instance {instance} returned HTTP {status}")]
    BackendStatus { instance: String, status: u16 },

    #[error("instance {instance} rate-limited (429), retry after {}s", retry_after.as_secs())]
    RateLimited {
        instance: String,
        retry_after: Duration,
    },

    #[error("instance {instance} temporarily blocked for {}s after previous 429", remaining.as_secs())]
    InstanceBlocked {
        instance: String,
        remaining: Duration,
    },

    #[error("all configured searx instances are rate-limited; add more instances or increase per_query_delay_seconds")]
    AllInstancesRateLimited,

    #[error("no searx instance available")]
    NoInstanceAvailable,

    #[error("all topic fetches failed ({failed}/{total}): {last_error}")]
    AllTopicsFailed {
        failed: usize,
        total: usize,
        last_error: String,
    },

    #[error("ingestion already running")]
    AlreadyRunning,

    #[error("ingestion just completed; wait a few seconds before starting again")]
    Cooldown,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Conditions a caller can recover from by simply trying again later.
    pub fn is_guard(&self) -> bool {
        matches!(self, AppError::AlreadyRunning | AppError::Cooldown)
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            AppError::RateLimited { .. } | AppError::InstanceBlocked { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

use thiserror::Error;

/// Invalid configuration. Raised only while building a `CacheConfig`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{option}: cannot parse duration {value:?}")]
    InvalidDuration { option: &'static str, value: String },

    #[error("{option}: must be strictly positive, got {value}")]
    NotPositive { option: &'static str, value: String },

    #[error("{option}: expected a number, got {value:?}")]
    InvalidNumber { option: &'static str, value: String },

    #[error("fallback_strategy: unknown strategy {0:?} (expected skip, assign_admin or create_placeholder)")]
    UnknownStrategy(String),

    #[error("fallback_admin_user_id: expected an integer id, got {0:?}")]
    InvalidAdminId(String),

    #[error("max_retries: {value} exceeds the hard ceiling of {ceiling}")]
    RetryCeiling { value: u32, ceiling: u32 },

    #[error("base_delay_seconds ({base}) must not exceed max_delay_seconds ({max})")]
    DelayOrder { base: f64, max: f64 },

    #[error("max_concurrent_refreshes must be at least 1")]
    ZeroConcurrency,

    #[error("config file: {0}")]
    File(String),
}

/// Terminal outcome of the retrying fetcher for one username.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("identity {username:?} not found in source system")]
    NotFound { username: String },

    #[error("lookup failed after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("lookup rejected by source system: {message}")]
    Rejected { message: String },

    #[error("lookup cancelled, cache is shutting down")]
    Cancelled,
}

/// Snapshot file read/write failure. Never surfaced to cache callers.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

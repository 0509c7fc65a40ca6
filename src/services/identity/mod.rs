//! Source-system identity lookups.
//!
//! The cache talks to the source system only through [`IdentitySource`].
//! Implementations classify their own failures into [`SourceError`] so the
//! retrying fetcher can tell transient trouble from permanent rejection
//! without inspecting message text.

pub mod http;

pub use http::HttpIdentitySource;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity attributes as reported by the source system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("request timed out")]
    Timeout,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("source server error: HTTP {status}")]
    Server { status: u16 },

    #[error("rate limited by source system")]
    RateLimited,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Timeout
                | SourceError::Connection(_)
                | SourceError::Server { .. }
                | SourceError::RateLimited
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Timeout => "timeout",
            SourceError::Connection(_) => "connection",
            SourceError::Server { .. } => "server",
            SourceError::RateLimited => "rate_limited",
            SourceError::BadRequest(_) => "bad_request",
            SourceError::Decode(_) => "decode",
        }
    }
}

/// Looks up a user by username in the source system.
///
/// `Ok(None)` means the source system answered and has no such user.
pub trait IdentitySource: Send + Sync {
    fn lookup_user<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Option<Identity>, SourceError>>;
}

//! Target-system user resolution by email.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("local resolver unavailable: {0}")]
    Unavailable(String),

    #[error("local directory unreadable: {0}")]
    Directory(String),
}

/// Finds the local user id owning an email address.
pub trait LocalResolver: Send + Sync {
    fn resolve_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, ResolverError>>;
}

/// Resolver that never matches. Used when no directory is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

impl LocalResolver for NoopResolver {
    fn resolve_by_email<'a>(
        &'a self,
        _email: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, ResolverError>> {
        Box::pin(async { Ok(None) })
    }
}

/// In-memory email directory, matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct DirectoryResolver {
    by_email: HashMap<String, i64>,
}

impl DirectoryResolver {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: AsRef<str>,
    {
        Self {
            by_email: entries
                .into_iter()
                .map(|(email, id)| (normalize(email.as_ref()), id))
                .collect(),
        }
    }

    /// Load a JSON object of `email -> local user id`.
    pub fn load_from_file(path: &Path) -> Result<Self, ResolverError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ResolverError::Directory(format!("{}: {}", path.display(), e)))?;
        let raw: HashMap<String, i64> = serde_json::from_str(&text)
            .map_err(|e| ResolverError::Directory(format!("{}: {}", path.display(), e)))?;

        info!(entries = raw.len(), path = %path.display(), "Loaded local user directory");
        Ok(Self::new(raw))
    }

    pub fn len(&self) -> usize {
        self.by_email.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_email.is_empty()
    }
}

impl LocalResolver for DirectoryResolver {
    fn resolve_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, ResolverError>> {
        let found = self.by_email.get(&normalize(email)).copied();
        Box::pin(async move { Ok(found) })
    }
}

fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

//! In-memory doubles for the source system and the local resolver.

use crate::services::identity::{Identity, IdentitySource, SourceError};
use crate::services::local::{LocalResolver, ResolverError};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One scripted response of the fake source.
#[derive(Debug, Clone)]
pub enum Step {
    Found(Identity),
    Missing,
    Fail(SourceError),
    /// Sleep, then answer as `Missing`
    Hang(Duration),
}

pub fn identity(email: &str) -> Identity {
    Identity {
        id: Some(format!("ext-{}", email.split('@').next().unwrap_or(email))),
        display_name: Some(email.to_string()),
        email: Some(email.to_string()),
        active: true,
    }
}

/// Replays a per-user script; the last step repeats once the script runs out.
/// Unscripted users are `Missing`.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    calls: Mutex<HashMap<String, usize>>,
    latency: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, username: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(username.to_string(), steps);
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = latency;
        self
    }

    pub fn calls(&self, username: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(username)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, username: &str) -> Step {
        let index = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(username.to_string()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let scripts = self.scripts.lock().unwrap();
        match scripts.get(username) {
            Some(steps) if !steps.is_empty() => steps[index.min(steps.len() - 1)].clone(),
            _ => Step::Missing,
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl IdentitySource for ScriptedSource {
    fn lookup_user<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Option<Identity>, SourceError>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = InFlight(&self.in_flight);
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

            let step = self.next_step(username);
            let latency = *self.latency.lock().unwrap();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }

            match step {
                Step::Found(identity) => Ok(Some(identity)),
                Step::Missing => Ok(None),
                Step::Fail(err) => Err(err),
                Step::Hang(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(None)
                }
            }
        })
    }
}

/// Email directory that counts lookups and can be made to fail.
#[derive(Default)]
pub struct CountingResolver {
    by_email: HashMap<String, i64>,
    fail: bool,
    calls: AtomicUsize,
}

impl CountingResolver {
    pub fn new(entries: &[(&str, i64)]) -> Self {
        Self {
            by_email: entries
                .iter()
                .map(|(email, id)| (email.to_lowercase(), *id))
                .collect(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LocalResolver for CountingResolver {
    fn resolve_by_email<'a>(
        &'a self,
        email: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, ResolverError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.fail {
            Err(ResolverError::Unavailable(
                "connection refused, password=letmein".into(),
            ))
        } else {
            Ok(self.by_email.get(&email.to_lowercase()).copied())
        };
        Box::pin(async move { result })
    }
}

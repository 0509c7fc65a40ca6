use super::{Identity, IdentitySource, SourceError};
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// REST identity source: `GET {base_url}/users/{username}`.
///
/// One request per call. Timeouts and retries are the fetcher's job, so the
/// client timeout here is only a backstop.
#[derive(Clone)]
pub struct HttpIdentitySource {
    client: Client,
    base_url: String,
    token: Option<String>,
}

/// Payload shape; ids may be numeric or textual depending on the source.
#[derive(Deserialize)]
struct UserPayload {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "displayName")]
    display_name: Option<String>,
    #[serde(default, alias = "emailAddress")]
    email: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

impl From<UserPayload> for Identity {
    fn from(payload: UserPayload) -> Self {
        let id = match payload.id {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        Identity {
            id,
            display_name: payload.display_name,
            email: payload.email,
            active: payload.active,
        }
    }
}

impl HttpIdentitySource {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .user_agent(format!("idmap-cache/{}", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn user_url(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url, urlencoding::encode(username))
    }

    #[instrument(skip(self), fields(query_type = "lookup_user"))]
    async fn fetch(&self, username: &str) -> Result<Option<Identity>, SourceError> {
        let start = Instant::now();
        let mut request = self.client.get(self.user_url(username));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await.map_err(classify_transport)?;
        let status = resp.status();
        debug!(
            status = %status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Source system responded"
        );

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        let payload: UserPayload = resp
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(Some(payload.into()))
    }
}

impl IdentitySource for HttpIdentitySource {
    fn lookup_user<'a>(
        &'a self,
        username: &'a str,
    ) -> BoxFuture<'a, Result<Option<Identity>, SourceError>> {
        Box::pin(self.fetch(username))
    }
}

/// Map a non-success status to an error; `None` for success codes.
fn classify_status(status: StatusCode) -> Option<SourceError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Some(SourceError::RateLimited)
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        Some(SourceError::Timeout)
    } else if status.is_server_error() {
        Some(SourceError::Server {
            status: status.as_u16(),
        })
    } else {
        Some(SourceError::BadRequest(format!("HTTP {}", status)))
    }
}

fn classify_transport(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else if err.is_decode() {
        SourceError::Decode(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status).unwrap_or_else(|| SourceError::Connection(err.to_string()))
    } else {
        SourceError::Connection(err.to_string())
    }
}

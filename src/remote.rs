//! Authenticated JSON requests with bounded retry.
//!
//! Every call to either remote system goes through [`RemoteClient::send`]:
//!
//! | Response | Handling |
//! |----------|----------|
//! | 2xx | body parsed as JSON |
//! | 1xx | logged as a warning, body parsed best-effort |
//! | 401 | session refreshed, pause, retry |
//! | 429 | wait until the server's reset time, retry |
//! | 5xx / timeout | fixed pause, retry |
//! | anything else | [`RemoteError::Status`], not retried |
//!
//! The attempt counter is explicit: after `max_attempts` tries the last
//! error is returned. With the default of 2 each condition is retried once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::session::Session;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{url}: unauthorized (401) after refreshing the token")]
    Unauthorized { url: String },
    #[error("{url}: rate limited (429) after waiting for the reset window")]
    RateLimited { url: String },
    #[error("{url}: server error {status}")]
    Server { url: String, status: u16 },
    #[error("{url}: HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },
    #[error("{url}: request failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url}: invalid JSON response: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error("{url}: API error {code}: {description}")]
    Api {
        url: String,
        code: String,
        description: String,
    },
}

impl RemoteError {
    /// Whether another attempt could succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::RateLimited { .. } | RemoteError::Server { .. } => true,
            RemoteError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            _ => false,
        }
    }
}

/// How the access token is attached to a request.
#[derive(Debug, Clone)]
pub enum AuthStyle {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `?<param>=<token>`
    QueryParam(String),
}

/// Retry timings, built from the `[retry]` config section.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub auth_delay: Duration,
    pub server_delay: Duration,
    pub rate_limit_fallback: Duration,
    pub rate_limit_max: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            auth_delay: Duration::from_secs(config.auth_delay_secs),
            server_delay: Duration::from_secs(config.server_delay_secs),
            rate_limit_fallback: Duration::from_secs(config.rate_limit_fallback_secs),
            rate_limit_max: Duration::from_secs(config.rate_limit_max_secs),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// A JSON API request. The body, when present, is sent as JSON.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Build the shared HTTP client with the configured request timeout.
pub fn http_client(config: &RetryConfig) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

pub struct RemoteClient {
    http: reqwest::Client,
    session: Arc<Session>,
    auth: AuthStyle,
    retry: RetryPolicy,
}

impl RemoteClient {
    pub fn new(http: reqwest::Client, session: Arc<Session>, auth: AuthStyle, retry: RetryPolicy) -> Self {
        Self {
            http,
            session,
            auth,
            retry,
        }
    }

    /// Send a request and parse the JSON response, retrying per [`RetryPolicy`].
    pub async fn send(&self, request: &ApiRequest) -> Result<serde_json::Value, RemoteError> {
        let url = request.url.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let last_attempt = attempt >= self.retry.max_attempts;
            let token = self.session.access_token().await;

            let response = match self.build(request, &token).send().await {
                Ok(response) => response,
                Err(e) if (e.is_timeout() || e.is_connect()) && !last_attempt => {
                    warn!(url = %url, attempt, error = %e, "request failed, retrying");
                    tokio::time::sleep(self.retry.server_delay).await;
                    continue;
                }
                Err(source) => return Err(RemoteError::Transport { url, source }),
            };

            let status = response.status();
            if status.is_success() {
                let body = read_body(response, &url).await?;
                return parse_json(&body, &url);
            }

            if status.is_informational() {
                warn!(url = %url, status = status.as_u16(), "informational response, parsing body anyway");
                let body = read_body(response, &url).await?;
                return Ok(serde_json::from_str(&body).unwrap_or(serde_json::Value::Null));
            }

            match status {
                StatusCode::UNAUTHORIZED => {
                    if last_attempt {
                        return Err(RemoteError::Unauthorized { url });
                    }
                    warn!(url = %url, attempt, "unauthorized, refreshing token");
                    self.session.refresh(&token).await?;
                    tokio::time::sleep(self.retry.auth_delay).await;
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    if last_attempt {
                        return Err(RemoteError::RateLimited { url });
                    }
                    let wait = rate_limit_wait(
                        response.headers(),
                        chrono::Utc::now().timestamp(),
                        &self.retry,
                    );
                    warn!(url = %url, attempt, wait_secs = wait.as_secs(), "rate limited, waiting for reset");
                    tokio::time::sleep(wait).await;
                }
                s if s.is_server_error() => {
                    if last_attempt {
                        return Err(RemoteError::Server {
                            url,
                            status: s.as_u16(),
                        });
                    }
                    warn!(url = %url, attempt, status = s.as_u16(), "server error, retrying");
                    tokio::time::sleep(self.retry.server_delay).await;
                }
                s => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(RemoteError::Status {
                        url,
                        status: s.as_u16(),
                        body,
                    });
                }
            }
        }
    }

    fn build(&self, request: &ApiRequest, token: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        builder = match &self.auth {
            AuthStyle::Bearer => builder.bearer_auth(token),
            AuthStyle::QueryParam(param) => builder.query(&[(param.as_str(), token)]),
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        debug!(method = %request.method, url = %request.url, "request");
        builder
    }
}

async fn read_body(response: reqwest::Response, url: &str) -> Result<String, RemoteError> {
    response.text().await.map_err(|source| RemoteError::Transport {
        url: url.to_string(),
        source,
    })
}

fn parse_json(body: &str, url: &str) -> Result<serde_json::Value, RemoteError> {
    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(body).map_err(|source| RemoteError::Decode {
        url: url.to_string(),
        source,
    })
}

/// How long to wait after a 429.
///
/// `X-RateLimit-Reset` holds the epoch second the window resets;
/// `Retry-After` holds a delay in seconds. Either is capped at
/// `rate_limit_max`. Without a usable header the fallback applies.
pub fn rate_limit_wait(headers: &HeaderMap, now_epoch: i64, policy: &RetryPolicy) -> Duration {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };

    let secs = if let Some(reset) = header("x-ratelimit-reset") {
        Some((reset - now_epoch).max(0) as u64)
    } else {
        header("retry-after").map(|s| s.max(0) as u64)
    };

    match secs {
        Some(secs) => Duration::from_secs(secs).min(policy.rate_limit_max),
        None => policy.rate_limit_fallback,
    }
}

//! Retrying HTTP client used to talk to the change-feed server and its file store.

use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

/// Longest error body kept on a [`FetchError::Status`].
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubles each time, capped at `ceiling`.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FetchedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
        body: String,
    },
}

impl FetchError {
    /// Server errors, throttling, timeouts and connect failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

/// One outgoing request. `bearer` is attached as an `Authorization` header when set.
#[derive(Debug, Clone)]
pub struct FetchRequest<'a> {
    pub method: Method,
    pub url: &'a str,
    pub bearer: Option<&'a str>,
    pub json_body: Option<&'a serde_json::Value>,
}

impl<'a> FetchRequest<'a> {
    pub fn get(url: &'a str) -> Self {
        Self {
            method: Method::GET,
            url,
            bearer: None,
            json_body: None,
        }
    }

    pub fn post_json(url: &'a str, body: &'a serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            json_body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn bearer(mut self, token: &'a str) -> Self {
        self.bearer = Some(token);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    /// Sends `request`, retrying retryable failures. `table` only labels the span.
    pub async fn send(
        &self,
        table: &str,
        request: FetchRequest<'_>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", table, method = %request.method, url = request.url);
        async {
            let mut retry = 0u32;
            loop {
                match self.attempt(&request).await {
                    Err(err) if err.is_retryable() && retry < self.retry.max_retries => {
                        warn!(error = %err, retry, "retrying request");
                        tokio::time::sleep(self.retry.backoff(retry)).await;
                        retry += 1;
                    }
                    result => return result,
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, request: &FetchRequest<'_>) -> Result<FetchedResponse, FetchError> {
        let mut builder = self.client.request(request.method.clone(), request.url);
        if let Some(token) = request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = request.json_body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let url = resp.url().to_string();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                method: request.method.clone(),
                url,
                status,
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }
        let headers = resp.headers().clone();
        let body = resp.bytes().await?;
        Ok(FetchedResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: StatusCode) -> FetchError {
        FetchError::Status {
            method: Method::GET,
            url: "https://sharing.example/shares".to_string(),
            status,
            body: String::new(),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_ceiling() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
        };

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(!status_error(StatusCode::FORBIDDEN).is_retryable());
        assert!(!status_error(StatusCode::NOT_FOUND).is_retryable());
    }

    #[test]
    fn status_errors_name_the_request() {
        let message = status_error(StatusCode::UNAUTHORIZED).to_string();
        assert!(message.starts_with("GET https://sharing.example/shares returned 401"));
    }
}

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::Client as HttpClient;
use tracing::{debug, trace, warn};

use crate::backoff::BackoffPolicy;
use crate::config::Config;
use crate::endpoints::Endpoint;
use crate::{Error, LIB_NAME, LIB_VERSION};

/// Outcome of one delivery attempt (or an exhausted retry loop).
///
/// Transport failures never raise; they are folded into a `Response`
/// with `status == -1` and the error text preserved.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: i32,
    pub body: String,
    pub error: Option<String>,
    pub retry_after: Option<Duration>,
}

impl Response {
    pub(crate) fn network(error: String) -> Self {
        Self {
            status: -1,
            body: String::new(),
            error: Some(error),
            retry_after: None,
        }
    }

    pub fn success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn rate_limited(&self) -> bool {
        self.status == 429
    }

    pub fn client_error(&self) -> bool {
        (400..500).contains(&self.status) && !self.rate_limited()
    }

    pub fn server_error(&self) -> bool {
        self.status >= 500
    }

    pub fn network_error(&self) -> bool {
        self.status < 0
    }

    pub fn should_retry(&self) -> bool {
        self.rate_limited() || self.server_error() || self.network_error()
    }

    pub fn error_message(&self) -> String {
        match &self.error {
            Some(error) => error.clone(),
            None => format!("HTTP {}: {}", self.status, self.body),
        }
    }
}

/// HTTP delivery for batch payloads, with retry and backoff.
pub struct Transport {
    client: HttpClient,
    url: String,
    user_agent: String,
    max_retries: u32,
}

impl Transport {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let client = HttpClient::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.skip_tls_verification)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.endpoints.build_url(Endpoint::Batch),
            user_agent: format!("{LIB_NAME}/{LIB_VERSION}"),
            max_retries: config.max_retries,
        })
    }

    /// Deliver one payload, retrying rate limits, server errors, and
    /// network failures until the retry budget runs out. The returned
    /// [`Response`] is the last attempt's outcome.
    pub async fn send(&self, payload: &str) -> Response {
        let mut backoff = BackoffPolicy::with_max_retries(self.max_retries);
        let mut attempt: u32 = 0;

        loop {
            let response = self.post_once(payload).await;
            if response.success() {
                trace!(status = response.status, "batch delivered");
                return response;
            }
            if !response.should_retry() {
                warn!(status = response.status, "batch rejected");
                return response;
            }

            attempt += 1;
            if !backoff.should_retry(attempt) {
                warn!(
                    status = response.status,
                    attempts = attempt,
                    "retries exhausted, dropping batch"
                );
                return response;
            }

            // A server-provided Retry-After wins over our own pacing.
            let delay = response
                .retry_after
                .unwrap_or_else(|| backoff.next_interval());
            debug!(
                status = response.status,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying batch delivery"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn post_once(&self, payload: &str) -> Response {
        let result = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, &self.user_agent)
            .body(payload.to_string())
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = i32::from(response.status().as_u16());
                let retry_after = if status == 429 {
                    response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.trim().parse::<u64>().ok())
                        .map(Duration::from_secs)
                } else {
                    None
                };
                let body = response.text().await.unwrap_or_default();
                Response {
                    status,
                    body,
                    error: None,
                    retry_after,
                }
            }
            Err(e) => Response::network(e.to_string()),
        }
    }
}

/// Shared handle used by the worker and the sync-mode path.
pub(crate) type SharedTransport = Arc<Transport>;

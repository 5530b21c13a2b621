use std::time::Duration;

use rand::Rng;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client, Method, Response, StatusCode,
};
use tokio_util::sync::CancellationToken;

use crate::{config::USER_AGENT, ModelpackError, ModelpackResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Backoff base for the first retry; doubles on each subsequent attempt.
const BACKOFF_BASE_MS: u64 = 500;

/// Jitter applied to each backoff, uniform in `[-100ms, +100ms]`.
const BACKOFF_JITTER_MS: i64 = 100;

/// Backoff sleeps never drop below this floor.
const BACKOFF_FLOOR_MS: i64 = 100;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A shared HTTP client with tuned timeouts that retries transient failures.
///
/// Every request goes through an exponential-backoff-with-jitter loop: an
/// attempt is retried when the transport error looks transient (timeouts, TLS
/// hiccups, connection resets) or when the response status is 408, 429, or
/// any 5xx. Retryable response bodies are drained before the next attempt so
/// the connection can be reused.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    retries: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HttpTransport {
    /// Builds a transport suited to large downloads: 30s dial and TLS
    /// timeouts, 60s to the first response bytes, 90s idle connections, and
    /// no overall deadline unless `timeout` is given.
    pub fn new(
        timeout: Option<Duration>,
        insecure: bool,
        retries: u32,
    ) -> ModelpackResult<Self> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .danger_accept_invalid_certs(insecure);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            retries,
        })
    }

    /// Performs a request, retrying transient failures with backoff.
    ///
    /// Cancellation aborts the loop (including backoff sleeps) and surfaces
    /// as [`ModelpackError::Canceled`], which is never retried.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        cancel: &CancellationToken,
    ) -> ModelpackResult<Response> {
        let attempts = self.retries.saturating_add(1).max(1);
        let mut attempt = 0u32;

        loop {
            let request = self.client.request(method.clone(), url).headers(headers.clone());
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(ModelpackError::Canceled),
                outcome = request.send() => outcome,
            };

            match outcome {
                Ok(response) => {
                    if is_retryable_status(response.status()) && attempt + 1 < attempts {
                        tracing::debug!(status = %response.status(), url, "retrying on status");
                        // Drain so the connection can be reused.
                        let _ = response.bytes().await;
                        self.backoff(attempt, cancel).await?;
                    } else {
                        return Ok(response);
                    }
                }
                Err(err) => {
                    if is_retryable_error(&err) && attempt + 1 < attempts {
                        tracing::debug!(error = %err, url, "retrying on transport error");
                        self.backoff(attempt, cancel).await?;
                    } else {
                        return Err(err.into());
                    }
                }
            }

            attempt += 1;
        }
    }

    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> ModelpackResult<()> {
        let exp_ms = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(20));
        let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER_MS..=BACKOFF_JITTER_MS);
        let sleep_ms = (exp_ms as i64 + jitter).max(BACKOFF_FLOOR_MS) as u64;

        tokio::select! {
            _ = cancel.cancelled() => Err(ModelpackError::Canceled),
            _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => Ok(()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds a header value from a string, surfacing invalid characters as a
/// domain error instead of panicking.
pub fn header_value(value: &str) -> ModelpackResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| ModelpackError::InvalidHeader(value.to_string()))
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return true;
    }

    // Fall back to matching the rendered error chain for common TLS and
    // dial failures the client does not classify.
    let mut message = err.to_string().to_lowercase();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string().to_lowercase());
        source = inner.source();
    }

    message.contains("timeout") || message.contains("tls") || message.contains("connection reset")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    #[test]
    fn test_header_value_rejects_control_chars() {
        assert!(header_value("Bearer token").is_ok());
        assert!(header_value("bad\nvalue").is_err());
    }
}

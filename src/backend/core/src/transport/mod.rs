//! Upload transport: one HTTP call to the ingestion endpoint and the
//! classification of its response.
//!
//! | Response                          | Result                          |
//! |-----------------------------------|---------------------------------|
//! | 2xx, `{"status":"completed"}`     | `Ok(Delivery::Accepted)`        |
//! | 2xx, any other status             | `Ok(Delivery::Rejected(error))` |
//! | 429                               | `Err(RateLimited)` + Retry-After|
//! | 5xx                               | `Err(ServerError)`              |
//! | other 4xx                         | `Ok(Delivery::Rejected(..))`    |
//! | connect error / timeout           | `Err(NetworkError)`             |
//!
//! Only `Err` results count against the circuit breaker. A 4xx means the
//! endpoint is up and refused this particular batch.

pub mod envelope;

pub use envelope::{checksum, Envelope, EnvelopeBuilder, EnvelopeMetadata};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::IngestionConfig;
use crate::error::{ErrorCode, ErrorDetails, PipelineError, Result};
use crate::telemetry::UploadMetrics;

/// Sent with every request.
pub const USER_AGENT: &str = "TenderFlow-Scraper/1.0";

const UPLOAD_PATH: &str = "/api/ingestion/tenders";
const HEALTH_PATH: &str = "/api/ingestion/health";

/// Longest server-requested wait that is honoured as given.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of a request the endpoint answered without a transient failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The batch was ingested
    Accepted,
    /// The endpoint refused the batch; retrying will not help
    Rejected(String),
}

/// Sends envelopes to the ingestion endpoint.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Send one envelope. Transient failures are `Err`, permanent refusals
    /// are `Ok(Delivery::Rejected)`.
    async fn send(&self, envelope: &Envelope) -> Result<Delivery>;

    /// Out-of-band health probe.
    async fn health(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct IngestionResponse {
    status: Option<String>,
    error: Option<String>,
}

/// reqwest-backed [`UploadTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    health_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport from the ingestion config.
    pub fn new(config: &IngestionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PipelineError::configuration("Failed to build HTTP client").with_source(e))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            health_timeout: config.health_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn classify(response: reqwest::Response) -> Result<Delivery> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await?;
            let parsed: IngestionResponse = serde_json::from_str(&body).map_err(|e| {
                PipelineError::with_internal(
                    ErrorCode::ServerError,
                    format!("Unreadable ingestion response ({})", status.as_u16()),
                    e.to_string(),
                )
                .with_details(ErrorDetails::new().with_status(status.as_u16()))
            })?;

            return Ok(match parsed.status.as_deref() {
                Some("completed") => Delivery::Accepted,
                _ => Delivery::Rejected(parsed.error.unwrap_or_else(|| "Unknown error".to_string())),
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers(), Utc::now());
            return Err(PipelineError::rate_limited(retry_after));
        }

        if status.is_server_error() {
            return Err(PipelineError::server_error(status.as_u16()));
        }

        let body = response.text().await.unwrap_or_default();
        Ok(Delivery::Rejected(format!("Client error: {}", body.trim())))
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn send(&self, envelope: &Envelope) -> Result<Delivery> {
        let mut request = self.client.post(self.url(UPLOAD_PATH)).json(envelope);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        debug!(
            batch_id = %envelope.metadata.batch_id,
            records = envelope.record_count(),
            "Sending batch to ingestion endpoint"
        );

        UploadMetrics::record_attempt();
        let started = Instant::now();
        let outcome = match request.send().await {
            Ok(response) => Self::classify(response).await,
            Err(e) => Err(PipelineError::from(e)),
        };

        let label = match &outcome {
            Ok(Delivery::Accepted) => "accepted",
            Ok(Delivery::Rejected(_)) => "rejected",
            Err(_) => "error",
        };
        UploadMetrics::record_request_duration(started.elapsed().as_secs_f64(), label);

        outcome
    }

    async fn health(&self) -> bool {
        let result = self
            .client
            .get(self.url(HEALTH_PATH))
            .timeout(self.health_timeout)
            .send()
            .await;

        match result {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                warn!(error = %e, "Ingestion health check failed");
                false
            }
        }
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP date relative to `now`,
/// capped at [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    let delay = match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
            (at - now).to_std().unwrap_or(Duration::ZERO)
        }
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_retry_after_seconds() {
        let now = Utc::now();
        assert_eq!(parse_retry_after(&headers("30"), now), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(&headers(" 0 "), now), Some(Duration::ZERO));
        assert_eq!(parse_retry_after(&HeaderMap::new(), now), None);
        assert_eq!(parse_retry_after(&headers("soon"), now), None);
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        let parsed = parse_retry_after(&headers("Wed, 21 Oct 2015 07:28:00 GMT"), now);
        assert_eq!(parsed, Some(Duration::from_secs(60)));

        let past = parse_retry_after(&headers("Wed, 21 Oct 2015 07:00:00 GMT"), now);
        assert_eq!(past, Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_is_capped() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 0).unwrap();
        assert_eq!(
            parse_retry_after(&headers("10000000000000"), now),
            Some(MAX_RETRY_AFTER)
        );
        assert_eq!(
            parse_retry_after(&headers("Fri, 31 Dec 9999 23:59:59 GMT"), now),
            Some(MAX_RETRY_AFTER)
        );
        assert_eq!(parse_retry_after(&headers("86400"), now), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_transport_trims_base_url() {
        let config = IngestionConfig {
            base_url: "http://localhost:3457/".into(),
            api_key: Some(String::new()),
            ..IngestionConfig::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.base_url(), "http://localhost:3457");
        assert_eq!(transport.url(UPLOAD_PATH), "http://localhost:3457/api/ingestion/tenders");
        assert!(transport.api_key.is_none());
    }
}

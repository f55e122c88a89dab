use std::fmt;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::analytics::constants::MEASUREMENT_PROTOCOL_MAX_BATCH;
use crate::analytics::error::{
    delivery_failure, internal_error, invalid_argument, AnalyticsResult,
};
use crate::analytics::queue::HitRecord;

/// Delivers batches of queued hits to a collection endpoint.
///
/// The dispatcher only distinguishes success from failure: on `Ok` every record in the batch is
/// removed from the queue, on `Err` every record stays queued with its attempt count bumped.
#[async_trait]
pub trait HitTransport: Send + Sync {
    async fn send(&self, batch: &[HitRecord]) -> AnalyticsResult<()>;
}

/// Configuration for [`MeasurementProtocolTransport`].
#[derive(Clone, Debug)]
pub struct MeasurementProtocolConfig {
    endpoint: MeasurementProtocolEndpoint,
    timeout: Duration,
    max_hits_per_request: usize,
    user_agent: Option<String>,
}

impl Default for MeasurementProtocolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementProtocolConfig {
    pub fn new() -> Self {
        Self {
            endpoint: MeasurementProtocolEndpoint::Batch,
            timeout: Duration::from_secs(10),
            max_hits_per_request: MEASUREMENT_PROTOCOL_MAX_BATCH,
            user_agent: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: MeasurementProtocolEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Hits per HTTP request. The batch endpoint accepts at most 20.
    pub fn with_max_hits_per_request(mut self, max: usize) -> Self {
        self.max_hits_per_request = max;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn endpoint(&self) -> &MeasurementProtocolEndpoint {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_hits_per_request(&self) -> usize {
        self.max_hits_per_request
    }
}

/// Supported endpoints for the Measurement Protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeasurementProtocolEndpoint {
    /// Production batch endpoint: <https://www.google-analytics.com/batch>
    Batch,
    /// Validation endpoint: <https://www.google-analytics.com/debug/collect>
    DebugCollect,
    /// Custom endpoint (primarily for testing).
    Custom(String),
}

impl MeasurementProtocolEndpoint {
    pub fn as_str(&self) -> &str {
        match self {
            MeasurementProtocolEndpoint::Batch => "https://www.google-analytics.com/batch",
            MeasurementProtocolEndpoint::DebugCollect => {
                "https://www.google-analytics.com/debug/collect"
            }
            MeasurementProtocolEndpoint::Custom(url) => url,
        }
    }
}

/// Default transport: posts newline-separated hit payloads to the Measurement Protocol.
#[derive(Clone)]
pub struct MeasurementProtocolTransport {
    client: Client,
    config: MeasurementProtocolConfig,
}

impl fmt::Debug for MeasurementProtocolTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementProtocolTransport")
            .field("config", &self.config)
            .finish()
    }
}

impl MeasurementProtocolTransport {
    pub fn new(config: MeasurementProtocolConfig) -> AnalyticsResult<Self> {
        if config.max_hits_per_request == 0
            || config.max_hits_per_request > MEASUREMENT_PROTOCOL_MAX_BATCH
        {
            return Err(invalid_argument(format!(
                "max hits per request must be between 1 and {MEASUREMENT_PROTOCOL_MAX_BATCH}"
            )));
        }
        url::Url::parse(config.endpoint.as_str()).map_err(|err| {
            invalid_argument(format!(
                "invalid measurement protocol endpoint '{}': {err}",
                config.endpoint.as_str()
            ))
        })?;

        let mut builder = Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|err| internal_error(format!("failed to build HTTP client: {err}")))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &MeasurementProtocolConfig {
        &self.config
    }

    async fn post_chunk(&self, chunk: &[HitRecord], now: SystemTime) -> AnalyticsResult<()> {
        let body = chunk
            .iter()
            .map(|record| with_queue_time(record, now))
            .collect::<Vec<_>>()
            .join("\n");

        let response = self
            .client
            .post(self.config.endpoint.as_str())
            .header("Content-Type", "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|err| delivery_failure(format!("failed to send hit batch: {err}")))?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unavailable response body>".to_string());

        let message = match status {
            StatusCode::BAD_REQUEST => {
                format!("measurement protocol rejected the batch (400). Response: {body}")
            }
            _ => format!(
                "measurement protocol request failed with status {status}. Response: {body}"
            ),
        };
        Err(delivery_failure(message))
    }
}

#[async_trait]
impl HitTransport for MeasurementProtocolTransport {
    async fn send(&self, batch: &[HitRecord]) -> AnalyticsResult<()> {
        let now = SystemTime::now();
        for chunk in batch.chunks(self.config.max_hits_per_request) {
            self.post_chunk(chunk, now).await?;
        }
        Ok(())
    }
}

/// Payload with `qt` (milliseconds spent queued) appended.
fn with_queue_time(record: &HitRecord, now: SystemTime) -> String {
    let payload = String::from_utf8_lossy(record.payload());
    let queue_time = record.queue_time(now).as_millis();
    if payload.is_empty() {
        format!("qt={queue_time}")
    } else {
        format!("{payload}&qt={queue_time}")
    }
}

//! HTTP probe client for WPS endpoints.

use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;

use super::{find_exception_text, Classification, ProbeError, ProbeRequest, ProbeResponse};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Executes probe requests and classifies their outcome.
#[derive(Clone)]
pub struct ProbeClient {
    http: reqwest::Client,
    timeout: Duration,
    jitter: Duration,
}

impl ProbeClient {
    /// Build a client whose connect and read phases are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        if timeout.is_zero() {
            return Err(ProbeError::Config("probe timeout must be positive".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;

        Ok(Self {
            http,
            timeout,
            jitter: Duration::ZERO,
        })
    }

    /// Sleep a random delay below `max` before each probe to spread out
    /// processes that share a cadence.
    pub fn with_jitter(mut self, max: Duration) -> Self {
        self.jitter = max;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send the request and classify the reply.
    ///
    /// Never fails: transport errors and timeouts are reported as
    /// [`Classification::ConnectionFailure`].
    pub async fn execute(&self, request: &mut ProbeRequest) -> ProbeResponse {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms > 0 {
            let delay = rand::random::<u64>() % jitter_ms;
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let url = normalize_address(request.address());
        let request_time = request.prepare();
        let start = Instant::now();

        let sent = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(request.payload().to_string())
            .send()
            .await;

        let response = match sent {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    tracing::debug!("Probe to {} timed out after {:?}", url, self.timeout);
                } else {
                    tracing::debug!("Probe to {} failed: {}", url, e);
                }
                return ProbeResponse {
                    request_time,
                    response_time: Utc::now(),
                    elapsed: start.elapsed(),
                    body: None,
                    classification: Classification::ConnectionFailure,
                };
            }
        };

        let status = response.status();

        // Read the full body so the elapsed time covers the complete transfer
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!("Reading probe response from {} failed: {}", url, e);
                return ProbeResponse {
                    request_time,
                    response_time: Utc::now(),
                    elapsed: start.elapsed(),
                    body: None,
                    classification: Classification::ConnectionFailure,
                };
            }
        };

        let elapsed = start.elapsed();
        let response_time = Utc::now();

        let mut classification = classify_body(&body);
        if !status.is_success() && classification.is_success() {
            tracing::debug!(
                "Probe to {} returned HTTP {} without an exception report",
                url,
                status
            );
            classification = Classification::ConnectionFailure;
        }

        ProbeResponse {
            request_time,
            response_time,
            elapsed,
            body: Some(body),
            classification,
        }
    }
}

/// Classify a received body by its content alone.
pub fn classify_body(body: &str) -> Classification {
    match find_exception_text(body) {
        Ok(Some(message)) => Classification::RemoteException { message },
        Ok(None) => Classification::Success,
        Err(e) => {
            tracing::debug!("Treating unparseable reply as connection failure: {}", e);
            Classification::ConnectionFailure
        }
    }
}

fn normalize_address(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

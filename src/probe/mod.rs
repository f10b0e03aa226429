//! Probe module for WPS monitoring.
//!
//! Sends test requests to remote process endpoints and classifies the outcome.

mod client;
mod exception;

pub use client::*;
pub use exception::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
///
/// Only raised while building a client; failed probes are reported through
/// [`Classification`] instead.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("network error: {0}")]
    Network(String),
}

/// Outcome of a single probe execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Classification {
    Success,
    ConnectionFailure,
    RemoteException { message: String },
}

impl Classification {
    pub fn is_success(&self) -> bool {
        matches!(self, Classification::Success)
    }
}

/// A test request bound to a target endpoint.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    address: String,
    payload: String,
    request_time: Option<DateTime<Utc>>,
}

impl ProbeRequest {
    pub fn new(address: &str, payload: impl Into<String>) -> Self {
        Self {
            address: address.to_string(),
            payload: payload.into(),
            request_time: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Stamp the send time. Called immediately before transmission.
    pub fn prepare(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        self.request_time = Some(now);
        now
    }

    /// Send time, if the request has been prepared.
    pub fn request_time(&self) -> Option<DateTime<Utc>> {
        self.request_time
    }
}

/// The classified result of executing a [`ProbeRequest`].
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub request_time: DateTime<Utc>,
    pub response_time: DateTime<Utc>,
    /// Round-trip time measured with a monotonic clock.
    pub elapsed: Duration,
    pub body: Option<String>,
    pub classification: Classification,
}

impl ProbeResponse {
    /// Round-trip time in milliseconds, present only for successful probes.
    pub fn response_time_ms(&self) -> Option<i64> {
        if self.classification.is_success() {
            Some(self.elapsed.as_millis() as i64)
        } else {
            None
        }
    }
}

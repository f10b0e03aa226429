//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::qos::QosEntity;

/// A monitored WPS endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub endpoint: String,
}

/// One process offered by a service, probed on its own schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: i64,
    pub service_id: i64,
    pub identifier: String,
    /// Raw request body sent on every probe.
    pub test_request: Option<String>,
    /// Consecutive failed firings.
    pub error_count: u32,
    /// Set once the failure threshold was reached and monitoring paused.
    pub in_error: bool,
}

impl Process {
    pub fn new(service_id: i64, identifier: &str, test_request: Option<String>) -> Self {
        Self {
            id: 0,
            service_id,
            identifier: identifier.to_string(),
            test_request,
            error_count: 0,
            in_error: false,
        }
    }
}

/// The QoS entities recorded by one measurement firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: i64,
    pub process_id: i64,
    pub time: DateTime<Utc>,
    pub entities: Vec<QosEntity>,
}

impl Measurement {
    pub fn new(process_id: i64, time: DateTime<Utc>, entities: Vec<QosEntity>) -> Self {
        Self {
            id: 0,
            process_id,
            time,
            entities,
        }
    }
}

//! Quality-of-service data points and their aggregation.

mod metric;
mod probe;

pub use metric::*;
pub use probe::*;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::probe::Classification;

/// The kinds of quantity a probe can measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QosKind {
    ResponseTime,
    Availability,
}

impl QosKind {
    pub fn name(&self) -> &'static str {
        match self {
            QosKind::ResponseTime => "response_time",
            QosKind::Availability => "availability",
        }
    }
}

impl fmt::Display for QosKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One measured quantity from one probe execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QosEntity {
    /// Round-trip time in milliseconds; `None` when the probe did not succeed.
    ResponseTime { response_time_ms: Option<i64> },
    /// Whether the process answered with a usable result.
    Availability { classification: Classification },
}

impl QosEntity {
    pub fn kind(&self) -> QosKind {
        match self {
            QosEntity::ResponseTime { .. } => QosKind::ResponseTime,
            QosEntity::Availability { .. } => QosKind::Availability,
        }
    }
}

//! Aggregation of QoS entities into named metric values.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{QosEntity, QosKind};
use crate::db::Measurement;

/// A named aggregate. `value` is `None` when no data contributed to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricValue {
    pub name: String,
    pub value: Option<f64>,
}

impl MetricValue {
    fn new(name: &str, value: Option<f64>) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// Reduces the entities of one QoS kind to named values.
pub trait QosMetric: Send + Sync {
    fn name(&self) -> &'static str;

    fn calculate(&self, entities: &[&QosEntity]) -> Vec<MetricValue>;
}

/// Creates a fresh metric instance per calculation.
pub type MetricFactory = fn() -> Box<dyn QosMetric>;

/// Median, best and worst response time in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseTimeStats {
    pub median: f64,
    pub best: f64,
    pub worst: f64,
}

/// Compute response time statistics from millisecond samples.
///
/// Returns `None` for an empty sample set.
pub fn response_time_stats(samples_ms: &[i64]) -> Option<ResponseTimeStats> {
    if samples_ms.is_empty() {
        return None;
    }

    let mut sorted = samples_ms.to_vec();
    sorted.sort_unstable();

    let mid = sorted.len() / 2;
    let median_ms = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    } else {
        sorted[mid] as f64
    };

    Some(ResponseTimeStats {
        median: median_ms / 1000.0,
        best: sorted[0] as f64 / 1000.0,
        worst: sorted[sorted.len() - 1] as f64 / 1000.0,
    })
}

/// Median/best/worst over successful response times.
pub struct ResponseTimeMetric;

impl QosMetric for ResponseTimeMetric {
    fn name(&self) -> &'static str {
        "response_time"
    }

    fn calculate(&self, entities: &[&QosEntity]) -> Vec<MetricValue> {
        let samples: Vec<i64> = entities
            .iter()
            .filter_map(|e| match e {
                QosEntity::ResponseTime { response_time_ms } => *response_time_ms,
                _ => None,
            })
            .collect();

        let stats = response_time_stats(&samples);
        vec![
            MetricValue::new("response_time.median", stats.map(|s| s.median)),
            MetricValue::new("response_time.best", stats.map(|s| s.best)),
            MetricValue::new("response_time.worst", stats.map(|s| s.worst)),
        ]
    }
}

/// Percentage of probes that returned a usable result.
pub struct AvailabilityMetric;

impl QosMetric for AvailabilityMetric {
    fn name(&self) -> &'static str {
        "availability"
    }

    fn calculate(&self, entities: &[&QosEntity]) -> Vec<MetricValue> {
        let mut total = 0usize;
        let mut available = 0usize;
        for entity in entities {
            if let QosEntity::Availability { classification } = entity {
                total += 1;
                if classification.is_success() {
                    available += 1;
                }
            }
        }

        let percent = if total == 0 {
            None
        } else {
            Some(available as f64 * 100.0 / total as f64)
        };
        vec![MetricValue::new("availability.percent", percent)]
    }
}

/// Maps each QoS kind to the metrics computed over it.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    factories: BTreeMap<QosKind, Vec<MetricFactory>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(QosKind::ResponseTime, || Box::new(ResponseTimeMetric));
        registry.register(QosKind::Availability, || Box::new(AvailabilityMetric));
        registry
    }

    pub fn register(&mut self, kind: QosKind, factory: MetricFactory) {
        self.factories.entry(kind).or_default().push(factory);
    }

    pub fn kinds(&self) -> Vec<QosKind> {
        self.factories.keys().copied().collect()
    }

    /// Reduce a process's measurements to named values, one group per
    /// registered metric.
    pub fn calculate(&self, measurements: &[Measurement]) -> Vec<MetricValue> {
        let mut values = Vec::new();

        for (kind, factories) in &self.factories {
            let entities: Vec<&QosEntity> = measurements
                .iter()
                .flat_map(|m| m.entities.iter())
                .filter(|e| e.kind() == *kind)
                .collect();

            for factory in factories {
                let metric = factory();
                tracing::trace!(
                    "Calculating {} over {} {} entities",
                    metric.name(),
                    entities.len(),
                    kind
                );
                values.extend(metric.calculate(&entities));
            }
        }

        values
    }
}

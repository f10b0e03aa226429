//! QoS probes turning a classified response into data points.

use std::sync::Arc;

use super::QosEntity;
use crate::probe::{ProbeRequest, ProbeResponse};

/// Converts one request/response pair into a QoS entity.
pub trait QosProbe: Send + Sync {
    fn name(&self) -> &'static str;

    fn probe(&self, request: &ProbeRequest, response: &ProbeResponse) -> QosEntity;
}

/// Records the round-trip time of successful probes.
pub struct ResponseTimeProbe;

impl QosProbe for ResponseTimeProbe {
    fn name(&self) -> &'static str {
        "response-time"
    }

    fn probe(&self, _request: &ProbeRequest, response: &ProbeResponse) -> QosEntity {
        QosEntity::ResponseTime {
            response_time_ms: response.response_time_ms(),
        }
    }
}

/// Records the classification of every probe.
pub struct AvailabilityProbe;

impl QosProbe for AvailabilityProbe {
    fn name(&self) -> &'static str {
        "availability"
    }

    fn probe(&self, _request: &ProbeRequest, response: &ProbeResponse) -> QosEntity {
        QosEntity::Availability {
            classification: response.classification.clone(),
        }
    }
}

/// The set of probes run on every measurement firing.
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    probes: Vec<Arc<dyn QosProbe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in response-time and availability probes.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ResponseTimeProbe);
        registry.register(AvailabilityProbe);
        registry
    }

    /// Add a probe. A probe with the same name replaces the earlier one.
    pub fn register<P: QosProbe + 'static>(&mut self, probe: P) {
        self.probes.retain(|p| p.name() != probe.name());
        self.probes.push(Arc::new(probe));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    /// Run every registered probe in registration order.
    pub fn run(&self, request: &ProbeRequest, response: &ProbeResponse) -> Vec<QosEntity> {
        self.probes
            .iter()
            .map(|p| p.probe(request, response))
            .collect()
    }
}

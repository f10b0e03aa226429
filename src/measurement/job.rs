//! The scheduled job probing one process.

use async_trait::async_trait;
use std::sync::Arc;

use super::{advance, ProcessState};
use crate::db::{Measurement, Process, Store};
use crate::events::{EventBus, MonitorEvent};
use crate::probe::{Classification, ProbeClient, ProbeRequest};
use crate::qos::ProbeRegistry;
use crate::scheduler::{Job, JobContext, JobError};

/// Dependencies shared by every measurement job.
pub struct MeasurementContext {
    pub store: Arc<Store>,
    pub client: ProbeClient,
    pub probes: ProbeRegistry,
    pub events: EventBus,
    /// Consecutive failures after which a process is paused.
    pub max_errors: u32,
}

pub struct MeasurementJob {
    service_id: i64,
    identifier: String,
    ctx: Arc<MeasurementContext>,
}

impl MeasurementJob {
    pub fn new(service_id: i64, identifier: &str, ctx: Arc<MeasurementContext>) -> Self {
        Self {
            service_id,
            identifier: identifier.to_string(),
            ctx,
        }
    }

    fn enter_pause(&self, job: &JobContext, process: Process) {
        tracing::warn!(
            "Measurement: Process {} of service {} failed {} times in a row, pausing",
            process.identifier,
            process.service_id,
            process.error_count
        );
        if let Err(e) = job.scheduler.pause_job(&job.key) {
            tracing::warn!("Measurement: Could not pause {}: {}", job.key, e);
        }
        self.ctx.events.publish(&MonitorEvent::ProcessEnteredError(process));
    }
}

#[async_trait]
impl Job for MeasurementJob {
    async fn execute(&self, job: &JobContext) -> Result<(), JobError> {
        let store = &self.ctx.store;
        let Some(service) = store.get_service(self.service_id)? else {
            tracing::warn!("Measurement: Service {} no longer exists", self.service_id);
            return Ok(());
        };
        let Some(process) = store.get_process(self.service_id, &self.identifier)? else {
            tracing::warn!(
                "Measurement: Process {} of service {} no longer exists",
                self.identifier,
                self.service_id
            );
            return Ok(());
        };

        tracing::debug!(
            "Measurement: Probing {} ({:?})",
            job.key,
            ProcessState::of(&process)
        );
        let mut request = ProbeRequest::new(
            &service.endpoint,
            process.test_request.clone().unwrap_or_default(),
        );
        let response = self.ctx.client.execute(&mut request).await;

        match &response.classification {
            Classification::Success => tracing::debug!(
                "Measurement: {} answered at {} in {:?} ({} bytes)",
                job.key,
                response.response_time,
                response.elapsed,
                response.body.as_deref().map_or(0, str::len)
            ),
            Classification::ConnectionFailure => {
                tracing::info!("Measurement: {} could not be reached", job.key)
            }
            Classification::RemoteException { message } => {
                tracing::info!("Measurement: {} reported an exception: {}", job.key, message)
            }
        }

        let entities = self.ctx.probes.run(&request, &response);
        let sent_at = request.request_time().unwrap_or(response.request_time);
        let mut measurement = Measurement::new(process.id, sent_at, entities);
        let transition = advance(
            process.error_count,
            process.in_error,
            response.classification.is_success(),
            self.ctx.max_errors,
        );
        store.record_measurement(&mut measurement, transition.error_count, transition.in_error)?;

        if transition.entered_pause {
            self.enter_pause(
                job,
                Process {
                    error_count: transition.error_count,
                    in_error: transition.in_error,
                    ..process
                },
            );
        }
        Ok(())
    }

    /// An unexpected failure counts as one failed firing.
    async fn on_failure(&self, job: &JobContext, _error: &JobError) {
        let process = match self.ctx.store.get_process(self.service_id, &self.identifier) {
            Ok(Some(p)) => p,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("Measurement: Could not load {} after failure: {}", job.key, e);
                return;
            }
        };

        let transition = advance(process.error_count, process.in_error, false, self.ctx.max_errors);
        if let Err(e) = self.ctx.store.update_process_state(
            process.id,
            transition.error_count,
            transition.in_error,
        ) {
            tracing::error!("Measurement: Could not update {} after failure: {}", job.key, e);
            return;
        }

        if transition.entered_pause {
            self.enter_pause(
                job,
                Process {
                    error_count: transition.error_count,
                    in_error: transition.in_error,
                    ..process
                },
            );
        }
    }
}

//! Operator-facing control of services, processes and their schedules.
//!
//! [`MonitorControl`] keeps the store and the scheduler in step: every
//! persisted process has a registered measurement job, every persisted
//! trigger is scheduled under its stored key.

use chrono::{DateTime, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ServerConfig;
use crate::db::{DbError, Measurement, Process, Service, Store};
use crate::events::{EventBus, MonitorEvent};
use crate::measurement::{MeasurementContext, MeasurementJob};
use crate::probe::ProbeClient;
use crate::qos::{MetricRegistry, MetricValue, ProbeRegistry};
use crate::scheduler::{
    CleanupJob, Job, JobKey, Scheduler, SchedulerError, TriggerConfig, TriggerKey,
};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("service {0} not found")]
    ServiceNotFound(i64),
    #[error("process {identifier} of service {service_id} not found")]
    ProcessNotFound { service_id: i64, identifier: String },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("trigger {0} not found")]
    TriggerNotFound(TriggerKey),
    #[error("process {identifier} of service {service_id} has no trigger #{index}")]
    NoTriggerAt {
        service_id: i64,
        identifier: String,
        index: usize,
    },
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// The parts of [`ServerConfig`] the monitor acts on.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub max_errors: u32,
    pub retention_days: u32,
    pub cleanup_time: NaiveTime,
    pub shutdown_grace: Duration,
}

impl From<&ServerConfig> for MonitorSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_errors: config.max_errors,
            retention_days: config.retention_days,
            cleanup_time: config.cleanup_time,
            shutdown_grace: config.shutdown_grace,
        }
    }
}

#[derive(Clone)]
pub struct MonitorControl {
    store: Arc<Store>,
    scheduler: Scheduler,
    events: EventBus,
    measurement: Arc<MeasurementContext>,
    metrics: Arc<MetricRegistry>,
    settings: MonitorSettings,
}

impl MonitorControl {
    pub fn new(
        store: Arc<Store>,
        scheduler: Scheduler,
        client: ProbeClient,
        settings: MonitorSettings,
    ) -> Self {
        let events = EventBus::new();
        let probes = ProbeRegistry::with_defaults();
        let metrics = MetricRegistry::with_defaults();
        tracing::debug!(
            "Monitor: Probes {:?}, metrics over {:?}",
            probes.names(),
            metrics.kinds()
        );

        let measurement = Arc::new(MeasurementContext {
            store: store.clone(),
            client,
            probes,
            events: events.clone(),
            max_errors: settings.max_errors,
        });

        Self {
            store,
            scheduler,
            events,
            measurement,
            metrics: Arc::new(metrics),
            settings,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // --- Lifecycle ---

    /// Restore every persisted job and trigger, then start firing.
    pub fn start(&self) -> Result<(), MonitorError> {
        self.restore()?;
        self.scheduler.start();
        tracing::info!("Monitor: Started");
        self.events.publish(&MonitorEvent::Start);
        Ok(())
    }

    /// Stop firing and wait for in-flight measurements.
    pub async fn shutdown(&self) {
        self.events.publish(&MonitorEvent::Shutdown);
        self.scheduler.shutdown(self.settings.shutdown_grace).await;
        tracing::info!("Monitor: Shut down");
    }

    pub async fn restart(&self) -> Result<(), MonitorError> {
        self.scheduler.shutdown(self.settings.shutdown_grace).await;
        self.restore()?;
        self.scheduler.start();
        tracing::info!("Monitor: Restarted");
        self.events.publish(&MonitorEvent::Restart);
        Ok(())
    }

    fn restore(&self) -> Result<(), MonitorError> {
        let processes = self.store.get_all_processes()?;
        let mut triggers = 0usize;

        for process in &processes {
            let key = JobKey::for_process(process.service_id, &process.identifier);
            if !self.scheduler.is_job_registered(&key) {
                self.scheduler
                    .add_job(key.clone(), self.measurement_job(process.service_id, &process.identifier))?;
            }

            for trigger in self.store.get_triggers(process.id)? {
                let registered = trigger
                    .key()
                    .map(|k| self.scheduler.is_trigger_registered(k))
                    .unwrap_or(false);
                if !registered {
                    self.scheduler.schedule_trigger(trigger, &key)?;
                    triggers += 1;
                }
            }

            if process.in_error && self.scheduler.is_job_paused(&key) == Some(false) {
                self.scheduler.pause_job(&key)?;
            }
        }

        if !self.scheduler.is_job_registered(&CleanupJob::key()) {
            CleanupJob::register(
                &self.scheduler,
                self.store.clone(),
                self.settings.retention_days,
                self.settings.cleanup_time,
            )?;
        }

        tracing::info!(
            "Monitor: Restored {} processes with {} triggers",
            processes.len(),
            triggers
        );
        Ok(())
    }

    fn measurement_job(&self, service_id: i64, identifier: &str) -> Arc<dyn Job> {
        Arc::new(MeasurementJob::new(
            service_id,
            identifier,
            self.measurement.clone(),
        ))
    }

    // --- Services ---

    pub fn create_service(&self, endpoint: &str) -> Result<Service, MonitorError> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(MonitorError::InvalidArgument(
                "service endpoint must not be empty".to_string(),
            ));
        }
        if self.store.find_service(endpoint)?.is_some() {
            return Err(MonitorError::AlreadyExists(format!("service {}", endpoint)));
        }

        let service = self.store.add_service(endpoint)?;
        tracing::info!("Monitor: Created service {} ({})", service.id, service.endpoint);
        Ok(service)
    }

    pub fn get_service(&self, service_id: i64) -> Result<Service, MonitorError> {
        self.store
            .get_service(service_id)?
            .ok_or(MonitorError::ServiceNotFound(service_id))
    }

    pub fn list_services(&self) -> Result<Vec<Service>, MonitorError> {
        Ok(self.store.get_services()?)
    }

    /// Delete a service, descheduling each of its processes first.
    pub fn delete_service(&self, service_id: i64) -> Result<(), MonitorError> {
        self.get_service(service_id)?;

        for process in self.store.get_processes(service_id)? {
            self.scheduler
                .remove_job(&JobKey::for_process(service_id, &process.identifier));
        }
        self.store.delete_service(service_id)?;
        tracing::info!("Monitor: Deleted service {}", service_id);
        Ok(())
    }

    // --- Processes ---

    /// Create a process and register its measurement job. The job fires
    /// once a trigger is attached.
    pub fn create_process(
        &self,
        service_id: i64,
        identifier: &str,
        test_request: Option<String>,
    ) -> Result<Process, MonitorError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(MonitorError::InvalidArgument(
                "process identifier must not be empty".to_string(),
            ));
        }
        self.get_service(service_id)?;
        if self.store.get_process(service_id, identifier)?.is_some() {
            return Err(MonitorError::AlreadyExists(format!(
                "process {} of service {}",
                identifier, service_id
            )));
        }

        let mut process = Process::new(service_id, identifier, test_request);
        self.store.add_process(&mut process)?;

        let key = JobKey::for_process(service_id, identifier);
        if let Err(e) = self
            .scheduler
            .add_job(key, self.measurement_job(service_id, identifier))
        {
            self.store.delete_process(process.id)?;
            return Err(e.into());
        }

        tracing::info!("Monitor: Created process {} of service {}", identifier, service_id);
        Ok(process)
    }

    pub fn get_process(&self, service_id: i64, identifier: &str) -> Result<Process, MonitorError> {
        self.store
            .get_process(service_id, identifier)?
            .ok_or_else(|| MonitorError::ProcessNotFound {
                service_id,
                identifier: identifier.to_string(),
            })
    }

    pub fn list_processes(&self, service_id: i64) -> Result<Vec<Process>, MonitorError> {
        self.get_service(service_id)?;
        Ok(self.store.get_processes(service_id)?)
    }

    pub fn is_process_exists(&self, service_id: i64, identifier: &str) -> Result<bool, MonitorError> {
        Ok(self.store.get_process(service_id, identifier)?.is_some())
    }

    /// Deschedule a process, then delete its measurements and the process.
    pub fn delete_process(&self, service_id: i64, identifier: &str) -> Result<(), MonitorError> {
        let process = self.get_process(service_id, identifier)?;
        let key = JobKey::for_process(service_id, identifier);

        let triggers = self.scheduler.triggers_of_job(&key).len();
        self.scheduler.remove_job(&key);
        let deleted = self.store.delete_measurements(process.id)?;
        self.store.delete_process(process.id)?;

        tracing::info!(
            "Monitor: Deleted process {} of service {} with {} triggers and {} measurements",
            identifier,
            service_id,
            triggers,
            deleted
        );
        Ok(())
    }

    pub fn is_job_registered(&self, service_id: i64, identifier: &str) -> bool {
        self.scheduler
            .is_job_registered(&JobKey::for_process(service_id, identifier))
    }

    // --- Triggers ---

    /// Schedule a trigger for a process and persist it under its new key.
    pub fn add_trigger(
        &self,
        service_id: i64,
        identifier: &str,
        trigger: TriggerConfig,
    ) -> Result<TriggerConfig, MonitorError> {
        if trigger.is_saved() {
            return Err(MonitorError::InvalidArgument(
                "trigger is already scheduled, update it instead".to_string(),
            ));
        }
        let process = self.get_process(service_id, identifier)?;
        let job_key = JobKey::for_process(service_id, identifier);

        let key = self.scheduler.schedule_trigger(trigger.clone(), &job_key)?;
        let saved = trigger.with_key(key.clone());
        if let Err(e) = self.store.save_trigger(process.id, &saved) {
            self.scheduler.unschedule_trigger(&key);
            return Err(e.into());
        }
        Ok(saved)
    }

    /// Replace the cadence of a saved trigger, keeping its key.
    pub fn update_trigger(
        &self,
        key: &TriggerKey,
        trigger: TriggerConfig,
    ) -> Result<TriggerConfig, MonitorError> {
        let (process_id, stored) = self
            .store
            .get_trigger(key)?
            .ok_or_else(|| MonitorError::TriggerNotFound(key.clone()))?;
        if stored.same_cadence(&trigger) {
            return Ok(stored);
        }

        let updated = match self.scheduler.get_trigger(key) {
            Some(_) => self.scheduler.reschedule_trigger(key, trigger)?,
            None => trigger.with_key(key.clone()),
        };
        self.store.save_trigger(process_id, &updated)?;
        Ok(updated)
    }

    pub fn remove_trigger(&self, key: &TriggerKey) -> Result<(), MonitorError> {
        let unscheduled = self.scheduler.unschedule_trigger(key);
        let deleted = self.store.delete_trigger(key)?;
        if !unscheduled && !deleted {
            return Err(MonitorError::TriggerNotFound(key.clone()));
        }
        Ok(())
    }

    pub fn list_triggers(
        &self,
        service_id: i64,
        identifier: &str,
    ) -> Result<Vec<TriggerConfig>, MonitorError> {
        let process = self.get_process(service_id, identifier)?;
        Ok(self.store.get_triggers(process.id)?)
    }

    /// Key of the trigger at `index` in [`Self::list_triggers`] order.
    pub fn trigger_key_at(
        &self,
        service_id: i64,
        identifier: &str,
        index: usize,
    ) -> Result<TriggerKey, MonitorError> {
        self.list_triggers(service_id, identifier)?
            .get(index)
            .and_then(|t| t.key().cloned())
            .ok_or_else(|| MonitorError::NoTriggerAt {
                service_id,
                identifier: identifier.to_string(),
                index,
            })
    }

    // --- Pause / resume ---

    /// Pause a process's job. Returns `false` if it was already paused.
    pub fn pause_monitoring(&self, service_id: i64, identifier: &str) -> Result<bool, MonitorError> {
        self.get_process(service_id, identifier)?;
        Ok(self
            .scheduler
            .pause_job(&JobKey::for_process(service_id, identifier))?)
    }

    /// Reset a process's failure counter and error state, then resume its
    /// job. The reset happens even when the job was running. Returns whether
    /// the job was paused.
    pub fn resume_monitoring(&self, service_id: i64, identifier: &str) -> Result<bool, MonitorError> {
        let process = self.get_process(service_id, identifier)?;
        if process.in_error || process.error_count > 0 {
            self.store.update_process_state(process.id, 0, false)?;
        }
        Ok(self
            .scheduler
            .resume_job(&JobKey::for_process(service_id, identifier))?)
    }

    // --- Measurements ---

    /// Newest measurements of a process, newest first.
    pub fn get_measurements(
        &self,
        service_id: i64,
        identifier: &str,
        limit: usize,
    ) -> Result<Vec<Measurement>, MonitorError> {
        let process = self.get_process(service_id, identifier)?;
        Ok(self.store.get_measurements(process.id, limit)?)
    }

    /// Newest measurements across a service's processes, newest first.
    pub fn get_service_measurements(
        &self,
        service_id: i64,
        limit: usize,
    ) -> Result<Vec<Measurement>, MonitorError> {
        self.get_service(service_id)?;
        Ok(self.store.get_service_measurements(service_id, limit)?)
    }

    /// Metric values over the newest `limit` measurements of a process.
    pub fn get_metrics(
        &self,
        service_id: i64,
        identifier: &str,
        limit: usize,
    ) -> Result<Vec<MetricValue>, MonitorError> {
        let mut measurements = self.get_measurements(service_id, identifier, limit)?;
        measurements.reverse();
        Ok(self.metrics.calculate(&measurements))
    }

    pub fn delete_measurements(&self, service_id: i64, identifier: &str) -> Result<usize, MonitorError> {
        let process = self.get_process(service_id, identifier)?;
        Ok(self.store.delete_measurements(process.id)?)
    }

    /// Delete a process's measurements taken before `cutoff`.
    pub fn delete_measurements_before(
        &self,
        service_id: i64,
        identifier: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, MonitorError> {
        let process = self.get_process(service_id, identifier)?;
        Ok(self
            .store
            .delete_process_measurements_before(process.id, cutoff)?)
    }
}

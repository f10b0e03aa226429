//! Units of work the scheduler fires.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::{Scheduler, TriggerKey};
use crate::db::DbError;

/// Identity of a registered job. At most one firing per key runs at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
        }
    }

    /// Key of the measurement job for a process of a service.
    pub fn for_process(service_id: i64, identifier: &str) -> Self {
        Self::new(identifier, &format!("service-{}", service_id))
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// What a firing knows about itself.
#[derive(Clone)]
pub struct JobContext {
    pub key: JobKey,
    pub trigger: TriggerKey,
    pub fire_time: DateTime<Utc>,
    pub scheduler: Scheduler,
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Job panicked: {0}")]
    Panicked(String),
}

#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;

    /// Called after `execute` returned an error or panicked. The job stays
    /// scheduled.
    async fn on_failure(&self, _ctx: &JobContext, _error: &JobError) {}
}

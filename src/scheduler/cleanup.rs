//! Daily deletion of measurements past the retention period.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use std::sync::Arc;

use super::{
    IntervalUnit, Job, JobContext, JobError, JobKey, Scheduler, SchedulerError, TriggerConfig,
    TriggerError,
};
use crate::db::Store;

pub struct CleanupJob {
    store: Arc<Store>,
    retention_days: u32,
}

impl CleanupJob {
    pub fn new(store: Arc<Store>, retention_days: u32) -> Self {
        Self {
            store,
            retention_days,
        }
    }

    pub fn key() -> JobKey {
        JobKey::new("cleanup", "maintenance")
    }

    /// Measurements taken before this instant are deleted.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(self.retention_days as i64)
    }

    /// Once a day at `time_of_day` (UTC), starting today.
    pub fn daily_trigger(
        time_of_day: NaiveTime,
        now: DateTime<Utc>,
    ) -> Result<TriggerConfig, TriggerError> {
        let start = now.date_naive().and_time(time_of_day).and_utc();
        TriggerConfig::repeat_forever(start, 1, IntervalUnit::Day)
    }

    /// Register the cleanup job with its daily trigger. With a retention of
    /// zero days the job is registered paused.
    pub fn register(
        scheduler: &Scheduler,
        store: Arc<Store>,
        retention_days: u32,
        time_of_day: NaiveTime,
    ) -> Result<(), SchedulerError> {
        let key = Self::key();
        let trigger = Self::daily_trigger(time_of_day, Utc::now())?;
        scheduler.add_job(key.clone(), Arc::new(Self::new(store, retention_days)))?;
        scheduler.schedule_trigger(trigger, &key)?;

        if retention_days == 0 {
            scheduler.pause_job(&key)?;
            tracing::info!("Cleanup: Retention disabled, measurements are kept forever");
        } else {
            tracing::info!(
                "Cleanup: Keeping {} days of measurements, daily at {} UTC",
                retention_days,
                time_of_day
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Job for CleanupJob {
    async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        let cutoff = self.cutoff(ctx.fire_time.max(Utc::now()));
        let deleted = self.store.delete_measurements_before(cutoff)?;
        tracing::info!(
            "Cleanup: Deleted {} measurements older than {}",
            deleted,
            cutoff
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Measurement, Process};
    use crate::test_support::temp_store;
    use chrono::TimeZone;

    #[test]
    fn test_cutoff() {
        let (_tmp, store) = temp_store();
        let job = CleanupJob::new(store, 30);
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 3, 0, 0).unwrap();
        assert_eq!(
            job.cutoff(now),
            Utc.with_ymd_and_hms(2024, 3, 1, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_daily_trigger() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 14, 0, 0).unwrap();
        let at = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        let trigger = CleanupJob::daily_trigger(at, now).unwrap();

        assert_eq!(trigger.unit(), IntervalUnit::Day);
        assert_eq!(
            trigger.next_fire_time(now),
            Some(Utc.with_ymd_and_hms(2024, 5, 11, 3, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_register_disabled_is_paused() {
        let (_tmp, store) = temp_store();
        let scheduler = Scheduler::new(1);
        let at = NaiveTime::from_hms_opt(3, 0, 0).unwrap();

        CleanupJob::register(&scheduler, store, 0, at).unwrap();
        assert_eq!(scheduler.is_job_paused(&CleanupJob::key()), Some(true));
        assert_eq!(scheduler.triggers_of_job(&CleanupJob::key()).len(), 1);
    }

    #[tokio::test]
    async fn test_register_enabled_schedules_daily_trigger() {
        let (_tmp, store) = temp_store();
        let scheduler = Scheduler::new(1);
        let at = NaiveTime::from_hms_opt(3, 0, 0).unwrap();

        CleanupJob::register(&scheduler, store.clone(), 30, at).unwrap();
        assert_eq!(scheduler.is_job_paused(&CleanupJob::key()), Some(false));
        let triggers = scheduler.triggers_of_job(&CleanupJob::key());
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].unit(), IntervalUnit::Day);

        assert_eq!(
            CleanupJob::register(&scheduler, store, 30, at),
            Err(SchedulerError::JobExists(CleanupJob::key()))
        );
        assert_eq!(scheduler.triggers_of_job(&CleanupJob::key()).len(), 1);
    }

    #[test]
    fn test_invalid_trigger_is_a_scheduler_error() {
        let err: SchedulerError = TriggerError::NonPositiveInterval(0).into();
        assert_eq!(err.to_string(), "invalid trigger: trigger interval must be positive, got 0");
    }

    #[tokio::test]
    async fn test_execute_deletes_old_measurements() {
        let (_tmp, store) = temp_store();
        let service = store.add_service("http://example.com/wps").unwrap();
        let mut process = Process::new(service.id, "P1", None);
        store.add_process(&mut process).unwrap();

        let now = Utc::now();
        for days_ago in [90, 45, 31, 10, 0] {
            let mut m = Measurement::new(process.id, now - ChronoDuration::days(days_ago), vec![]);
            store.record_measurement(&mut m, 0, false).unwrap();
        }

        let scheduler = Scheduler::new(1);
        let ctx = JobContext {
            key: CleanupJob::key(),
            trigger: crate::scheduler::TriggerKey::new("daily", "maintenance"),
            fire_time: now,
            scheduler,
        };
        CleanupJob::new(store.clone(), 30).execute(&ctx).await.unwrap();

        assert_eq!(store.get_measurements(process.id, 1000).unwrap().len(), 2);
    }
}

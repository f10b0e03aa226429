//! Scheduler for recurring jobs.
//!
//! Jobs are registered under a [`JobKey`] and fired by one or more triggers.
//! Each trigger runs its own timer task; a firing runs on a bounded worker
//! pool and at most one firing per job is in flight. A firing that comes due
//! while the previous one is still running is skipped.

mod cleanup;
mod job;
mod trigger;

pub use cleanup::*;
pub use job::*;
pub use trigger::*;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("unknown job: {0}")]
    UnknownJob(JobKey),
    #[error("unknown trigger: {0}")]
    UnknownTrigger(TriggerKey),
    #[error("job already registered: {0}")]
    JobExists(JobKey),
    #[error("trigger already registered: {0}")]
    TriggerExists(TriggerKey),
    #[error("invalid trigger: {0}")]
    InvalidTrigger(#[from] TriggerError),
}

#[derive(Debug, Clone)]
struct TriggerControl {
    config: TriggerConfig,
    paused: bool,
}

struct JobEntry {
    job: Arc<dyn Job>,
    paused: bool,
    running: Arc<Semaphore>,
    triggers: BTreeSet<TriggerKey>,
}

struct TriggerEntry {
    job_key: JobKey,
    config: TriggerConfig,
    control: watch::Sender<TriggerControl>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobKey, JobEntry>,
    triggers: HashMap<TriggerKey, TriggerEntry>,
    running: bool,
}

/// Handle to the scheduler. Clones share the same registry.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<State>>,
    pool: Arc<Semaphore>,
    firings: Arc<tokio::sync::Mutex<JoinSet<()>>>,
}

impl Scheduler {
    /// Create a stopped scheduler whose firings share `pool_size` workers.
    pub fn new(pool_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            firings: Arc::new(tokio::sync::Mutex::new(JoinSet::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin firing triggers. Registrations made before start fire from now on.
    pub fn start(&self) {
        let mut state = self.state();
        if state.running {
            return;
        }
        state.running = true;

        let keys: Vec<TriggerKey> = state.triggers.keys().cloned().collect();
        for key in &keys {
            self.spawn_timer(&mut state, key);
        }
        tracing::info!("Scheduler: Started with {} triggers", keys.len());
    }

    /// Stop firing, drop every registration and wait up to `grace` for
    /// in-flight firings before cancelling them.
    pub async fn shutdown(&self, grace: Duration) {
        let timers: Vec<JoinHandle<()>> = {
            let mut state = self.state();
            state.running = false;
            state.jobs.clear();
            let timers = state.triggers.drain().filter_map(|(_, t)| t.timer).collect();
            timers
        };
        for timer in timers {
            timer.abort();
        }

        let mut firings = self.firings.lock().await;
        let pending = firings.len();
        let drained = tokio::time::timeout(grace, async {
            while firings.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "Scheduler: Cancelling firings still running after {:?}",
                grace
            );
            firings.abort_all();
        }
        tracing::info!("Scheduler: Shut down ({} firings were pending)", pending);
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Register a job. Fails if the key is taken.
    pub fn add_job(&self, key: JobKey, job: Arc<dyn Job>) -> Result<(), SchedulerError> {
        let mut state = self.state();
        if state.jobs.contains_key(&key) {
            return Err(SchedulerError::JobExists(key));
        }

        tracing::debug!("Scheduler: Adding job {}", key);
        state.jobs.insert(
            key,
            JobEntry {
                job,
                paused: false,
                running: Arc::new(Semaphore::new(1)),
                triggers: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Remove a job and all its triggers. A firing already in progress is
    /// allowed to finish.
    pub fn remove_job(&self, key: &JobKey) -> bool {
        let mut state = self.state();
        let Some(entry) = state.jobs.remove(key) else {
            return false;
        };

        for trigger in &entry.triggers {
            if let Some(t) = state.triggers.remove(trigger) {
                if let Some(timer) = t.timer {
                    timer.abort();
                }
            }
        }
        tracing::info!("Scheduler: Removed job {}", key);
        true
    }

    pub fn is_job_registered(&self, key: &JobKey) -> bool {
        self.state().jobs.contains_key(key)
    }

    /// `None` if the job is not registered.
    pub fn is_job_paused(&self, key: &JobKey) -> Option<bool> {
        self.state().jobs.get(key).map(|j| j.paused)
    }

    /// Register a trigger for a job and return its key. A trigger that
    /// already carries a key keeps it; otherwise a fresh one is assigned in
    /// the job's group.
    pub fn schedule_trigger(
        &self,
        config: TriggerConfig,
        job_key: &JobKey,
    ) -> Result<TriggerKey, SchedulerError> {
        let mut state = self.state();
        let paused = match state.jobs.get(job_key) {
            Some(job) => job.paused,
            None => return Err(SchedulerError::UnknownJob(job_key.clone())),
        };

        let key = match config.key() {
            Some(key) => key.clone(),
            None => loop {
                let candidate = TriggerKey::new(
                    &format!("{}-{:016x}", job_key.name, rand::random::<u64>()),
                    &job_key.group,
                );
                if !state.triggers.contains_key(&candidate) {
                    break candidate;
                }
            },
        };
        if state.triggers.contains_key(&key) {
            return Err(SchedulerError::TriggerExists(key));
        }

        let config = config.with_key(key.clone());
        let (control, _) = watch::channel(TriggerControl {
            config: config.clone(),
            paused,
        });
        state.triggers.insert(
            key.clone(),
            TriggerEntry {
                job_key: job_key.clone(),
                config,
                control,
                timer: None,
            },
        );
        if let Some(job) = state.jobs.get_mut(job_key) {
            job.triggers.insert(key.clone());
        }
        if state.running {
            self.spawn_timer(&mut state, &key);
        }

        tracing::info!("Scheduler: Scheduled trigger {} for job {}", key, job_key);
        Ok(key)
    }

    /// Replace the cadence of a trigger, keeping its key.
    pub fn reschedule_trigger(
        &self,
        key: &TriggerKey,
        config: TriggerConfig,
    ) -> Result<TriggerConfig, SchedulerError> {
        let mut state = self.state();
        let entry = state
            .triggers
            .get_mut(key)
            .ok_or_else(|| SchedulerError::UnknownTrigger(key.clone()))?;

        let config = config.with_key(key.clone());
        entry.config = config.clone();
        entry.control.send_modify(|c| c.config = config.clone());

        tracing::info!("Scheduler: Rescheduled trigger {}", key);
        Ok(config)
    }

    /// Remove a trigger. Returns whether it was registered.
    pub fn unschedule_trigger(&self, key: &TriggerKey) -> bool {
        let mut state = self.state();
        let Some(entry) = state.triggers.remove(key) else {
            return false;
        };

        if let Some(timer) = entry.timer {
            timer.abort();
        }
        if let Some(job) = state.jobs.get_mut(&entry.job_key) {
            job.triggers.remove(key);
        }
        tracing::info!("Scheduler: Unscheduled trigger {}", key);
        true
    }

    pub fn get_trigger(&self, key: &TriggerKey) -> Option<TriggerConfig> {
        self.state().triggers.get(key).map(|t| t.config.clone())
    }

    pub fn is_trigger_registered(&self, key: &TriggerKey) -> bool {
        self.state().triggers.contains_key(key)
    }

    /// The triggers of a job, ordered by key.
    pub fn triggers_of_job(&self, job_key: &JobKey) -> Vec<TriggerConfig> {
        let state = self.state();
        state
            .jobs
            .get(job_key)
            .map(|job| {
                job.triggers
                    .iter()
                    .filter_map(|k| state.triggers.get(k).map(|t| t.config.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stop firing a job's triggers. Returns `false` if it was already paused.
    pub fn pause_job(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        self.set_paused(key, true)
    }

    /// Resume a paused job. Firings missed while paused are not replayed.
    pub fn resume_job(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        self.set_paused(key, false)
    }

    fn set_paused(&self, key: &JobKey, paused: bool) -> Result<bool, SchedulerError> {
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(key)
            .ok_or_else(|| SchedulerError::UnknownJob(key.clone()))?;
        if job.paused == paused {
            return Ok(false);
        }
        job.paused = paused;

        let triggers: Vec<TriggerKey> = job.triggers.iter().cloned().collect();
        for trigger in &triggers {
            if let Some(t) = state.triggers.get(trigger) {
                t.control.send_modify(|c| c.paused = paused);
            }
        }

        tracing::info!(
            "Scheduler: {} job {}",
            if paused { "Paused" } else { "Resumed" },
            key
        );
        Ok(true)
    }

    fn spawn_timer(&self, state: &mut State, key: &TriggerKey) {
        if let Some(entry) = state.triggers.get_mut(key) {
            if let Some(old) = entry.timer.take() {
                old.abort();
            }
            let control = entry.control.subscribe();
            entry.timer = Some(tokio::spawn(run_timer(self.clone(), key.clone(), control)));
        }
    }

    /// Launch one firing of the job behind `trigger`, unless the job is
    /// paused or its previous firing is still running.
    async fn fire(&self, trigger: &TriggerKey, fire_time: DateTime<Utc>) {
        let (job_key, job, running) = {
            let state = self.state();
            if !state.running {
                return;
            }
            let Some(entry) = state.triggers.get(trigger) else {
                return;
            };
            let Some(job) = state.jobs.get(&entry.job_key) else {
                return;
            };
            if job.paused {
                return;
            }
            (entry.job_key.clone(), job.job.clone(), job.running.clone())
        };

        let permit = match running.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(
                    "Scheduler: Skipping firing of {} by {}, previous firing still running",
                    job_key,
                    trigger
                );
                return;
            }
        };

        let ctx = JobContext {
            key: job_key,
            trigger: trigger.clone(),
            fire_time,
            scheduler: self.clone(),
        };
        let pool = self.pool.clone();

        let mut firings = self.firings.lock().await;
        if !self.is_running() {
            return;
        }
        while firings.try_join_next().is_some() {}

        firings.spawn(async move {
            let _running = permit;
            let Ok(_worker) = pool.acquire_owned().await else {
                return;
            };
            // The job may have been paused or removed while queued for a worker
            if !ctx.scheduler.may_fire(&ctx.key, &running) {
                tracing::debug!("Scheduler: Dropping queued firing of {}", ctx.key);
                return;
            }

            tracing::debug!("Scheduler: Firing {} by {}", ctx.key, ctx.trigger);
            let result = match AssertUnwindSafe(job.execute(&ctx)).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!("Scheduler: Job {} panicked: {}", ctx.key, message);
                    Err(JobError::Panicked(message))
                }
            };
            if let Err(e) = result {
                tracing::warn!("Scheduler: Job {} failed: {}", ctx.key, e);
                job.on_failure(&ctx, &e).await;
            }
        });
    }

    /// Whether the registration owning `running` is still live and unpaused.
    fn may_fire(&self, key: &JobKey, running: &Arc<Semaphore>) -> bool {
        let state = self.state();
        state.running
            && state
                .jobs
                .get(key)
                .is_some_and(|job| !job.paused && Arc::ptr_eq(&job.running, running))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Timer loop of a single trigger.
async fn run_timer(
    scheduler: Scheduler,
    key: TriggerKey,
    mut control: watch::Receiver<TriggerControl>,
) {
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        let current = control.borrow_and_update().clone();
        if current.paused {
            if control.changed().await.is_err() {
                break;
            }
            continue;
        }

        let now = Utc::now();
        // Never hand out a slot at or before the one already fired
        let from = match last_fired {
            Some(t) => now.max(t + ChronoDuration::milliseconds(1)),
            None => now,
        };
        let Some(next) = current.config.next_fire_time(from) else {
            tracing::info!("Scheduler: Trigger {} has no further fire times", key);
            // Keep the task alive so a reschedule can revive it.
            if control.changed().await.is_err() {
                break;
            }
            continue;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(wait) => {
                last_fired = Some(next);
                scheduler.fire(&key, next).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct Counter {
        fired: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        failures: AtomicUsize,
        fire_times: std::sync::Mutex<Vec<(JobKey, DateTime<Utc>)>>,
    }

    struct TestJob {
        counter: Arc<Counter>,
        delay: Duration,
        fail: bool,
        panic: bool,
    }

    impl TestJob {
        fn new(counter: &Arc<Counter>, delay_ms: u64) -> Arc<dyn Job> {
            Arc::new(Self {
                counter: counter.clone(),
                delay: Duration::from_millis(delay_ms),
                fail: false,
                panic: false,
            })
        }

        fn failing(counter: &Arc<Counter>) -> Arc<dyn Job> {
            Arc::new(Self {
                counter: counter.clone(),
                delay: Duration::ZERO,
                fail: true,
                panic: false,
            })
        }

        fn panicking(counter: &Arc<Counter>) -> Arc<dyn Job> {
            Arc::new(Self {
                counter: counter.clone(),
                delay: Duration::ZERO,
                fail: false,
                panic: true,
            })
        }
    }

    #[async_trait]
    impl Job for TestJob {
        async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
            self.counter.fired.fetch_add(1, Ordering::SeqCst);
            self.counter
                .fire_times
                .lock()
                .unwrap()
                .push((ctx.key.clone(), ctx.fire_time));
            if self.panic {
                panic!("job blew up");
            }
            let active = self.counter.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.counter.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.counter.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(JobError::Db(DbError::Poisoned));
            }
            Ok(())
        }

        async fn on_failure(&self, _ctx: &JobContext, error: &JobError) {
            if self.panic {
                assert!(matches!(error, JobError::Panicked(m) if m == "job blew up"));
            }
            self.counter.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn every_ms(ms: i64) -> TriggerConfig {
        TriggerConfig::repeat_forever(Utc::now(), ms, IntervalUnit::Millisecond).unwrap()
    }

    fn sleep_ms(ms: u64) -> tokio::time::Sleep {
        tokio::time::sleep(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_trigger_fires_repeatedly() {
        let scheduler = Scheduler::new(4);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("count", "test");

        assert_ok!(scheduler.add_job(key.clone(), TestJob::new(&counter, 0)));
        assert_ok!(scheduler.schedule_trigger(every_ms(50), &key));
        scheduler.start();

        sleep_ms(400).await;
        assert!(counter.fired.load(Ordering::SeqCst) >= 3);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_nothing_fires_before_start() {
        let scheduler = Scheduler::new(4);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("idle", "test");

        scheduler.add_job(key.clone(), TestJob::new(&counter, 0)).unwrap();
        scheduler.schedule_trigger(every_ms(20), &key).unwrap();

        sleep_ms(150).await;
        assert_eq!(counter.fired.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_overlapping_firings_are_skipped() {
        let scheduler = Scheduler::new(4);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("slow", "test");

        scheduler.add_job(key.clone(), TestJob::new(&counter, 200)).unwrap();
        // Two triggers on the same job must not overlap either
        scheduler.schedule_trigger(every_ms(20), &key).unwrap();
        scheduler.schedule_trigger(every_ms(30), &key).unwrap();
        scheduler.start();

        sleep_ms(700).await;
        assert_eq!(counter.max_active.load(Ordering::SeqCst), 1);
        let fired = counter.fired.load(Ordering::SeqCst);
        assert!((2..=4).contains(&fired), "fired {} times", fired);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrent_jobs() {
        let scheduler = Scheduler::new(1);
        let counter = Arc::new(Counter::default());

        for name in ["a", "b", "c"] {
            let key = JobKey::new(name, "test");
            scheduler.add_job(key.clone(), TestJob::new(&counter, 50)).unwrap();
            scheduler.schedule_trigger(every_ms(20), &key).unwrap();
        }
        scheduler.start();

        sleep_ms(400).await;
        assert!(counter.fired.load(Ordering::SeqCst) >= 3);
        assert_eq!(counter.max_active.load(Ordering::SeqCst), 1);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_each_slot_fires_once() {
        let scheduler = Scheduler::new(32);
        let counter = Arc::new(Counter::default());

        for i in 0..20 {
            let key = JobKey::new(&format!("job-{}", i), "test");
            scheduler.add_job(key.clone(), TestJob::new(&counter, 0)).unwrap();
            scheduler.schedule_trigger(every_ms(100), &key).unwrap();
        }
        scheduler.start();
        sleep_ms(1_000).await;
        scheduler.shutdown(Duration::from_secs(1)).await;

        let fire_times = counter.fire_times.lock().unwrap().clone();
        let distinct: BTreeSet<_> = fire_times.iter().cloned().collect();
        assert!(fire_times.len() >= 20);
        assert_eq!(fire_times.len(), distinct.len());
    }

    #[tokio::test]
    async fn test_panicking_job_counts_as_failure() {
        let scheduler = Scheduler::new(2);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("panics", "test");

        scheduler.add_job(key.clone(), TestJob::panicking(&counter)).unwrap();
        scheduler.schedule_trigger(every_ms(50), &key).unwrap();
        scheduler.start();

        sleep_ms(400).await;
        scheduler.shutdown(Duration::from_secs(1)).await;

        let fired = counter.fired.load(Ordering::SeqCst);
        assert!(fired >= 2);
        assert_eq!(counter.failures.load(Ordering::SeqCst), fired);
    }

    #[tokio::test]
    async fn test_queued_firing_dropped_after_pause() {
        let scheduler = Scheduler::new(1);
        let busy = Arc::new(Counter::default());
        let queued = Arc::new(Counter::default());
        let busy_key = JobKey::new("busy", "test");
        let queued_key = JobKey::new("queued", "test");

        scheduler.add_job(busy_key.clone(), TestJob::new(&busy, 300)).unwrap();
        scheduler.schedule_trigger(every_ms(10_000), &busy_key).unwrap();
        scheduler.add_job(queued_key.clone(), TestJob::new(&queued, 0)).unwrap();
        let later = Utc::now() + ChronoDuration::milliseconds(50);
        let trigger = TriggerConfig::repeat_forever(later, 10_000, IntervalUnit::Millisecond).unwrap();
        scheduler.schedule_trigger(trigger, &queued_key).unwrap();
        scheduler.start();

        // The busy job holds the only worker while the other firing waits
        sleep_ms(120).await;
        assert_eq!(busy.active.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pause_job(&queued_key), Ok(true));

        sleep_ms(400).await;
        assert_eq!(busy.fired.load(Ordering::SeqCst), 1);
        assert_eq!(queued.fired.load(Ordering::SeqCst), 0);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let scheduler = Scheduler::new(4);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("pausable", "test");

        scheduler.add_job(key.clone(), TestJob::new(&counter, 0)).unwrap();
        scheduler.schedule_trigger(every_ms(30), &key).unwrap();
        scheduler.start();
        sleep_ms(200).await;
        assert!(counter.fired.load(Ordering::SeqCst) > 0);

        assert_eq!(scheduler.pause_job(&key), Ok(true));
        assert_eq!(scheduler.pause_job(&key), Ok(false));
        assert_eq!(scheduler.is_job_paused(&key), Some(true));

        sleep_ms(50).await;
        let paused_at = counter.fired.load(Ordering::SeqCst);
        sleep_ms(200).await;
        assert_eq!(counter.fired.load(Ordering::SeqCst), paused_at);

        assert_eq!(scheduler.resume_job(&key), Ok(true));
        assert_eq!(scheduler.resume_job(&key), Ok(false));
        sleep_ms(200).await;
        assert!(counter.fired.load(Ordering::SeqCst) > paused_at);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_trigger_added_to_paused_job_stays_quiet() {
        let scheduler = Scheduler::new(4);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("quiet", "test");

        scheduler.add_job(key.clone(), TestJob::new(&counter, 0)).unwrap();
        scheduler.pause_job(&key).unwrap();
        scheduler.start();
        scheduler.schedule_trigger(every_ms(20), &key).unwrap();

        sleep_ms(150).await;
        assert_eq!(counter.fired.load(Ordering::SeqCst), 0);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_unknown_keys() {
        let scheduler = Scheduler::new(1);
        let missing = JobKey::new("missing", "test");

        assert_err!(scheduler.schedule_trigger(every_ms(10), &missing));
        assert_eq!(
            scheduler.pause_job(&missing),
            Err(SchedulerError::UnknownJob(missing.clone()))
        );
        assert!(!scheduler.remove_job(&missing));

        let trigger = TriggerKey::new("nope", "test");
        assert_err!(scheduler.reschedule_trigger(&trigger, every_ms(10)));
        assert!(!scheduler.unschedule_trigger(&trigger));
    }

    #[tokio::test]
    async fn test_duplicate_registrations_rejected() {
        let scheduler = Scheduler::new(1);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("dup", "test");

        scheduler.add_job(key.clone(), TestJob::new(&counter, 0)).unwrap();
        assert_eq!(
            scheduler.add_job(key.clone(), TestJob::new(&counter, 0)),
            Err(SchedulerError::JobExists(key.clone()))
        );

        let trigger_key = scheduler.schedule_trigger(every_ms(1000), &key).unwrap();
        let saved = scheduler.get_trigger(&trigger_key).unwrap();
        assert_eq!(
            scheduler.schedule_trigger(saved, &key),
            Err(SchedulerError::TriggerExists(trigger_key))
        );
    }

    #[tokio::test]
    async fn test_reschedule_keeps_key() {
        let scheduler = Scheduler::new(1);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("P1", "service-1");

        scheduler.add_job(key.clone(), TestJob::new(&counter, 0)).unwrap();
        let trigger_key = scheduler.schedule_trigger(every_ms(1000), &key).unwrap();
        assert_eq!(trigger_key.group, "service-1");
        assert!(trigger_key.name.starts_with("P1-"));

        let replacement = TriggerConfig::repeat_forever(Utc::now(), 5, IntervalUnit::Minute).unwrap();
        let updated = scheduler
            .reschedule_trigger(&trigger_key, replacement.clone())
            .unwrap();
        assert_eq!(updated.key(), Some(&trigger_key));
        assert!(updated.same_cadence(&replacement));
        assert_eq!(scheduler.get_trigger(&trigger_key), Some(updated.clone()));
        assert_eq!(scheduler.triggers_of_job(&key), vec![updated]);
    }

    #[tokio::test]
    async fn test_remove_job_drops_triggers() {
        let scheduler = Scheduler::new(2);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("gone", "test");

        scheduler.add_job(key.clone(), TestJob::new(&counter, 0)).unwrap();
        let trigger_key = scheduler.schedule_trigger(every_ms(20), &key).unwrap();
        scheduler.start();
        sleep_ms(100).await;

        assert!(scheduler.remove_job(&key));
        assert!(!scheduler.is_job_registered(&key));
        assert!(!scheduler.is_trigger_registered(&trigger_key));

        sleep_ms(30).await;
        let after_remove = counter.fired.load(Ordering::SeqCst);
        sleep_ms(150).await;
        assert_eq!(counter.fired.load(Ordering::SeqCst), after_remove);

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failing_job_keeps_firing() {
        let scheduler = Scheduler::new(2);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("flaky", "test");

        scheduler.add_job(key.clone(), TestJob::failing(&counter)).unwrap();
        scheduler.schedule_trigger(every_ms(30), &key).unwrap();
        scheduler.start();

        sleep_ms(250).await;
        assert!(counter.failures.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.is_job_registered(&key));

        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_firing() {
        let scheduler = Scheduler::new(2);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("long", "test");

        scheduler.add_job(key.clone(), TestJob::new(&counter, 150)).unwrap();
        scheduler.schedule_trigger(every_ms(10_000), &key).unwrap();
        scheduler.start();

        sleep_ms(50).await;
        assert_eq!(counter.active.load(Ordering::SeqCst), 1);

        scheduler.shutdown(Duration::from_secs(2)).await;
        assert_eq!(counter.active.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_running());
        assert!(!scheduler.is_job_registered(&key));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_after_grace() {
        let scheduler = Scheduler::new(2);
        let counter = Arc::new(Counter::default());
        let key = JobKey::new("stuck", "test");

        scheduler.add_job(key.clone(), TestJob::new(&counter, 60_000)).unwrap();
        scheduler.schedule_trigger(every_ms(10_000), &key).unwrap();
        scheduler.start();
        sleep_ms(50).await;

        let started = std::time::Instant::now();
        scheduler.shutdown(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

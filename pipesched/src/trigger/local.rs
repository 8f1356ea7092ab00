use std::{
    ops::Sub,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use fxhash::FxHashMap;
use tokio::{sync::Semaphore, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::pipeline::{parse_cron, Trigger};

use super::{JobCallback, TriggerEngine, TriggerError};

const DEFAULT_MAX_WORKERS: usize = 10;

/// Fires callbacks from tokio timers, running them on a bounded pool of workers.
///
/// Each recurring job gets a task sleeping until its next fire time. Fired callbacks wait for one
/// of `max_workers` slots before running. Dropping the last clone stops every timer.
#[derive(Debug, Clone)]
pub struct LocalTriggerEngine {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    jobs: Mutex<FxHashMap<String, ScheduledJob>>,
    dispatcher: Dispatcher,
    generation: AtomicU64,
}

#[derive(Debug)]
struct ScheduledJob {
    cancellation: CancellationToken,
    generation: u64,
    recurring: bool,
}

#[derive(Debug, Clone)]
struct Dispatcher {
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

enum Cadence {
    Cron(Box<Schedule>),
    Interval(Duration),
}

impl Default for LocalTriggerEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

impl LocalTriggerEngine {
    pub fn new(max_workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Default::default(),
                dispatcher: Dispatcher {
                    workers: Arc::new(Semaphore::new(max_workers.max(1))),
                    tracker: TaskTracker::new(),
                    shutdown: CancellationToken::new(),
                },
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Callbacks currently running or waiting for a worker.
    pub fn in_flight(&self) -> usize {
        self.inner.dispatcher.tracker.len()
    }

    fn schedule(
        &self,
        job_id: &str,
        recurring: bool,
    ) -> Result<(CancellationToken, u64), TriggerError> {
        if self.inner.dispatcher.shutdown.is_cancelled() {
            return Err(TriggerError::ShutDown);
        }
        let cancellation = self.inner.dispatcher.shutdown.child_token();
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.inner.jobs().insert(
            job_id.to_owned(),
            ScheduledJob {
                cancellation: cancellation.clone(),
                generation,
                recurring,
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(job_id, "Replacing trigger for {job_id}");
            previous.cancellation.cancel();
        }
        Ok((cancellation, generation))
    }
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, FxHashMap<String, ScheduledJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget(&self, job_id: &str, generation: u64) {
        let mut jobs = self.jobs();
        if jobs.get(job_id).is_some_and(|job| job.generation == generation) {
            jobs.remove(job_id);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dispatcher.shutdown.cancel();
    }
}

impl Dispatcher {
    /// Runs `callback` on a worker unless the previous invocation is still in flight.
    fn dispatch(&self, job_id: &str, callback: &JobCallback, in_flight: &Arc<AtomicBool>) {
        if in_flight.swap(true, Ordering::AcqRel) {
            tracing::debug!(job_id, "Skipping fire of {job_id}, previous run still in flight");
            return;
        }
        let guard = InFlight(Arc::clone(in_flight));
        let workers = Arc::clone(&self.workers);
        let shutdown = self.shutdown.clone();
        let callback = Arc::clone(callback);
        let job_id = job_id.to_owned();

        self.tracker.spawn(async move {
            let _guard = guard;
            let permit = tokio::select! {
                permit = workers.acquire_owned() => permit,
                _ = shutdown.cancelled() => return,
            };
            let Ok(_permit) = permit else {
                return;
            };
            tracing::debug!(%job_id, "Firing {job_id}");
            callback().await;
        });
    }
}

struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Cadence {
    fn from_trigger(job_id: &str, trigger: &Trigger) -> Result<Self, TriggerError> {
        let invalid = |source| TriggerError::Invalid {
            job_id: job_id.to_owned(),
            source,
        };
        trigger.validate().map_err(invalid)?;
        match trigger {
            Trigger::Cron { expression } => Ok(Self::Cron(Box::new(
                parse_cron(expression).map_err(invalid)?,
            ))),
            Trigger::Interval { seconds } => Ok(Self::Interval(Duration::from_secs(*seconds))),
            Trigger::Manual => Err(TriggerError::NotRecurring(job_id.to_owned())),
        }
    }
}

async fn run_cron(
    job_id: String,
    schedule: Schedule,
    callback: JobCallback,
    dispatcher: Dispatcher,
    cancellation: CancellationToken,
) {
    let in_flight = Arc::new(AtomicBool::new(false));
    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            tracing::warn!(%job_id, "No future fire time for {job_id}");
            break;
        };
        let delay = next
            .sub(Utc::now())
            .sub(TimeDelta::milliseconds(10))
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                dispatcher.dispatch(&job_id, &callback, &in_flight);
                // Do not wake up again before `next` has passed.
                if let Ok(delay) = (next - Utc::now()).to_std() {
                    tokio::time::sleep(delay).await;
                }
            }
            _ = cancellation.cancelled() => break,
        }
    }
    tracing::debug!(%job_id, "Shutting down cron trigger for {job_id}");
}

async fn run_interval(
    job_id: String,
    period: Duration,
    callback: JobCallback,
    dispatcher: Dispatcher,
    cancellation: CancellationToken,
) {
    let in_flight = Arc::new(AtomicBool::new(false));
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticks.tick() => dispatcher.dispatch(&job_id, &callback, &in_flight),
            _ = cancellation.cancelled() => break,
        }
    }
    tracing::debug!(%job_id, "Shutting down interval trigger for {job_id}");
}

#[async_trait]
impl TriggerEngine for LocalTriggerEngine {
    fn register(
        &self,
        job_id: &str,
        trigger: &Trigger,
        callback: JobCallback,
    ) -> Result<(), TriggerError> {
        let cadence = Cadence::from_trigger(job_id, trigger)?;
        let (cancellation, _) = self.schedule(job_id, true)?;
        let dispatcher = self.inner.dispatcher.clone();
        let job_id = job_id.to_owned();
        tracing::debug!(%job_id, %trigger, "Registering {job_id} to fire {trigger}");

        match cadence {
            Cadence::Cron(schedule) => tokio::spawn(run_cron(
                job_id,
                *schedule,
                callback,
                dispatcher,
                cancellation,
            )),
            Cadence::Interval(period) => tokio::spawn(run_interval(
                job_id,
                period,
                callback,
                dispatcher,
                cancellation,
            )),
        };
        Ok(())
    }

    fn remove(&self, job_id: &str) -> bool {
        match self.inner.jobs().remove(job_id) {
            Some(job) => {
                job.cancellation.cancel();
                tracing::debug!(job_id, "Removed trigger {job_id}");
                true
            }
            None => false,
        }
    }

    fn add_one_shot(
        &self,
        job_id: &str,
        run_at: DateTime<Utc>,
        callback: JobCallback,
    ) -> Result<(), TriggerError> {
        let (cancellation, generation) = self.schedule(job_id, false)?;
        let dispatcher = self.inner.dispatcher.clone();
        let inner = Arc::downgrade(&self.inner);
        let job_id = job_id.to_owned();
        let delay = (run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(%job_id, %run_at, "Scheduling {job_id} once at {run_at}");

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    dispatcher.dispatch(&job_id, &callback, &Arc::new(AtomicBool::new(false)));
                }
                _ = cancellation.cancelled() => {}
            }
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.forget(&job_id, generation);
            }
        });
        Ok(())
    }

    fn registered(&self) -> Vec<String> {
        let mut ids = self
            .inner
            .jobs()
            .iter()
            .filter(|(_, job)| job.recurring)
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    async fn shutdown(&self, wait: bool) {
        tracing::debug!(wait, "Shutting down trigger engine");
        self.inner.dispatcher.shutdown.cancel();
        self.inner.jobs().clear();
        self.inner.dispatcher.tracker.close();
        if wait {
            self.inner.dispatcher.tracker.wait().await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;

    use super::*;
    use crate::trigger::callback;

    fn counting() -> (Arc<AtomicUsize>, JobCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let callback = callback({
            let count = Arc::clone(&count);
            move || {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        (count, callback)
    }

    #[tokio::test(start_paused = true)]
    async fn interval_triggers_fire_repeatedly() {
        let engine = LocalTriggerEngine::default();
        let (count, callback) = counting();

        engine
            .register("sync", &Trigger::every(Duration::from_secs(60)), callback)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(185)).await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(engine.registered(), vec!["sync"]);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_triggers_stop_firing() {
        let engine = LocalTriggerEngine::default();
        let (count, callback) = counting();
        engine
            .register("sync", &Trigger::every(Duration::from_secs(10)), callback)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert!(engine.remove("sync"));
        assert!(!engine.remove("sync"));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(engine.registered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_fires_are_skipped() {
        let engine = LocalTriggerEngine::default();
        let count = Arc::new(AtomicUsize::new(0));
        let slow = callback({
            let count = Arc::clone(&count);
            move || {
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(25)).await;
                }
            }
        });

        engine
            .register("slow", &Trigger::every(Duration::from_secs(10)), slow)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(45)).await;

        // Fires at 10 and 40; those at 20 and 30 found the first run still going.
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shots_fire_once() {
        let engine = LocalTriggerEngine::default();
        let (count, callback) = counting();

        engine
            .add_one_shot("retry", Utc::now() + TimeDelta::seconds(30), callback)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!engine.remove("retry"));
    }

    #[tokio::test(start_paused = true)]
    async fn one_shots_in_the_past_fire_immediately_and_can_be_removed() {
        let engine = LocalTriggerEngine::default();
        let (count, callback) = counting();
        engine
            .add_one_shot("now", Utc::now() - TimeDelta::seconds(5), callback.clone())
            .unwrap();
        engine
            .add_one_shot("later", Utc::now() + TimeDelta::minutes(5), callback)
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(engine.remove("later"));
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_pool_bounds_concurrency() {
        let engine = LocalTriggerEngine::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            engine
                .add_one_shot(
                    &format!("job-{i}"),
                    Utc::now(),
                    callback(move || {
                        let running = Arc::clone(&running);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                        }
                    }),
                )
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_running_callbacks() {
        let engine = LocalTriggerEngine::default();
        let finished = Arc::new(AtomicBool::new(false));
        engine
            .add_one_shot(
                "long",
                Utc::now(),
                callback({
                    let finished = Arc::clone(&finished);
                    move || {
                        let finished = Arc::clone(&finished);
                        async move {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            finished.store(true, Ordering::SeqCst);
                        }
                    }
                }),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        engine.shutdown(true).await;

        assert!(finished.load(Ordering::SeqCst));
        assert_matches!(
            engine.register("late", &Trigger::every(Duration::from_secs(1)), counting().1),
            Err(TriggerError::ShutDown)
        );
    }

    #[tokio::test]
    async fn manual_and_invalid_triggers_are_rejected() {
        let engine = LocalTriggerEngine::default();

        assert_matches!(
            engine.register("manual", &Trigger::Manual, counting().1),
            Err(TriggerError::NotRecurring(_))
        );
        assert_matches!(
            engine.register("bad", &Trigger::cron("not a cron"), counting().1),
            Err(TriggerError::Invalid { .. })
        );
        assert!(engine.registered().is_empty());
    }

    #[tokio::test]
    async fn cron_triggers_are_registered() {
        let engine = LocalTriggerEngine::default();

        engine
            .register("nightly", &Trigger::cron("0 2 * * *"), counting().1)
            .unwrap();

        assert_eq!(engine.registered(), vec!["nightly"]);
        engine.shutdown(false).await;
        assert!(engine.registered().is_empty());
    }
}

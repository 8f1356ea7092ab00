//! Admission control for named, finite capacities shared between pipeline runs.
//!
//! Each resource is a counting semaphore with a configurable limit. Slots are handed out as a
//! [`ResourcePermit`] which gives its slots back when dropped, so a run releases what it holds on
//! every exit path: normal return, early return through `?`, panic, or the future being dropped.
//!
//! ```
//! # use pipesched::resource::ResourceManager;
//! # use std::time::Duration;
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let resources = ResourceManager::new([("db_pool", 10), ("http_api", 2)]);
//!
//! let permit = resources
//!     .acquire("db_pool", 4, Duration::from_secs(1), "crm_sync")
//!     .await
//!     .unwrap();
//! assert_eq!(resources.usage("db_pool").unwrap().available, 6);
//!
//! drop(permit);
//! assert_eq!(resources.usage("db_pool").unwrap().available, 10);
//! # });
//! ```
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;

/// The resource whose limit doubles as the database connection budget.
pub const DB_POOL: &str = "db_pool";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Unknown resource {0}")]
    UnknownResource(String),
    #[error("Requested {requested} slots of {resource} but its limit is {limit}")]
    ExceedsLimit {
        resource: String,
        requested: usize,
        limit: usize,
    },
    #[error("Timed out after {timeout:?} waiting for {count} slots of {resource}")]
    Timeout {
        resource: String,
        count: usize,
        timeout: Duration,
    },
    #[error("Resource manager in bad state")]
    BadState,
}

/// Point in time statistics for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub resource: String,
    pub in_use: usize,
    pub limit: usize,
    pub available: usize,
    pub waiting: usize,
}

/// Hands out slots of named resources.
///
/// Cloning is cheap and clones share the same pools.
#[derive(Debug, Clone, Default)]
pub struct ResourceManager {
    table: Arc<ResourceTable>,
}

impl ResourceManager {
    pub fn new<S: Into<String>>(limits: impl IntoIterator<Item = (S, usize)>) -> Self {
        let manager = Self::default();
        for (resource, limit) in limits {
            manager.set_limit(resource, limit);
        }
        manager
    }

    /// Waits up to `timeout` for `count` slots of `resource`.
    ///
    /// Either all `count` slots are acquired or none are: a timeout leaves nothing held.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(
        &self,
        resource: &str,
        count: usize,
        timeout: Duration,
        caller: &str,
    ) -> Result<ResourcePermit, ResourceError> {
        let permits = u32::try_from(count).map_err(|_| ResourceError::ExceedsLimit {
            resource: resource.to_owned(),
            requested: count,
            limit: u32::MAX as usize,
        })?;
        let semaphore = self.table.begin_wait(resource, count)?;
        let waiter = WaitGuard {
            table: &self.table,
            resource,
        };
        let started = Instant::now();
        let acquired = tokio::time::timeout(timeout, semaphore.acquire_many(permits)).await;
        drop(waiter);

        match acquired {
            Ok(Ok(permit)) => {
                // Released by hand in `ResourcePermit::drop` so shrinking limits can absorb slots.
                permit.forget();
                self.table.mark_acquired(resource, count);
                tracing::debug!(
                    resource,
                    count,
                    caller,
                    waited = ?started.elapsed(),
                    "Acquired {count} slots of {resource} for {caller}"
                );
                Ok(ResourcePermit {
                    resource: resource.to_owned(),
                    count,
                    caller: caller.to_owned(),
                    table: Arc::clone(&self.table),
                    acquired_at: Instant::now(),
                })
            }
            Ok(Err(_closed)) => Err(ResourceError::BadState),
            Err(_elapsed) => {
                tracing::warn!(
                    resource,
                    count,
                    caller,
                    ?timeout,
                    "Timed out waiting for {count} slots of {resource} for {caller}"
                );
                Err(ResourceError::Timeout {
                    resource: resource.to_owned(),
                    count,
                    timeout,
                })
            }
        }
    }

    /// Whether `count` slots of `resource` are free right now.
    ///
    /// This is advisory only: nothing is reserved, so a later [`ResourceManager::acquire`] may
    /// still have to wait.
    pub fn has_capacity(&self, resource: &str, count: usize) -> bool {
        self.table
            .read(resource, |state| {
                count <= state.limit && count <= state.semaphore.available_permits()
            })
            .ok()
            .flatten()
            .unwrap_or(false)
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.table
            .read(resource, |_| ())
            .is_ok_and(|found| found.is_some())
    }

    pub fn usage(&self, resource: &str) -> Result<ResourceUsage, ResourceError> {
        self.table
            .read(resource, |state| state.usage(resource))
            .and_then(|usage| {
                usage.ok_or_else(|| ResourceError::UnknownResource(resource.to_owned()))
            })
    }

    /// Usage of every known resource ordered by name.
    pub fn usage_all(&self) -> Result<Vec<ResourceUsage>, ResourceError> {
        self.table.snapshot()
    }

    /// Sets the limit applied to future acquisitions, creating the resource if it is new.
    ///
    /// Slots already held are unaffected. When the limit shrinks below the number of slots in use
    /// the excess is absorbed as those slots are released.
    pub fn set_limit(&self, resource: impl Into<String>, limit: usize) {
        let resource = resource.into();
        tracing::debug!(%resource, limit, "Setting limit of {resource} to {limit}");
        self.table.set_limit(resource, limit);
    }
}

/// Slots of one resource held by a caller, released when dropped.
#[derive(Debug)]
#[must_use = "slots are released as soon as the permit is dropped"]
pub struct ResourcePermit {
    resource: String,
    count: usize,
    caller: String,
    table: Arc<ResourceTable>,
    acquired_at: Instant,
}

impl ResourcePermit {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        self.table.release(&self.resource, self.count);
        tracing::debug!(
            resource = %self.resource,
            count = self.count,
            caller = %self.caller,
            held = ?self.acquired_at.elapsed(),
            "Released {} slots of {}",
            self.count,
            self.resource,
        );
    }
}

#[derive(Debug)]
struct ResourceState {
    semaphore: Arc<Semaphore>,
    limit: usize,
    in_use: usize,
    waiting: usize,
    /// Slots to swallow on release because the limit shrank while they were held.
    debt: usize,
}

impl ResourceState {
    fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            in_use: 0,
            waiting: 0,
            debt: 0,
        }
    }

    fn usage(&self, resource: &str) -> ResourceUsage {
        ResourceUsage {
            resource: resource.to_owned(),
            in_use: self.in_use,
            limit: self.limit,
            available: self.semaphore.available_permits(),
            waiting: self.waiting,
        }
    }

    fn resize(&mut self, limit: usize) {
        if limit >= self.limit {
            let grow = limit - self.limit;
            let absorbed = grow.min(self.debt);
            self.debt -= absorbed;
            self.semaphore.add_permits(grow - absorbed);
        } else {
            let shrink = self.limit - limit;
            let taken = shrink.min(self.semaphore.available_permits());
            if taken > 0 {
                if let Ok(permit) = self.semaphore.try_acquire_many(taken as u32) {
                    permit.forget();
                }
            }
            self.debt += shrink - taken;
        }
        self.limit = limit;
    }

    fn release(&mut self, count: usize) {
        let repaid = count.min(self.debt);
        self.debt -= repaid;
        self.in_use = self.in_use.saturating_sub(count);
        self.semaphore.add_permits(count - repaid);
    }
}

/// The resource map behind its lock; only ever touched through these accessors.
///
/// The lock is never held across an `.await`.
#[derive(Debug, Default)]
struct ResourceTable {
    resources: Mutex<BTreeMap<String, ResourceState>>,
}

impl ResourceTable {
    fn read<R>(
        &self,
        resource: &str,
        f: impl FnOnce(&ResourceState) -> R,
    ) -> Result<Option<R>, ResourceError> {
        Ok(self
            .resources
            .lock()
            .map_err(|_| ResourceError::BadState)?
            .get(resource)
            .map(f))
    }

    fn snapshot(&self) -> Result<Vec<ResourceUsage>, ResourceError> {
        Ok(self
            .resources
            .lock()
            .map_err(|_| ResourceError::BadState)?
            .iter()
            .map(|(name, state)| state.usage(name))
            .collect())
    }

    fn begin_wait(&self, resource: &str, count: usize) -> Result<Arc<Semaphore>, ResourceError> {
        let mut resources = self.resources.lock().map_err(|_| ResourceError::BadState)?;
        let state = resources
            .get_mut(resource)
            .ok_or_else(|| ResourceError::UnknownResource(resource.to_owned()))?;
        if count > state.limit {
            return Err(ResourceError::ExceedsLimit {
                resource: resource.to_owned(),
                requested: count,
                limit: state.limit,
            });
        }
        state.waiting += 1;
        Ok(Arc::clone(&state.semaphore))
    }

    fn end_wait(&self, resource: &str) {
        self.update(resource, |state| {
            state.waiting = state.waiting.saturating_sub(1)
        });
    }

    fn mark_acquired(&self, resource: &str, count: usize) {
        self.update(resource, |state| state.in_use += count);
    }

    fn release(&self, resource: &str, count: usize) {
        self.update(resource, |state| state.release(count));
    }

    fn set_limit(&self, resource: String, limit: usize) {
        let mut resources = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match resources.get_mut(&resource) {
            Some(state) => state.resize(limit),
            None => {
                resources.insert(resource, ResourceState::new(limit));
            }
        }
    }

    // Bookkeeping that must happen even if another holder panicked with the lock held.
    fn update(&self, resource: &str, f: impl FnOnce(&mut ResourceState)) {
        if let Some(state) = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(resource)
        {
            f(state)
        }
    }
}

struct WaitGuard<'a> {
    table: &'a ResourceTable,
    resource: &'a str,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.table.end_wait(self.resource);
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn acquire_and_release_restores_availability() {
        let resources = ResourceManager::new([(DB_POOL, 10)]);

        let permit = resources.acquire(DB_POOL, 3, SECOND, "test").await.unwrap();
        assert_eq!(
            resources.usage(DB_POOL).unwrap(),
            ResourceUsage {
                resource: DB_POOL.to_owned(),
                in_use: 3,
                limit: 10,
                available: 7,
                waiting: 0,
            }
        );
        assert_eq!(permit.count(), 3);
        assert_eq!(permit.caller(), "test");

        drop(permit);
        let usage = resources.usage(DB_POOL).unwrap();
        assert_eq!(usage.in_use, 0);
        assert_eq!(usage.available, 10);
    }

    #[tokio::test]
    async fn acquiring_more_than_the_limit_fails_without_consuming() {
        let resources = ResourceManager::new([(DB_POOL, 10)]);

        assert_matches!(
            resources.acquire(DB_POOL, 11, SECOND, "test").await,
            Err(ResourceError::ExceedsLimit { requested: 11, limit: 10, .. })
        );
        assert_eq!(resources.usage(DB_POOL).unwrap().available, 10);
        assert_eq!(resources.usage(DB_POOL).unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn unknown_resources_are_rejected() {
        let resources = ResourceManager::default();

        assert_matches!(
            resources.acquire("soap_api", 1, SECOND, "test").await,
            Err(ResourceError::UnknownResource(name)) if name == "soap_api"
        );
        assert_matches!(
            resources.usage("soap_api"),
            Err(ResourceError::UnknownResource(_))
        );
        assert!(!resources.has_capacity("soap_api", 1));
        assert!(!resources.contains("soap_api"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_no_partial_acquisition() {
        let resources = ResourceManager::new([("http_api", 3)]);
        let _held = resources.acquire("http_api", 1, SECOND, "first").await.unwrap();

        assert_matches!(
            resources.acquire("http_api", 3, SECOND, "second").await,
            Err(ResourceError::Timeout { count: 3, .. })
        );

        let usage = resources.usage("http_api").unwrap();
        assert_eq!(usage.in_use, 1);
        assert_eq!(usage.available, 2);
        assert_eq!(usage.waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_counted() {
        let resources = ResourceManager::new([("http_api", 1)]);
        let held = resources.acquire("http_api", 1, SECOND, "first").await.unwrap();

        let waiter = tokio::spawn({
            let resources = resources.clone();
            async move {
                resources
                    .acquire("http_api", 1, Duration::from_secs(60), "second")
                    .await
                    .map(|permit| permit.caller().to_owned())
            }
        });
        tokio::task::yield_now().await;
        assert_eq!(resources.usage("http_api").unwrap().waiting, 1);

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), "second");
        assert_eq!(resources.usage("http_api").unwrap().waiting, 0);
        assert_eq!(resources.usage("http_api").unwrap().available, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquisitions_never_exceed_the_limit() {
        let limit = 3;
        let resources = ResourceManager::new([("soap_api", limit)]);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..24)
            .map(|i| {
                let resources = resources.clone();
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let _permit = resources
                        .acquire("soap_api", 1, Duration::from_secs(30), &format!("task-{i}"))
                        .await
                        .unwrap();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= limit);
        assert_eq!(resources.usage("soap_api").unwrap().available, limit);
    }

    #[tokio::test]
    async fn sequential_full_pool_cycles_do_not_deadlock() {
        let resources = ResourceManager::new([(DB_POOL, 10)]);

        for _ in 0..2 {
            let permit = resources.acquire(DB_POOL, 10, SECOND, "cycle").await.unwrap();
            assert_eq!(resources.usage(DB_POOL).unwrap().available, 0);
            drop(permit);
        }

        assert_eq!(resources.usage(DB_POOL).unwrap().available, 10);
    }

    #[tokio::test]
    async fn permits_are_released_when_the_holder_panics() {
        let resources = ResourceManager::new([(DB_POOL, 2)]);

        let result = tokio::spawn({
            let resources = resources.clone();
            async move {
                let _permit = resources.acquire(DB_POOL, 2, SECOND, "panicky").await;
                panic!("pipeline blew up");
            }
        })
        .await;

        assert!(result.unwrap_err().is_panic());
        assert_eq!(resources.usage(DB_POOL).unwrap().available, 2);
        assert_eq!(resources.usage(DB_POOL).unwrap().in_use, 0);
    }

    #[tokio::test]
    async fn has_capacity_does_not_reserve() {
        let resources = ResourceManager::new([("http_api", 2)]);

        assert!(resources.has_capacity("http_api", 2));
        assert!(resources.has_capacity("http_api", 2));
        assert!(!resources.has_capacity("http_api", 3));

        let _permit = resources.acquire("http_api", 1, SECOND, "test").await.unwrap();
        assert!(!resources.has_capacity("http_api", 2));
        assert!(resources.has_capacity("http_api", 1));
    }

    #[tokio::test]
    async fn shrinking_the_limit_leaves_held_slots_alone() {
        let resources = ResourceManager::new([("http_api", 4)]);
        let permit = resources.acquire("http_api", 3, SECOND, "test").await.unwrap();

        resources.set_limit("http_api", 2);
        let usage = resources.usage("http_api").unwrap();
        assert_eq!((usage.in_use, usage.limit, usage.available), (3, 2, 0));

        drop(permit);
        let usage = resources.usage("http_api").unwrap();
        assert_eq!((usage.in_use, usage.limit, usage.available), (0, 2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn growing_the_limit_admits_waiters() {
        let resources = ResourceManager::new([("http_api", 1)]);
        let _held = resources.acquire("http_api", 1, SECOND, "first").await.unwrap();

        let waiter = tokio::spawn({
            let resources = resources.clone();
            async move {
                resources
                    .acquire("http_api", 1, Duration::from_secs(60), "second")
                    .await
                    .is_ok()
            }
        });
        tokio::task::yield_now().await;
        resources.set_limit("http_api", 2);

        assert!(waiter.await.unwrap());
        assert_eq!(resources.usage("http_api").unwrap().limit, 2);
    }

    #[tokio::test]
    async fn set_limit_creates_new_resources() {
        let resources = ResourceManager::default();
        resources.set_limit("soap_api", 2);
        resources.set_limit(DB_POOL, 5);

        let names = resources
            .usage_all()
            .unwrap()
            .into_iter()
            .map(|usage| (usage.resource, usage.available))
            .collect::<Vec<_>>();

        assert_eq!(names, vec![(DB_POOL.to_owned(), 5), ("soap_api".to_owned(), 2)]);
        assert!(resources.contains("soap_api"));
    }
}

//! Named, weighted sources of background work sharing a [`ServiceThreadPool`](super::ServiceThreadPool).

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use super::PoolShared;
use crate::concurrency::Semaphore;
use crate::prelude::*;

/// A single unit of service work.
pub type ServiceJob = Box<dyn FnOnce() + Send + 'static>;
/// Produces the next unit of work of a service when a worker gets to it, or [`None`] if there is nothing to do.
pub type JobGenerator = dyn Fn() -> Option<ServiceJob> + Send + Sync + 'static;
/// Gates whether a service may run right now.
pub type ExecutionCondition = dyn Fn() -> bool + Send + Sync + 'static;

/// How long a slice shutdown waits for the pool to hand back the permits of cancelled jobs.
const PERMIT_RECLAIM_TIMEOUT: Duration = Duration::from_millis(1000);
/// How long a slice shutdown waits for running jobs to finish.
const IN_FLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) struct SliceShared {
    pub(super) name: String,
    pub(super) weight: u32,
    generator: Box<JobGenerator>,
    condition: Option<Box<ExecutionCondition>>,
    pub(super) jobs: Semaphore,
    in_flight: AtomicUsize,
    alive: RwLock<bool>,
}

impl SliceShared {
    pub(super) fn new(
        name: String,
        weight: u32,
        generator: Box<JobGenerator>,
        condition: Option<Box<ExecutionCondition>>,
    ) -> Self {
        Self {
            name,
            weight,
            generator,
            condition,
            jobs: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            alive: RwLock::new(true),
        }
    }

    pub(super) fn queued_jobs(&self) -> usize {
        self.jobs.available_permits()
    }

    /// Runs one job of this service on the calling worker. Returns whether a queued job was consumed.
    pub(super) fn try_run(&self) -> bool {
        self.in_flight.fetch_add(1, AtomicOrdering::SeqCst);
        let consumed = self.try_run_inner();
        self.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
        consumed
    }

    fn try_run_inner(&self) -> bool {
        if !*self.alive.read().unwrap() {
            return false;
        }
        if self.condition.as_ref().is_some_and(|condition| !condition()) {
            return false;
        }
        if !self.jobs.try_acquire() {
            return false;
        }
        let Some(job) = (self.generator)() else {
            self.jobs.release(1);
            return false;
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            error!(service = %self.name, "Service job panicked: {}", panic_message(&payload));
        }
        true
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

/// Handle to a service registered with a [`ServiceThreadPool`](super::ServiceThreadPool).
/// Dropping the handle shuts the service down.
pub struct ServiceSlice {
    pub(super) shared: Arc<SliceShared>,
    pub(super) pool: Arc<PoolShared>,
}

impl ServiceSlice {
    /// The name of the service.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The scheduling weight of each job of the service.
    pub fn weight(&self) -> u32 {
        self.shared.weight
    }

    /// Number of jobs signalled but not yet taken by a worker.
    pub fn queued_jobs(&self) -> usize {
        self.shared.queued_jobs()
    }

    /// Whether the service still accepts jobs.
    pub fn is_alive(&self) -> bool {
        *self.shared.alive.read().unwrap()
    }

    /// Signals that one more job is available, the generator is polled for it once a worker picks this service.
    /// Returns false without signalling anything if the service was already shut down.
    pub fn execute(&self) -> bool {
        let alive = self.shared.alive.read().unwrap();
        if !*alive {
            return false;
        }
        // The weight must be visible before the job can be taken by any worker.
        self.pool
            .total_weight
            .fetch_add(i64::from(self.shared.weight), AtomicOrdering::AcqRel);
        self.shared.jobs.release(1);
        self.pool.jobs.release(1);
        true
    }

    /// Stops the service: queued jobs are cancelled and running jobs are waited for (bounded).
    /// Does nothing if the service is already shut down.
    pub fn shutdown(&self) {
        {
            let mut alive = self.shared.alive.write().unwrap();
            if !*alive {
                return;
            }
            *alive = false;
        }
        self.pool.remove_slice(&self.shared);

        let permits = self.shared.jobs.drain_permits();
        let cancelled_weight = i64::from(self.shared.weight) * permits as i64;
        let previous = self
            .pool
            .total_weight
            .fetch_sub(cancelled_weight, AtomicOrdering::AcqRel);
        assert!(
            previous - cancelled_weight >= 0,
            "Total job weight negative after shutting down service {}",
            self.shared.name
        );
        if !self.pool.jobs.try_acquire_many_timeout(permits, PERMIT_RECLAIM_TIMEOUT) {
            panic!(
                "Failed to reclaim the {permits} pool permits of shut down service {}",
                self.shared.name
            );
        }

        let deadline = Instant::now() + IN_FLIGHT_TIMEOUT;
        while self.shared.in_flight.load(AtomicOrdering::SeqCst) != 0 {
            if Instant::now() >= deadline {
                warn!(service = %self.shared.name, "Timed out waiting for running jobs of a shut down service");
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for ServiceSlice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ServiceSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSlice")
            .field("name", &self.shared.name)
            .field("weight", &self.shared.weight)
            .field("queued", &self.queued_jobs())
            .finish()
    }
}

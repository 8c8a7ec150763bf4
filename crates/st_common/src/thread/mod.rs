//! A fixed pool of worker threads shared by weighted background services.
//!
//! Services don't push jobs, they signal that a job is available with [`ServiceSlice::execute`] and the
//! job itself is pulled from the service's generator once a worker gets to it. Workers choose between
//! services by a random draw weighted by `weight * queued jobs`, with a 1 in 64 round-robin sidestep so
//! that light services can't be starved by a busy heavy one.

use std::thread::JoinHandle;
use std::time::Duration;

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::{debug, info, warn};

use crate::concurrency::Semaphore;
use crate::prelude::*;

mod slice;

pub use slice::{ExecutionCondition, JobGenerator, ServiceJob, ServiceSlice};
use slice::SliceShared;

/// Number of selection attempts a woken worker makes before handing its wakeup to someone else.
const SELECTION_ATTEMPTS: u32 = 50;
/// Back-off after running out of selection attempts.
const SELECTION_BACKOFF: Duration = Duration::from_millis(10);

/// A snapshot of one service's scheduling state, the input of [`pick_slice`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct SliceLoad {
    /// Weight per job.
    pub weight: u32,
    /// Number of queued jobs.
    pub queued: usize,
}

/// Chooses the service a worker should try to run.
///
/// `draw` is a uniformly random number. When bits 10..16 of the draw are zero the services are scanned
/// round-robin starting at `revolving` for any with queued jobs, advancing `revolving` past the chosen one.
/// Otherwise a service is chosen with probability proportional to `weight * queued`.
pub fn pick_slice(slices: &[SliceLoad], draw: u64, revolving: &mut usize) -> Option<usize> {
    if slices.is_empty() {
        return None;
    }
    if (draw >> 10) & 63 == 0 {
        let start = *revolving % slices.len();
        let idx = (0..slices.len())
            .map(|i| (start + i) % slices.len())
            .find(|&idx| slices[idx].queued > 0)?;
        *revolving = (idx + 1) % slices.len();
        return Some(idx);
    }
    let total: u64 = slices.iter().map(|s| u64::from(s.weight) * s.queued as u64).sum();
    if total == 0 {
        return None;
    }
    let mut chosen = draw % total;
    for (idx, slice) in slices.iter().enumerate() {
        let load = u64::from(slice.weight) * slice.queued as u64;
        if chosen < load {
            return Some(idx);
        }
        chosen -= load;
    }
    unreachable!("Weighted draw {draw} outside of the total weight {total}")
}

pub(crate) struct PoolShared {
    running: AtomicBool,
    jobs: Semaphore,
    slices: ArcSwap<Vec<Arc<SliceShared>>>,
    total_weight: AtomicI64,
}

impl PoolShared {
    fn remove_slice(&self, slice: &Arc<SliceShared>) {
        let previous = self.slices.rcu(|current| {
            current
                .iter()
                .filter(|s| !Arc::ptr_eq(s, slice))
                .cloned()
                .collect::<Vec<_>>()
        });
        assert!(
            previous.iter().any(|s| Arc::ptr_eq(s, slice)),
            "Service {} is not registered in the pool",
            slice.name
        );
    }
}

/// The worker pool. All services must be shut down before the pool.
pub struct ServiceThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceThreadPool {
    /// Spawns `threads` workers.
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "A service thread pool needs at least one worker");
        let shared = Arc::new(PoolShared {
            running: AtomicBool::new(true),
            jobs: Semaphore::new(0),
            slices: ArcSwap::from_pointee(Vec::new()),
            total_weight: AtomicI64::new(0),
        });
        let workers = (0..threads)
            .map(|id| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("Service worker #{id}"))
                    .spawn(move || worker_main(shared, id))
                    .expect("Could not create a service worker thread")
            })
            .collect();
        info!(threads, "Service thread pool started");
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Number of currently registered services.
    pub fn service_count(&self) -> usize {
        self.shared.slices.load().len()
    }

    /// Registers a new service that may run whenever it has queued jobs.
    pub fn create_service(
        &self,
        name: impl Into<String>,
        weight: u32,
        generator: impl Fn() -> Option<ServiceJob> + Send + Sync + 'static,
    ) -> ServiceSlice {
        self.insert_service(name.into(), weight, Box::new(generator), None)
    }

    /// Registers a new service that only runs while `condition` holds.
    pub fn create_conditional_service(
        &self,
        name: impl Into<String>,
        weight: u32,
        generator: impl Fn() -> Option<ServiceJob> + Send + Sync + 'static,
        condition: impl Fn() -> bool + Send + Sync + 'static,
    ) -> ServiceSlice {
        self.insert_service(name.into(), weight, Box::new(generator), Some(Box::new(condition)))
    }

    fn insert_service(
        &self,
        name: String,
        weight: u32,
        generator: Box<JobGenerator>,
        condition: Option<Box<ExecutionCondition>>,
    ) -> ServiceSlice {
        assert!(weight > 0, "Service {name} must have a positive weight");
        assert!(
            self.shared.running.load(AtomicOrdering::Acquire),
            "Service {name} registered on a stopped pool"
        );
        debug!(service = %name, weight, "Registering service");
        let slice = Arc::new(SliceShared::new(name, weight, generator, condition));
        self.shared.slices.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&slice));
            next
        });
        ServiceSlice {
            shared: slice,
            pool: Arc::clone(&self.shared),
        }
    }

    /// Waits for all signalled work to be taken, stops and joins the workers.
    /// Panics if any service is still registered or the job weight bookkeeping is off.
    pub fn shutdown(&self) {
        assert!(
            self.shared.slices.load().is_empty(),
            "All services must be shut down before the service thread pool"
        );
        while self.shared.jobs.available_permits() != 0 {
            std::thread::yield_now();
        }
        let panicked = self.stop_and_join();
        assert_eq!(panicked, 0, "{panicked} service workers terminated with a panic");
        let weight = self.shared.total_weight.load(AtomicOrdering::Acquire);
        assert_eq!(weight, 0, "Service pool job weight not zero after shutdown");
        info!("Service thread pool shut down");
    }

    /// Returns the number of workers that died from a panic.
    fn stop_and_join(&self) -> usize {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        if workers.is_empty() {
            return 0;
        }
        self.shared.running.store(false, AtomicOrdering::Release);
        self.shared.jobs.release(workers.len());
        let mut panicked = 0;
        for worker in workers {
            if worker.join().is_err() {
                warn!("Service worker thread terminated with a panic");
                panicked += 1;
            }
        }
        panicked
    }
}

impl Drop for ServiceThreadPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn worker_main(shared: Arc<PoolShared>, id: usize) {
    let _span = tracing::info_span!("service-worker", id).entered();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x9E37_79B9_7F4A_7C15 ^ id as u64);
    let mut revolving = 0usize;
    let mut loads: Vec<SliceLoad> = Vec::new();
    loop {
        shared.jobs.acquire();
        if !shared.running.load(AtomicOrdering::Acquire) {
            break;
        }

        let mut attempts = SELECTION_ATTEMPTS;
        loop {
            let slices = shared.slices.load_full();
            if slices.is_empty() {
                // The wakeup belongs to a service being shut down, which reclaims it.
                debug!("Service worker woke up with no services registered");
                shared.jobs.release(1);
                std::thread::yield_now();
                break;
            }
            if attempts == 0 {
                debug!("Unable to run any service after many attempts, releasing the wakeup");
                std::thread::sleep(SELECTION_BACKOFF);
                shared.jobs.release(1);
                break;
            }
            attempts -= 1;

            if shared.total_weight.load(AtomicOrdering::Acquire) <= 0 {
                // The job was cancelled by a service shutdown, which is waiting to reclaim this wakeup.
                shared.jobs.release(1);
                std::thread::yield_now();
                break;
            }

            loads.clear();
            loads.extend(slices.iter().map(|s| SliceLoad {
                weight: s.weight,
                queued: s.queued_jobs(),
            }));
            let Some(idx) = pick_slice(&loads, rng.next_u64(), &mut revolving) else {
                continue;
            };
            let slice = &slices[idx];
            if !slice.try_run() {
                continue;
            }
            let weight = i64::from(slice.weight);
            let previous = shared.total_weight.fetch_sub(weight, AtomicOrdering::AcqRel);
            assert!(previous - weight >= 0, "Total job weight is negative");
            break;
        }
    }
}

//! Background application of voxelized updates.

use std::collections::VecDeque;

use st_schemas::voxel::update::{VoxelUpdate, VoxelizedSection};
use tracing::{info, warn};

use super::engine::WorldEngine;
use crate::prelude::*;
use crate::thread::{ServiceJob, ServiceSlice, ServiceThreadPool};

struct IngestShared {
    queue: Mutex<VecDeque<VoxelizedSection>>,
}

/// Applies queued updates to a [`WorldEngine`] on the service pool.
pub struct VoxelIngestService {
    shared: Arc<IngestShared>,
    slice: ServiceSlice,
}

impl VoxelIngestService {
    /// Registers the ingest service on the pool, applying updates to `engine` while it's alive.
    pub fn new(pool: &ServiceThreadPool, weight: u32, engine: Weak<WorldEngine>) -> Self {
        let shared = Arc::new(IngestShared {
            queue: Mutex::new(VecDeque::new()),
        });
        let generator_shared = Arc::clone(&shared);
        let slice = pool.create_service("Voxel ingest", weight, move || {
            let update = generator_shared.queue.lock().unwrap().pop_front()?;
            let engine = engine.upgrade()?;
            Some(Box::new(move || {
                if let Err(e) = engine.insert_update(&update) {
                    warn!(anchor = %update.anchor(), "Dropping voxel update: {e}");
                }
            }) as ServiceJob)
        });
        Self { shared, slice }
    }

    /// Queues an update to be applied in the background. Returns false if the service is shut down.
    pub fn enqueue(&self, update: VoxelizedSection) -> bool {
        self.shared.queue.lock().unwrap().push_back(update);
        if self.slice.execute() {
            return true;
        }
        self.shared.queue.lock().unwrap().clear();
        false
    }

    /// Number of updates waiting to be applied.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Stops the service, discarding updates that weren't applied yet.
    pub fn shutdown(&self) {
        self.slice.shutdown();
        let dropped = std::mem::take(&mut *self.shared.queue.lock().unwrap()).len();
        if dropped != 0 {
            info!(dropped, "Voxel ingest service shut down with unprocessed updates");
        } else {
            info!("Voxel ingest service shut down");
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use bevy_math::IVec3;

    use super::*;

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "Timed out waiting for a condition");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn enqueue_after_shutdown_is_rejected() {
        let pool = ServiceThreadPool::new(1);
        let ingest = VoxelIngestService::new(&pool, 1, Weak::new());
        ingest.shutdown();
        assert!(!ingest.enqueue(VoxelizedSection::new(IVec3::ZERO)));
        assert_eq!(ingest.queued(), 0);
        drop(ingest);
        pool.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_updates() {
        let pool = ServiceThreadPool::new(1);
        let busy = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        // Occupies the only worker so the updates stay queued.
        let blocker = {
            let busy = Arc::clone(&busy);
            let release = Arc::clone(&release);
            pool.create_service("blocker", 1, move || {
                let busy = Arc::clone(&busy);
                let release = Arc::clone(&release);
                Some(Box::new(move || {
                    busy.store(true, AtomicOrdering::SeqCst);
                    while !release.load(AtomicOrdering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }) as ServiceJob)
            })
        };
        assert!(blocker.execute());
        wait_until(|| busy.load(AtomicOrdering::SeqCst));

        let ingest = VoxelIngestService::new(&pool, 1, Weak::new());
        for i in 0..3 {
            assert!(ingest.enqueue(VoxelizedSection::new(IVec3::splat(i))));
        }
        assert_eq!(ingest.queued(), 3);
        ingest.shutdown();
        assert_eq!(ingest.queued(), 0);
        assert!(!ingest.enqueue(VoxelizedSection::new(IVec3::ONE)));

        release.store(true, AtomicOrdering::SeqCst);
        drop(blocker);
        drop(ingest);
        pool.shutdown();
    }
}

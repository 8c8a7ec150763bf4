//! Background persistence of dirty sections.

use std::collections::VecDeque;

use st_schemas::voxel::codec::{SectionEncoder, SectionMetadata};
use thread_local::ThreadLocal;
use tracing::{error, info};

use super::tracker::SectionHandle;
use crate::prelude::*;
use crate::storage::StorageBackend;
use crate::thread::{ServiceJob, ServiceSlice, ServiceThreadPool};

struct SavingShared {
    queue: Mutex<VecDeque<SectionHandle>>,
    storage: Arc<dyn StorageBackend>,
    encoders: ThreadLocal<RefCell<SectionEncoder>>,
}

impl SavingShared {
    fn pop(&self) -> Option<SectionHandle> {
        self.queue.lock().unwrap().pop_front()
    }

    fn save(&self, section: SectionHandle) -> Result<()> {
        section.clear_in_save_queue();
        let mut encoder = self
            .encoders
            .get_or(|| RefCell::new(SectionEncoder::new()))
            .borrow_mut();
        section.copy_to(encoder.voxels_mut());
        let metadata = SectionMetadata {
            non_empty_children: section.non_empty_children(),
        };
        let data = encoder.encode(section.key(), metadata);
        self.storage
            .set_section_data(section.key(), &data)
            .with_context(|| format!("Saving section {}", section.key()))
    }

    fn save_logged(&self, section: SectionHandle) {
        let key = section.key();
        if let Err(e) = self.save(section) {
            error!(%key, "Failed to save section: {e:#}");
        }
    }
}

/// Encodes and stores queued sections on the service pool. A queued section stays resident until saved.
pub struct SectionSavingService {
    shared: Arc<SavingShared>,
    slice: ServiceSlice,
}

impl SectionSavingService {
    /// Registers the saving service on the pool.
    pub fn new(pool: &ServiceThreadPool, weight: u32, storage: Arc<dyn StorageBackend>) -> Self {
        let shared = Arc::new(SavingShared {
            queue: Mutex::new(VecDeque::new()),
            storage,
            encoders: ThreadLocal::new(),
        });
        let generator_shared = Arc::clone(&shared);
        let slice = pool.create_service("Section saving", weight, move || {
            let section = generator_shared.pop()?;
            let shared = Arc::clone(&generator_shared);
            Some(Box::new(move || shared.save_logged(section)) as ServiceJob)
        });
        Self { shared, slice }
    }

    /// Queues the section for saving unless it's already waiting in the queue.
    pub fn enqueue_save(&self, section: &SectionHandle) {
        if !section.mark_in_save_queue() {
            return;
        }
        self.shared.queue.lock().unwrap().push_back(section.clone());
        if !self.slice.execute() {
            // Shut down already, save on the caller's thread instead.
            self.drain_logged();
        }
    }

    /// Number of sections waiting to be saved.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    fn drain_logged(&self) {
        while let Some(section) = self.shared.pop() {
            self.shared.save_logged(section);
        }
    }

    fn drain(&self) -> Result<usize> {
        let mut saved = 0;
        let mut first_error = None;
        while let Some(section) = self.shared.pop() {
            match self.shared.save(section) {
                Ok(()) => saved += 1,
                Err(e) => {
                    error!("Failed to save section: {e:#}");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(saved), Err)
    }

    /// Stops the background service and saves everything still queued on the calling thread.
    pub fn shutdown(&self) -> Result<()> {
        self.slice.shutdown();
        let saved = self.drain()?;
        info!(saved, "Section saving service shut down");
        Ok(())
    }
}

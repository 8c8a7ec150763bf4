//! The world engine: writes multi-level updates into sections and propagates emptiness changes upward.

use bevy_math::IVec3;
use st_schemas::coordinates::{section_index, SectionKey, SECTION_DIM3Z};
use st_schemas::voxel::codec::{CodecOptions, SectionDecoder};
use st_schemas::voxel::state::VoxelState;
use st_schemas::voxel::update::{VoxelUpdate, VoxelizedSection, UPDATE_DIM, UPDATE_LEVELS};
use thread_local::ThreadLocal;
use tracing::{error, info, warn};

use super::ingest::VoxelIngestService;
use super::saving::SectionSavingService;
use super::section::{GridPool, WorldSection};
use super::tracker::{ActiveSectionTracker, LoadOutcome, SectionHandle, SectionLoader, TrackerError};
use crate::config::WorldConfig;
use crate::prelude::*;
use crate::storage::StorageBackend;
use crate::thread::ServiceThreadPool;

bitflags::bitflags! {
    /// What changed in a dirty section.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct DirtyFlags: u8 {
        /// Voxel values changed.
        const BLOCK_DATA = 1;
        /// The non-empty child mask changed.
        const CHILD_EXISTENCE = 2;
    }
}

/// Observer of section changes, called synchronously on the thread applying the change.
pub type DirtyCallback = Box<dyn Fn(&WorldSection, DirtyFlags) + Send + Sync + 'static>;

struct DecodeScratch {
    decoder: SectionDecoder,
    buffer: Box<[u64; SECTION_DIM3Z]>,
}

/// Loads sections from storage, discarding records that fail to decode.
struct StorageSectionLoader {
    storage: Arc<dyn StorageBackend>,
    options: CodecOptions,
    scratch: ThreadLocal<RefCell<DecodeScratch>>,
}

impl SectionLoader for StorageSectionLoader {
    fn load(&self, section: &WorldSection) -> LoadOutcome {
        let key = section.key();
        let data = match self.storage.get_section_data(key) {
            Ok(Some(data)) => data,
            Ok(None) => return LoadOutcome::Absent,
            Err(e) => {
                error!(%key, "Could not read section from storage: {e:#}");
                return LoadOutcome::Corrupt;
            }
        };

        let mut scratch = self
            .scratch
            .get_or(|| {
                RefCell::new(DecodeScratch {
                    decoder: SectionDecoder::new(self.options),
                    buffer: bytemuck::zeroed_box(),
                })
            })
            .borrow_mut();
        let DecodeScratch { decoder, buffer } = &mut *scratch;
        // Remapped sections read a record written under another key.
        let stored_key = self.storage.stored_key(key);
        match decoder.decode(stored_key, &data, buffer) {
            Ok(decoded) => {
                section.fill_from(buffer);
                section.set_non_air_count(decoded.non_air_count);
                section.set_non_empty_children(decoded.metadata.non_empty_children);
                LoadOutcome::Resident
            }
            Err(e) => {
                if e.is_corruption() {
                    warn!(%key, "Discarding corrupt section: {e}");
                } else {
                    error!(%key, "Discarding unreadable section: {e}");
                }
                if let Err(e) = self.storage.delete_section_data(stored_key) {
                    error!(%key, "Could not delete a corrupt section: {e:#}");
                }
                // The grid is only written on success, so the section is still all air.
                LoadOutcome::Corrupt
            }
        }
    }
}

/// Owns one world's storage, section cache and background services.
pub struct WorldEngine {
    max_mip_levels: u8,
    storage: Arc<dyn StorageBackend>,
    tracker: ActiveSectionTracker,
    saving: SectionSavingService,
    ingest: VoxelIngestService,
    dirty_callback: ArcSwapOption<DirtyCallback>,
    shut_down: AtomicBool,
}

impl WorldEngine {
    /// Constructs an engine over the given storage chain, registering its services on `pool`.
    pub fn new(config: &WorldConfig, storage: Box<dyn StorageBackend>, pool: &ServiceThreadPool) -> Result<Arc<Self>> {
        ensure!(
            (1..=UPDATE_LEVELS).contains(&config.max_mip_levels),
            "Mip level count {} outside of 1..={UPDATE_LEVELS}",
            config.max_mip_levels
        );
        let storage: Arc<dyn StorageBackend> = Arc::from(storage);
        let loader = StorageSectionLoader {
            storage: Arc::clone(&storage),
            options: config.codec,
            scratch: ThreadLocal::new(),
        };
        let tracker = ActiveSectionTracker::new(
            config.tracker_shard_bits,
            Arc::new(GridPool::new(config.grid_pool_size)),
            loader,
        )
        .with_max_resident(config.max_resident_sections);
        let saving = SectionSavingService::new(pool, config.saving_weight, Arc::clone(&storage));
        let engine = Arc::new_cyclic(|weak| Self {
            max_mip_levels: config.max_mip_levels,
            storage,
            tracker,
            saving,
            ingest: VoxelIngestService::new(pool, config.ingest_weight, Weak::clone(weak)),
            dirty_callback: ArcSwapOption::empty(),
            shut_down: AtomicBool::new(false),
        });
        info!(mip_levels = config.max_mip_levels, "World engine started");
        Ok(engine)
    }

    /// The storage chain of this world.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Acquires a section, creating an empty one if nothing is stored.
    pub fn acquire(&self, key: SectionKey) -> Result<SectionHandle, TrackerError> {
        Ok(self
            .tracker
            .acquire(key, false)?
            .expect("Non-optional acquires always produce a section"))
    }

    /// Acquires a section only if it's resident or stored.
    pub fn acquire_if_exists(&self, key: SectionKey) -> Result<Option<SectionHandle>, TrackerError> {
        self.tracker.acquire(key, true)
    }

    /// Per-shard numbers of resident sections.
    pub fn loaded_section_counts(&self) -> Vec<usize> {
        self.tracker.loaded_counts()
    }

    /// Sets or removes the observer of section changes.
    pub fn set_dirty_callback(&self, callback: Option<DirtyCallback>) {
        self.dirty_callback.store(callback.map(Arc::new));
    }

    /// Notifies the observer of a change and queues the section for saving.
    pub fn mark_dirty(&self, section: &SectionHandle, flags: DirtyFlags) {
        if let Some(callback) = self.dirty_callback.load().as_deref() {
            callback(section, flags);
        }
        self.saving.enqueue_save(section);
    }

    /// Queues an update to be applied by the ingest service.
    pub fn enqueue_ingest(&self, update: VoxelizedSection) -> bool {
        self.ingest.enqueue(update)
    }

    /// Writes every level of the update, finest first, then updates the child masks of coarser sections
    /// whose children switched between empty and non-empty. Stops at the first level where nothing changed.
    pub fn insert_update(&self, update: &dyn VoxelUpdate) -> Result<(), TrackerError> {
        let anchor = update.anchor();
        let mut previous: Option<(SectionHandle, bool)> = None;
        for level in 0..self.max_mip_levels {
            let shift = i32::from(level);
            let key = SectionKey::try_new(level, anchor >> (shift + 1))?;
            let section = self.acquire(key)?;

            let dim = UPDATE_DIM >> shift;
            let base = (anchor & IVec3::splat((1 << (shift + 1)) - 1)) << (4 - shift);
            let mut value_changed = false;
            let mut non_air_delta = 0i32;
            for y in 0..dim {
                for z in 0..dim {
                    for x in 0..dim {
                        let state = update.get(level, x, y, z);
                        let old = section.swap_raw(section_index(base.x + x, base.y + y, base.z + z), state.0);
                        if old != state.0 {
                            value_changed = true;
                            non_air_delta += i32::from(!state.is_air()) - i32::from(!VoxelState::raw_is_air(old));
                        }
                    }
                }
            }

            let mut flags = DirtyFlags::empty();
            if value_changed {
                flags |= DirtyFlags::BLOCK_DATA;
            }
            let structural_change = non_air_delta != 0 && {
                let (old, new) = section.add_non_air(non_air_delta);
                (old == 0) != (new == 0)
            };
            if let Some((child, child_structural_change)) = previous.take() {
                if child_structural_change
                    && section.update_child_bit(child.key().child_slot(), child.non_air_count() != 0)
                {
                    flags |= DirtyFlags::CHILD_EXISTENCE;
                }
            }
            if !flags.is_empty() {
                self.mark_dirty(&section, flags);
            }
            if !value_changed && !structural_change {
                break;
            }
            previous = Some((section, structural_change));
        }
        Ok(())
    }

    /// Flushes storage, stops the services (saving what's still queued) and closes storage.
    /// Every step runs even if an earlier one fails, the first failure is returned.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, AtomicOrdering::AcqRel) {
            warn!("World engine shut down twice");
            return Ok(());
        }
        let mut first_error: Option<anyhow::Error> = None;
        let mut record = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                error!(step, "World engine shutdown step failed: {e:#}");
                first_error.get_or_insert(e);
            }
        };
        record("flush", self.storage.flush().context("Flushing world storage"));
        self.ingest.shutdown();
        record("saving", self.saving.shutdown());
        record("close", self.storage.close().context("Closing world storage"));
        info!("World engine shut down");
        first_error.map_or(Ok(()), Err)
    }
}

//! A single cached section: its voxel grid, summary data and reference count.

use std::sync::Condvar;

use st_schemas::coordinates::SECTION_DIM3Z;
use st_schemas::voxel::state::VoxelState;

use crate::prelude::*;

/// A section's voxel data, mutated in place by reference holders.
pub type VoxelGrid = [AtomicU64; SECTION_DIM3Z];

/// Set in [`WorldSection::state`] while the section is registered in the tracker.
const LOADED_BIT: u32 = 1;
/// One reference in [`WorldSection::state`].
const REF_UNIT: u32 = 2;

static_assertions::const_assert_eq!(LOADED_BIT << 1, REF_UNIT);
static_assertions::assert_eq_size!(VoxelGrid, [u64; SECTION_DIM3Z]);

/// A bounded free list of voxel grids, reused to avoid large allocations on section churn.
#[derive(Debug)]
pub struct GridPool {
    free: Mutex<Vec<Box<VoxelGrid>>>,
    capacity: usize,
}

impl GridPool {
    /// Constructs an empty pool keeping at most `capacity` grids.
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    /// A zero-filled grid, reused from the pool if possible.
    pub fn take(&self) -> Box<VoxelGrid> {
        let reused = self.free.lock().unwrap().pop();
        match reused {
            Some(grid) => {
                grid.iter().for_each(|v| v.store(0, AtomicOrdering::Relaxed));
                grid
            }
            None => bytemuck::zeroed_box(),
        }
    }

    /// Returns a grid to the pool, or frees it if the pool is full.
    pub fn give(&self, grid: Box<VoxelGrid>) {
        let mut free = self.free.lock().unwrap();
        if free.len() < self.capacity {
            free.push(grid);
        }
    }

    /// Number of grids waiting for reuse.
    pub fn pooled(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// A 32³ grid of voxel states at one level of detail.
///
/// The `state` word packs a loaded bit (bit 0) with the reference count (bits 1..32). Once the reference
/// count drops to zero the tracker flips the word from exactly "loaded, no references" to zero, and a
/// section in that state can never be acquired again.
pub struct WorldSection {
    key: SectionKey,
    state: AtomicU32,
    grid: Option<Box<VoxelGrid>>,
    non_empty_children: AtomicU8,
    non_air_count: AtomicU32,
    in_save_queue: AtomicBool,
    ready: Mutex<bool>,
    ready_signal: Condvar,
    pool: Arc<GridPool>,
}

impl WorldSection {
    /// A new loaded section with one reference, not yet marked ready.
    pub(crate) fn new(key: SectionKey, pool: Arc<GridPool>) -> Self {
        Self {
            key,
            state: AtomicU32::new(LOADED_BIT | REF_UNIT),
            grid: Some(pool.take()),
            non_empty_children: AtomicU8::new(0),
            non_air_count: AtomicU32::new(0),
            in_save_queue: AtomicBool::new(false),
            ready: Mutex::new(false),
            ready_signal: Condvar::new(),
            pool,
        }
    }

    /// The section's key.
    pub fn key(&self) -> SectionKey {
        self.key
    }

    /// The section's level of detail.
    pub fn level(&self) -> u8 {
        self.key.level()
    }

    /// The voxel grid, indexed by [`section_index`](st_schemas::coordinates::section_index).
    pub fn voxels(&self) -> &VoxelGrid {
        self.grid.as_deref().expect("Section grid is only taken when the section is dropped")
    }

    /// Reads one voxel.
    pub fn get(&self, index: usize) -> VoxelState {
        VoxelState(self.voxels()[index].load(AtomicOrdering::Relaxed))
    }

    /// Writes one voxel, returning the previous raw state.
    pub fn swap_raw(&self, index: usize, raw: u64) -> u64 {
        self.voxels()[index].swap(raw, AtomicOrdering::Relaxed)
    }

    /// Copies the whole grid out.
    pub fn copy_to(&self, out: &mut [u64; SECTION_DIM3Z]) {
        for (dst, src) in out.iter_mut().zip(self.voxels().iter()) {
            *dst = src.load(AtomicOrdering::Relaxed);
        }
    }

    /// Overwrites the whole grid.
    pub fn fill_from(&self, data: &[u64; SECTION_DIM3Z]) {
        for (dst, &src) in self.voxels().iter().zip(data.iter()) {
            dst.store(src, AtomicOrdering::Relaxed);
        }
    }

    /// Resets the section to all air with no non-empty children.
    pub fn clear(&self) {
        self.voxels().iter().for_each(|v| v.store(0, AtomicOrdering::Relaxed));
        self.non_air_count.store(0, AtomicOrdering::Release);
        self.non_empty_children.store(0, AtomicOrdering::Release);
    }

    /// Number of non-air voxels.
    pub fn non_air_count(&self) -> u32 {
        self.non_air_count.load(AtomicOrdering::Acquire)
    }

    /// Overwrites the non-air voxel count, used when loading.
    pub fn set_non_air_count(&self, count: u32) {
        self.non_air_count.store(count, AtomicOrdering::Release);
    }

    /// Adjusts the non-air voxel count, returning the `(old, new)` counts.
    pub fn add_non_air(&self, delta: i32) -> (u32, u32) {
        let old = if delta >= 0 {
            self.non_air_count.fetch_add(delta as u32, AtomicOrdering::AcqRel)
        } else {
            self.non_air_count.fetch_sub(delta.unsigned_abs(), AtomicOrdering::AcqRel)
        };
        (old, old.wrapping_add_signed(delta))
    }

    /// The mask of finer child sections that contain non-air voxels, one bit per [`SectionKey::child_slot`].
    pub fn non_empty_children(&self) -> u8 {
        self.non_empty_children.load(AtomicOrdering::Acquire)
    }

    /// Overwrites the non-empty child mask, used when loading.
    pub fn set_non_empty_children(&self, mask: u8) {
        self.non_empty_children.store(mask, AtomicOrdering::Release);
    }

    /// Sets or clears a child's bit in the non-empty child mask, returning whether the mask changed.
    pub fn update_child_bit(&self, slot: u8, non_empty: bool) -> bool {
        let bit = 1u8 << slot;
        let old = if non_empty {
            self.non_empty_children.fetch_or(bit, AtomicOrdering::AcqRel)
        } else {
            self.non_empty_children.fetch_and(!bit, AtomicOrdering::AcqRel)
        };
        (old & bit != 0) != non_empty
    }

    /// The current number of references.
    pub fn refcount(&self) -> u32 {
        self.state.load(AtomicOrdering::Acquire) >> 1
    }

    /// Whether the section is still registered in the tracker.
    pub fn is_loaded(&self) -> bool {
        self.state.load(AtomicOrdering::Acquire) & LOADED_BIT != 0
    }

    /// Adds a reference unless the section was already freed.
    pub(crate) fn try_acquire(&self) -> bool {
        self.state
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |state| {
                (state & LOADED_BIT != 0).then_some(state + REF_UNIT)
            })
            .is_ok()
    }

    /// Adds a reference to a section the caller already holds a reference to.
    pub(crate) fn acquire_existing(&self) {
        let previous = self.state.fetch_add(REF_UNIT, AtomicOrdering::AcqRel);
        assert!(previous & LOADED_BIT != 0, "Acquired freed section {}", self.key);
        assert!(previous >> 1 != 0, "Acquired section {} without holding a reference", self.key);
    }

    /// Drops a reference, returning true if that was the last one.
    pub(crate) fn release(&self) -> bool {
        let previous = self.state.fetch_sub(REF_UNIT, AtomicOrdering::AcqRel);
        assert!(previous & LOADED_BIT != 0, "Released freed section {}", self.key);
        assert!(previous >> 1 != 0, "Released section {} more times than acquired", self.key);
        previous >> 1 == 1
    }

    /// Frees the section if it's loaded with no references.
    pub(crate) fn try_set_freed(&self) -> bool {
        self.state
            .compare_exchange(LOADED_BIT, 0, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    /// Marks the initial load as done and wakes up acquirers waiting for it.
    pub(crate) fn mark_ready(&self) {
        *self.ready.lock().unwrap() = true;
        self.ready_signal.notify_all();
    }

    /// Blocks until the initial load is done.
    pub(crate) fn wait_ready(&self) {
        let mut ready = self.ready.lock().unwrap();
        while !*ready {
            ready = self.ready_signal.wait(ready).unwrap();
        }
    }

    /// Flags the section as waiting in the save queue, returning false if it already was.
    pub fn mark_in_save_queue(&self) -> bool {
        !self.in_save_queue.swap(true, AtomicOrdering::AcqRel)
    }

    /// Clears the save queue flag.
    pub fn clear_in_save_queue(&self) {
        self.in_save_queue.store(false, AtomicOrdering::Release);
    }
}

impl Drop for WorldSection {
    fn drop(&mut self) {
        if let Some(grid) = self.grid.take() {
            self.pool.give(grid);
        }
    }
}

impl std::fmt::Debug for WorldSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldSection")
            .field("key", &self.key)
            .field("refcount", &self.refcount())
            .field("loaded", &self.is_loaded())
            .field("non_air_count", &self.non_air_count())
            .field("non_empty_children", &format_args!("{:08b}", self.non_empty_children()))
            .finish()
    }
}

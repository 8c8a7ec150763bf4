//! The sharded cache of resident sections.

use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};

use st_schemas::coordinates::SectionKeyError;
use thiserror::Error;
use tracing::{debug, error};

use super::section::{GridPool, WorldSection};
use crate::prelude::*;

/// Result of populating a freshly created section.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LoadOutcome {
    /// The section was filled with stored data.
    Resident,
    /// No data exists for the section, it stays empty.
    Absent,
    /// Stored data was unusable, the section was reset to empty.
    Corrupt,
}

/// Populates sections on a cache miss. Called outside of any tracker lock.
pub trait SectionLoader: Send + Sync + 'static {
    /// Fills the (empty) section, reporting what was found.
    fn load(&self, section: &WorldSection) -> LoadOutcome;
}

impl<F: Fn(&WorldSection) -> LoadOutcome + Send + Sync + 'static> SectionLoader for F {
    fn load(&self, section: &WorldSection) -> LoadOutcome {
        self(section)
    }
}

/// Errors from acquiring a section.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum TrackerError {
    /// The resident section limit is reached, release some sections and retry.
    #[error("Section cache is full with {0} resident sections")]
    CacheFull(usize),
    /// The requested position is not addressable.
    #[error(transparent)]
    InvalidKey(#[from] SectionKeyError),
}

type Shard = Mutex<HashMap<SectionKey, Arc<WorldSection>>>;

enum Lookup {
    Hit(Arc<WorldSection>),
    Created(Arc<WorldSection>),
}

struct TrackerShared {
    shards: Box<[Shard]>,
    shard_bits: u32,
    loader: Box<dyn SectionLoader>,
    pool: Arc<GridPool>,
    max_resident: Option<usize>,
    resident: AtomicUsize,
}

impl TrackerShared {
    fn shard(&self, key: SectionKey) -> &Shard {
        if self.shard_bits == 0 {
            return &self.shards[0];
        }
        let hash = key.raw().wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.shards[(hash >> (64 - self.shard_bits)) as usize]
    }

    /// Counts a new resident section, failing if that would exceed the limit.
    fn reserve_slot(&self) -> Result<(), TrackerError> {
        match self.max_resident {
            Some(max) => self
                .resident
                .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |resident| {
                    (resident < max).then_some(resident + 1)
                })
                .map(|_| ())
                .map_err(TrackerError::CacheFull),
            None => {
                self.resident.fetch_add(1, AtomicOrdering::AcqRel);
                Ok(())
            }
        }
    }

    /// Called once the last reference of `section` is dropped.
    fn try_unload(&self, section: &Arc<WorldSection>) {
        if !section.try_set_freed() {
            return;
        }
        let mut map = self.shard(section.key()).lock().unwrap();
        if map
            .get(&section.key())
            .is_some_and(|current| Arc::ptr_eq(current, section))
        {
            map.remove(&section.key());
            self.resident.fetch_sub(1, AtomicOrdering::AcqRel);
        }
    }
}

/// A counted reference to a resident section. Cloning acquires another reference, dropping releases it,
/// and the section is unloaded once no references remain.
pub struct SectionHandle {
    section: Arc<WorldSection>,
    tracker: Arc<TrackerShared>,
}

impl Deref for SectionHandle {
    type Target = WorldSection;

    fn deref(&self) -> &WorldSection {
        &self.section
    }
}

impl Clone for SectionHandle {
    fn clone(&self) -> Self {
        self.section.acquire_existing();
        Self {
            section: Arc::clone(&self.section),
            tracker: Arc::clone(&self.tracker),
        }
    }
}

impl Drop for SectionHandle {
    fn drop(&mut self) {
        if self.section.release() {
            self.tracker.try_unload(&self.section);
        }
    }
}

impl std::fmt::Debug for SectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&*self.section, f)
    }
}

/// Maps keys to resident sections across `2^shard_bits` independently locked shards.
pub struct ActiveSectionTracker {
    shared: Arc<TrackerShared>,
}

impl ActiveSectionTracker {
    /// Constructs an empty tracker that populates sections with `loader`.
    pub fn new(shard_bits: u32, pool: Arc<GridPool>, loader: impl SectionLoader) -> Self {
        assert!(shard_bits <= 16, "Too many tracker shards requested: 2^{shard_bits}");
        let shards = (0..1usize << shard_bits)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            shared: Arc::new(TrackerShared {
                shards,
                shard_bits,
                loader: Box::new(loader),
                pool,
                max_resident: None,
                resident: AtomicUsize::new(0),
            }),
        }
    }

    /// Limits the number of resident sections, acquiring more fails with [`TrackerError::CacheFull`].
    pub fn with_max_resident(mut self, max_resident: Option<usize>) -> Self {
        Arc::get_mut(&mut self.shared)
            .expect("Tracker limits must be configured before handing out sections")
            .max_resident = max_resident;
        self
    }

    /// The pool section grids are taken from.
    pub fn pool(&self) -> &Arc<GridPool> {
        &self.shared.pool
    }

    /// Acquires the section, loading it on a miss.
    ///
    /// For an `optional` acquire, a section that turns out not to exist in storage is not kept resident and
    /// [`None`] is returned. Blocks while another thread is still loading the section.
    pub fn acquire(&self, key: SectionKey, optional: bool) -> Result<Option<SectionHandle>, TrackerError> {
        let shared = &self.shared;
        loop {
            let lookup = {
                let mut map = shared.shard(key).lock().unwrap();
                match map.get(&key) {
                    Some(existing) => Lookup::Hit(Arc::clone(existing)),
                    None => {
                        shared.reserve_slot()?;
                        let section = Arc::new(WorldSection::new(key, Arc::clone(&shared.pool)));
                        map.insert(key, Arc::clone(&section));
                        Lookup::Created(section)
                    }
                }
            };

            match lookup {
                // The entry may be in the middle of being unloaded, in which case retry until it's gone.
                Lookup::Hit(existing) => {
                    if !existing.try_acquire() {
                        std::thread::yield_now();
                        continue;
                    }
                    existing.wait_ready();
                    return Ok(Some(SectionHandle {
                        section: existing,
                        tracker: Arc::clone(shared),
                    }));
                }
                Lookup::Created(created) => {
                    let outcome = catch_unwind(AssertUnwindSafe(|| shared.loader.load(&created)))
                        .unwrap_or_else(|_| {
                            error!(%key, "Section loader panicked, treating the section as corrupt");
                            created.clear();
                            LoadOutcome::Corrupt
                        });
                    created.mark_ready();
                    let handle = SectionHandle {
                        section: created,
                        tracker: Arc::clone(shared),
                    };
                    if outcome == LoadOutcome::Absent && optional {
                        debug!(%key, "Optional section does not exist");
                        return Ok(None);
                    }
                    return Ok(Some(handle));
                }
            }
        }
    }

    /// Per-shard numbers of resident sections.
    pub fn loaded_counts(&self) -> Vec<usize> {
        self.shared
            .shards
            .iter()
            .map(|shard| shard.lock().unwrap().len())
            .collect()
    }

    /// Total number of resident sections.
    pub fn loaded_count(&self) -> usize {
        self.shared.resident.load(AtomicOrdering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use std::thread;
    use std::time::Duration;

    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    use super::*;

    fn tracker_with(loader: impl SectionLoader) -> ActiveSectionTracker {
        ActiveSectionTracker::new(2, Arc::new(GridPool::new(8)), loader)
    }

    #[test]
    fn acquire_release_unloads() {
        let loads = Arc::new(AtomicUsize::new(0));
        let tracker = {
            let loads = Arc::clone(&loads);
            tracker_with(move |section: &WorldSection| {
                loads.fetch_add(1, AtomicOrdering::SeqCst);
                section.swap_raw(0, 7);
                LoadOutcome::Resident
            })
        };
        let key = SectionKey::new(0, 1, 2, 3);
        let a = tracker.acquire(key, false).unwrap().unwrap();
        let b = tracker.acquire(key, false).unwrap().unwrap();
        let c = b.clone();
        assert_eq!(a.refcount(), 3);
        assert_eq!(loads.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(tracker.loaded_count(), 1);
        drop((a, b, c));
        assert_eq!(tracker.loaded_count(), 0);
        assert_eq!(tracker.loaded_counts().iter().sum::<usize>(), 0);
        assert_eq!(tracker.pool().pooled(), 1);

        let again = tracker.acquire(key, false).unwrap().unwrap();
        assert_eq!(loads.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(again.get(0).0, 7);
    }

    #[test]
    fn optional_absent_is_not_kept() {
        let tracker = tracker_with(|_: &WorldSection| LoadOutcome::Absent);
        let key = SectionKey::new(2, -1, -1, -1);
        assert!(tracker.acquire(key, true).unwrap().is_none());
        assert_eq!(tracker.loaded_count(), 0);
        let required = tracker.acquire(key, false).unwrap().unwrap();
        assert_eq!(required.non_air_count(), 0);
        assert_eq!(tracker.loaded_count(), 1);
        // Already resident, so an optional acquire shares it.
        assert!(tracker.acquire(key, true).unwrap().is_some());
    }

    #[test]
    fn corrupt_stays_resident() {
        let tracker = tracker_with(|_: &WorldSection| LoadOutcome::Corrupt);
        let handle = tracker.acquire(SectionKey::default(), true).unwrap();
        assert!(handle.is_some());
        assert_eq!(tracker.loaded_count(), 1);
    }

    #[test]
    fn capacity_limit() {
        let tracker = tracker_with(|_: &WorldSection| LoadOutcome::Resident).with_max_resident(Some(2));
        let a = tracker.acquire(SectionKey::new(0, 0, 0, 0), false).unwrap();
        let _b = tracker.acquire(SectionKey::new(0, 1, 0, 0), false).unwrap();
        assert_eq!(
            tracker.acquire(SectionKey::new(0, 2, 0, 0), false).unwrap_err(),
            TrackerError::CacheFull(2)
        );
        // Hits don't count against the limit.
        assert!(tracker.acquire(SectionKey::new(0, 0, 0, 0), false).is_ok());
        drop(a);
        assert!(tracker.acquire(SectionKey::new(0, 2, 0, 0), false).is_ok());
    }

    #[test]
    fn panicking_loader_does_not_wedge_the_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tracker = {
            let calls = Arc::clone(&calls);
            tracker_with(move |section: &WorldSection| {
                section.swap_raw(3, 9);
                if calls.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                    panic!("loader failure");
                }
                LoadOutcome::Resident
            })
        };
        let key = SectionKey::new(0, 7, 7, 7);
        let first = tracker.acquire(key, false).unwrap().unwrap();
        assert!(first.get(3).is_air());
        drop(first);
        assert_eq!(tracker.loaded_count(), 0);

        // A wedged key would block this acquire forever, so it runs on another thread.
        let (tx, rx) = std_unbounded_channel();
        let tracker = Arc::new(tracker);
        let waiter = {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                let handle = tracker.acquire(key, false).unwrap().unwrap();
                tx.send(handle.get(3).0).unwrap();
            })
        };
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
        waiter.join().unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn capacity_limit_holds_across_shards() {
        let max = 16;
        let tracker = Arc::new(
            ActiveSectionTracker::new(4, Arc::new(GridPool::new(0)), |_: &WorldSection| LoadOutcome::Resident)
                .with_max_resident(Some(max)),
        );
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut held = Vec::new();
                    for i in 0..8 {
                        match tracker.acquire(SectionKey::new(0, t * 8 + i, 0, 0), false) {
                            Ok(handle) => held.push(handle),
                            Err(e) => assert!(matches!(e, TrackerError::CacheFull(_))),
                        }
                        assert!(tracker.loaded_count() <= max);
                    }
                    barrier.wait();
                    held.len()
                })
            })
            .collect();
        let acquired: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(acquired, max);
        assert_eq!(tracker.loaded_count(), 0);
    }

    #[test]
    fn concurrent_acquirers_wait_for_load() {
        let tracker = Arc::new(tracker_with(|section: &WorldSection| {
            thread::sleep(Duration::from_millis(50));
            section.swap_raw(5, 42);
            LoadOutcome::Resident
        }));
        let key = SectionKey::new(1, 1, 1, 1);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    let handle = tracker.acquire(key, false).unwrap().unwrap();
                    handle.get(5).0
                })
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), 42);
        }
    }

    #[test]
    fn concurrent_refcounts() {
        let tracker = Arc::new(tracker_with(|_: &WorldSection| LoadOutcome::Resident));
        let keys: Vec<SectionKey> = (0..4).map(|i| SectionKey::new(0, i, 0, 0)).collect();
        let threads: Vec<_> = (0..8)
            .map(|seed| {
                let tracker = Arc::clone(&tracker);
                let keys = keys.clone();
                thread::spawn(move || {
                    let mut rng = Pcg64::seed_from_u64(seed);
                    let mut held: Vec<SectionHandle> = Vec::new();
                    for _ in 0..5000 {
                        if held.is_empty() || rng.gen_bool(0.5) {
                            let key = keys[rng.gen_range(0..keys.len())];
                            let handle = tracker.acquire(key, false).unwrap().unwrap();
                            assert!(handle.refcount() >= 1);
                            assert!(handle.is_loaded());
                            assert_eq!(handle.key(), key);
                            handle.swap_raw(seed as usize, seed);
                            held.push(handle);
                        } else {
                            let idx = rng.gen_range(0..held.len());
                            held.swap_remove(idx);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(tracker.loaded_count(), 0);
    }
}

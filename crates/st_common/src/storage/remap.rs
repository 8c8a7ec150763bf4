//! Folding of logically repeated world regions onto a single stored copy.

use bevy_math::IVec3;

use crate::prelude::*;
use crate::storage::StorageBackend;

/// Maps section keys onto the keys they're stored under.
pub trait KeyRemapper: Send + Sync + 'static {
    /// The key that `key` reads its data from, or [`None`] if that key isn't representable.
    fn canonical(&self, key: SectionKey) -> Option<SectionKey>;

    /// Whether `key` is stored under itself. Writes and deletes of other keys are dropped.
    fn is_canonical(&self, key: SectionKey) -> bool {
        self.canonical(key) == Some(key)
    }
}

/// Folds the bands of the world below the floor onto band 0.
///
/// At level `l` the floor is section `y = -8 >> l`, each band is `16 >> l` sections tall, and band `n`
/// is shifted by `n * (512 >> l)` sections along X, `n * (16 >> l)` along Y. Levels whose band height
/// rounds down to zero are never folded.
#[derive(Copy, Clone, Debug, Default)]
pub struct AbyssRemapper;

impl AbyssRemapper {
    /// The band index of the key, 0 for everything at or above the floor.
    pub fn band(key: SectionKey) -> i32 {
        let level = key.level();
        let start = -8 >> level;
        let delta = 16 >> level;
        let y = key.y();
        if y >= start || delta == 0 {
            return 0;
        }
        (start - y + delta - 1) / delta
    }
}

impl KeyRemapper for AbyssRemapper {
    fn canonical(&self, key: SectionKey) -> Option<SectionKey> {
        let band = Self::band(key);
        if band == 0 {
            return Some(key);
        }
        let level = key.level();
        let x = key.x().checked_add(band.checked_mul(512 >> level)?)?;
        let y = key.y() + band * (16 >> level);
        SectionKey::try_new(level, IVec3::new(x, y, key.z())).ok()
    }

    fn is_canonical(&self, key: SectionKey) -> bool {
        Self::band(key) == 0
    }
}

/// Reads every section through its canonical key, and only persists canonical sections.
pub struct RemapStorageAdaptor {
    remapper: Box<dyn KeyRemapper>,
    delegate: Box<dyn StorageBackend>,
}

impl RemapStorageAdaptor {
    /// Wraps the given layer.
    pub fn new(remapper: Box<dyn KeyRemapper>, delegate: Box<dyn StorageBackend>) -> Self {
        Self { remapper, delegate }
    }
}

impl StorageBackend for RemapStorageAdaptor {
    fn get_section_data(&self, key: SectionKey) -> Result<Option<Vec<u8>>> {
        match self.remapper.canonical(key) {
            Some(canonical) => self.delegate.get_section_data(canonical),
            None => Ok(None),
        }
    }

    fn set_section_data(&self, key: SectionKey, data: &[u8]) -> Result<()> {
        if !self.remapper.is_canonical(key) {
            return Ok(());
        }
        self.delegate.set_section_data(key, data)
    }

    fn delete_section_data(&self, key: SectionKey) -> Result<()> {
        if !self.remapper.is_canonical(key) {
            return Ok(());
        }
        self.delegate.delete_section_data(key)
    }

    fn iterate_stored_section_positions(&self, consumer: &mut dyn FnMut(SectionKey)) -> Result<()> {
        self.delegate.iterate_stored_section_positions(consumer)
    }

    fn put_id_mapping(&self, id: u32, data: &[u8]) -> Result<()> {
        self.delegate.put_id_mapping(id, data)
    }

    fn get_id_mappings(&self) -> Result<HashMap<u32, Vec<u8>>> {
        self.delegate.get_id_mappings()
    }

    fn flush(&self) -> Result<()> {
        self.delegate.flush()
    }

    fn close(&self) -> Result<()> {
        self.delegate.close()
    }

    fn child_backends(&self) -> Vec<&dyn StorageBackend> {
        vec![self.delegate.as_ref()]
    }

    fn stored_key(&self, key: SectionKey) -> SectionKey {
        match self.remapper.canonical(key) {
            Some(canonical) => self.delegate.stored_key(canonical),
            None => key,
        }
    }
}

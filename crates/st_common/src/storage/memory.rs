//! In-memory storage backend for testing purposes.

use crate::prelude::*;
use crate::storage::StorageBackend;

/// Non-persistent backend keeping every record in hash maps.
/// Counts flushes and rejects all operations once closed, to make chain lifecycles observable.
#[derive(Debug, Default)]
pub struct MemoryStorageBackend {
    sections: RwLock<HashMap<SectionKey, Vec<u8>>>,
    id_mappings: RwLock<HashMap<u32, Vec<u8>>>,
    flushes: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryStorageBackend {
    /// Constructs an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored section records.
    pub fn section_count(&self) -> usize {
        self.sections.read().unwrap().len()
    }

    /// Number of times [`StorageBackend::flush`] was called.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(AtomicOrdering::Acquire)
    }

    /// Whether [`StorageBackend::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        ensure!(!self.is_closed(), "Memory storage backend used after close");
        Ok(())
    }
}

impl StorageBackend for MemoryStorageBackend {
    fn get_section_data(&self, key: SectionKey) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.sections.read().unwrap().get(&key).cloned())
    }

    fn set_section_data(&self, key: SectionKey, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.sections.write().unwrap().insert(key, data.to_vec());
        Ok(())
    }

    fn delete_section_data(&self, key: SectionKey) -> Result<()> {
        self.check_open()?;
        self.sections.write().unwrap().remove(&key);
        Ok(())
    }

    fn iterate_stored_section_positions(&self, consumer: &mut dyn FnMut(SectionKey)) -> Result<()> {
        self.check_open()?;
        let keys: Vec<SectionKey> = self.sections.read().unwrap().keys().copied().collect();
        keys.into_iter().for_each(consumer);
        Ok(())
    }

    fn put_id_mapping(&self, id: u32, data: &[u8]) -> Result<()> {
        self.check_open()?;
        self.id_mappings.write().unwrap().insert(id, data.to_vec());
        Ok(())
    }

    fn get_id_mappings(&self) -> Result<HashMap<u32, Vec<u8>>> {
        self.check_open()?;
        Ok(self.id_mappings.read().unwrap().clone())
    }

    fn flush(&self) -> Result<()> {
        self.check_open()?;
        self.flushes.fetch_add(1, AtomicOrdering::AcqRel);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        ensure!(
            !self.closed.swap(true, AtomicOrdering::AcqRel),
            "Memory storage backend closed twice"
        );
        Ok(())
    }
}

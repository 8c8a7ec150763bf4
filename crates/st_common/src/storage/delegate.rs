//! Pass-through storage adaptor.

use crate::prelude::*;
use crate::storage::StorageBackend;

/// Forwards every request unchanged, the base case for composing adaptors.
pub struct DelegatingStorageAdaptor {
    delegate: Box<dyn StorageBackend>,
}

impl DelegatingStorageAdaptor {
    /// Wraps the given layer.
    pub fn new(delegate: Box<dyn StorageBackend>) -> Self {
        Self { delegate }
    }

    /// The wrapped layer.
    pub fn delegate(&self) -> &dyn StorageBackend {
        self.delegate.as_ref()
    }
}

impl StorageBackend for DelegatingStorageAdaptor {
    fn get_section_data(&self, key: SectionKey) -> Result<Option<Vec<u8>>> {
        self.delegate.get_section_data(key)
    }

    fn set_section_data(&self, key: SectionKey, data: &[u8]) -> Result<()> {
        self.delegate.set_section_data(key, data)
    }

    fn delete_section_data(&self, key: SectionKey) -> Result<()> {
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
}

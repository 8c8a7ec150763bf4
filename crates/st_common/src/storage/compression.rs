//! Transparent compression of stored section records.

use crate::prelude::*;
use crate::storage::StorageBackend;

/// A whole-blob compression scheme.
pub trait StorageCompressor: Send + Sync + 'static {
    /// Compresses a record.
    fn compress(&self, data: &[u8]) -> Vec<u8>;
    /// Reverses [`Self::compress`].
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
    /// Releases any resources held by the compressor.
    fn close(&self) {}
}

/// LZ4 block compression with the uncompressed size prepended.
#[derive(Copy, Clone, Debug, Default)]
pub struct Lz4Compressor;

impl StorageCompressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Vec<u8> {
        lz4_flex::compress_prepend_size(data)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data).context("Could not decompress a section record")
    }
}

/// Compresses section records on write and decompresses them on read. Identifier mappings pass through.
pub struct CompressionStorageAdaptor {
    compressor: Box<dyn StorageCompressor>,
    delegate: Box<dyn StorageBackend>,
}

impl CompressionStorageAdaptor {
    /// Wraps the given layer.
    pub fn new(compressor: Box<dyn StorageCompressor>, delegate: Box<dyn StorageBackend>) -> Self {
        Self { compressor, delegate }
    }
}

impl StorageBackend for CompressionStorageAdaptor {
    fn get_section_data(&self, key: SectionKey) -> Result<Option<Vec<u8>>> {
        self.delegate
            .get_section_data(key)?
            .map(|data| self.compressor.decompress(&data))
            .transpose()
            .with_context(|| format!("Reading section {key}"))
    }

    fn set_section_data(&self, key: SectionKey, data: &[u8]) -> Result<()> {
        let compressed = self.compressor.compress(data);
        self.delegate.set_section_data(key, &compressed)
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
        self.compressor.close();
        self.delegate.close()
    }

    fn child_backends(&self) -> Vec<&dyn StorageBackend> {
        vec![self.delegate.as_ref()]
    }
}

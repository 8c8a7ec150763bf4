//! Persistent section storage: backends and the adaptors composing them.
//!
//! A storage chain is a tree of boxed [`StorageBackend`]s, each adaptor owning the layer it wraps.
//! The outermost layer is the first to see a request.

use crate::prelude::*;

pub mod compression;
pub mod delegate;
pub mod memory;
pub mod remap;
pub mod sled;

/// A key to blob store for encoded sections, plus a side table of identifier mappings.
/// Implementations must be safe to use from many saving workers at once.
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads the stored blob for the section, if any. The returned buffer is owned by the caller.
    fn get_section_data(&self, key: SectionKey) -> Result<Option<Vec<u8>>>;
    /// Stores a blob for the section, replacing any previous one.
    fn set_section_data(&self, key: SectionKey, data: &[u8]) -> Result<()>;
    /// Removes the stored blob for the section, if any.
    fn delete_section_data(&self, key: SectionKey) -> Result<()>;
    /// Calls `consumer` with the key of every stored section, in no particular order.
    fn iterate_stored_section_positions(&self, consumer: &mut dyn FnMut(SectionKey)) -> Result<()>;
    /// Stores an identifier mapping entry, replacing any previous one.
    fn put_id_mapping(&self, id: u32, data: &[u8]) -> Result<()>;
    /// Reads all identifier mapping entries.
    fn get_id_mappings(&self) -> Result<HashMap<u32, Vec<u8>>>;
    /// Makes all previous writes durable.
    fn flush(&self) -> Result<()>;
    /// Releases the resources of this layer and everything beneath it, the backend should not be used afterwards.
    fn close(&self) -> Result<()>;
    /// The layers directly wrapped by this one.
    fn child_backends(&self) -> Vec<&dyn StorageBackend> {
        Vec::new()
    }
    /// The key the record read for `key` was written under, which is what the record itself carries.
    /// Layers wrapping a single other layer ask it, everything else stores records under their own key.
    fn stored_key(&self, key: SectionKey) -> SectionKey {
        match self.child_backends().as_slice() {
            [inner] => inner.stored_key(key),
            _ => key,
        }
    }
}

/// Flattens a storage chain, root first then each child subtree depth first.
pub fn collect_all_backends(root: &dyn StorageBackend) -> Vec<&dyn StorageBackend> {
    let mut out = vec![root];
    for child in root.child_backends() {
        out.extend(collect_all_backends(child));
    }
    out
}

#[cfg(test)]
mod test {
    use super::compression::{CompressionStorageAdaptor, Lz4Compressor};
    use super::delegate::DelegatingStorageAdaptor;
    use super::memory::MemoryStorageBackend;
    use super::remap::{AbyssRemapper, RemapStorageAdaptor};
    use super::*;

    #[test]
    fn chain_flattening() {
        let chain = DelegatingStorageAdaptor::new(Box::new(RemapStorageAdaptor::new(
            Box::new(AbyssRemapper),
            Box::new(CompressionStorageAdaptor::new(
                Box::new(Lz4Compressor),
                Box::new(MemoryStorageBackend::new()),
            )),
        )));
        let all = collect_all_backends(&chain);
        assert_eq!(all.len(), 4);
        assert!(all[3].child_backends().is_empty());
        assert!(std::ptr::addr_eq(all[0], &chain as &dyn StorageBackend));
    }

    /// Counts lifecycle calls reaching the bottom of a chain.
    #[derive(Default)]
    struct LifecycleCounter {
        flushes: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl StorageBackend for LifecycleCounter {
        fn get_section_data(&self, _key: SectionKey) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn set_section_data(&self, _key: SectionKey, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn delete_section_data(&self, _key: SectionKey) -> Result<()> {
            Ok(())
        }
        fn iterate_stored_section_positions(&self, _consumer: &mut dyn FnMut(SectionKey)) -> Result<()> {
            Ok(())
        }
        fn put_id_mapping(&self, _id: u32, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn get_id_mappings(&self) -> Result<HashMap<u32, Vec<u8>>> {
            Ok(HashMap::new())
        }
        fn flush(&self) -> Result<()> {
            self.flushes.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
        fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn lifecycle_reaches_every_layer_once() {
        let counter = LifecycleCounter::default();
        let (flushes, closes) = (Arc::clone(&counter.flushes), Arc::clone(&counter.closes));
        let chain = DelegatingStorageAdaptor::new(Box::new(RemapStorageAdaptor::new(
            Box::new(AbyssRemapper),
            Box::new(CompressionStorageAdaptor::new(Box::new(Lz4Compressor), Box::new(counter))),
        )));
        chain.flush().unwrap();
        assert_eq!(flushes.load(AtomicOrdering::SeqCst), 1);
        chain.close().unwrap();
        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(flushes.load(AtomicOrdering::SeqCst), 1);
    }
}

//! Engine configuration

use std::path::PathBuf;

use smart_default::SmartDefault;
use st_schemas::voxel::codec::CodecOptions;
use st_schemas::voxel::update::UPDATE_LEVELS;

use crate::prelude::*;
use crate::storage::compression::{CompressionStorageAdaptor, Lz4Compressor};
use crate::storage::delegate::DelegatingStorageAdaptor;
use crate::storage::memory::MemoryStorageBackend;
use crate::storage::remap::{AbyssRemapper, RemapStorageAdaptor};
use crate::storage::sled::SledStorageBackend;
use crate::storage::StorageBackend;

/// Configuration of a single world's section cache and propagation.
#[derive(Clone, Eq, PartialEq, Debug, SmartDefault)]
pub struct WorldConfig {
    /// Number of mip levels an update is written to, `1..=5`.
    #[default(UPDATE_LEVELS)]
    pub max_mip_levels: u8,
    /// The section tracker uses `2^tracker_shard_bits` independently locked shards.
    #[default = 3]
    pub tracker_shard_bits: u32,
    /// Maximum number of sections resident in the tracker at once, unlimited if [`None`].
    #[default(None)]
    pub max_resident_sections: Option<usize>,
    /// Maximum number of unused section arrays kept around for reuse.
    #[default = 300]
    pub grid_pool_size: usize,
    /// Verification switches used when loading sections.
    pub codec: CodecOptions,
    /// Scheduling weight of the saving service.
    #[default = 100]
    pub saving_weight: u32,
    /// Scheduling weight of the ingest service.
    #[default = 60]
    pub ingest_weight: u32,
}

/// Configuration of the shared service thread pool.
#[derive(Clone, Eq, PartialEq, Debug, SmartDefault)]
pub struct ServiceConfig {
    /// Number of worker threads.
    #[default(default_worker_threads())]
    pub worker_threads: usize,
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Description of a storage adaptor chain, outermost layer first.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub enum StorageConfig {
    /// A non-persistent [`MemoryStorageBackend`].
    #[default]
    Memory,
    /// A [`SledStorageBackend`] database at the given path.
    Sled {
        /// Database directory.
        path: PathBuf,
    },
    /// LZ4 compression of every section record.
    Compression {
        /// The wrapped layer.
        delegate: Box<StorageConfig>,
    },
    /// Abyss band folding with an [`AbyssRemapper`].
    Remap {
        /// The wrapped layer.
        delegate: Box<StorageConfig>,
    },
    /// A pass-through layer.
    Delegate {
        /// The wrapped layer.
        delegate: Box<StorageConfig>,
    },
}

impl StorageConfig {
    /// Constructs the described chain.
    pub fn build(&self) -> Result<Box<dyn StorageBackend>> {
        Ok(match self {
            Self::Memory => Box::new(MemoryStorageBackend::new()),
            Self::Sled { path } => Box::new(
                SledStorageBackend::open(path)
                    .with_context(|| format!("Could not open the sled storage at {}", path.display()))?,
            ),
            Self::Compression { delegate } => Box::new(CompressionStorageAdaptor::new(
                Box::new(Lz4Compressor),
                delegate.build()?,
            )),
            Self::Remap { delegate } => Box::new(RemapStorageAdaptor::new(Box::new(AbyssRemapper), delegate.build()?)),
            Self::Delegate { delegate } => Box::new(DelegatingStorageAdaptor::new(delegate.build()?)),
        })
    }
}

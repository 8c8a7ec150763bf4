//! Persistent storage backend on top of a [`sled`] database.

use std::path::Path;

use crate::prelude::*;
use crate::storage::StorageBackend;

const SECTIONS_TREE: &str = "sections";
const ID_MAPPINGS_TREE: &str = "id_mappings";

/// Stores sections in the `sections` tree keyed by the big-endian section key (so iteration follows key
/// order), and identifier mappings in the `id_mappings` tree keyed by the big-endian identifier.
pub struct SledStorageBackend {
    db: sled::Db,
    sections: sled::Tree,
    id_mappings: sled::Tree,
}

impl SledStorageBackend {
    /// Opens or creates a database in the given directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Creates a database that is deleted when dropped.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::default().temporary(true).open()?;
        Self::from_db(db)
    }

    /// Uses an already opened database.
    pub fn from_db(db: sled::Db) -> Result<Self> {
        let sections = db
            .open_tree(SECTIONS_TREE)
            .context("Could not open the sections tree")?;
        let id_mappings = db
            .open_tree(ID_MAPPINGS_TREE)
            .context("Could not open the id mappings tree")?;
        Ok(Self {
            db,
            sections,
            id_mappings,
        })
    }
}

impl StorageBackend for SledStorageBackend {
    fn get_section_data(&self, key: SectionKey) -> Result<Option<Vec<u8>>> {
        Ok(self.sections.get(key.to_be_bytes())?.map(|v| v.to_vec()))
    }

    fn set_section_data(&self, key: SectionKey, data: &[u8]) -> Result<()> {
        self.sections.insert(key.to_be_bytes(), data)?;
        Ok(())
    }

    fn delete_section_data(&self, key: SectionKey) -> Result<()> {
        self.sections.remove(key.to_be_bytes())?;
        Ok(())
    }

    fn iterate_stored_section_positions(&self, consumer: &mut dyn FnMut(SectionKey)) -> Result<()> {
        for raw in self.sections.iter().keys() {
            let raw = raw?;
            let bytes: [u8; 8] = raw
                .as_ref()
                .try_into()
                .with_context(|| format!("Malformed section key of {} bytes in storage", raw.len()))?;
            consumer(SectionKey::from_be_bytes(bytes));
        }
        Ok(())
    }

    fn put_id_mapping(&self, id: u32, data: &[u8]) -> Result<()> {
        self.id_mappings.insert(id.to_be_bytes(), data)?;
        Ok(())
    }

    fn get_id_mappings(&self) -> Result<HashMap<u32, Vec<u8>>> {
        let mut out = HashMap::with_capacity(self.id_mappings.len());
        for entry in self.id_mappings.iter() {
            let (id, data) = entry?;
            let id: [u8; 4] = id
                .as_ref()
                .try_into()
                .with_context(|| format!("Malformed id mapping key of {} bytes in storage", id.len()))?;
            out.insert(u32::from_be_bytes(id), data.to_vec());
        }
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().context("Could not flush the sled database")?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // sled releases the database on drop, closing only has to make the data durable.
        self.flush()
    }
}

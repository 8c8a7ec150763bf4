//! The in-memory world: resident sections, their tracker, and the engine keeping the level-of-detail
//! pyramid consistent and persisted.

pub mod engine;
pub mod ingest;
pub mod saving;
pub mod section;
pub mod tracker;

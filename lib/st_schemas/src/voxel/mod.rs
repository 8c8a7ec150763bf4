//! Voxel data representations: packed voxel states, the section codec and producer-side updates.

pub mod codec;
pub mod state;
pub mod update;

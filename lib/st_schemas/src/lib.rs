#![warn(missing_docs)]
#![deny(clippy::disallowed_types)]

//! A library crate of the in-memory and at-rest representations of the voxel LOD store's core data.

pub mod coordinates;
pub mod voxel;

/// Re-exported dependencies used in API types
pub mod dependencies {
    pub use bevy_math;
    pub use bytemuck;
    pub use hashbrown;
    pub use itertools;
    pub use serde;
    pub use thiserror;
}

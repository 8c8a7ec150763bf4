//! Multi-resolution voxel updates handed to the world by an external voxelizer.

use bevy_math::IVec3;

use crate::voxel::state::VoxelState;

/// Length of a side of the finest (level 0) grid of an update, in voxels.
pub const UPDATE_DIM: i32 = 16;
/// Number of levels carried by an update: 16³, 8³, 4³, 2³ and 1³.
pub const UPDATE_LEVELS: u8 = 5;

const fn level_offset(level: u8) -> usize {
    let mut offset = 0;
    let mut l = 0;
    while l < level {
        let dim = (UPDATE_DIM >> l) as usize;
        offset += dim * dim * dim;
        l += 1;
    }
    offset
}

/// Total number of voxel states stored in a [`VoxelizedSection`].
pub const UPDATE_VOLUME: usize = level_offset(UPDATE_LEVELS);

/// A read-only view of a pre-computed multi-resolution update.
///
/// Level `l` holds `16 >> l` voxels per side; the anchor is expressed in units of [`UPDATE_DIM`]
/// level-0 voxels, so an update covers exactly one anchor cell at every level.
pub trait VoxelUpdate {
    /// Position of the update, in units of level-0 [`UPDATE_DIM`]-sized cells.
    fn anchor(&self) -> IVec3;
    /// Gets the state at the given level and coordinates local to the update (`0..16 >> level`).
    fn get(&self, level: u8, x: i32, y: i32, z: i32) -> VoxelState;
}

/// A dense [`VoxelUpdate`] storing all [`UPDATE_LEVELS`] levels.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct VoxelizedSection {
    anchor: IVec3,
    data: Box<[VoxelState]>,
}

impl VoxelizedSection {
    /// Constructs an update at the given anchor with every level filled with air.
    pub fn new(anchor: IVec3) -> Self {
        Self::filled(anchor, VoxelState::AIR)
    }

    /// Constructs an update at the given anchor with every level filled with `state`.
    pub fn filled(anchor: IVec3, state: VoxelState) -> Self {
        Self {
            anchor,
            data: vec![state; UPDATE_VOLUME].into_boxed_slice(),
        }
    }

    /// Length of a side of the grid at the given level.
    #[inline]
    pub const fn level_dim(level: u8) -> i32 {
        UPDATE_DIM >> level
    }

    #[inline]
    fn index(level: u8, x: i32, y: i32, z: i32) -> usize {
        assert!(level < UPDATE_LEVELS, "Update level {level} out of range");
        let dim = Self::level_dim(level);
        assert!(
            (0..dim).contains(&x) && (0..dim).contains(&y) && (0..dim).contains(&z),
            "Update coordinates ({x}, {y}, {z}) outside of level {level}"
        );
        level_offset(level) + ((y * dim + z) * dim + x) as usize
    }

    /// Sets the state at the given level and local coordinates.
    pub fn set(&mut self, level: u8, x: i32, y: i32, z: i32, state: VoxelState) {
        self.data[Self::index(level, x, y, z)] = state;
    }

    /// Fills a whole level with a single state.
    pub fn fill_level(&mut self, level: u8, state: VoxelState) {
        let start = level_offset(level);
        let end = level_offset(level + 1);
        self.data[start..end].fill(state);
    }
}

impl VoxelUpdate for VoxelizedSection {
    #[inline]
    fn anchor(&self) -> IVec3 {
        self.anchor
    }

    #[inline]
    fn get(&self, level: u8, x: i32, y: i32, z: i32) -> VoxelState {
        self.data[Self::index(level, x, y, z)]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn volume() {
        assert_eq!(UPDATE_VOLUME, 4096 + 512 + 64 + 8 + 1);
    }

    #[test]
    fn levels_do_not_overlap() {
        let mut update = VoxelizedSection::new(IVec3::new(1, -2, 3));
        update.fill_level(1, VoxelState::compose(2, 0, 0));
        update.set(0, 15, 15, 15, VoxelState::compose(1, 0, 0));
        update.set(4, 0, 0, 0, VoxelState::compose(4, 0, 0));
        assert_eq!(update.get(0, 15, 15, 15).block_id(), 1);
        assert_eq!(update.get(0, 14, 15, 15), VoxelState::AIR);
        assert_eq!(update.get(1, 0, 0, 0).block_id(), 2);
        assert_eq!(update.get(1, 7, 7, 7).block_id(), 2);
        assert_eq!(update.get(2, 0, 0, 0), VoxelState::AIR);
        assert_eq!(update.get(4, 0, 0, 0).block_id(), 4);
        assert_eq!(update.anchor(), IVec3::new(1, -2, 3));
    }

    #[test]
    #[should_panic]
    fn out_of_level_bounds() {
        let update = VoxelizedSection::new(IVec3::ZERO);
        update.get(2, 4, 0, 0);
    }
}

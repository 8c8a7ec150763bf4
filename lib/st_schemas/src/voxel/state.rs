//! The packed 64-bit voxel state stored in every section cell.
use std::fmt::{Debug, Formatter};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// A packed voxel state: block id, biome id and light level, produced by an external block/biome mapper.
///
/// Bit layout: `light(8) biome(9) block(20) free(27)`, from the most significant bit.
/// The low 27 bits are not interpreted here and are left for the mapper's use.
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Pod, Zeroable, Serialize, Deserialize)]
#[repr(transparent)]
pub struct VoxelState(pub u64);

impl VoxelState {
    /// The empty (air) state, block id 0 with no light and the default biome.
    pub const AIR: Self = Self(0);

    const BLOCK_SHIFT: u32 = 27;
    const BLOCK_MASK: u64 = (1 << 20) - 1;
    const BIOME_SHIFT: u32 = 47;
    const BIOME_MASK: u64 = (1 << 9) - 1;
    const LIGHT_SHIFT: u32 = 56;

    /// Packs a block id (20 bits), biome id (9 bits) and light level (8 bits) into a state.
    /// Out of range ids are truncated.
    #[inline]
    pub const fn compose(block_id: u32, biome_id: u32, light: u8) -> Self {
        Self(
            ((light as u64) << Self::LIGHT_SHIFT)
                | (((biome_id as u64) & Self::BIOME_MASK) << Self::BIOME_SHIFT)
                | (((block_id as u64) & Self::BLOCK_MASK) << Self::BLOCK_SHIFT),
        )
    }

    /// The block id part of the state.
    #[inline]
    pub const fn block_id(self) -> u32 {
        ((self.0 >> Self::BLOCK_SHIFT) & Self::BLOCK_MASK) as u32
    }

    /// The biome id part of the state.
    #[inline]
    pub const fn biome_id(self) -> u32 {
        ((self.0 >> Self::BIOME_SHIFT) & Self::BIOME_MASK) as u32
    }

    /// The light level part of the state.
    #[inline]
    pub const fn light(self) -> u8 {
        (self.0 >> Self::LIGHT_SHIFT) as u8
    }

    /// Air is any state with a block id of 0, regardless of biome and light.
    #[inline]
    pub const fn is_air(self) -> bool {
        self.block_id() == 0
    }

    /// Same as [`Self::is_air`], for raw packed values.
    #[inline]
    pub const fn raw_is_air(raw: u64) -> bool {
        Self(raw).is_air()
    }
}

impl Debug for VoxelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VoxelState{{block={}, biome={}, light={}}}",
            self.block_id(),
            self.biome_id(),
            self.light()
        )
    }
}

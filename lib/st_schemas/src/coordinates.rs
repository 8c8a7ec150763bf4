//! Section keys, in-section indexing and the related constants.

use std::fmt::{Display, Formatter};

use bevy_math::IVec3;
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a side of a section in voxels
pub const SECTION_DIM: i32 = 32;
/// Length of a side of a section in voxels
pub const SECTION_DIMZ: usize = SECTION_DIM as usize;
/// Number of voxels on the face of a section
pub const SECTION_DIM2: i32 = SECTION_DIM * SECTION_DIM;
/// Number of voxels in the volume of a section
pub const SECTION_DIM3: i32 = SECTION_DIM * SECTION_DIM * SECTION_DIM;
/// Number of voxels in the volume of a section
pub const SECTION_DIM3Z: usize = SECTION_DIM3 as usize;
/// log2 of [`SECTION_DIM`]
pub const SECTION_DIM_BITS: u32 = 5;

/// Highest level of detail representable in a [`SectionKey`].
pub const MAX_LEVEL: u8 = 15;
/// Number of bits used by every coordinate inside a [`SectionKey`].
pub const KEY_COORD_BITS: u32 = 20;
/// Smallest section coordinate representable in a [`SectionKey`].
pub const MIN_SECTION_COORD: i32 = -(1 << (KEY_COORD_BITS - 1));
/// Largest section coordinate representable in a [`SectionKey`].
pub const MAX_SECTION_COORD: i32 = (1 << (KEY_COORD_BITS - 1)) - 1;

static_assertions::const_assert_eq!(1 << SECTION_DIM_BITS, SECTION_DIM);
static_assertions::const_assert_eq!(4 + 3 * KEY_COORD_BITS, u64::BITS);

const KEY_COORD_MASK: u64 = (1 << KEY_COORD_BITS) - 1;

/// Error when a level or section coordinate does not fit into a [`SectionKey`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum SectionKeyError {
    /// The level is larger than [`MAX_LEVEL`].
    #[error("Level {0} is larger than the maximum of {MAX_LEVEL}")]
    LevelOutOfRange(u8),
    /// A coordinate is outside of `MIN_SECTION_COORD..=MAX_SECTION_COORD`.
    #[error("Section coordinates {0} are outside of the representable range")]
    CoordinateOutOfRange(IVec3),
}

/// A (level, x, y, z) section address packed into 64 bits.
///
/// Layout, from the most significant bit: `llll zzzz(20) yyyy(20) xxxx(20)`, every coordinate is
/// stored in two's complement and restored with sign extension.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Pod, Zeroable, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SectionKey(u64);

impl SectionKey {
    /// Packs the given level and section coordinates, or returns an error if they're not representable.
    #[inline]
    pub const fn try_new(level: u8, pos: IVec3) -> Result<Self, SectionKeyError> {
        if level > MAX_LEVEL {
            return Err(SectionKeyError::LevelOutOfRange(level));
        }
        let IVec3 { x, y, z } = pos;
        if x < MIN_SECTION_COORD
            || x > MAX_SECTION_COORD
            || y < MIN_SECTION_COORD
            || y > MAX_SECTION_COORD
            || z < MIN_SECTION_COORD
            || z > MAX_SECTION_COORD
        {
            return Err(SectionKeyError::CoordinateOutOfRange(pos));
        }
        Ok(Self::pack_unchecked(level, x, y, z))
    }

    /// Packs the given level and section coordinates.
    /// Panics if they're not representable, see [`Self::try_new`].
    #[inline]
    pub fn new(level: u8, x: i32, y: i32, z: i32) -> Self {
        match Self::try_new(level, IVec3::new(x, y, z)) {
            Ok(key) => key,
            Err(e) => panic!("{e}"),
        }
    }

    #[inline]
    const fn pack_unchecked(level: u8, x: i32, y: i32, z: i32) -> Self {
        Self(
            ((level as u64) << 60)
                | (((z as u64) & KEY_COORD_MASK) << 40)
                | (((y as u64) & KEY_COORD_MASK) << 20)
                | ((x as u64) & KEY_COORD_MASK),
        )
    }

    /// Reinterprets a raw packed key, e.g. one read back from storage.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw packed representation.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Level of detail of the section.
    #[inline]
    pub const fn level(self) -> u8 {
        (self.0 >> 60) as u8
    }

    /// Section X coordinate.
    #[inline]
    pub const fn x(self) -> i32 {
        (((self.0 << 44) as i64) >> 44) as i32
    }

    /// Section Y coordinate.
    #[inline]
    pub const fn y(self) -> i32 {
        (((self.0 << 24) as i64) >> 44) as i32
    }

    /// Section Z coordinate.
    #[inline]
    pub const fn z(self) -> i32 {
        (((self.0 << 4) as i64) >> 44) as i32
    }

    /// All section coordinates as a vector.
    #[inline]
    pub const fn pos(self) -> IVec3 {
        IVec3::new(self.x(), self.y(), self.z())
    }

    /// The key of the section one level coarser that covers this section, or [`None`] at [`MAX_LEVEL`].
    #[inline]
    pub const fn parent(self) -> Option<Self> {
        if self.level() >= MAX_LEVEL {
            return None;
        }
        Some(Self::pack_unchecked(
            self.level() + 1,
            self.x() >> 1,
            self.y() >> 1,
            self.z() >> 1,
        ))
    }

    /// Index (0..8) of this section among the 8 children of its parent, used as the bit index in the
    /// parent's non-empty-children mask.
    #[inline]
    pub const fn child_slot(self) -> u8 {
        ((self.x() & 1) | ((self.z() & 1) << 1) | ((self.y() & 1) << 2)) as u8
    }

    /// Big-endian byte representation, sorts the same way as the raw key.
    #[inline]
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Inverse of [`Self::to_be_bytes`].
    #[inline]
    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl Display for SectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}@({}, {}, {})", self.level(), self.x(), self.y(), self.z())
    }
}

/// Linear XZY-strided index of a voxel in a section (strides of X=1, Z=32, Y=32²).
/// Coordinates are wrapped into the section.
#[inline]
pub const fn section_index(x: i32, y: i32, z: i32) -> usize {
    const M: i32 = SECTION_DIM - 1;
    (((y & M) << 10) | ((z & M) << 5) | (x & M)) as usize
}

/// Inverse of [`section_index`].
#[inline]
pub const fn section_coords(idx: usize) -> IVec3 {
    let i = idx as i32;
    IVec3::new(i & 0x1F, (i >> 10) & 0x1F, (i >> 5) & 0x1F)
}

/// Spreads the low 10 bits of `v` so that there are two zero bits between each of them.
#[inline]
const fn spread_3(v: u32) -> u32 {
    let mut v = v & 0x3FF;
    v = (v | (v << 16)) & 0x0300_00FF;
    v = (v | (v << 8)) & 0x0300_F00F;
    v = (v | (v << 4)) & 0x030C_30C3;
    v = (v | (v << 2)) & 0x0924_9249;
    v
}

/// Inverse of [`spread_3`].
#[inline]
const fn compact_3(v: u32) -> u32 {
    let mut v = v & 0x0924_9249;
    v = (v ^ (v >> 2)) & 0x030C_30C3;
    v = (v ^ (v >> 4)) & 0x0300_F00F;
    v = (v ^ (v >> 8)) & 0xFF00_00FF;
    v = (v ^ (v >> 16)) & 0x0000_03FF;
    v
}

/// Converts a linear XZY section index into a Z-order curve index (`..zyxzyx` bit pattern), so that
/// spatially adjacent voxels end up close to each other.
/// See [Z-order curves](https://en.wikipedia.org/wiki/Z-order_curve).
#[inline]
pub const fn lin_to_z(idx: usize) -> usize {
    let i = idx as u32;
    let x = i & 0x1F;
    let y = (i >> 10) & 0x1F;
    let z = (i >> 5) & 0x1F;
    (spread_3(x) | (spread_3(y) << 1) | (spread_3(z) << 2)) as usize
}

/// Inverse of [`lin_to_z`].
#[inline]
pub const fn z_to_lin(zidx: usize) -> usize {
    let i = zidx as u32;
    let x = compact_3(i);
    let y = compact_3(i >> 1);
    let z = compact_3(i >> 2);
    (x | (y << 10) | (z << 5)) as usize
}

/// Slower reference implementation of [`lin_to_z`], public for benchmark purposes
pub fn lin_to_z_naive(idx: usize) -> usize {
    let pos = section_coords(idx).as_uvec3();
    let mut out = 0usize;
    for bit in 0..SECTION_DIM_BITS {
        let bit_mask = 1 << bit;
        if (pos.x & bit_mask) != 0 {
            out |= 1 << (3 * bit);
        }
        if (pos.y & bit_mask) != 0 {
            out |= 1 << (3 * bit + 1);
        }
        if (pos.z & bit_mask) != 0 {
            out |= 1 << (3 * bit + 2);
        }
    }
    out
}

#[cfg(test)]
mod test {
    use itertools::iproduct;
    use quickcheck_macros::quickcheck;

    use super::*;

    #[test]
    fn key_packing_edges() {
        let list = [
            0,
            1,
            -1,
            2,
            -2,
            31,
            -32,
            1000,
            -1000,
            MIN_SECTION_COORD,
            MAX_SECTION_COORD,
        ];
        for (level, (x, y, z)) in iproduct!([0u8, 1, 4, 15], iproduct!(list, list, list)) {
            let key = SectionKey::new(level, x, y, z);
            assert_eq!(key.level(), level, "{key}");
            assert_eq!(key.pos(), IVec3::new(x, y, z), "{key:?}");
        }
    }

    #[quickcheck]
    fn key_roundtrip(level: u8, x: i32, y: i32, z: i32) -> bool {
        let level = level % (MAX_LEVEL + 1);
        let pos = IVec3::new(x, y, z) >> 12;
        let key = SectionKey::try_new(level, pos).unwrap();
        key.level() == level && key.pos() == pos && SectionKey::from_be_bytes(key.to_be_bytes()) == key
    }

    #[test]
    fn key_range_errors() {
        assert_eq!(
            SectionKey::try_new(16, IVec3::ZERO),
            Err(SectionKeyError::LevelOutOfRange(16))
        );
        let big = IVec3::new(0, MAX_SECTION_COORD + 1, 0);
        assert_eq!(
            SectionKey::try_new(0, big),
            Err(SectionKeyError::CoordinateOutOfRange(big))
        );
        let small = IVec3::new(0, 0, MIN_SECTION_COORD - 1);
        assert!(SectionKey::try_new(0, small).is_err());
    }

    #[test]
    fn distinct_levels_distinct_keys() {
        let a = SectionKey::new(0, -1, -1, -1);
        let b = SectionKey::new(1, -1, -1, -1);
        assert_ne!(a, b);
        assert_ne!(SectionKey::new(0, 1, 0, 0), SectionKey::new(0, 0, 1, 0));
    }

    #[test]
    fn parent_and_child_slot() {
        let key = SectionKey::new(0, 3, -1, 4);
        let parent = key.parent().unwrap();
        assert_eq!(parent, SectionKey::new(1, 1, -1, 2));
        assert_eq!(key.child_slot(), 0b101);
        assert_eq!(SectionKey::new(0, 0, 0, 0).child_slot(), 0);
        assert_eq!(SectionKey::new(MAX_LEVEL, 0, 0, 0).parent(), None);
    }

    #[test]
    fn z_order_matches_reference() {
        for idx in 0..SECTION_DIM3Z {
            assert_eq!(lin_to_z(idx), lin_to_z_naive(idx), "index {idx}");
        }
    }

    #[test]
    fn z_order_is_bijective() {
        let mut seen = vec![false; SECTION_DIM3Z];
        for idx in 0..SECTION_DIM3Z {
            let z = lin_to_z(idx);
            assert!(!seen[z], "duplicate z index {z}");
            seen[z] = true;
            assert_eq!(z_to_lin(z), idx);
        }
    }

    #[test]
    fn section_index_roundtrip() {
        for (y, z, x) in iproduct!(0..SECTION_DIM, 0..SECTION_DIM, 0..SECTION_DIM) {
            let idx = section_index(x, y, z);
            assert_eq!(section_coords(idx), IVec3::new(x, y, z));
        }
        assert_eq!(section_index(1, 0, 0), 1);
        assert_eq!(section_index(0, 0, 1), 32);
        assert_eq!(section_index(0, 1, 0), 1024);
    }
}

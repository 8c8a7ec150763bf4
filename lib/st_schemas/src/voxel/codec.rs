//! The at-rest binary format of a section: palette compression plus an integrity hash.
//!
//! Layout (all integers little-endian):
//!
//! | field         | size             |
//! |---------------|------------------|
//! | key           | 8                |
//! | metadata      | 8                |
//! | palette len   | 4                |
//! | palette       | 8 × palette len  |
//! | indices       | 2 × 32768        |
//! | hash          | 8                |
//!
//! The palette lists unique voxel states in order of first appearance in the linear (XZY) scan, the
//! indices are stored in Z-order (see [`lin_to_z`]) for locality.

use hashbrown::HashMap;
use thiserror::Error;

use crate::coordinates::{lin_to_z, z_to_lin, SectionKey, SECTION_DIM3Z};
use crate::voxel::state::VoxelState;

/// Maximum number of entries in a section palette.
pub const MAX_PALETTE_LEN: usize = SECTION_DIM3Z;
/// Size of the fixed header preceding the palette.
pub const HEADER_SIZE: usize = 8 + 8 + 4;
/// Upper bound on the size of an encoded section.
pub const MAX_ENCODED_SIZE: usize = HEADER_SIZE + 8 * MAX_PALETTE_LEN + 2 * SECTION_DIM3Z + 8;

static_assertions::const_assert!(MAX_PALETTE_LEN <= u16::MAX as usize + 1);

const LEN_HASH_MUL: u64 = 1293481298141;
const META_HASH_MUL: u64 = 1242629872171;
const PALETTE_HASH_MUL: u64 = 1230987149811;
const PALETTE_HASH_ADD: u64 = 12831;
const RAW_HASH_SEED: u64 = 99;
const RAW_HASH_MUL: u64 = 127817112311121;
const RAW_HASH_ADD: u64 = 9918322711;

/// Per-section metadata stored next to the voxel data.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct SectionMetadata {
    /// One bit per child slot (see [`SectionKey::child_slot`]) set when that finer child contains non-air voxels.
    pub non_empty_children: u8,
}

impl SectionMetadata {
    /// Packs the metadata into its stored form.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.non_empty_children as u64
    }

    /// Unpacks stored metadata, unknown bits are ignored.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            non_empty_children: (raw & 0xFF) as u8,
        }
    }
}

/// Decoding verification switches.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CodecOptions {
    /// Recompute the rolling hash on decode and reject records that don't match.
    pub verify_hash: bool,
    /// Report reads past the end of the buffer as [`SectionDecodeError::OutOfBounds`] instead of panicking.
    pub verify_memory_access: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            verify_hash: true,
            verify_memory_access: true,
        }
    }
}

/// Result of a successful decode, the voxel data itself is written to the caller's buffer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct DecodedSection {
    /// Decoded metadata.
    pub metadata: SectionMetadata,
    /// Number of non-air voxels in the decoded data.
    pub non_air_count: u32,
}

/// Errors from [`SectionDecoder::decode`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum SectionDecodeError {
    /// The buffer ended before the expected data, this is never silently tolerated.
    #[error("Read of {len} bytes at offset {offset} is past the end of a {size} byte buffer")]
    OutOfBounds {
        /// Offset of the attempted read.
        offset: usize,
        /// Length of the attempted read.
        len: usize,
        /// Size of the buffer.
        size: usize,
    },
    /// The stored palette length is larger than a section can ever need.
    #[error("Palette length {0} is larger than the maximum of {MAX_PALETTE_LEN}")]
    PaletteTooLarge(u32),
    /// The record belongs to a different section than the one requested.
    #[error("Decoded section {found} is not the requested section {expected}")]
    KeyMismatch {
        /// Requested key.
        expected: SectionKey,
        /// Key stored in the record.
        found: SectionKey,
    },
    /// A voxel refers to a palette entry that doesn't exist.
    #[error("Palette index {index} out of range for a palette of {palette_len} entries")]
    PaletteIndexOutOfRange {
        /// The stored index.
        index: u16,
        /// The stored palette length.
        palette_len: u32,
    },
    /// The stored rolling hash doesn't match the decoded data.
    #[error("Hash mismatch, stored {stored:#018x}, computed {computed:#018x}")]
    HashMismatch {
        /// Hash read from the record.
        stored: u64,
        /// Hash computed from the decoded data.
        computed: u64,
    },
}

impl SectionDecodeError {
    /// Corrupt records should be discarded and the section treated as absent.
    /// Only [`Self::OutOfBounds`] is not considered ordinary corruption.
    pub fn is_corruption(&self) -> bool {
        !matches!(self, Self::OutOfBounds { .. })
    }
}

#[inline]
fn header_hash(key: SectionKey, palette_len: u32, metadata: u64) -> u64 {
    let mut hash = key.raw() ^ (palette_len as u64).wrapping_mul(LEN_HASH_MUL);
    hash ^= metadata;
    hash.wrapping_mul(META_HASH_MUL)
}

#[inline]
fn fold_palette_entry(hash: u64, entry: u64) -> u64 {
    hash.wrapping_mul(PALETTE_HASH_MUL).wrapping_add(PALETTE_HASH_ADD) ^ entry
}

#[inline]
fn fold_raw_voxel(hash: u64, voxel: u64) -> u64 {
    let mut hash = hash.wrapping_mul(RAW_HASH_MUL);
    hash ^= ((hash as i64) >> 31) as u64;
    hash = hash.wrapping_add(RAW_HASH_ADD);
    hash ^ voxel
}

/// Serializes sections, owning all the scratch memory needed so that repeated encodes don't allocate
/// anything but the output.
pub struct SectionEncoder {
    voxels: Box<[u64; SECTION_DIM3Z]>,
    indices: Box<[u16; SECTION_DIM3Z]>,
    lut: HashMap<u64, u16>,
    palette: Vec<u64>,
}

impl Default for SectionEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SectionEncoder {
    /// Allocates a new encoder with empty scratch buffers.
    pub fn new() -> Self {
        Self {
            voxels: bytemuck::zeroed_box(),
            indices: bytemuck::zeroed_box(),
            lut: HashMap::with_capacity(512),
            palette: Vec::with_capacity(512),
        }
    }

    /// The raw voxel buffer (XZY order) that the next [`Self::encode`] call will serialize.
    pub fn voxels_mut(&mut self) -> &mut [u64; SECTION_DIM3Z] {
        &mut self.voxels
    }

    /// Serializes the contents of [`Self::voxels_mut`] into a new buffer.
    pub fn encode(&mut self, key: SectionKey, metadata: SectionMetadata) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(key, metadata, &mut out);
        out
    }

    /// Serializes the contents of [`Self::voxels_mut`], appending to `out`.
    pub fn encode_into(&mut self, key: SectionKey, metadata: SectionMetadata, out: &mut Vec<u8>) {
        self.lut.clear();
        self.palette.clear();
        let mut raw_hash = RAW_HASH_SEED;
        for (i, &voxel) in self.voxels.iter().enumerate() {
            let next = self.palette.len() as u16;
            let mapping = *self.lut.entry(voxel).or_insert_with(|| next);
            if mapping == next {
                self.palette.push(voxel);
            }
            self.indices[lin_to_z(i)] = mapping;
            raw_hash = fold_raw_voxel(raw_hash, voxel);
        }

        let palette_len = self.palette.len() as u32;
        let metadata = metadata.to_raw();
        out.reserve(HEADER_SIZE + self.palette.len() * 8 + SECTION_DIM3Z * 2 + 8);
        out.extend_from_slice(&key.raw().to_le_bytes());
        out.extend_from_slice(&metadata.to_le_bytes());
        out.extend_from_slice(&palette_len.to_le_bytes());

        let mut hash = header_hash(key, palette_len, metadata);
        for &entry in &self.palette {
            out.extend_from_slice(&entry.to_le_bytes());
            hash = fold_palette_entry(hash, entry);
        }
        hash ^= raw_hash;

        for &idx in self.indices.iter() {
            out.extend_from_slice(&idx.to_le_bytes());
        }
        out.extend_from_slice(&hash.to_le_bytes());
    }

    /// Number of palette entries produced by the last encode.
    pub fn last_palette_len(&self) -> usize {
        self.palette.len()
    }
}

struct ByteCursor<'d> {
    data: &'d [u8],
    pos: usize,
    checked: bool,
}

impl<'d> ByteCursor<'d> {
    #[inline]
    fn take<const N: usize>(&mut self) -> Result<[u8; N], SectionDecodeError> {
        if self.checked && self.pos + N > self.data.len() {
            return Err(SectionDecodeError::OutOfBounds {
                offset: self.pos,
                len: N,
                size: self.data.len(),
            });
        }
        let bytes: [u8; N] = self.data[self.pos..self.pos + N]
            .try_into()
            .expect("Slice length matches the requested array length");
        self.pos += N;
        Ok(bytes)
    }

    #[inline]
    fn u64(&mut self) -> Result<u64, SectionDecodeError> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    #[inline]
    fn u32(&mut self) -> Result<u32, SectionDecodeError> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    #[inline]
    fn u16(&mut self) -> Result<u16, SectionDecodeError> {
        self.take::<2>().map(u16::from_le_bytes)
    }
}

/// Deserializes sections, owning the palette scratch buffer.
pub struct SectionDecoder {
    options: CodecOptions,
    palette: Vec<u64>,
}

impl Default for SectionDecoder {
    fn default() -> Self {
        Self::new(CodecOptions::default())
    }
}

impl SectionDecoder {
    /// Constructs a decoder with the given verification options.
    pub fn new(options: CodecOptions) -> Self {
        Self {
            options,
            palette: Vec::with_capacity(512),
        }
    }

    /// The verification options of this decoder.
    pub fn options(&self) -> CodecOptions {
        self.options
    }

    /// Decodes `data` into `out` (XZY order), verifying that it's a record of `expected_key`.
    ///
    /// On error `out` is left in an unspecified state.
    pub fn decode(
        &mut self,
        expected_key: SectionKey,
        data: &[u8],
        out: &mut [u64; SECTION_DIM3Z],
    ) -> Result<DecodedSection, SectionDecodeError> {
        let mut cursor = ByteCursor {
            data,
            pos: 0,
            checked: self.options.verify_memory_access,
        };
        let key = SectionKey::from_raw(cursor.u64()?);
        let raw_metadata = cursor.u64()?;
        let palette_len = cursor.u32()?;
        if palette_len as usize > MAX_PALETTE_LEN {
            return Err(SectionDecodeError::PaletteTooLarge(palette_len));
        }

        let mut hash = header_hash(key, palette_len, raw_metadata);
        self.palette.clear();
        for _ in 0..palette_len {
            let entry = cursor.u64()?;
            self.palette.push(entry);
            hash = fold_palette_entry(hash, entry);
        }

        if key != expected_key {
            return Err(SectionDecodeError::KeyMismatch {
                expected: expected_key,
                found: key,
            });
        }

        let mut non_air_count = 0u32;
        for zidx in 0..SECTION_DIM3Z {
            let index = cursor.u16()?;
            let state = *self
                .palette
                .get(index as usize)
                .ok_or(SectionDecodeError::PaletteIndexOutOfRange { index, palette_len })?;
            non_air_count += u32::from(!VoxelState::raw_is_air(state));
            out[z_to_lin(zidx)] = state;
        }

        if self.options.verify_hash {
            let raw_hash = out.iter().fold(RAW_HASH_SEED, |h, &v| fold_raw_voxel(h, v));
            hash ^= raw_hash;
            let stored = cursor.u64()?;
            if stored != hash {
                return Err(SectionDecodeError::HashMismatch { stored, computed: hash });
            }
        }

        Ok(DecodedSection {
            metadata: SectionMetadata::from_raw(raw_metadata),
            non_air_count,
        })
    }
}

#[cfg(test)]
mod test {
    use quickcheck_macros::quickcheck;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    use super::*;

    fn random_grid(encoder: &mut SectionEncoder, seed: u64, palette_size: usize) {
        let mut rng = Pcg64::seed_from_u64(seed);
        let palette: Vec<u64> = (0..palette_size).map(|_| rng.gen()).collect();
        for v in encoder.voxels_mut().iter_mut() {
            *v = palette[rng.gen_range(0..palette.len())];
        }
    }

    fn decode_fresh(
        key: SectionKey,
        data: &[u8],
        options: CodecOptions,
    ) -> Result<(DecodedSection, Box<[u64; SECTION_DIM3Z]>), SectionDecodeError> {
        let mut out: Box<[u64; SECTION_DIM3Z]> = bytemuck::zeroed_box();
        let decoded = SectionDecoder::new(options).decode(key, data, &mut out)?;
        Ok((decoded, out))
    }

    #[quickcheck]
    fn roundtrip(seed: u64, palette_size: u16, children: u8) -> bool {
        let palette_size = (palette_size as usize % MAX_PALETTE_LEN) + 1;
        let mut encoder = SectionEncoder::new();
        random_grid(&mut encoder, seed, palette_size);
        let key = SectionKey::new(3, -7, 12, 900);
        let metadata = SectionMetadata {
            non_empty_children: children,
        };
        let data = encoder.encode(key, metadata);
        let (decoded, out) = decode_fresh(key, &data, CodecOptions::default()).unwrap();
        let expected_non_air = encoder
            .voxels_mut()
            .iter()
            .filter(|&&v| !VoxelState::raw_is_air(v))
            .count() as u32;
        decoded.metadata == metadata && decoded.non_air_count == expected_non_air && out[..] == encoder.voxels_mut()[..]
    }

    #[test]
    fn roundtrip_all_unique() {
        let mut encoder = SectionEncoder::new();
        for (i, v) in encoder.voxels_mut().iter_mut().enumerate() {
            *v = (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        }
        let key = SectionKey::new(0, 0, 0, 0);
        let data = encoder.encode(key, SectionMetadata::default());
        assert_eq!(encoder.last_palette_len(), MAX_PALETTE_LEN);
        assert_eq!(data.len(), MAX_ENCODED_SIZE);
        let (_, out) = decode_fresh(key, &data, CodecOptions::default()).unwrap();
        assert_eq!(&out[..], &encoder.voxels_mut()[..]);
    }

    #[test]
    fn layout() {
        let mut encoder = SectionEncoder::new();
        let stone = VoxelState::compose(1, 0, 0).0;
        encoder.voxels_mut()[5] = stone;
        let key = SectionKey::new(2, 1, 2, 3);
        let data = encoder.encode(key, SectionMetadata { non_empty_children: 0x81 });
        assert_eq!(data.len(), HEADER_SIZE + 2 * 8 + 2 * SECTION_DIM3Z + 8);
        assert_eq!(&data[0..8], &key.raw().to_le_bytes());
        assert_eq!(&data[8..16], &0x81u64.to_le_bytes());
        assert_eq!(&data[16..20], &2u32.to_le_bytes());
        // Air appears first in the linear scan.
        assert_eq!(&data[20..28], &0u64.to_le_bytes());
        assert_eq!(&data[28..36], &stone.to_le_bytes());
        let zpos = HEADER_SIZE + 16 + 2 * lin_to_z(5);
        assert_eq!(&data[zpos..zpos + 2], &1u16.to_le_bytes());
    }

    #[test]
    fn single_byte_corruption_detected() {
        let mut encoder = SectionEncoder::new();
        random_grid(&mut encoder, 1234, 24);
        let key = SectionKey::new(1, 5, -5, 0);
        let data = encoder.encode(key, SectionMetadata::default());
        let palette_len = encoder.last_palette_len();
        let palette_start = HEADER_SIZE;
        let indices_start = palette_start + palette_len * 8;
        let indices_end = indices_start + SECTION_DIM3Z * 2;

        let positions = (palette_start..indices_start).chain((indices_start..indices_end).step_by(97));
        for pos in positions {
            for flip in [0x01u8, 0x80u8] {
                let mut corrupted = data.clone();
                corrupted[pos] ^= flip;
                match decode_fresh(key, &corrupted, CodecOptions::default()) {
                    Err(e) => assert!(e.is_corruption(), "byte {pos}: {e}"),
                    Ok(_) => panic!("Corruption of byte {pos} with {flip:#x} was not detected"),
                }
            }
        }
    }

    #[test]
    fn unverified_hash_accepts_modified_palette() {
        let mut encoder = SectionEncoder::new();
        random_grid(&mut encoder, 7, 4);
        let key = SectionKey::new(0, 1, 1, 1);
        let mut data = encoder.encode(key, SectionMetadata::default());
        data[HEADER_SIZE] ^= 0x10;
        let options = CodecOptions {
            verify_hash: false,
            ..CodecOptions::default()
        };
        assert!(decode_fresh(key, &data, options).is_ok());
        assert!(matches!(
            decode_fresh(key, &data, CodecOptions::default()),
            Err(SectionDecodeError::HashMismatch { .. })
        ));
    }

    #[test]
    fn key_mismatch() {
        let mut encoder = SectionEncoder::new();
        let data = encoder.encode(SectionKey::new(0, 1, 2, 3), SectionMetadata::default());
        let err = decode_fresh(SectionKey::new(0, 1, 2, 4), &data, CodecOptions::default()).unwrap_err();
        assert!(matches!(err, SectionDecodeError::KeyMismatch { .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn truncated_buffer() {
        let mut encoder = SectionEncoder::new();
        let key = SectionKey::new(0, 0, 0, 0);
        let data = encoder.encode(key, SectionMetadata::default());
        let err = decode_fresh(key, &data[..data.len() - 4], CodecOptions::default()).unwrap_err();
        assert!(matches!(err, SectionDecodeError::OutOfBounds { .. }));
        assert!(!err.is_corruption());
        let err = decode_fresh(key, &data[..10], CodecOptions::default()).unwrap_err();
        assert_eq!(
            err,
            SectionDecodeError::OutOfBounds {
                offset: 8,
                len: 8,
                size: 10
            }
        );
    }

    #[test]
    #[should_panic]
    fn truncated_buffer_unchecked_panics() {
        let mut encoder = SectionEncoder::new();
        let key = SectionKey::new(0, 0, 0, 0);
        let data = encoder.encode(key, SectionMetadata::default());
        let options = CodecOptions {
            verify_memory_access: false,
            ..CodecOptions::default()
        };
        let _ = decode_fresh(key, &data[..100], options);
    }

    #[test]
    fn oversized_palette() {
        let mut data = vec![0u8; HEADER_SIZE];
        data[16..20].copy_from_slice(&(MAX_PALETTE_LEN as u32 + 1).to_le_bytes());
        let err = decode_fresh(SectionKey::default(), &data, CodecOptions::default()).unwrap_err();
        assert_eq!(err, SectionDecodeError::PaletteTooLarge(MAX_PALETTE_LEN as u32 + 1));
    }
}

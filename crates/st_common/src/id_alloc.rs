//! Fixed-capacity dense identifier allocation.

use thiserror::Error;

use crate::prelude::*;

/// Maximum number of identifiers a [`HierarchicalBitSet`] can track, `64^4`.
pub const CAPACITY: usize = 1 << 24;

/// Errors from identifier allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Error)]
pub enum AllocError {
    /// Every slot of the bitset is taken.
    #[error("All identifier slots are taken")]
    Full,
    /// Allocating would exceed the configured limit.
    #[error("Allocation would exceed the identifier limit")]
    LimitReached,
    /// Consecutive allocation is only supported for runs of 1 to 64 slots.
    #[error("Invalid consecutive allocation count {0}, must be in 1..=64")]
    InvalidCount(usize),
    /// The requested limit is larger than [`CAPACITY`].
    #[error("Limit {0} is larger than the capacity of {CAPACITY}")]
    LimitTooLarge(usize),
}

/// A four level tree of bitmaps. A bit in an upper level is set exactly when all 64 bits beneath it are set,
/// so the lowest free slot can be found by following the first zero bit from the root.
pub struct HierarchicalBitSet {
    limit: usize,
    count: usize,
    a: u64,
    b: Box<[u64; 64]>,
    c: Box<[u64; 64 * 64]>,
    d: Box<[u64; 64 * 64 * 64]>,
}

impl Default for HierarchicalBitSet {
    fn default() -> Self {
        Self::with_limit_unchecked(CAPACITY)
    }
}

impl std::fmt::Debug for HierarchicalBitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalBitSet")
            .field("limit", &self.limit)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl HierarchicalBitSet {
    /// Constructs an empty bitset that hands out at most `limit` identifiers.
    pub fn new(limit: usize) -> Result<Self, AllocError> {
        if limit > CAPACITY {
            return Err(AllocError::LimitTooLarge(limit));
        }
        Ok(Self::with_limit_unchecked(limit))
    }

    fn with_limit_unchecked(limit: usize) -> Self {
        Self {
            limit,
            count: 0,
            a: 0,
            b: bytemuck::zeroed_box(),
            c: bytemuck::zeroed_box(),
            d: bytemuck::zeroed_box(),
        }
    }

    /// Number of allocated identifiers.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Maximum number of allocated identifiers.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Checks if the given identifier is allocated.
    pub fn is_set(&self, index: usize) -> bool {
        index < CAPACITY && (self.d[index >> 6] & (1 << (index & 63))) != 0
    }

    /// Allocates the lowest free identifier.
    pub fn allocate_next(&mut self) -> Result<usize, AllocError> {
        if self.a == u64::MAX {
            return Err(AllocError::Full);
        }
        if self.count + 1 > self.limit {
            return Err(AllocError::LimitReached);
        }
        let ia = (!self.a).trailing_zeros() as usize;
        let ib = (ia << 6) | (!self.b[ia]).trailing_zeros() as usize;
        let ic = (ib << 6) | (!self.c[ib]).trailing_zeros() as usize;
        let id = (ic << 6) | (!self.d[ic]).trailing_zeros() as usize;
        self.set_bit(id);
        self.count += 1;
        Ok(id)
    }

    /// Allocates the lowest run of `count` free consecutive identifiers, returning the first one.
    /// Unlike [`Self::allocate_next`] this scans, so it's linear in the number of runs skipped.
    pub fn allocate_consecutive(&mut self, count: usize) -> Result<usize, AllocError> {
        if !(1..=64).contains(&count) {
            return Err(AllocError::InvalidCount(count));
        }
        if self.a == u64::MAX {
            return Err(AllocError::Full);
        }
        if self.count + count > self.limit {
            return Err(AllocError::LimitReached);
        }
        let window = if count == 64 { u64::MAX } else { (1u64 << count) - 1 };
        let mut i = self.find_next_free(0).ok_or(AllocError::Full)?;
        loop {
            if i + count > self.limit {
                return Err(AllocError::LimitReached);
            }
            let (word, offset) = (i >> 6, i & 63);
            let mut fused = self.d[word] >> offset;
            if 64 - offset < count {
                fused |= self.d[word + 1] << (64 - offset);
            }
            let conflict = fused & window;
            if conflict == 0 {
                for j in i..i + count {
                    self.set_bit(j);
                }
                self.count += count;
                return Ok(i);
            }
            i += conflict.trailing_zeros() as usize;
            i = self.find_next_free(i).ok_or(AllocError::Full)?;
        }
    }

    /// Frees an identifier, returning whether it was allocated.
    pub fn free(&mut self, index: usize) -> bool {
        assert!(index < CAPACITY, "Freeing identifier {index} outside of the bitset capacity");
        let di = index >> 6;
        let bit = 1u64 << (index & 63);
        let was_set = self.d[di] & bit != 0;
        self.d[di] &= !bit;
        let ci = di >> 6;
        self.c[ci] &= !(1 << (di & 63));
        let bi = ci >> 6;
        self.b[bi] &= !(1 << (ci & 63));
        self.a &= !(1 << (bi & 63));
        if was_set {
            self.count -= 1;
        }
        was_set
    }

    fn set_bit(&mut self, index: usize) {
        let di = index >> 6;
        debug_assert_eq!(self.d[di] & (1 << (index & 63)), 0, "Identifier {index} set twice");
        self.d[di] |= 1 << (index & 63);
        if self.d[di] != u64::MAX {
            return;
        }
        let ci = di >> 6;
        self.c[ci] |= 1 << (di & 63);
        if self.c[ci] != u64::MAX {
            return;
        }
        let bi = ci >> 6;
        self.b[bi] |= 1 << (ci & 63);
        if self.b[bi] != u64::MAX {
            return;
        }
        self.a |= 1 << (bi & 63);
    }

    /// The lowest free identifier at or after `index`, skipping full subtrees.
    fn find_next_free(&self, mut index: usize) -> Option<usize> {
        'search: while index < CAPACITY {
            let levels: [(usize, &[u64]); 4] = [
                (18, std::slice::from_ref(&self.a)),
                (12, &self.b[..]),
                (6, &self.c[..]),
                (0, &self.d[..]),
            ];
            for (shift, words) in levels {
                let block = index >> shift;
                let word = block >> 6;
                let free = !words[word] & (u64::MAX << (block & 63));
                if free == 0 {
                    index = (word + 1) << (shift + 6);
                    continue 'search;
                }
                let first = (word << 6) | free.trailing_zeros() as usize;
                if first != block {
                    index = first << shift;
                }
            }
            return Some(index);
        }
        None
    }
}

/// A [`HierarchicalBitSet`] shared between threads.
#[derive(Debug, Default)]
pub struct SlotAllocator {
    bits: Mutex<HierarchicalBitSet>,
}

impl SlotAllocator {
    /// Constructs an allocator handing out at most `limit` slots.
    pub fn new(limit: usize) -> Result<Self, AllocError> {
        Ok(Self {
            bits: Mutex::new(HierarchicalBitSet::new(limit)?),
        })
    }

    /// See [`HierarchicalBitSet::allocate_next`].
    pub fn allocate(&self) -> Result<usize, AllocError> {
        self.bits.lock().unwrap().allocate_next()
    }

    /// See [`HierarchicalBitSet::allocate_consecutive`].
    pub fn allocate_consecutive(&self, count: usize) -> Result<usize, AllocError> {
        self.bits.lock().unwrap().allocate_consecutive(count)
    }

    /// See [`HierarchicalBitSet::free`].
    pub fn free(&self, index: usize) -> bool {
        self.bits.lock().unwrap().free(index)
    }

    /// Number of allocated slots.
    pub fn count(&self) -> usize {
        self.bits.lock().unwrap().count()
    }
}

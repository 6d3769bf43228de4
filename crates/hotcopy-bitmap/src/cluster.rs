use serde::{Deserialize, Serialize};

use crate::util::div_ceil_u64;
use crate::{BitmapError, ByteRange, Result};

const WORD_BITS: u64 = u64::BITS as u64;

/// One bit per cluster over `[0, len)` bytes.
///
/// The final cluster may be shorter than `granularity` when `len` is not cluster aligned; byte
/// counts reported by [`ClusterBitmap::dirty_count`] account for that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ClusterBitmapRepr", into = "ClusterBitmapRepr")]
pub struct ClusterBitmap {
    len: u64,
    granularity: u64,
    clusters: u64,
    words: Vec<u64>,
}

#[derive(Clone, Serialize, Deserialize)]
struct ClusterBitmapRepr {
    len: u64,
    granularity: u64,
    words: Vec<u64>,
}

impl From<ClusterBitmap> for ClusterBitmapRepr {
    fn from(value: ClusterBitmap) -> Self {
        Self {
            len: value.len,
            granularity: value.granularity,
            words: value.words,
        }
    }
}

impl TryFrom<ClusterBitmapRepr> for ClusterBitmap {
    type Error = BitmapError;

    fn try_from(repr: ClusterBitmapRepr) -> Result<Self> {
        let mut bitmap = ClusterBitmap::new(repr.len, repr.granularity)?;
        if repr.words.len() != bitmap.words.len() {
            return Err(BitmapError::Corrupt("word count does not match bitmap size"));
        }
        bitmap.words = repr.words;
        let tail_bits = bitmap.clusters % WORD_BITS;
        if tail_bits != 0 {
            if let Some(last) = bitmap.words.last() {
                if last >> tail_bits != 0 {
                    return Err(BitmapError::Corrupt("bits set past the end of the bitmap"));
                }
            }
        }
        Ok(bitmap)
    }
}

impl ClusterBitmap {
    pub fn new(len: u64, granularity: u64) -> Result<Self> {
        if granularity == 0 || !granularity.is_power_of_two() {
            return Err(BitmapError::InvalidGranularity { granularity });
        }
        let clusters = div_ceil_u64(len, granularity)?;
        let words = usize::try_from(div_ceil_u64(clusters, WORD_BITS)?)
            .map_err(|_| BitmapError::OffsetOverflow)?;
        Ok(Self {
            len,
            granularity,
            clusters,
            words: vec![0; words],
        })
    }

    /// Covered address space in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    pub fn cluster_count(&self) -> u64 {
        self.clusters
    }

    pub fn is_clean(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn is_dirty(&self, offset: u64) -> bool {
        offset < self.len && self.bit(offset / self.granularity)
    }

    /// Mark every cluster touched by `[offset, offset + bytes)` dirty. Returns how many were
    /// clean before.
    pub fn set_range(&mut self, offset: u64, bytes: u64) -> u64 {
        let (first, end) = self.touched_clusters(offset, bytes);
        self.fill(first, end, true)
    }

    /// Clear every cluster fully covered by `[offset, offset + bytes)`.
    ///
    /// The final short cluster counts as fully covered when the range reaches `len`. Clusters
    /// only partially covered keep their state. Returns how many were dirty before.
    pub fn reset_range(&mut self, offset: u64, bytes: u64) -> u64 {
        let (first, end) = self.covered_clusters(offset, bytes);
        self.fill(first, end, false)
    }

    pub fn set_all(&mut self) {
        self.fill(0, self.clusters, true);
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Number of dirty clusters.
    pub fn dirty_clusters(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Number of dirty bytes, clamped to `len` for a short final cluster.
    pub fn dirty_count(&self) -> u64 {
        let mut bytes = self.dirty_clusters().saturating_mul(self.granularity);
        if self.clusters > 0 && self.bit(self.clusters - 1) {
            let tail = self
                .clusters
                .saturating_mul(self.granularity)
                .saturating_sub(self.len);
            bytes -= tail;
        }
        bytes
    }

    /// Start offset of the first dirty cluster at or after the cluster containing `offset`.
    pub fn next_dirty(&self, offset: u64) -> Option<u64> {
        if offset >= self.len {
            return None;
        }
        self.next_bit(offset / self.granularity, true)
            .map(|bit| bit * self.granularity)
    }

    /// Start offset of the first clean cluster at or after the cluster containing `offset`.
    pub fn next_clean(&self, offset: u64) -> Option<u64> {
        if offset >= self.len {
            return None;
        }
        self.next_bit(offset / self.granularity, false)
            .map(|bit| bit * self.granularity)
    }

    /// Maximal runs of dirty clusters, ascending.
    pub fn dirty_ranges(&self) -> DirtyRanges<'_> {
        DirtyRanges {
            bitmap: self,
            next_bit: 0,
        }
    }

    /// Start offsets of dirty clusters, ascending.
    pub fn iter_dirty(&self) -> DirtyClusters<'_> {
        DirtyClusters {
            bitmap: self,
            next_bit: 0,
        }
    }

    /// OR the dirty ranges of `other` into `self`.
    ///
    /// Granularities may differ: a dirty range of `other` marks every cluster of `self` it touches.
    pub fn merge_from(&mut self, other: &ClusterBitmap) -> Result<()> {
        if self.len != other.len {
            return Err(BitmapError::SizeMismatch {
                left: self.len,
                right: other.len,
            });
        }
        if self.granularity == other.granularity {
            for (dst, src) in self.words.iter_mut().zip(&other.words) {
                *dst |= *src;
            }
            return Ok(());
        }
        for range in other.dirty_ranges() {
            self.set_range(range.start, range.len());
        }
        Ok(())
    }

    fn touched_clusters(&self, offset: u64, bytes: u64) -> (u64, u64) {
        if bytes == 0 || offset >= self.len {
            return (0, 0);
        }
        let end = offset.saturating_add(bytes).min(self.len);
        (offset / self.granularity, end.div_ceil(self.granularity))
    }

    fn covered_clusters(&self, offset: u64, bytes: u64) -> (u64, u64) {
        if bytes == 0 || offset >= self.len {
            return (0, 0);
        }
        let end = offset.saturating_add(bytes).min(self.len);
        let first = offset.div_ceil(self.granularity);
        let last = if end == self.len {
            self.clusters
        } else {
            end / self.granularity
        };
        (first, last.max(first))
    }

    fn bit(&self, bit: u64) -> bool {
        let word = self.words[(bit / WORD_BITS) as usize];
        (word >> (bit % WORD_BITS)) & 1 == 1
    }

    /// Set bits `[first, end)` to `value`, returning how many changed.
    fn fill(&mut self, first: u64, end: u64, value: bool) -> u64 {
        let end = end.min(self.clusters);
        let mut changed = 0;
        let mut bit = first;
        while bit < end {
            let idx = (bit / WORD_BITS) as usize;
            let shift = bit % WORD_BITS;
            let n = (WORD_BITS - shift).min(end - bit);
            let mask = if n == WORD_BITS {
                u64::MAX
            } else {
                ((1u64 << n) - 1) << shift
            };
            let old = self.words[idx];
            let new = if value { old | mask } else { old & !mask };
            changed += u64::from((old ^ new).count_ones());
            self.words[idx] = new;
            bit += n;
        }
        changed
    }

    fn next_bit(&self, from: u64, dirty: bool) -> Option<u64> {
        let mut bit = from;
        while bit < self.clusters {
            let idx = (bit / WORD_BITS) as usize;
            let word = if dirty {
                self.words[idx]
            } else {
                !self.words[idx]
            };
            let masked = word & (u64::MAX << (bit % WORD_BITS));
            if masked != 0 {
                let found = idx as u64 * WORD_BITS + u64::from(masked.trailing_zeros());
                return (found < self.clusters).then_some(found);
            }
            bit = (idx as u64 + 1) * WORD_BITS;
        }
        None
    }
}

pub struct DirtyRanges<'a> {
    bitmap: &'a ClusterBitmap,
    next_bit: u64,
}

impl Iterator for DirtyRanges<'_> {
    type Item = ByteRange;

    fn next(&mut self) -> Option<ByteRange> {
        let bitmap = self.bitmap;
        let start = bitmap.next_bit(self.next_bit, true)?;
        let end = bitmap
            .next_bit(start, false)
            .unwrap_or(bitmap.clusters);
        self.next_bit = end;
        Some(ByteRange::new(
            start * bitmap.granularity,
            end.saturating_mul(bitmap.granularity).min(bitmap.len),
        ))
    }
}

pub struct DirtyClusters<'a> {
    bitmap: &'a ClusterBitmap,
    next_bit: u64,
}

impl Iterator for DirtyClusters<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let bit = self.bitmap.next_bit(self.next_bit, true)?;
        self.next_bit = bit + 1;
        Some(bit * self.bitmap.granularity)
    }
}

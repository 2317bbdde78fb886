//! Merged memory regions touched by a scope.
//!
//! A [`RegionSet`] folds a stream of `(address, length)` accesses into
//! maximal inclusive address ranges. Stored regions never overlap and never
//! touch: after every [`RegionSet::record_access`], for two neighbours `a`
//! and `b`, `a.end + 1 < b.start` holds.
//!
//! Besides the bounds, each region keeps:
//! - the total number of bytes accessed. Repeated accesses to the same bytes
//!   all count, so a total larger than [`MemoryRegion::size`] means the scope
//!   touched the region more than once.
//! - a histogram of access sizes, which shows whether vector instructions were
//!   used on the region.
//! - how often the region grew into a new cache line upwards or downwards.
//!   Only upward growth means the region was walked with increasing addresses,
//!   only downward growth the opposite, and both a non-uniform walk.

use alloc::{collections::BTreeMap, string::String, vec, vec::Vec};
use core::ops::Bound::{Excluded, Unbounded};

use log::{error, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::ProfilerConfig,
    records::{AccessKind, TraceRecord},
    Addr, Error,
};

/// Count of accesses, indexed by access size in bytes.
///
/// Sizes `1..=max_access_size` get a bucket each, everything else lands in a
/// single overflow bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSizeHistogram {
    /// `counts[0]` is the overflow bucket, `counts[n]` the `n` byte accesses
    counts: Vec<u64>,
}

impl AccessSizeHistogram {
    /// An empty histogram with buckets up to `max_access_size`
    #[must_use]
    pub fn new(max_access_size: usize) -> Self {
        Self {
            counts: vec![0; max_access_size + 1],
        }
    }

    /// Largest size with its own bucket
    #[must_use]
    pub fn max_access_size(&self) -> usize {
        self.counts.len() - 1
    }

    /// Count one access of `len` bytes
    #[inline]
    pub fn record(&mut self, len: usize) {
        let bucket = if (1..self.counts.len()).contains(&len) {
            len
        } else {
            0
        };
        self.counts[bucket] += 1;
    }

    /// Accesses of exactly `size` bytes. Sizes without a bucket report 0, see [`Self::overflow`].
    #[must_use]
    pub fn count(&self, size: usize) -> u64 {
        if size == 0 {
            0
        } else {
            self.counts.get(size).copied().unwrap_or(0)
        }
    }

    /// Accesses whose size had no bucket
    #[must_use]
    pub fn overflow(&self) -> u64 {
        self.counts[0]
    }

    /// Total number of accesses
    #[must_use]
    pub fn accesses(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Add all counts of `other` to `self`
    pub fn merge(&mut self, other: &Self) {
        if other.counts.len() > self.counts.len() {
            self.counts.resize(other.counts.len(), 0);
        }
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
    }

    /// `(size, count)` for every non-empty sized bucket, ascending by size
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, count)| **count > 0)
            .map(|(size, count)| (size, *count))
    }
}

/// A maximal contiguous address range with its access statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// First address
    pub start: Addr,
    /// Last address, inclusive
    pub end: Addr,
    /// Sum of the lengths of all accesses, overlapping ones included
    pub total_bytes_accessed: u64,
    /// Accesses by size
    pub histogram: AccessSizeHistogram,
    /// Times the region grew into a new cache line at a higher address
    pub growth_up_count: u32,
    /// Times the region grew into a new cache line at a lower address
    pub growth_down_count: u32,
}

impl MemoryRegion {
    fn new(start: Addr, end: Addr, max_access_size: usize) -> Self {
        Self {
            start,
            end,
            total_bytes_accessed: 0,
            histogram: AccessSizeHistogram::new(max_access_size),
            growth_up_count: 0,
            growth_down_count: 0,
        }
    }

    /// Number of distinct bytes covered
    #[must_use]
    pub fn size(&self) -> usize {
        (self.end - self.start).saturating_add(1)
    }

    /// `true` if `[start, end]` lies entirely within this region
    #[must_use]
    pub fn contains(&self, start: Addr, end: Addr) -> bool {
        start >= self.start && end <= self.end
    }

    #[inline]
    fn record(&mut self, len: usize) {
        self.total_bytes_accessed = self.total_bytes_accessed.saturating_add(len as u64);
        self.histogram.record(len);
    }

    /// Fold a following region into this one
    fn absorb(&mut self, other: &MemoryRegion) {
        self.end = self.end.max(other.end);
        self.total_bytes_accessed = self
            .total_bytes_accessed
            .saturating_add(other.total_bytes_accessed);
        self.histogram.merge(&other.histogram);
        self.growth_up_count += other.growth_up_count;
        self.growth_down_count += other.growth_down_count;
    }
}

/// Did moving the end of a region from `old_end` to `new_end` enter a new cache line?
#[inline]
fn crosses_line_up(cache_line_size: usize, old_end: Addr, new_end: Addr) -> bool {
    new_end / cache_line_size > old_end / cache_line_size
}

/// Did moving the start of a region from `old_start` to `new_start` enter a new cache line?
#[inline]
fn crosses_line_down(cache_line_size: usize, old_start: Addr, new_start: Addr) -> bool {
    new_start / cache_line_size < old_start / cache_line_size
}

/// The regions read or written by one scope, keyed by start address.
#[derive(Debug, Clone)]
pub struct RegionSet {
    regions: BTreeMap<Addr, MemoryRegion>,
    cache_line_size: usize,
    max_access_size: usize,
}

impl Default for RegionSet {
    fn default() -> Self {
        Self::new(ProfilerConfig::default())
    }
}

impl RegionSet {
    /// An empty set using the cache line size and histogram range of `config`
    #[must_use]
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            regions: BTreeMap::new(),
            cache_line_size: config.cache_line_size.max(1),
            max_access_size: config.max_access_size,
        }
    }

    /// Number of stored regions
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// `true` if nothing was recorded since the last [`Self::clear`]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The region starting at `start`, if any
    #[must_use]
    pub fn get(&self, start: Addr) -> Option<&MemoryRegion> {
        self.regions.get(&start)
    }

    /// The region containing `address`, if any
    #[must_use]
    pub fn find(&self, address: Addr) -> Option<&MemoryRegion> {
        self.regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.end >= address)
    }

    /// All regions, ascending by start address
    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.values()
    }

    /// Forget all regions
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// The first stored region after `key`
    fn next_key(&self, key: Addr) -> Option<Addr> {
        self.regions
            .range((Excluded(key), Unbounded))
            .next()
            .map(|(start, _)| *start)
    }

    /// The last region starting before `address`, else the first one at or after it
    fn key_at_or_before(&self, address: Addr) -> Option<Addr> {
        self.regions
            .range(..address)
            .next_back()
            .or_else(|| self.regions.range(address..).next())
            .map(|(start, _)| *start)
    }

    /// Record an access of `len` bytes starting at `start`.
    ///
    /// Zero length accesses are ignored. An access running past the top of the
    /// address space is clamped to it.
    pub fn record_access(&mut self, start: Addr, len: usize) {
        if len == 0 {
            warn!("ignoring zero length access at {start:#x}");
            return;
        }
        let end = start.saturating_add(len - 1);
        let line = self.cache_line_size;
        // Anything starting past this can neither overlap nor touch the access
        let limit = end.saturating_add(1);

        let mut processed = false;
        let mut modified = None;

        let mut cursor = self.key_at_or_before(start);
        while let Some(key) = cursor.filter(|key| *key <= limit) {
            let Some(region) = self.regions.get_mut(&key) else {
                break;
            };

            if start < key && end >= key {
                // Overlaps the beginning, the region moves down to `start`
                if crosses_line_down(line, key, start) {
                    region.growth_down_count += 1;
                }
                region.end = region.end.max(end);
                region.record(len);
                if let Some(mut moved) = self.regions.remove(&key) {
                    moved.start = start;
                    modified = Some((start, moved.end));
                    self.regions.insert(start, moved);
                }
                processed = true;
                break;
            } else if region.contains(start, end) {
                region.record(len);
                processed = true;
                break;
            } else if start <= region.end && end > region.end {
                // Overlaps the end
                if crosses_line_up(line, region.end, end) {
                    region.growth_up_count += 1;
                }
                region.end = end;
                region.record(len);
                modified = Some((key, end));
                processed = true;
                break;
            }

            // Touching only, the merge pass below joins the two
            if region.end.checked_add(1) == Some(start) && crosses_line_up(line, region.end, end) {
                region.growth_up_count += 1;
            }
            if end.checked_add(1) == Some(key) && crosses_line_down(line, key, start) {
                region.growth_down_count += 1;
            }

            cursor = self.next_key(key);
        }

        if !processed {
            let mut region = MemoryRegion::new(start, end, self.max_access_size);
            region.record(len);
            self.regions.insert(start, region);
            modified = Some((start, end));
        }

        trace!("access - start: {start:#x}, len: {len:#x}, regions: {}", self.regions.len());

        if let Some((from, to)) = modified {
            self.coalesce(from, to);
        }
    }

    /// Merge pass over the regions around a modified range `[from, to]`.
    ///
    /// Starts at the region before `from` and absorbs each following region
    /// starting at or below `current.end + 1`. Absorbed entries are removed
    /// before the cursor moves on.
    fn coalesce(&mut self, from: Addr, to: Addr) {
        let mut cursor = self.key_at_or_before(from);
        while let Some(current) = cursor {
            loop {
                let Some(limit) = self
                    .regions
                    .get(&current)
                    .and_then(|region| region.end.checked_add(1))
                else {
                    break;
                };
                let Some(next) = self.next_key(current).filter(|next| *next <= limit) else {
                    break;
                };
                let Some(absorbed) = self.regions.remove(&next) else {
                    break;
                };
                trace!("merging region {next:#x} into {current:#x}");
                if let Some(region) = self.regions.get_mut(&current) {
                    region.absorb(&absorbed);
                }
            }
            cursor = self.next_key(current).filter(|next| *next <= to);
        }
    }

    /// Check that no two stored regions overlap or touch.
    pub fn check_invariant(&self) -> Result<(), Error> {
        let mut previous: Option<&MemoryRegion> = None;
        for region in self.regions.values() {
            if region.start > region.end {
                return Err(Error::illegal_state(format!(
                    "region {:#x} ends before it starts at {:#x}",
                    region.start, region.end
                )));
            }
            if let Some(prev) = previous {
                if !is_separated(prev.end, region.start) {
                    return Err(Error::illegal_state(format!(
                        "region ending at {:#x} touches region starting at {:#x}",
                        prev.end, region.start
                    )));
                }
            }
            previous = Some(region);
        }
        Ok(())
    }

    /// One [`TraceRecord::Region`] per region, ascending by start address.
    ///
    /// Each pair of consecutive regions that overlaps or touches is reported
    /// with a [`TraceRecord::MergeFault`] after the second region. Such a pair
    /// is left as is.
    #[must_use]
    pub fn export(&self, scope: &str, access: AccessKind) -> Vec<TraceRecord> {
        let mut records = Vec::with_capacity(self.regions.len());
        let mut previous_end: Option<Addr> = None;
        for region in self.regions.values() {
            records.push(TraceRecord::Region {
                scope: String::from(scope),
                access,
                region: region.clone(),
            });
            if let Some(previous_end) = previous_end {
                if !is_separated(previous_end, region.start) {
                    error!(
                        "{scope},{}: merge of adjacent regions failed, {previous_end:#x} and {:#x}",
                        access.label(),
                        region.start
                    );
                    records.push(TraceRecord::MergeFault {
                        scope: String::from(scope),
                        access,
                        previous_end,
                        start: region.start,
                    });
                }
            }
            previous_end = Some(region.end);
        }
        records
    }

    #[cfg(test)]
    fn insert_unchecked(&mut self, region: MemoryRegion) {
        self.regions.insert(region.start, region);
    }
}

/// `true` if a region ending at `end` and one starting at `start` neither overlap nor touch
#[inline]
fn is_separated(end: Addr, start: Addr) -> bool {
    end.checked_add(1).is_some_and(|next| next < start)
}

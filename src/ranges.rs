//! RVA range primitives used throughout the attribution engine.
//!
//! Every construct in a PE image - sections, COFF groups, compiland contributions, symbols -
//! occupies one or more intervals of the image's relative-virtual-address space. This module
//! provides the two building blocks for reasoning about those intervals:
//!
//! - [`RvaRange`] - an immutable, inclusive-end interval with a "virtual size only" flag for
//!   regions (like `.bss`) that occupy memory but no disk space
//! - [`RvaRangeSet`] - a set of disjoint, non-adjacent ranges with coalescing support, used
//!   whenever multiple discovery passes must be unioned into one logical region set
//!
//! # Overlap Rules
//!
//! Two ranges from different owners may be disjoint, or one may fully contain the other (a
//! label in the middle of a procedure is the classic case) - but they must never partially
//! overlap. Partial overlap always indicates an attribution defect and the set type rejects it.
//!
//! # Examples
//!
//! ```rust
//! use sizescope::RvaRange;
//!
//! let range = RvaRange::from_rva_and_size(0x1000, 0x200, false);
//! assert!(range.contains(0x11FF));
//! assert!(!range.contains(0x1200));
//! assert_eq!(range.virtual_size(), 0x200);
//! ```

use std::fmt;

/// An immutable interval of relative virtual addresses.
///
/// Both `rva_start` and `rva_end` are *included* in the range: `[0, 50]` starts at 0, ends at
/// 50 and has a virtual size of 51. Ranges flagged as virtual-size-only exist in memory but
/// not on disk (such as the ranges composing the `.bss` COFF group), so their on-disk `size`
/// reports 0 while their `virtual_size` reports the full span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RvaRange {
    rva_start: u32,
    rva_end: u32,
    is_virtual_size: bool,
}

impl RvaRange {
    /// Creates a range whose start and end RVAs are both included.
    ///
    /// # Arguments
    /// * `rva_start` - RVA where the range starts
    /// * `rva_end` - RVA where the range ends, inclusive
    /// * `is_virtual_size` - true if this exists only in memory, not on-disk (such as `.bss`)
    #[must_use]
    pub fn new(rva_start: u32, rva_end: u32, is_virtual_size: bool) -> RvaRange {
        RvaRange {
            rva_start,
            rva_end,
            is_virtual_size,
        }
    }

    /// Creates a range from a start RVA and a byte count.
    ///
    /// A zero-sized range degenerates to `[rva, rva]`, mirroring how zero-sized entries
    /// are recorded elsewhere in the engine.
    #[must_use]
    pub fn from_rva_and_size(rva_start: u32, size: u32, is_virtual_size: bool) -> RvaRange {
        RvaRange {
            rva_start,
            rva_end: rva_start + if size == 0 { 0 } else { size - 1 },
            is_virtual_size,
        }
    }

    /// The first RVA included in the range.
    #[must_use]
    pub fn rva_start(&self) -> u32 {
        self.rva_start
    }

    /// The last RVA included in the range.
    #[must_use]
    pub fn rva_end(&self) -> u32 {
        self.rva_end
    }

    /// True if this range takes up space only in memory, not on disk.
    #[must_use]
    pub fn is_virtual_size(&self) -> bool {
        self.is_virtual_size
    }

    /// The number of bytes this range occupies on disk - 0 for virtual-only ranges.
    #[must_use]
    pub fn size(&self) -> u32 {
        if self.is_virtual_size {
            0
        } else {
            self.virtual_size()
        }
    }

    /// The number of bytes this range occupies in memory once the image is loaded.
    #[must_use]
    pub fn virtual_size(&self) -> u32 {
        self.rva_end - self.rva_start + 1
    }

    /// Whether `rva` falls inside the range (both bounds inclusive).
    #[inline]
    #[must_use]
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.rva_start && rva <= self.rva_end
    }

    /// Whether the `size` bytes starting at `rva` all fall inside the range.
    #[inline]
    #[must_use]
    pub fn contains_rva_and_size(&self, rva: u32, size: u32) -> bool {
        rva >= self.rva_start && rva + size.saturating_sub(1) <= self.rva_end
    }

    /// Whether `other` is fully contained in this range.
    #[inline]
    #[must_use]
    pub fn contains_range(&self, other: &RvaRange) -> bool {
        other.rva_start >= self.rva_start && other.rva_end <= self.rva_end
    }

    /// Whether this range and `other` touch within `max_padding` bytes without overlapping.
    ///
    /// Exactly-abutting ranges are adjacent, but ranges separated by a few padding bytes
    /// should merge the same way - `(0, 10)` and `(11, 20)` coalesce to `(0, 20)`. Two
    /// ranges with the same start are never adjacent by definition.
    #[must_use]
    pub(crate) fn is_adjacent_to(&self, other: &RvaRange, max_padding: u32) -> bool {
        if self.rva_start < other.rva_start {
            other.rva_start - self.rva_end <= max_padding
        } else if other.rva_start < self.rva_start {
            self.rva_start - other.rva_end <= max_padding
        } else {
            false
        }
    }

    /// Whether this range and `other` can merge into one: same virtual-size-ness, and
    /// either adjacent-within-padding or overlapping.
    #[must_use]
    pub(crate) fn can_be_combined_with(&self, other: &RvaRange, max_padding: u32) -> bool {
        if self.is_virtual_size != other.is_virtual_size {
            return false;
        }

        if self.is_adjacent_to(other, max_padding) {
            return true;
        }

        // They're not adjacent, but they may still overlap
        self.contains(other.rva_start)
            || self.contains(other.rva_end)
            || other.contains(self.rva_start)
            || other.contains(self.rva_end)
    }

    /// Merges this range with `other` into the minimal covering range.
    ///
    /// Callers must have verified [`RvaRange::can_be_combined_with`] first; merging a
    /// virtual-only range with a real one doesn't make sense and is a caller bug.
    #[must_use]
    pub(crate) fn combine_with(&self, other: &RvaRange) -> RvaRange {
        debug_assert_eq!(self.is_virtual_size, other.is_virtual_size);

        RvaRange {
            rva_start: self.rva_start.min(other.rva_start),
            rva_end: self.rva_end.max(other.rva_end),
            is_virtual_size: self.is_virtual_size,
        }
    }

    /// Returns a copy of this range whose end is extended to at least `new_rva_end`.
    #[must_use]
    pub(crate) fn expand_end_to(&self, new_rva_end: u32) -> RvaRange {
        RvaRange {
            rva_start: self.rva_start,
            rva_end: self.rva_end.max(new_rva_end),
            is_virtual_size: self.is_virtual_size,
        }
    }
}

impl fmt::Display for RvaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X} - 0x{:X}", self.rva_start, self.rva_end)
    }
}

/// A set of disjoint, non-adjacent [`RvaRange`]s.
///
/// The set enforces its own invariant: callers must coalesce overlapping or adjacent ranges
/// *before* insertion (via [`RvaRangeSet::coalesce_ranges`] or
/// [`RvaRangeSet::from_ranges`]), so that membership and overlap queries never have to
/// reason about redundant entries.
///
/// # Examples
///
/// ```rust
/// use sizescope::{RvaRange, RvaRangeSet};
///
/// let set = RvaRangeSet::from_ranges(
///     vec![
///         RvaRange::from_rva_and_size(0x1000, 0x10, false),
///         RvaRange::from_rva_and_size(0x1010, 0x10, false),
///         RvaRange::from_rva_and_size(0x4000, 0x100, false),
///     ],
///     1,
/// );
///
/// // The two abutting ranges coalesced into one
/// assert_eq!(set.len(), 2);
/// assert!(set.contains(0x101F));
/// assert!(!set.contains(0x1020));
/// ```
#[derive(Debug, Default, Clone)]
pub struct RvaRangeSet {
    ranges: Vec<RvaRange>,
}

impl RvaRangeSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> RvaRangeSet {
        RvaRangeSet { ranges: Vec::new() }
    }

    /// Number of disjoint ranges in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// True if the set holds no ranges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Adds a range to the set.
    ///
    /// The range must not be adjacent to or overlapping any member - coalesce at the
    /// caller instead. As an example, with `(100, 200)` in the set, don't add `(201, 300)`;
    /// insert `(100, 300)` to begin with.
    ///
    /// # Panics
    ///
    /// Panics in debug builds when the invariant is violated; the set silently tolerates it
    /// in release builds but queries may then double-report.
    pub fn add(&mut self, range: RvaRange) {
        debug_assert!(
            !self.ranges.iter().any(|r| r.is_adjacent_to(&range, 1)
                || r.contains_range(&range)
                || range.contains_range(r)),
            "adjacent or overlapping range added to RvaRangeSet, coalesce at the caller"
        );

        self.ranges.push(range);
    }

    /// Whether any member range contains `rva`.
    #[must_use]
    pub fn contains(&self, rva: u32) -> bool {
        self.ranges.iter().any(|r| r.contains(rva))
    }

    /// Whether any single member range contains all `size` bytes starting at `rva`.
    #[must_use]
    pub fn fully_contains_rva_and_size(&self, rva: u32, size: u32) -> bool {
        self.ranges
            .iter()
            .any(|r| r.contains_rva_and_size(rva, size))
    }

    /// Whether any single member range fully contains `range`.
    #[must_use]
    pub fn fully_contains(&self, range: &RvaRange) -> bool {
        self.ranges.iter().any(|r| r.contains_range(range))
    }

    /// Whether `incoming` overlaps the set at all.
    ///
    /// With `(0, 100)` and `(200, 300)` in the set, all three of these overlap: `(50, 150)`
    /// via the contained start, `(150, 250)` via the contained end, and `(150, 350)` because
    /// it swallows `(200, 300)` whole even though neither of its endpoints is a member.
    #[must_use]
    pub fn at_least_partially_overlaps(&self, incoming: &RvaRange) -> bool {
        self.ranges.iter().any(|r| {
            r.contains(incoming.rva_start())
                || r.contains(incoming.rva_end())
                || incoming.contains_range(r)
        })
    }

    /// Merges all ranges of `other` into this set.
    ///
    /// The same non-adjacency invariant applies across the union.
    pub fn union_with(&mut self, other: &RvaRangeSet) {
        for range in &other.ranges {
            self.add(*range);
        }
    }

    /// Iterates the member ranges in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &RvaRange> {
        self.ranges.iter()
    }

    /// Coalesces a list of ranges into the minimal set of maximal disjoint ranges.
    ///
    /// Ranges are sorted by start, then each is merged into its predecessor when they
    /// overlap or sit within `max_padding_to_merge` bytes of each other. Total covered RVA
    /// space is preserved (plus any swallowed padding).
    #[must_use]
    pub fn coalesce_ranges(mut ranges: Vec<RvaRange>, max_padding_to_merge: u32) -> Vec<RvaRange> {
        ranges.sort_by_key(RvaRange::rva_start);

        let mut coalesced: Vec<RvaRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match coalesced.last_mut() {
                Some(last) if last.can_be_combined_with(&range, max_padding_to_merge) => {
                    *last = last.combine_with(&range);
                }
                _ => coalesced.push(range),
            }
        }

        coalesced
    }

    /// Builds a set by coalescing `ranges` with the given merge padding.
    #[must_use]
    pub fn from_ranges(ranges: Vec<RvaRange>, max_padding_to_merge: u32) -> RvaRangeSet {
        let mut set = RvaRangeSet::new();
        for range in RvaRangeSet::coalesce_ranges(ranges, max_padding_to_merge) {
            set.add(range);
        }

        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rva_and_size_is_inclusive() {
        let range = RvaRange::from_rva_and_size(100, 50, false);
        assert_eq!(range.rva_start(), 100);
        assert_eq!(range.rva_end(), 149);
        assert_eq!(range.size(), 50);
        assert_eq!(range.virtual_size(), 50);

        let zero = RvaRange::from_rva_and_size(100, 0, false);
        assert_eq!(zero.rva_end(), 100);
    }

    #[test]
    fn virtual_only_ranges_report_zero_disk_size() {
        let bss = RvaRange::from_rva_and_size(0x9000, 0x1000, true);
        assert_eq!(bss.size(), 0);
        assert_eq!(bss.virtual_size(), 0x1000);
    }

    #[test]
    fn containment() {
        let range = RvaRange::new(100, 200, false);
        assert!(range.contains(100));
        assert!(range.contains(200));
        assert!(!range.contains(99));
        assert!(!range.contains(201));
        assert!(range.contains_rva_and_size(150, 51));
        assert!(!range.contains_rva_and_size(150, 52));
        assert!(range.contains_range(&RvaRange::new(150, 180, false)));
        assert!(!range.contains_range(&RvaRange::new(150, 201, false)));
    }

    #[test]
    fn adjacency_respects_padding() {
        let a = RvaRange::new(0, 10, false);
        let b = RvaRange::new(11, 20, false);
        let c = RvaRange::new(15, 20, false);
        assert!(a.is_adjacent_to(&b, 1));
        assert!(b.is_adjacent_to(&a, 1));
        assert!(!a.is_adjacent_to(&c, 1));

        let gapped = RvaRange::new(19, 30, false);
        assert!(a.is_adjacent_to(&gapped, 9));
        assert!(!a.is_adjacent_to(&gapped, 8));

        // same start can never be adjacent
        assert!(!a.is_adjacent_to(&RvaRange::new(0, 5, false), 1));
    }

    #[test]
    fn combining_never_mixes_virtual_and_real() {
        let real = RvaRange::new(0, 10, false);
        let virt = RvaRange::new(11, 20, true);
        assert!(!real.can_be_combined_with(&virt, 1));
    }

    #[test]
    fn coalesce_merges_adjacent_and_overlapping() {
        let ranges = vec![
            RvaRange::new(200, 300, false),
            RvaRange::new(0, 100, false),
            RvaRange::new(90, 150, false),
            RvaRange::new(151, 199, false),
        ];

        let coalesced = RvaRangeSet::coalesce_ranges(ranges, 1);
        assert_eq!(coalesced, vec![RvaRange::new(0, 300, false)]);
    }

    #[test]
    fn coalesce_preserves_disjoint_ranges() {
        let ranges = vec![
            RvaRange::new(0, 100, false),
            RvaRange::new(200, 300, false),
        ];

        let coalesced = RvaRangeSet::coalesce_ranges(ranges.clone(), 8);
        assert_eq!(coalesced, ranges);
    }

    #[test]
    fn coalesce_with_padding_merges_across_small_gaps() {
        let ranges = vec![
            RvaRange::new(0, 100, false),
            RvaRange::new(108, 200, false),
        ];

        let coalesced = RvaRangeSet::coalesce_ranges(ranges, 8);
        assert_eq!(coalesced, vec![RvaRange::new(0, 200, false)]);
    }

    #[test]
    fn set_overlap_queries() {
        let set = RvaRangeSet::from_ranges(
            vec![
                RvaRange::new(0, 100, false),
                RvaRange::new(200, 300, false),
            ],
            0,
        );

        assert!(set.at_least_partially_overlaps(&RvaRange::new(50, 150, false)));
        assert!(set.at_least_partially_overlaps(&RvaRange::new(150, 250, false)));
        assert!(set.at_least_partially_overlaps(&RvaRange::new(150, 350, false)));
        assert!(!set.at_least_partially_overlaps(&RvaRange::new(101, 199, false)));

        assert!(set.fully_contains(&RvaRange::new(10, 90, false)));
        assert!(!set.fully_contains(&RvaRange::new(90, 210, false)));
    }
}

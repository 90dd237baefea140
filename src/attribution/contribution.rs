//! The per-owner, per-geometry-unit byte ledger.

use crate::{ranges::RvaRange, ranges::RvaRangeSet, Error, Result};

/// The set of RVA ranges one owner (library, compiland, source file) contributes to one
/// geometry unit (section or COFF group).
///
/// A contribution is a little state machine: **open** while the owner enumeration is
/// discovering ranges, then **sealed** exactly once, after which sizes and range queries
/// become available and any further mutation fails. Sealing coalesces abutting ranges,
/// which both shrinks the range list and lets symbols that straddle two raw ranges be
/// found in the merged one.
#[derive(Debug, Clone)]
pub struct Contribution {
    name: String,
    // Ranges accumulate here before sealing. Almost all code should only operate on
    // sealed contributions; the pdata-attribution path is the one legitimate pre-seal
    // reader, via ranges_regardless_of_seal.
    pending: Vec<RvaRange>,
    ranges: Vec<RvaRange>,
    sealed: bool,
}

impl Contribution {
    /// Creates an open, empty contribution.
    ///
    /// # Arguments
    /// * `name` - Display name, e.g. `"foo.obj contributions to .text$mn"`
    #[must_use]
    pub fn new(name: &str) -> Contribution {
        Contribution {
            name: name.to_string(),
            pending: Vec::new(),
            ranges: Vec::new(),
            sealed: false,
        }
    }

    /// The contribution's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once [`Contribution::seal`] has run.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Adds one range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sealed`] after sealing - a sealed contribution is immutable.
    pub fn add_rva_range(&mut self, range: RvaRange) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }

        self.pending.push(range);
        Ok(())
    }

    /// Adds many ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sealed`] after sealing.
    pub fn add_rva_ranges(&mut self, ranges: impl IntoIterator<Item = RvaRange>) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }

        self.pending.extend(ranges);
        Ok(())
    }

    /// Seals the contribution: coalesces accumulated ranges and freezes them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sealed`] when sealed twice - each contribution must be sealed
    /// exactly once, by the owner-construction path.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }

        if !self.pending.is_empty() {
            self.ranges = RvaRangeSet::coalesce_ranges(std::mem::take(&mut self.pending), 1);
        }

        self.sealed = true;
        Ok(())
    }

    /// The sealed, coalesced ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing.
    pub fn rva_ranges(&self) -> Result<&[RvaRange]> {
        if !self.sealed {
            return Err(Error::NotSealed);
        }

        Ok(&self.ranges)
    }

    /// Whatever ranges exist right now, sealed or not.
    ///
    /// The pdata-attribution pass needs range access while owners are still being
    /// constructed; nothing else should call this.
    #[must_use]
    pub(crate) fn ranges_regardless_of_seal(&self) -> &[RvaRange] {
        if self.sealed {
            &self.ranges
        } else {
            &self.pending
        }
    }

    /// Sum of the sealed ranges' on-disk sizes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing.
    pub fn size(&self) -> Result<u32> {
        Ok(self.rva_ranges()?.iter().map(RvaRange::size).sum())
    }

    /// Sum of the sealed ranges' in-memory sizes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing.
    pub fn virtual_size(&self) -> Result<u32> {
        Ok(self.rva_ranges()?.iter().map(RvaRange::virtual_size).sum())
    }

    /// Whether any current range contains all `size` bytes at `rva`.
    #[must_use]
    pub fn contains(&self, rva: u32, size: u32) -> bool {
        self.ranges_regardless_of_seal()
            .iter()
            .any(|r| r.contains_rva_and_size(rva, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_sum_of_range_sizes() {
        let mut contribution = Contribution::new("test");
        contribution
            .add_rva_range(RvaRange::from_rva_and_size(0x1000, 0x100, false))
            .unwrap();
        contribution
            .add_rva_range(RvaRange::from_rva_and_size(0x3000, 0x50, false))
            .unwrap();
        contribution.seal().unwrap();

        assert_eq!(contribution.size().unwrap(), 0x150);
        assert_eq!(contribution.virtual_size().unwrap(), 0x150);
        assert_eq!(contribution.rva_ranges().unwrap().len(), 2);
    }

    #[test]
    fn sealing_coalesces_abutting_ranges() {
        let mut contribution = Contribution::new("test");
        contribution
            .add_rva_range(RvaRange::from_rva_and_size(0x1000, 0x100, false))
            .unwrap();
        contribution
            .add_rva_range(RvaRange::from_rva_and_size(0x1100, 0x100, false))
            .unwrap();
        contribution.seal().unwrap();

        assert_eq!(contribution.rva_ranges().unwrap().len(), 1);
        assert_eq!(contribution.size().unwrap(), 0x200);
    }

    #[test]
    fn queries_fail_before_seal() {
        let contribution = Contribution::new("test");
        assert!(matches!(contribution.size(), Err(Error::NotSealed)));
        assert!(matches!(contribution.rva_ranges(), Err(Error::NotSealed)));
    }

    #[test]
    fn mutation_fails_after_seal() {
        let mut contribution = Contribution::new("test");
        contribution.seal().unwrap();

        assert!(matches!(
            contribution.add_rva_range(RvaRange::from_rva_and_size(0, 4, false)),
            Err(Error::Sealed)
        ));
        assert!(matches!(contribution.seal(), Err(Error::Sealed)));
    }

    #[test]
    fn virtual_only_ranges_count_toward_virtual_size_only() {
        let mut contribution = Contribution::new("bss");
        contribution
            .add_rva_range(RvaRange::from_rva_and_size(0x9000, 0x800, true))
            .unwrap();
        contribution.seal().unwrap();

        assert_eq!(contribution.size().unwrap(), 0);
        assert_eq!(contribution.virtual_size().unwrap(), 0x800);
    }
}

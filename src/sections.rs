//! The binary geometry model: sections and the COFF groups that tile them.
//!
//! A PE image's section table defines the coarse layout (`.text`, `.rdata`, `.rsrc`);
//! the linker subdivides each section into COFF groups (`.text$mn`, `.rdata$r`,
//! `.rsrc$01`) whose boundaries only survive in the debug database. Attribution runs
//! against both levels, so this module models them as a two-level hierarchy where each
//! group back-references its owning section by index - never by ownership, to keep the
//! graph acyclic.
//!
//! # Lifecycle
//!
//! Both types follow a construct-then-seal lifecycle. During construction the geometry
//! builder adds COFF groups to their sections; sealing resolves each group's parked raw
//! size into on-disk vs in-memory size (which cannot be determined before the owning
//! section is known), computes inter-group padding, and freezes everything. Reading
//! sealed-only state earlier, or mutating after sealing, is an [`crate::Error`].
//!
//! # Size vs Virtual Size
//!
//! Sections and groups track two sizes: bytes on disk (`size`) and bytes in memory
//! (`virtual_size`). Uninitialized-data groups (`.bss`) occupy memory only; the slack the
//! linker leaves between a section's virtual size and its alignment boundary is tracked
//! as *tail slop* so that every byte of address space stays accounted for.

use bitflags::bitflags;

use crate::{ranges::RvaRange, utils::math::tail_slop, Error, Result};

bitflags! {
    /// Section characteristics from the PE section table (`IMAGE_SCN_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionCharacteristics: u32 {
        /// The section contains executable code
        const CNT_CODE = 0x0000_0020;
        /// The section contains initialized data
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// The section contains uninitialized data (occupies no disk space)
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// The section can be discarded as needed
        const MEM_DISCARDABLE = 0x0200_0000;
        /// The section can be executed
        const MEM_EXECUTE = 0x2000_0000;
        /// The section can be read
        const MEM_READ = 0x4000_0000;
        /// The section can be written to
        const MEM_WRITE = 0x8000_0000;
    }
}

/// One section from the PE section table, owning an ordered set of COFF groups.
///
/// Sealed sections guarantee that their COFF groups (plus computed tail slop) tile the
/// section's bytes exactly; a gap larger than the image's file alignment fails sealing
/// loudly because it means the model lost track of bytes.
#[derive(Debug, Clone)]
pub struct BinarySection {
    name: String,
    rva: u32,
    size: u32,
    virtual_size: u32,
    characteristics: SectionCharacteristics,
    file_alignment: u32,
    tail_slop_virtual_size_alignment: u32,
    coff_group_indices: Vec<usize>,
    sealed: bool,
}

impl BinarySection {
    /// Creates a section from its PE section-table entry.
    ///
    /// # Arguments
    /// * `name` - Section name (`.text`, `.rdata`, ...)
    /// * `size` - Size of raw data on disk
    /// * `virtual_size` - Size in memory
    /// * `rva` - RVA where the section starts
    /// * `file_alignment` / `section_alignment` - The image's alignment parameters
    /// * `characteristics` - The section's `IMAGE_SCN_*` flags
    ///
    /// # Errors
    ///
    /// Every observed linker emits section sizes that are multiples of the file
    /// alignment; a section that is not indicates either a malformed image or a
    /// misparse, and construction fails rather than guessing.
    pub fn new(
        name: &str,
        size: u32,
        virtual_size: u32,
        rva: u32,
        file_alignment: u32,
        section_alignment: u32,
        characteristics: SectionCharacteristics,
    ) -> Result<BinarySection> {
        if file_alignment != 0 && size % file_alignment != 0 {
            return Err(malformed_error!(
                "BinarySection '{}' has a Size of 0x{:X}, which is not a multiple of its FileAlignment (0x{:X})",
                name,
                size,
                file_alignment
            ));
        }

        let tail_slop_virtual_size_alignment = tail_slop(virtual_size, section_alignment);

        Ok(BinarySection {
            name: name.to_string(),
            rva,
            size,
            virtual_size,
            characteristics,
            file_alignment,
            tail_slop_virtual_size_alignment,
            coff_group_indices: Vec::new(),
            sealed: false,
        })
    }

    /// The section's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// RVA where the section starts.
    #[must_use]
    pub fn rva(&self) -> u32 {
        self.rva
    }

    /// Bytes the section occupies on disk.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes the section occupies in memory.
    #[must_use]
    pub fn virtual_size(&self) -> u32 {
        self.virtual_size
    }

    /// Bytes in memory including the alignment slack up to the next section.
    #[must_use]
    pub fn virtual_size_including_padding(&self) -> u32 {
        self.virtual_size + self.tail_slop_virtual_size_alignment
    }

    /// The section's `IMAGE_SCN_*` flags.
    #[must_use]
    pub fn characteristics(&self) -> SectionCharacteristics {
        self.characteristics
    }

    /// The padding between the section's virtual size and its alignment boundary.
    #[must_use]
    pub fn tail_slop_virtual_size_alignment(&self) -> u32 {
        self.tail_slop_virtual_size_alignment
    }

    /// The section's extent as an [`RvaRange`] (virtual-size based).
    #[must_use]
    pub fn rva_range(&self) -> RvaRange {
        RvaRange::from_rva_and_size(self.rva, self.virtual_size, false)
    }

    /// Whether `rva` falls inside the section's in-memory extent.
    #[must_use]
    pub fn contains(&self, rva: u32) -> bool {
        self.rva_range().contains(rva)
    }

    /// Indices (into the session's COFF group table) of this section's groups.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing - the group list is still growing.
    pub fn coff_group_indices(&self) -> Result<&[usize]> {
        if !self.sealed {
            return Err(Error::NotSealed);
        }

        Ok(&self.coff_group_indices)
    }

    /// Registers a COFF group (by index) as belonging to this section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sealed`] after sealing.
    pub fn add_coff_group(&mut self, coff_group_index: usize) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }

        self.coff_group_indices.push(coff_group_index);
        Ok(())
    }

    /// Seals the section: orders its groups, computes every group's tail slop, and
    /// validates that the groups tile the section.
    ///
    /// The alignment requirements of a COFF group are recorded nowhere - not in the
    /// image, not in the debug database - so the padding between groups has to be
    /// inferred from their spacing. A gap larger than the file alignment has never been
    /// observed from a real linker and fails the seal.
    ///
    /// # Arguments
    /// * `all_groups` - The session's COFF group table; this section's groups are
    ///   resolved and mutated through their indices
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sealed`] when sealed twice, [`Error::NotSealed`] if a member
    /// group has not itself been sealed, or [`Error::AttributionGap`] for oversized
    /// inter-group gaps.
    pub fn seal(&mut self, all_groups: &mut [CoffGroup]) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }

        self.coff_group_indices
            .sort_by_key(|&idx| all_groups[idx].rva);

        let mut biggest_rva_seen_by_size = self.rva;
        for window_start in 1..self.coff_group_indices.len() {
            let previous_idx = self.coff_group_indices[window_start - 1];
            let current_idx = self.coff_group_indices[window_start];

            let previous_end_virtual =
                all_groups[previous_idx].rva + all_groups[previous_idx].virtual_size()?;
            let previous_end_size = all_groups[previous_idx].rva + all_groups[previous_idx].size()?;
            let gap_virtual_size = all_groups[current_idx].rva - previous_end_virtual;
            let gap_size = all_groups[current_idx].rva - previous_end_size;

            if gap_virtual_size > self.file_alignment {
                return Err(Error::AttributionGap {
                    unit: format!(
                        "binary section '{}' between COFF groups '{}' and '{}'",
                        self.name, all_groups[previous_idx].name, all_groups[current_idx].name
                    ),
                    expected: u64::from(self.virtual_size),
                    attributed: u64::from(self.virtual_size.saturating_sub(gap_virtual_size)),
                    gap: u64::from(gap_virtual_size),
                    tolerance: self.file_alignment,
                });
            }

            all_groups[previous_idx].tail_slop_virtual_size_alignment = gap_virtual_size;
            all_groups[previous_idx].tail_slop_size_alignment = gap_size;

            let total_size_attributed = all_groups[previous_idx].size()? + gap_size;
            if total_size_attributed > 0
                && all_groups[previous_idx].rva + total_size_attributed > biggest_rva_seen_by_size
            {
                biggest_rva_seen_by_size = all_groups[previous_idx].rva + total_size_attributed;
            }
        }

        if let Some(&last_idx) = self.coff_group_indices.last() {
            let last = &all_groups[last_idx];
            let last_tail_virtual = (self.rva + self.virtual_size + self.tail_slop_virtual_size_alignment)
                - (last.rva + last.virtual_size()?);
            let last_tail_size =
                (self.rva + self.size).saturating_sub(biggest_rva_seen_by_size + last.size()?);

            all_groups[last_idx].tail_slop_virtual_size_alignment = last_tail_virtual;
            all_groups[last_idx].tail_slop_size_alignment = last_tail_size;
        }

        self.sealed = true;
        Ok(())
    }
}

/// A linker-level subdivision of a section, e.g. `.text$mn` or `.rsrc$01`.
///
/// The raw size recorded in the debug database cannot distinguish on-disk bytes from
/// memory-only bytes - that depends on the characteristics and the image's alignment
/// parameters - so the size is parked until [`CoffGroup::seal`] resolves it.
#[derive(Debug, Clone)]
pub struct CoffGroup {
    name: String,
    /// RVA where the group starts
    pub rva: u32,
    characteristics: SectionCharacteristics,
    raw_size: u32,
    section_alignment: u32,
    size: u32,
    virtual_size: u32,
    tail_slop_size_alignment: u32,
    tail_slop_virtual_size_alignment: u32,
    section_index: Option<usize>,
    sealed: bool,
}

impl CoffGroup {
    /// Creates a group from its debug-database record.
    #[must_use]
    pub fn new(
        name: &str,
        raw_size: u32,
        rva: u32,
        section_alignment: u32,
        characteristics: SectionCharacteristics,
    ) -> CoffGroup {
        CoffGroup {
            name: name.to_string(),
            rva,
            characteristics,
            raw_size,
            section_alignment,
            size: 0,
            virtual_size: 0,
            tail_slop_size_alignment: 0,
            tail_slop_virtual_size_alignment: 0,
            section_index: None,
            sealed: false,
        }
    }

    /// The group's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group's `IMAGE_SCN_*` flags.
    #[must_use]
    pub fn characteristics(&self) -> SectionCharacteristics {
        self.characteristics
    }

    /// Index (into the session's section table) of the owning section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before the back-reference has been assigned
    /// and the group sealed.
    pub fn section_index(&self) -> Result<usize> {
        if !self.sealed {
            return Err(Error::NotSealed);
        }

        self.section_index.ok_or(Error::NotSealed)
    }

    /// Assigns the owning section's index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sealed`] after sealing.
    pub fn set_section_index(&mut self, index: usize) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }

        self.section_index = Some(index);
        Ok(())
    }

    /// Bytes the group occupies on disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing resolves the parked raw size.
    pub fn size(&self) -> Result<u32> {
        if !self.sealed {
            return Err(Error::NotSealed);
        }

        Ok(self.size)
    }

    /// Bytes the group occupies in memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing.
    pub fn virtual_size(&self) -> Result<u32> {
        if !self.sealed {
            return Err(Error::NotSealed);
        }

        Ok(self.virtual_size)
    }

    /// True when the group occupies memory but no disk space (`.bss` style).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing.
    pub fn is_virtual_size_only(&self) -> Result<bool> {
        Ok(self.size()? == 0 && self.virtual_size()? > 0)
    }

    /// Padding between this group's on-disk end and the next group (or section end).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before the owning section has been sealed.
    pub fn tail_slop_size_alignment(&self) -> Result<u32> {
        if !self.sealed {
            return Err(Error::NotSealed);
        }

        Ok(self.tail_slop_size_alignment)
    }

    /// Padding between this group's in-memory end and the next group (or section end).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before the owning section has been sealed.
    pub fn tail_slop_virtual_size_alignment(&self) -> Result<u32> {
        if !self.sealed {
            return Err(Error::NotSealed);
        }

        Ok(self.tail_slop_virtual_size_alignment)
    }

    /// The group's extent as an [`RvaRange`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing.
    pub fn rva_range(&self) -> Result<RvaRange> {
        Ok(RvaRange::from_rva_and_size(
            self.rva,
            self.virtual_size()?,
            self.is_virtual_size_only()?,
        ))
    }

    /// Seals the group, resolving its raw size into on-disk and in-memory sizes.
    ///
    /// If the section alignment is below 4K the linker lays uninitialized data out
    /// on disk anyway (it must be mappable), so only with >= 4K alignment can the
    /// characteristics be used to classify the bytes as virtual-only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sealed`] when sealed twice.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }

        if self.section_alignment >= 0x1000
            && self
                .characteristics
                .contains(SectionCharacteristics::CNT_UNINITIALIZED_DATA)
            && !self
                .characteristics
                .contains(SectionCharacteristics::CNT_INITIALIZED_DATA)
        {
            self.virtual_size = self.raw_size;
            self.size = 0;
        } else {
            self.virtual_size = self.raw_size;
            self.size = self.raw_size;
        }

        self.sealed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_flags() -> SectionCharacteristics {
        SectionCharacteristics::CNT_CODE
            | SectionCharacteristics::MEM_EXECUTE
            | SectionCharacteristics::MEM_READ
    }

    #[test]
    fn section_size_must_be_file_aligned() {
        assert!(BinarySection::new(".text", 0x400, 0x3F0, 0x1000, 0x200, 0x1000, code_flags()).is_ok());
        assert!(BinarySection::new(".text", 0x401, 0x3F0, 0x1000, 0x200, 0x1000, code_flags()).is_err());
    }

    #[test]
    fn section_tail_slop_from_section_alignment() {
        let section =
            BinarySection::new(".text", 0xE00, 0xE00, 0x1000, 0x200, 0x1000, code_flags()).unwrap();
        assert_eq!(section.tail_slop_virtual_size_alignment(), 0x200);
        assert_eq!(section.virtual_size_including_padding(), 0x1000);
    }

    #[test]
    fn bss_group_is_virtual_only_with_4k_alignment() {
        let mut group = CoffGroup::new(
            ".bss",
            0x800,
            0x5000,
            0x1000,
            SectionCharacteristics::CNT_UNINITIALIZED_DATA | SectionCharacteristics::MEM_READ,
        );
        group.seal().unwrap();

        assert_eq!(group.size().unwrap(), 0);
        assert_eq!(group.virtual_size().unwrap(), 0x800);
        assert!(group.is_virtual_size_only().unwrap());
    }

    #[test]
    fn bss_group_occupies_disk_with_small_alignment() {
        let mut group = CoffGroup::new(
            ".bss",
            0x800,
            0x5000,
            0x200,
            SectionCharacteristics::CNT_UNINITIALIZED_DATA,
        );
        group.seal().unwrap();

        assert_eq!(group.size().unwrap(), 0x800);
        assert!(!group.is_virtual_size_only().unwrap());
    }

    #[test]
    fn sealing_twice_fails() {
        let mut group = CoffGroup::new(".text$mn", 0x100, 0x1000, 0x1000, code_flags());
        group.seal().unwrap();
        assert!(matches!(group.seal(), Err(Error::Sealed)));
    }

    #[test]
    fn group_queries_fail_before_seal() {
        let group = CoffGroup::new(".text$mn", 0x100, 0x1000, 0x1000, code_flags());
        assert!(matches!(group.size(), Err(Error::NotSealed)));
        assert!(matches!(group.virtual_size(), Err(Error::NotSealed)));
    }

    #[test]
    fn section_seal_computes_group_tail_slops() {
        let mut section =
            BinarySection::new(".text", 0x1000, 0xF00, 0x1000, 0x200, 0x1000, code_flags())
                .unwrap();

        let mut groups = vec![
            CoffGroup::new(".text$mn", 0xD00, 0x1000, 0x1000, code_flags()),
            CoffGroup::new(".text$x", 0x180, 0x1D80, 0x1000, code_flags()),
        ];
        for group in &mut groups {
            group.seal().unwrap();
        }

        section.add_coff_group(0).unwrap();
        section.add_coff_group(1).unwrap();
        section.seal(&mut groups).unwrap();

        // 0x1000 + 0xD00 = 0x1D00, next group at 0x1D80 -> 0x80 of slop
        assert_eq!(groups[0].tail_slop_virtual_size_alignment().unwrap(), 0x80);
        // Last group runs to the section's aligned end: 0x1000 + 0xF00 + 0x100 - (0x1D80 + 0x180) = 0x100
        assert_eq!(groups[1].tail_slop_virtual_size_alignment().unwrap(), 0x100);

        // Group sizes + slops tile the section's padded virtual size exactly
        let total: u32 = groups
            .iter()
            .map(|g| g.virtual_size().unwrap() + g.tail_slop_virtual_size_alignment().unwrap())
            .sum();
        assert_eq!(total, section.virtual_size_including_padding());
    }

    #[test]
    fn section_seal_rejects_oversized_gaps() {
        let mut section =
            BinarySection::new(".text", 0x1000, 0x1000, 0x1000, 0x200, 0x1000, code_flags())
                .unwrap();

        let mut groups = vec![
            CoffGroup::new(".text$mn", 0x100, 0x1000, 0x1000, code_flags()),
            // Starts 0x700 past the previous group's end, way over the 0x200 file alignment
            CoffGroup::new(".text$x", 0x100, 0x1800, 0x1000, code_flags()),
        ];
        for group in &mut groups {
            group.seal().unwrap();
        }

        section.add_coff_group(0).unwrap();
        section.add_coff_group(1).unwrap();
        assert!(matches!(
            section.seal(&mut groups),
            Err(Error::AttributionGap { .. })
        ));
    }
}

//! The attribution owners: libraries, compilands and source files.
//!
//! Owners form a containment hierarchy - a library owns the compilands linked from it,
//! and compilands relate many-to-many with source files through line contributions. Each
//! owner tracks a [`Contribution`] per binary section and per COFF group it touches,
//! built incrementally while the debug database is enumerated and then sealed exactly
//! once. Cross-references (compiland to library) are indices into the session's tables,
//! never owning edges.

use std::collections::BTreeMap;

use super::contribution::Contribution;
use crate::{provider::CompilandLanguage, ranges::RvaRange, ranges::RvaRangeSet, Error, Result};

/// The per-section and per-COFF-group contribution maps every owner carries.
///
/// Keys are unit names (`".text"`, `".text$mn"`); BTreeMap keeps enumeration order
/// deterministic across runs.
#[derive(Debug, Clone, Default)]
pub struct ContributionMaps {
    section_contributions: BTreeMap<String, Contribution>,
    coff_group_contributions: BTreeMap<String, Contribution>,
    sealed: bool,
}

impl ContributionMaps {
    /// Adds one contributed range under both its section and (when known) COFF group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sealed`] after sealing.
    pub fn add_range(
        &mut self,
        owner_name: &str,
        section_name: &str,
        coff_group_name: Option<&str>,
        range: RvaRange,
    ) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }

        self.section_contributions
            .entry(section_name.to_string())
            .or_insert_with(|| {
                Contribution::new(&format!("{owner_name} contributions to {section_name}"))
            })
            .add_rva_range(range)?;

        if let Some(coff_group_name) = coff_group_name {
            self.coff_group_contributions
                .entry(coff_group_name.to_string())
                .or_insert_with(|| {
                    Contribution::new(&format!("{owner_name} contributions to {coff_group_name}"))
                })
                .add_rva_range(range)?;
        }

        Ok(())
    }

    /// Seals every contribution in both maps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sealed`] when sealed twice.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }

        for contribution in self.section_contributions.values_mut() {
            contribution.seal()?;
        }
        for contribution in self.coff_group_contributions.values_mut() {
            contribution.seal()?;
        }

        self.sealed = true;
        Ok(())
    }

    /// The sealed per-section contributions, keyed by section name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing.
    pub fn section_contributions(&self) -> Result<&BTreeMap<String, Contribution>> {
        if !self.sealed {
            return Err(Error::NotSealed);
        }

        Ok(&self.section_contributions)
    }

    /// The sealed per-COFF-group contributions, keyed by group name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing.
    pub fn coff_group_contributions(&self) -> Result<&BTreeMap<String, Contribution>> {
        if !self.sealed {
            return Err(Error::NotSealed);
        }

        Ok(&self.coff_group_contributions)
    }

    /// Every contributed range across all sections, coalesced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing.
    pub fn all_rva_ranges(&self) -> Result<Vec<RvaRange>> {
        let mut ranges = Vec::new();
        for contribution in self.section_contributions()?.values() {
            ranges.extend_from_slice(contribution.rva_ranges()?);
        }

        Ok(RvaRangeSet::coalesce_ranges(ranges, 1))
    }

    /// Sum of all sealed section contributions' on-disk sizes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSealed`] before sealing.
    pub fn size(&self) -> Result<u32> {
        let mut total = 0_u32;
        for contribution in self.section_contributions()?.values() {
            total += contribution.size()?;
        }

        Ok(total)
    }

    /// Whether any contributed range (sealed or not) covers the `size` bytes at `rva`.
    #[must_use]
    pub fn contains(&self, rva: u32, size: u32) -> bool {
        self.section_contributions
            .values()
            .any(|c| c.contains(rva, size))
    }

    /// Direct access to one section contribution regardless of seal state, for the
    /// pdata-attribution pass.
    pub(crate) fn section_contribution_mut(
        &mut self,
        owner_name: &str,
        section_name: &str,
    ) -> &mut Contribution {
        self.section_contributions
            .entry(section_name.to_string())
            .or_insert_with(|| {
                Contribution::new(&format!("{owner_name} contributions to {section_name}"))
            })
    }

    /// Direct access to one COFF-group contribution regardless of seal state, for the
    /// pdata-attribution pass.
    pub(crate) fn coff_group_contribution_mut(
        &mut self,
        owner_name: &str,
        coff_group_name: &str,
    ) -> &mut Contribution {
        self.coff_group_contributions
            .entry(coff_group_name.to_string())
            .or_insert_with(|| {
                Contribution::new(&format!("{owner_name} contributions to {coff_group_name}"))
            })
    }
}

/// A static library (or the linker's synthetic grouping for loose objects).
#[derive(Debug, Clone)]
pub struct Library {
    name: String,
    /// Indices into the session's compiland table
    pub compiland_indices: Vec<usize>,
    /// The library's accumulated contributions across all its compilands
    pub contributions: ContributionMaps,
}

impl Library {
    /// Creates an empty library.
    #[must_use]
    pub fn new(name: &str) -> Library {
        Library {
            name: name.to_string(),
            compiland_indices: Vec::new(),
            contributions: ContributionMaps::default(),
        }
    }

    /// The library's name as recorded at link time.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The filename portion of the library's name, for display.
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.name
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(&self.name)
    }
}

/// One object file's contribution to the image, as recorded in the debug database.
#[derive(Debug, Clone)]
pub struct Compiland {
    name: String,
    /// Index into the session's library table of the owning library
    pub library_index: usize,
    /// The compiland's recorded source language
    pub language: CompilandLanguage,
    /// The compiland's contributions
    pub contributions: ContributionMaps,
    /// Ranges contributed to executable sections, kept separately so pdata
    /// attribution can resolve target RVAs without walking every contribution
    pub code_ranges: Vec<RvaRange>,
}

impl Compiland {
    /// Creates an empty compiland affiliated with the library at `library_index`.
    #[must_use]
    pub fn new(name: &str, library_index: usize, language: CompilandLanguage) -> Compiland {
        Compiland {
            name: name.to_string(),
            library_index,
            language,
            contributions: ContributionMaps::default(),
            code_ranges: Vec::new(),
        }
    }

    /// The compiland's name, usually the object path recorded at link time.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The filename portion of the compiland's name, for display.
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.name
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(&self.name)
    }

    /// True when the compiland contributed any executable bytes.
    #[must_use]
    pub fn contains_executable_code(&self) -> bool {
        !self.code_ranges.is_empty()
    }

    /// True when the compiland contributed executable bytes containing `rva`.
    #[must_use]
    pub fn contains_executable_code_at(&self, rva: u32) -> bool {
        self.code_ranges.iter().any(|r| r.contains(rva))
    }

    /// Whether any contribution covers the `size` bytes at `rva`.
    #[must_use]
    pub fn contains(&self, rva: u32, size: u32) -> bool {
        self.contributions.contains(rva, size)
    }
}

/// One source file, with the byte ranges its lines were compiled into.
///
/// Absent for linker-synthesized bytes: import tables, resources and exception metadata
/// carry no source provenance.
#[derive(Debug, Clone)]
pub struct SourceFile {
    name: String,
    /// The file's accumulated line contributions
    pub contributions: ContributionMaps,
}

impl SourceFile {
    /// Creates an empty source file record.
    #[must_use]
    pub fn new(name: &str) -> SourceFile {
        SourceFile {
            name: name.to_string(),
            contributions: ContributionMaps::default(),
        }
    }

    /// The file's path as recorded in the debug database.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether any line contribution covers the `size` bytes at `rva`.
    #[must_use]
    pub fn contains(&self, rva: u32, size: u32) -> bool {
        self.contributions.contains(rva, size)
    }
}

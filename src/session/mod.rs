//! The analysis session: open a binary + debug database pair, query byte attribution.
//!
//! [`Session`] is the main entry point of this library. Opening validates the input pair
//! (native image, matching signatures, full-fidelity database), builds the geometry
//! model, parses the PE-only symbol families in parallel, resolves COMDAT fold groups,
//! constructs and seals every owner contribution - and then never mutates again. All
//! query methods take `&self` and may run concurrently from multiple threads; long
//! enumerations accept a [`CancellationToken`] checked per symbol.
//!
//! # Construction order
//!
//! The open path is deliberately sequenced:
//!
//! 1. **Validation** - managed images, mismatched signatures and minimal databases are
//!    rejected before any expensive work.
//! 2. **Geometry** - sections from the PE table, COFF groups from the database, sealed
//!    bottom-up so group sizes resolve against their owning section.
//! 3. **PE symbol families** - exception metadata, resources, and imports/directories
//!    parse independently and in parallel (the exception parser resolves names through
//!    the provider, which must therefore be `Sync`).
//! 4. **Fold groups** - one pass over the provider's full symbol stream.
//! 5. **Owners** - libraries, compilands and source files built from section
//!    contributions, with exception-directory bytes re-attributed by target function
//!    (the linker's own pdata contributions are historically unreliable), then sealed.
//!
//! # Examples
//!
//! ```rust,no_run
//! use sizescope::{Session, SessionOptions, CancellationToken};
//! use std::path::Path;
//! # fn provider() -> Box<dyn sizescope::DebugSymbolProvider> { unimplemented!() }
//!
//! let token = CancellationToken::new();
//! let session = Session::open_file(
//!     Path::new("app.dll"),
//!     provider(),
//!     SessionOptions::default(),
//!     &token,
//! )?;
//!
//! for section in session.binary_sections() {
//!     let symbols = session.enumerate_symbols_in_binary_section(section.name(), &token)?;
//!     println!("{}: {} symbols", section.name(), symbols.len());
//! }
//! # Ok::<(), sizescope::Error>(())
//! ```

pub(crate) mod cache;
mod tasks;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use rayon::prelude::*;

use crate::{
    attribution::{Compiland, Library, SourceFile},
    file::{File, MachineType},
    pe,
    provider::{DebugSymbolProvider, SymbolRecord, SymbolRecordKind},
    ranges::{RvaRange, RvaRangeSet},
    sections::{BinarySection, CoffGroup, SectionCharacteristics},
    symbols::{NameCanonicalization, Symbol, SymbolRc},
    utils::synchronization::CancellationToken,
    Error, Result,
};
use cache::SessionDataCache;

pub use tasks::SymbolPlacement;

/// Tunable parameters for a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Maximum leading/trailing slack, in bytes, tolerated when checking that an
    /// enumerated geometry unit is fully attributed. Alignment requirements are not
    /// recorded anywhere in the image or database, so this is an empirical bound,
    /// not a format guarantee; 16 covers every toolchain observed so far.
    pub max_padding_tolerance: u32,
}

impl Default for SessionOptions {
    fn default() -> SessionOptions {
        SessionOptions {
            max_padding_tolerance: 16,
        }
    }
}

/// An opened binary + debug database pair, ready for attribution queries.
///
/// Sessions are immutable after opening and safe to share across threads. Dropping the
/// session releases the mapped image and every table built from it.
pub struct Session {
    file: File,
    provider: Box<dyn DebugSymbolProvider>,
    options: SessionOptions,
    machine: MachineType,
    pub(crate) cache: SessionDataCache,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("machine", &self.machine)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens a binary from disk together with its debug-symbol provider.
    ///
    /// # Arguments
    /// * `path` - The PE image on disk
    /// * `provider` - The debug-database collaborator for this image
    /// * `options` - Session tunables
    /// * `token` - Cancels the open; checked throughout the enumerations
    ///
    /// # Errors
    ///
    /// All the open-time rejections: unreadable/malformed/empty files,
    /// [`Error::ManagedBinary`], [`Error::UnsupportedMachine`],
    /// [`Error::DebugInfoMismatch`], [`Error::MinimalDebugInfo`], plus
    /// [`Error::Cancelled`] and any parse failure in the PE symbol families.
    pub fn open_file(
        path: &Path,
        provider: impl DebugSymbolProvider + 'static,
        options: SessionOptions,
        token: &CancellationToken,
    ) -> Result<Session> {
        Session::open(File::from_file(path)?, Box::new(provider), options, token)
    }

    /// Opens a binary already loaded into memory together with its provider.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Session::open_file`].
    pub fn open_mem(
        data: Vec<u8>,
        provider: impl DebugSymbolProvider + 'static,
        options: SessionOptions,
        token: &CancellationToken,
    ) -> Result<Session> {
        Session::open(File::from_mem(data)?, Box::new(provider), options, token)
    }

    fn open(
        file: File,
        provider: Box<dyn DebugSymbolProvider>,
        options: SessionOptions,
        token: &CancellationToken,
    ) -> Result<Session> {
        let machine = file.machine()?;

        if provider.is_minimal() {
            return Err(Error::MinimalDebugInfo);
        }

        validate_signatures(&file, provider.as_ref())?;

        let (mut sections, mut coff_groups) =
            build_geometry(&file, provider.as_ref(), machine, token)?;

        // The xdata COFF group (when the database exposes one) seeds the xdata range
        // set; the exception parser verifies every record lands inside the final set.
        let xdata_group_range = coff_groups
            .iter()
            .find(|cg| cg.name() == ".xdata")
            .and_then(|cg| cg.rva_range().ok());

        // The three PE symbol families are independent; parse them concurrently.
        let (eh_result, (rsrc_result, other_result)) = rayon::join(
            || pe::parse_eh_symbols(&file, provider.as_ref(), machine, xdata_group_range, token),
            || {
                rayon::join(
                    || pe::parse_rsrc(&file),
                    || pe::parse_other_pe_symbols(&file),
                )
            },
        );
        let eh_result = eh_result?;
        let rsrc_result = rsrc_result?;
        let other_result = other_result?;

        let all_symbol_records = provider.all_symbols(token)?;
        let canonical_names_by_rva = build_canonical_names(&all_symbol_records);

        let (libraries, compilands) = build_libraries_and_compilands(
            provider.as_ref(),
            &sections,
            &coff_groups,
            &eh_result,
            token,
        )?;
        let source_files = build_source_files(provider.as_ref(), &sections, &coff_groups, token)?;

        // Seal the geometry last so that its group list is final
        for section in &mut sections {
            section.seal(&mut coff_groups)?;
        }

        let cache = SessionDataCache {
            sections,
            coff_groups,
            libraries,
            compilands,
            source_files,
            pdata_rva_range: eh_result.pdata_rva_range,
            pdata_symbols_by_rva: wrap_eh_symbols(eh_result.pdata_symbols_by_rva),
            xdata_rva_ranges: eh_result.xdata_rva_ranges,
            xdata_symbols_by_rva: wrap_eh_symbols(eh_result.xdata_symbols_by_rva),
            rsrc_rva_range: rsrc_result.rsrc_range,
            rsrc_symbols_by_rva: rsrc_result
                .symbols_by_rva
                .into_iter()
                .map(|(rva, s)| (rva, Arc::new(Symbol::Rsrc(s))))
                .collect(),
            other_pe_symbols_by_rva: other_result
                .symbols_by_rva
                .into_iter()
                .map(|(rva, s)| (rva, Arc::new(Symbol::Pe(s))))
                .collect(),
            other_pe_symbols_rva_ranges: other_result.ranges,
            pe_directory_symbols: other_result
                .directory_symbols
                .into_iter()
                .map(|s| Arc::new(Symbol::Pe(s)))
                .collect(),
            canonical_names_by_rva,
            materialized_native_symbols: SkipMap::new(),
        };

        Ok(Session {
            file,
            provider,
            options,
            machine,
            cache,
        })
    }

    /// The machine type of the opened image.
    #[must_use]
    pub fn machine(&self) -> MachineType {
        self.machine
    }

    /// The opened image.
    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// The session's tunables.
    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// All binary sections, ordered by RVA.
    #[must_use]
    pub fn binary_sections(&self) -> &[BinarySection] {
        &self.cache.sections
    }

    /// All COFF groups, ordered by RVA.
    ///
    /// On a 32-bit image this never contains an `.xdata` group: 32-bit unwinding is
    /// not table-driven and the open path rejects a database claiming otherwise.
    #[must_use]
    pub fn coff_groups(&self) -> &[CoffGroup] {
        &self.cache.coff_groups
    }

    /// All libraries.
    #[must_use]
    pub fn libraries(&self) -> &[Library] {
        &self.cache.libraries
    }

    /// All compilands.
    #[must_use]
    pub fn compilands(&self) -> &[Compiland] {
        &self.cache.compilands
    }

    /// All source files.
    #[must_use]
    pub fn source_files(&self) -> &[SourceFile] {
        &self.cache.source_files
    }

    /// The whole-directory span symbols (exports, debug, delay-load, load config).
    #[must_use]
    pub fn pe_directory_symbols(&self) -> &[SymbolRc] {
        &self.cache.pe_directory_symbols
    }

    pub(crate) fn provider(&self) -> &dyn DebugSymbolProvider {
        self.provider.as_ref()
    }

    /// Materializes a provider symbol record into a [`Symbol`], resolving fold state.
    ///
    /// Results are cached by the provider's symbol id so concurrent queries share work.
    pub(crate) fn native_symbol_from_record(&self, record: &SymbolRecord) -> SymbolRc {
        if let Some(entry) = self
            .cache
            .materialized_native_symbols
            .get(&record.symbol_id)
        {
            return Arc::clone(entry.value());
        }

        let (is_folded, canonical_name) = match self.cache.canonical_names_by_rva.get(&record.rva)
        {
            Some(group)
                if group
                    .names_by_symbol_id()
                    .iter()
                    .any(|(_, name)| name == &record.name) =>
            {
                (
                    record.name != group.canonical_name(),
                    group.canonical_name().to_string(),
                )
            }
            _ => (false, record.name.clone()),
        };

        let symbol: SymbolRc = Arc::new(Symbol::Native(crate::symbols::NativeSymbol {
            rva: record.rva,
            size: if is_folded { 0 } else { record.size },
            virtual_size: if is_folded { 0 } else { record.virtual_size },
            name: record.name.clone(),
            kind: match record.kind {
                SymbolRecordKind::Function => crate::symbols::NativeSymbolKind::Function,
                SymbolRecordKind::SeparatedCodeBlock => {
                    crate::symbols::NativeSymbolKind::SeparatedCodeBlock
                }
                SymbolRecordKind::Thunk => crate::symbols::NativeSymbolKind::Thunk,
                SymbolRecordKind::Data => crate::symbols::NativeSymbolKind::Data,
                SymbolRecordKind::StringLiteral => crate::symbols::NativeSymbolKind::StringLiteral,
                SymbolRecordKind::Label => crate::symbols::NativeSymbolKind::Label,
                SymbolRecordKind::PublicSymbol => crate::symbols::NativeSymbolKind::PublicSymbol,
                SymbolRecordKind::Other => crate::symbols::NativeSymbolKind::Other,
            },
            is_comdat_folded: is_folded,
            canonical_name,
        }));

        self.cache
            .materialized_native_symbols
            .insert(record.symbol_id, Arc::clone(&symbol));

        symbol
    }
}

/// Compares the image's RSDS signature against the database's.
fn validate_signatures(file: &File, provider: &dyn DebugSymbolProvider) -> Result<()> {
    let Some(binary_signature) = file.debug_signature()? else {
        // No signature in the image; nothing to verify against
        return Ok(());
    };

    let Some((provider_guid, provider_age)) = provider.debug_signature() else {
        return Ok(());
    };

    if binary_signature.guid != provider_guid || binary_signature.age != provider_age {
        return Err(Error::DebugInfoMismatch {
            message: format!(
                "binary reports {{{}}} age {}, debug database reports {{{}}} age {} - \
                 the database does not describe this binary (were the arguments swapped?)",
                binary_signature.guid, binary_signature.age, provider_guid, provider_age
            ),
        });
    }

    Ok(())
}

/// Builds sections from the PE table and COFF groups from the database, assigning each
/// group to its section and sealing the groups (sections seal later, after owners).
fn build_geometry(
    file: &File,
    provider: &dyn DebugSymbolProvider,
    machine: MachineType,
    token: &CancellationToken,
) -> Result<(Vec<BinarySection>, Vec<CoffGroup>)> {
    let file_alignment = file.file_alignment();
    let section_alignment = file.section_alignment();

    let mut sections: Vec<BinarySection> = Vec::new();
    for header in file.sections() {
        let name_end = header.name.iter().position(|&b| b == 0).unwrap_or(8);
        let name = String::from_utf8_lossy(&header.name[..name_end]).into_owned();

        sections.push(BinarySection::new(
            &name,
            header.size_of_raw_data,
            header.virtual_size,
            header.virtual_address,
            file_alignment,
            section_alignment,
            SectionCharacteristics::from_bits_retain(header.characteristics),
        )?);
    }
    sections.sort_by_key(BinarySection::rva);

    let mut coff_groups: Vec<CoffGroup> = Vec::new();
    for record in provider.coff_groups(token)? {
        token.check()?;

        // x86 exception handling is not table-driven; a database handing back an
        // .xdata group for a 32-bit image is describing some other binary.
        if machine == MachineType::I386 && record.name == ".xdata" {
            return Err(malformed_error!(
                "32-bit image's debug database reports an .xdata COFF group, which cannot exist"
            ));
        }

        coff_groups.push(CoffGroup::new(
            &record.name,
            record.raw_size,
            record.rva,
            section_alignment,
            SectionCharacteristics::from_bits_retain(record.characteristics),
        ));
    }
    coff_groups.sort_by_key(|cg| cg.rva);

    for group_index in 0..coff_groups.len() {
        let rva = coff_groups[group_index].rva;
        let Some(section_index) = sections.iter().position(|s| s.contains(rva)) else {
            return Err(malformed_error!(
                "COFF group '{}' at RVA 0x{:X} is not contained by any binary section",
                coff_groups[group_index].name(),
                rva
            ));
        };

        coff_groups[group_index].set_section_index(section_index)?;
        coff_groups[group_index].seal()?;
        sections[section_index].add_coff_group(group_index)?;
    }

    Ok((sections, coff_groups))
}

/// Accumulates every name seen at each RVA, in parallel, then keeps the RVAs where
/// genuine folding occurred (two or more distinct names).
fn build_canonical_names(records: &[SymbolRecord]) -> BTreeMap<u32, NameCanonicalization> {
    let by_rva: DashMap<u32, Vec<&SymbolRecord>> = DashMap::new();
    records.par_iter().for_each(|record| {
        // Labels are positions, not byte owners; they never participate in folding
        if record.kind != SymbolRecordKind::Label {
            by_rva.entry(record.rva).or_default().push(record);
        }
    });

    by_rva
        .into_iter()
        .par_bridge()
        .filter_map(|(rva, mut group_records)| {
            // Feed non-public names first so public-name demotion is order-independent
            group_records.sort_by_key(|r| (r.kind == SymbolRecordKind::PublicSymbol, r.symbol_id));

            let mut group = NameCanonicalization::new();
            for record in &group_records {
                group.add_name(
                    record.symbol_id,
                    &record.name,
                    record.kind == SymbolRecordKind::PublicSymbol,
                );
            }

            if group.names_by_symbol_id().len() < 2 {
                return None;
            }

            group.canonicalize();
            Some((rva, group))
        })
        .collect()
}

/// Wraps EH symbols into the shared symbol type.
fn wrap_eh_symbols(
    symbols: BTreeMap<u32, crate::symbols::eh::EhSymbol>,
) -> BTreeMap<u32, SymbolRc> {
    symbols
        .into_iter()
        .map(|(rva, s)| (rva, Arc::new(Symbol::Eh(s))))
        .collect()
}

/// Builds libraries and compilands from the database's section contributions, then
/// re-attributes exception-directory bytes by target function.
fn build_libraries_and_compilands(
    provider: &dyn DebugSymbolProvider,
    sections: &[BinarySection],
    coff_groups: &[CoffGroup],
    eh_result: &pe::EhParseResult,
    token: &CancellationToken,
) -> Result<(Vec<Library>, Vec<Compiland>)> {
    let mut libraries: Vec<Library> = Vec::new();
    let mut library_indices: BTreeMap<String, usize> = BTreeMap::new();
    let mut compilands: Vec<Compiland> = Vec::new();

    let pdata_range = eh_result.pdata_rva_range;

    for record in provider.compilands(token)? {
        token.check()?;

        let library_index = *library_indices
            .entry(record.lib_name.clone())
            .or_insert_with(|| {
                libraries.push(Library::new(&record.lib_name));
                libraries.len() - 1
            });

        let compiland_index = compilands.len();
        let mut compiland = Compiland::new(&record.name, library_index, record.language);
        libraries[library_index]
            .compiland_indices
            .push(compiland_index);

        for contribution in &record.contributions {
            // Pre-VS2017 linkers emitted pdata section contributions that could
            // overlap or double-attribute; the exception directory is re-attributed
            // below from the parsed entries instead.
            if pdata_range
                .is_some_and(|r| r.contains_rva_and_size(contribution.rva, contribution.size))
            {
                continue;
            }

            let Some(group_index) = coff_groups.iter().position(|cg| {
                let Ok(range) = cg.rva_range() else { return false };
                range.contains(contribution.rva)
            }) else {
                continue;
            };

            let group = &coff_groups[group_index];
            let section = &sections[group.section_index()?];
            let range = RvaRange::from_rva_and_size(
                contribution.rva,
                contribution.size,
                group.is_virtual_size_only()?,
            );

            let compiland_name = compiland.name().to_string();
            compiland.contributions.add_range(
                &compiland_name,
                section.name(),
                Some(group.name()),
                range,
            )?;

            let library_name = libraries[library_index].name().to_string();
            libraries[library_index].contributions.add_range(
                &library_name,
                section.name(),
                Some(group.name()),
                range,
            )?;

            if section
                .characteristics()
                .contains(SectionCharacteristics::MEM_EXECUTE)
            {
                compiland.code_ranges.push(range);
            }
        }

        compiland.code_ranges = RvaRangeSet::coalesce_ranges(std::mem::take(&mut compiland.code_ranges), 1);
        compilands.push(compiland);
    }

    attribute_pdata_to_owners(
        sections,
        coff_groups,
        eh_result,
        &mut libraries,
        &mut compilands,
        token,
    )?;

    for library in &mut libraries {
        library.contributions.seal()?;
    }
    for compiland in &mut compilands {
        compiland.contributions.seal()?;
    }

    Ok((libraries, compilands))
}

/// Attributes each pdata entry's bytes to the compiland (and its library) containing
/// the entry's target function.
///
/// The entries arrive in RVA order and consecutive entries usually target the same
/// compiland, so ranges are grown in place instead of collected one 12-byte range at
/// a time.
fn attribute_pdata_to_owners(
    sections: &[BinarySection],
    coff_groups: &[CoffGroup],
    eh_result: &pe::EhParseResult,
    libraries: &mut [Library],
    compilands: &mut [Compiland],
    token: &CancellationToken,
) -> Result<()> {
    if eh_result.pdata_symbols_by_rva.is_empty() || compilands.is_empty() {
        return Ok(());
    }

    let Some(pdata_section_index) = sections.iter().position(|s| s.name() == ".pdata") else {
        return Ok(());
    };
    let pdata_section_name = sections[pdata_section_index].name().to_string();

    // Not all toolchains emit a .pdata COFF group (clang doesn't, for instance)
    let pdata_group_name = coff_groups
        .iter()
        .find(|cg| cg.name() == ".pdata")
        .map(|cg| cg.name().to_string());

    let mut per_compiland_ranges: BTreeMap<usize, Vec<RvaRange>> = BTreeMap::new();
    let mut current_compiland: Option<usize> = None;

    for symbol in eh_result.pdata_symbols_by_rva.values() {
        token.check()?;

        let pdata_symbol_range = RvaRange::from_rva_and_size(symbol.rva, symbol.size, false);
        let target = symbol.target_start_rva;

        if !current_compiland.is_some_and(|idx| compilands[idx].contains_executable_code_at(target))
        {
            current_compiland = compilands
                .iter()
                .position(|c| c.contains_executable_code_at(target));
        }

        // Rarely no compiland contains the target (seen in Windows OS binaries);
        // living with the unattributed entry beats failing the whole open
        let Some(compiland_index) = current_compiland else {
            continue;
        };

        let ranges = per_compiland_ranges.entry(compiland_index).or_default();
        match ranges
            .iter_mut()
            .find(|r| r.is_adjacent_to(&pdata_symbol_range, 1))
        {
            Some(range) => *range = range.combine_with(&pdata_symbol_range),
            None => ranges.push(pdata_symbol_range),
        }
    }

    for (compiland_index, ranges) in per_compiland_ranges {
        let library_index = compilands[compiland_index].library_index;
        let compiland_name = compilands[compiland_index].name().to_string();
        let library_name = libraries[library_index].name().to_string();

        for range in ranges {
            compilands[compiland_index].contributions.add_range(
                &compiland_name,
                &pdata_section_name,
                pdata_group_name.as_deref(),
                range,
            )?;
            libraries[library_index].contributions.add_range(
                &library_name,
                &pdata_section_name,
                pdata_group_name.as_deref(),
                range,
            )?;
        }
    }

    Ok(())
}

/// Builds source files from the database's line contributions.
fn build_source_files(
    provider: &dyn DebugSymbolProvider,
    sections: &[BinarySection],
    coff_groups: &[CoffGroup],
    token: &CancellationToken,
) -> Result<Vec<SourceFile>> {
    let mut source_files = Vec::new();

    for record in provider.source_files(token)? {
        token.check()?;

        let mut source_file = SourceFile::new(&record.name);
        for contribution in &record.contributions {
            let Some(group_index) = coff_groups.iter().position(|cg| {
                let Ok(range) = cg.rva_range() else { return false };
                range.contains(contribution.rva)
            }) else {
                continue;
            };

            let group = &coff_groups[group_index];
            let section = &sections[group.section_index()?];
            let range = RvaRange::from_rva_and_size(
                contribution.rva,
                contribution.size,
                group.is_virtual_size_only()?,
            );

            let file_name = source_file.name().to_string();
            source_file.contributions.add_range(
                &file_name,
                section.name(),
                Some(group.name()),
                range,
            )?;
        }

        source_file.contributions.seal()?;
        source_files.push(source_file);
    }

    Ok(source_files)
}

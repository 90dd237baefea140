//! The attribution query engine.
//!
//! Every enumeration surface - by section, COFF group, library, compiland, source file,
//! or explicit RVA range - resolves to one core range query: collect the PE-derived
//! symbols from the range-indexed tables, merge in the debug-symbol provider's native
//! symbols where the range isn't purely PE-owned, prefer the PE symbol when both claim
//! an RVA, and sanity-check the result.
//!
//! The table-vs-provider dance matters for both correctness and speed. A range fully
//! inside the exception directory or resource tree can skip the provider entirely (the
//! provider would find nothing, one failed lookup at a time). xdata and import regions
//! interleave with compiler-emitted data, so those ranges merge both sources; the
//! PE-derived symbol wins when both claim one RVA because its name carries more detail
//! (ordinals, resource types, target functions).

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{cache::SessionDataCache, Session};
use crate::{
    provider::{SymbolRecord, SymbolRecordKind},
    ranges::RvaRange,
    symbols::{NativeSymbolKind, Symbol, SymbolRc},
    utils::synchronization::CancellationToken,
    Error, Result,
};

/// Where one symbol lives in the binary, across every attribution axis.
///
/// Indices point into the session's tables ([`Session::binary_sections`],
/// [`Session::coff_groups`], [`Session::libraries`], [`Session::compilands`],
/// [`Session::source_files`]). `source_file_index` is `None` for PE-synthesized
/// symbols - linker-generated metadata carries no source-file provenance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolPlacement {
    /// The containing binary section
    pub binary_section_index: Option<usize>,
    /// The containing COFF group
    pub coff_group_index: Option<usize>,
    /// The contributing library
    pub library_index: Option<usize>,
    /// The contributing compiland
    pub compiland_index: Option<usize>,
    /// The source file whose lines produced the bytes
    pub source_file_index: Option<usize>,
}

impl Session {
    /// Enumerates every symbol whose bytes fall inside `range`, in RVA order.
    ///
    /// The result is deduplicated (PE-derived symbols win over provider duplicates)
    /// and checked for double-attribution; COMDAT-folded members appear with their
    /// zero sizes alongside the canonical owner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AttributionConflict`] when two non-zero-sized symbols claim
    /// one RVA, [`Error::Cancelled`] on cancellation, or provider failures.
    pub fn enumerate_symbols_in_rva_range(
        &self,
        range: RvaRange,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolRc>> {
        let cache = &self.cache;
        let mut symbols: Vec<SymbolRc> = Vec::with_capacity(64);

        // Ranges that live entirely inside hand-parsed regions never need the
        // provider; asking it would fail byte-by-byte over tens of thousands of RVAs.
        let mut can_skip_provider = cache.xdata_rva_ranges.fully_contains(&range)
            || cache.other_pe_symbols_rva_ranges.fully_contains(&range);

        if cache
            .pdata_rva_range
            .is_some_and(|pdata| pdata.contains_range(&range))
        {
            collect_from_table(&cache.pdata_symbols_by_rva, &range, token, &mut symbols)?;
            can_skip_provider = true;
        }

        if cache
            .rsrc_rva_range
            .is_some_and(|rsrc| rsrc.contains_range(&range))
        {
            collect_from_table(&cache.rsrc_symbols_by_rva, &range, token, &mut symbols)?;
            can_skip_provider = true;
        }

        // Checking only full containment would be too restrictive here: with xdata at
        // (0, 100) and (200, 300), a query for (150, 250) must still surface the
        // symbols in (200, 250).
        if cache.xdata_rva_ranges.at_least_partially_overlaps(&range) {
            collect_from_table(&cache.xdata_symbols_by_rva, &range, token, &mut symbols)?;
        }

        if cache
            .other_pe_symbols_rva_ranges
            .at_least_partially_overlaps(&range)
        {
            collect_from_table(&cache.other_pe_symbols_by_rva, &range, token, &mut symbols)?;
        }

        if !can_skip_provider {
            for record in self.provider().symbols_in_range(range, token)? {
                token.check()?;

                // A PE-derived symbol at this RVA is preferred over the provider's
                // view of the same bytes
                if cache.other_pe_symbols_by_rva.contains_key(&record.rva) {
                    continue;
                }

                symbols.push(self.native_symbol_from_record(&record));
            }
        }

        symbols.sort_by(|a, b| {
            a.rva()
                .cmp(&b.rva())
                .then_with(|| a.name().cmp(b.name()))
        });

        check_for_conflicts(&symbols)?;

        Ok(symbols)
    }

    /// Enumerates every symbol in the named binary section, verifying that the
    /// section's bytes are fully attributed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AttributionGap`] when more than the configured tolerance of
    /// the section's bytes has no owning symbol, plus everything
    /// [`Session::enumerate_symbols_in_rva_range`] can return. An unknown section
    /// name is a malformed-input error.
    pub fn enumerate_symbols_in_binary_section(
        &self,
        section_name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolRc>> {
        let section = self
            .cache
            .sections
            .iter()
            .find(|s| s.name() == section_name)
            .ok_or_else(|| malformed_error!("No binary section named '{}'", section_name))?;

        let range = section.rva_range();
        let symbols = self.enumerate_symbols_in_rva_range(range, token)?;
        self.check_unit_fill(
            &format!("binary section '{}'", section.name()),
            &range,
            &symbols,
        )?;

        Ok(symbols)
    }

    /// Enumerates every symbol in the named COFF group, verifying that the group's
    /// bytes are fully attributed.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Session::enumerate_symbols_in_binary_section`].
    pub fn enumerate_symbols_in_coff_group(
        &self,
        coff_group_name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolRc>> {
        let group = self
            .cache
            .coff_groups
            .iter()
            .find(|cg| cg.name() == coff_group_name)
            .ok_or_else(|| malformed_error!("No COFF group named '{}'", coff_group_name))?;

        let range = group.rva_range()?;
        let symbols = self.enumerate_symbols_in_rva_range(range, token)?;
        self.check_unit_fill(&format!("COFF group '{}'", group.name()), &range, &symbols)?;

        Ok(symbols)
    }

    /// Enumerates every symbol attributed to the named library.
    ///
    /// # Errors
    ///
    /// Fails when the library is unknown, on conflicts, or on cancellation.
    pub fn enumerate_symbols_in_library(
        &self,
        library_name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolRc>> {
        let library = self
            .cache
            .libraries
            .iter()
            .find(|l| l.name() == library_name || l.short_name() == library_name)
            .ok_or_else(|| malformed_error!("No library named '{}'", library_name))?;

        self.enumerate_symbols_in_contribution_ranges(
            library.contributions.all_rva_ranges()?,
            token,
        )
    }

    /// Enumerates every symbol attributed to the named compiland.
    ///
    /// # Errors
    ///
    /// Fails when the compiland is unknown, on conflicts, or on cancellation.
    pub fn enumerate_symbols_in_compiland(
        &self,
        compiland_name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolRc>> {
        let compiland = self
            .cache
            .compilands
            .iter()
            .find(|c| c.name() == compiland_name || c.short_name() == compiland_name)
            .ok_or_else(|| malformed_error!("No compiland named '{}'", compiland_name))?;

        self.enumerate_symbols_in_contribution_ranges(
            compiland.contributions.all_rva_ranges()?,
            token,
        )
    }

    /// Enumerates every symbol attributed to the named source file's lines.
    ///
    /// # Errors
    ///
    /// Fails when the source file is unknown, on conflicts, or on cancellation.
    pub fn enumerate_symbols_in_source_file(
        &self,
        source_file_name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolRc>> {
        let source_file = self
            .cache
            .source_files
            .iter()
            .find(|sf| sf.name() == source_file_name)
            .ok_or_else(|| malformed_error!("No source file named '{}'", source_file_name))?;

        self.enumerate_symbols_in_contribution_ranges(
            source_file.contributions.all_rva_ranges()?,
            token,
        )
    }

    /// Looks up the symbol at `rva`.
    ///
    /// PE-derived tables are consulted first; COMDAT-folded queries always resolve to
    /// the canonical, non-folded member of the fold group.
    #[must_use]
    pub fn symbol_at_rva(&self, rva: u32) -> Option<SymbolRc> {
        let cache = &self.cache;
        for table in [
            &cache.pdata_symbols_by_rva,
            &cache.xdata_symbols_by_rva,
            &cache.rsrc_symbols_by_rva,
            &cache.other_pe_symbols_by_rva,
        ] {
            if let Some(symbol) = SessionDataCache::pe_symbol_containing(table, rva) {
                return Some(symbol);
            }
        }

        let record = self.provider().symbol_at_rva(rva)?;
        let symbol = self.native_symbol_from_record(&record);
        if !symbol.is_comdat_folded() {
            return Some(symbol);
        }

        // Re-resolve to the canonical member: same bytes, canonical name
        let group = cache.canonical_names_by_rva.get(&record.rva)?;
        let canonical_record = SymbolRecord {
            symbol_id: group.canonical_symbol_id(),
            name: group.canonical_name().to_string(),
            ..record
        };

        Some(self.native_symbol_from_record(&canonical_record))
    }

    /// Enumerates the full COMDAT fold group at `rva`, canonical member included.
    ///
    /// An RVA with no folding returns the single symbol found there; an RVA with no
    /// symbol at all returns an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] on cancellation.
    pub fn symbols_folded_at_rva(
        &self,
        rva: u32,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolRc>> {
        let Some(primary) = self.symbol_at_rva(rva) else {
            return Ok(Vec::new());
        };

        let Some(group) = self.cache.canonical_names_by_rva.get(&primary.rva()) else {
            return Ok(vec![primary]);
        };

        let kind = match primary.as_ref() {
            Symbol::Native(native) => native_kind_to_record_kind(native.kind),
            _ => return Ok(vec![primary]),
        };

        let mut members = Vec::with_capacity(group.names_by_symbol_id().len());
        for (symbol_id, name) in group.names_by_symbol_id() {
            token.check()?;

            let record = SymbolRecord {
                symbol_id: *symbol_id,
                rva: primary.rva(),
                size: primary.size(),
                virtual_size: primary.virtual_size(),
                name: name.clone(),
                kind,
            };
            members.push(self.native_symbol_from_record(&record));
        }

        Ok(members)
    }

    /// Locates `symbol` across every attribution axis.
    ///
    /// # Errors
    ///
    /// Fails only when geometry queries fail, which indicates a construction bug.
    pub fn symbol_placement(&self, symbol: &Symbol) -> Result<SymbolPlacement> {
        let cache = &self.cache;
        let rva = symbol.rva();
        let rva_end = symbol.rva_end();
        let virtual_size = symbol.virtual_size();

        let mut placement = SymbolPlacement::default();

        for (index, group) in cache.coff_groups.iter().enumerate() {
            let group_end = group.rva + group.virtual_size()?;
            if rva >= group.rva && group_end > 0 && rva_end <= group_end - 1 {
                placement.coff_group_index = Some(index);
                placement.binary_section_index = Some(group.section_index()?);
                break;
            }
        }

        if placement.binary_section_index.is_none() {
            placement.binary_section_index = cache.section_index_containing(rva);
        }

        if let Some(compiland_index) = cache
            .compilands
            .iter()
            .position(|c| c.contains(rva, virtual_size))
        {
            placement.compiland_index = Some(compiland_index);
            placement.library_index = Some(cache.compilands[compiland_index].library_index);
        }

        // Linker-generated metadata has no source provenance, so only native symbols
        // are looked up against line contributions
        if matches!(symbol, Symbol::Native(_)) {
            placement.source_file_index = cache
                .source_files
                .iter()
                .position(|sf| sf.contains(rva, virtual_size));
        }

        Ok(placement)
    }

    /// Enumerates across a set of contribution ranges, concatenating the results.
    fn enumerate_symbols_in_contribution_ranges(
        &self,
        ranges: Vec<RvaRange>,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolRc>> {
        let mut symbols = Vec::new();
        for range in ranges {
            symbols.extend(self.enumerate_symbols_in_rva_range(range, token)?);
        }

        symbols.sort_by(|a, b| {
            a.rva()
                .cmp(&b.rva())
                .then_with(|| a.name().cmp(b.name()))
        });

        Ok(symbols)
    }

    /// Verifies that `symbols` plus inferred inter-symbol padding fills `range`.
    ///
    /// Gaps *between* symbols are inferred alignment padding and accepted at any size;
    /// the leading and trailing slack together must stay within the configured
    /// tolerance, because unclaimed bytes at a unit's edges mean the analysis lost
    /// track of something.
    fn check_unit_fill(
        &self,
        unit_name: &str,
        range: &RvaRange,
        symbols: &[SymbolRc],
    ) -> Result<()> {
        let tolerance = self.options.max_padding_tolerance;
        let unit_virtual_size = u64::from(range.virtual_size());

        let mut claimants: Vec<&SymbolRc> = symbols
            .iter()
            .filter(|s| !s.is_comdat_folded() && s.virtual_size() > 0)
            .collect();
        claimants.sort_by_key(|s| s.rva());

        let (leading, trailing) = match (claimants.first(), claimants.last()) {
            (Some(first), Some(last)) => (
                u64::from(first.rva().saturating_sub(range.rva_start())),
                u64::from(range.rva_end().saturating_sub(last.rva_end())),
            ),
            _ => (unit_virtual_size, 0),
        };

        let gap = leading + trailing;
        if gap > u64::from(tolerance) {
            return Err(Error::AttributionGap {
                unit: unit_name.to_string(),
                expected: unit_virtual_size,
                attributed: unit_virtual_size - gap,
                gap,
                tolerance,
            });
        }

        Ok(())
    }
}

/// Collects, from an RVA-sorted table, every symbol fully inside `range`.
fn collect_from_table(
    table: &BTreeMap<u32, SymbolRc>,
    range: &RvaRange,
    token: &CancellationToken,
    out: &mut Vec<SymbolRc>,
) -> Result<()> {
    for (_, symbol) in table.range(range.rva_start()..=range.rva_end()) {
        token.check()?;

        if symbol.rva_end() > range.rva_end() {
            // The table is sorted by RVA, so nothing later fits in this range either
            break;
        }

        out.push(Arc::clone(symbol));
    }

    Ok(())
}

/// Fails when two non-zero-sized symbols claim one RVA.
///
/// Zero-sized coexistence is the tolerated label-in-procedure case; anything else
/// means bytes are being double-counted.
fn check_for_conflicts(sorted_symbols: &[SymbolRc]) -> Result<()> {
    for pair in sorted_symbols.windows(2) {
        if pair[0].rva() == pair[1].rva() && pair[0].size() > 0 && pair[1].size() > 0 {
            return Err(Error::AttributionConflict {
                rva: pair[0].rva(),
                first: pair[0].name().to_string(),
                second: pair[1].name().to_string(),
            });
        }
    }

    Ok(())
}

fn native_kind_to_record_kind(kind: NativeSymbolKind) -> SymbolRecordKind {
    match kind {
        NativeSymbolKind::Function => SymbolRecordKind::Function,
        NativeSymbolKind::SeparatedCodeBlock => SymbolRecordKind::SeparatedCodeBlock,
        NativeSymbolKind::Thunk => SymbolRecordKind::Thunk,
        NativeSymbolKind::Data => SymbolRecordKind::Data,
        NativeSymbolKind::StringLiteral => SymbolRecordKind::StringLiteral,
        NativeSymbolKind::Label => SymbolRecordKind::Label,
        NativeSymbolKind::PublicSymbol => SymbolRecordKind::PublicSymbol,
        NativeSymbolKind::Other => SymbolRecordKind::Other,
    }
}

//! The per-session data cache: everything built once at open time, then frozen.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::{
    attribution::{Compiland, Library, SourceFile},
    ranges::{RvaRange, RvaRangeSet},
    sections::{BinarySection, CoffGroup},
    symbols::{NameCanonicalization, SymbolRc},
};

/// Everything a session learns while opening a binary and its debug database.
///
/// Built on the single construction path inside `Session::open`, then immutable: every
/// table here is either frozen at open time or (for [`SessionDataCache::materialized_native_symbols`])
/// a lock-free insert-only cache that concurrent readers share. Queries never lock.
pub(crate) struct SessionDataCache {
    /// All binary sections, sealed, ordered by RVA
    pub sections: Vec<BinarySection>,
    /// All COFF groups, sealed, ordered by RVA
    pub coff_groups: Vec<CoffGroup>,
    /// All libraries, contributions sealed
    pub libraries: Vec<Library>,
    /// All compilands, contributions sealed
    pub compilands: Vec<Compiland>,
    /// All source files, contributions sealed
    pub source_files: Vec<SourceFile>,

    /// The exception directory's extent, `None` when the image carries none
    pub pdata_rva_range: Option<RvaRange>,
    /// pdata symbols keyed by record RVA
    pub pdata_symbols_by_rva: BTreeMap<u32, SymbolRc>,
    /// The coalesced xdata region set
    pub xdata_rva_ranges: RvaRangeSet,
    /// xdata symbols keyed by record RVA
    pub xdata_symbols_by_rva: BTreeMap<u32, SymbolRc>,
    /// The resource directory's extent, `None` when the image carries none
    pub rsrc_rva_range: Option<RvaRange>,
    /// Resource symbols keyed by RVA
    pub rsrc_symbols_by_rva: BTreeMap<u32, SymbolRc>,
    /// Import and directory symbols keyed by RVA
    pub other_pe_symbols_by_rva: BTreeMap<u32, SymbolRc>,
    /// The import/directory symbols' coalesced region set
    pub other_pe_symbols_rva_ranges: RvaRangeSet,
    /// Whole-directory span symbols, for the directory-level view
    pub pe_directory_symbols: Vec<SymbolRc>,

    /// COMDAT fold groups keyed by RVA; only RVAs where folding actually occurred
    pub canonical_names_by_rva: BTreeMap<u32, NameCanonicalization>,

    /// Native symbols materialized during queries, keyed by the provider's symbol id.
    /// Insert-only and lock-free so concurrent queries share materialization work.
    pub materialized_native_symbols: SkipMap<u32, SymbolRc>,
}

impl SessionDataCache {
    /// Finds the section containing `rva`, by index.
    pub fn section_index_containing(&self, rva: u32) -> Option<usize> {
        self.sections.iter().position(|s| s.contains(rva))
    }

    /// Finds the COFF group containing `rva`, by index.
    ///
    /// Containment is judged against the larger of the group's disk and memory
    /// extents, the same rule used when mapping section contributions.
    pub fn coff_group_index_containing(&self, rva: u32) -> Option<usize> {
        self.coff_groups.iter().position(|cg| {
            let Ok(size) = cg.size() else { return false };
            let Ok(virtual_size) = cg.virtual_size() else {
                return false;
            };
            let span = size.max(virtual_size);
            span > 0 && rva >= cg.rva && rva <= cg.rva + span - 1
        })
    }

    /// Looks up a symbol in one of the RVA-keyed PE symbol tables, allowing `rva` to
    /// fall anywhere inside the symbol's extent.
    pub fn pe_symbol_containing(
        table: &BTreeMap<u32, SymbolRc>,
        rva: u32,
    ) -> Option<SymbolRc> {
        let (_, symbol) = table.range(..=rva).next_back()?;
        if rva <= symbol.rva_end() {
            Some(Arc::clone(symbol))
        } else {
            None
        }
    }
}

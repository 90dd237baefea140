//! The symbol model: every named byte-owning construct the engine can attribute.
//!
//! Symbols come from two places. The debug-symbol provider yields *native* symbols -
//! functions, code blocks, data, strings - with compiland and source-file affiliation.
//! The PE parsers in [`crate::pe`] synthesize symbols for everything the provider cannot
//! see: exception metadata (pdata/xdata), Win32 resources, import tables and the other
//! data directories. Both families flow through one closed [`Symbol`] type dispatched by
//! pattern match, so query code never needs to know which parser produced a symbol.
//!
//! # Key Components
//!
//! - [`Symbol`] / [`SymbolRc`] - the closed symbol union and its shared-ownership alias
//! - [`NativeSymbol`] - provider-supplied symbols, including COMDAT fold state
//! - [`crate::symbols::eh::EhSymbol`] - exception-metadata symbols
//! - [`crate::symbols::rsrc::RsrcSymbol`] - resource symbols and their aggregates
//! - [`crate::symbols::pe::PeSymbol`] - import and directory symbols
//! - [`NameCanonicalization`] - deterministic COMDAT fold-group resolution
//!
//! # COMDAT Folding
//!
//! When the linker folds identical functions (`/OPT:ICF`), several logical symbols share
//! one RVA. Exactly one member of the fold group - the one whose name sorts first - owns
//! the bytes; every other member reports `size == 0`, keeps its own distinct name, and
//! exposes the owner's name via `canonical_name`. The choice is stable across rebuilds,
//! which keeps size diffs meaningful.

pub mod eh;
pub mod pe;
pub mod rsrc;

use std::sync::Arc;

pub use eh::{EhSymbol, EhSymbolKind};
pub use pe::{PeSymbol, PeSymbolKind};
pub use rsrc::{RsrcSymbol, RsrcSymbolKind, Win32ResourceType};

/// A reference to a `Symbol`
pub type SymbolRc = Arc<Symbol>;

/// The kinds of native symbols the debug-symbol provider can yield.
///
/// The engine treats these mostly uniformly; the distinction matters for COMDAT
/// canonicalization (public-symbol names are demoted) and for tolerating zero-sized
/// labels inside procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeSymbolKind {
    /// A function's primary code block
    Function,
    /// A separated code block of a function (PGO hot/cold splitting)
    SeparatedCodeBlock,
    /// An incremental-linking or import thunk
    Thunk,
    /// Static or global data
    Data,
    /// A string literal
    StringLiteral,
    /// A zero-sized label inside a procedure (assembly code)
    Label,
    /// A public symbol; names are mangled and only used when nothing better exists
    PublicSymbol,
    /// Anything else the provider chooses to surface
    Other,
}

/// A symbol supplied by the debug-symbol provider, with fold state resolved.
#[derive(Debug, Clone)]
pub struct NativeSymbol {
    /// RVA of the symbol's first byte
    pub rva: u32,
    /// Bytes occupied on disk; 0 for COMDAT-folded symbols and bss-style data
    pub size: u32,
    /// Bytes occupied in memory
    pub virtual_size: u32,
    /// The symbol's own name, unique within its fold group
    pub name: String,
    /// What kind of construct this is
    pub kind: NativeSymbolKind,
    /// True if the linker folded this symbol into another identical one
    pub is_comdat_folded: bool,
    /// The fold group's canonical name; equals `name` for non-folded symbols
    pub canonical_name: String,
}

/// Every byte-owning construct the engine can attribute, as one closed union.
///
/// Pattern match to reach family-specific payloads; use the accessor methods for the
/// common surface every query path needs.
#[derive(Debug, Clone)]
pub enum Symbol {
    /// A provider-supplied native symbol
    Native(NativeSymbol),
    /// An exception-metadata symbol (pdata or the xdata family)
    Eh(EhSymbol),
    /// A Win32 resource symbol
    Rsrc(RsrcSymbol),
    /// An import-table or data-directory symbol
    Pe(PeSymbol),
}

impl Symbol {
    /// RVA of the symbol's first byte.
    #[must_use]
    pub fn rva(&self) -> u32 {
        match self {
            Symbol::Native(s) => s.rva,
            Symbol::Eh(s) => s.rva,
            Symbol::Rsrc(s) => s.rva,
            Symbol::Pe(s) => s.rva,
        }
    }

    /// Bytes the symbol occupies on disk.
    ///
    /// COMDAT-folded native symbols report 0 here - their bytes belong to the
    /// canonical member of the fold group.
    #[must_use]
    pub fn size(&self) -> u32 {
        match self {
            Symbol::Native(s) => s.size,
            Symbol::Eh(s) => s.size,
            Symbol::Rsrc(s) => s.size,
            Symbol::Pe(s) => s.size,
        }
    }

    /// Bytes the symbol occupies in memory.
    ///
    /// PE-synthesized symbols always take up real space, so their virtual size equals
    /// their size; native symbols can differ (bss data, folded symbols).
    #[must_use]
    pub fn virtual_size(&self) -> u32 {
        match self {
            Symbol::Native(s) => s.virtual_size,
            Symbol::Eh(s) => s.size,
            Symbol::Rsrc(s) => s.size,
            Symbol::Pe(s) => s.size,
        }
    }

    /// The last RVA occupied by this symbol.
    ///
    /// `rva + virtual_size` would point one past the symbol, so 1 is subtracted;
    /// zero-sized symbols report their own RVA.
    #[must_use]
    pub fn rva_end(&self) -> u32 {
        let vs = self.virtual_size();
        if vs == 0 {
            self.rva()
        } else {
            self.rva() + vs - 1
        }
    }

    /// The symbol's own name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Symbol::Native(s) => &s.name,
            Symbol::Eh(s) => &s.name,
            Symbol::Rsrc(s) => &s.name,
            Symbol::Pe(s) => &s.name,
        }
    }

    /// The canonical name of the symbol's fold group.
    ///
    /// Equals [`Symbol::name`] for everything except COMDAT-folded native symbols.
    #[must_use]
    pub fn canonical_name(&self) -> &str {
        match self {
            Symbol::Native(s) => &s.canonical_name,
            _ => self.name(),
        }
    }

    /// True if the linker folded this symbol into an identical sibling.
    ///
    /// Only native symbols can fold; PE-synthesized symbols always own their bytes.
    #[must_use]
    pub fn is_comdat_folded(&self) -> bool {
        match self {
            Symbol::Native(s) => s.is_comdat_folded,
            _ => false,
        }
    }
}

/// Deterministic resolution of one COMDAT fold group.
///
/// Two kinds of things fold in a binary: native symbols fold when `/OPT:ICF` is in use,
/// leaving multiple names for one RVA, and xdata records fold when identical unwind data
/// serves many functions. This type handles the native case: it accumulates every
/// (symbol id, name) pair seen at one RVA, then picks the canonical member.
///
/// Public-symbol names are mangled and sort badly, so once any non-public name has been
/// seen, public names are discarded. Duplicate names are discarded outright - the same
/// name appearing under multiple symbol ids is harmless.
#[derive(Debug, Default, Clone)]
pub struct NameCanonicalization {
    has_non_public_name: bool,
    names_by_symbol_id: Vec<(u32, String)>,
    canonical_symbol_id: u32,
    canonical_name: String,
}

impl NameCanonicalization {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> NameCanonicalization {
        NameCanonicalization::default()
    }

    /// Records one name observed at this RVA.
    ///
    /// # Arguments
    /// * `symbol_id` - The provider's identity for the symbol carrying this name
    /// * `name` - The symbol's name
    /// * `is_public` - True for public symbols, whose names are only kept as a last resort
    pub fn add_name(&mut self, symbol_id: u32, name: &str, is_public: bool) {
        if is_public && self.has_non_public_name {
            return;
        }

        if self.names_by_symbol_id.iter().any(|(_, n)| n == name) {
            return;
        }

        self.names_by_symbol_id.push((symbol_id, name.to_string()));
        self.has_non_public_name |= !is_public;
    }

    /// Picks the canonical member: the lexicographically-least name.
    ///
    /// Ordinal comparison keeps the choice deterministic across runs and rebuilds,
    /// which is what makes diffs of two analyses line up.
    pub fn canonicalize(&mut self) {
        let mut canonical: Option<(u32, &str)> = None;

        for (symbol_id, name) in &self.names_by_symbol_id {
            match canonical {
                Some((_, current)) if current <= name.as_str() => {}
                _ => canonical = Some((*symbol_id, name.as_str())),
            }
        }

        if let Some((symbol_id, name)) = canonical {
            self.canonical_symbol_id = symbol_id;
            self.canonical_name = name.to_string();
        }
    }

    /// The canonical member's symbol id. Meaningful after [`NameCanonicalization::canonicalize`].
    #[must_use]
    pub fn canonical_symbol_id(&self) -> u32 {
        self.canonical_symbol_id
    }

    /// The canonical member's name. Meaningful after [`NameCanonicalization::canonicalize`].
    #[must_use]
    pub fn canonical_name(&self) -> &str {
        &self.canonical_name
    }

    /// All (symbol id, name) pairs recorded for this RVA.
    #[must_use]
    pub fn names_by_symbol_id(&self) -> &[(u32, String)] {
        &self.names_by_symbol_id
    }
}

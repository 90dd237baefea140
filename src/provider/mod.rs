//! The debug-symbol provider boundary.
//!
//! Everything this engine knows about *named* constructs - functions, data, compilands,
//! libraries, source files, COFF groups - comes from the binary's debug database, accessed
//! through the [`DebugSymbolProvider`] trait. The engine trusts the provider for all of
//! that, and distrusts it for exactly the byte regions it cannot see: pdata, xdata, Win32
//! resources and import tables, which are parsed by hand in [`crate::pe`].
//!
//! The trait is intentionally narrow: it exposes only the queries the attribution engine
//! consumes, so any symbol source - a PDB reader, a test fixture, a remote service - can
//! implement it without dragging in a full debug-information object model.
//!
//! # Thread Safety
//!
//! Providers must be `Send + Sync`: session opening parses the independent PE symbol
//! families in parallel, and several of those parsers resolve names through the provider
//! concurrently.

use uguid::Guid;

use crate::{CancellationToken, Result, RvaRange};

/// The source language of a compiland, as recorded in the debug database.
///
/// The exception-metadata parser needs this to decide how hard to fight: MASM-built code
/// is known to carry unwind data that doesn't follow the C/C++ toolchain's layout, and
/// compilands with no recorded language (clang output) can do the same - both are
/// tolerated by skipping rather than failing the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilandLanguage {
    /// C
    C,
    /// C++
    Cpp,
    /// Microsoft assembler
    Masm,
    /// A language the engine has no special handling for
    Other,
    /// No language recorded (clang does not emit compiland detail)
    Unknown,
}

/// One COFF group as recorded in the debug database.
///
/// The PE section table knows nothing about COFF groups; they only exist in the debug
/// database. The engine assigns each group to its owning section by RVA containment.
#[derive(Debug, Clone)]
pub struct CoffGroupRecord {
    /// The group's name, e.g. `.text$mn` or `.rsrc$01`
    pub name: String,
    /// RVA where the group starts
    pub rva: u32,
    /// The group's extent in bytes. Whether these bytes are real or virtual-only
    /// cannot be known here; the geometry builder resolves that from the owning
    /// section's characteristics.
    pub raw_size: u32,
    /// Section characteristics of the group
    pub characteristics: u32,
}

/// One raw RVA-range contribution an owner makes to the image.
#[derive(Debug, Clone, Copy)]
pub struct RawContribution {
    /// RVA where the contributed bytes start
    pub rva: u32,
    /// Number of contributed bytes
    pub size: u32,
    /// True when the bytes exist only in memory (uninitialized data)
    pub is_virtual_size: bool,
}

/// One compiland (object file) as recorded in the debug database.
#[derive(Debug, Clone)]
pub struct CompilandRecord {
    /// The compiland's name, usually the object file path recorded at link time
    pub name: String,
    /// The static library the compiland came from; empty for objects passed
    /// directly to the linker
    pub lib_name: String,
    /// The compiland's recorded source language
    pub language: CompilandLanguage,
    /// Every section contribution the compiland makes
    pub contributions: Vec<RawContribution>,
}

/// One source file as recorded in the debug database.
///
/// Source files relate many-to-many with compilands (headers contribute to every
/// compiland that includes them); the contributions here are the line-contribution
/// ranges attributed to this file across all compilands.
#[derive(Debug, Clone)]
pub struct SourceFileRecord {
    /// The file's path as recorded in the database
    pub name: String,
    /// Every byte range attributed to this file's lines
    pub contributions: Vec<RawContribution>,
}

/// The kinds of native symbols a provider can yield.
///
/// This mirrors [`crate::symbols::NativeSymbolKind`] but lives on the raw record so
/// providers never depend on the engine's resolved symbol model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolRecordKind {
    /// A function's primary code block
    Function,
    /// A separated (PGO hot/cold split) code block
    SeparatedCodeBlock,
    /// A thunk
    Thunk,
    /// Static or global data
    Data,
    /// A string literal
    StringLiteral,
    /// A zero-sized label inside a procedure
    Label,
    /// A public symbol (mangled name, last-resort detail)
    PublicSymbol,
    /// Anything else
    Other,
}

/// One native symbol as recorded in the debug database.
#[derive(Debug, Clone)]
pub struct SymbolRecord {
    /// The provider's stable identity for this symbol. Distinct records at the same
    /// RVA (COMDAT folding) carry distinct ids.
    pub symbol_id: u32,
    /// RVA of the symbol's first byte
    pub rva: u32,
    /// Bytes on disk
    pub size: u32,
    /// Bytes in memory; differs from `size` for uninitialized data
    pub virtual_size: u32,
    /// The symbol's name
    pub name: String,
    /// What kind of construct this is
    pub kind: SymbolRecordKind,
}

/// The debug-database collaborator the engine is built against.
///
/// A real implementation wraps a PDB reader; tests use an in-memory fixture. The engine
/// calls these methods during session opening (validation, geometry, canonicalization)
/// and during queries (per-range symbol enumeration, EH target resolution).
pub trait DebugSymbolProvider: Send + Sync {
    /// The database's own debug signature, for matching against the image's RSDS record.
    ///
    /// Returning `None` means the database carries no signature; opening then proceeds
    /// without verification.
    fn debug_signature(&self) -> Option<(Guid, u32)>;

    /// True when the database is a "minimal" or stripped database lacking compiland,
    /// section-contribution and line detail. Such databases are rejected at open time.
    fn is_minimal(&self) -> bool;

    /// Every COFF group recorded in the database.
    ///
    /// # Errors
    /// Fails if the database cannot be read or the operation is cancelled.
    fn coff_groups(&self, token: &CancellationToken) -> Result<Vec<CoffGroupRecord>>;

    /// Every compiland, with library affiliation and section contributions.
    ///
    /// # Errors
    /// Fails if the database cannot be read or the operation is cancelled.
    fn compilands(&self, token: &CancellationToken) -> Result<Vec<CompilandRecord>>;

    /// Every source file, with line-contribution ranges.
    ///
    /// # Errors
    /// Fails if the database cannot be read or the operation is cancelled.
    fn source_files(&self, token: &CancellationToken) -> Result<Vec<SourceFileRecord>>;

    /// The full native-symbol stream, used once at open time to build COMDAT fold groups.
    ///
    /// # Errors
    /// Fails if the database cannot be read or the operation is cancelled.
    fn all_symbols(&self, token: &CancellationToken) -> Result<Vec<SymbolRecord>>;

    /// Every native symbol whose bytes fall inside `range`, in RVA order.
    ///
    /// # Errors
    /// Fails if the database cannot be read or the operation is cancelled.
    fn symbols_in_range(
        &self,
        range: RvaRange,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolRecord>>;

    /// The symbol containing `rva`, if any.
    ///
    /// Lookups use nearest-preceding semantics: a symbol whose range contains `rva` wins
    /// even when `rva` is not its first byte. This is how exception-metadata targets are
    /// resolved - an unwind record can target a block in the middle of a function.
    fn symbol_at_rva(&self, rva: u32) -> Option<SymbolRecord>;

    /// The RVA of the symbol with exactly this name, if it exists in the image.
    ///
    /// Used to resolve the well-known exception handler routines
    /// (`__CxxFrameHandler3` and friends) that select how xdata is decoded.
    fn symbol_rva_by_name(&self, name: &str) -> Option<u32>;

    /// The source language of the compiland containing `rva`.
    fn language_of_symbol_at(&self, rva: u32) -> CompilandLanguage;

    /// If `rva` names a public symbol that is an incremental-linking thunk, the RVA of
    /// the thunk's target; `None` otherwise.
    ///
    /// Incrementally-linked binaries route exception handlers through ILTs, so the
    /// handler RVA found in xdata must be chased one hop before it matches a well-known
    /// handler name.
    fn public_symbol_target_rva(&self, rva: u32) -> Option<u32>;
}

impl<P: DebugSymbolProvider + ?Sized> DebugSymbolProvider for Box<P> {
    fn debug_signature(&self) -> Option<(Guid, u32)> {
        (**self).debug_signature()
    }

    fn is_minimal(&self) -> bool {
        (**self).is_minimal()
    }

    fn coff_groups(&self, token: &CancellationToken) -> Result<Vec<CoffGroupRecord>> {
        (**self).coff_groups(token)
    }

    fn compilands(&self, token: &CancellationToken) -> Result<Vec<CompilandRecord>> {
        (**self).compilands(token)
    }

    fn source_files(&self, token: &CancellationToken) -> Result<Vec<SourceFileRecord>> {
        (**self).source_files(token)
    }

    fn all_symbols(&self, token: &CancellationToken) -> Result<Vec<SymbolRecord>> {
        (**self).all_symbols(token)
    }

    fn symbols_in_range(
        &self,
        range: RvaRange,
        token: &CancellationToken,
    ) -> Result<Vec<SymbolRecord>> {
        (**self).symbols_in_range(range, token)
    }

    fn symbol_at_rva(&self, rva: u32) -> Option<SymbolRecord> {
        (**self).symbol_at_rva(rva)
    }

    fn symbol_rva_by_name(&self, name: &str) -> Option<u32> {
        (**self).symbol_rva_by_name(name)
    }

    fn language_of_symbol_at(&self, rva: u32) -> CompilandLanguage {
        (**self).language_of_symbol_at(rva)
    }

    fn public_symbol_target_rva(&self, rva: u32) -> Option<u32> {
        (**self).public_symbol_target_rva(rva)
    }
}

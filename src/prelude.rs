//! # sizescope Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the sizescope library. Import this module to get quick access to the essential
//! types for PE size analysis.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all sizescope operations
pub use crate::Error;

/// The result type used throughout sizescope
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The analysis session: open a binary + debug database pair, query attribution
pub use crate::session::{Session, SessionOptions, SymbolPlacement};

/// Low-level image access and record parsing
pub use crate::{File, Parser};

/// Cooperative cancellation for long enumerations
pub use crate::CancellationToken;

// ================================================================================================
// Address Space
// ================================================================================================

/// RVA intervals and coalescing range sets
pub use crate::ranges::{RvaRange, RvaRangeSet};

/// The architectures this library can decode
pub use crate::file::MachineType;

// ================================================================================================
// Geometry and Attribution
// ================================================================================================

/// Sections and COFF groups
pub use crate::sections::{BinarySection, CoffGroup, SectionCharacteristics};

/// The attribution owners and their contributions
pub use crate::attribution::{Compiland, Contribution, Library, SourceFile};

// ================================================================================================
// Symbols
// ================================================================================================

/// The closed symbol model
pub use crate::symbols::{
    EhSymbol, EhSymbolKind, NativeSymbol, NativeSymbolKind, PeSymbol, PeSymbolKind, RsrcSymbol,
    RsrcSymbolKind, Symbol, SymbolRc, Win32ResourceType,
};

// ================================================================================================
// The Debug-Symbol Collaborator
// ================================================================================================

/// The provider trait and its record types
pub use crate::provider::{
    CoffGroupRecord, CompilandLanguage, CompilandRecord, DebugSymbolProvider, RawContribution,
    SourceFileRecord, SymbolRecord, SymbolRecordKind,
};

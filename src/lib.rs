// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
// - 'file/physical.rs' uses mmap to map a file into memory

//! # sizescope
//!
//! A high-performance, cross-platform framework for static size analysis of native Windows
//! PE executables. Built in pure Rust, `sizescope` attributes every byte of a binary to its
//! owning construct - binary section, COFF group, static library, compiland, source file,
//! and ultimately a named symbol - without running on Windows or loading the image.
//!
//! ## Features
//!
//! - **📦 Efficient memory access** - Memory-mapped image access with bounds-checked parsing
//! - **🔍 Complete byte attribution** - No byte left behind, no byte double-counted: gaps and
//!   overlaps in the model are loud errors, never silent approximations
//! - **⚡ Hand-written PE parsers** - Exception metadata (pdata/xdata for x64, ARM32 and
//!   ARM64, `__CxxFrameHandler3` and `__CxxFrameHandler4` layouts), Win32 resources with
//!   icon/cursor/string-table aggregation, import and delay-load tables
//! - **🔧 Cross-platform** - Works on Windows, Linux, macOS, and any Rust-supported platform
//! - **🛡️ Memory safe** - Hostile or truncated images cannot cause out-of-bounds access
//! - **🧩 Pluggable symbol source** - The debug database is reached through one narrow
//!   trait, so PDB readers and test fixtures plug in the same way
//!
//! ## Quick Start
//!
//! Add `sizescope` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! sizescope = "0.2"
//! ```
//!
//! ### Using the Prelude
//!
//! ```rust,no_run
//! use sizescope::prelude::*;
//! use std::path::Path;
//! # fn provider() -> Box<dyn DebugSymbolProvider> { unimplemented!() }
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
//!     println!("{}: {} bytes", section.name(), section.virtual_size());
//! }
//! # Ok::<(), sizescope::Error>(())
//! ```
//!
//! ### Enumerating Symbols
//!
//! ```rust,no_run
//! use sizescope::{CancellationToken, Session, SessionOptions};
//! # fn open() -> sizescope::Result<Session> { unimplemented!() }
//!
//! let session = open()?;
//! let token = CancellationToken::new();
//!
//! // Everything in .text, with full attribution checking
//! let symbols = session.enumerate_symbols_in_binary_section(".text", &token)?;
//! for symbol in &symbols {
//!     println!("0x{:08X} {:6} {}", symbol.rva(), symbol.virtual_size(), symbol.name());
//! }
//!
//! // Where does one symbol live?
//! if let Some(symbol) = session.symbol_at_rva(0x1000) {
//!     let placement = session.symbol_placement(&symbol)?;
//!     if let Some(idx) = placement.compiland_index {
//!         println!("{} comes from {}", symbol.name(), session.compilands()[idx].name());
//!     }
//! }
//! # Ok::<(), sizescope::Error>(())
//! ```
//!
//! ## Architecture
//!
//! `sizescope` is organized into several key modules:
//!
//! - [`prelude`] - Convenient re-exports of commonly used types and traits
//! - [`Session`] - The main entry point: open, validate, query
//! - [`File`] - PE image access, headers, sections, address translation
//! - [`pe`] - The hand-written parsers for regions debug databases cannot see
//! - [`symbols`] - The closed symbol model and COMDAT fold resolution
//! - [`attribution`] - Libraries, compilands, source files and their contributions
//! - [`provider`] - The debug-symbol collaborator boundary
//! - [`Error`] and [`Result`] - Comprehensive error handling
//!
//! ### What the debug database can't tell you
//!
//! Debug databases attribute compiler-emitted bytes well, but linkers synthesize whole
//! regions with no symbol coverage: exception directories, unwind metadata, C++ EH side
//! tables, Win32 resource trees, import thunk chains. `sizescope` parses those byte-exactly
//! from the image - per architecture where the formats differ - and merges them with the
//! database's native symbols into one deduplicated, gap-checked view.
//!
//! ### Validation
//!
//! Size analysis over the wrong inputs produces confidently wrong numbers, so sessions
//! validate eagerly at open time: managed (.NET) images, binaries whose RSDS signature
//! does not match the debug database, and minimal/stripped databases are all rejected
//! with distinct error variants before any query runs.
//!
//! ## Thread Safety
//!
//! A [`Session`] is immutable after opening: all queries take `&self` and can run
//! concurrently. Long enumerations accept a [`CancellationToken`] checked at
//! symbol-by-symbol granularity; cancellation surfaces as [`Error::Cancelled`], never as
//! a partial result.

#[macro_use]
pub(crate) mod error;
pub(crate) mod file;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use sizescope::prelude::*;
/// # fn provider() -> Box<dyn DebugSymbolProvider> { unimplemented!() }
///
/// let token = CancellationToken::new();
/// let session = Session::open_file(
///     "app.dll".as_ref(),
///     provider(),
///     SessionOptions::default(),
///     &token,
/// )?;
/// # Ok::<(), sizescope::Error>(())
/// ```
pub mod prelude;

/// RVA range primitives: intervals and coalescing range sets.
pub mod ranges;

/// The attribution owners and their sealed contributions.
pub mod attribution;

/// The debug-symbol provider boundary and its record types.
pub mod provider;

/// Binary sections and COFF groups.
pub mod sections;

/// The closed symbol model: native, exception-metadata, resource and import symbols.
pub mod symbols;

/// Parsers for the PE metadata the debug-symbol provider cannot see.
pub mod pe;

/// The analysis session and its query surface.
pub mod session;

pub(crate) mod utils;

pub use crate::error::Error;
pub use crate::file::parser::Parser;
pub use crate::file::{DebugDirectoryEntry, DebugSignature, File, MachineType};
pub use crate::provider::DebugSymbolProvider;
pub use crate::ranges::{RvaRange, RvaRangeSet};
pub use crate::session::{Session, SessionOptions, SymbolPlacement};
pub use crate::symbols::{Symbol, SymbolRc};
pub use crate::utils::synchronization::CancellationToken;

/// The result type used throughout this library.
pub type Result<T> = std::result::Result<T, Error>;

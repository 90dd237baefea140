//! Exception directory (pdata) and unwind metadata (xdata) parsing.
//!
//! Table-driven exception handling means the compiler and linker emit, for every function
//! run, a procedure-data record in the exception directory, pointing at unwind data that
//! can itself point at C++ exception-handling side tables. The formats are
//! architecture-specific ([`amd64`] and [`arm`] hold the per-machine pdata and
//! UNWIND_INFO layouts), while everything downstream of the exception handler RVA - the
//! `__CxxFrameHandler3` fixed layout and the `__CxxFrameHandler4` compressed layout - is
//! shared and lives here and in [`fh4`].
//!
//! # The parsing dance
//!
//! pdata parses first, yielding one symbol per directory entry plus the target-function
//! RVA each entry describes. The xdata pass then decodes each entry's unwind record:
//!
//! 1. The record's flags select plain unwind data, a chain link back to a parent
//!    function's record, or an exception handler.
//! 2. A handler is classified by comparing its RVA against the well-known runtime
//!    handlers resolved by name through the debug-symbol provider. The handler identity
//!    determines the layout of the language-specific data that follows.
//! 3. C++ handlers point at a FuncInfo descriptor that fans out into state-unwind, try,
//!    handler and IP-to-state maps - each becoming its own symbol, because each is its
//!    own byte region.
//!
//! Records shared by many functions (COMDAT-folded unwind data, chained parents) are
//! deduplicated by RVA at insertion: first discovery wins, later discoveries are the
//! same bytes.
//!
//! # Unknown handlers
//!
//! An unrecognized handler is a hard error naming the handler and function - a silently
//! skipped handler would leave unattributed bytes. Two toolchain quirks are tolerated by
//! skipping instead: MASM-built code (known to emit unconventional xdata) and compilands
//! with no recorded language (clang emits no compiland detail). Incremental-linking
//! thunks are chased one hop before classification.

pub(crate) mod amd64;
pub(crate) mod arm;
pub(crate) mod fh4;

use std::collections::BTreeMap;

use crate::{
    file::{File, MachineType},
    provider::{CompilandLanguage, DebugSymbolProvider},
    ranges::{RvaRange, RvaRangeSet},
    symbols::eh::{EhSymbol, EhSymbolKind},
    utils::synchronization::CancellationToken,
    Parser, Result,
};

/// The FuncInfo magic of `__CxxFrameHandler3` metadata. Earlier magics (0x19930520,
/// 0x19930521) belong to toolchains old enough that no supported binary carries them.
const EH_MAGIC_NUMBER3: u32 = 0x1993_0522;

/// `_s_FuncInfo` is 10 DWORDs under `__CxxFrameHandler3`.
const FUNCINFO3_SIZE: u32 = 40;
/// FH3 UnwindMapEntry: `{ toState: i32, actionRva: u32 }`.
const UNWIND_MAP_ENTRY3_SIZE: u32 = 8;
/// FH3 TryBlockMapEntry: `{ tryLow, tryHigh, catchHigh, nCatches: i32, handlerArrayRVA: u32 }`.
const TRY_BLOCK_MAP_ENTRY3_SIZE: u32 = 20;
/// FH3 HandlerType: `{ adjectives, dispType, dispCatchObj, dispOfHandler, dispFrame }`.
const HANDLER_TYPE3_SIZE: u32 = 20;
/// FH3 IpToStateMapEntry: `{ IpRva: u32, State: i32 }`.
const IP_TO_STATE_MAP_ENTRY3_SIZE: u32 = 8;
/// A `__C_specific_handler` scope record is 4 DWORDs.
const SCOPE_RECORD_SIZE: u32 = 16;

/// GS cookie data flag: 3 DWORDs of data instead of 1.
const UNW_GSALIGNEDFRAME: u32 = 0x4;

/// Handlers that are known to carry no language-specific data at all.
///
/// Sometimes called "KnownExceptionHandlers" in Microsoft-internal tooling; these are
/// kernel and runtime handlers whose unwind records end at the handler RVA.
const NO_LANGUAGE_SPECIFIC_DATA_HANDLERS: &[&str] = &[
    "RtlpExceptionHandler",
    "RtlpEmUnwindHandler",
    "KiSystemServiceHandler",
    "KiUserApcHandler",
    "KiEmulateFloatExceptHandler",
    "UMThunkUnwindFrameChainHandler",
    "KiInterruptHandler",
    "KiSwitchKernelStackAndCalloutHandler",
    "RtlpUnwindHandler",
    "ProcessCLRException",
    "FixRedirectContextHandler",
    "HijackHandler",
    "FixContextHandler",
    "KiFatalExceptionHandler",
    "_guard_icall_handler",
    "KiCustomAccessHandler0",
    "KiCustomAccessHandler1",
    "KiCustomAccessHandler2",
    "KiCustomAccessHandler3",
    "KiCustomAccessHandler4",
    "KiCustomAccessHandler5",
    "KiCustomAccessHandler6",
    "KiCustomAccessHandler7",
    "KiCustomAccessHandler8",
    "KiCustomAccessHandler9",
    "KiFilterFiberContext",
];

/// Everything the exception-directory parse produced.
#[derive(Debug, Default)]
pub struct EhParseResult {
    /// The exception directory's extent; a zero range when the image has none
    /// (apiset DLLs, x86 images)
    pub pdata_rva_range: Option<RvaRange>,
    /// One symbol per pdata entry, keyed by the entry's RVA
    pub pdata_symbols_by_rva: BTreeMap<u32, EhSymbol>,
    /// The coalesced region set holding every xdata record
    pub xdata_rva_ranges: RvaRangeSet,
    /// One symbol per xdata record, keyed by the record's RVA
    pub xdata_symbols_by_rva: BTreeMap<u32, EhSymbol>,
}

/// One decoded pdata entry, before xdata has been chased.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PdataEntry {
    pub pdata_rva: u32,
    pub entry_size: u32,
    pub target_start_rva: u32,
    /// RVA of the out-of-line unwind record; `None` for packed and forwarder entries
    pub unwind_info_rva: Option<u32>,
    pub kind: EhSymbolKind,
}

/// Parses the exception directory and all reachable xdata for the image.
///
/// # Arguments
/// * `file` - The loaded image
/// * `provider` - Used to resolve target-function names and well-known handler RVAs
/// * `machine` - Selects the per-architecture record formats
/// * `xdata_coff_group_range` - The `.xdata` COFF group's extent when the debug database
///   exposes one; folded into the returned range set. 32-bit images never have one.
/// * `token` - Checked per pdata entry
///
/// # Errors
///
/// Fails on malformed records, unknown handlers in code with a known non-MASM language,
/// or cancellation.
pub fn parse_eh_symbols(
    file: &File,
    provider: &dyn DebugSymbolProvider,
    machine: MachineType,
    xdata_coff_group_range: Option<RvaRange>,
    token: &CancellationToken,
) -> Result<EhParseResult> {
    if machine == MachineType::I386 {
        // x86 exception handling is not table-driven; there is no pdata or xdata.
        return Ok(EhParseResult::default());
    }

    let Some((dir_rva, dir_size)) = file.data_directory(3) else {
        // No exception directory at all, e.g. an apiset DLL
        return Ok(EhParseResult::default());
    };

    let mut parser = EhParser::new(file, provider, machine);
    let pdata_range = RvaRange::from_rva_and_size(dir_rva, dir_size, false);

    // pdata parses fully before any xdata is chased: xdata record decoding needs the
    // target function of every entry, and chained records can point back at entries
    // anywhere in the directory.
    let entries = match machine {
        MachineType::X64 => amd64::parse_pdata(&mut parser, dir_rva, dir_size, token)?,
        MachineType::Arm | MachineType::Arm64 => {
            arm::parse_pdata(&mut parser, dir_rva, dir_size, token)?
        }
        MachineType::I386 => unreachable!(),
    };

    let mut pdata_symbols = BTreeMap::new();
    for entry in &entries {
        let target_name = parser.target_symbol_name(entry.target_start_rva);
        pdata_symbols.insert(
            entry.pdata_rva,
            EhSymbol::new(
                entry.kind,
                entry.pdata_rva,
                entry.entry_size,
                entry.target_start_rva,
                target_name.as_deref(),
            ),
        );
    }

    for entry in &entries {
        token.check()?;

        // Packed and forwarder entries carry no out-of-line record
        let Some(unwind_info_rva) = entry.unwind_info_rva else {
            continue;
        };

        match machine {
            MachineType::X64 => {
                amd64::parse_one_xdata(&mut parser, entry.target_start_rva, unwind_info_rva)?;
            }
            MachineType::Arm | MachineType::Arm64 => {
                arm::parse_one_xdata(&mut parser, entry.target_start_rva, unwind_info_rva)?;
            }
            MachineType::I386 => unreachable!(),
        }
    }

    let mut xdata_ranges = Vec::new();
    if let Some(range) = xdata_coff_group_range {
        xdata_ranges.push(range);
    }
    for symbol in parser.xdata_symbols.values() {
        xdata_ranges.push(RvaRange::new(symbol.rva, symbol.rva_end(), false));
    }
    let xdata_rva_ranges = RvaRangeSet::from_ranges(xdata_ranges, 8);

    // Every record discovered must land inside the final range set; a straggler means
    // the range bookkeeping and the symbol bookkeeping disagree.
    for symbol in parser.xdata_symbols.values() {
        if !xdata_rva_ranges.contains(symbol.rva) || !xdata_rva_ranges.contains(symbol.rva_end()) {
            return Err(malformed_error!(
                "xdata symbol '{}' at 0x{:X} escapes the computed xdata ranges",
                symbol.name,
                symbol.rva
            ));
        }
    }

    Ok(EhParseResult {
        pdata_rva_range: Some(pdata_range),
        pdata_symbols_by_rva: pdata_symbols,
        xdata_rva_ranges,
        xdata_symbols_by_rva: parser.xdata_symbols,
    })
}

/// The RVAs of the well-known runtime exception handlers, resolved once per parse.
#[derive(Debug, Default)]
pub(crate) struct WellKnownHandlers {
    pub cxx_frame_handler: Option<u32>,
    pub cxx_frame_handler2: Option<u32>,
    pub cxx_frame_handler3: Option<u32>,
    pub cxx_frame_handler4: Option<u32>,
    pub c_specific_handler: Option<u32>,
    pub c_specific_handler_noexcept: Option<u32>,
    pub gs_handler_check: Option<u32>,
    pub gs_handler_check_seh: Option<u32>,
    pub gs_handler_check_seh_noexcept: Option<u32>,
    pub gs_handler_check_eh: Option<u32>,
    pub gs_handler_check_eh4: Option<u32>,
}

impl WellKnownHandlers {
    fn resolve(provider: &dyn DebugSymbolProvider) -> WellKnownHandlers {
        WellKnownHandlers {
            cxx_frame_handler: provider.symbol_rva_by_name("__CxxFrameHandler"),
            cxx_frame_handler2: provider.symbol_rva_by_name("__CxxFrameHandler2"),
            cxx_frame_handler3: provider.symbol_rva_by_name("__CxxFrameHandler3"),
            cxx_frame_handler4: provider.symbol_rva_by_name("__CxxFrameHandler4"),
            c_specific_handler: provider.symbol_rva_by_name("__C_specific_handler"),
            c_specific_handler_noexcept: provider
                .symbol_rva_by_name("__C_specific_handler_noexcept"),
            gs_handler_check: provider.symbol_rva_by_name("__GSHandlerCheck"),
            gs_handler_check_seh: provider.symbol_rva_by_name("__GSHandlerCheck_SEH"),
            gs_handler_check_seh_noexcept: provider
                .symbol_rva_by_name("__GSHandlerCheck_SEH_noexcept"),
            gs_handler_check_eh: provider.symbol_rva_by_name("__GSHandlerCheck_EH"),
            gs_handler_check_eh4: provider.symbol_rva_by_name("__GSHandlerCheck_EH4"),
        }
    }
}

/// Shared state for one exception-metadata parse.
pub(crate) struct EhParser<'a> {
    pub file: &'a File,
    pub provider: &'a dyn DebugSymbolProvider,
    pub machine: MachineType,
    pub xdata_symbols: BTreeMap<u32, EhSymbol>,
    pub handlers: WellKnownHandlers,
    no_lsd_handler_rvas: Vec<u32>,
}

impl<'a> EhParser<'a> {
    fn new(
        file: &'a File,
        provider: &'a dyn DebugSymbolProvider,
        machine: MachineType,
    ) -> EhParser<'a> {
        let no_lsd_handler_rvas = NO_LANGUAGE_SPECIFIC_DATA_HANDLERS
            .iter()
            .filter_map(|name| provider.symbol_rva_by_name(name))
            .collect();

        EhParser {
            file,
            provider,
            machine,
            xdata_symbols: BTreeMap::new(),
            handlers: WellKnownHandlers::resolve(provider),
            no_lsd_handler_rvas,
        }
    }

    /// Masks the Thumb2 bit off ARM32 code addresses.
    pub fn adjusted_rva(&self, rva: u32) -> u32 {
        if self.machine == MachineType::Arm {
            rva & 0xFFFF_FFFE
        } else {
            rva
        }
    }

    /// Records one xdata symbol; first discovery of an RVA wins.
    pub fn add_xdata(&mut self, symbol: EhSymbol) {
        self.xdata_symbols.entry(symbol.rva).or_insert(symbol);
    }

    pub fn has_xdata_at(&self, rva: u32) -> bool {
        self.xdata_symbols.contains_key(&rva)
    }

    /// The name of the code symbol containing `rva`, if the provider knows one.
    ///
    /// Some binaries contain code with no symbol at all; those records get
    /// placeholder names conjured from the RVA instead.
    pub fn target_symbol_name(&self, rva: u32) -> Option<String> {
        let record = self.provider.symbol_at_rva(rva)?;
        let record_end = if record.virtual_size == 0 {
            record.rva
        } else {
            record.rva + record.virtual_size - 1
        };

        if rva >= record.rva && rva <= record_end {
            Some(record.name)
        } else {
            None
        }
    }

    /// Reads a u32 from the image at `rva`.
    pub fn read_u32_at_rva(&self, rva: u32) -> Result<u32> {
        let mut parser = Parser::new(self.file.data_at_rva_sized(rva, 4)?);
        parser.read_le::<u32>()
    }

    /// Decodes the language-specific data that follows an exception handler RVA.
    ///
    /// # Arguments
    /// * `target_name` - Name of the function owning the unwind record
    /// * `target_start_rva` - RVA of that function
    /// * `unwind_info_rva` - RVA of the unwind record being decoded
    /// * `lsd_rva` - RVA of the language-specific data (right after the handler RVA field)
    /// * `handler_rva` - The exception handler this record names
    /// * `prefix_size` - Bytes from the record start through the handler RVA field
    #[allow(clippy::too_many_arguments)]
    pub fn parse_one_exception_handler(
        &mut self,
        target_name: Option<&str>,
        target_start_rva: u32,
        unwind_info_rva: u32,
        lsd_rva: u32,
        handler_rva: u32,
        prefix_size: u32,
    ) -> Result<()> {
        let h = &self.handlers;
        let is_gseh = Some(handler_rva) == h.gs_handler_check_eh;
        let is_gseh4 = Some(handler_rva) == h.gs_handler_check_eh4;
        let is_cxx = Some(handler_rva) == h.cxx_frame_handler;
        let is_cxx2 = Some(handler_rva) == h.cxx_frame_handler2;
        let is_cxx3 = Some(handler_rva) == h.cxx_frame_handler3;
        let is_cxx4 = Some(handler_rva) == h.cxx_frame_handler4;
        let is_csh = Some(handler_rva) == h.c_specific_handler
            || Some(handler_rva) == h.c_specific_handler_noexcept;
        let is_gsseh = Some(handler_rva) == h.gs_handler_check_seh
            || Some(handler_rva) == h.gs_handler_check_seh_noexcept;
        let is_gsh = Some(handler_rva) == h.gs_handler_check;

        if !is_gseh
            && !is_gseh4
            && !is_cxx
            && !is_cxx2
            && !is_cxx3
            && !is_cxx4
            && !is_csh
            && !is_gsseh
            && !is_gsh
            && !self.no_lsd_handler_rvas.contains(&handler_rva)
        {
            // MASM-built code ends up with really strange xdata; just move along.
            let language = self.provider.language_of_symbol_at(target_start_rva);
            if language == CompilandLanguage::Masm {
                return Ok(());
            }

            // No language recorded (clang emits no compiland detail) can also carry
            // xdata this parser can't deal with - skipping keeps such binaries usable
            // at the cost of less xdata visibility.
            if language == CompilandLanguage::Unknown {
                return Ok(());
            }

            // Incrementally-linked binaries route handlers through ILTs; chase the
            // public symbol's target and retry before giving up.
            if let Some(target_rva) = self.provider.public_symbol_target_rva(handler_rva) {
                return self.parse_one_exception_handler(
                    target_name,
                    target_start_rva,
                    unwind_info_rva,
                    lsd_rva,
                    target_rva,
                    prefix_size,
                );
            }

            return Err(malformed_error!(
                "New xdata handler type found - no parser available yet. Exception handler RVA 0x{:X}, function with that handler: {} (RVA 0x{:X})",
                handler_rva,
                target_name.unwrap_or("<unknown>"),
                target_start_rva
            ));
        }

        let mut size_of_language_specific_data = 0_u32;
        let mut size_of_gs_data = 0_u32;

        if is_gseh || is_cxx || is_cxx2 || is_cxx3 {
            let cppxdata_rva = self.read_u32_at_rva(lsd_rva)?;
            if !self.has_xdata_at(cppxdata_rva) {
                self.parse_cpp_xdata_v3(target_name, target_start_rva, cppxdata_rva)?;
            }

            size_of_language_specific_data = 4; // the FuncInfo RVA
        } else if is_gseh4 || is_cxx4 {
            let cppxdata_rva = self.read_u32_at_rva(lsd_rva)?;
            if !self.has_xdata_at(cppxdata_rva) {
                fh4::parse_cpp_xdata_v4(self, target_name, target_start_rva, cppxdata_rva)?;
            }

            size_of_language_specific_data = 4; // the FuncInfo4 RVA
        } else if is_csh || is_gsseh {
            // A scope table: a count, then count records
            let scope_record_count = self.read_u32_at_rva(lsd_rva)?;
            size_of_language_specific_data = 4 + scope_record_count * SCOPE_RECORD_SIZE;
        }

        if is_gseh || is_gseh4 || is_gsseh || is_gsh {
            let gs_data_rva = if is_gseh || is_gseh4 {
                // GS data sits right after the FuncInfo RVA
                lsd_rva + 4
            } else if is_gsseh {
                // After the scope table for SEH
                lsd_rva + size_of_language_specific_data
            } else {
                // The only language-specific data there is
                lsd_rva
            };

            let gs_data = self.read_u32_at_rva(gs_data_rva)?;
            size_of_gs_data = 4 + self.gs_data_size_adjusted(gs_data);
        }

        self.add_xdata(EhSymbol::new(
            EhSymbolKind::UnwindInfo,
            unwind_info_rva,
            prefix_size + size_of_language_specific_data + size_of_gs_data,
            target_start_rva,
            target_name,
        ));

        Ok(())
    }

    /// Extra GS cookie bytes beyond the flags DWORD.
    fn gs_data_size_adjusted(&self, gs_data: u32) -> u32 {
        match self.machine {
            MachineType::X64 if gs_data & UNW_GSALIGNEDFRAME != 0 => 8,
            _ => 0,
        }
    }

    /// Decodes a `__CxxFrameHandler3`-family FuncInfo and its side tables.
    fn parse_cpp_xdata_v3(
        &mut self,
        target_name: Option<&str>,
        target_start_rva: u32,
        cppxdata_rva: u32,
    ) -> Result<()> {
        let data = self.file.data_at_rva_sized(cppxdata_rva, FUNCINFO3_SIZE as usize)?;
        let mut parser = Parser::new(data);

        let magic = parser.read_le::<u32>()?;
        if magic != EH_MAGIC_NUMBER3 {
            return Err(malformed_error!(
                "Unknown C++ EH FuncInfo magic 0x{:08X} at RVA 0x{:X} - no parser for this layout",
                magic,
                cppxdata_rva
            ));
        }

        let max_state = parser.read_le::<u32>()?;
        let unwind_map_rva = parser.read_le::<u32>()?;
        let try_blocks = parser.read_le::<u32>()?;
        let try_block_map_rva = parser.read_le::<u32>()?;
        let ip_to_state_entries = parser.read_le::<u32>()?;
        let ip_to_state_map_rva = parser.read_le::<u32>()?;

        self.add_xdata(EhSymbol::new(
            EhSymbolKind::CppXdata,
            cppxdata_rva,
            FUNCINFO3_SIZE,
            target_start_rva,
            target_name,
        ));

        if max_state > 0 && unwind_map_rva > 0 {
            self.add_xdata(EhSymbol::new(
                EhSymbolKind::StateUnwindMap,
                unwind_map_rva,
                max_state * UNWIND_MAP_ENTRY3_SIZE,
                target_start_rva,
                target_name,
            ));
        }

        if try_blocks > 0 && try_block_map_rva > 0 {
            self.add_xdata(EhSymbol::new(
                EhSymbolKind::TryMap,
                try_block_map_rva,
                try_blocks * TRY_BLOCK_MAP_ENTRY3_SIZE,
                target_start_rva,
                target_name,
            ));

            // The handler array hangs off the try block map's first entry
            let entry =
                self.file
                    .data_at_rva_sized(try_block_map_rva, TRY_BLOCK_MAP_ENTRY3_SIZE as usize)?;
            let mut entry_parser = Parser::new(entry);
            let _try_low = entry_parser.read_le::<i32>()?;
            let _try_high = entry_parser.read_le::<i32>()?;
            let _catch_high = entry_parser.read_le::<i32>()?;
            let n_catches = entry_parser.read_le::<i32>()?;
            let handler_array_rva = entry_parser.read_le::<u32>()?;

            if n_catches > 0 && handler_array_rva > 0 {
                self.add_xdata(EhSymbol::new(
                    EhSymbolKind::HandlerMap,
                    handler_array_rva,
                    n_catches as u32 * HANDLER_TYPE3_SIZE,
                    target_start_rva,
                    target_name,
                ));
            }
        }

        if ip_to_state_entries > 0 && ip_to_state_map_rva > 0 {
            self.add_xdata(EhSymbol::new(
                EhSymbolKind::IpToStateMap,
                ip_to_state_map_rva,
                ip_to_state_entries * IP_TO_STATE_MAP_ENTRY3_SIZE,
                target_start_rva,
                target_name,
            ));
        }

        Ok(())
    }
}

//! x64 exception-metadata record formats.
//!
//! pdata entries are 12-byte RUNTIME_FUNCTION records; the UNWIND_INFO they point at is
//! a byte-oriented structure with a version/flags byte, prolog description, an array of
//! 16-bit unwind codes, and then - depending on the flags - a chained parent
//! RUNTIME_FUNCTION or an exception handler RVA with language-specific data.

use super::{EhParser, PdataEntry};
use crate::{
    symbols::eh::{EhSymbol, EhSymbolKind},
    utils::synchronization::CancellationToken,
    Parser, Result,
};

/// RUNTIME_FUNCTION: `{ FunctionStartRva, FunctionEndRva, UnwindInfoRva }`.
const RUNTIME_FUNCTION_SIZE: u32 = 12;

/// The record has an exception handler.
const UNW_FLAG_EHANDLER: u8 = 0x1;
/// The record has a termination handler.
const UNW_FLAG_UHANDLER: u8 = 0x2;
/// The record chains to a parent function's unwind info.
const UNW_FLAG_CHAININFO: u8 = 0x4;

/// Walks the exception directory's RUNTIME_FUNCTION array.
pub(crate) fn parse_pdata(
    parser: &mut EhParser<'_>,
    dir_rva: u32,
    dir_size: u32,
    token: &CancellationToken,
) -> Result<Vec<PdataEntry>> {
    let count = dir_size / RUNTIME_FUNCTION_SIZE;
    let data = parser
        .file
        .data_at_rva_sized(dir_rva, (count * RUNTIME_FUNCTION_SIZE) as usize)?;
    let mut cursor = Parser::new(data);

    let mut entries = Vec::with_capacity(count as usize);
    for index in 0..count {
        token.check()?;

        let function_start_rva = cursor.read_le::<u32>()?;
        let function_end_rva = cursor.read_le::<u32>()?;
        let unwind_info_rva = cursor.read_le::<u32>()?;

        // Some pdata tables contain "empty" entries; they don't hurt anything
        if function_start_rva == 0 && function_end_rva == 0 && unwind_info_rva == 0 {
            continue;
        }

        // BBT can create chained pdata entries (low bit set); no parser for those yet
        if unwind_info_rva & 0x1 == 0x1 {
            return Err(malformed_error!(
                "Chained PDATA record at index {} (unwind RVA 0x{:X}) - no parser for BBT-chained pdata",
                index,
                unwind_info_rva
            ));
        }

        entries.push(PdataEntry {
            pdata_rva: dir_rva + index * RUNTIME_FUNCTION_SIZE,
            entry_size: RUNTIME_FUNCTION_SIZE,
            target_start_rva: function_start_rva,
            unwind_info_rva: Some(unwind_info_rva),
            kind: EhSymbolKind::Pdata,
        });
    }

    Ok(entries)
}

/// Decodes one UNWIND_INFO record and whatever hangs off it.
pub(crate) fn parse_one_xdata(
    parser: &mut EhParser<'_>,
    target_start_rva: u32,
    unwind_info_rva: u32,
) -> Result<()> {
    let data = parser.file.data_at_rva(unwind_info_rva)?;
    let mut cursor = Parser::new(data);

    let version_and_flags = cursor.read_le::<u8>()?;
    let flags = version_and_flags >> 3;
    let version = version_and_flags & 0x7;

    // Flags 0 and version 0 is a stub left behind by incremental linking or
    // incremental LTCG; only a few bytes, not material to size concerns.
    if flags == 0 && version == 0 {
        return Ok(());
    }

    // Version 2 added epilogue codes via a union, same size as version 1. Anything
    // else is a layout this parser has never seen and cannot size.
    if !(1..=2).contains(&version) {
        return Err(malformed_error!(
            "Cannot parse version {} UNWIND_INFO at RVA 0x{:X}, only versions 1 and 2 are known",
            version,
            unwind_info_rva
        ));
    }

    let _size_of_prolog = cursor.read_le::<u8>()?;
    let count_of_unwind_codes = cursor.read_le::<u8>()?;
    let _frame_register_and_offset = cursor.read_le::<u8>()?;

    cursor.advance_by(usize::from(count_of_unwind_codes) * 2)?;

    // The unwind code array is always padded to an even count
    if count_of_unwind_codes % 2 == 1 {
        cursor.advance_by(2)?;
    }

    let prefix_size = cursor.pos() as u32;
    let target_name = parser.target_symbol_name(target_start_rva);

    if flags & UNW_FLAG_CHAININFO != 0 {
        parse_one_chain_info(
            parser,
            target_name.as_deref(),
            target_start_rva,
            unwind_info_rva,
            &mut cursor,
            prefix_size,
        )
    } else if flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0 {
        let handler_rva = cursor.read_le::<u32>()?;
        parser.parse_one_exception_handler(
            target_name.as_deref(),
            target_start_rva,
            unwind_info_rva,
            unwind_info_rva + prefix_size + 4,
            handler_rva,
            prefix_size + 4,
        )
    } else {
        // Just a simple unwind record
        parser.add_xdata(EhSymbol::new(
            EhSymbolKind::UnwindInfo,
            unwind_info_rva,
            prefix_size,
            target_start_rva,
            target_name.as_deref(),
        ));
        Ok(())
    }
}

/// Decodes the chained RUNTIME_FUNCTION embedded after the unwind codes, then
/// recursively decodes the parent's unwind record.
///
/// Chains appear when the compiler splits one logical unwind region (such as
/// `_RTC_Initialize`) into multiple non-contiguous runtime table entries that
/// share a single parent record.
fn parse_one_chain_info(
    parser: &mut EhParser<'_>,
    target_name: Option<&str>,
    target_start_rva: u32,
    unwind_info_rva: u32,
    cursor: &mut Parser<'_>,
    prefix_size: u32,
) -> Result<()> {
    let chain_function_start = cursor.read_le::<u32>()?;
    let _chain_function_end = cursor.read_le::<u32>()?;
    let chain_unwind_info_rva = cursor.read_le::<u32>()?;

    parser.add_xdata(EhSymbol::new(
        EhSymbolKind::ChainUnwindInfo,
        unwind_info_rva,
        prefix_size + RUNTIME_FUNCTION_SIZE,
        target_start_rva,
        target_name,
    ));

    parse_one_xdata(parser, chain_function_start, chain_unwind_info_rva)
}

//! Parsers for the PE metadata the debug-symbol provider cannot see.
//!
//! The debug database attributes compiler-emitted bytes well, but several regions of a
//! PE image are synthesized by the linker with no symbol coverage at all: the exception
//! directory and its unwind metadata ([`eh`]), the Win32 resource tree ([`rsrc`]), the
//! import machinery ([`imports`]), and a handful of other data directories handled
//! here - base relocations, debug payloads, and the Control Flow Guard tables found
//! through the load-config directory.
//!
//! Each parser produces RVA-keyed symbol tables; the session merges them with
//! provider-native symbols at query time. The three families are independent of each
//! other and are parsed in parallel at session-open time.

pub mod eh;
pub mod imports;
pub mod rsrc;

use std::collections::BTreeMap;

use crate::{
    file::File,
    ranges::{RvaRange, RvaRangeSet},
    symbols::pe::PeSymbol,
    Parser, Result,
};

pub use eh::{parse_eh_symbols, EhParseResult};
pub use imports::DelayLoadRanges;
pub use rsrc::{parse_rsrc, RsrcParseResult};

/// IMAGE_GUARD_CF_FUNCTION_TABLE_SIZE_MASK: how many extra bytes each guard table
/// entry carries beyond its RVA.
const GUARD_CF_TABLE_SIZE_MASK: u32 = 0xF000_0000;
const GUARD_CF_TABLE_SIZE_SHIFT: u32 = 28;

/// The import-table and directory symbols, with their lookup ranges.
#[derive(Debug, Default)]
pub struct OtherPeSymbolsResult {
    /// Every symbol, keyed by RVA
    pub symbols_by_rva: BTreeMap<u32, PeSymbol>,
    /// The symbols' extents coalesced into a region set (16-byte merge padding, the
    /// widest inter-record alignment the linker emits in these regions)
    pub ranges: RvaRangeSet,
    /// Per-directory span symbols, kept separately for callers that want the
    /// directory-level view
    pub directory_symbols: Vec<PeSymbol>,
    /// The delay-load regions retained for attribution
    pub delay_load: DelayLoadRanges,
}

/// Parses import tables and the non-EH, non-rsrc data directories.
///
/// # Errors
///
/// Fails when directory bytes are unreadable or records decode out of bounds.
pub fn parse_other_pe_symbols(file: &File) -> Result<OtherPeSymbolsResult> {
    let mut result = OtherPeSymbolsResult::default();

    // 0: Exports - the directory span is enough, the contents are visible via
    //    the provider's public symbols
    add_directory_symbol(file, &mut result, 0, "Exports");

    // 1 and 13: import and delay-load tables, parsed record by record - the
    // descriptors give far better names than one directory-wide symbol would
    result.delay_load = imports::parse_import_tables(file, &mut result.symbols_by_rva)?;
    if let Some((rva, size)) = file.data_directory(13) {
        result
            .directory_symbols
            .push(PeSymbol::directory(rva, size, "Delay Load Imports"));
    }

    // 5: Base relocations
    add_directory_symbol(file, &mut result, 5, "Base Relocation Table");

    // 6: Debug directory plus one symbol per entry payload
    parse_debug_directory(file, &mut result)?;

    // 10: Load config, including the CFG tables it points at
    parse_load_config_directory(file, &mut result)?;

    let mut ranges: Vec<RvaRange> = Vec::with_capacity(result.symbols_by_rva.len());
    for symbol in result.symbols_by_rva.values() {
        ranges.push(RvaRange::new(symbol.rva, symbol.rva_end(), false));
    }
    result.ranges = RvaRangeSet::from_ranges(ranges, 16);

    Ok(result)
}

/// Adds a whole-directory symbol to both the per-RVA table and the directory list.
fn add_directory_symbol(file: &File, result: &mut OtherPeSymbolsResult, index: usize, name: &str) {
    if let Some((rva, size)) = file.data_directory(index) {
        let symbol = PeSymbol::directory(rva, size, name);
        result.directory_symbols.push(symbol.clone());
        result.symbols_by_rva.entry(rva).or_insert(symbol);
    }
}

/// Attributes the debug directory and each entry's payload bytes.
fn parse_debug_directory(file: &File, result: &mut OtherPeSymbolsResult) -> Result<()> {
    add_directory_symbol(file, result, 6, "Debug");

    for entry in file.debug_directories()? {
        // Zero-size entries exist (ILTCG with no incremental link having happened);
        // nothing to attribute there
        if entry.size_of_data == 0 || entry.address_of_raw_data == 0 {
            continue;
        }

        let symbol = PeSymbol::directory(
            entry.address_of_raw_data,
            entry.size_of_data,
            &format!("[Debug Directory] {}", entry.type_name()),
        );
        result.directory_symbols.push(symbol.clone());
        result
            .symbols_by_rva
            .entry(symbol.rva)
            .or_insert(symbol);
    }

    Ok(())
}

/// Attributes the load-config directory and the Control Flow Guard tables it references.
///
/// The directory-entry size recorded in the optional header is historically
/// untrustworthy (observed smaller than the structure's own Size field), so field reads
/// are gated on the bytes actually being present rather than on the claimed size alone.
fn parse_load_config_directory(file: &File, result: &mut OtherPeSymbolsResult) -> Result<()> {
    let Some((dir_rva, dir_size)) = file.data_directory(10) else {
        return Ok(());
    };

    add_directory_symbol(file, result, 10, "Load Config");

    let image_base = file.imagebase();
    let is_64bit = file.bytes_per_word() == 8;

    // Field offsets in IMAGE_LOAD_CONFIG_DIRECTORY{32,64}
    let (guard_table_offset, guard_count_offset, guard_flags_offset, v2_size, v3_size) =
        if is_64bit {
            (0x80_usize, 0x88_usize, 0x90_usize, 0x94_u32, 0xB0_u32)
        } else {
            (0x50, 0x54, 0x58, 0x5C, 0x70)
        };
    let (iat_table_offset, iat_count_offset) = if is_64bit {
        (0xA0_usize, 0xA8_usize)
    } else {
        (0x68, 0x6C)
    };

    let available = dir_size.min(v3_size);
    let data = file.data_at_rva_sized(dir_rva, available as usize)?;

    let read_word = |offset: usize| -> Result<u64> {
        let mut parser = Parser::new(data);
        parser.seek(offset)?;
        if is_64bit {
            parser.read_le::<u64>()
        } else {
            Ok(u64::from(parser.read_le::<u32>()?))
        }
    };
    let read_u32 = |offset: usize| -> Result<u32> {
        let mut parser = Parser::new(data);
        parser.seek(offset)?;
        parser.read_le::<u32>()
    };

    if dir_size >= v2_size {
        let guard_table_va = read_word(guard_table_offset)?;
        let guard_count = read_word(guard_count_offset)?;
        let guard_flags = read_u32(guard_flags_offset)?;

        if guard_table_va != 0 && guard_count != 0 {
            add_guard_table(result, guard_table_va, guard_count, guard_flags, image_base, "FID Table");
        }
    }

    if dir_size >= v3_size {
        let iat_table_va = read_word(iat_table_offset)?;
        let iat_count = read_word(iat_count_offset)?;
        let guard_flags = read_u32(guard_flags_offset)?;

        if iat_table_va != 0 && iat_count != 0 {
            add_guard_table(
                result,
                iat_table_va,
                iat_count,
                guard_flags,
                image_base,
                "IAT Address-Taken Table",
            );
        }
    }

    Ok(())
}

fn add_guard_table(
    result: &mut OtherPeSymbolsResult,
    table_va: u64,
    count: u64,
    guard_flags: u32,
    image_base: u64,
    name: &str,
) {
    let Some(table_rva) = table_va.checked_sub(image_base) else {
        return;
    };

    let extra_bytes_per_entry = (guard_flags & GUARD_CF_TABLE_SIZE_MASK) >> GUARD_CF_TABLE_SIZE_SHIFT;
    let stride = 4 + extra_bytes_per_entry;
    let table_size = (count as u32) * stride;

    let symbol = PeSymbol::load_config_table(table_rva as u32, table_size, name);
    result.symbols_by_rva.entry(symbol.rva).or_insert(symbol);
}

//! Import and delay-load import table parsing.
//!
//! The import machinery occupies a surprising number of byte regions: the descriptor
//! array, the DLL name strings, the import name table (INT) and import address table
//! (IAT) thunk chains, and the hint/name records the thunks point at. The debug-symbol
//! provider sees none of them, so each record becomes a [`PeSymbol`] here.
//!
//! Delay-loaded imports duplicate the whole structure behind a different descriptor
//! layout; their thunk, string and module-handle ranges are additionally retained as
//! coalesced range sets because those regions interleave with compiler-emitted data
//! the provider *does* see.

use std::collections::BTreeMap;

use crate::{
    file::File,
    ranges::{RvaRange, RvaRangeSet},
    symbols::pe::PeSymbol,
    Parser, Result,
};

/// IMAGE_IMPORT_DESCRIPTOR is 5 DWORDs.
const IMPORT_DESCRIPTOR_SIZE: u32 = 20;
/// IMAGE_DELAYLOAD_DESCRIPTOR is 8 DWORDs.
const DELAYLOAD_DESCRIPTOR_SIZE: u32 = 32;

/// The delay-load byte regions retained for later attribution.
#[derive(Debug, Default)]
pub struct DelayLoadRanges {
    /// INT and IAT thunk slots across all delay-loaded DLLs
    pub thunk_ranges: RvaRangeSet,
    /// DLL name and hint/name strings
    pub string_ranges: RvaRangeSet,
    /// The per-DLL module handle slots
    pub module_handle_ranges: RvaRangeSet,
}

/// Parses the import and delay-load import directories into `symbols`.
///
/// Inserts one symbol per descriptor, thunk slot, hint/name record and referenced
/// string. Duplicate discoveries at one RVA (strings shared between tables) keep the
/// first symbol.
///
/// # Errors
///
/// Fails when directory bytes are unreadable or a record decodes out of bounds.
pub fn parse_import_tables(
    file: &File,
    symbols: &mut BTreeMap<u32, PeSymbol>,
) -> Result<DelayLoadRanges> {
    if let Some((dir_rva, dir_size)) = file.data_directory(1) {
        parse_import_directory(file, dir_rva, dir_size, symbols)?;
    }

    let mut delay_ranges = DelayLoadRanges::default();
    if let Some((dir_rva, dir_size)) = file.data_directory(13) {
        parse_delay_load_directory(file, dir_rva, dir_size, symbols, &mut delay_ranges)?;
    }

    Ok(delay_ranges)
}

fn add_symbol(symbols: &mut BTreeMap<u32, PeSymbol>, symbol: PeSymbol) {
    symbols.entry(symbol.rva).or_insert(symbol);
}

fn read_cstring_at(file: &File, rva: u32) -> Result<String> {
    let mut parser = Parser::new(file.data_at_rva(rva)?);
    parser.read_string_utf8()
}

/// Reads one thunk slot's value, widened to u64.
fn read_thunk_value(file: &File, rva: u32, bytes_per_word: u32) -> Result<u64> {
    let data = file.data_at_rva_sized(rva, bytes_per_word as usize)?;
    let mut parser = Parser::new(data);
    if bytes_per_word == 8 {
        parser.read_le::<u64>()
    } else {
        Ok(u64::from(parser.read_le::<u32>()?))
    }
}

/// Decodes a thunk value into (ordinal, is_ordinal_only, address_of_data).
fn decode_thunk(value: u64, bytes_per_word: u32) -> (u16, bool, u32) {
    let ordinal = (value & 0xFFFF) as u16;
    let is_ordinal_only = if bytes_per_word == 8 {
        value & (1_u64 << 63) != 0
    } else {
        value & (1_u64 << 31) != 0
    };

    (ordinal, is_ordinal_only, value as u32)
}

/// Walks the IMAGE_IMPORT_DESCRIPTOR array.
fn parse_import_directory(
    file: &File,
    dir_rva: u32,
    dir_size: u32,
    symbols: &mut BTreeMap<u32, PeSymbol>,
) -> Result<()> {
    let bytes_per_word = file.bytes_per_word();
    let thunk_size = bytes_per_word;

    let mut descriptor_rva = dir_rva;
    while descriptor_rva < dir_rva + dir_size {
        let data = file.data_at_rva_sized(descriptor_rva, IMPORT_DESCRIPTOR_SIZE as usize)?;
        let mut parser = Parser::new(data);
        let original_first_thunk = parser.read_le::<u32>()?;
        let _time_date_stamp = parser.read_le::<u32>()?;
        let _forwarder_chain = parser.read_le::<u32>()?;
        let name_rva = parser.read_le::<u32>()?;
        let _first_thunk = parser.read_le::<u32>()?;

        if name_rva == 0 || original_first_thunk == 0 {
            add_symbol(
                symbols,
                PeSymbol::import_descriptor(descriptor_rva, IMPORT_DESCRIPTOR_SIZE, "null terminator"),
            );
            break;
        }

        // The descriptor name is the module being imported, like "kernel32.dll"
        let descriptor_name = read_cstring_at(file, name_rva)?;
        add_symbol(
            symbols,
            PeSymbol::import_descriptor(descriptor_rva, IMPORT_DESCRIPTOR_SIZE, &descriptor_name),
        );
        add_symbol(
            symbols,
            PeSymbol::import_string(name_rva, descriptor_name.len() as u32 + 1, &descriptor_name),
        );

        // The INT holds the unresolved imports; the IAT's symbols are visible to the
        // debug-symbol provider, so only the INT is walked here.
        let mut thunk_rva = original_first_thunk;
        loop {
            let value = read_thunk_value(file, thunk_rva, bytes_per_word)?;
            let (ordinal, is_ordinal_only, address_of_data) = decode_thunk(value, bytes_per_word);

            if ordinal == 0 {
                add_symbol(
                    symbols,
                    PeSymbol::import_thunk(
                        thunk_rva,
                        thunk_size,
                        0,
                        &descriptor_name,
                        Some("null terminator"),
                    ),
                );
                break;
            } else if is_ordinal_only {
                add_symbol(
                    symbols,
                    PeSymbol::import_thunk(thunk_rva, thunk_size, ordinal, &descriptor_name, None),
                );
            } else {
                let (hint, function) = read_hint_name(file, address_of_data)?;
                add_symbol(
                    symbols,
                    PeSymbol::import_thunk(
                        thunk_rva,
                        thunk_size,
                        hint,
                        &descriptor_name,
                        Some(&function),
                    ),
                );
                add_symbol(
                    symbols,
                    PeSymbol::import_by_name(
                        address_of_data,
                        function.len() as u32 + 1 + 2,
                        hint,
                        &descriptor_name,
                        &function,
                    ),
                );
            }

            thunk_rva += thunk_size;
        }

        descriptor_rva += IMPORT_DESCRIPTOR_SIZE;
    }

    Ok(())
}

/// Reads an IMAGE_IMPORT_BY_NAME record: u16 hint, then the function name.
fn read_hint_name(file: &File, rva: u32) -> Result<(u16, String)> {
    let mut parser = Parser::new(file.data_at_rva(rva)?);
    let hint = parser.read_le::<u16>()?;
    let function = parser.read_string_utf8()?;

    Ok((hint, function))
}

/// Walks the IMAGE_DELAYLOAD_DESCRIPTOR array.
fn parse_delay_load_directory(
    file: &File,
    dir_rva: u32,
    dir_size: u32,
    symbols: &mut BTreeMap<u32, PeSymbol>,
    delay_ranges: &mut DelayLoadRanges,
) -> Result<()> {
    let bytes_per_word = file.bytes_per_word();
    let thunk_size = bytes_per_word;

    let mut thunks: Vec<RvaRange> = Vec::new();
    let mut strings: Vec<RvaRange> = Vec::new();
    let mut module_handles: Vec<RvaRange> = Vec::new();

    let mut descriptor_rva = dir_rva;
    while descriptor_rva < dir_rva + dir_size {
        let data = file.data_at_rva_sized(descriptor_rva, DELAYLOAD_DESCRIPTOR_SIZE as usize)?;
        let mut parser = Parser::new(data);
        let _attributes = parser.read_le::<u32>()?;
        let dll_name_rva = parser.read_le::<u32>()?;
        let module_handle_rva = parser.read_le::<u32>()?;
        let iat_rva = parser.read_le::<u32>()?;
        let int_rva = parser.read_le::<u32>()?;

        if dll_name_rva == 0 || iat_rva == 0 || int_rva == 0 {
            add_symbol(
                symbols,
                PeSymbol::import_descriptor(descriptor_rva, DELAYLOAD_DESCRIPTOR_SIZE, "null terminator"),
            );
            break;
        }

        let descriptor_name = read_cstring_at(file, dll_name_rva)?;
        add_symbol(
            symbols,
            PeSymbol::import_descriptor(descriptor_rva, DELAYLOAD_DESCRIPTOR_SIZE, &descriptor_name),
        );

        let name_string =
            PeSymbol::import_string(dll_name_rva, descriptor_name.len() as u32 + 1, &descriptor_name);
        strings.push(RvaRange::from_rva_and_size(
            name_string.rva,
            name_string.size,
            false,
        ));
        add_symbol(symbols, name_string);

        if module_handle_rva != 0 {
            module_handles.push(RvaRange::from_rva_and_size(
                module_handle_rva,
                bytes_per_word,
                false,
            ));
        }

        // Both the INT and IAT slots get symbols; they terminate together.
        let mut int_slot_rva = int_rva;
        let mut iat_slot_rva = iat_rva;
        loop {
            let value = read_thunk_value(file, int_slot_rva, bytes_per_word)?;
            let (ordinal, is_ordinal_only, address_of_data) = decode_thunk(value, bytes_per_word);

            if ordinal == 0 {
                for (rva, label) in [(int_slot_rva, "INT null terminator"), (iat_slot_rva, "IAT null terminator")] {
                    let thunk = PeSymbol::import_thunk(rva, thunk_size, 0, &descriptor_name, Some(label));
                    thunks.push(RvaRange::from_rva_and_size(thunk.rva, thunk.size, false));
                    add_symbol(symbols, thunk);
                }
                break;
            }

            let (hint, function) = if is_ordinal_only {
                (ordinal, None)
            } else {
                let (hint, function) = read_hint_name(file, address_of_data)?;
                let by_name = PeSymbol::import_by_name(
                    address_of_data,
                    function.len() as u32 + 1 + 2,
                    hint,
                    &descriptor_name,
                    &function,
                );
                strings.push(RvaRange::from_rva_and_size(by_name.rva, by_name.size, false));
                add_symbol(symbols, by_name);
                (hint, Some(function))
            };

            for rva in [int_slot_rva, iat_slot_rva] {
                let thunk = PeSymbol::import_thunk(
                    rva,
                    thunk_size,
                    hint,
                    &descriptor_name,
                    function.as_deref(),
                );
                thunks.push(RvaRange::from_rva_and_size(thunk.rva, thunk.size, false));
                add_symbol(symbols, thunk);
            }

            int_slot_rva += thunk_size;
            iat_slot_rva += thunk_size;
        }

        descriptor_rva += DELAYLOAD_DESCRIPTOR_SIZE;
    }

    if !thunks.is_empty() {
        delay_ranges.thunk_ranges = RvaRangeSet::from_ranges(thunks, 8);
    }
    if !strings.is_empty() {
        delay_ranges.string_ranges = RvaRangeSet::from_ranges(strings, 8);
    }
    if !module_handles.is_empty() {
        delay_ranges.module_handle_ranges = RvaRangeSet::from_ranges(module_handles, 8);
    }

    Ok(())
}

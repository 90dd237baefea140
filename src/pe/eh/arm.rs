//! ARM32 and ARM64 exception-metadata record formats.
//!
//! ARM pdata entries are 8 bytes: a function start RVA and an "EH metadata" word whose
//! low two bits select the entry form. The exception-information form points at an
//! out-of-line xdata record (like x64); the packed forms compress the whole unwind
//! description into the entry itself; the forwarder form is a linker-emitted alias for
//! another entry. Only the exception-information form generates xdata.
//!
//! The xdata record's leading word (ARM32 and ARM64 differ in exactly where the bit
//! fields sit) describes epilog scopes and unwind code words, with an extended
//! second-word form when the counts overflow the header bits, optionally followed by an
//! exception handler RVA that feeds the shared handler parsing.

use super::{EhParser, PdataEntry};
use crate::{
    file::MachineType,
    symbols::eh::{EhSymbol, EhSymbolKind},
    utils::synchronization::CancellationToken,
    Parser, Result,
};

/// ARM RUNTIME_FUNCTION: `{ FunctionStartRva, EHMetadata }`.
const ARM_RUNTIME_FUNCTION_SIZE: u32 = 8;

/// The second pdata word is an exception-information RVA (low two bits implicitly 0).
const PDATA_FLAG_EXCEPTION_INFO: u32 = 0x0;
/// The entry forwards to another pdata record.
const PDATA_FLAG_FORWARDER: u32 = 0x3;

/// Walks the exception directory's ARM RUNTIME_FUNCTION array.
pub(crate) fn parse_pdata(
    parser: &mut EhParser<'_>,
    dir_rva: u32,
    dir_size: u32,
    token: &CancellationToken,
) -> Result<Vec<PdataEntry>> {
    let count = dir_size / ARM_RUNTIME_FUNCTION_SIZE;
    let data = parser
        .file
        .data_at_rva_sized(dir_rva, (count * ARM_RUNTIME_FUNCTION_SIZE) as usize)?;
    let mut cursor = Parser::new(data);

    let mut entries = Vec::with_capacity(count as usize);
    for index in 0..count {
        token.check()?;

        let function_start_rva = cursor.read_le::<u32>()?;
        let eh_metadata = cursor.read_le::<u32>()?;

        // Empty entries were first seen on AMD64; tolerate them here too
        if function_start_rva == 0 && eh_metadata == 0 {
            continue;
        }

        let pdata_rva = dir_rva + index * ARM_RUNTIME_FUNCTION_SIZE;
        let target_start_rva = parser.adjusted_rva(function_start_rva);

        let entry = match eh_metadata & 0x3 {
            PDATA_FLAG_EXCEPTION_INFO => PdataEntry {
                pdata_rva,
                entry_size: ARM_RUNTIME_FUNCTION_SIZE,
                target_start_rva,
                unwind_info_rva: Some(eh_metadata),
                kind: EhSymbolKind::Pdata,
            },
            PDATA_FLAG_FORWARDER => PdataEntry {
                pdata_rva,
                entry_size: ARM_RUNTIME_FUNCTION_SIZE,
                target_start_rva,
                unwind_info_rva: None,
                kind: EhSymbolKind::ForwarderPdata,
            },
            _ => PdataEntry {
                pdata_rva,
                entry_size: ARM_RUNTIME_FUNCTION_SIZE,
                target_start_rva,
                unwind_info_rva: None,
                kind: EhSymbolKind::PackedUnwindDataPdata,
            },
        };

        entries.push(entry);
    }

    Ok(entries)
}

/// Decodes one out-of-line xdata record.
pub(crate) fn parse_one_xdata(
    parser: &mut EhParser<'_>,
    target_start_rva: u32,
    eh_metadata_rva: u32,
) -> Result<()> {
    let first_word = parser.read_u32_at_rva(eh_metadata_rva)?;

    // Bits 18-19 are the version; only version 0 is permitted by the format today
    let version = (first_word >> 18) & 0x3;
    if version != 0 {
        return Err(malformed_error!(
            "Cannot parse version {} ARM exception data at RVA 0x{:X}, only version 0 is known",
            version,
            eh_metadata_rva
        ));
    }

    let has_exception_handler = (first_word >> 20) & 0x1 == 1;
    let record_size = xdata_record_size(parser, eh_metadata_rva)?;
    let target_name = parser.target_symbol_name(target_start_rva);

    if has_exception_handler {
        let handler_field_rva = eh_metadata_rva + record_size - 4;
        let handler_rva = parser.adjusted_rva(parser.read_u32_at_rva(handler_field_rva)?);
        parser.parse_one_exception_handler(
            target_name.as_deref(),
            target_start_rva,
            eh_metadata_rva,
            handler_field_rva + 4,
            handler_rva,
            record_size,
        )
    } else {
        // Just a simple unwind record
        parser.add_xdata(EhSymbol::new(
            EhSymbolKind::UnwindInfo,
            eh_metadata_rva,
            record_size,
            target_start_rva,
            target_name.as_deref(),
        ));
        Ok(())
    }
}

/// Computes the byte size of one ARM xdata record from its header word(s).
fn xdata_record_size(parser: &EhParser<'_>, xdata_rva: u32) -> Result<u32> {
    let data = parser.file.data_at_rva(xdata_rva)?;
    let mut cursor = Parser::new(data);
    let first_word = cursor.read_le::<u32>()?;

    let is_arm32 = parser.machine == MachineType::Arm;
    let has_exception_handler = (first_word >> 20) & 0x1 == 1;
    let has_single_epilog_scope = (first_word >> 21) & 0x1 == 1;

    // All of the epilog-count and unwind-code-word bits together; all zero means the
    // extended counts in the second word are in play
    let epilog_and_unwind_codes = if is_arm32 {
        (first_word >> 23) & 0x1FF
    } else {
        (first_word >> 22) & 0x3FF
    };

    let mut record_size;
    let epilog_scope_count;
    let unwind_code_words;

    if epilog_and_unwind_codes != 0 {
        record_size = 4;
        if is_arm32 {
            epilog_scope_count = (first_word >> 23) & 0x1F;
            unwind_code_words = (first_word >> 28) & 0xF;
        } else {
            epilog_scope_count = (first_word >> 22) & 0x1F;
            unwind_code_words = (first_word >> 27) & 0x1F;
        }
    } else {
        record_size = 8;
        let second_word = cursor.read_le::<u32>()?;
        epilog_scope_count = second_word & 0xFFFF;
        unwind_code_words = (second_word >> 16) & 0xFF;
    }

    // The E bit packs a single epilog scope into the header; otherwise each scope
    // takes a word of its own
    if !has_single_epilog_scope {
        record_size += 4 * epilog_scope_count;
    }

    record_size += 4 * unwind_code_words;

    if has_exception_handler {
        record_size += 4;
    }

    Ok(record_size)
}

//! `__CxxFrameHandler4` compressed C++ EH metadata decoding.
//!
//! The VS2019+ toolchain shrank C++ EH metadata by replacing the fixed FuncInfo layout
//! with a bit-flagged header and compressed unsigned integers (see
//! [`crate::Parser::read_encoded_unsigned`]). Record sizes are therefore only knowable
//! by decoding: every map is a count followed by variably-sized entries, and the symbol
//! sizes reported here are the exact byte spans the decoder consumed.
//!
//! Compared to FH3, catch-handler records additionally embed continuation addresses,
//! and PGO-separated functions gain a per-segment table of IP-to-state maps
//! ([`crate::symbols::eh::EhSymbolKind::SeparatedIpToStateMap`]) - chain-unwind already
//! lets the separated blocks share one UnwindInfo/CppXdata pair, so only the IP maps
//! need the extra indirection.

use super::EhParser;
use crate::{
    symbols::eh::{EhSymbol, EhSymbolKind},
    Parser, Result,
};

// FuncInfo4 header bits
const HEADER_IS_CATCH: u8 = 1 << 0;
const HEADER_IS_SEPARATED: u8 = 1 << 1;
const HEADER_BBT: u8 = 1 << 2;
const HEADER_UNWIND_MAP: u8 = 1 << 3;
const HEADER_TRY_BLOCK_MAP: u8 = 1 << 4;

// HandlerMapEntry4 header bits
const HANDLER_HAS_ADJECTIVES: u8 = 1 << 0;
const HANDLER_HAS_DISP_TYPE: u8 = 1 << 1;
const HANDLER_HAS_DISP_CATCH_OBJ: u8 = 1 << 2;
const HANDLER_CONT_IS_RVA: u8 = 1 << 3;

// UnwindMapEntry4 entry types (low two bits of the offset/type word)
const UNWIND_ENTRY_DTOR_WITH_OBJ: u32 = 0b01;
const UNWIND_ENTRY_DTOR_WITH_PTR_TO_OBJ: u32 = 0b10;
const UNWIND_ENTRY_RVA: u32 = 0b11;

/// A cursor over the whole image positioned at `rva`.
///
/// FH4 decoding runs against absolute image offsets rather than per-record slices
/// because the compressed-unsigned encoding reads a 32-bit window that can begin
/// before the encoded run itself.
fn image_cursor_at<'a>(parser: &EhParser<'a>, rva: u32) -> Result<Parser<'a>> {
    let offset = parser.file.rva_to_offset(rva)?;
    let mut cursor = Parser::new(parser.file.data());
    cursor.seek(offset)?;
    Ok(cursor)
}

/// Decodes a FuncInfo4 and every side table it references into xdata symbols.
pub(crate) fn parse_cpp_xdata_v4(
    parser: &mut EhParser<'_>,
    target_name: Option<&str>,
    target_start_rva: u32,
    cppxdata_rva: u32,
) -> Result<()> {
    let mut cursor = image_cursor_at(parser, cppxdata_rva)?;
    let start = cursor.pos();

    let header = cursor.read_le::<u8>()?;

    if header & HEADER_BBT != 0 {
        let _bbt_flags = cursor.read_encoded_unsigned()?;
    }

    let mut disp_unwind_map = 0_u32;
    if header & HEADER_UNWIND_MAP != 0 {
        disp_unwind_map = cursor.read_le::<i32>()? as u32;
    }

    let mut disp_try_block_map = 0_u32;
    if header & HEADER_TRY_BLOCK_MAP != 0 {
        disp_try_block_map = cursor.read_le::<i32>()? as u32;
    }

    let disp_ip_to_state_map = cursor.read_le::<i32>()? as u32;

    if header & HEADER_IS_CATCH != 0 {
        let _disp_frame = cursor.read_encoded_unsigned()?;
    }

    let funcinfo_size = (cursor.pos() - start) as u32;
    parser.add_xdata(EhSymbol::new(
        EhSymbolKind::CppXdata,
        cppxdata_rva,
        funcinfo_size,
        target_start_rva,
        target_name,
    ));

    if header & HEADER_UNWIND_MAP != 0 && disp_unwind_map != 0 {
        let size = unwind_map_size(parser, disp_unwind_map)?;
        parser.add_xdata(EhSymbol::new(
            EhSymbolKind::StateUnwindMap,
            disp_unwind_map,
            size,
            target_start_rva,
            target_name,
        ));
    }

    if header & HEADER_TRY_BLOCK_MAP != 0
        && disp_try_block_map != 0
        && !parser.has_xdata_at(disp_try_block_map)
    {
        let (size, handler_array_rvas) = try_block_map(parser, disp_try_block_map)?;
        parser.add_xdata(EhSymbol::new(
            EhSymbolKind::TryMap,
            disp_try_block_map,
            size,
            target_start_rva,
            target_name,
        ));

        for handler_array_rva in handler_array_rvas {
            if handler_array_rva != 0 {
                let size = handler_map_size(parser, handler_array_rva)?;
                parser.add_xdata(EhSymbol::new(
                    EhSymbolKind::HandlerMap,
                    handler_array_rva,
                    size,
                    target_start_rva,
                    target_name,
                ));
            }
        }
    }

    if disp_ip_to_state_map == 0 {
        return Ok(());
    }

    // PGO-separated functions carry a table of (segment start, IP map) pairs; everything
    // else has a single IP-to-state map for the whole function.
    if header & HEADER_IS_SEPARATED != 0 {
        let (seg_table_size, segments) = separated_ip_to_state_map(parser, disp_ip_to_state_map)?;
        parser.add_xdata(EhSymbol::new(
            EhSymbolKind::SeparatedIpToStateMap,
            disp_ip_to_state_map,
            seg_table_size,
            target_start_rva,
            target_name,
        ));

        for (segment_start_rva, disp_of_ip_map) in segments {
            if disp_of_ip_map != 0 {
                let size = ip_to_state_map_size(parser, disp_of_ip_map)?;
                parser.add_xdata(EhSymbol::new(
                    EhSymbolKind::IpToStateMap,
                    disp_of_ip_map,
                    size,
                    segment_start_rva,
                    target_name,
                ));
            }
        }
    } else {
        let size = ip_to_state_map_size(parser, disp_ip_to_state_map)?;
        parser.add_xdata(EhSymbol::new(
            EhSymbolKind::IpToStateMap,
            disp_ip_to_state_map,
            size,
            target_start_rva,
            target_name,
        ));
    }

    Ok(())
}

/// Consumed size of an UnwindMap4: count, then per-entry fields selected by the
/// entry's type bits.
fn unwind_map_size(parser: &EhParser<'_>, rva: u32) -> Result<u32> {
    let mut cursor = image_cursor_at(parser, rva)?;
    let start = cursor.pos();

    let num_entries = cursor.read_encoded_unsigned()?;
    for _ in 0..num_entries {
        let offset_and_type = cursor.read_encoded_unsigned()?;
        match offset_and_type & 0b11 {
            UNWIND_ENTRY_DTOR_WITH_OBJ | UNWIND_ENTRY_DTOR_WITH_PTR_TO_OBJ => {
                let _action = cursor.read_le::<i32>()?;
                let _object = cursor.read_encoded_unsigned()?;
            }
            UNWIND_ENTRY_RVA => {
                let _action = cursor.read_le::<i32>()?;
            }
            _ => {} // NoUW carries nothing beyond the type word
        }
    }

    Ok((cursor.pos() - start) as u32)
}

/// Consumed size of a TryBlockMap4 plus the handler-array RVAs its entries reference.
fn try_block_map(parser: &EhParser<'_>, rva: u32) -> Result<(u32, Vec<u32>)> {
    let mut cursor = image_cursor_at(parser, rva)?;
    let start = cursor.pos();

    let num_try_blocks = cursor.read_encoded_unsigned()?;
    let mut handler_array_rvas = Vec::with_capacity(num_try_blocks as usize);
    for _ in 0..num_try_blocks {
        let _try_low = cursor.read_encoded_unsigned()?;
        let _try_high = cursor.read_encoded_unsigned()?;
        let _catch_high = cursor.read_encoded_unsigned()?;
        handler_array_rvas.push(cursor.read_le::<i32>()? as u32);
    }

    Ok(((cursor.pos() - start) as u32, handler_array_rvas))
}

/// Consumed size of a HandlerMap4: count, then per-entry fields selected by each
/// entry's header byte.
fn handler_map_size(parser: &EhParser<'_>, rva: u32) -> Result<u32> {
    let mut cursor = image_cursor_at(parser, rva)?;
    let start = cursor.pos();

    let num_handlers = cursor.read_encoded_unsigned()?;
    for _ in 0..num_handlers {
        let header = cursor.read_le::<u8>()?;

        if header & HANDLER_HAS_ADJECTIVES != 0 {
            let _adjectives = cursor.read_encoded_unsigned()?;
        }
        if header & HANDLER_HAS_DISP_TYPE != 0 {
            let _disp_type = cursor.read_le::<i32>()?;
        }
        if header & HANDLER_HAS_DISP_CATCH_OBJ != 0 {
            let _disp_catch_obj = cursor.read_encoded_unsigned()?;
        }

        let _disp_of_handler = cursor.read_le::<i32>()?;

        // Bits 4-5 select zero, one or two continuation addresses; bit 3 selects
        // whether they're RVAs (separated code) or function-relative values
        let continuation_count = match (header & 0b0011_0000) >> 4 {
            0b01 => 1,
            0b10 => 2,
            _ => 0,
        };
        for _ in 0..continuation_count {
            if header & HANDLER_CONT_IS_RVA != 0 {
                let _address = cursor.read_le::<i32>()?;
            } else {
                let _address = cursor.read_encoded_unsigned()?;
            }
        }
    }

    Ok((cursor.pos() - start) as u32)
}

/// Consumed size of one IPToStateMap4: count, then delta-encoded (ip, state) pairs.
fn ip_to_state_map_size(parser: &EhParser<'_>, rva: u32) -> Result<u32> {
    let mut cursor = image_cursor_at(parser, rva)?;
    let start = cursor.pos();

    let num_entries = cursor.read_encoded_unsigned()?;
    for _ in 0..num_entries {
        // IPs are deltas from the segment start; states are encoded +1 so negative
        // one (no state) stays unsigned
        let _ip_delta = cursor.read_encoded_unsigned()?;
        let _state_plus_one = cursor.read_encoded_unsigned()?;
    }

    Ok((cursor.pos() - start) as u32)
}

/// Consumed size of the separated-segment table plus its (segment start, IP map)
/// pairs. The referenced IP maps are sized separately.
fn separated_ip_to_state_map(parser: &EhParser<'_>, rva: u32) -> Result<(u32, Vec<(u32, u32)>)> {
    let mut cursor = image_cursor_at(parser, rva)?;
    let start = cursor.pos();

    let num_entries = cursor.read_encoded_unsigned()?;
    let mut segments = Vec::with_capacity(num_entries as usize);
    for _ in 0..num_entries {
        let segment_start_rva = cursor.read_le::<i32>()? as u32;
        let disp_of_ip_map = cursor.read_le::<i32>()? as u32;
        segments.push((segment_start_rva, disp_of_ip_map));
    }

    Ok(((cursor.pos() - start) as u32, segments))
}

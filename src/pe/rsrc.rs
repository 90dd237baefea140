//! Win32 resource directory parsing.
//!
//! The `.rsrc` section is, by rc.exe convention, a fixed three-level tree: resource type,
//! then name or ID, then language. Each level is an IMAGE_RESOURCE_DIRECTORY table whose
//! entries either descend to another table or land on an IMAGE_RESOURCE_DATA_ENTRY
//! describing a payload. The walker synthesizes a symbol for every table, name string,
//! data entry and payload so that the whole section is attributed.
//!
//! Two aggregations reshape the raw tree into what developers actually authored:
//!
//! - Individual ICON and CURSOR payloads are never surfaced. The GROUP_ICON /
//!   GROUP_CURSOR directory that references them yields one symbol owning the directory
//!   bytes plus every constituent payload, each rounded up to the 8-byte alignment the
//!   resource compiler writes them at.
//! - STRINGTABLE payloads (16 strings per table, an rc.exe implementation detail) that
//!   sit 8-byte-adjacent with the same language fold into one group symbol exposing all
//!   of the strings.
//!
//! Deeper nesting than three levels is legal per the PE spec but emitted by nothing
//! real; the walker ignores it rather than guessing at semantics.

use std::collections::BTreeMap;

use crate::{
    file::File,
    ranges::RvaRange,
    symbols::rsrc::{
        language_name, RsrcImageEntry, RsrcSymbol, RsrcSymbolKind, Win32ResourceType,
    },
    utils::math::round_up_to_8_byte_alignment,
    Parser, Result,
};

/// IMAGE_RESOURCE_DIRECTORY header size.
const RESOURCE_DIRECTORY_SIZE: u32 = 16;
/// IMAGE_RESOURCE_DIRECTORY_ENTRY size.
const RESOURCE_DIRECTORY_ENTRY_SIZE: u32 = 8;
/// IMAGE_RESOURCE_DATA_ENTRY size.
const RESOURCE_DATA_ENTRY_SIZE: u32 = 16;
/// NEWHEADER (icon/cursor group directory header) size.
const GROUP_HEADER_SIZE: u32 = 6;
/// ICONRESDIR / CURSORRESDIR group directory entry size.
const GROUP_ENTRY_SIZE: u32 = 14;

/// Everything the resource walk produced.
#[derive(Debug, Default)]
pub struct RsrcParseResult {
    /// The resource directory's extent, `None` when the image has no resources
    pub rsrc_range: Option<RvaRange>,
    /// Every resource symbol, keyed by RVA
    pub symbols_by_rva: BTreeMap<u32, RsrcSymbol>,
}

/// One raw directory entry, before interpretation.
#[derive(Debug, Clone, Copy)]
struct RawDirEntry {
    id_or_name: u32,
    offset: u32,
}

impl RawDirEntry {
    fn is_named(&self) -> bool {
        self.id_or_name & 0x8000_0000 != 0
    }

    fn name_offset(&self) -> u32 {
        self.id_or_name & 0x7FFF_FFFF
    }

    fn id(&self) -> u32 {
        self.id_or_name
    }

    fn data_is_directory(&self) -> bool {
        self.offset & 0x8000_0000 != 0
    }

    fn offset_to_directory(&self) -> u32 {
        self.offset & 0x7FFF_FFFF
    }
}

/// A STRINGTABLE payload held back for adjacency grouping.
#[derive(Debug, Clone)]
struct StringTablePayload {
    rva: u32,
    size: u32,
    language: String,
    data_name: String,
    strings: Vec<String>,
}

/// Parses the resource directory into symbols.
///
/// # Errors
///
/// Fails when directory or payload bytes are unreadable or decode out of bounds.
pub fn parse_rsrc(file: &File) -> Result<RsrcParseResult> {
    let Some((rsrc_rva, rsrc_size)) = file.data_directory(2) else {
        return Ok(RsrcParseResult::default());
    };

    let mut result = RsrcParseResult {
        rsrc_range: Some(RvaRange::from_rva_and_size(rsrc_rva, rsrc_size, false)),
        symbols_by_rva: BTreeMap::new(),
    };

    let mut string_tables: BTreeMap<u32, StringTablePayload> = BTreeMap::new();
    walk_resource_directory(
        file,
        rsrc_rva,
        rsrc_rva,
        0,
        None,
        None,
        &mut result.symbols_by_rva,
        &mut string_tables,
    )?;

    group_string_tables(string_tables, &mut result.symbols_by_rva);

    Ok(result)
}

/// Folds runs of adjacent same-language string tables into group symbols.
///
/// Strings from one binary tend to sit right next to each other, so this usually
/// collapses dozens of 16-string tables into a handful of symbols - less noise to read
/// and fewer entries to diff.
fn group_string_tables(
    string_tables: BTreeMap<u32, StringTablePayload>,
    symbols: &mut BTreeMap<u32, RsrcSymbol>,
) {
    let mut run: Vec<StringTablePayload> = Vec::new();

    for (rva, table) in string_tables {
        let extends_run = run.last().is_some_and(|last| {
            round_up_to_8_byte_alignment(last.rva + last.size.saturating_sub(1)) == rva
                && last.language == table.language
        });

        if run.is_empty() || extends_run {
            run.push(table);
        } else {
            emit_string_table_group(&run, symbols);
            run = vec![table];
        }
    }

    if !run.is_empty() {
        emit_string_table_group(&run, symbols);
    }
}

fn emit_string_table_group(run: &[StringTablePayload], symbols: &mut BTreeMap<u32, RsrcSymbol>) {
    let first = &run[0];
    let last = &run[run.len() - 1];
    let size = (last.rva + last.size) - first.rva;
    let strings: Vec<String> = run.iter().flat_map(|t| t.strings.iter().cloned()).collect();

    let symbol = RsrcSymbol {
        kind: RsrcSymbolKind::GroupStringTables { strings },
        rva: first.rva,
        size,
        language: first.language.clone(),
        resource_type: Win32ResourceType::STRINGTABLE,
        resource_type_name: Win32ResourceType::STRINGTABLE.to_string(),
        name: RsrcSymbol::conjure_name(&first.data_name, "STRINGTABLE", &first.language),
    };
    symbols.insert(symbol.rva, symbol);
}

#[allow(clippy::too_many_arguments)]
fn walk_resource_directory(
    file: &File,
    rsrc_rva: u32,
    directory_rva: u32,
    depth: u32,
    type_entry: Option<RawDirEntry>,
    name_entry: Option<RawDirEntry>,
    symbols: &mut BTreeMap<u32, RsrcSymbol>,
    string_tables: &mut BTreeMap<u32, StringTablePayload>,
) -> Result<()> {
    if depth > 2 {
        // Windows and rc.exe only ever use 3 levels; anything deeper is not navigable
        // with the conventions this parser knows.
        return Ok(());
    }

    let header = file.data_at_rva_sized(directory_rva, RESOURCE_DIRECTORY_SIZE as usize)?;
    let mut parser = Parser::new(header);
    let _characteristics = parser.read_le::<u32>()?;
    let _time_date_stamp = parser.read_le::<u32>()?;
    let _major = parser.read_le::<u16>()?;
    let _minor = parser.read_le::<u16>()?;
    let named_entries = parser.read_le::<u16>()?;
    let id_entries = parser.read_le::<u16>()?;
    let entry_count = u32::from(named_entries) + u32::from(id_entries);

    let directory_size = RESOURCE_DIRECTORY_SIZE + RESOURCE_DIRECTORY_ENTRY_SIZE * entry_count;

    let (resource_type, type_name) = resolve_type(file, rsrc_rva, type_entry)?;
    let data_name = resolve_data_name(file, rsrc_rva, name_entry)?;

    symbols.entry(directory_rva).or_insert_with(|| RsrcSymbol {
        kind: RsrcSymbolKind::Directory { depth },
        rva: directory_rva,
        size: directory_size,
        language: String::new(),
        resource_type,
        resource_type_name: type_name.clone(),
        name: format!("[rsrc directory (L{depth})] {type_name}"),
    });

    let mut entry_rva = directory_rva + RESOURCE_DIRECTORY_SIZE;
    for index in 0..entry_count {
        let entry_bytes = file.data_at_rva_sized(entry_rva, RESOURCE_DIRECTORY_ENTRY_SIZE as usize)?;
        let mut entry_parser = Parser::new(entry_bytes);
        let entry = RawDirEntry {
            id_or_name: entry_parser.read_le::<u32>()?,
            offset: entry_parser.read_le::<u32>()?,
        };

        if entry.is_named() {
            let string_rva = rsrc_rva + entry.name_offset();
            let value = read_name_string(file, string_rva)?;
            // The same string can be discovered at several levels of the tree, which
            // is harmless - keep the first.
            symbols.entry(string_rva).or_insert_with(|| RsrcSymbol {
                kind: RsrcSymbolKind::NameString {
                    value: value.clone(),
                },
                rva: string_rva,
                size: 2 + value.len() as u32 * 2,
                language: String::new(),
                resource_type,
                resource_type_name: type_name.clone(),
                name: format!("`rsrc name': \"{value}\""),
            });
        }

        if entry.data_is_directory() {
            let next_type = if depth == 0 { Some(entry) } else { type_entry };
            let next_name = if depth == 1 { Some(entry) } else { name_entry };
            walk_resource_directory(
                file,
                rsrc_rva,
                rsrc_rva + entry.offset_to_directory(),
                depth + 1,
                next_type,
                next_name,
                symbols,
                string_tables,
            )?;
        } else {
            parse_data_entry(
                file,
                rsrc_rva,
                entry,
                depth,
                index,
                resource_type,
                &type_name,
                &data_name,
                symbols,
                string_tables,
            )?;
        }

        entry_rva += RESOURCE_DIRECTORY_ENTRY_SIZE;
    }

    Ok(())
}

/// Resolves the level-0 entry into the tree's resource type and display name.
fn resolve_type(
    file: &File,
    rsrc_rva: u32,
    type_entry: Option<RawDirEntry>,
) -> Result<(Win32ResourceType, String)> {
    match type_entry {
        Some(entry) if !entry.is_named() => match Win32ResourceType::from_id(entry.id()) {
            Some(resource_type) => Ok((resource_type, resource_type.to_string())),
            None => Ok((
                Win32ResourceType::Unknown,
                Win32ResourceType::Unknown.to_string(),
            )),
        },
        Some(entry) => {
            let name = read_name_string(file, rsrc_rva + entry.name_offset())?;
            Ok((Win32ResourceType::UserNamedResource, name))
        }
        None => Ok((
            Win32ResourceType::Unknown,
            Win32ResourceType::Unknown.to_string(),
        )),
    }
}

/// Resolves the level-1 entry into the resource's display name.
fn resolve_data_name(
    file: &File,
    rsrc_rva: u32,
    name_entry: Option<RawDirEntry>,
) -> Result<String> {
    match name_entry {
        Some(entry) if entry.is_named() => read_name_string(file, rsrc_rva + entry.name_offset()),
        Some(entry) => Ok(format!("#{}", entry.id())),
        None => Ok("<unknown rsrc name>".to_string()),
    }
}

fn read_name_string(file: &File, rva: u32) -> Result<String> {
    let mut parser = Parser::new(file.data_at_rva(rva)?);
    parser.read_prefixed_string_utf16()
}

#[allow(clippy::too_many_arguments)]
fn parse_data_entry(
    file: &File,
    rsrc_rva: u32,
    entry: RawDirEntry,
    depth: u32,
    index: u32,
    resource_type: Win32ResourceType,
    type_name: &str,
    data_name: &str,
    symbols: &mut BTreeMap<u32, RsrcSymbol>,
    string_tables: &mut BTreeMap<u32, StringTablePayload>,
) -> Result<()> {
    let data_entry_rva = rsrc_rva + entry.offset;
    let bytes = file.data_at_rva_sized(data_entry_rva, RESOURCE_DATA_ENTRY_SIZE as usize)?;
    let mut parser = Parser::new(bytes);
    // This OffsetToData, unlike every other offset in the tree, is a real RVA
    let payload_rva = parser.read_le::<u32>()?;
    let payload_size = parser.read_le::<u32>()?;

    // By convention the level-2 entry's ID is the language ID
    let language = language_name(entry.id());

    symbols.insert(
        data_entry_rva,
        RsrcSymbol {
            kind: RsrcSymbolKind::DataEntry,
            rva: data_entry_rva,
            size: RESOURCE_DATA_ENTRY_SIZE,
            language: language.clone(),
            resource_type,
            resource_type_name: type_name.to_string(),
            name: format!(
                "[rsrc data entry (L{depth}, #{index})] {}",
                RsrcSymbol::conjure_name(data_name, type_name, &language)
            ),
        },
    );

    match resource_type {
        // Leaf icons and cursors are folded into their group symbol
        Win32ResourceType::ICON | Win32ResourceType::CURSOR => {}
        Win32ResourceType::GROUP_ICON => {
            let symbol = parse_image_group(
                file,
                payload_rva,
                payload_size,
                &language,
                data_name,
                Win32ResourceType::GROUP_ICON,
            )?;
            symbols.insert(symbol.rva, symbol);
        }
        Win32ResourceType::GROUP_CURSOR => {
            let symbol = parse_image_group(
                file,
                payload_rva,
                payload_size,
                &language,
                data_name,
                Win32ResourceType::GROUP_CURSOR,
            )?;
            symbols.insert(symbol.rva, symbol);
        }
        Win32ResourceType::STRINGTABLE => {
            let payload = parse_string_table(file, payload_rva, payload_size, &language, data_name)?;
            string_tables.insert(payload.rva, payload);
        }
        _ => {
            symbols.insert(
                payload_rva,
                RsrcSymbol {
                    kind: RsrcSymbolKind::Data,
                    rva: payload_rva,
                    size: payload_size,
                    language: language.clone(),
                    resource_type,
                    resource_type_name: type_name.to_string(),
                    name: RsrcSymbol::conjure_name(data_name, type_name, &language),
                },
            );
        }
    }

    Ok(())
}

/// Parses a GROUP_ICON or GROUP_CURSOR directory and folds its images into one symbol.
///
/// The images are written out *before* the group directory, each aligned up to 8 bytes,
/// so walking the directory entries in reverse recovers every image's RVA by subtracting
/// rounded sizes from the directory's own RVA.
fn parse_image_group(
    file: &File,
    group_rva: u32,
    group_size: u32,
    language: &str,
    data_name: &str,
    group_type: Win32ResourceType,
) -> Result<RsrcSymbol> {
    let header = file.data_at_rva_sized(group_rva, GROUP_HEADER_SIZE as usize)?;
    let mut parser = Parser::new(header);
    let _reserved = parser.read_le::<u16>()?;
    let _res_type = parser.read_le::<u16>()?;
    let count = parser.read_le::<u16>()?;

    let directory_size = GROUP_HEADER_SIZE + GROUP_ENTRY_SIZE * u32::from(count);
    if group_size != directory_size {
        return Err(malformed_error!(
            "{} directory at RVA 0x{:X} reports {} entries ({} bytes) but its data entry claims {} bytes",
            group_type,
            group_rva,
            count,
            directory_size,
            group_size
        ));
    }

    let is_cursor = group_type == Win32ResourceType::GROUP_CURSOR;
    let mut total_size = directory_size;
    let mut image_rva = group_rva;
    let mut images: Vec<RsrcImageEntry> = Vec::with_capacity(count as usize);

    for entry_index in (0..count).rev() {
        let entry_rva = group_rva + GROUP_HEADER_SIZE + u32::from(entry_index) * GROUP_ENTRY_SIZE;
        let entry_bytes = file.data_at_rva_sized(entry_rva, GROUP_ENTRY_SIZE as usize)?;
        let mut entry_parser = Parser::new(entry_bytes);

        let (width, height, bits_per_pixel) = if is_cursor {
            let width = entry_parser.read_le::<u16>()?;
            let raw_height = entry_parser.read_le::<u16>()?;
            let _planes = entry_parser.read_le::<u16>()?;
            let bits = entry_parser.read_le::<u16>()?;
            // Cursor heights are doubled in the directory: image pixels plus mask pixels
            (width, raw_height / 2, bits)
        } else {
            let raw_width = u16::from(entry_parser.read_le::<u8>()?);
            let raw_height = u16::from(entry_parser.read_le::<u8>()?);
            let _color_count = entry_parser.read_le::<u8>()?;
            let _reserved = entry_parser.read_le::<u8>()?;
            let _planes = entry_parser.read_le::<u16>()?;
            let bits = entry_parser.read_le::<u16>()?;
            // Since Windows XP a stored 0 means 256, it's only one byte
            (
                if raw_width == 0 { 256 } else { raw_width },
                if raw_height == 0 { 256 } else { raw_height },
                bits,
            )
        };

        let bytes_in_res = entry_parser.read_le::<u32>()?;
        let _id = entry_parser.read_le::<u16>()?;

        let aligned = round_up_to_8_byte_alignment(bytes_in_res);
        image_rva -= aligned;
        total_size += aligned;

        images.insert(
            0,
            RsrcImageEntry {
                rva: image_rva,
                size: bytes_in_res,
                width,
                height,
                bits_per_pixel,
            },
        );
    }

    let kind = if is_cursor {
        RsrcSymbolKind::GroupCursor { cursors: images }
    } else {
        RsrcSymbolKind::GroupIcon { icons: images }
    };

    // The group owns everything from its first image through the directory
    Ok(RsrcSymbol {
        kind,
        rva: image_rva,
        size: total_size,
        language: language.to_string(),
        resource_type: group_type,
        resource_type_name: group_type.to_string(),
        name: RsrcSymbol::conjure_name(data_name, &group_type.to_string(), language),
    })
}

/// Decodes one STRINGTABLE payload: a run of (u16 length, UTF-16 chars) records.
fn parse_string_table(
    file: &File,
    payload_rva: u32,
    payload_size: u32,
    language: &str,
    data_name: &str,
) -> Result<StringTablePayload> {
    let bytes = file.data_at_rva_sized(payload_rva, payload_size as usize)?;
    let mut parser = Parser::new(bytes);

    let mut strings = Vec::new();
    while parser.has_more_data() {
        let Ok(length) = parser.read_le::<u16>() else {
            break;
        };
        if length != 0 {
            strings.push(parser.read_string_utf16(length as usize)?);
        }
    }

    Ok(StringTablePayload {
        rva: payload_rva,
        size: payload_size,
        language: language.to_string(),
        data_name: data_name.to_string(),
        strings,
    })
}

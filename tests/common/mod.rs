//! Shared fixtures: a synthetic PE image builder and an in-memory debug-symbol provider.
//!
//! The builder emits just enough of a valid PE32/PE32+ image for goblin and the
//! sizescope parsers to chew on: DOS header, COFF and optional headers, data
//! directories, a section table, and caller-supplied section payloads laid out at
//! file-aligned offsets.

// Not every test binary uses every fixture helper
#![allow(dead_code)]

use sizescope::prelude::*;
use uguid::{guid, Guid};

pub const FILE_ALIGNMENT: u32 = 0x200;
pub const SECTION_ALIGNMENT: u32 = 0x1000;
pub const SIZE_OF_HEADERS: u32 = 0x400;

/// IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ
pub const CODE: u32 = 0x6000_0020;
/// IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ
pub const RDATA: u32 = 0x4000_0040;
/// IMAGE_SCN_CNT_UNINITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE
pub const BSS: u32 = 0xC000_0080;

/// A GUID every test image embeds as its RSDS signature.
pub const TEST_GUID: Guid = guid!("01020304-0506-0708-090a-0b0c0d0e0f10");

struct SectionSpec {
    name: [u8; 8],
    rva: u32,
    virtual_size: u32,
    characteristics: u32,
    data: Vec<u8>,
}

/// Builds tiny but structurally-valid PE images in memory.
pub struct ImageBuilder {
    machine: u16,
    sections: Vec<SectionSpec>,
    directories: [(u32, u32); 16],
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

impl ImageBuilder {
    pub fn x64() -> ImageBuilder {
        ImageBuilder::for_machine(0x8664)
    }

    pub fn x86() -> ImageBuilder {
        ImageBuilder::for_machine(0x014C)
    }

    pub fn arm() -> ImageBuilder {
        ImageBuilder::for_machine(0x01C4)
    }

    pub fn arm64() -> ImageBuilder {
        ImageBuilder::for_machine(0xAA64)
    }

    fn for_machine(machine: u16) -> ImageBuilder {
        ImageBuilder {
            machine,
            sections: Vec::new(),
            directories: [(0, 0); 16],
        }
    }

    fn is_64bit(&self) -> bool {
        matches!(self.machine, 0x8664 | 0xAA64)
    }

    pub fn section(
        mut self,
        name: &str,
        rva: u32,
        virtual_size: u32,
        characteristics: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut name_bytes = [0_u8; 8];
        name_bytes[..name.len()].copy_from_slice(name.as_bytes());
        self.sections.push(SectionSpec {
            name: name_bytes,
            rva,
            virtual_size,
            characteristics,
            data,
        });
        self
    }

    pub fn directory(mut self, index: usize, rva: u32, size: u32) -> Self {
        self.directories[index] = (rva, size);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let is_64bit = self.is_64bit();
        let optional_header_size: u16 = if is_64bit { 0xF0 } else { 0xE0 };

        let mut image = vec![0_u8; SIZE_OF_HEADERS as usize];

        // DOS header: MZ magic and e_lfanew
        image[0] = b'M';
        image[1] = b'Z';
        image[0x3C..0x40].copy_from_slice(&0x80_u32.to_le_bytes());

        let mut header = Vec::new();
        header.extend_from_slice(b"PE\0\0");

        // COFF header
        put_u16(&mut header, self.machine);
        put_u16(&mut header, self.sections.len() as u16);
        put_u32(&mut header, 0); // timestamp
        put_u32(&mut header, 0); // symbol table
        put_u32(&mut header, 0); // symbol count
        put_u16(&mut header, optional_header_size);
        put_u16(&mut header, 0x2022); // EXECUTABLE_IMAGE | LARGE_ADDRESS_AWARE | DLL

        let size_of_image = self
            .sections
            .iter()
            .map(|s| align_up(s.rva + s.virtual_size, SECTION_ALIGNMENT))
            .max()
            .unwrap_or(SECTION_ALIGNMENT);

        // Optional header
        put_u16(&mut header, if is_64bit { 0x20B } else { 0x10B });
        header.push(14); // linker major
        header.push(0); // linker minor
        put_u32(&mut header, 0); // size of code
        put_u32(&mut header, 0); // size of initialized data
        put_u32(&mut header, 0); // size of uninitialized data
        put_u32(&mut header, 0x1000); // entry point
        put_u32(&mut header, 0x1000); // base of code
        if is_64bit {
            put_u64(&mut header, 0x1_8000_0000); // image base
        } else {
            put_u32(&mut header, 0x1000); // base of data
            put_u32(&mut header, 0x1000_0000); // image base
        }
        put_u32(&mut header, SECTION_ALIGNMENT);
        put_u32(&mut header, FILE_ALIGNMENT);
        put_u16(&mut header, 6); // os major
        put_u16(&mut header, 0);
        put_u16(&mut header, 0); // image version
        put_u16(&mut header, 0);
        put_u16(&mut header, 6); // subsystem major
        put_u16(&mut header, 0);
        put_u32(&mut header, 0); // win32 version
        put_u32(&mut header, size_of_image);
        put_u32(&mut header, SIZE_OF_HEADERS);
        put_u32(&mut header, 0); // checksum
        put_u16(&mut header, 3); // subsystem: console
        put_u16(&mut header, 0x0160); // dll characteristics
        if is_64bit {
            put_u64(&mut header, 0x0010_0000); // stack reserve
            put_u64(&mut header, 0x1000); // stack commit
            put_u64(&mut header, 0x0010_0000); // heap reserve
            put_u64(&mut header, 0x1000); // heap commit
        } else {
            put_u32(&mut header, 0x0010_0000);
            put_u32(&mut header, 0x1000);
            put_u32(&mut header, 0x0010_0000);
            put_u32(&mut header, 0x1000);
        }
        put_u32(&mut header, 0); // loader flags
        put_u32(&mut header, 16); // directory count
        for (rva, size) in self.directories {
            put_u32(&mut header, rva);
            put_u32(&mut header, size);
        }

        // Section table, assigning raw data offsets as we go
        let mut raw_offset = SIZE_OF_HEADERS;
        let mut raw_layout = Vec::new();
        for section in &self.sections {
            let raw_size = align_up(section.data.len() as u32, FILE_ALIGNMENT);
            header.extend_from_slice(&section.name);
            put_u32(&mut header, section.virtual_size);
            put_u32(&mut header, section.rva);
            put_u32(&mut header, raw_size);
            put_u32(&mut header, raw_offset);
            put_u32(&mut header, 0); // relocations
            put_u32(&mut header, 0); // line numbers
            put_u16(&mut header, 0);
            put_u16(&mut header, 0);
            put_u32(&mut header, section.characteristics);

            raw_layout.push((raw_offset, raw_size));
            raw_offset += raw_size;
        }

        assert!(
            0x80 + header.len() <= SIZE_OF_HEADERS as usize,
            "headers overflow the reserved region"
        );
        image[0x80..0x80 + header.len()].copy_from_slice(&header);

        for (section, (offset, raw_size)) in self.sections.iter().zip(raw_layout) {
            let end = (offset + raw_size) as usize;
            if image.len() < end {
                image.resize(end, 0);
            }
            image[offset as usize..offset as usize + section.data.len()]
                .copy_from_slice(&section.data);
        }

        image
    }
}

/// Section payload bytes for a debug directory with one RSDS (CodeView) entry.
///
/// Returns `(directory_bytes, payload_bytes)`; place the directory at `dir_rva` and the
/// payload at `payload_rva`, and point data directory 6 at `(dir_rva, 28)`.
pub fn rsds_debug_directory(payload_rva: u32, guid: Guid, age: u32) -> (Vec<u8>, Vec<u8>) {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"RSDS");
    payload.extend_from_slice(&guid.to_bytes());
    put_u32(&mut payload, age);
    payload.extend_from_slice(b"t.pdb\0");

    let mut directory = Vec::new();
    put_u32(&mut directory, 0); // characteristics
    put_u32(&mut directory, 0); // timestamp
    put_u16(&mut directory, 0); // major
    put_u16(&mut directory, 0); // minor
    put_u32(&mut directory, 2); // IMAGE_DEBUG_TYPE_CODEVIEW
    put_u32(&mut directory, payload.len() as u32);
    put_u32(&mut directory, payload_rva);
    put_u32(&mut directory, 0); // pointer to raw data; callers patch in the file offset

    (directory, payload)
}

/// An in-memory debug-symbol provider driven entirely by test data.
#[derive(Default)]
pub struct FakeProvider {
    pub signature: Option<(Guid, u32)>,
    pub minimal: bool,
    pub coff_groups: Vec<CoffGroupRecord>,
    pub compilands: Vec<CompilandRecord>,
    pub source_files: Vec<SourceFileRecord>,
    pub symbols: Vec<SymbolRecord>,
    pub public_symbol_targets: Vec<(u32, u32)>,
}

impl FakeProvider {
    fn record_end(record: &SymbolRecord) -> u32 {
        if record.virtual_size == 0 {
            record.rva
        } else {
            record.rva + record.virtual_size - 1
        }
    }
}

impl DebugSymbolProvider for FakeProvider {
    fn debug_signature(&self) -> Option<(Guid, u32)> {
        self.signature
    }

    fn is_minimal(&self) -> bool {
        self.minimal
    }

    fn coff_groups(&self, _token: &CancellationToken) -> sizescope::Result<Vec<CoffGroupRecord>> {
        Ok(self.coff_groups.clone())
    }

    fn compilands(&self, _token: &CancellationToken) -> sizescope::Result<Vec<CompilandRecord>> {
        Ok(self.compilands.clone())
    }

    fn source_files(&self, _token: &CancellationToken) -> sizescope::Result<Vec<SourceFileRecord>> {
        Ok(self.source_files.clone())
    }

    fn all_symbols(&self, _token: &CancellationToken) -> sizescope::Result<Vec<SymbolRecord>> {
        Ok(self.symbols.clone())
    }

    fn symbols_in_range(
        &self,
        range: RvaRange,
        token: &CancellationToken,
    ) -> sizescope::Result<Vec<SymbolRecord>> {
        let mut found = Vec::new();
        for record in &self.symbols {
            token.check()?;
            if record.rva >= range.rva_start() && Self::record_end(record) <= range.rva_end() {
                found.push(record.clone());
            }
        }
        found.sort_by_key(|r| r.rva);
        Ok(found)
    }

    fn symbol_at_rva(&self, rva: u32) -> Option<SymbolRecord> {
        self.symbols
            .iter()
            .filter(|r| rva >= r.rva && rva <= Self::record_end(r))
            .max_by_key(|r| r.rva)
            .cloned()
    }

    fn symbol_rva_by_name(&self, name: &str) -> Option<u32> {
        self.symbols.iter().find(|r| r.name == name).map(|r| r.rva)
    }

    fn language_of_symbol_at(&self, rva: u32) -> CompilandLanguage {
        for compiland in &self.compilands {
            if compiland
                .contributions
                .iter()
                .any(|c| rva >= c.rva && c.size > 0 && rva <= c.rva + c.size - 1)
            {
                return compiland.language;
            }
        }
        CompilandLanguage::Cpp
    }

    fn public_symbol_target_rva(&self, rva: u32) -> Option<u32> {
        self.public_symbol_targets
            .iter()
            .find(|(source, _)| *source == rva)
            .map(|(_, target)| *target)
    }
}

/// Shorthand for a [`SymbolRecord`].
pub fn symbol(
    symbol_id: u32,
    rva: u32,
    size: u32,
    name: &str,
    kind: SymbolRecordKind,
) -> SymbolRecord {
    SymbolRecord {
        symbol_id,
        rva,
        size,
        virtual_size: size,
        name: name.to_string(),
        kind,
    }
}

/// Shorthand for a [`CoffGroupRecord`].
pub fn coff_group(name: &str, rva: u32, raw_size: u32, characteristics: u32) -> CoffGroupRecord {
    CoffGroupRecord {
        name: name.to_string(),
        rva,
        raw_size,
        characteristics,
    }
}

/// Shorthand for a [`RawContribution`].
pub fn contribution(rva: u32, size: u32) -> RawContribution {
    RawContribution {
        rva,
        size,
        is_virtual_size: false,
    }
}

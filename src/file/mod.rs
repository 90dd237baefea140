//! PE file abstraction and native binary parsing.
//!
//! This module provides the raw-image half of the analysis engine's input: parsing and
//! navigating Portable Executable (PE) files containing native code. It abstracts over
//! different data sources (files, memory) and provides ergonomic access to PE headers,
//! the section table, data directories, and address translation - everything the
//! PE-specific symbol parsers need that the debug-symbol provider does not expose.
//!
//! # Architecture
//!
//! - **File abstraction layer** - Unified interface for PE image access
//! - **Backend system** - Pluggable data sources (disk files, memory buffers)
//! - **PE format parsing** - Headers, section table and data directories via goblin
//! - **Address translation** - RVA to file offset conversion
//! - **Debug signature** - RSDS (CodeView) signature extraction for database matching
//!
//! # Key Components
//!
//! ## Core Types
//! - [`crate::file::File`] - Main PE image abstraction
//! - [`crate::file::Backend`] - Trait for different data sources (disk files, memory buffers)
//! - [`crate::file::MachineType`] - The architectures whose exception metadata can be decoded
//! - [`crate::file::DebugSignature`] - The RSDS GUID + age + path triple embedded in the image
//!
//! ## Parsing Infrastructure
//! - [`crate::file::parser::Parser`] - Cursor-based record decoding
//! - [`crate::file::io`] - Low-level bounds-checked reads
//!
//! ## Backend Implementations
//! - [`crate::file::physical::Physical`] - Memory-mapped file backend for disk access
//! - [`crate::file::memory::Memory`] - In-memory buffer backend
//!
//! # Managed Images
//!
//! Attribution requires native symbols and native unwind metadata, so loading validates
//! that the image does *not* carry a CLR runtime header; managed assemblies are rejected
//! at open time with [`crate::Error::ManagedBinary`] rather than failing obscurely later.
//!
//! # Examples
//!
//! ```rust,no_run
//! use sizescope::File;
//! use std::path::Path;
//!
//! let file = File::from_file(Path::new("app.dll"))?;
//! println!("Machine: {}", file.machine()?);
//! println!("Sections: {}", file.sections().count());
//!
//! if let Some(signature) = file.debug_signature()? {
//!     println!("PDB signature {} age {}", signature.guid, signature.age);
//! }
//! # Ok::<(), sizescope::Error>(())
//! ```

pub mod io;
pub mod parser;

mod memory;
mod physical;

use std::fmt;
use std::path::Path;

use crate::{
    file::io::read_le_at,
    Error::{Empty, GoblinErr},
    Result,
};
use goblin::pe::{data_directories::DataDirectory, header::Header, section_table::SectionTable, PE};
use memory::Memory;
use ouroboros::self_referencing;
use physical::Physical;
use uguid::Guid;

/// CodeView debug directory type in `IMAGE_DEBUG_DIRECTORY`.
const IMAGE_DEBUG_TYPE_CODEVIEW: u32 = 2;
/// The "RSDS" magic introducing a PDB 7.0 CodeView record.
const RSDS_SIGNATURE: u32 = 0x5344_5352;

/// Backend trait for file data sources.
///
/// This trait abstracts over the source of PE data, allowing for both in-memory and on-disk
/// representations. All implementations must be thread-safe.
pub trait Backend: Send + Sync {
    /// Returns a slice of the data at the given offset and length.
    ///
    /// # Arguments
    ///
    /// * `offset` - The starting offset within the data.
    /// * `len` - The length of the slice in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

/// The machine architectures whose exception metadata this library can decode.
///
/// The COFF machine field selects which pdata/xdata record formats apply; anything
/// outside this set is rejected at open time with [`crate::Error::UnsupportedMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum MachineType {
    /// AMD64 / Intel 64-bit
    #[strum(serialize = "x64")]
    X64,
    /// Intel 32-bit. x86 exception handling is not table-driven, so these images
    /// carry no pdata or xdata at all.
    #[strum(serialize = "x86")]
    I386,
    /// ARM 32-bit (including Thumb-2)
    #[strum(serialize = "ARM")]
    Arm,
    /// ARM 64-bit
    #[strum(serialize = "ARM64")]
    Arm64,
}

impl MachineType {
    /// Maps a raw COFF machine value to a supported machine type.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnsupportedMachine`] for any machine whose exception
    /// metadata this library has no decoder for.
    pub fn from_coff_machine(machine: u16) -> Result<MachineType> {
        match machine {
            0x8664 => Ok(MachineType::X64),
            0x014C => Ok(MachineType::I386),
            0x01C0 | 0x01C4 => Ok(MachineType::Arm),
            0xAA64 => Ok(MachineType::Arm64),
            other => Err(crate::Error::UnsupportedMachine(other)),
        }
    }
}

/// The RSDS debug signature embedded in a PE image's CodeView debug directory.
///
/// A binary and its debug database are a matched pair: the database records the same
/// GUID and age at build time, and session opening refuses mismatches so stale or
/// swapped databases never produce silently-wrong attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSignature {
    /// Unique identity stamped by the linker at build time
    pub guid: Guid,
    /// Incremented by tools that rewrite the database after linking
    pub age: u32,
    /// Path of the database as recorded at link time
    pub pdb_path: String,
}

impl fmt::Display for DebugSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}} age {}", self.guid, self.age)
    }
}

/// One raw `IMAGE_DEBUG_DIRECTORY` entry.
///
/// Exposed so the directory-symbol parser can attribute each entry's payload bytes;
/// the CodeView entry additionally yields the [`DebugSignature`].
#[derive(Debug, Clone, Copy)]
pub struct DebugDirectoryEntry {
    /// The IMAGE_DEBUG_TYPE_* discriminator
    pub entry_type: u32,
    /// Size of the entry's payload in bytes
    pub size_of_data: u32,
    /// RVA of the payload, 0 if it is not mapped
    pub address_of_raw_data: u32,
}

impl DebugDirectoryEntry {
    /// Human-readable name of the entry's type, for symbol naming.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self.entry_type {
            1 => "Coff",
            2 => "CodeView",
            3 => "Fpo",
            4 => "Misc",
            5 => "Exception",
            6 => "Fixup",
            7 => "OmapToSrc",
            8 => "OmapFromSrc",
            9 => "Borland",
            11 => "Clsid",
            12 => "VcFeature",
            13 => "Pogo",
            14 => "Iltcg",
            15 => "Mpx",
            16 => "Repro",
            20 => "ExDllCharacteristics",
            _ => "Unknown",
        }
    }
}

#[self_referencing]
/// Represents a loaded native PE image.
///
/// This struct wraps the parsed PE and provides methods for accessing headers, sections,
/// data directories, and for converting between address spaces. It supports loading from
/// both files and memory buffers, and validates at load time that the image is a native
/// binary (managed assemblies are rejected).
///
/// # Examples
///
/// ```rust,no_run
/// use sizescope::File;
/// use std::path::Path;
///
/// let file = File::from_file(Path::new("app.dll"))?;
/// println!("Loaded PE with {} sections", file.sections().count());
/// println!("File alignment 0x{:X}", file.file_alignment());
/// # Ok::<(), sizescope::Error>(())
/// ```
pub struct File {
    /// The underlying data source (memory or file).
    data: Box<dyn Backend>,
    /// The parsed PE structure, referencing the data.
    #[borrows(data)]
    #[not_covariant]
    pe: PE<'this>,
}

impl File {
    /// Loads a PE image from the given path.
    ///
    /// The file is memory-mapped for efficient sparse access.
    ///
    /// # Arguments
    ///
    /// * `file` - Path to the PE file on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read or opened
    /// - The file is not a valid PE format
    /// - The file is empty
    /// - The image is managed ([`crate::Error::ManagedBinary`])
    pub fn from_file(file: &Path) -> Result<File> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Loads a PE image from a memory buffer.
    ///
    /// # Arguments
    ///
    /// * `data` - The bytes of the PE file.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is empty, not a valid PE, or a managed image.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        let input = Memory::new(data);

        Self::load(input)
    }

    /// Internal loader for any backend.
    fn load<T: Backend + 'static>(data: T) -> Result<File> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let data = Box::new(data);

        File::try_new(data, |data| {
            let data = data.as_ref();
            match PE::parse(data.data()) {
                Ok(pe) => match pe.header.optional_header {
                    Some(optional_header) => {
                        if optional_header
                            .data_directories
                            .get_clr_runtime_header()
                            .is_some()
                        {
                            Err(crate::Error::ManagedBinary)
                        } else {
                            Ok(pe)
                        }
                    }
                    None => Err(malformed_error!("File does not have an OptionalHeader")),
                },
                Err(error) => Err(GoblinErr(error)),
            }
        })
    }

    /// Returns the total size of the loaded file in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns `true` if the file has a length of zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the image base address of the loaded PE file.
    #[must_use]
    pub fn imagebase(&self) -> u64 {
        self.with_pe(|pe| pe.image_base)
    }

    /// Returns a reference to the PE header.
    #[must_use]
    pub fn header(&self) -> &Header {
        self.with_pe(|pe| &pe.header)
    }

    /// Returns the machine type of the image.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnsupportedMachine`] for architectures without
    /// exception-metadata decoders.
    pub fn machine(&self) -> Result<MachineType> {
        MachineType::from_coff_machine(self.with_pe(|pe| pe.header.coff_header.machine))
    }

    /// The pointer width of the image in bytes: 8 for PE32+, 4 for PE32.
    ///
    /// Import thunks and load-config fields are sized by this.
    #[must_use]
    pub fn bytes_per_word(&self) -> u32 {
        // 0x20B is the PE32+ magic; the optional header was validated at load time.
        self.with_pe(|pe| {
            if pe
                .header
                .optional_header
                .unwrap()
                .standard_fields
                .magic
                == 0x20B
            {
                8
            } else {
                4
            }
        })
    }

    /// The on-disk alignment of section raw data, from `/filealign`.
    #[must_use]
    pub fn file_alignment(&self) -> u32 {
        self.with_pe(|pe| pe.header.optional_header.unwrap().windows_fields.file_alignment)
    }

    /// The in-memory alignment of sections, from `/align`.
    #[must_use]
    pub fn section_alignment(&self) -> u32 {
        self.with_pe(|pe| {
            pe.header
                .optional_header
                .unwrap()
                .windows_fields
                .section_alignment
        })
    }

    /// Returns an iterator over the section headers of the PE file.
    pub fn sections(&self) -> impl Iterator<Item = &SectionTable> {
        self.with_pe(|pe| pe.sections.iter())
    }

    /// Returns the RVA and size of a data directory entry, by index.
    ///
    /// Returns `None` when the directory is absent or zero-sized. The indices follow
    /// the PE optional header layout (0 = exports, 1 = imports, 2 = resources,
    /// 3 = exceptions, 5 = base relocations, 6 = debug, 10 = load config,
    /// 13 = delay imports).
    #[must_use]
    pub fn data_directory(&self, index: usize) -> Option<(u32, u32)> {
        self.with_pe(|pe| {
            let directories = &pe.header.optional_header.unwrap().data_directories;
            let directory: Option<&DataDirectory> = match index {
                0 => directories.get_export_table(),
                1 => directories.get_import_table(),
                2 => directories.get_resource_table(),
                3 => directories.get_exception_table(),
                5 => directories.get_base_relocation_table(),
                6 => directories.get_debug_table(),
                10 => directories.get_load_config_table(),
                13 => directories.get_delay_import_descriptor(),
                _ => None,
            };

            directory
                .filter(|d| d.virtual_address != 0 && d.size != 0)
                .map(|d| (d.virtual_address, d.size))
        })
    }

    /// Returns the entire file data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.with_data(|data| data.data())
    }

    /// Returns a slice of the file data at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.with_data(|data| data.data_slice(offset, len))
    }

    /// Converts a relative virtual address (RVA) to a file offset.
    ///
    /// Header bytes before the first section map one-to-one; bytes inside a section map
    /// through its raw-data pointer; bytes in the virtual-only tail of a section (or in
    /// fully virtual sections like `.bss`) have no file backing and fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the RVA falls outside every section's mapped bytes.
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        self.with_pe(|pe| {
            for section in &pe.sections {
                let span = section.virtual_size.max(section.size_of_raw_data);
                let Some(section_max) = section.virtual_address.checked_add(span) else {
                    return Err(malformed_error!(
                        "Section malformed, causing integer overflow - {} + {}",
                        section.virtual_address,
                        span
                    ));
                };

                if rva >= section.virtual_address && rva < section_max {
                    let delta = rva - section.virtual_address;
                    if delta < section.size_of_raw_data {
                        return Ok((section.pointer_to_raw_data + delta) as usize);
                    }

                    // The RVA exists in memory but has no bytes on disk (.bss style)
                    return Err(out_of_bounds_error!());
                }
            }

            // Bytes before the first section (the headers) map one-to-one
            if let Some(first) = pe.sections.first() {
                if rva < first.virtual_address {
                    return Ok(rva as usize);
                }
            }

            Err(malformed_error!(
                "RVA could not be converted to offset - 0x{:X}",
                rva
            ))
        })
    }

    /// Returns the image bytes starting at `rva`, running to the end of the RVA's
    /// section raw data.
    ///
    /// This is the entry point every record decoder uses: translate once, then walk a
    /// [`crate::Parser`] over the returned slice.
    ///
    /// # Errors
    ///
    /// Returns an error if `rva` has no file backing.
    pub fn data_at_rva(&self, rva: u32) -> Result<&[u8]> {
        let offset = self.rva_to_offset(rva)?;
        let data = self.data();
        if offset >= data.len() {
            return Err(out_of_bounds_error!());
        }

        Ok(&data[offset..])
    }

    /// Returns exactly `len` image bytes starting at `rva`.
    ///
    /// # Errors
    ///
    /// Returns an error if `rva` has no file backing or the slice exceeds the file.
    pub fn data_at_rva_sized(&self, rva: u32, len: usize) -> Result<&[u8]> {
        let offset = self.rva_to_offset(rva)?;
        self.data_slice(offset, len)
    }

    /// Parses the debug directory into its entries.
    ///
    /// Returns an empty list when the image carries no debug directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory's bytes cannot be read.
    pub fn debug_directories(&self) -> Result<Vec<DebugDirectoryEntry>> {
        let Some((dir_rva, dir_size)) = self.data_directory(6) else {
            return Ok(Vec::new());
        };

        // IMAGE_DEBUG_DIRECTORY is 28 bytes
        let count = dir_size as usize / 28;
        let data = self.data_at_rva_sized(dir_rva, count * 28)?;

        let mut entries = Vec::with_capacity(count);
        let mut offset = 0_usize;
        for _ in 0..count {
            let _characteristics = read_le_at::<u32>(data, &mut offset)?;
            let _time_date_stamp = read_le_at::<u32>(data, &mut offset)?;
            let _major = read_le_at::<u16>(data, &mut offset)?;
            let _minor = read_le_at::<u16>(data, &mut offset)?;
            let entry_type = read_le_at::<u32>(data, &mut offset)?;
            let size_of_data = read_le_at::<u32>(data, &mut offset)?;
            let address_of_raw_data = read_le_at::<u32>(data, &mut offset)?;
            let _pointer_to_raw_data = read_le_at::<u32>(data, &mut offset)?;

            entries.push(DebugDirectoryEntry {
                entry_type,
                size_of_data,
                address_of_raw_data,
            });
        }

        Ok(entries)
    }

    /// Extracts the RSDS debug signature from the CodeView debug directory, if present.
    ///
    /// Images built without debug info (or with a non-RSDS CodeView record) return
    /// `None`; the session then cannot verify the database pairing and proceeds on
    /// the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory bytes cannot be read.
    pub fn debug_signature(&self) -> Result<Option<DebugSignature>> {
        for entry in self.debug_directories()? {
            if entry.entry_type != IMAGE_DEBUG_TYPE_CODEVIEW || entry.address_of_raw_data == 0 {
                continue;
            }

            let data = self.data_at_rva(entry.address_of_raw_data)?;
            let mut offset = 0_usize;
            if read_le_at::<u32>(data, &mut offset)? != RSDS_SIGNATURE {
                return Ok(None);
            }

            let mut guid_bytes = [0_u8; 16];
            if data.len() < offset + 16 {
                return Err(out_of_bounds_error!());
            }
            guid_bytes.copy_from_slice(&data[offset..offset + 16]);
            offset += 16;

            let age = read_le_at::<u32>(data, &mut offset)?;

            let mut parser = crate::file::parser::Parser::new(&data[offset..]);
            let pdb_path = parser.read_string_utf8().unwrap_or_default();

            return Ok(Some(DebugSignature {
                guid: Guid::from_bytes(guid_bytes),
                age,
                pdb_path,
            }));
        }

        Ok(None)
    }
}

//! Import-table and data-directory symbols.
//!
//! The import machinery (descriptors, thunk chains, hint/name entries) and the
//! remaining data directories (base relocations, debug payloads, load-config guard
//! tables) are linker-generated regions the debug-symbol provider cannot see. The
//! parsers in [`crate::pe`] synthesize one symbol per record so those bytes are
//! attributed like everything else.

/// Which import or directory construct a symbol represents.
#[derive(Debug, Clone)]
pub enum PeSymbolKind {
    /// An IMAGE_IMPORT_DESCRIPTOR (or delay-load descriptor), one per imported DLL
    ImportDescriptor {
        /// The DLL being imported, or "null terminator" for the closing record
        dll_name: String,
    },
    /// One slot in an import name table or import address table
    ImportThunk {
        /// The DLL the thunk belongs to
        dll_name: String,
        /// The import's hint, or its ordinal for ordinal-only imports
        hint: u16,
        /// The imported function's name; `None` for ordinal-only imports
        function: Option<String>,
    },
    /// An IMAGE_IMPORT_BY_NAME record: a u16 hint followed by the function name
    ImportByName {
        /// The DLL the import belongs to
        dll_name: String,
        /// The import's hint
        hint: u16,
        /// The imported function's name
        function: String,
    },
    /// A NUL-terminated string the import machinery references (DLL names)
    ImportString,
    /// A whole data directory attributed as one region (base relocations, debug
    /// payloads, delay-load directory, load config)
    Directory,
    /// A Control Flow Guard table found through the load-config directory
    LoadConfigTable,
}

/// One import-table or data-directory symbol.
#[derive(Debug, Clone)]
pub struct PeSymbol {
    /// What this symbol represents
    pub kind: PeSymbolKind,
    /// RVA of the symbol's first byte
    pub rva: u32,
    /// Size in bytes; always real disk bytes
    pub size: u32,
    /// Conjured display name
    pub name: String,
}

impl PeSymbol {
    /// Creates a directory symbol named after what the directory holds.
    #[must_use]
    pub fn directory(rva: u32, size: u32, name: &str) -> PeSymbol {
        PeSymbol {
            kind: PeSymbolKind::Directory,
            rva,
            size,
            name: format!("[PE directory] {name}"),
        }
    }

    /// Creates an import descriptor symbol for `dll_name`.
    #[must_use]
    pub fn import_descriptor(rva: u32, size: u32, dll_name: &str) -> PeSymbol {
        PeSymbol {
            kind: PeSymbolKind::ImportDescriptor {
                dll_name: dll_name.to_string(),
            },
            rva,
            size,
            name: format!("[import descriptor] {dll_name}"),
        }
    }

    /// Creates an import thunk symbol.
    ///
    /// Named imports render as `dll!function`; ordinal-only imports render the ordinal.
    #[must_use]
    pub fn import_thunk(
        rva: u32,
        size: u32,
        hint: u16,
        dll_name: &str,
        function: Option<&str>,
    ) -> PeSymbol {
        let name = match function {
            Some(function) => format!("[import thunk] {dll_name} {function}"),
            None => format!("[import thunk] {dll_name} Ordinal {hint}"),
        };

        PeSymbol {
            kind: PeSymbolKind::ImportThunk {
                dll_name: dll_name.to_string(),
                hint,
                function: function.map(str::to_string),
            },
            rva,
            size,
            name,
        }
    }

    /// Creates an import by-name symbol (hint + function name string).
    #[must_use]
    pub fn import_by_name(
        rva: u32,
        size: u32,
        hint: u16,
        dll_name: &str,
        function: &str,
    ) -> PeSymbol {
        PeSymbol {
            kind: PeSymbolKind::ImportByName {
                dll_name: dll_name.to_string(),
                hint,
                function: function.to_string(),
            },
            rva,
            size,
            name: format!("[import by-name] {dll_name} {function}"),
        }
    }

    /// Creates a symbol for a string the import machinery points at.
    #[must_use]
    pub fn import_string(rva: u32, size: u32, value: &str) -> PeSymbol {
        PeSymbol {
            kind: PeSymbolKind::ImportString,
            rva,
            size,
            name: format!("`string': \"{value}\""),
        }
    }

    /// Creates a symbol for a Control Flow Guard table.
    #[must_use]
    pub fn load_config_table(rva: u32, size: u32, name: &str) -> PeSymbol {
        PeSymbol {
            kind: PeSymbolKind::LoadConfigTable,
            rva,
            size,
            name: name.to_string(),
        }
    }

    /// The last RVA occupied by this symbol.
    #[must_use]
    pub fn rva_end(&self) -> u32 {
        if self.size == 0 {
            self.rva
        } else {
            self.rva + self.size - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thunk_names() {
        let named = PeSymbol::import_thunk(0x3000, 8, 42, "kernel32.dll", Some("CreateFileW"));
        assert_eq!(named.name, "[import thunk] kernel32.dll CreateFileW");

        let ordinal_only = PeSymbol::import_thunk(0x3008, 8, 12, "ole32.dll", None);
        assert_eq!(ordinal_only.name, "[import thunk] ole32.dll Ordinal 12");
    }

    #[test]
    fn string_names_quote_the_value() {
        let s = PeSymbol::import_string(0x3100, 13, "kernel32.dll");
        assert_eq!(s.name, "`string': \"kernel32.dll\"");
    }

    #[test]
    fn directory_names() {
        let d = PeSymbol::directory(0x9000, 0x200, "Base Relocation Table");
        assert_eq!(d.name, "[PE directory] Base Relocation Table");
    }
}

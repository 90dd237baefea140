//! Whole-session scenarios: open-time validation, geometry, COMDAT folding, pdata
//! attribution to owners, placement lookups, fill checking, and determinism.

mod common;

use common::*;
use sizescope::prelude::*;
use uguid::guid;

fn put_u32(buf: &mut Vec<u8>, offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// The shared test binary:
///
/// - `.text` at 0x1000 (0x180 bytes): FunctionA (0x1000, 0x100) from a.obj and
///   FunctionB (0x1100, 0x80) from b.obj, both in static1.lib
/// - `.rdata` at 0x2000 (0xD0 bytes): a COMDAT-folded data pair at 0x2000 (0x80
///   bytes), the debug directory at 0x2080 with its RSDS payload at 0x20A0, and one
///   shared unwind record at 0x20C8 (8 bytes, its own `.xdata` COFF group)
/// - `.pdata` at 0x7000 (0x18 bytes): two entries, one per function, sharing the
///   unwind record
fn build_image() -> Vec<u8> {
    let mut rdata = vec![0_u8; 0xD0];

    let (mut debug_dir, rsds_payload) = rsds_debug_directory(0x20A0, TEST_GUID, 1);
    // .rdata is the second section, with raw data at file offset 0x600, so the RSDS
    // payload at section offset 0xA0 lives at file offset 0x6A0 - goblin reads the
    // CodeView record through this pointer rather than the RVA
    put_u32(&mut debug_dir, 24, 0x6A0);
    rdata[0x80..0x80 + debug_dir.len()].copy_from_slice(&debug_dir);
    rdata[0xA0..0xA0 + rsds_payload.len()].copy_from_slice(&rsds_payload);

    // The unwind record: version 1, no flags, 2 unwind codes -> 8 bytes
    rdata[0xC8] = 0x01;
    rdata[0xCA] = 2;

    let mut pdata = Vec::new();
    for (begin, end) in [(0x1000_u32, 0x1100_u32), (0x1100, 0x1180)] {
        pdata.extend_from_slice(&begin.to_le_bytes());
        pdata.extend_from_slice(&end.to_le_bytes());
        pdata.extend_from_slice(&0x20C8_u32.to_le_bytes());
    }

    ImageBuilder::x64()
        .section(".text", 0x1000, 0x180, CODE, vec![0_u8; 0x180])
        .section(".rdata", 0x2000, 0xD0, RDATA, rdata)
        .section(".pdata", 0x7000, 0x18, RDATA, pdata)
        .directory(3, 0x7000, 0x18)
        .directory(6, 0x2080, 28)
        .build()
}

fn build_provider() -> FakeProvider {
    FakeProvider {
        signature: Some((TEST_GUID, 1)),
        coff_groups: vec![
            coff_group(".text$mn", 0x1000, 0x180, CODE),
            coff_group(".rdata", 0x2000, 0xC8, RDATA),
            coff_group(".xdata", 0x20C8, 0x8, RDATA),
            coff_group(".pdata", 0x7000, 0x18, RDATA),
        ],
        compilands: vec![
            CompilandRecord {
                name: "a.obj".to_string(),
                lib_name: "static1.lib".to_string(),
                language: CompilandLanguage::Cpp,
                contributions: vec![contribution(0x1000, 0x100), contribution(0x2000, 0x80)],
            },
            CompilandRecord {
                name: "b.obj".to_string(),
                lib_name: "static1.lib".to_string(),
                language: CompilandLanguage::Cpp,
                contributions: vec![contribution(0x1100, 0x80)],
            },
            CompilandRecord {
                name: "linker.obj".to_string(),
                lib_name: String::new(),
                language: CompilandLanguage::Other,
                contributions: vec![contribution(0x2080, 0x48), contribution(0x20C8, 0x8)],
            },
        ],
        source_files: vec![
            SourceFileRecord {
                name: "a.cpp".to_string(),
                contributions: vec![contribution(0x1000, 0x100)],
            },
            SourceFileRecord {
                name: "b.cpp".to_string(),
                contributions: vec![contribution(0x1100, 0x80)],
            },
        ],
        symbols: vec![
            symbol(1, 0x1000, 0x100, "FunctionA", SymbolRecordKind::Function),
            symbol(2, 0x1100, 0x80, "FunctionB", SymbolRecordKind::Function),
            symbol(3, 0x2000, 0x80, "zeta_table", SymbolRecordKind::Data),
            symbol(4, 0x2000, 0x80, "alpha_table", SymbolRecordKind::Data),
        ],
        ..FakeProvider::default()
    }
}

fn open_session() -> Session {
    Session::open_mem(
        build_image(),
        build_provider(),
        SessionOptions::default(),
        &CancellationToken::new(),
    )
    .unwrap()
}

#[test]
fn geometry_is_built_and_sealed() {
    let session = open_session();

    let sections: Vec<&str> = session.binary_sections().iter().map(|s| s.name()).collect();
    assert_eq!(sections, vec![".text", ".rdata", ".pdata"]);

    let groups: Vec<&str> = session.coff_groups().iter().map(|g| g.name()).collect();
    assert_eq!(groups, vec![".text$mn", ".rdata", ".xdata", ".pdata"]);

    // COFF groups (plus tail slop) tile their sections exactly
    for section in session.binary_sections() {
        let tiled: u32 = section
            .coff_group_indices()
            .unwrap()
            .iter()
            .map(|&idx| {
                let group = &session.coff_groups()[idx];
                group.virtual_size().unwrap() + group.tail_slop_virtual_size_alignment().unwrap()
            })
            .sum();
        assert_eq!(tiled, section.virtual_size_including_padding());
    }
}

#[test]
fn section_enumeration_fills_the_range() {
    let session = open_session();
    let token = CancellationToken::new();

    let text_symbols = session
        .enumerate_symbols_in_binary_section(".text", &token)
        .unwrap();
    let names: Vec<&str> = text_symbols.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["FunctionA", "FunctionB"]);

    let pdata_symbols = session
        .enumerate_symbols_in_binary_section(".pdata", &token)
        .unwrap();
    assert_eq!(pdata_symbols.len(), 2);
    assert!(pdata_symbols[0].name().starts_with("[pdata] FunctionA"));
    assert!(pdata_symbols[1].name().starts_with("[pdata] FunctionB"));
}

#[test]
fn xdata_coff_group_enumerates_without_the_provider() {
    let session = open_session();
    let token = CancellationToken::new();

    let symbols = session
        .enumerate_symbols_in_coff_group(".xdata", &token)
        .unwrap();
    assert_eq!(symbols.len(), 1);
    // Both pdata entries share this record; the first target discovered names it
    assert_eq!(symbols[0].name(), "[unwind] FunctionA");
    assert_eq!(symbols[0].virtual_size(), 8);
}

#[test]
fn comdat_fold_group_resolves_to_one_canonical_owner() {
    let session = open_session();
    let token = CancellationToken::new();

    let rdata = session
        .enumerate_symbols_in_coff_group(".rdata", &token)
        .unwrap();

    let alpha = rdata.iter().find(|s| s.name() == "alpha_table").unwrap();
    let zeta = rdata.iter().find(|s| s.name() == "zeta_table").unwrap();

    // Exactly one member owns the bytes; the other keeps its name but loses its size
    assert!(!alpha.is_comdat_folded());
    assert_eq!(alpha.size(), 0x80);
    assert!(zeta.is_comdat_folded());
    assert_eq!(zeta.size(), 0);
    assert_eq!(alpha.canonical_name(), "alpha_table");
    assert_eq!(zeta.canonical_name(), "alpha_table");
}

#[test]
fn symbol_at_rva_resolves_to_the_canonical_member() {
    let session = open_session();

    // Wherever the lookup lands inside the folded bytes, the canonical member wins
    for rva in [0x2000, 0x2040, 0x207F] {
        let symbol = session.symbol_at_rva(rva).unwrap();
        assert_eq!(symbol.name(), "alpha_table");
        assert!(!symbol.is_comdat_folded());
    }

    // Re-resolving is stable
    let first = session.symbol_at_rva(0x2000).unwrap();
    let second = session.symbol_at_rva(0x2000).unwrap();
    assert_eq!(first.name(), second.name());
}

#[test]
fn fold_group_enumeration_includes_the_canonical_member() {
    let session = open_session();
    let token = CancellationToken::new();

    let group = session.symbols_folded_at_rva(0x2000, &token).unwrap();
    assert_eq!(group.len(), 2);

    let non_folded: Vec<_> = group.iter().filter(|s| !s.is_comdat_folded()).collect();
    assert_eq!(non_folded.len(), 1);
    assert_eq!(non_folded[0].name(), "alpha_table");

    for member in &group {
        assert_eq!(member.canonical_name(), "alpha_table");
    }

    // An un-folded RVA yields just its one symbol
    let singleton = session.symbols_folded_at_rva(0x1000, &token).unwrap();
    assert_eq!(singleton.len(), 1);
    assert_eq!(singleton[0].name(), "FunctionA");
}

#[test]
fn pdata_bytes_attribute_to_the_target_functions_owners() {
    let session = open_session();

    // Scenario: two compilands each contributed one function; each must own exactly
    // its own pdata bytes, and the library must own the union.
    let a = session
        .compilands()
        .iter()
        .find(|c| c.name() == "a.obj")
        .unwrap();
    let b = session
        .compilands()
        .iter()
        .find(|c| c.name() == "b.obj")
        .unwrap();

    assert_eq!(
        a.contributions.coff_group_contributions().unwrap()[".pdata"]
            .size()
            .unwrap(),
        12
    );
    assert_eq!(
        b.contributions.coff_group_contributions().unwrap()[".pdata"]
            .size()
            .unwrap(),
        12
    );

    let library = session
        .libraries()
        .iter()
        .find(|l| l.name() == "static1.lib")
        .unwrap();
    assert_eq!(
        library.contributions.section_contributions().unwrap()[".pdata"]
            .size()
            .unwrap(),
        24
    );
}

#[test]
fn enumerating_by_compiland_returns_its_symbols() {
    let session = open_session();
    let token = CancellationToken::new();

    let symbols = session
        .enumerate_symbols_in_compiland("a.obj", &token)
        .unwrap();
    let names: Vec<&str> = symbols.iter().map(|s| s.name()).collect();

    // FunctionA from .text, the folded pair from .rdata, and a.obj's pdata entry
    assert!(names.contains(&"FunctionA"));
    assert!(names.contains(&"alpha_table"));
    assert!(names.contains(&"zeta_table"));
    assert!(names.iter().any(|n| n.starts_with("[pdata] FunctionA")));
    assert!(!names.contains(&"FunctionB"));
}

#[test]
fn placement_locates_symbols_on_every_axis() {
    let session = open_session();

    let function = session.symbol_at_rva(0x1000).unwrap();
    let placement = session.symbol_placement(&function).unwrap();

    let section = placement.binary_section_index.unwrap();
    assert_eq!(session.binary_sections()[section].name(), ".text");
    let group = placement.coff_group_index.unwrap();
    assert_eq!(session.coff_groups()[group].name(), ".text$mn");
    let library = placement.library_index.unwrap();
    assert_eq!(session.libraries()[library].name(), "static1.lib");
    let compiland = placement.compiland_index.unwrap();
    assert_eq!(session.compilands()[compiland].name(), "a.obj");
    let source_file = placement.source_file_index.unwrap();
    assert_eq!(session.source_files()[source_file].name(), "a.cpp");
}

#[test]
fn pe_synthesized_symbols_have_no_source_file() {
    let session = open_session();

    let pdata_symbol = session.symbol_at_rva(0x7000).unwrap();
    assert!(pdata_symbol.name().starts_with("[pdata]"));

    let placement = session.symbol_placement(&pdata_symbol).unwrap();
    assert!(placement.source_file_index.is_none());
    // But the bytes still attribute to the compiland that owns the target function
    let compiland = placement.compiland_index.unwrap();
    assert_eq!(session.compilands()[compiland].name(), "a.obj");
}

#[test]
fn parsing_twice_is_deterministic() {
    let first = open_session();
    let second = open_session();

    for (a, b) in first.compilands().iter().zip(second.compilands()) {
        assert_eq!(a.name(), b.name());
        assert_eq!(
            a.contributions.size().unwrap(),
            b.contributions.size().unwrap()
        );
    }

    let token = CancellationToken::new();
    let group_a = first.symbols_folded_at_rva(0x2000, &token).unwrap();
    let group_b = second.symbols_folded_at_rva(0x2000, &token).unwrap();
    for (a, b) in group_a.iter().zip(&group_b) {
        assert_eq!(a.canonical_name(), b.canonical_name());
        assert_eq!(a.is_comdat_folded(), b.is_comdat_folded());
    }
}

#[test]
fn mismatched_debug_signature_is_rejected_at_open() {
    let provider = FakeProvider {
        signature: Some((guid!("ffffffff-ffff-ffff-ffff-ffffffffffff"), 9)),
        ..build_provider()
    };

    let result = Session::open_mem(
        build_image(),
        provider,
        SessionOptions::default(),
        &CancellationToken::new(),
    );
    match result {
        Err(Error::DebugInfoMismatch { message }) => {
            assert!(message.contains("age 1"));
            assert!(message.contains("age 9"));
        }
        other => panic!("expected DebugInfoMismatch, got {other:?}"),
    }
}

#[test]
fn minimal_debug_databases_are_rejected_at_open() {
    let provider = FakeProvider {
        minimal: true,
        ..build_provider()
    };

    let result = Session::open_mem(
        build_image(),
        provider,
        SessionOptions::default(),
        &CancellationToken::new(),
    );
    assert!(matches!(result, Err(Error::MinimalDebugInfo)));
}

#[test]
fn managed_binaries_are_rejected_at_open() {
    let image = ImageBuilder::x64()
        .section(".text", 0x1000, 0x200, CODE, vec![0_u8; 0x200])
        .directory(14, 0x1000, 0x48) // a CLR runtime header
        .build();

    let result = Session::open_mem(
        image,
        FakeProvider::default(),
        SessionOptions::default(),
        &CancellationToken::new(),
    );
    assert!(matches!(result, Err(Error::ManagedBinary)));
}

#[test]
fn x86_sessions_never_expose_an_xdata_coff_group() {
    let image = ImageBuilder::x86()
        .section(".text", 0x1000, 0x180, CODE, vec![0_u8; 0x180])
        .build();

    let provider = FakeProvider {
        coff_groups: vec![coff_group(".text$mn", 0x1000, 0x180, CODE)],
        symbols: vec![symbol(1, 0x1000, 0x180, "Everything", SymbolRecordKind::Function)],
        ..FakeProvider::default()
    };

    let session = Session::open_mem(
        image,
        provider,
        SessionOptions::default(),
        &CancellationToken::new(),
    )
    .unwrap();

    assert!(session.coff_groups().iter().all(|g| g.name() != ".xdata"));

    // A database claiming a 32-bit image has an .xdata group is describing some
    // other binary, and the open fails loudly
    let image = ImageBuilder::x86()
        .section(".text", 0x1000, 0x180, CODE, vec![0_u8; 0x180])
        .build();
    let lying_provider = FakeProvider {
        coff_groups: vec![
            coff_group(".text$mn", 0x1000, 0x100, CODE),
            coff_group(".xdata", 0x1100, 0x80, CODE),
        ],
        ..FakeProvider::default()
    };
    let result = Session::open_mem(
        image,
        lying_provider,
        SessionOptions::default(),
        &CancellationToken::new(),
    );
    assert!(matches!(result, Err(Error::Malformed { .. })));
}

#[test]
fn unattributed_section_bytes_fail_the_fill_check() {
    let session = open_session();
    let token = CancellationToken::new();

    // Shrink the tolerance below .rdata's trailing slack (10 bytes) to prove the
    // knob drives the check
    let strict = Session::open_mem(
        build_image(),
        build_provider(),
        SessionOptions {
            max_padding_tolerance: 4,
        },
        &token,
    )
    .unwrap();

    assert!(session
        .enumerate_symbols_in_coff_group(".rdata", &token)
        .is_ok());
    assert!(matches!(
        strict.enumerate_symbols_in_coff_group(".rdata", &token),
        Err(Error::AttributionGap { .. })
    ));
}

#[test]
fn cancellation_surfaces_as_an_error_not_a_partial_result() {
    let session = open_session();
    let token = CancellationToken::new();
    token.cancel();

    assert!(matches!(
        session.enumerate_symbols_in_binary_section(".text", &token),
        Err(Error::Cancelled)
    ));
}

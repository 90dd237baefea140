//! Exception-directory parsing against synthetic images: x64 plain/chained/FH3/FH4
//! records, ARM packed and forwarder entries, and the x86 no-pdata rule.

mod common;

use common::*;
use sizescope::pe::{self, EhParseResult};
use sizescope::prelude::*;

fn put_u32(buf: &mut Vec<u8>, offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Builds the x64 test image shared by several tests.
///
/// .text at 0x1000, .rdata (xdata home) at 0x4000 spanning 0x2000 bytes, .pdata at
/// 0x7000 holding 80 RUNTIME_FUNCTIONs (0x3C0 bytes). Entry 69 (directory RVA 0x733C)
/// targets the function at 0x30D0 with a plain 20-byte unwind record at 0x4BB0.
fn build_x64_image() -> Vec<u8> {
    // One plain unwind record everyone shares, plus the special records
    let mut rdata = vec![0_u8; 0x2000];

    // 0x4B00: shared plain unwind: version 1, no flags, 8 unwind codes -> 20 bytes
    rdata[0xB00] = 0x01;
    rdata[0xB02] = 8;

    // 0x4BB0: the scenario-1 record, same shape
    rdata[0xBB0] = 0x01;
    rdata[0xBB2] = 8;

    // 0x4C00: chained record: version 1, UNW_FLAG_CHAININFO, 0 codes, then the
    // parent RUNTIME_FUNCTION {0x30D0, 0x30F0, 0x4BB0} -> 16 bytes
    rdata[0xC00] = 0x21;
    put_u32(&mut rdata, 0xC04, 0x30D0);
    put_u32(&mut rdata, 0xC08, 0x30F0);
    put_u32(&mut rdata, 0xC0C, 0x4BB0);

    // 0x4D00: EHANDLER record with __CxxFrameHandler3 and a FuncInfo at 0x5000
    rdata[0xD00] = 0x09; // version 1, UNW_FLAG_EHANDLER
    put_u32(&mut rdata, 0xD04, 0x3F00); // handler RVA
    put_u32(&mut rdata, 0xD08, 0x5000); // FuncInfo RVA

    // 0x4E00: EHANDLER record naming an unknown handler in MASM-built code
    rdata[0xE00] = 0x09;
    put_u32(&mut rdata, 0xE04, 0x3E00);

    // 0x4F00: EHANDLER record with __CxxFrameHandler4 and a FuncInfo4 at 0x5800
    rdata[0xF00] = 0x09;
    put_u32(&mut rdata, 0xF04, 0x3F10);
    put_u32(&mut rdata, 0xF08, 0x5800);

    // 0x5000: FH3 FuncInfo: magic, 2 unwind states at 0x5100, 1 try block at 0x5200,
    // 3 ip2state entries at 0x5300
    put_u32(&mut rdata, 0x1000, 0x1993_0522);
    put_u32(&mut rdata, 0x1004, 2);
    put_u32(&mut rdata, 0x1008, 0x5100);
    put_u32(&mut rdata, 0x100C, 1);
    put_u32(&mut rdata, 0x1010, 0x5200);
    put_u32(&mut rdata, 0x1014, 3);
    put_u32(&mut rdata, 0x1018, 0x5300);

    // 0x5200: the try block: 2 catches, handler array at 0x5400
    put_u32(&mut rdata, 0x120C, 2);
    put_u32(&mut rdata, 0x1210, 0x5400);

    // 0x5800: FH4 FuncInfo4: header has UnwindMap | TryBlockMap, then three i32
    // displacements -> 13 bytes total
    rdata[0x1800] = 0x18;
    put_u32(&mut rdata, 0x1801, 0x5900);
    put_u32(&mut rdata, 0x1805, 0x5A00);
    put_u32(&mut rdata, 0x1809, 0x5B00);

    // 0x5900: FH4 unwind map: count 2, two NoUW entries -> 3 bytes
    rdata[0x1900] = 0x04;
    rdata[0x1901] = 0x08;
    rdata[0x1902] = 0x08;

    // 0x5A00: FH4 try map: count 1, entry {0, 0, 1, handler array 0x5C00} -> 8 bytes
    rdata[0x1A00] = 0x02;
    rdata[0x1A01] = 0x00;
    rdata[0x1A02] = 0x00;
    rdata[0x1A03] = 0x02;
    put_u32(&mut rdata, 0x1A04, 0x5C00);

    // 0x5B00: FH4 ip2state map: count 2, two (delta, state+1) pairs -> 5 bytes
    rdata[0x1B00] = 0x04;
    rdata[0x1B01] = 0x20;
    rdata[0x1B02] = 0x02;
    rdata[0x1B03] = 0x40;
    rdata[0x1B04] = 0x04;

    // 0x5C00: FH4 handler map: count 1, minimal entry (header 0, dispOfHandler) -> 6 bytes
    rdata[0x1C00] = 0x02;
    rdata[0x1C01] = 0x00;
    put_u32(&mut rdata, 0x1C02, 0x1111);

    // The exception directory: 80 entries of 12 bytes
    let mut pdata = Vec::with_capacity(0x3C0);
    for i in 0..80_u32 {
        let (begin, end, unwind): (u32, u32, u32) = match i {
            0 => (0x1000, 0x1008, 0x4C00),
            1 => (0x1010, 0x1018, 0x4D00),
            2 => (0x1020, 0x1028, 0x4E00),
            3 => (0x1030, 0x1038, 0x4F00),
            69 => (0x30D0, 0x30F0, 0x4BB0),
            _ => (0x1000 + i * 0x10, 0x1008 + i * 0x10, 0x4B00),
        };
        pdata.extend_from_slice(&begin.to_le_bytes());
        pdata.extend_from_slice(&end.to_le_bytes());
        pdata.extend_from_slice(&unwind.to_le_bytes());
    }

    ImageBuilder::x64()
        .section(".text", 0x1000, 0x3000, CODE, vec![0_u8; 0x3000])
        .section(".rdata", 0x4000, 0x2000, RDATA, rdata)
        .section(".pdata", 0x7000, 0x3C0, RDATA, pdata)
        .directory(3, 0x7000, 0x3C0)
        .build()
}

fn x64_provider() -> FakeProvider {
    FakeProvider {
        symbols: vec![
            symbol(1, 0x30D0, 0x20, "MaybeThrow", SymbolRecordKind::Function),
            symbol(2, 0x1010, 0x10, "Thrower", SymbolRecordKind::Function),
            symbol(3, 0x3F00, 0x10, "__CxxFrameHandler3", SymbolRecordKind::Function),
            symbol(4, 0x3F10, 0x10, "__CxxFrameHandler4", SymbolRecordKind::Function),
        ],
        compilands: vec![CompilandRecord {
            name: "masm_code.obj".to_string(),
            lib_name: String::new(),
            language: CompilandLanguage::Masm,
            contributions: vec![contribution(0x1020, 0x10)],
        }],
        ..FakeProvider::default()
    }
}

fn parse_x64() -> EhParseResult {
    let file = File::from_mem(build_x64_image()).unwrap();
    let provider = x64_provider();
    pe::parse_eh_symbols(
        &file,
        &provider,
        MachineType::X64,
        None,
        &CancellationToken::new(),
    )
    .unwrap()
}

#[test]
fn pdata_directory_yields_one_symbol_per_entry() {
    let result = parse_x64();

    assert_eq!(
        result.pdata_rva_range,
        Some(RvaRange::from_rva_and_size(0x7000, 0x3C0, false))
    );
    assert_eq!(result.pdata_symbols_by_rva.len(), 80);

    // The scenario-1 entry: pdata at 0x733C targeting 0x30D0
    let entry = &result.pdata_symbols_by_rva[&0x733C];
    assert_eq!(entry.kind, EhSymbolKind::Pdata);
    assert_eq!(entry.size, 12);
    assert_eq!(entry.target_start_rva, 0x30D0);
    assert_eq!(entry.name, "[pdata] MaybeThrow");
}

#[test]
fn plain_unwind_record_is_sized_and_named_from_its_target() {
    let result = parse_x64();

    let unwind = &result.xdata_symbols_by_rva[&0x4BB0];
    assert_eq!(unwind.kind, EhSymbolKind::UnwindInfo);
    assert_eq!(unwind.size, 20);
    assert_eq!(unwind.target_start_rva, 0x30D0);
    assert_eq!(unwind.name, "[unwind] MaybeThrow");
}

#[test]
fn chain_unwind_links_to_a_non_chained_parent() {
    let result = parse_x64();

    let chain = &result.xdata_symbols_by_rva[&0x4C00];
    assert_eq!(chain.kind, EhSymbolKind::ChainUnwindInfo);
    assert_eq!(chain.size, 16);

    // Every chain's implied parent must exist and itself be non-chained
    for symbol in result.xdata_symbols_by_rva.values() {
        if symbol.kind == EhSymbolKind::ChainUnwindInfo {
            let parent = &result.xdata_symbols_by_rva[&0x4BB0];
            assert_eq!(parent.kind, EhSymbolKind::UnwindInfo);
        }
    }
}

#[test]
fn fh3_funcinfo_fans_out_into_side_tables() {
    let result = parse_x64();
    let xdata = &result.xdata_symbols_by_rva;

    // The unwind record itself: 4 bytes prefix + 4 handler RVA + 4 FuncInfo RVA
    assert_eq!(xdata[&0x4D00].kind, EhSymbolKind::UnwindInfo);
    assert_eq!(xdata[&0x4D00].size, 12);

    assert_eq!(xdata[&0x5000].kind, EhSymbolKind::CppXdata);
    assert_eq!(xdata[&0x5000].size, 40);
    assert_eq!(xdata[&0x5000].name, "[cppxdata] Thrower");

    assert_eq!(xdata[&0x5100].kind, EhSymbolKind::StateUnwindMap);
    assert_eq!(xdata[&0x5100].size, 16); // 2 states * 8

    assert_eq!(xdata[&0x5200].kind, EhSymbolKind::TryMap);
    assert_eq!(xdata[&0x5200].size, 20); // 1 try block * 20

    assert_eq!(xdata[&0x5400].kind, EhSymbolKind::HandlerMap);
    assert_eq!(xdata[&0x5400].size, 40); // 2 catches * 20

    assert_eq!(xdata[&0x5300].kind, EhSymbolKind::IpToStateMap);
    assert_eq!(xdata[&0x5300].size, 24); // 3 entries * 8
}

#[test]
fn fh4_compressed_metadata_sizes_come_from_decoding() {
    let result = parse_x64();
    let xdata = &result.xdata_symbols_by_rva;

    assert_eq!(xdata[&0x5800].kind, EhSymbolKind::CppXdata);
    assert_eq!(xdata[&0x5800].size, 13); // header + 3 displacements

    assert_eq!(xdata[&0x5900].kind, EhSymbolKind::StateUnwindMap);
    assert_eq!(xdata[&0x5900].size, 3); // count + 2 NoUW entries

    assert_eq!(xdata[&0x5A00].kind, EhSymbolKind::TryMap);
    assert_eq!(xdata[&0x5A00].size, 8);

    assert_eq!(xdata[&0x5B00].kind, EhSymbolKind::IpToStateMap);
    assert_eq!(xdata[&0x5B00].size, 5);

    assert_eq!(xdata[&0x5C00].kind, EhSymbolKind::HandlerMap);
    assert_eq!(xdata[&0x5C00].size, 6);
}

#[test]
fn unknown_handler_in_masm_code_is_skipped_not_fatal() {
    let result = parse_x64();

    // The record at 0x4E00 named a handler nobody knows, but the target compiland is
    // MASM, which is known to emit unconventional xdata - so the record is skipped
    assert!(!result.xdata_symbols_by_rva.contains_key(&0x4E00));
}

#[test]
fn every_xdata_symbol_lands_in_the_computed_ranges() {
    let result = parse_x64();

    for symbol in result.xdata_symbols_by_rva.values() {
        assert!(result.xdata_rva_ranges.contains(symbol.rva));
        assert!(result.xdata_rva_ranges.contains(symbol.rva_end()));
    }
}

#[test]
fn arm32_pdata_forms() {
    // Three entry forms: exception-info, packed unwind data, forwarder
    let mut rdata = vec![0_u8; 0x100];
    // Version 0, E bit set (single packed epilog scope), 1 unwind code word (ARM32
    // bits 28-31) -> record size 4 + 4 = 8
    let xdata_word: u32 = (1 << 21) | (1 << 28) | 0x40;
    rdata[0..4].copy_from_slice(&xdata_word.to_le_bytes());

    let mut pdata = Vec::new();
    for (begin, metadata) in [
        (0x1001_u32, 0x3000_u32), // flags 0b00: out-of-line exception info
        (0x1101, 0x0000_0021),    // flags 0b01: packed unwind data
        (0x1201, 0x0000_0013),    // flags 0b11: forwarder
    ] {
        pdata.extend_from_slice(&begin.to_le_bytes());
        pdata.extend_from_slice(&metadata.to_le_bytes());
    }

    let image = ImageBuilder::arm()
        .section(".text", 0x1000, 0x1000, CODE, vec![0_u8; 0x400])
        .section(".pdata", 0x2000, 24, RDATA, pdata)
        .section(".rdata", 0x3000, 0x100, RDATA, rdata)
        .directory(3, 0x2000, 24)
        .build();

    let file = File::from_mem(image).unwrap();
    let provider = FakeProvider::default();
    let result = pe::parse_eh_symbols(
        &file,
        &provider,
        MachineType::Arm,
        None,
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.pdata_symbols_by_rva.len(), 3);
    assert_eq!(
        result.pdata_symbols_by_rva[&0x2000].kind,
        EhSymbolKind::Pdata
    );
    // The Thumb2 bit is masked off the target
    assert_eq!(result.pdata_symbols_by_rva[&0x2000].target_start_rva, 0x1000);
    assert_eq!(
        result.pdata_symbols_by_rva[&0x2008].kind,
        EhSymbolKind::PackedUnwindDataPdata
    );
    assert_eq!(
        result.pdata_symbols_by_rva[&0x2010].kind,
        EhSymbolKind::ForwarderPdata
    );

    // Only the exception-info entry generated xdata
    assert_eq!(result.xdata_symbols_by_rva.len(), 1);
    let unwind = &result.xdata_symbols_by_rva[&0x3000];
    assert_eq!(unwind.kind, EhSymbolKind::UnwindInfo);
    assert_eq!(unwind.size, 8);
}

#[test]
fn x86_images_have_no_pdata_or_xdata() {
    let image = ImageBuilder::x86()
        .section(".text", 0x1000, 0x200, CODE, vec![0_u8; 0x200])
        .build();

    let file = File::from_mem(image).unwrap();
    let provider = FakeProvider::default();
    let result = pe::parse_eh_symbols(
        &file,
        &provider,
        MachineType::I386,
        None,
        &CancellationToken::new(),
    )
    .unwrap();

    assert_eq!(result.pdata_rva_range, None);
    assert!(result.pdata_symbols_by_rva.is_empty());
    assert!(result.xdata_symbols_by_rva.is_empty());
    assert!(result.xdata_rva_ranges.is_empty());
}

#[test]
fn cancellation_stops_pdata_enumeration() {
    let file = File::from_mem(build_x64_image()).unwrap();
    let provider = x64_provider();
    let token = CancellationToken::new();
    token.cancel();

    let result = pe::parse_eh_symbols(&file, &provider, MachineType::X64, None, &token);
    assert!(matches!(result, Err(Error::Cancelled)));
}

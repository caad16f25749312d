//! Pipeline tests on a synthesized 32-bit DLL.
//!
//! The fixture is built in memory rather than checked in: three sections,
//! an export surface mixing named, ordinal-only and forwarded entries, one
//! import from KERNEL32, and a relocation page covering the two absolute
//! operands in the code section.

use rewriter::pe::writer::write_image;
use rewriter::pe::{ExportInfo, ImageLayout, PeParser, DIR_EXPORT, DIR_IMPORT};
use rewriter::transforms::{InstrumentTransform, Transform, TransformContext};
use rewriter::{ReferenceType, RelativeAddress};

const IMAGE_BASE: u32 = 0x1000_0000;

fn put(image: &mut [u8], offset: usize, bytes: &[u8]) {
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn put16(image: &mut [u8], offset: usize, value: u16) {
    put(image, offset, &value.to_le_bytes());
}

fn put32(image: &mut [u8], offset: usize, value: u32) {
    put(image, offset, &value.to_le_bytes());
}

/// A minimal well-formed DLL. Sections: `.text` at rva 0x1000 (file 0x400),
/// `.rdata` at 0x2000 (file 0x600), `.reloc` at 0x3000 (file 0x800).
fn fixture_dll() -> Vec<u8> {
    let mut file = vec![0u8; 0xa00];

    file[0] = b'M';
    file[1] = b'Z';
    put32(&mut file, 0x3c, 0x40); // e_lfanew

    let mut nt = Vec::new();
    nt.extend_from_slice(b"PE\0\0");
    nt.extend_from_slice(&0x014cu16.to_le_bytes()); // i386
    nt.extend_from_slice(&3u16.to_le_bytes()); // NumberOfSections
    nt.extend_from_slice(&[0u8; 12]); // timestamp, symbol table
    nt.extend_from_slice(&0xe0u16.to_le_bytes()); // SizeOfOptionalHeader
    nt.extend_from_slice(&0x2102u16.to_le_bytes()); // EXECUTABLE | 32BIT | DLL

    nt.extend_from_slice(&0x010bu16.to_le_bytes()); // PE32 magic
    nt.extend_from_slice(&[9, 0]); // linker version
    nt.extend_from_slice(&0x200u32.to_le_bytes()); // SizeOfCode
    nt.extend_from_slice(&0x400u32.to_le_bytes()); // SizeOfInitializedData
    nt.extend_from_slice(&0u32.to_le_bytes()); // SizeOfUninitializedData
    nt.extend_from_slice(&0x1020u32.to_le_bytes()); // entry point: DllMain
    nt.extend_from_slice(&0x1000u32.to_le_bytes()); // BaseOfCode
    nt.extend_from_slice(&0x2000u32.to_le_bytes()); // BaseOfData
    nt.extend_from_slice(&IMAGE_BASE.to_le_bytes());
    nt.extend_from_slice(&0x1000u32.to_le_bytes()); // SectionAlignment
    nt.extend_from_slice(&0x200u32.to_le_bytes()); // FileAlignment
    nt.extend_from_slice(&[5, 0, 1, 0]); // OS version 5.1
    nt.extend_from_slice(&[0, 0, 0, 0]); // image version
    nt.extend_from_slice(&[5, 0, 1, 0]); // subsystem version 5.1
    nt.extend_from_slice(&0u32.to_le_bytes()); // Win32VersionValue
    nt.extend_from_slice(&0x4000u32.to_le_bytes()); // SizeOfImage
    nt.extend_from_slice(&0x400u32.to_le_bytes()); // SizeOfHeaders
    nt.extend_from_slice(&0u32.to_le_bytes()); // CheckSum
    nt.extend_from_slice(&2u16.to_le_bytes()); // WINDOWS_GUI
    nt.extend_from_slice(&0x0140u16.to_le_bytes()); // DYNAMIC_BASE | NX
    nt.extend_from_slice(&0x0010_0000u32.to_le_bytes()); // stack reserve
    nt.extend_from_slice(&0x1000u32.to_le_bytes()); // stack commit
    nt.extend_from_slice(&0x0010_0000u32.to_le_bytes()); // heap reserve
    nt.extend_from_slice(&0x1000u32.to_le_bytes()); // heap commit
    nt.extend_from_slice(&0u32.to_le_bytes()); // LoaderFlags
    nt.extend_from_slice(&16u32.to_le_bytes()); // NumberOfRvaAndSizes
    for i in 0..16usize {
        let (rva, size) = match i {
            0 => (0x2000u32, 0xdeu32), // exports
            1 => (0x2100, 0x28),       // imports
            5 => (0x3000, 12),         // base relocations
            _ => (0, 0),
        };
        nt.extend_from_slice(&rva.to_le_bytes());
        nt.extend_from_slice(&size.to_le_bytes());
    }
    for (name, vsize, va, raw_off, characteristics) in [
        (&b".text\0\0\0"[..], 0x200u32, 0x1000u32, 0x400u32, 0x6000_0020u32),
        (&b".rdata\0\0"[..], 0x15e, 0x2000, 0x600, 0x4000_0040),
        (&b".reloc\0\0"[..], 0xc, 0x3000, 0x800, 0x4200_0040),
    ] {
        nt.extend_from_slice(name);
        nt.extend_from_slice(&vsize.to_le_bytes());
        nt.extend_from_slice(&va.to_le_bytes());
        nt.extend_from_slice(&0x200u32.to_le_bytes()); // SizeOfRawData
        nt.extend_from_slice(&raw_off.to_le_bytes());
        nt.extend_from_slice(&[0u8; 12]); // relocation and line number fields
        nt.extend_from_slice(&characteristics.to_le_bytes());
    }
    assert_eq!(nt.len(), 4 + 20 + 0xe0 + 3 * 0x28);
    put(&mut file, 0x40, &nt);

    // .text: stub functions at 0x10 strides, int3 fill between them.
    file[0x400..0x600].fill(0xcc);
    put(&mut file, 0x400, &[0xb8, 1, 0, 0, 0, 0xc3]); // rva 0x1000, ordinal-only
    put(&mut file, 0x410, &[0xb8, 2, 0, 0, 0, 0xc3]); // rva 0x1010, TestExport
    put(&mut file, 0x420, &[0xb8, 1, 0, 0, 0, 0xc2, 0x0c, 0x00]); // rva 0x1020, DllMain
    put(&mut file, 0x430, &[0xb8, 3, 0, 0, 0, 0xc3]); // rva 0x1030, function3
    put(&mut file, 0x440, &[0xb8, 4, 0, 0, 0, 0xc3]); // rva 0x1040, function1
    put(&mut file, 0x450, &[0xa1, 0, 0, 0, 0, 0xc3]); // mov eax, [export directory]
    put32(&mut file, 0x451, IMAGE_BASE + 0x2000);
    put(&mut file, 0x460, &[0xb8, 0, 0, 0, 0, 0xc3]); // mov eax, offset first function
    put32(&mut file, 0x461, IMAGE_BASE + 0x1000);

    // Export directory at rva 0x2000.
    put32(&mut file, 0x60c, 0x20d2); // dll name
    put32(&mut file, 0x610, 1); // ordinal base
    put32(&mut file, 0x614, 17); // address table entries
    put32(&mut file, 0x618, 5); // named entries
    put32(&mut file, 0x61c, 0x2028); // address table
    put32(&mut file, 0x620, 0x206c); // name pointer table
    put32(&mut file, 0x624, 0x2080); // ordinal table
    for (index, rva) in [
        (0usize, 0x1000u32),
        (1, 0x1010),
        (6, 0x1020),
        (8, 0x1030),
        (12, 0x20bd), // forwarder string, inside the directory range
        (16, 0x1040),
    ] {
        put32(&mut file, 0x628 + index * 4, rva);
    }
    for (i, rva) in [0x208au32, 0x2096, 0x209e, 0x20a9, 0x20b3].into_iter().enumerate() {
        put32(&mut file, 0x66c + i * 4, rva);
    }
    for (i, ordinal_index) in [12u16, 6, 1, 16, 8].into_iter().enumerate() {
        put16(&mut file, 0x680 + i * 2, ordinal_index);
    }
    put(&mut file, 0x68a, b"CreateFileW");
    put(&mut file, 0x696, b"DllMain");
    put(&mut file, 0x69e, b"TestExport");
    put(&mut file, 0x6a9, b"function1");
    put(&mut file, 0x6b3, b"function3");
    put(&mut file, 0x6bd, b"KERNEL32.CreateFileW");
    put(&mut file, 0x6d2, b"fixture.dll");

    // Import descriptor for KERNEL32 at rva 0x2100, then the terminator.
    put32(&mut file, 0x700, 0x2128); // OriginalFirstThunk
    put32(&mut file, 0x70c, 0x2140); // Name
    put32(&mut file, 0x710, 0x2130); // FirstThunk
    put32(&mut file, 0x728, 0x2150); // INT entry
    put32(&mut file, 0x730, 0x2150); // IAT entry
    put(&mut file, 0x740, b"KERNEL32.dll");
    put(&mut file, 0x752, b"CreateFileW"); // hint-name entry, hint 0 at 0x750

    // One relocation page covering both absolute operands.
    put32(&mut file, 0x800, 0x1000);
    put32(&mut file, 0x804, 12);
    put16(&mut file, 0x808, 0x3051);
    put16(&mut file, 0x80a, 0x3061);

    file
}

/// The base fixture plus a one-entry resource tree at rva 0x2160 and a TLS
/// directory at 0x21a0, both in `.rdata` free space.
fn fixture_dll_with_resources_and_tls() -> Vec<u8> {
    let mut file = fixture_dll();
    // Data-directory slots live at file 0xb8 + 8 * index.
    put32(&mut file, 0xc8, 0x2160); // resources
    put32(&mut file, 0xcc, 0x40);
    put32(&mut file, 0x100, 0x21a0); // TLS
    put32(&mut file, 0x104, 0x18);

    // Root resource directory with a single id entry whose data entry (at
    // +0x20) points at an 8-byte blob (at +0x30).
    put16(&mut file, 0x76c, 0); // named entries
    put16(&mut file, 0x76e, 1); // id entries
    put32(&mut file, 0x770, 6); // entry id
    put32(&mut file, 0x774, 0x20); // data entry offset
    put32(&mut file, 0x780, 0x2190); // data rva
    put32(&mut file, 0x784, 8); // data size
    put(&mut file, 0x790, b"RESDATA\0");

    // TLS: template at [0x21c0, 0x21c8), index slot at 0x21c8, callback
    // array at 0x21d0 holding function3 and the terminator.
    put32(&mut file, 0x7a0, IMAGE_BASE + 0x21c0);
    put32(&mut file, 0x7a4, IMAGE_BASE + 0x21c8);
    put32(&mut file, 0x7a8, IMAGE_BASE + 0x21c8);
    put32(&mut file, 0x7ac, IMAGE_BASE + 0x21d0);
    put32(&mut file, 0x7d0, IMAGE_BASE + 0x1030);
    file
}

fn expected_exports() -> Vec<ExportInfo> {
    vec![
        ExportInfo {
            ordinal: 1,
            name: None,
            rva: Some(RelativeAddress(0x1000)),
            forwarder: None,
        },
        ExportInfo {
            ordinal: 2,
            name: Some("TestExport".into()),
            rva: Some(RelativeAddress(0x1010)),
            forwarder: None,
        },
        ExportInfo {
            ordinal: 7,
            name: Some("DllMain".into()),
            rva: Some(RelativeAddress(0x1020)),
            forwarder: None,
        },
        ExportInfo {
            ordinal: 9,
            name: Some("function3".into()),
            rva: Some(RelativeAddress(0x1030)),
            forwarder: None,
        },
        ExportInfo {
            ordinal: 13,
            name: Some("CreateFileW".into()),
            rva: None,
            forwarder: Some("KERNEL32.CreateFileW".into()),
        },
        ExportInfo {
            ordinal: 17,
            name: Some("function1".into()),
            rva: Some(RelativeAddress(0x1040)),
            forwarder: None,
        },
    ]
}

#[test]
fn export_surface_is_enumerated() {
    let parsed = PeParser::parse(&fixture_dll()).unwrap();
    assert_eq!(parsed.exports, expected_exports());
}

#[test]
fn parse_resolves_entry_point_directories_and_relocations() {
    let parsed = PeParser::parse(&fixture_dll()).unwrap();

    let entry = parsed.header_info.entry_point.unwrap();
    let text = parsed.graph.block(entry.block).unwrap();
    assert_eq!(text.name(), ".text");
    assert_eq!(entry.offset, 0x20);

    assert!(parsed.header_info.data_directories[DIR_EXPORT].is_some());
    assert!(parsed.header_info.data_directories[DIR_IMPORT].is_some());
    assert!(parsed.debug_id.is_none());

    // Both relocated operands became absolute references on the code block.
    for offset in [0x51u32, 0x61] {
        let r = text.reference_at(offset).unwrap();
        assert_eq!(r.kind, ReferenceType::Absolute);
        assert_eq!(r.size, 4);
    }
}

#[test]
fn roundtrip_preserves_the_export_surface() {
    let parsed = PeParser::parse(&fixture_dll()).unwrap();
    let layout = ImageLayout::build(&parsed.graph, &parsed.header_info).unwrap();
    let rewritten = write_image(&parsed.graph, &layout).unwrap();

    let reparsed = PeParser::parse(&rewritten).unwrap();
    assert_eq!(reparsed.exports, parsed.exports);

    let pe = goblin::pe::PE::parse(&rewritten).unwrap();
    assert_eq!(pe.entry as u32, 0x1020);
    assert!(pe.libraries.contains(&"KERNEL32.dll"));
    // The relocation section is regenerated from the graph.
    assert!(pe.sections.iter().any(|s| s.name.starts_with(b".reloc")));
}

#[test]
fn resource_and_tls_structures_get_typed_references() {
    let parsed = PeParser::parse(&fixture_dll_with_resources_and_tls()).unwrap();
    let g = &parsed.graph;

    // The data entry's RVA field references the blob inside the same block.
    let resources = g.blocks().find(|b| b.name() == "!resources").unwrap();
    let entry = resources.reference_at(0x20).unwrap();
    assert_eq!(entry.kind, ReferenceType::Relative);
    assert_eq!((entry.target, entry.target_offset), (resources.id(), 0x30));

    let tls = g.blocks().find(|b| b.name() == "!tls-directory").unwrap();
    let data = g.blocks().find(|b| b.name() == "!tls-data").unwrap();
    let callbacks = g.blocks().find(|b| b.name() == "!tls-callbacks").unwrap();
    assert_eq!(tls.reference_at(0).unwrap().target, data.id());
    let end = tls.reference_at(4).unwrap();
    assert_eq!((end.target, end.target_offset), (data.id(), 8));
    assert!(tls.reference_at(8).is_some()); // index slot
    assert_eq!(tls.reference_at(12).unwrap().target, callbacks.id());
    let callback = callbacks.reference_at(0).unwrap();
    assert_eq!(callback.kind, ReferenceType::Absolute);
}

#[test]
fn relayout_repoints_resource_data() {
    let parsed = PeParser::parse(&fixture_dll_with_resources_and_tls()).unwrap();
    let layout = ImageLayout::build(&parsed.graph, &parsed.header_info).unwrap();
    let rewritten = write_image(&parsed.graph, &layout).unwrap();

    let reparsed = PeParser::parse(&rewritten).unwrap();
    let resources = reparsed
        .graph
        .blocks()
        .find(|b| b.name() == "!resources")
        .unwrap();
    let rva = resources.original_address().unwrap().value();
    let field = u32::from_le_bytes(resources.data()[0x20..0x24].try_into().unwrap());
    assert_eq!(field, rva + 0x30);
    assert_eq!(&resources.data()[0x30..0x38], b"RESDATA\0");
}

#[test]
fn instrumented_image_imports_the_agent_and_routes_the_entry_point() {
    let mut parsed = PeParser::parse(&fixture_dll()).unwrap();
    let mut transform = InstrumentTransform::new("calltrace_agent.dll")
        .with_entry_point(parsed.header_info.entry_point)
        .with_import_directory(parsed.header_info.data_directories[DIR_IMPORT]);
    transform
        .transform(&mut parsed.graph, &TransformContext::default())
        .unwrap();

    // One thunk for the relocated function pointer's target, one for the
    // entry point; only the function pointer is a redirectable site.
    assert_eq!(transform.thunks_created, 2);
    assert_eq!(transform.references_redirected, 1);

    parsed.header_info.entry_point = transform.thunked_entry_point;
    parsed.header_info.data_directories[DIR_IMPORT] = transform.new_import_directory;

    let layout = ImageLayout::build(&parsed.graph, &parsed.header_info).unwrap();
    let rewritten = write_image(&parsed.graph, &layout).unwrap();

    let pe = goblin::pe::PE::parse(&rewritten).unwrap();
    assert!(pe.libraries.contains(&"KERNEL32.dll"));
    assert!(pe.libraries.contains(&"calltrace_agent.dll"));

    let thunks = pe
        .sections
        .iter()
        .find(|s| s.name.starts_with(b".thunks"))
        .unwrap();
    let entry = pe.entry as u32;
    assert!(entry >= thunks.virtual_address);
    assert!(entry < thunks.virtual_address + thunks.virtual_size);
}

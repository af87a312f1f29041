mod common;

use shade_image::format::schema::TableId;
use shade_image::{Editor, ErrorKind, StrongNameKey};

use common::{reparse, SynthAssembly, TEST_KEY_BLOB};

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap())
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

/// Fifty friend grants against a signed, resource-bearing, debug-carrying
/// image: the metadata grows by several kilobytes, later sections shift on
/// disk, and every directory has to stay resolvable.
#[test]
fn test_growth_keeps_directories_resolvable() {
    let key = StrongNameKey::from_blob(TEST_KEY_BLOB).unwrap();
    let data = {
        let mut synth = SynthAssembly::new("Grown")
            .with_types(4, 0x0010_0001)
            .with_ref("mscorlib", &[0xB7, 0x7A, 0x5C, 0x56, 0x19, 0x34, 0xE0, 0x89]);
        synth.public_key = Some(key.public_key_blob().to_vec());
        synth.strong_name_slot = 64;
        synth.debug_data = true;
        synth.resources = true;
        synth.relocs = true;
        synth.build()
    };
    let old_metadata_size = Editor::parse(data.clone()).unwrap().pe().metadata_size;

    let mut editor = Editor::parse(data).unwrap();
    for i in 0..50 {
        editor.add_friend(&format!("Friend.Assembly.Number{i}"), None).unwrap();
    }
    let saved = editor.render_to_vec(Some(&key)).unwrap();

    let (pe, _, tables) = reparse(&saved);
    assert!(pe.metadata_size > old_metadata_size);
    assert_eq!(tables.row_count(TableId::CustomAttribute), 50);

    // The resource directory still lands in .rsrc, relocations in .reloc.
    let resources = pe.data_directories[2];
    let rsrc = pe
        .sections
        .iter()
        .find(|s| s.name_str() == ".rsrc")
        .unwrap();
    assert!(rsrc.contains_rva(resources.virtual_address));

    let relocations = pe.data_directories[5];
    let reloc = pe
        .sections
        .iter()
        .find(|s| s.name_str() == ".reloc")
        .unwrap();
    assert!(reloc.contains_rva(relocations.virtual_address));

    // The debug entry's RVA and file pointer both reach the PDB blob.
    let debug = pe.data_directories[6];
    let entry_offset = pe.rva_to_offset(debug.virtual_address).unwrap() as usize;
    let address_of_raw_data = u32_at(&saved, entry_offset + 20);
    let pointer_to_raw_data = u32_at(&saved, entry_offset + 24);
    assert_eq!(
        pe.rva_to_offset(address_of_raw_data).unwrap(),
        pointer_to_raw_data
    );
    assert_eq!(
        &saved[pointer_to_raw_data as usize..pointer_to_raw_data as usize + 4],
        b"BSJB"
    );

    assert!(shade_image::verify_image(&saved, &key).unwrap());
}

/// Forcing `#Strings` past 2¹⁶ widens every string column and re-encodes
/// every table.
#[test]
fn test_heap_growth_widens_string_indices() {
    let data = {
        let mut synth = SynthAssembly::new("Wide")
            .with_types(5, 0x0010_0001)
            .with_ref("mscorlib", &[0; 8]);
        // Inflate the source heap to roughly 65,400 bytes.
        synth.filler_strings = (0..654)
            .map(|i| format!("{i:04}{}", "f".repeat(95)))
            .collect();
        synth.build()
    };

    let source = Editor::parse(data.clone()).unwrap();
    assert_eq!(source.tables().widths.string, 2);

    let mut editor = Editor::parse(data).unwrap();
    for i in 0..300 {
        let name = format!("{i:04}{}", "n".repeat(86));
        assert_eq!(name.len(), 90);
        editor.add_friend(&name, None).unwrap();
    }
    let saved = editor.render_to_vec(None).unwrap();

    let (pe, metadata, tables) = reparse(&saved);
    assert_eq!(tables.widths.string, 4);
    assert_ne!(tables.header.heap_sizes & 0x1, 0);
    assert_eq!(tables.row_count(TableId::CustomAttribute), 300);

    // Strings old and new resolve through the widened indices.
    let blob = pe.metadata_bytes(&saved);
    let strings = metadata.string_heap(blob).unwrap();
    let stream = metadata.table_stream_bytes(blob).unwrap();

    let assembly = shade_image::format::rows::AssemblyRow::read(
        tables.row_bytes(stream, TableId::Assembly, 1).unwrap(),
        &tables.widths,
    )
    .unwrap();
    assert_eq!(strings.get(assembly.name).unwrap(), "Wide");

    let type_ref = shade_image::format::rows::TypeRefRow::read(
        tables.row_bytes(stream, TableId::TypeRef, 1).unwrap(),
        &tables.widths,
    )
    .unwrap();
    assert_eq!(
        strings.get(type_ref.name).unwrap(),
        "InternalsVisibleToAttribute"
    );

    let last_type = shade_image::format::rows::TypeDefRow::read(
        tables.row_bytes(stream, TableId::TypeDef, 6).unwrap(),
        &tables.widths,
    )
    .unwrap();
    assert_eq!(strings.get(last_type.name).unwrap(), "Type4");

    // Attribute blobs decode behind the widened blob column as well.
    let attribute = shade_image::format::rows::CustomAttributeRow::read(
        tables
            .row_bytes(stream, TableId::CustomAttribute, 1)
            .unwrap(),
        &tables.widths,
    )
    .unwrap();
    let value = metadata.blob_heap(blob).unwrap().get(attribute.value).unwrap();
    assert_eq!(&value[..2], &[0x01, 0x00]);
    assert_eq!(&value[value.len() - 2..], &[0x00, 0x00]);
}

#[test]
fn test_import_tables_shift_with_metadata() {
    let data = {
        let mut synth = SynthAssembly::new("Imports").with_ref("mscorlib", &[0; 8]);
        synth.imports = true;
        synth.build()
    };

    let mut editor = Editor::parse(data).unwrap();
    editor.add_friend("Friend", None).unwrap();
    let saved = editor.render_to_vec(None).unwrap();

    let (pe, _, _) = reparse(&saved);
    let imports = pe.data_directories[1];
    assert_ne!(imports.virtual_address, 0);

    let descriptor = pe.rva_to_offset(imports.virtual_address).unwrap() as usize;
    let original_first_thunk = u32_at(&saved, descriptor);
    let name_rva = u32_at(&saved, descriptor + 12);
    let first_thunk = u32_at(&saved, descriptor + 16);

    let name_offset = pe.rva_to_offset(name_rva).unwrap() as usize;
    assert_eq!(&saved[name_offset..name_offset + 12], b"mscoree.dll\0");

    // Both thunk tables point at the hint/name entry for _CorDllMain.
    for thunk_rva in [original_first_thunk, first_thunk] {
        let thunk_offset = pe.rva_to_offset(thunk_rva).unwrap() as usize;
        let entry = u32_at(&saved, thunk_offset);
        assert_eq!(entry & 0x8000_0000, 0);
        let hint_offset = pe.rva_to_offset(entry).unwrap() as usize;
        assert_eq!(&saved[hint_offset + 2..hint_offset + 13], b"_CorDllMain");
    }

    // The IAT directory shifted along with its table.
    let iat = pe.data_directories[12];
    assert_eq!(iat.virtual_address, first_thunk);
}

#[test]
fn test_reloc_entry_is_repointed() {
    let data = {
        let mut synth = SynthAssembly::new("Reloc").with_ref("mscorlib", &[0; 8]);
        synth.relocs = true;
        synth.reloc_target_in_text = Some(0xE00);
        synth.text_tail = 3300;
        synth.build()
    };
    let old_metadata_size = Editor::parse(data.clone()).unwrap().pe().metadata_size;

    let mut editor = Editor::parse(data).unwrap();
    editor.add_friend("Friend", None).unwrap();
    let saved = editor.render_to_vec(None).unwrap();

    let (pe, _, _) = reparse(&saved);
    let size_diff = pe.metadata_size - old_metadata_size;
    assert!(size_diff > 0);

    let reloc_offset = pe
        .rva_to_offset(pe.data_directories[5].virtual_address)
        .unwrap() as usize;
    // Entry one targets the headers before the metadata and is untouched;
    // entry two sits after the metadata and moves by the growth.
    assert_eq!(u16_at(&saved, reloc_offset + 8), (3 << 12) | 0x0004);
    assert_eq!(
        u16_at(&saved, reloc_offset + 10),
        (3 << 12) | (0xE00 + size_diff as u16)
    );
}

#[test]
fn test_reloc_page_crossing_is_diagnosed() {
    let data = {
        let mut synth = SynthAssembly::new("RelocCross").with_ref("mscorlib", &[0; 8]);
        synth.relocs = true;
        synth.reloc_target_in_text = Some(0xFF0);
        synth.text_tail = 4000;
        synth.build()
    };

    let mut editor = Editor::parse(data).unwrap();
    for i in 0..4 {
        editor.add_friend(&format!("Friend{i}"), None).unwrap();
    }
    let err = editor.render_to_vec(None).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::BrokenReference(_)));
}

#[test]
fn test_custom_attributes_stay_sorted_by_parent() {
    let data = SynthAssembly::new("Sorted")
        .with_types(2, 0x0010_0001)
        .with_ref("mscorlib", &[0; 8])
        .build();

    let mut editor = Editor::parse(data).unwrap();
    for i in 0..5 {
        editor.add_friend(&format!("Friend{i}"), None).unwrap();
    }
    let saved = editor.render_to_vec(None).unwrap();

    let (pe, metadata, tables) = reparse(&saved);
    let blob = pe.metadata_bytes(&saved);
    let stream = metadata.table_stream_bytes(blob).unwrap();

    let mut previous = 0;
    for rid in 1..=tables.row_count(TableId::CustomAttribute) {
        let row = shade_image::format::rows::CustomAttributeRow::read(
            tables.row_bytes(stream, TableId::CustomAttribute, rid).unwrap(),
            &tables.widths,
        )
        .unwrap();
        assert!(row.parent >= previous);
        previous = row.parent;
    }
}

#[test]
fn test_growth_into_next_section_rva_is_rejected() {
    // The synthesized layout leaves one spare page between .text and .rsrc;
    // growing the metadata beyond it cannot be expressed without moving
    // section RVAs.
    let data = {
        let mut synth = SynthAssembly::new("TooBig").with_ref("mscorlib", &[0; 8]);
        synth.resources = true;
        synth.build()
    };

    let mut editor = Editor::parse(data).unwrap();
    for i in 0..80 {
        let filler = "x".repeat(80);
        editor.add_friend(&format!("Friend{i}.{filler}"), None).unwrap();
    }
    let err = editor.render_to_vec(None).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnsupportedImage(_)));
}

//! Shared construction of miniature managed assemblies.
//!
//! The integration tests synthesize images from scratch instead of shipping
//! binary fixtures, so every byte of the input is accounted for by the test
//! itself.

#![allow(dead_code)]

use shade_image::format::rows::{AssemblyRefRow, AssemblyRow, ModuleRow, TypeDefRow};
use shade_image::format::schema::{IndexWidths, TableId};
use shade_image::format::{Metadata, TableStream};
use shade_image::pe::PeImage;

/// A 512-bit RSA key pair as a CAPI RSA2 blob, matching the unit-test key.
pub const TEST_KEY_BLOB: &[u8] = &[
    0x07, 0x02, 0x00, 0x00, 0x00, 0x24, 0x00, 0x00, 0x52, 0x53, 0x41, 0x32,
    0x00, 0x02, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x07, 0x9A, 0xD6, 0x01,
    0x31, 0x52, 0xA7, 0xE6, 0xCB, 0x24, 0x30, 0x0E, 0x0F, 0x4F, 0x70, 0x6D,
    0xA1, 0x60, 0xBD, 0xD4, 0x38, 0x00, 0x2B, 0x8D, 0x3F, 0x92, 0x69, 0xA3,
    0x63, 0x00, 0x4D, 0xFF, 0x1F, 0x9C, 0x64, 0xAF, 0xC3, 0xA2, 0xF4, 0x7A,
    0x92, 0x2A, 0xE7, 0xC4, 0x7B, 0xF6, 0x64, 0x82, 0x6A, 0xDB, 0x8E, 0xAE,
    0xF4, 0xD9, 0x5C, 0x04, 0xB7, 0xDF, 0x78, 0x77, 0x57, 0xA4, 0x14, 0xD6,
    0xC5, 0xF3, 0x10, 0x03, 0x68, 0x3E, 0x94, 0x37, 0xD7, 0x28, 0xB3, 0x79,
    0x3A, 0x10, 0x92, 0xC5, 0xF3, 0x60, 0xEE, 0x30, 0xF0, 0x54, 0x2F, 0xC7,
    0xBD, 0x1A, 0xAA, 0x2D, 0x0B, 0x14, 0xD1, 0xEC, 0x5B, 0x57, 0x98, 0x6F,
    0x62, 0xE9, 0xF6, 0xE7, 0x0B, 0x23, 0x6F, 0x3C, 0x58, 0x75, 0xEB, 0x76,
    0x04, 0x30, 0xD9, 0x55, 0x92, 0x97, 0x22, 0x96, 0x93, 0x71, 0x6D, 0xFA,
    0x97, 0x14, 0x6C, 0xE7, 0x25, 0x13, 0xFB, 0x70, 0x9F, 0x49, 0xEF, 0x75,
    0xEB, 0xD7, 0x44, 0x5C, 0xA6, 0xBB, 0x79, 0x10, 0xD4, 0xDF, 0x0E, 0x97,
    0x84, 0xA7, 0x36, 0x6F, 0x8D, 0x4A, 0x73, 0x2B, 0x09, 0x6A, 0x8C, 0x22,
    0xE3, 0x60, 0xE9, 0x52, 0x98, 0x3B, 0x7E, 0xCF, 0xF1, 0x08, 0x4A, 0xA7,
    0x72, 0xE9, 0x11, 0x96, 0x70, 0x4F, 0xAE, 0x36, 0x77, 0x22, 0x55, 0xD9,
    0x5A, 0x6E, 0xAC, 0x99, 0x59, 0xBA, 0x8B, 0x65, 0x7B, 0x3D, 0x16, 0x23,
    0x1E, 0xFB, 0x69, 0x15, 0x1F, 0x2B, 0xD5, 0x85, 0x06, 0x57, 0xCD, 0xAB,
    0x82, 0x4E, 0x65, 0x50, 0x6F, 0xD1, 0xFE, 0x15, 0x72, 0x28, 0x03, 0xF6,
    0xDB, 0x80, 0x16, 0x4F, 0xD9, 0xEC, 0x39, 0x10, 0x60, 0xA9, 0xEB, 0xE9,
    0x76, 0x79, 0xEA, 0x7B, 0x25, 0x97, 0x5C, 0xF8, 0x1A, 0xB3, 0x67, 0x69,
    0x0A, 0xE3, 0x83, 0x2B, 0x1A, 0xF0, 0x11, 0xE8, 0xB3, 0x63, 0x84, 0x39,
    0xF0, 0xB0, 0x60, 0x51, 0xB7, 0xCA, 0x5C, 0x42, 0x83, 0x59, 0x65, 0x12,
    0xD8, 0x60, 0x12, 0x18, 0x9C, 0x26, 0xEE, 0xAF, 0xB5, 0x2E, 0xC7, 0x94,
    0x14, 0x90, 0x1A, 0x20, 0xB1, 0x1A, 0x68, 0x9B,
];

const TEXT_RVA: u32 = 0x1000;
const FILE_ALIGN: u32 = 0x200;
const SECTION_ALIGN: u32 = 0x1000;

/// An external assembly reference of a synthesized image.
pub struct SynthRef {
    pub name: String,
    /// Public key token bytes; empty for a null identity.
    pub token: Vec<u8>,
}

/// Recipe for a miniature managed PE32 DLL.
pub struct SynthAssembly {
    pub name: String,
    /// Embedded public key blob for the assembly manifest.
    pub public_key: Option<Vec<u8>>,
    /// `(namespace, name, flags)` per type, after the `<Module>` row.
    pub types: Vec<(String, String, u32)>,
    pub refs: Vec<SynthRef>,
    /// Size of the strong-name signature slot, 0 for none.
    pub strong_name_slot: u32,
    /// Place a debug directory and a portable-PDB blob after the metadata.
    pub debug_data: bool,
    /// Add a `.rsrc` section and point data directory 2 at it.
    pub resources: bool,
    /// Add a `.reloc` section with one fixup before the metadata.
    pub relocs: bool,
    /// Add an import table (descriptor, thunks, names) after the metadata.
    pub imports: bool,
    /// Extra reloc entry targeting this RVA offset within `.text`, if any.
    pub reloc_target_in_text: Option<u32>,
    /// Trailing filler appended to `.text` after all other content.
    pub text_tail: usize,
    /// Filler strings to inflate the `#Strings` heap.
    pub filler_strings: Vec<String>,
}

impl SynthAssembly {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            public_key: None,
            types: Vec::new(),
            refs: Vec::new(),
            strong_name_slot: 0,
            debug_data: false,
            resources: false,
            relocs: false,
            imports: false,
            reloc_target_in_text: None,
            text_tail: 0,
            filler_strings: Vec::new(),
        }
    }

    pub fn with_types(mut self, count: usize, flags: u32) -> Self {
        for i in 0..count {
            self.types
                .push(("Synth.Ns".to_string(), format!("Type{i}"), flags));
        }
        self
    }

    pub fn with_ref(mut self, name: &str, token: &[u8]) -> Self {
        self.refs.push(SynthRef {
            name: name.to_string(),
            token: token.to_vec(),
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let metadata = self.build_metadata();
        self.build_container(&metadata)
    }

    fn build_metadata(&self) -> Vec<u8> {
        let mut strings = StringsBuilder::new();
        let mut blobs = BlobsBuilder::new();

        let module_name = strings.intern(&format!("{}.dll", self.name));
        let module_type = strings.intern("<Module>");
        let assembly_name = strings.intern(&self.name);
        let type_indices: Vec<(u32, u32)> = self
            .types
            .iter()
            .map(|(ns, name, _)| (strings.intern(ns), strings.intern(name)))
            .collect();
        let ref_indices: Vec<(u32, u32)> = self
            .refs
            .iter()
            .map(|r| {
                let name = strings.intern(&r.name);
                let token = if r.token.is_empty() {
                    0
                } else {
                    blobs.intern(&r.token)
                };
                (name, token)
            })
            .collect();
        let public_key_index = self.public_key.as_ref().map(|key| blobs.intern(key));
        for filler in &self.filler_strings {
            strings.intern(filler);
        }

        let strings_heap = pad4(strings.bytes);
        let blob_heap = pad4(blobs.bytes);
        let guid_heap: Vec<u8> = (1..=16u8).collect();
        let us_heap = vec![0u8; 4];

        let mut rows = [0u32; 64];
        rows[TableId::Module as usize] = 1;
        rows[TableId::TypeDef as usize] = 1 + self.types.len() as u32;
        rows[TableId::Assembly as usize] = 1;
        rows[TableId::AssemblyRef as usize] = self.refs.len() as u32;

        let widths = IndexWidths::from_heap_lens(
            strings_heap.len() as u64,
            guid_heap.len() as u64,
            blob_heap.len() as u64,
            rows,
        );

        let mut valid = 0u64;
        for table in [TableId::Module, TableId::TypeDef, TableId::Assembly] {
            valid |= 1 << table as u64;
        }
        if !self.refs.is_empty() {
            valid |= 1 << TableId::AssemblyRef as u64;
        }

        let mut tables = Vec::new();
        tables.extend_from_slice(&0u32.to_le_bytes());
        tables.push(2);
        tables.push(0);
        tables.push(widths.heap_sizes_byte());
        tables.push(1);
        tables.extend_from_slice(&valid.to_le_bytes());
        tables.extend_from_slice(&0u64.to_le_bytes());
        for i in 0..64 {
            if valid >> i & 1 == 1 {
                tables.extend_from_slice(&rows[i].to_le_bytes());
            }
        }

        ModuleRow {
            generation: 0,
            name: module_name,
            mvid: 1,
            enc_id: 0,
            enc_base_id: 0,
        }
        .write(&mut tables, &widths);

        TypeDefRow {
            flags: 0,
            name: module_type,
            namespace: 0,
            extends: 0,
            field_list: 1,
            method_list: 1,
        }
        .write(&mut tables, &widths);
        for ((namespace, name), (_, _, flags)) in type_indices.iter().zip(&self.types) {
            TypeDefRow {
                flags: *flags,
                name: *name,
                namespace: *namespace,
                extends: 0,
                field_list: 1,
                method_list: 1,
            }
            .write(&mut tables, &widths);
        }

        AssemblyRow {
            hash_alg_id: 0x8004,
            major_version: 1,
            minor_version: 0,
            build_number: 0,
            revision_number: 0,
            flags: if public_key_index.is_some() { 0x0001 } else { 0 },
            public_key: public_key_index.unwrap_or(0),
            name: assembly_name,
            culture: 0,
        }
        .write(&mut tables, &widths);

        for (name, token) in &ref_indices {
            AssemblyRefRow {
                major_version: 4,
                minor_version: 0,
                build_number: 0,
                revision_number: 0,
                flags: 0,
                public_key_or_token: *token,
                name: *name,
                culture: 0,
                hash_value: 0,
            }
            .write(&mut tables, &widths);
        }
        let tables = pad4(tables);

        // Metadata root around the five standard streams.
        let version = "v4.0.30319";
        let names = ["#~", "#Strings", "#US", "#GUID", "#Blob"];
        let bodies = [&tables, &strings_heap, &us_heap, &guid_heap, &blob_heap];

        let version_padded = align4(version.len() + 1);
        let mut header_size = 16 + version_padded + 4;
        for name in names {
            header_size += 8 + align4(name.len() + 1);
        }

        let mut out = Vec::new();
        p32(&mut out, 0x424A_5342);
        p16(&mut out, 1);
        p16(&mut out, 1);
        p32(&mut out, 0);
        p32(&mut out, version_padded as u32);
        out.extend_from_slice(version.as_bytes());
        out.resize(16 + version_padded, 0);
        p16(&mut out, 0);
        p16(&mut out, names.len() as u16);

        let mut offset = header_size;
        for (name, body) in names.iter().zip(bodies) {
            p32(&mut out, offset as u32);
            p32(&mut out, body.len() as u32);
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.resize(align4(out.len()), 0);
            offset += body.len();
        }
        assert_eq!(out.len(), header_size);

        for body in bodies {
            out.extend_from_slice(body);
        }
        out
    }

    fn build_container(&self, metadata: &[u8]) -> Vec<u8> {
        // Lay out .text: CLI header, signature slot, metadata, then the
        // optional debug and import structures that should shift on resize.
        let mut text = vec![0u8; 72];
        let slot_offset = if self.strong_name_slot > 0 {
            let offset = text.len();
            text.resize(offset + self.strong_name_slot as usize, 0);
            Some(offset)
        } else {
            None
        };
        let metadata_offset = text.len();
        text.extend_from_slice(metadata);

        let debug = if self.debug_data {
            let dir_offset = text.len();
            text.resize(dir_offset + 28, 0);
            let pdb_offset = text.len();
            text.extend_from_slice(b"BSJB");
            text.resize(pdb_offset + 64, 0xBB);
            Some((dir_offset, pdb_offset))
        } else {
            None
        };

        let imports = if self.imports {
            text.resize(align4(text.len()), 0);
            let hint_offset = text.len();
            p16(&mut text, 0);
            text.extend_from_slice(b"_CorDllMain\0");
            let dll_offset = text.len();
            text.extend_from_slice(b"mscoree.dll\0");
            text.resize(align4(text.len()), 0);
            let ilt_offset = text.len();
            p32(&mut text, TEXT_RVA + hint_offset as u32);
            p32(&mut text, 0);
            let iat_offset = text.len();
            p32(&mut text, TEXT_RVA + hint_offset as u32);
            p32(&mut text, 0);
            let desc_offset = text.len();
            p32(&mut text, TEXT_RVA + ilt_offset as u32);
            p32(&mut text, 0);
            p32(&mut text, 0);
            p32(&mut text, TEXT_RVA + dll_offset as u32);
            p32(&mut text, TEXT_RVA + iat_offset as u32);
            text.resize(desc_offset + 40, 0);
            Some((desc_offset, iat_offset))
        } else {
            None
        };

        if self.text_tail > 0 {
            let len = text.len();
            text.resize(len + self.text_tail, 0xCC);
        }

        // CLI header in place.
        let mut cli = Vec::with_capacity(72);
        p32(&mut cli, 72);
        p16(&mut cli, 2);
        p16(&mut cli, 5);
        p32(&mut cli, TEXT_RVA + metadata_offset as u32);
        p32(&mut cli, metadata.len() as u32);
        let signed = slot_offset.is_some() && self.public_key.is_some();
        p32(&mut cli, 0x0000_0001 | if signed { 0x8 } else { 0 });
        p32(&mut cli, 0);
        p32(&mut cli, 0);
        p32(&mut cli, 0);
        match slot_offset {
            Some(offset) => {
                p32(&mut cli, TEXT_RVA + offset as u32);
                p32(&mut cli, self.strong_name_slot);
            }
            None => {
                p32(&mut cli, 0);
                p32(&mut cli, 0);
            }
        }
        cli.resize(72, 0);
        text[..72].copy_from_slice(&cli);

        let text_virtual_size = text.len() as u32;
        let text_raw_size = align_up(text_virtual_size, FILE_ALIGN);
        let headers_raw = FILE_ALIGN;
        let text_raw_offset = headers_raw;

        if let Some((dir_offset, pdb_offset)) = debug {
            let mut entry = Vec::with_capacity(28);
            p32(&mut entry, 0);
            p32(&mut entry, 0x5F00_0000);
            p16(&mut entry, 0x0100);
            p16(&mut entry, 0x504D);
            p32(&mut entry, 2);
            p32(&mut entry, 64);
            p32(&mut entry, TEXT_RVA + pdb_offset as u32);
            p32(&mut entry, text_raw_offset + pdb_offset as u32);
            text[dir_offset..dir_offset + 28].copy_from_slice(&entry);
        }

        // Section layout: leave a page of slack after .text so edits can
        // grow it without moving the later sections' RVAs.
        let mut sections: Vec<(&str, u32, Vec<u8>, u32)> = Vec::new();
        let mut next_rva = align_up(TEXT_RVA + text_virtual_size, SECTION_ALIGN) + SECTION_ALIGN;

        let rsrc_rva = if self.resources {
            let rva = next_rva;
            next_rva += SECTION_ALIGN;
            sections.push((".rsrc", rva, vec![0xEE; 16], 0x4000_0040));
            Some(rva)
        } else {
            None
        };

        let reloc_rva = if self.relocs {
            let rva = next_rva;
            let mut block = Vec::new();
            p32(&mut block, TEXT_RVA);
            let extra = self.reloc_target_in_text;
            p32(&mut block, if extra.is_some() { 16 } else { 12 });
            p16(&mut block, (3 << 12) | 0x0004);
            if let Some(target) = extra {
                assert!(target < 0x1000, "extra reloc target must stay in page one");
                p16(&mut block, (3 << 12) | target as u16);
                p16(&mut block, 0);
            }
            p16(&mut block, 0);
            sections.push((".reloc", rva, block, 0x4200_0040));
            Some(rva)
        } else {
            None
        };

        let mut section_headers = vec![(
            ".text",
            TEXT_RVA,
            text_virtual_size,
            text_raw_size,
            text_raw_offset,
            0x6000_0020u32,
        )];
        let mut raw_offset = text_raw_offset + text_raw_size;
        let mut section_bodies: Vec<(u32, &[u8])> = Vec::new();
        for (name, rva, body, characteristics) in &sections {
            let raw_size = align_up(body.len() as u32, FILE_ALIGN);
            section_headers.push((
                *name,
                *rva,
                body.len() as u32,
                raw_size,
                raw_offset,
                *characteristics,
            ));
            section_bodies.push((raw_offset, body.as_slice()));
            raw_offset += raw_size;
        }

        let size_of_image = section_headers
            .iter()
            .map(|(_, rva, vs, ..)| align_up(rva + vs, SECTION_ALIGN))
            .max()
            .unwrap();
        let size_of_init_data: u32 = section_headers
            .iter()
            .skip(1)
            .map(|(.., raw, _, _)| *raw)
            .sum();

        // Assemble the file.
        let mut out = Vec::new();
        p16(&mut out, 0x5A4D);
        out.resize(0x3C, 0);
        p32(&mut out, 0x80);
        out.resize(0x80, 0);
        out.extend_from_slice(b"PE\0\0");

        p16(&mut out, 0x014C);
        p16(&mut out, section_headers.len() as u16);
        p32(&mut out, 0);
        p32(&mut out, 0);
        p32(&mut out, 0);
        p16(&mut out, 0xE0);
        p16(&mut out, 0x2102);

        // Optional header, PE32.
        p16(&mut out, 0x010B);
        out.push(8);
        out.push(0);
        p32(&mut out, text_raw_size);
        p32(&mut out, size_of_init_data);
        p32(&mut out, 0);
        p32(&mut out, 0);
        p32(&mut out, TEXT_RVA);
        p32(&mut out, rsrc_rva.unwrap_or(0));
        p32(&mut out, 0x1000_0000);
        p32(&mut out, SECTION_ALIGN);
        p32(&mut out, FILE_ALIGN);
        p16(&mut out, 4);
        p16(&mut out, 0);
        p16(&mut out, 0);
        p16(&mut out, 0);
        p16(&mut out, 4);
        p16(&mut out, 0);
        p32(&mut out, 0);
        p32(&mut out, size_of_image);
        p32(&mut out, headers_raw);
        p32(&mut out, 0);
        p16(&mut out, 3);
        p16(&mut out, 0);
        p32(&mut out, 0x0010_0000);
        p32(&mut out, 0x1000);
        p32(&mut out, 0x0010_0000);
        p32(&mut out, 0x1000);
        p32(&mut out, 0);
        p32(&mut out, 16);

        for index in 0..16usize {
            let (rva, size) = match index {
                1 => imports
                    .map(|(desc, _)| (TEXT_RVA + desc as u32, 40))
                    .unwrap_or((0, 0)),
                2 => rsrc_rva.map(|rva| (rva, 16)).unwrap_or((0, 0)),
                5 => reloc_rva
                    .map(|rva| {
                        let size = if self.reloc_target_in_text.is_some() {
                            16
                        } else {
                            12
                        };
                        (rva, size)
                    })
                    .unwrap_or((0, 0)),
                6 => debug
                    .map(|(dir, _)| (TEXT_RVA + dir as u32, 28))
                    .unwrap_or((0, 0)),
                12 => imports
                    .map(|(_, iat)| (TEXT_RVA + iat as u32, 8))
                    .unwrap_or((0, 0)),
                14 => (TEXT_RVA, 72),
                _ => (0, 0),
            };
            p32(&mut out, rva);
            p32(&mut out, size);
        }

        for (name, rva, virtual_size, raw_size, raw, characteristics) in &section_headers {
            let mut bytes = [0u8; 8];
            bytes[..name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&bytes);
            p32(&mut out, *virtual_size);
            p32(&mut out, *rva);
            p32(&mut out, *raw_size);
            p32(&mut out, *raw);
            p32(&mut out, 0);
            p32(&mut out, 0);
            p16(&mut out, 0);
            p16(&mut out, 0);
            p32(&mut out, *characteristics);
        }

        assert!(out.len() <= headers_raw as usize);
        out.resize(headers_raw as usize, 0);
        out.extend_from_slice(&text);
        out.resize((text_raw_offset + text_raw_size) as usize, 0);
        for (raw, body) in section_bodies {
            assert_eq!(out.len(), raw as usize);
            out.extend_from_slice(body);
            out.resize(align_up(out.len() as u32, FILE_ALIGN) as usize, 0);
        }

        out
    }
}

struct StringsBuilder {
    bytes: Vec<u8>,
    seen: Vec<(String, u32)>,
}

impl StringsBuilder {
    fn new() -> Self {
        Self {
            bytes: vec![0],
            seen: Vec::new(),
        }
    }

    fn intern(&mut self, value: &str) -> u32 {
        if value.is_empty() {
            return 0;
        }
        if let Some((_, offset)) = self.seen.iter().find(|(s, _)| s == value) {
            return *offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        self.seen.push((value.to_string(), offset));
        offset
    }
}

struct BlobsBuilder {
    bytes: Vec<u8>,
}

impl BlobsBuilder {
    fn new() -> Self {
        Self { bytes: vec![0] }
    }

    fn intern(&mut self, value: &[u8]) -> u32 {
        let offset = self.bytes.len() as u32;
        shade_image::format::utils::encode_unsigned(value.len() as u32, &mut self.bytes).unwrap();
        self.bytes.extend_from_slice(value);
        offset
    }
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

fn pad4(mut bytes: Vec<u8>) -> Vec<u8> {
    bytes.resize(align4(bytes.len()), 0);
    bytes
}

fn p16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn p32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Parses a saved image into its PE, metadata and table views.
pub fn reparse(data: &[u8]) -> (PeImage, Metadata, TableStream) {
    let pe = PeImage::parse(data).unwrap();
    let blob = pe.metadata_bytes(data);
    let metadata = Metadata::parse(blob).unwrap();
    let tables = TableStream::parse(metadata.table_stream_bytes(blob).unwrap()).unwrap();
    (pe, metadata, tables)
}

//! Support for the PE container around ECMA-335 metadata.
//!
//! [`PeImage`] records header values and file offsets rather than borrowed
//! sub-slices, so the same value can address the original buffer and a
//! rewritten copy of the header region.

pub mod raw;

pub(crate) mod rewriter;

use scroll::{Pread, LE};

use crate::error::{ErrorKind, Result};

pub use raw::{CliHeader, DataDirectory, SectionHeader};

/// A parsed view of a managed PE image.
#[derive(Debug, Clone)]
pub struct PeImage {
    /// File offset of the `PE\0\0` signature.
    pub pe_offset: usize,
    /// The COFF header.
    pub coff: raw::CoffHeader,
    /// File offset of the optional header.
    pub optional_header_offset: usize,
    /// The optional header magic, PE32 or PE32+.
    pub optional_magic: u16,
    /// AddressOfEntryPoint from the optional header.
    pub entry_point: u32,
    /// SectionAlignment from the optional header.
    pub section_alignment: u32,
    /// FileAlignment from the optional header.
    pub file_alignment: u32,
    /// The 16 data directories.
    pub data_directories: [raw::DataDirectory; raw::DATA_DIRECTORY_COUNT],
    /// File offset of the data directory table.
    pub data_directories_offset: usize,
    /// File offset of the section table.
    pub section_table_offset: usize,
    /// The section table.
    pub sections: Vec<raw::SectionHeader>,
    /// The CLI header.
    pub cli: raw::CliHeader,
    /// File offset of the CLI header.
    pub cli_offset: usize,
    /// File offset of the metadata root.
    pub metadata_offset: usize,
    /// Size of the metadata blob in bytes.
    pub metadata_size: usize,
}

impl PeImage {
    /// Tests whether the buffer could contain a PE image.
    pub fn test(data: &[u8]) -> bool {
        matches!(
            data.pread_with::<u16>(0, LE).ok(),
            Some(raw::DOS_MAGIC)
        )
    }

    /// Parses the headers of a managed PE image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let dos_magic: u16 = data.pread_with(0, LE)?;
        if dos_magic != raw::DOS_MAGIC {
            return Err(ErrorKind::BadImage("wrong DOS magic").into());
        }

        let pe_offset = data.pread_with::<u32>(raw::DOS_PE_POINTER_OFFSET, LE)? as usize;
        let pe_magic: u32 = data.pread_with(pe_offset, LE)?;
        if pe_magic != raw::PE_MAGIC {
            return Err(ErrorKind::BadImage("wrong PE signature").into());
        }

        let mut offset = pe_offset + 4;
        let coff: raw::CoffHeader = data.gread_with(&mut offset, LE)?;

        let optional_header_offset = offset;
        let optional_magic: u16 = data.pread_with(optional_header_offset, LE)?;
        let dirs_offset = match optional_magic {
            raw::PE32_MAGIC => optional_header_offset + 96,
            raw::PE32PLUS_MAGIC => optional_header_offset + 112,
            _ => return Err(ErrorKind::UnsupportedImage("unknown optional header magic").into()),
        };

        let entry_point: u32 = data.pread_with(optional_header_offset + 16, LE)?;
        let section_alignment: u32 = data.pread_with(optional_header_offset + 32, LE)?;
        let file_alignment: u32 = data.pread_with(optional_header_offset + 36, LE)?;

        let mut data_directories = [raw::DataDirectory::default(); raw::DATA_DIRECTORY_COUNT];
        let mut dir_offset = dirs_offset;
        for dir in data_directories.iter_mut() {
            *dir = data.gread_with(&mut dir_offset, LE)?;
        }

        let section_table_offset =
            optional_header_offset + coff.size_of_optional_header as usize;
        let mut sections = Vec::with_capacity(coff.number_of_sections as usize);
        let mut section_offset = section_table_offset;
        for _ in 0..coff.number_of_sections {
            sections.push(raw::SectionHeader::parse(data, &mut section_offset)?);
        }

        let mut image = Self {
            pe_offset,
            coff,
            optional_header_offset,
            optional_magic,
            entry_point,
            section_alignment,
            file_alignment,
            data_directories,
            data_directories_offset: dirs_offset,
            section_table_offset,
            sections,
            cli: raw::CliHeader {
                cb: 0,
                major_runtime_version: 0,
                minor_runtime_version: 0,
                metadata: raw::DataDirectory::default(),
                flags: 0,
                entry_point_token: 0,
                resources: raw::DataDirectory::default(),
                strong_name_signature: raw::DataDirectory::default(),
                code_manager_table: raw::DataDirectory::default(),
                vtable_fixups: raw::DataDirectory::default(),
                export_address_table_jumps: raw::DataDirectory::default(),
                managed_native_header: raw::DataDirectory::default(),
            },
            cli_offset: 0,
            metadata_offset: 0,
            metadata_size: 0,
        };

        let cli_dir = image.data_directories[raw::DIR_CLI_HEADER];
        if cli_dir.virtual_address == 0 {
            return Err(ErrorKind::NotAManagedImage.into());
        }

        image.cli_offset = image.rva_to_offset(cli_dir.virtual_address)? as usize;
        image.cli = data.pread_with(image.cli_offset, LE)?;

        if image.cli.metadata.virtual_address == 0 {
            return Err(ErrorKind::BadImage("CLI header has no metadata directory").into());
        }
        image.metadata_offset = image.rva_to_offset(image.cli.metadata.virtual_address)? as usize;
        image.metadata_size = image.cli.metadata.size as usize;

        if data.len() < image.metadata_offset + image.metadata_size {
            return Err(ErrorKind::BadImage("metadata exceeds file bounds").into());
        }

        Ok(image)
    }

    /// Resolves an RVA to a file offset via the section table.
    pub fn rva_to_offset(&self, rva: u32) -> Result<u32> {
        self.sections
            .iter()
            .find(|s| s.contains_rva(rva))
            .map(|s| rva - s.virtual_address + s.pointer_to_raw_data)
            .ok_or_else(|| ErrorKind::BadImage("RVA outside any section").into())
    }

    /// The section containing the given RVA, if any.
    pub fn section_containing_rva(&self, rva: u32) -> Option<&raw::SectionHeader> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// The metadata blob of the image.
    pub fn metadata_bytes<'data>(&self, data: &'data [u8]) -> &'data [u8] {
        &data[self.metadata_offset..self.metadata_offset + self.metadata_size]
    }

    /// The file range of the strong-name signature window, if the image has
    /// a signature slot.
    pub fn strong_name_range(&self) -> Result<Option<std::ops::Range<usize>>> {
        let dir = self.cli.strong_name_signature;
        if dir.virtual_address == 0 || dir.size == 0 {
            return Ok(None);
        }
        let start = self.rva_to_offset(dir.virtual_address)? as usize;
        Ok(Some(start..start + dir.size as usize))
    }

    /// The file offset of the optional header checksum field.
    pub fn checksum_offset(&self) -> usize {
        self.optional_header_offset + 64
    }
}

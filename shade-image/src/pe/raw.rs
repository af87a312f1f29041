//! Raw PE container records and constants.

use scroll::{Pread, Pwrite, SizeWith, LE};

/// `MZ`, the DOS header magic.
pub const DOS_MAGIC: u16 = 0x5A4D;
/// Offset of the PE header pointer inside the DOS header.
pub const DOS_PE_POINTER_OFFSET: usize = 0x3C;
/// `PE\0\0`.
pub const PE_MAGIC: u32 = 0x0000_4550;
/// Optional header magic for PE32 images.
pub const PE32_MAGIC: u16 = 0x010B;
/// Optional header magic for PE32+ images.
pub const PE32PLUS_MAGIC: u16 = 0x020B;

/// The number of data directories in the optional header.
pub const DATA_DIRECTORY_COUNT: usize = 16;
/// Data directory index of the import table.
pub const DIR_IMPORT: usize = 1;
/// Data directory index of the resource table.
pub const DIR_RESOURCE: usize = 2;
/// Data directory index of the base relocation table.
pub const DIR_BASERELOC: usize = 5;
/// Data directory index of the debug directory.
pub const DIR_DEBUG: usize = 6;
/// Data directory index of the CLI header.
pub const DIR_CLI_HEADER: usize = 14;

/// Section characteristics: the section contains executable code.
pub const SCN_CNT_CODE: u32 = 0x0000_0020;
/// Section characteristics: the section contains initialized data.
pub const SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;

/// CLI header flags: the image has a valid strong-name signature.
pub const COMIMAGE_FLAGS_STRONGNAMESIGNED: u32 = 0x0000_0008;

/// The COFF file header.
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct CoffHeader {
    /// The target machine type.
    pub machine: u16,
    /// The number of sections.
    pub number_of_sections: u16,
    /// The low 32 bits of the link timestamp.
    pub time_date_stamp: u32,
    /// File offset of the COFF symbol table, 0 for images.
    pub pointer_to_symbol_table: u32,
    /// Number of COFF symbols, 0 for images.
    pub number_of_symbols: u32,
    /// The size of the optional header that follows.
    pub size_of_optional_header: u16,
    /// Image characteristics flags.
    pub characteristics: u16,
}

/// An entry of the data directory table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pread, Pwrite, SizeWith)]
pub struct DataDirectory {
    /// The RVA of the directory's data.
    pub virtual_address: u32,
    /// The size of the directory's data in bytes.
    pub size: u32,
}

/// A section table entry. The 8-byte name is kept separately because it is
/// not a numeric field.
#[derive(Debug, Clone, Copy)]
pub struct SectionHeader {
    /// The section name, null-padded.
    pub name: [u8; 8],
    /// The size of the section when loaded.
    pub virtual_size: u32,
    /// The RVA at which the section is loaded.
    pub virtual_address: u32,
    /// The size of the section's initialized data on disk.
    pub size_of_raw_data: u32,
    /// The file offset of the section's data.
    pub pointer_to_raw_data: u32,
    /// File offset of COFF relocations, 0 for images.
    pub pointer_to_relocations: u32,
    /// Deprecated, 0.
    pub pointer_to_linenumbers: u32,
    /// Number of COFF relocations, 0 for images.
    pub number_of_relocations: u16,
    /// Deprecated, 0.
    pub number_of_linenumbers: u16,
    /// Section characteristics flags.
    pub characteristics: u32,
}

/// The size of a section table entry on disk.
pub const SECTION_HEADER_SIZE: usize = 40;

impl SectionHeader {
    /// Parses a section header at `offset`, advancing it past the record.
    pub fn parse(data: &[u8], offset: &mut usize) -> Result<Self, scroll::Error> {
        let mut name = [0u8; 8];
        name.copy_from_slice(data.gread_with(offset, 8)?);
        Ok(Self {
            name,
            virtual_size: data.gread_with(offset, LE)?,
            virtual_address: data.gread_with(offset, LE)?,
            size_of_raw_data: data.gread_with(offset, LE)?,
            pointer_to_raw_data: data.gread_with(offset, LE)?,
            pointer_to_relocations: data.gread_with(offset, LE)?,
            pointer_to_linenumbers: data.gread_with(offset, LE)?,
            number_of_relocations: data.gread_with(offset, LE)?,
            number_of_linenumbers: data.gread_with(offset, LE)?,
            characteristics: data.gread_with(offset, LE)?,
        })
    }

    /// Writes this section header at `offset`, advancing it past the record.
    pub fn write(&self, data: &mut [u8], offset: &mut usize) -> Result<(), scroll::Error> {
        data.gwrite_with(&self.name[..], offset, ())?;
        data.gwrite_with(self.virtual_size, offset, LE)?;
        data.gwrite_with(self.virtual_address, offset, LE)?;
        data.gwrite_with(self.size_of_raw_data, offset, LE)?;
        data.gwrite_with(self.pointer_to_raw_data, offset, LE)?;
        data.gwrite_with(self.pointer_to_relocations, offset, LE)?;
        data.gwrite_with(self.pointer_to_linenumbers, offset, LE)?;
        data.gwrite_with(self.number_of_relocations, offset, LE)?;
        data.gwrite_with(self.number_of_linenumbers, offset, LE)?;
        data.gwrite_with(self.characteristics, offset, LE)?;
        Ok(())
    }

    /// The section name up to the first NUL, lossily decoded.
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|c| *c == 0).unwrap_or(8);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Whether the given RVA falls into this section's raw mapping.
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address
            && rva < self.virtual_address.saturating_add(self.size_of_raw_data)
    }

    /// Whether the given RVA falls into this section's virtual span.
    pub fn contains_virtual_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address
            && rva < self.virtual_address.saturating_add(self.virtual_size)
    }
}

/// The CLI (COR20) header pointed to by data directory 14.
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct CliHeader {
    /// The size of this structure, always 72.
    pub cb: u32,
    /// Major runtime version, 2.
    pub major_runtime_version: u16,
    /// Minor runtime version, 5.
    pub minor_runtime_version: u16,
    /// The metadata root.
    pub metadata: DataDirectory,
    /// Image flags, see `COMIMAGE_FLAGS_*`.
    pub flags: u32,
    /// Entry point token, or RVA for native entry points.
    pub entry_point_token: u32,
    /// Managed resources.
    pub resources: DataDirectory,
    /// The strong-name signature slot.
    pub strong_name_signature: DataDirectory,
    /// Reserved, 0.
    pub code_manager_table: DataDirectory,
    /// VTable fixups for mixed-mode images.
    pub vtable_fixups: DataDirectory,
    /// Reserved, 0.
    pub export_address_table_jumps: DataDirectory,
    /// Reserved, 0.
    pub managed_native_header: DataDirectory,
}

/// A 28-byte debug directory entry.
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct DebugDirectoryEntry {
    /// Reserved, 0.
    pub characteristics: u32,
    /// Timestamp of the debug data.
    pub time_date_stamp: u32,
    /// Format major version.
    pub major_version: u16,
    /// Format minor version.
    pub minor_version: u16,
    /// The kind of debug data, e.g. 2 for CodeView.
    pub data_type: u32,
    /// The size of the debug data.
    pub size_of_data: u32,
    /// The RVA of the debug data, 0 if not mapped.
    pub address_of_raw_data: u32,
    /// The file offset of the debug data.
    pub pointer_to_raw_data: u32,
}

/// The size of a debug directory entry on disk.
pub const DEBUG_DIRECTORY_ENTRY_SIZE: usize = 28;

/// A 20-byte import directory descriptor.
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct ImportDescriptor {
    /// RVA of the import lookup table.
    pub original_first_thunk: u32,
    /// 0 until bound.
    pub time_date_stamp: u32,
    /// Forwarder chain index, usually 0.
    pub forwarder_chain: u32,
    /// RVA of the imported DLL's name.
    pub name: u32,
    /// RVA of the import address table.
    pub first_thunk: u32,
}

impl ImportDescriptor {
    /// Whether this is the all-zero terminator entry.
    pub fn is_terminator(&self) -> bool {
        self.original_first_thunk == 0
            && self.time_date_stamp == 0
            && self.forwarder_chain == 0
            && self.name == 0
            && self.first_thunk == 0
    }
}

/// The size of an import descriptor on disk.
pub const IMPORT_DESCRIPTOR_SIZE: usize = 20;

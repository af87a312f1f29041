//! Splicing a resized metadata blob back into its PE container.
//!
//! Eligibility of every patch is decided against the *old* metadata
//! boundaries, while the written values carry the *new* delta. The output
//! buffer is assembled first and patched afterwards, so no offset is read
//! after it has already been adjusted.

use scroll::{Pread, Pwrite, LE};

use crate::error::{ErrorKind, Result};

use super::raw;
use super::PeImage;

fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// The old/new layout bookkeeping for one rewrite.
struct Splice {
    /// Byte delta between new and old metadata blob.
    size_diff: i64,
    /// Byte delta between new and old raw size of the metadata section.
    raw_diff: i64,
    /// RVA one past the old metadata end.
    old_md_rva_end: u32,
    /// File offset one past the old metadata end.
    old_md_file_end: usize,
    /// File offset one past the metadata section's old content.
    content_end: usize,
    /// File offset one past the metadata section's old raw data.
    sec_raw_end: usize,
    /// The metadata section's RVA span in the old image.
    sec_rva: u32,
    sec_virtual_size: u32,
}

impl Splice {
    /// Whether an RVA lives in the metadata section after the old metadata
    /// end, and therefore shifted by `size_diff`.
    fn rva_shifted(&self, rva: u32) -> bool {
        rva >= self.old_md_rva_end && rva < self.sec_rva.saturating_add(self.sec_virtual_size)
    }

    fn adjust_rva(&self, rva: u32) -> u32 {
        if self.rva_shifted(rva) {
            (rva as i64 + self.size_diff) as u32
        } else {
            rva
        }
    }

    /// Maps an old file offset to its location in the rewritten image.
    fn shift_file_offset(&self, offset: usize) -> usize {
        if offset >= self.sec_raw_end {
            (offset as i64 + self.raw_diff) as usize
        } else if offset >= self.old_md_file_end && offset < self.content_end {
            (offset as i64 + self.size_diff) as usize
        } else {
            offset
        }
    }
}

/// Splices `new_metadata` over the image's metadata blob and patches every
/// header field, directory and pointer that the resize invalidated.
#[tracing::instrument(level = "debug", skip_all, fields(old_size = pe.metadata_size, new_size = new_metadata.len()))]
pub(crate) fn rewrite_image(data: &[u8], pe: &PeImage, new_metadata: &[u8]) -> Result<Vec<u8>> {
    let old_off = pe.metadata_offset;
    let old_size = pe.metadata_size;
    let new_size = new_metadata.len();
    let size_diff = new_size as i64 - old_size as i64;

    let md_rva = pe.cli.metadata.virtual_address;
    let sec_idx = pe
        .sections
        .iter()
        .position(|s| s.contains_rva(md_rva))
        .ok_or(ErrorKind::BadImage("metadata RVA outside any section"))?;
    let sec = pe.sections[sec_idx];

    let sec_raw_start = sec.pointer_to_raw_data as usize;
    let sec_raw_end = sec_raw_start + sec.size_of_raw_data as usize;
    if sec_raw_end > data.len() {
        return Err(ErrorKind::BadImage("section raw data exceeds file bounds").into());
    }
    let old_md_file_end = old_off + old_size;
    if old_off < sec_raw_start || old_md_file_end > sec_raw_end {
        return Err(ErrorKind::BadImage("metadata crosses its section's raw bounds").into());
    }

    // Content is the section's virtual span; anything between it and the
    // aligned raw end is padding that can be regenerated.
    let content_len = (sec.virtual_size as usize).min(sec.size_of_raw_data as usize);
    let content_end = sec_raw_start + content_len;
    if old_md_file_end > content_end {
        return Err(ErrorKind::BadImage("metadata extends into section padding").into());
    }

    let new_virtual_size = sec.virtual_size as i64 + size_diff;
    let new_virtual_size =
        u32::try_from(new_virtual_size).map_err(|_| ErrorKind::BadImage("metadata shrank below zero"))?;

    // Growth must stay inside the section's address slack: section RVAs are
    // never moved.
    if let Some(next) = pe.sections.get(sec_idx + 1) {
        if sec.virtual_address as u64 + new_virtual_size as u64 > next.virtual_address as u64 {
            return Err(ErrorKind::UnsupportedImage(
                "metadata growth exceeds the section's virtual address slack",
            )
            .into());
        }
    }

    let new_raw_size = if new_virtual_size as u64 <= sec.size_of_raw_data as u64 {
        sec.size_of_raw_data
    } else {
        align_up(new_virtual_size as u64, pe.file_alignment as u64) as u32
    };
    let raw_diff = new_raw_size as i64 - sec.size_of_raw_data as i64;

    let splice = Splice {
        size_diff,
        raw_diff,
        old_md_rva_end: md_rva + old_size as u32,
        old_md_file_end,
        content_end,
        sec_raw_end,
        sec_rva: sec.virtual_address,
        sec_virtual_size: sec.virtual_size,
    };

    // Assemble the output: everything up to the metadata verbatim, the new
    // blob, the section's content tail, padding up to the new raw end, then
    // the remainder of the file (later sections keep their relative layout).
    let mut out = Vec::with_capacity((data.len() as i64 + size_diff + raw_diff) as usize);
    out.extend_from_slice(&data[..old_off]);
    out.extend_from_slice(new_metadata);
    out.extend_from_slice(&data[old_md_file_end..content_end]);
    out.resize(sec_raw_start + new_raw_size as usize, 0);
    out.extend_from_slice(&data[sec_raw_end..]);

    patch_section_table(&mut out, pe, sec_idx, new_virtual_size, new_raw_size, &splice)?;
    patch_optional_header(&mut out, pe, sec_idx, new_virtual_size, &splice)?;
    patch_data_directories(&mut out, pe, &splice)?;
    patch_cli_header(&mut out, pe, new_size as u32, &splice)?;
    patch_debug_directory(&mut out, pe, &splice)?;
    patch_import_tables(&mut out, pe, &splice)?;
    patch_base_relocations(&mut out, pe, &splice)?;

    Ok(out)
}

fn patch_section_table(
    out: &mut [u8],
    pe: &PeImage,
    sec_idx: usize,
    new_virtual_size: u32,
    new_raw_size: u32,
    splice: &Splice,
) -> Result<()> {
    for (i, section) in pe.sections.iter().enumerate() {
        let mut updated = *section;
        if i == sec_idx {
            updated.virtual_size = new_virtual_size;
            updated.size_of_raw_data = new_raw_size;
        } else if section.pointer_to_raw_data as usize >= splice.sec_raw_end
            && section.pointer_to_raw_data != 0
        {
            updated.pointer_to_raw_data =
                (section.pointer_to_raw_data as i64 + splice.raw_diff) as u32;
        } else {
            continue;
        }
        let mut offset = pe.section_table_offset + i * raw::SECTION_HEADER_SIZE;
        updated.write(out, &mut offset)?;
    }
    Ok(())
}

fn patch_optional_header(
    out: &mut [u8],
    pe: &PeImage,
    sec_idx: usize,
    new_virtual_size: u32,
    splice: &Splice,
) -> Result<()> {
    let opt = pe.optional_header_offset;
    let sec = &pe.sections[sec_idx];

    if splice.raw_diff != 0 {
        if sec.characteristics & raw::SCN_CNT_CODE != 0 {
            let size_of_code: u32 = out.pread_with(opt + 4, LE)?;
            out.pwrite_with((size_of_code as i64 + splice.raw_diff) as u32, opt + 4, LE)?;
        }
        if sec.characteristics & raw::SCN_CNT_INITIALIZED_DATA != 0 {
            let size_of_data: u32 = out.pread_with(opt + 8, LE)?;
            out.pwrite_with((size_of_data as i64 + splice.raw_diff) as u32, opt + 8, LE)?;
        }
    }

    out.pwrite_with(splice.adjust_rva(pe.entry_point), opt + 16, LE)?;

    // SizeOfImage covers the furthest section extent under section alignment.
    let mut size_of_image = 0u64;
    for (i, section) in pe.sections.iter().enumerate() {
        let virtual_size = if i == sec_idx {
            new_virtual_size
        } else {
            section.virtual_size
        };
        let end = section.virtual_address as u64
            + align_up(virtual_size as u64, pe.section_alignment as u64);
        size_of_image = size_of_image.max(end);
    }
    out.pwrite_with(size_of_image as u32, opt + 56, LE)?;

    Ok(())
}

fn patch_data_directories(out: &mut [u8], pe: &PeImage, splice: &Splice) -> Result<()> {
    for (i, dir) in pe.data_directories.iter().enumerate() {
        if dir.virtual_address == 0 || !splice.rva_shifted(dir.virtual_address) {
            continue;
        }
        let offset = pe.data_directories_offset + i * 8;
        out.pwrite_with(splice.adjust_rva(dir.virtual_address), offset, LE)?;
    }
    Ok(())
}

fn patch_cli_header(
    out: &mut [u8],
    pe: &PeImage,
    new_metadata_size: u32,
    splice: &Splice,
) -> Result<()> {
    let mut cli = pe.cli;
    cli.metadata.size = new_metadata_size;
    for dir in [
        &mut cli.resources,
        &mut cli.strong_name_signature,
        &mut cli.code_manager_table,
        &mut cli.vtable_fixups,
        &mut cli.export_address_table_jumps,
        &mut cli.managed_native_header,
    ] {
        dir.virtual_address = splice.adjust_rva(dir.virtual_address);
    }
    out.pwrite_with(&cli, splice.shift_file_offset(pe.cli_offset), LE)?;
    Ok(())
}

fn patch_debug_directory(out: &mut [u8], pe: &PeImage, splice: &Splice) -> Result<()> {
    let dir = pe.data_directories[raw::DIR_DEBUG];
    if dir.virtual_address == 0 || dir.size == 0 {
        return Ok(());
    }
    let table_offset = splice.shift_file_offset(pe.rva_to_offset(dir.virtual_address)? as usize);
    let entries = dir.size as usize / raw::DEBUG_DIRECTORY_ENTRY_SIZE;
    for i in 0..entries {
        let offset = table_offset + i * raw::DEBUG_DIRECTORY_ENTRY_SIZE;
        let mut entry: raw::DebugDirectoryEntry = out.pread_with(offset, LE)?;
        entry.address_of_raw_data = splice.adjust_rva(entry.address_of_raw_data);
        if entry.pointer_to_raw_data != 0 {
            entry.pointer_to_raw_data =
                splice.shift_file_offset(entry.pointer_to_raw_data as usize) as u32;
        }
        out.pwrite_with(&entry, offset, LE)?;
    }
    Ok(())
}

fn patch_import_tables(out: &mut [u8], pe: &PeImage, splice: &Splice) -> Result<()> {
    let dir = pe.data_directories[raw::DIR_IMPORT];
    if dir.virtual_address == 0 || dir.size == 0 {
        return Ok(());
    }
    let table_offset = splice.shift_file_offset(pe.rva_to_offset(dir.virtual_address)? as usize);
    let is_pe32_plus = pe.optional_magic == raw::PE32PLUS_MAGIC;

    let mut index = 0usize;
    loop {
        let offset = table_offset + index * raw::IMPORT_DESCRIPTOR_SIZE;
        let descriptor: raw::ImportDescriptor = out.pread_with(offset, LE)?;
        if descriptor.is_terminator() {
            break;
        }

        let mut updated = descriptor;
        updated.original_first_thunk = splice.adjust_rva(descriptor.original_first_thunk);
        updated.name = splice.adjust_rva(descriptor.name);
        updated.first_thunk = splice.adjust_rva(descriptor.first_thunk);
        out.pwrite_with(&updated, offset, LE)?;

        // Patch name entries of both thunk tables, located via their old
        // RVAs.
        for thunk_rva in [descriptor.original_first_thunk, descriptor.first_thunk] {
            if thunk_rva == 0 {
                continue;
            }
            let mut thunk_offset =
                splice.shift_file_offset(pe.rva_to_offset(thunk_rva)? as usize);
            loop {
                if is_pe32_plus {
                    let entry: u64 = out.pread_with(thunk_offset, LE)?;
                    if entry == 0 {
                        break;
                    }
                    if entry & (1 << 63) == 0 {
                        let adjusted = splice.adjust_rva(entry as u32) as u64;
                        out.pwrite_with(adjusted, thunk_offset, LE)?;
                    }
                    thunk_offset += 8;
                } else {
                    let entry: u32 = out.pread_with(thunk_offset, LE)?;
                    if entry == 0 {
                        break;
                    }
                    if entry & (1 << 31) == 0 {
                        out.pwrite_with(splice.adjust_rva(entry), thunk_offset, LE)?;
                    }
                    thunk_offset += 4;
                }
            }
        }

        index += 1;
    }
    Ok(())
}

fn patch_base_relocations(out: &mut [u8], pe: &PeImage, splice: &Splice) -> Result<()> {
    let dir = pe.data_directories[raw::DIR_BASERELOC];
    if dir.virtual_address == 0 || dir.size == 0 {
        return Ok(());
    }
    let mut offset = splice.shift_file_offset(pe.rva_to_offset(dir.virtual_address)? as usize);
    let end = offset + dir.size as usize;

    while offset + 8 <= end {
        let page_rva: u32 = out.pread_with(offset, LE)?;
        let block_size: u32 = out.pread_with(offset + 4, LE)?;
        if block_size < 8 {
            return Err(ErrorKind::BadImage("malformed base relocation block").into());
        }
        let entries = (block_size as usize - 8) / 2;
        for i in 0..entries {
            let entry_offset = offset + 8 + i * 2;
            let entry: u16 = out.pread_with(entry_offset, LE)?;
            let kind = entry >> 12;
            if kind == 0 {
                continue;
            }
            let target = page_rva + (entry & 0x0FFF) as u32;
            if !splice.rva_shifted(target) {
                continue;
            }
            let new_offset12 = target as i64 + splice.size_diff - page_rva as i64;
            if !(0..=0x0FFF).contains(&new_offset12) {
                // The shifted target leaves its relocation page; re-chunking
                // the block is not supported, so fail loudly instead of
                // emitting an image that relocates the wrong address.
                return Err(ErrorKind::BrokenReference(
                    "relocation target crosses a page boundary after metadata resize",
                )
                .into());
            }
            out.pwrite_with((kind << 12) | new_offset12 as u16, entry_offset, LE)?;
        }
        offset += block_size as usize;
    }
    Ok(())
}

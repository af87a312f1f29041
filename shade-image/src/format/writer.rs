//! Assembly of a new metadata blob from the source image and a plan.

use std::io::Write;

use scroll::{Pwrite, LE};

use crate::error::Result;
use crate::plan::{Plan, Projection};

use super::raw;
use super::rows::{
    read_col, write_col, AssemblyRefRow, AssemblyRow, CustomAttributeRow, MemberRefRow,
    TypeDefRow, TypeRefRow,
};
use super::schema::{columns, TableId};
use super::tables::TableStream;
use super::Metadata;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Builds the new metadata blob.
///
/// `blob` is the source metadata blob; the result is a complete replacement
/// for it, with the plan's overrides and appends applied and every stream
/// re-laid-out behind a fresh directory.
#[tracing::instrument(level = "debug", skip_all)]
pub(crate) fn build_metadata(
    blob: &[u8],
    meta: &Metadata,
    stream: &TableStream,
    plan: &Plan,
    projection: &Projection,
) -> Result<Vec<u8>> {
    let table_entry_idx = meta
        .streams
        .iter()
        .position(|s| s.name == "#~" || s.name == "#-");

    // Build each stream body. Heaps copy their source bytes and append; the
    // table stream is rebuilt; everything else passes through.
    let mut bodies: Vec<Vec<u8>> = Vec::with_capacity(meta.streams.len());
    for (idx, entry) in meta.streams.iter().enumerate() {
        let source = blob
            .get(entry.offset as usize..(entry.offset + entry.size) as usize)
            .unwrap_or(&[]);
        let mut body = match entry.name.as_str() {
            "#Strings" => {
                let mut body = source.to_vec();
                body.extend_from_slice(plan.strings.bytes());
                body
            }
            "#Blob" => {
                let mut body = source.to_vec();
                body.extend_from_slice(plan.blobs.bytes());
                body
            }
            _ if Some(idx) == table_entry_idx => {
                build_table_stream(source, stream, plan, projection)?
            }
            _ => source.to_vec(),
        };
        body.resize(align4(body.len()), 0);
        bodies.push(body);
    }

    // The root: header, version string, directory, then the bodies.
    let version_padded = align4(meta.version.len() + 1);
    let mut directory_size = 0usize;
    for entry in &meta.streams {
        directory_size += 8 + align4(entry.name.len() + 1);
    }
    let header_size = 16 + version_padded + 4 + directory_size;

    let mut offsets = Vec::with_capacity(bodies.len());
    let mut running = header_size;
    for body in &bodies {
        offsets.push(running as u32);
        running += body.len();
    }

    let mut out = Vec::with_capacity(running);
    let mut writer = watto::Writer::new(&mut out);

    let root_header = raw::RootHeader {
        signature: raw::METADATA_SIGNATURE,
        major_version: 1,
        minor_version: 1,
        reserved: 0,
        version_length: version_padded as u32,
    };
    let mut root = [0u8; 16];
    root.pwrite_with(&root_header, 0, LE)?;
    writer.write_all(&root)?;
    writer.write_all(meta.version.as_bytes())?;
    writer.write_all(&vec![0u8; version_padded - meta.version.len()])?;

    let root_part2 = raw::RootHeaderPart2 {
        flags: meta.flags,
        streams: meta.streams.len() as u16,
    };
    let mut part2 = [0u8; 4];
    part2.pwrite_with(&root_part2, 0, LE)?;
    writer.write_all(&part2)?;

    for (entry, (offset, body)) in meta.streams.iter().zip(offsets.iter().zip(&bodies)) {
        let stream_header = raw::StreamHeader {
            offset: *offset,
            size: body.len() as u32,
        };
        let mut header = [0u8; 8];
        header.pwrite_with(&stream_header, 0, LE)?;
        writer.write_all(&header)?;
        writer.write_all(entry.name.as_bytes())?;
        writer.write_all(&[0])?;
        writer.align_to(4)?;
    }

    for body in &bodies {
        writer.write_all(body)?;
    }

    drop(writer);
    debug_assert_eq!(out.len(), running);
    Ok(out)
}

/// Rebuilds the `#~` stream with the projected widths and row counts.
fn build_table_stream(
    src: &[u8],
    stream: &TableStream,
    plan: &Plan,
    projection: &Projection,
) -> Result<Vec<u8>> {
    let old_widths = &stream.widths;
    let new_widths = &projection.widths;

    let mut valid = stream.header.valid;
    let mut sorted = stream.header.sorted;
    for table in [
        TableId::TypeRef,
        TableId::MemberRef,
        TableId::CustomAttribute,
    ] {
        if projection.rows[table as usize] > 0 {
            valid |= 1 << table as u64;
        }
    }
    // A re-sorted CustomAttribute table is sorted by definition.
    if projection.rows[TableId::CustomAttribute as usize] > 0 {
        sorted |= 1 << TableId::CustomAttribute as u64;
    }

    let stream_header = raw::TableStreamHeader {
        heap_sizes: new_widths.heap_sizes_byte(),
        valid,
        sorted,
        ..stream.header
    };
    let mut out = Vec::with_capacity(src.len());
    let mut header = [0u8; 24];
    header.pwrite_with(&stream_header, 0, LE)?;
    out.extend_from_slice(&header);

    for i in 0..64u64 {
        if valid >> i & 1 == 1 {
            out.extend_from_slice(&projection.rows[i as usize].to_le_bytes());
        }
    }

    for table in TableId::ALL.iter().copied() {
        let count = stream.row_count(table);
        match table {
            TableId::Assembly => {
                for rid in 1..=count {
                    let row = match plan.assembly.get(&rid) {
                        Some(row) => *row,
                        None => AssemblyRow::read(stream.row_bytes(src, table, rid)?, old_widths)?,
                    };
                    row.write(&mut out, new_widths);
                }
            }
            TableId::AssemblyRef => {
                for rid in 1..=count {
                    let row = match plan.assembly_refs.get(&rid) {
                        Some(row) => *row,
                        None => {
                            AssemblyRefRow::read(stream.row_bytes(src, table, rid)?, old_widths)?
                        }
                    };
                    row.write(&mut out, new_widths);
                }
            }
            TableId::TypeDef => {
                for rid in 1..=count {
                    let row = match plan.type_defs.get(&rid) {
                        Some(row) => *row,
                        None => TypeDefRow::read(stream.row_bytes(src, table, rid)?, old_widths)?,
                    };
                    row.write(&mut out, new_widths);
                }
            }
            TableId::TypeRef => {
                for rid in 1..=count {
                    TypeRefRow::read(stream.row_bytes(src, table, rid)?, old_widths)?
                        .write(&mut out, new_widths);
                }
                for row in &plan.new_type_refs {
                    row.write(&mut out, new_widths);
                }
            }
            TableId::MemberRef => {
                for rid in 1..=count {
                    MemberRefRow::read(stream.row_bytes(src, table, rid)?, old_widths)?
                        .write(&mut out, new_widths);
                }
                for row in &plan.new_member_refs {
                    row.write(&mut out, new_widths);
                }
            }
            TableId::CustomAttribute => {
                let mut rows = Vec::with_capacity(
                    count as usize + plan.new_custom_attributes.len(),
                );
                for rid in 1..=count {
                    rows.push(CustomAttributeRow::read(
                        stream.row_bytes(src, table, rid)?,
                        old_widths,
                    )?);
                }
                rows.extend_from_slice(&plan.new_custom_attributes);
                // The runtime requires this table sorted by parent; appended
                // rows cannot simply be concatenated.
                rows.sort_by_key(|row| row.parent);
                for row in &rows {
                    row.write(&mut out, new_widths);
                }
            }
            _ => {
                let layout_stable = columns(table)
                    .iter()
                    .all(|kind| old_widths.column(*kind) == new_widths.column(*kind));
                if layout_stable {
                    out.extend_from_slice(&src[stream.table_range(table)]);
                } else {
                    // Re-encode column by column under the new widths. This
                    // covers the portable-debug tables as well.
                    for rid in 1..=count {
                        let row = stream.row_bytes(src, table, rid)?;
                        let pos = &mut 0;
                        for kind in columns(table) {
                            let value = read_col(row, pos, old_widths.column(*kind))?;
                            write_col(&mut out, new_widths.column(*kind), value);
                        }
                    }
                }
            }
        }
    }

    Ok(out)
}

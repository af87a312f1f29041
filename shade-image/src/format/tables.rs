//! Parsing of the `#~` table stream into a directory of row counts, widths
//! and per-table offsets.

use scroll::{Pread, LE};

use crate::error::{ErrorKind, Result};

use super::raw;
use super::schema::{IndexWidths, TableId};

/// A parsed table stream directory.
///
/// Holds no row data; rows are sliced out of the stream bytes on demand via
/// [`row_bytes`](TableStream::row_bytes).
#[derive(Debug, Clone)]
pub struct TableStream {
    /// The fixed stream header.
    pub header: raw::TableStreamHeader,
    /// Row counts for all 64 table slots; absent tables have 0 rows.
    pub rows: [u32; 64],
    /// The index widths in effect for this stream.
    pub widths: IndexWidths,
    /// Offset of each table's row data relative to the stream start.
    offsets: [usize; 64],
    /// Offset of the first row byte relative to the stream start.
    pub data_offset: usize,
    /// Total stream length in bytes as parsed.
    pub len: usize,
}

impl TableStream {
    /// Parses a table stream.
    ///
    /// Unknown table tags in the `Valid` mask are a fatal error: their row
    /// sizes are undefined, so nothing after them could be located.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let header: raw::TableStreamHeader = buf.gread_with(&mut offset, LE)?;

        let mut rows = [0u32; 64];
        for (i, row) in rows.iter_mut().enumerate() {
            if header.valid >> i & 1 == 0 {
                continue;
            }
            if TableId::from_tag(i as u8).is_none() {
                return Err(ErrorKind::UnsupportedImage("unknown table tag in Valid mask").into());
            }
            *row = buf.gread_with::<u32>(&mut offset, LE)?;
        }

        let widths = IndexWidths::from_heap_bits(header.heap_sizes, rows);

        let data_offset = offset;
        let mut offsets = [0usize; 64];
        for table in TableId::ALL {
            offsets[*table as usize] = offset;
            offset += widths.row_size(*table) * rows[*table as usize] as usize;
        }

        if offset > buf.len() {
            return Err(ErrorKind::BadImage("table stream shorter than its row data").into());
        }

        Ok(Self {
            header,
            rows,
            widths,
            offsets,
            data_offset,
            len: buf.len(),
        })
    }

    /// The number of rows in a table.
    pub fn row_count(&self, table: TableId) -> u32 {
        self.rows[table as usize]
    }

    /// The byte range of one row relative to the stream start.
    ///
    /// Note that row identifiers are 1-based.
    pub fn row_range(&self, table: TableId, rid: u32) -> Result<std::ops::Range<usize>> {
        if rid == 0 || rid > self.row_count(table) {
            return Err(ErrorKind::BadImage("row identifier out of bounds").into());
        }
        let size = self.widths.row_size(table);
        let start = self.offsets[table as usize] + (rid as usize - 1) * size;
        Ok(start..start + size)
    }

    /// The bytes of one row, sliced out of the given stream bytes.
    pub fn row_bytes<'data>(
        &self,
        stream: &'data [u8],
        table: TableId,
        rid: u32,
    ) -> Result<&'data [u8]> {
        let range = self.row_range(table, rid)?;
        stream
            .get(range)
            .ok_or_else(|| ErrorKind::BadImage("table row out of stream bounds").into())
    }

    /// The byte range of a whole table's row data relative to the stream start.
    pub fn table_range(&self, table: TableId) -> std::ops::Range<usize> {
        let start = self.offsets[table as usize];
        let size = self.widths.row_size(table) * self.row_count(table) as usize;
        start..start + size
    }
}

//! The ECMA-335 metadata model: root header, stream directory, heaps and
//! tables.
//!
//! All offsets recorded here are relative to the metadata root, so the same
//! [`Metadata`] value can be used against the original file bytes or a
//! rebuilt blob.

pub mod raw;
pub mod rows;
pub mod schema;
pub mod tables;
pub mod utils;

pub(crate) mod writer;

use scroll::{Pread, LE};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

pub use tables::TableStream;

/// One entry of the stream directory.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// The stream name, e.g. `#Strings`.
    pub name: String,
    /// Offset of the stream from the start of the metadata root.
    pub offset: u32,
    /// Size of the stream in bytes.
    pub size: u32,
}

impl StreamEntry {
    fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset + self.size) as usize
    }
}

/// A parsed metadata root.
///
/// Holds the stream directory and knows where each heap lives; the actual
/// bytes are sliced out of the caller's buffer on demand.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// The version string from the root header, e.g. `v4.0.30319`.
    pub version: String,
    /// The flags halfword following the version string, always 0.
    pub flags: u16,
    /// The stream directory in file order.
    pub streams: Vec<StreamEntry>,
    strings_idx: Option<usize>,
    us_idx: Option<usize>,
    guid_idx: Option<usize>,
    blob_idx: Option<usize>,
    tables_idx: Option<usize>,
}

impl Metadata {
    /// Parses the metadata root out of a metadata blob.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let header: raw::RootHeader = blob.gread_with(&mut offset, LE)?;

        if header.signature != raw::METADATA_SIGNATURE {
            return Err(ErrorKind::BadImage("wrong metadata signature").into());
        }

        let version_buf = blob
            .get(offset..offset + header.version_length as usize)
            .ok_or(ErrorKind::BadImage("truncated metadata version string"))?;
        let version_buf = version_buf
            .split(|c| *c == 0)
            .next()
            .ok_or(ErrorKind::BadImage("unterminated metadata version string"))?;
        let version = std::str::from_utf8(version_buf)
            .map_err(|e| Error::new(ErrorKind::BadImage("invalid metadata version string"), e))?
            .to_string();
        offset += header.version_length as usize;

        let header2: raw::RootHeaderPart2 = blob.gread_with(&mut offset, LE)?;

        let mut result = Self {
            version,
            flags: header2.flags,
            streams: Vec::with_capacity(header2.streams as usize),
            strings_idx: None,
            us_idx: None,
            guid_idx: None,
            blob_idx: None,
            tables_idx: None,
        };

        for _ in 0..header2.streams {
            let stream: raw::StreamHeader = blob.gread_with(&mut offset, LE)?;

            let name_buf = blob
                .get(offset..)
                .ok_or(ErrorKind::BadImage("truncated stream directory"))?;
            let name_buf = name_buf.get(..32).unwrap_or(name_buf);
            let name_buf = name_buf
                .split(|c| *c == 0)
                .next()
                .ok_or(ErrorKind::BadImage("unterminated stream name"))?;
            let name = std::str::from_utf8(name_buf)
                .map_err(|e| Error::new(ErrorKind::BadImage("invalid stream name"), e))?;

            // Names are stored with a terminator, padded to a 4-byte boundary.
            offset += (name.len() + 4) & !3;

            if blob.get(stream.range_check()).is_none() {
                return Err(ErrorKind::BadImage("stream exceeds metadata bounds").into());
            }

            let idx = result.streams.len();
            match name {
                "#Strings" => result.strings_idx = Some(idx),
                "#US" => result.us_idx = Some(idx),
                "#GUID" => result.guid_idx = Some(idx),
                "#Blob" => result.blob_idx = Some(idx),
                "#~" | "#-" => result.tables_idx = Some(idx),
                _ => return Err(ErrorKind::UnsupportedImage("unknown stream name").into()),
            }

            result.streams.push(StreamEntry {
                name: name.to_string(),
                offset: stream.offset,
                size: stream.size,
            });
        }

        Ok(result)
    }

    fn stream<'data>(&self, blob: &'data [u8], idx: Option<usize>) -> Option<&'data [u8]> {
        let entry = &self.streams[idx?];
        blob.get(entry.range())
    }

    /// The `#Strings` heap, if present.
    pub fn string_heap<'data>(&self, blob: &'data [u8]) -> Result<StringHeap<'data>> {
        self.stream(blob, self.strings_idx)
            .map(|buf| StringHeap { buf })
            .ok_or_else(|| ErrorKind::BadImage("image has no #Strings heap").into())
    }

    /// The `#Blob` heap, if present.
    pub fn blob_heap<'data>(&self, blob: &'data [u8]) -> Result<BlobHeap<'data>> {
        self.stream(blob, self.blob_idx)
            .map(|buf| BlobHeap { buf })
            .ok_or_else(|| ErrorKind::BadImage("image has no #Blob heap").into())
    }

    /// The `#GUID` heap, if present.
    pub fn guid_heap<'data>(&self, blob: &'data [u8]) -> Result<GuidHeap<'data>> {
        self.stream(blob, self.guid_idx)
            .map(|buf| GuidHeap { buf })
            .ok_or_else(|| ErrorKind::BadImage("image has no #GUID heap").into())
    }

    /// The raw bytes of the table stream.
    pub fn table_stream_bytes<'data>(&self, blob: &'data [u8]) -> Result<&'data [u8]> {
        self.stream(blob, self.tables_idx)
            .ok_or_else(|| ErrorKind::BadImage("image has no table stream").into())
    }

    /// The directory entry of the table stream.
    pub(crate) fn table_stream_entry(&self) -> Result<&StreamEntry> {
        self.tables_idx
            .map(|idx| &self.streams[idx])
            .ok_or_else(|| ErrorKind::BadImage("image has no table stream").into())
    }

    /// The size in bytes of a heap stream, 0 when absent.
    pub(crate) fn heap_size(&self, name: &str) -> u32 {
        self.streams
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.size)
            .unwrap_or(0)
    }
}

impl raw::StreamHeader {
    fn range_check(&self) -> std::ops::Range<usize> {
        self.offset as usize..(self.offset as usize + self.size as usize)
    }
}

/// A view of the "string heap", which contains null-terminated UTF-8 string
/// data. The first byte is always 0.
#[derive(Debug, Clone, Copy)]
pub struct StringHeap<'data> {
    buf: &'data [u8],
}

impl<'data> StringHeap<'data> {
    /// Reads the string starting at the given offset.
    pub fn get(&self, offset: u32) -> Result<&'data str> {
        let string_buf = self
            .buf
            .get(offset as usize..)
            .ok_or(ErrorKind::BadImage("string index out of heap bounds"))?;
        let string = string_buf
            .split(|c| *c == 0)
            .next()
            .ok_or(ErrorKind::BadImage("unterminated heap string"))?;
        std::str::from_utf8(string)
            .map_err(|e| Error::new(ErrorKind::BadImage("invalid string data"), e))
    }
}

/// A view of the "blob heap": entries prefixed with their compressed length.
/// Offset 0 is the empty blob.
#[derive(Debug, Clone, Copy)]
pub struct BlobHeap<'data> {
    buf: &'data [u8],
}

impl<'data> BlobHeap<'data> {
    /// Reads the blob starting at the given offset.
    pub fn get(&self, offset: u32) -> Result<&'data [u8]> {
        let (len, rest) = utils::decode_unsigned(
            self.buf
                .get(offset as usize..)
                .ok_or(ErrorKind::BadImage("blob index out of heap bounds"))?,
        )?;
        rest.get(..len as usize)
            .ok_or_else(|| ErrorKind::BadImage("blob exceeds heap bounds").into())
    }
}

/// A view of the "GUID heap": packed 16-byte records addressed by 1-based
/// index. Index 0 denotes an absent GUID.
#[derive(Debug, Clone, Copy)]
pub struct GuidHeap<'data> {
    buf: &'data [u8],
}

impl<'data> GuidHeap<'data> {
    /// Reads the GUID with the given 1-based index.
    pub fn get(&self, idx: u32) -> Option<Uuid> {
        let start = (idx.checked_sub(1)? as usize).checked_mul(16)?;
        self.buf
            .get(start..start + 16)
            .map(|bytes| Uuid::from_bytes_le(bytes.try_into().unwrap()))
    }
}

//! The staged modification plan.
//!
//! The plan is the only component carrying mutable state between open and
//! save. Existing rows are never edited in the source view; they are
//! shadowed by overrides keyed by row identifier. New rows and heap entries
//! are append-only.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::error::Result;
use crate::format::rows::{
    AssemblyRefRow, AssemblyRow, CustomAttributeRow, MemberRefRow, TypeDefRow, TypeRefRow,
};
use crate::format::schema::{IndexWidths, TableId};
use crate::format::utils;

/// Append-only string heap additions, deduplicated by content.
#[derive(Debug)]
pub(crate) struct StringAppends {
    base: u32,
    bytes: Vec<u8>,
    index: IndexMap<String, u32>,
}

impl StringAppends {
    fn new(base: u32) -> Self {
        Self {
            base,
            bytes: Vec::new(),
            index: IndexMap::new(),
        }
    }

    /// Returns the heap index `value` will have in the saved image,
    /// appending it if it has not been added before.
    pub(crate) fn intern(&mut self, value: &str) -> u32 {
        if let Some(offset) = self.index.get(value) {
            return *offset;
        }
        let offset = self.base + self.bytes.len() as u32;
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        self.index.insert(value.to_owned(), offset);
        offset
    }

    /// Resolves an appended heap index back to its string.
    pub(crate) fn get(&self, offset: u32) -> Option<&str> {
        self.index
            .iter()
            .find(|(_, o)| **o == offset)
            .map(|(s, _)| s.as_str())
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Append-only blob heap additions, length-prefixed and deduplicated by
/// content.
#[derive(Debug)]
pub(crate) struct BlobAppends {
    base: u32,
    bytes: Vec<u8>,
    index: IndexMap<Vec<u8>, u32>,
}

impl BlobAppends {
    fn new(base: u32) -> Self {
        Self {
            base,
            bytes: Vec::new(),
            index: IndexMap::new(),
        }
    }

    /// Returns the heap index `value` will have in the saved image,
    /// appending it with its compressed length prefix if new.
    pub(crate) fn intern(&mut self, value: &[u8]) -> Result<u32> {
        if let Some(offset) = self.index.get(value) {
            return Ok(*offset);
        }
        let offset = self.base + self.bytes.len() as u32;
        utils::encode_unsigned(value.len() as u32, &mut self.bytes)?;
        self.bytes.extend_from_slice(value);
        self.index.insert(value.to_owned(), offset);
        Ok(offset)
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// How the plan will be materialized on save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteStrategy {
    /// Copy the file and overwrite individual row bytes in place. Only legal
    /// when no row layout can change.
    InPlacePatch,
    /// Assemble a new metadata blob and splice it into the container.
    Rebuild,
}

/// The projected shape of the saved metadata.
#[derive(Debug)]
pub(crate) struct Projection {
    pub widths: IndexWidths,
    pub rows: [u32; 64],
    pub strategy: WriteStrategy,
}

/// Staged mutations against one source image.
#[derive(Debug)]
pub(crate) struct Plan {
    pub(crate) strings: StringAppends,
    pub(crate) blobs: BlobAppends,
    pub(crate) assembly: BTreeMap<u32, AssemblyRow>,
    pub(crate) assembly_refs: BTreeMap<u32, AssemblyRefRow>,
    pub(crate) type_defs: BTreeMap<u32, TypeDefRow>,
    pub(crate) new_type_refs: Vec<TypeRefRow>,
    pub(crate) new_member_refs: Vec<MemberRefRow>,
    pub(crate) new_custom_attributes: Vec<CustomAttributeRow>,
    source_rows: [u32; 64],
    source_widths: IndexWidths,
    strings_size: u32,
    blob_size: u32,
    guid_size: u32,
}

impl Plan {
    /// Creates an empty plan against the given source row counts, index
    /// widths and heap sizes.
    pub(crate) fn new(
        source_rows: [u32; 64],
        source_widths: IndexWidths,
        strings_size: u32,
        blob_size: u32,
        guid_size: u32,
    ) -> Self {
        Self {
            strings: StringAppends::new(strings_size),
            blobs: BlobAppends::new(blob_size),
            assembly: BTreeMap::new(),
            assembly_refs: BTreeMap::new(),
            type_defs: BTreeMap::new(),
            new_type_refs: Vec::new(),
            new_member_refs: Vec::new(),
            new_custom_attributes: Vec::new(),
            source_rows,
            source_widths,
            strings_size,
            blob_size,
            guid_size,
        }
    }

    /// Whether the plan contains no staged changes at all.
    pub(crate) fn is_empty(&self) -> bool {
        self.assembly.is_empty()
            && self.assembly_refs.is_empty()
            && self.type_defs.is_empty()
            && !self.has_appends()
    }

    /// Whether the plan appends rows or heap entries.
    fn has_appends(&self) -> bool {
        !self.new_type_refs.is_empty()
            || !self.new_member_refs.is_empty()
            || !self.new_custom_attributes.is_empty()
            || !self.strings.is_empty()
            || !self.blobs.is_empty()
    }

    /// Appends a TypeRef row, returning its future row identifier.
    pub(crate) fn append_type_ref(&mut self, row: TypeRefRow) -> u32 {
        self.new_type_refs.push(row);
        self.source_rows[TableId::TypeRef as usize] + self.new_type_refs.len() as u32
    }

    /// Appends a MemberRef row, returning its future row identifier.
    pub(crate) fn append_member_ref(&mut self, row: MemberRefRow) -> u32 {
        self.new_member_refs.push(row);
        self.source_rows[TableId::MemberRef as usize] + self.new_member_refs.len() as u32
    }

    /// Appends a CustomAttribute row. Row identifiers of this table are not
    /// stable across save because the table is re-sorted by parent.
    pub(crate) fn append_custom_attribute(&mut self, row: CustomAttributeRow) {
        self.new_custom_attributes.push(row);
    }

    /// The row count a table will have in the saved image.
    pub(crate) fn projected_row_count(&self, table: TableId) -> u32 {
        let appended = match table {
            TableId::TypeRef => self.new_type_refs.len(),
            TableId::MemberRef => self.new_member_refs.len(),
            TableId::CustomAttribute => self.new_custom_attributes.len(),
            _ => 0,
        };
        self.source_rows[table as usize] + appended as u32
    }

    /// Projects the final heap sizes and index widths, and picks the write
    /// strategy.
    ///
    /// In-place patching is only taken when the projection equals the
    /// source: any heap growth or new row could change a width somewhere and
    /// shift every dependent row, so everything else rebuilds.
    pub(crate) fn project(&self) -> Projection {
        let mut rows = self.source_rows;
        for table in [
            TableId::TypeRef,
            TableId::MemberRef,
            TableId::CustomAttribute,
        ] {
            rows[table as usize] = self.projected_row_count(table);
        }

        let strings_len = self.strings_size as u64 + self.strings.bytes.len() as u64;
        let blob_len = self.blob_size as u64 + self.blobs.bytes.len() as u64;

        let mut widths =
            IndexWidths::from_heap_lens(strings_len, self.guid_size as u64, blob_len, rows);
        // Heap widths never shrink relative to the source.
        widths.string = widths.string.max(self.source_widths.string);
        widths.guid = widths.guid.max(self.source_widths.guid);
        widths.blob = widths.blob.max(self.source_widths.blob);

        let strategy = if !self.has_appends() && widths == self.source_widths {
            WriteStrategy::InPlacePatch
        } else {
            WriteStrategy::Rebuild
        };
        tracing::debug!(
            ?strategy,
            strings_appended = self.strings.bytes.len(),
            blobs_appended = self.blobs.bytes.len(),
            "projected write strategy"
        );

        Projection {
            widths,
            rows,
            strategy,
        }
    }
}

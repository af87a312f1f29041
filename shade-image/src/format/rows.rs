//! Decoded row structures for the tables the editor mutates or appends to.
//!
//! Fields hold raw column values: heap indices, row identifiers and encoded
//! coded indexes, never decoded strings. `read` and `write` must be given the
//! widths that are valid for the table stream the row comes from or goes
//! into.

use crate::error::{ErrorKind, Result};

use super::schema::{CodedIndex, IndexWidths, TableId};

/// Reads one column of `width` bytes (little-endian) and advances `pos`.
pub(crate) fn read_col(buf: &[u8], pos: &mut usize, width: u8) -> Result<u32> {
    let width = width as usize;
    let bytes = buf
        .get(*pos..*pos + width)
        .ok_or(ErrorKind::BadImage("table row truncated"))?;
    *pos += width;
    Ok(match width {
        1 => bytes[0] as u32,
        2 => u16::from_le_bytes(bytes.try_into().unwrap()) as u32,
        4 => u32::from_le_bytes(bytes.try_into().unwrap()),
        _ => return Err(ErrorKind::BadImage("unsupported column width").into()),
    })
}

/// Appends one column of `width` bytes (little-endian) to `out`.
pub(crate) fn write_col(out: &mut Vec<u8>, width: u8, value: u32) {
    match width {
        1 => out.push(value as u8),
        2 => out.extend_from_slice(&(value as u16).to_le_bytes()),
        4 => out.extend_from_slice(&value.to_le_bytes()),
        _ => unreachable!("unsupported column width"),
    }
}

/// A row of the Module table (0x00).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRow {
    /// Generation, 0 outside edit-and-continue scenarios.
    pub generation: u16,
    /// Module name string index.
    pub name: u32,
    /// Module version GUID index.
    pub mvid: u32,
    /// Edit-and-continue GUID index.
    pub enc_id: u32,
    /// Edit-and-continue base GUID index.
    pub enc_base_id: u32,
}

impl ModuleRow {
    /// Decodes a Module row.
    pub fn read(buf: &[u8], widths: &IndexWidths) -> Result<Self> {
        let pos = &mut 0;
        Ok(Self {
            generation: read_col(buf, pos, 2)? as u16,
            name: read_col(buf, pos, widths.string)?,
            mvid: read_col(buf, pos, widths.guid)?,
            enc_id: read_col(buf, pos, widths.guid)?,
            enc_base_id: read_col(buf, pos, widths.guid)?,
        })
    }

    /// Encodes this row under the given widths.
    pub fn write(&self, out: &mut Vec<u8>, widths: &IndexWidths) {
        write_col(out, 2, self.generation as u32);
        write_col(out, widths.string, self.name);
        write_col(out, widths.guid, self.mvid);
        write_col(out, widths.guid, self.enc_id);
        write_col(out, widths.guid, self.enc_base_id);
    }
}

/// A row of the Assembly table (0x20).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyRow {
    /// The hash algorithm used for file hashes, usually SHA-1 (0x8004).
    pub hash_alg_id: u32,
    /// Major version.
    pub major_version: u16,
    /// Minor version.
    pub minor_version: u16,
    /// Build number.
    pub build_number: u16,
    /// Revision number.
    pub revision_number: u16,
    /// Assembly flags; bit 0 means the public key blob holds a full key.
    pub flags: u32,
    /// Public key blob index, 0 when unsigned.
    pub public_key: u32,
    /// Simple name string index.
    pub name: u32,
    /// Culture string index, 0 for the invariant culture.
    pub culture: u32,
}

impl AssemblyRow {
    /// Decodes an Assembly row.
    pub fn read(buf: &[u8], widths: &IndexWidths) -> Result<Self> {
        let pos = &mut 0;
        Ok(Self {
            hash_alg_id: read_col(buf, pos, 4)?,
            major_version: read_col(buf, pos, 2)? as u16,
            minor_version: read_col(buf, pos, 2)? as u16,
            build_number: read_col(buf, pos, 2)? as u16,
            revision_number: read_col(buf, pos, 2)? as u16,
            flags: read_col(buf, pos, 4)?,
            public_key: read_col(buf, pos, widths.blob)?,
            name: read_col(buf, pos, widths.string)?,
            culture: read_col(buf, pos, widths.string)?,
        })
    }

    /// Encodes this row under the given widths.
    pub fn write(&self, out: &mut Vec<u8>, widths: &IndexWidths) {
        write_col(out, 4, self.hash_alg_id);
        write_col(out, 2, self.major_version as u32);
        write_col(out, 2, self.minor_version as u32);
        write_col(out, 2, self.build_number as u32);
        write_col(out, 2, self.revision_number as u32);
        write_col(out, 4, self.flags);
        write_col(out, widths.blob, self.public_key);
        write_col(out, widths.string, self.name);
        write_col(out, widths.string, self.culture);
    }
}

/// A row of the AssemblyRef table (0x23).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyRefRow {
    /// Major version.
    pub major_version: u16,
    /// Minor version.
    pub minor_version: u16,
    /// Build number.
    pub build_number: u16,
    /// Revision number.
    pub revision_number: u16,
    /// Reference flags; bit 0 means the blob holds a full key, not a token.
    pub flags: u32,
    /// Public key or token blob index, 0 for a null identity.
    pub public_key_or_token: u32,
    /// Simple name string index.
    pub name: u32,
    /// Culture string index.
    pub culture: u32,
    /// Hash blob index, usually 0.
    pub hash_value: u32,
}

impl AssemblyRefRow {
    /// Decodes an AssemblyRef row.
    pub fn read(buf: &[u8], widths: &IndexWidths) -> Result<Self> {
        let pos = &mut 0;
        Ok(Self {
            major_version: read_col(buf, pos, 2)? as u16,
            minor_version: read_col(buf, pos, 2)? as u16,
            build_number: read_col(buf, pos, 2)? as u16,
            revision_number: read_col(buf, pos, 2)? as u16,
            flags: read_col(buf, pos, 4)?,
            public_key_or_token: read_col(buf, pos, widths.blob)?,
            name: read_col(buf, pos, widths.string)?,
            culture: read_col(buf, pos, widths.string)?,
            hash_value: read_col(buf, pos, widths.blob)?,
        })
    }

    /// Encodes this row under the given widths.
    pub fn write(&self, out: &mut Vec<u8>, widths: &IndexWidths) {
        write_col(out, 2, self.major_version as u32);
        write_col(out, 2, self.minor_version as u32);
        write_col(out, 2, self.build_number as u32);
        write_col(out, 2, self.revision_number as u32);
        write_col(out, 4, self.flags);
        write_col(out, widths.blob, self.public_key_or_token);
        write_col(out, widths.string, self.name);
        write_col(out, widths.string, self.culture);
        write_col(out, widths.blob, self.hash_value);
    }
}

/// Visibility selector values from the low three bits of TypeDef flags.
pub mod visibility {
    /// Mask extracting the visibility selector.
    pub const MASK: u32 = 0x0000_0007;
    /// Not visible outside the assembly.
    pub const NOT_PUBLIC: u32 = 0x0;
    /// Visible to everyone.
    pub const PUBLIC: u32 = 0x1;
    /// Nested type, visible to everyone.
    pub const NESTED_PUBLIC: u32 = 0x2;
    /// Nested type, visible to the enclosing type.
    pub const NESTED_PRIVATE: u32 = 0x3;
    /// Nested type, visible to subclasses of the enclosing type.
    pub const NESTED_FAMILY: u32 = 0x4;
    /// Nested type, visible inside the assembly.
    pub const NESTED_ASSEMBLY: u32 = 0x5;
    /// Nested type, visible to subclasses inside the assembly.
    pub const NESTED_FAM_AND_ASSEM: u32 = 0x6;
    /// Nested type, visible to subclasses or inside the assembly.
    pub const NESTED_FAM_OR_ASSEM: u32 = 0x7;
}

/// A row of the TypeDef table (0x02).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDefRow {
    /// Type attribute flags.
    pub flags: u32,
    /// Type name string index.
    pub name: u32,
    /// Type namespace string index.
    pub namespace: u32,
    /// Base type as an encoded `TypeDefOrRef` coded index.
    pub extends: u32,
    /// First owned row in the Field table.
    pub field_list: u32,
    /// First owned row in the MethodDef table.
    pub method_list: u32,
}

impl TypeDefRow {
    /// Decodes a TypeDef row.
    pub fn read(buf: &[u8], widths: &IndexWidths) -> Result<Self> {
        let pos = &mut 0;
        Ok(Self {
            flags: read_col(buf, pos, 4)?,
            name: read_col(buf, pos, widths.string)?,
            namespace: read_col(buf, pos, widths.string)?,
            extends: read_col(buf, pos, widths.coded(CodedIndex::TypeDefOrRef))?,
            field_list: read_col(buf, pos, widths.table(TableId::Field))?,
            method_list: read_col(buf, pos, widths.table(TableId::MethodDef))?,
        })
    }

    /// Encodes this row under the given widths.
    pub fn write(&self, out: &mut Vec<u8>, widths: &IndexWidths) {
        write_col(out, 4, self.flags);
        write_col(out, widths.string, self.name);
        write_col(out, widths.string, self.namespace);
        write_col(
            out,
            widths.coded(CodedIndex::TypeDefOrRef),
            self.extends,
        );
        write_col(
            out,
            widths.table(TableId::Field),
            self.field_list,
        );
        write_col(
            out,
            widths.table(TableId::MethodDef),
            self.method_list,
        );
    }

    /// Whether the type is visible outside its assembly.
    pub fn is_visible(&self) -> bool {
        matches!(
            self.flags & visibility::MASK,
            visibility::PUBLIC
                | visibility::NESTED_PUBLIC
                | visibility::NESTED_FAMILY
                | visibility::NESTED_FAM_OR_ASSEM
        )
    }

    /// Returns a copy of this row with its visibility reduced to
    /// assembly-internal, preserving all other flag bits.
    ///
    /// `Public` maps to `NotPublic`; the externally visible nested forms map
    /// to `NestedAssembly`; everything else is left unchanged.
    pub fn make_internal(&self) -> Self {
        let mapped = match self.flags & visibility::MASK {
            visibility::PUBLIC => visibility::NOT_PUBLIC,
            visibility::NESTED_PUBLIC
            | visibility::NESTED_FAMILY
            | visibility::NESTED_FAM_OR_ASSEM => visibility::NESTED_ASSEMBLY,
            other => other,
        };
        Self {
            flags: (self.flags & !visibility::MASK) | mapped,
            ..*self
        }
    }
}

/// A row of the TypeRef table (0x01).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRefRow {
    /// Scope as an encoded `ResolutionScope` coded index.
    pub resolution_scope: u32,
    /// Type name string index.
    pub name: u32,
    /// Type namespace string index.
    pub namespace: u32,
}

impl TypeRefRow {
    /// Decodes a TypeRef row.
    pub fn read(buf: &[u8], widths: &IndexWidths) -> Result<Self> {
        let pos = &mut 0;
        Ok(Self {
            resolution_scope: read_col(
                buf,
                pos,
                widths.coded(CodedIndex::ResolutionScope),
            )?,
            name: read_col(buf, pos, widths.string)?,
            namespace: read_col(buf, pos, widths.string)?,
        })
    }

    /// Encodes this row under the given widths.
    pub fn write(&self, out: &mut Vec<u8>, widths: &IndexWidths) {
        write_col(
            out,
            widths.coded(CodedIndex::ResolutionScope),
            self.resolution_scope,
        );
        write_col(out, widths.string, self.name);
        write_col(out, widths.string, self.namespace);
    }
}

/// A row of the MemberRef table (0x0A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRefRow {
    /// Owner as an encoded `MemberRefParent` coded index.
    pub class: u32,
    /// Member name string index.
    pub name: u32,
    /// Signature blob index.
    pub signature: u32,
}

impl MemberRefRow {
    /// Decodes a MemberRef row.
    pub fn read(buf: &[u8], widths: &IndexWidths) -> Result<Self> {
        let pos = &mut 0;
        Ok(Self {
            class: read_col(
                buf,
                pos,
                widths.coded(CodedIndex::MemberRefParent),
            )?,
            name: read_col(buf, pos, widths.string)?,
            signature: read_col(buf, pos, widths.blob)?,
        })
    }

    /// Encodes this row under the given widths.
    pub fn write(&self, out: &mut Vec<u8>, widths: &IndexWidths) {
        write_col(
            out,
            widths.coded(CodedIndex::MemberRefParent),
            self.class,
        );
        write_col(out, widths.string, self.name);
        write_col(out, widths.blob, self.signature);
    }
}

/// A row of the CustomAttribute table (0x0C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomAttributeRow {
    /// Target as an encoded `HasCustomAttribute` coded index; the table's
    /// declared sort key.
    pub parent: u32,
    /// Constructor as an encoded `CustomAttributeType` coded index.
    pub attr_type: u32,
    /// Serialized argument blob index.
    pub value: u32,
}

impl CustomAttributeRow {
    /// Decodes a CustomAttribute row.
    pub fn read(buf: &[u8], widths: &IndexWidths) -> Result<Self> {
        let pos = &mut 0;
        Ok(Self {
            parent: read_col(
                buf,
                pos,
                widths.coded(CodedIndex::HasCustomAttribute),
            )?,
            attr_type: read_col(
                buf,
                pos,
                widths.coded(CodedIndex::CustomAttributeType),
            )?,
            value: read_col(buf, pos, widths.blob)?,
        })
    }

    /// Encodes this row under the given widths.
    pub fn write(&self, out: &mut Vec<u8>, widths: &IndexWidths) {
        write_col(
            out,
            widths.coded(CodedIndex::HasCustomAttribute),
            self.parent,
        );
        write_col(
            out,
            widths.coded(CodedIndex::CustomAttributeType),
            self.attr_type,
        );
        write_col(out, widths.blob, self.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_widths() -> IndexWidths {
        IndexWidths::from_heap_bits(0, [100; 64])
    }

    #[test]
    fn test_assembly_row_round_trip() {
        let widths = small_widths();
        let row = AssemblyRow {
            hash_alg_id: 0x8004,
            major_version: 1,
            minor_version: 2,
            build_number: 3,
            revision_number: 4,
            flags: 0x0001,
            public_key: 0x14,
            name: 0x2A,
            culture: 0,
        };
        let mut buf = Vec::new();
        row.write(&mut buf, &widths);
        assert_eq!(buf.len(), widths.row_size(super::TableId::Assembly));
        assert_eq!(AssemblyRow::read(&buf, &widths).unwrap(), row);
    }

    #[test]
    fn test_row_width_depends_on_heap_sizes() {
        let row = TypeRefRow {
            resolution_scope: 6,
            name: 0x1234,
            namespace: 0x5678,
        };
        let small = small_widths();
        let large = IndexWidths::from_heap_lens(0x2_0000, 16, 16, [100; 64]);

        let mut short = Vec::new();
        row.write(&mut short, &small);
        let mut long = Vec::new();
        row.write(&mut long, &large);

        assert_eq!(short.len(), 6);
        assert_eq!(long.len(), 10);
        assert_eq!(TypeRefRow::read(&long, &large).unwrap(), row);
    }

    #[test]
    fn test_make_internal_maps_visibilities() {
        let row = |flags| TypeDefRow {
            flags,
            name: 1,
            namespace: 2,
            extends: 0,
            field_list: 1,
            method_list: 1,
        };

        // Public types become NotPublic; unrelated bits survive.
        assert_eq!(row(0x0010_0001).make_internal().flags, 0x0010_0000);
        // Visible nested forms collapse to NestedAssembly.
        assert_eq!(row(0x0000_0002).make_internal().flags, 0x0000_0005);
        assert_eq!(row(0x0000_0004).make_internal().flags, 0x0000_0005);
        assert_eq!(row(0x0000_0007).make_internal().flags, 0x0000_0005);
        // Already-internal forms are untouched.
        assert_eq!(row(0x0000_0000).make_internal().flags, 0x0000_0000);
        assert_eq!(row(0x0000_0003).make_internal().flags, 0x0000_0003);
        assert_eq!(row(0x0000_0005).make_internal().flags, 0x0000_0005);
        assert_eq!(row(0x0000_0006).make_internal().flags, 0x0000_0006);
    }

    #[test]
    fn test_visibility_query() {
        let row = |flags| TypeDefRow {
            flags,
            name: 0,
            namespace: 0,
            extends: 0,
            field_list: 1,
            method_list: 1,
        };
        assert!(row(0x1).is_visible());
        assert!(row(0x2).is_visible());
        assert!(!row(0x0).is_visible());
        assert!(!row(0x3).is_visible());
        assert!(!row(0x5).is_visible());
    }
}

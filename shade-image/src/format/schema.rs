//! Static descriptions of the ECMA-335 metadata tables.
//!
//! Column layouts are data, not code: every table maps to a list of
//! [`ColumnKind`]s, and the byte width of each column is derived from the
//! current heap sizes and row counts via [`IndexWidths`]. This is what makes
//! generic row re-encoding possible when a mutation changes index widths.

use crate::error::{ErrorKind, Result};

/// An enumeration of all table types in ECMA-335 and Portable PDB.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableId {
    /// The Module table, exactly one row.
    Module = 0x00,
    /// References to types defined in other modules or assemblies.
    TypeRef = 0x01,
    /// Type definitions of this module.
    TypeDef = 0x02,
    /// Indirection table used by edit-and-continue images.
    FieldPtr = 0x03,
    /// Field definitions.
    Field = 0x04,
    /// Indirection table used by edit-and-continue images.
    MethodPtr = 0x05,
    /// Method definitions.
    MethodDef = 0x06,
    /// Indirection table used by edit-and-continue images.
    ParamPtr = 0x07,
    /// Parameter definitions.
    Param = 0x08,
    /// Interface implementations.
    InterfaceImpl = 0x09,
    /// References to members of other types.
    MemberRef = 0x0A,
    /// Compile-time constants.
    Constant = 0x0B,
    /// Custom attribute instantiations, sorted by parent.
    CustomAttribute = 0x0C,
    /// Marshalling descriptors.
    FieldMarshal = 0x0D,
    /// Declarative security records.
    DeclSecurity = 0x0E,
    /// Explicit class layouts.
    ClassLayout = 0x0F,
    /// Explicit field layouts.
    FieldLayout = 0x10,
    /// Standalone signatures.
    StandAloneSig = 0x11,
    /// Maps types to their events.
    EventMap = 0x12,
    /// Indirection table used by edit-and-continue images.
    EventPtr = 0x13,
    /// Event definitions.
    Event = 0x14,
    /// Maps types to their properties.
    PropertyMap = 0x15,
    /// Indirection table used by edit-and-continue images.
    PropertyPtr = 0x16,
    /// Property definitions.
    Property = 0x17,
    /// Associates methods with events and properties.
    MethodSemantics = 0x18,
    /// Method implementation overrides.
    MethodImpl = 0x19,
    /// References to other modules.
    ModuleRef = 0x1A,
    /// Type specifications.
    TypeSpec = 0x1B,
    /// P/Invoke mappings.
    ImplMap = 0x1C,
    /// Field initial data locations.
    FieldRVA = 0x1D,
    /// Edit-and-continue log, passed through untouched.
    EncLog = 0x1E,
    /// Edit-and-continue map, passed through untouched.
    EncMap = 0x1F,
    /// The assembly manifest, zero or one row.
    Assembly = 0x20,
    /// Obsolete, ignored by the runtime.
    AssemblyProcessor = 0x21,
    /// Obsolete, ignored by the runtime.
    AssemblyOs = 0x22,
    /// References to external assemblies.
    AssemblyRef = 0x23,
    /// Obsolete, ignored by the runtime.
    AssemblyRefProcessor = 0x24,
    /// Obsolete, ignored by the runtime.
    AssemblyRefOs = 0x25,
    /// Files in a multi-module assembly.
    File = 0x26,
    /// Types exported from other modules of this assembly.
    ExportedType = 0x27,
    /// Manifest resources.
    ManifestResource = 0x28,
    /// Nesting relationships between types.
    NestedClass = 0x29,
    /// Generic parameter definitions.
    GenericParam = 0x2A,
    /// Instantiations of generic methods.
    MethodSpec = 0x2B,
    /// Constraints on generic parameters.
    GenericParamConstraint = 0x2C,
    /// Portable PDB document records.
    Document = 0x30,
    /// Portable PDB sequence point records.
    MethodDebugInformation = 0x31,
    /// Portable PDB local scopes.
    LocalScope = 0x32,
    /// Portable PDB local variables.
    LocalVariable = 0x33,
    /// Portable PDB local constants.
    LocalConstant = 0x34,
    /// Portable PDB import scopes.
    ImportScope = 0x35,
    /// Portable PDB state machine mappings.
    StateMachineMethod = 0x36,
    /// Portable PDB custom debug information.
    CustomDebugInformation = 0x37,
}

impl TableId {
    /// All known tables in ascending tag order.
    pub const ALL: &'static [TableId] = &[
        TableId::Module,
        TableId::TypeRef,
        TableId::TypeDef,
        TableId::FieldPtr,
        TableId::Field,
        TableId::MethodPtr,
        TableId::MethodDef,
        TableId::ParamPtr,
        TableId::Param,
        TableId::InterfaceImpl,
        TableId::MemberRef,
        TableId::Constant,
        TableId::CustomAttribute,
        TableId::FieldMarshal,
        TableId::DeclSecurity,
        TableId::ClassLayout,
        TableId::FieldLayout,
        TableId::StandAloneSig,
        TableId::EventMap,
        TableId::EventPtr,
        TableId::Event,
        TableId::PropertyMap,
        TableId::PropertyPtr,
        TableId::Property,
        TableId::MethodSemantics,
        TableId::MethodImpl,
        TableId::ModuleRef,
        TableId::TypeSpec,
        TableId::ImplMap,
        TableId::FieldRVA,
        TableId::EncLog,
        TableId::EncMap,
        TableId::Assembly,
        TableId::AssemblyProcessor,
        TableId::AssemblyOs,
        TableId::AssemblyRef,
        TableId::AssemblyRefProcessor,
        TableId::AssemblyRefOs,
        TableId::File,
        TableId::ExportedType,
        TableId::ManifestResource,
        TableId::NestedClass,
        TableId::GenericParam,
        TableId::MethodSpec,
        TableId::GenericParamConstraint,
        TableId::Document,
        TableId::MethodDebugInformation,
        TableId::LocalScope,
        TableId::LocalVariable,
        TableId::LocalConstant,
        TableId::ImportScope,
        TableId::StateMachineMethod,
        TableId::CustomDebugInformation,
    ];

    /// Returns the table for a numeric tag, if it is known.
    pub fn from_tag(tag: u8) -> Option<TableId> {
        TableId::ALL.iter().copied().find(|t| *t as u8 == tag)
    }

    /// The numeric tag of this table.
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A metadata token: a table tag in the high byte, a 1-based row identifier
/// in the low 24 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    /// The table this token refers into.
    pub table: TableId,
    /// The 1-based row identifier.
    pub rid: u32,
}

impl Token {
    /// Creates a token from a table and a row identifier.
    pub fn new(table: TableId, rid: u32) -> Self {
        Self { table, rid }
    }

    /// The packed 32-bit representation of this token.
    pub fn to_u32(self) -> u32 {
        ((self.table as u32) << 24) | (self.rid & 0x00FF_FFFF)
    }

    /// Unpacks a 32-bit token; `None` if the table tag is unknown.
    pub fn from_u32(value: u32) -> Option<Self> {
        let table = TableId::from_tag((value >> 24) as u8)?;
        Some(Self {
            table,
            rid: value & 0x00FF_FFFF,
        })
    }
}

/// An enumeration of the coded index kinds of ECMA-335 and Portable PDB.
///
/// Each kind is a fixed list of target tables plus a tag bit count; `None`
/// entries are sentinel slots that are never legal to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodedIndex {
    /// TypeDef, TypeRef or TypeSpec.
    TypeDefOrRef,
    /// Field, Param or Property.
    HasConstant,
    /// Anything a custom attribute can be attached to.
    HasCustomAttribute,
    /// Field or Param.
    HasFieldMarshal,
    /// TypeDef, MethodDef or Assembly.
    HasDeclSecurity,
    /// The owner of a member reference.
    MemberRefParent,
    /// Event or Property.
    HasSemantics,
    /// MethodDef or MemberRef.
    MethodDefOrRef,
    /// Field or MethodDef.
    MemberForwarded,
    /// File, AssemblyRef or ExportedType.
    Implementation,
    /// The constructor of a custom attribute; tags 0, 1 and 4 are reserved.
    CustomAttributeType,
    /// The scope a type reference resolves in.
    ResolutionScope,
    /// TypeDef or MethodDef.
    TypeOrMethodDef,
    /// Anything Portable PDB custom debug information can be attached to.
    HasCustomDebugInformation,
}

use TableId::*;

const TYPE_DEF_OR_REF: &[Option<TableId>] = &[Some(TypeDef), Some(TypeRef), Some(TypeSpec)];
const HAS_CONSTANT: &[Option<TableId>] = &[Some(Field), Some(Param), Some(Property)];
const HAS_CUSTOM_ATTRIBUTE: &[Option<TableId>] = &[
    Some(MethodDef),
    Some(Field),
    Some(TypeRef),
    Some(TypeDef),
    Some(Param),
    Some(InterfaceImpl),
    Some(MemberRef),
    Some(Module),
    // the spec calls this slot "Permission"
    Some(DeclSecurity),
    Some(Property),
    Some(Event),
    Some(StandAloneSig),
    Some(ModuleRef),
    Some(TypeSpec),
    Some(Assembly),
    Some(AssemblyRef),
    Some(File),
    Some(ExportedType),
    Some(ManifestResource),
    Some(GenericParam),
    Some(GenericParamConstraint),
    Some(MethodSpec),
];
const HAS_FIELD_MARSHAL: &[Option<TableId>] = &[Some(Field), Some(Param)];
const HAS_DECL_SECURITY: &[Option<TableId>] = &[Some(TypeDef), Some(MethodDef), Some(Assembly)];
const MEMBER_REF_PARENT: &[Option<TableId>] = &[
    Some(TypeDef),
    Some(TypeRef),
    Some(ModuleRef),
    Some(MethodDef),
    Some(TypeSpec),
];
const HAS_SEMANTICS: &[Option<TableId>] = &[Some(Event), Some(Property)];
const METHOD_DEF_OR_REF: &[Option<TableId>] = &[Some(MethodDef), Some(MemberRef)];
const MEMBER_FORWARDED: &[Option<TableId>] = &[Some(Field), Some(MethodDef)];
const IMPLEMENTATION: &[Option<TableId>] = &[Some(File), Some(AssemblyRef), Some(ExportedType)];
const CUSTOM_ATTRIBUTE_TYPE: &[Option<TableId>] =
    &[None, None, Some(MethodDef), Some(MemberRef), None];
const RESOLUTION_SCOPE: &[Option<TableId>] = &[
    Some(Module),
    Some(ModuleRef),
    Some(AssemblyRef),
    Some(TypeRef),
];
const TYPE_OR_METHOD_DEF: &[Option<TableId>] = &[Some(TypeDef), Some(MethodDef)];
const HAS_CUSTOM_DEBUG_INFORMATION: &[Option<TableId>] = &[
    Some(MethodDef),
    Some(Field),
    Some(TypeRef),
    Some(TypeDef),
    Some(Param),
    Some(InterfaceImpl),
    Some(MemberRef),
    Some(Module),
    Some(DeclSecurity),
    Some(Property),
    Some(Event),
    Some(StandAloneSig),
    Some(ModuleRef),
    Some(TypeSpec),
    Some(Assembly),
    Some(AssemblyRef),
    Some(File),
    Some(ExportedType),
    Some(ManifestResource),
    Some(GenericParam),
    Some(GenericParamConstraint),
    Some(MethodSpec),
    Some(Document),
    Some(LocalScope),
    Some(LocalVariable),
    Some(LocalConstant),
    Some(ImportScope),
];

impl CodedIndex {
    /// The number of low bits used for the table tag.
    pub fn tag_bits(self) -> u32 {
        match self {
            CodedIndex::TypeDefOrRef => 2,
            CodedIndex::HasConstant => 2,
            CodedIndex::HasCustomAttribute => 5,
            CodedIndex::HasFieldMarshal => 1,
            CodedIndex::HasDeclSecurity => 2,
            CodedIndex::MemberRefParent => 3,
            CodedIndex::HasSemantics => 1,
            CodedIndex::MethodDefOrRef => 1,
            CodedIndex::MemberForwarded => 1,
            CodedIndex::Implementation => 2,
            CodedIndex::CustomAttributeType => 3,
            CodedIndex::ResolutionScope => 2,
            CodedIndex::TypeOrMethodDef => 1,
            CodedIndex::HasCustomDebugInformation => 5,
        }
    }

    /// The target table list; `None` entries are sentinel slots.
    pub fn tables(self) -> &'static [Option<TableId>] {
        match self {
            CodedIndex::TypeDefOrRef => TYPE_DEF_OR_REF,
            CodedIndex::HasConstant => HAS_CONSTANT,
            CodedIndex::HasCustomAttribute => HAS_CUSTOM_ATTRIBUTE,
            CodedIndex::HasFieldMarshal => HAS_FIELD_MARSHAL,
            CodedIndex::HasDeclSecurity => HAS_DECL_SECURITY,
            CodedIndex::MemberRefParent => MEMBER_REF_PARENT,
            CodedIndex::HasSemantics => HAS_SEMANTICS,
            CodedIndex::MethodDefOrRef => METHOD_DEF_OR_REF,
            CodedIndex::MemberForwarded => MEMBER_FORWARDED,
            CodedIndex::Implementation => IMPLEMENTATION,
            CodedIndex::CustomAttributeType => CUSTOM_ATTRIBUTE_TYPE,
            CodedIndex::ResolutionScope => RESOLUTION_SCOPE,
            CodedIndex::TypeOrMethodDef => TYPE_OR_METHOD_DEF,
            CodedIndex::HasCustomDebugInformation => HAS_CUSTOM_DEBUG_INFORMATION,
        }
    }

    /// Encodes a token as `(rid << tagBits) | tag`.
    ///
    /// A zero rid encodes the absent token. Fails if the token's table is not
    /// a member of this coded index, or only a sentinel slot matches.
    pub fn encode(self, token: Token) -> Result<u32> {
        if token.rid == 0 {
            return Ok(0);
        }
        let tag = self
            .tables()
            .iter()
            .position(|t| *t == Some(token.table))
            .ok_or(ErrorKind::Encoding("table is not a member of the coded index"))?;
        Ok((token.rid << self.tag_bits()) | tag as u32)
    }

    /// Decodes a coded value back into a token.
    ///
    /// Zero values and sentinel slots decode to `None`.
    pub fn decode(self, value: u32) -> Result<Option<Token>> {
        if value == 0 {
            return Ok(None);
        }
        let tag = (value & ((1 << self.tag_bits()) - 1)) as usize;
        let rid = value >> self.tag_bits();
        let slot = *self
            .tables()
            .get(tag)
            .ok_or(ErrorKind::Encoding("coded index tag out of range"))?;
        Ok(slot.map(|table| Token::new(table, rid)))
    }
}

/// The kind of a single table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// A fixed-width integer column of 1, 2, 4 or 8 bytes.
    Fixed(u8),
    /// An index into the `#Strings` heap.
    Str,
    /// A 1-based index into the `#GUID` heap.
    Guid,
    /// An index into the `#Blob` heap.
    Blob,
    /// A direct row identifier into another table.
    Table(TableId),
    /// A coded index.
    Coded(CodedIndex),
}

/// Returns the column layout of a table.
pub fn columns(table: TableId) -> &'static [ColumnKind] {
    use ColumnKind::*;
    match table {
        Module => &[Fixed(2), Str, Guid, Guid, Guid],
        TypeRef => &[Coded(CodedIndex::ResolutionScope), Str, Str],
        TypeDef => &[
            Fixed(4),
            Str,
            Str,
            Coded(CodedIndex::TypeDefOrRef),
            Table(Field),
            Table(MethodDef),
        ],
        FieldPtr => &[Table(Field)],
        Field => &[Fixed(2), Str, Blob],
        MethodPtr => &[Table(MethodDef)],
        MethodDef => &[Fixed(4), Fixed(2), Fixed(2), Str, Blob, Table(Param)],
        ParamPtr => &[Table(Param)],
        Param => &[Fixed(2), Fixed(2), Str],
        InterfaceImpl => &[Table(TypeDef), Coded(CodedIndex::TypeDefOrRef)],
        MemberRef => &[Coded(CodedIndex::MemberRefParent), Str, Blob],
        Constant => &[Fixed(2), Coded(CodedIndex::HasConstant), Blob],
        CustomAttribute => &[
            Coded(CodedIndex::HasCustomAttribute),
            Coded(CodedIndex::CustomAttributeType),
            Blob,
        ],
        FieldMarshal => &[Coded(CodedIndex::HasFieldMarshal), Blob],
        DeclSecurity => &[Fixed(2), Coded(CodedIndex::HasDeclSecurity), Blob],
        ClassLayout => &[Fixed(2), Fixed(4), Table(TypeDef)],
        FieldLayout => &[Fixed(4), Table(Field)],
        StandAloneSig => &[Blob],
        EventMap => &[Table(TypeDef), Table(Event)],
        EventPtr => &[Table(Event)],
        Event => &[Fixed(2), Str, Coded(CodedIndex::TypeDefOrRef)],
        PropertyMap => &[Table(TypeDef), Table(Property)],
        PropertyPtr => &[Table(Property)],
        Property => &[Fixed(2), Str, Blob],
        MethodSemantics => &[Fixed(2), Table(MethodDef), Coded(CodedIndex::HasSemantics)],
        MethodImpl => &[
            Table(TypeDef),
            Coded(CodedIndex::MethodDefOrRef),
            Coded(CodedIndex::MethodDefOrRef),
        ],
        ModuleRef => &[Str],
        TypeSpec => &[Blob],
        ImplMap => &[
            Fixed(2),
            Coded(CodedIndex::MemberForwarded),
            Str,
            Table(ModuleRef),
        ],
        FieldRVA => &[Fixed(4), Table(Field)],
        EncLog => &[Fixed(4), Fixed(4)],
        EncMap => &[Fixed(4)],
        Assembly => &[
            Fixed(4),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(4),
            Blob,
            Str,
            Str,
        ],
        AssemblyProcessor => &[Fixed(4)],
        AssemblyOs => &[Fixed(4), Fixed(4), Fixed(4)],
        AssemblyRef => &[
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(2),
            Fixed(4),
            Blob,
            Str,
            Str,
            Blob,
        ],
        AssemblyRefProcessor => &[Fixed(4), Table(AssemblyRef)],
        AssemblyRefOs => &[Fixed(4), Fixed(4), Fixed(4), Table(AssemblyRef)],
        File => &[Fixed(4), Str, Blob],
        ExportedType => &[Fixed(4), Fixed(4), Str, Str, Coded(CodedIndex::Implementation)],
        ManifestResource => &[Fixed(4), Fixed(4), Str, Coded(CodedIndex::Implementation)],
        NestedClass => &[Table(TypeDef), Table(TypeDef)],
        GenericParam => &[Fixed(2), Fixed(2), Coded(CodedIndex::TypeOrMethodDef), Str],
        MethodSpec => &[Coded(CodedIndex::MethodDefOrRef), Blob],
        GenericParamConstraint => &[Table(GenericParam), Coded(CodedIndex::TypeDefOrRef)],
        Document => &[Blob, Guid, Blob, Guid],
        MethodDebugInformation => &[Table(Document), Blob],
        LocalScope => &[
            Table(MethodDef),
            Table(ImportScope),
            Table(LocalVariable),
            Table(LocalConstant),
            Fixed(4),
            Fixed(4),
        ],
        LocalVariable => &[Fixed(2), Fixed(2), Str],
        LocalConstant => &[Str, Blob],
        ImportScope => &[Table(ImportScope), Blob],
        StateMachineMethod => &[Table(MethodDef), Table(MethodDef)],
        CustomDebugInformation => &[
            Coded(CodedIndex::HasCustomDebugInformation),
            Guid,
            Blob,
        ],
    }
}

/// The index widths in effect for one concrete table stream.
///
/// Widths are always computed from the current heap sizes and row counts;
/// the same logical row can occupy different byte lengths before and after a
/// mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexWidths {
    /// Width of a `#Strings` index, 2 or 4.
    pub string: u8,
    /// Width of a `#GUID` index, 2 or 4.
    pub guid: u8,
    /// Width of a `#Blob` index, 2 or 4.
    pub blob: u8,
    rows: [u32; 64],
}

impl IndexWidths {
    /// Derives widths from a table stream's `HeapSizes` byte and row counts.
    pub fn from_heap_bits(heap_sizes: u8, rows: [u32; 64]) -> Self {
        Self {
            string: if heap_sizes & 0x1 == 0 { 2 } else { 4 },
            guid: if heap_sizes & 0x2 == 0 { 2 } else { 4 },
            blob: if heap_sizes & 0x4 == 0 { 2 } else { 4 },
            rows,
        }
    }

    /// Derives widths from projected heap byte sizes and row counts.
    pub fn from_heap_lens(strings: u64, guids: u64, blobs: u64, rows: [u32; 64]) -> Self {
        fn heap_width(len: u64) -> u8 {
            if len < 0x1_0000 {
                2
            } else {
                4
            }
        }
        Self {
            string: heap_width(strings),
            guid: heap_width(guids),
            blob: heap_width(blobs),
            rows,
        }
    }

    /// The `HeapSizes` byte these widths correspond to.
    pub fn heap_sizes_byte(&self) -> u8 {
        let mut bits = 0;
        if self.string == 4 {
            bits |= 0x1;
        }
        if self.guid == 4 {
            bits |= 0x2;
        }
        if self.blob == 4 {
            bits |= 0x4;
        }
        bits
    }

    /// The row count of a table.
    pub fn row_count(&self, table: TableId) -> u32 {
        self.rows[table as usize]
    }

    /// Width of a direct row identifier into `table`.
    pub fn table(&self, table: TableId) -> u8 {
        if self.row_count(table) < 0x1_0000 {
            2
        } else {
            4
        }
    }

    /// Width of a coded index of kind `coded`.
    pub fn coded(&self, coded: CodedIndex) -> u8 {
        let limit = 1u64 << (16 - coded.tag_bits());
        let small = coded
            .tables()
            .iter()
            .flatten()
            .all(|table| (self.row_count(*table) as u64) < limit);
        if small {
            2
        } else {
            4
        }
    }

    /// Width of a column of the given kind.
    pub fn column(&self, kind: ColumnKind) -> u8 {
        match kind {
            ColumnKind::Fixed(n) => n,
            ColumnKind::Str => self.string,
            ColumnKind::Guid => self.guid,
            ColumnKind::Blob => self.blob,
            ColumnKind::Table(t) => self.table(t),
            ColumnKind::Coded(c) => self.coded(c),
        }
    }

    /// The byte size of one row of `table` under these widths.
    pub fn row_size(&self, table: TableId) -> usize {
        columns(table)
            .iter()
            .map(|kind| self.column(*kind) as usize)
            .sum()
    }
}

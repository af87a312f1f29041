//! The top-level editing API: open an image, stage mutations, save.

use std::io::Write;
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};
use crate::format::rows::{
    AssemblyRefRow, AssemblyRow, CustomAttributeRow, MemberRefRow, TypeDefRow, TypeRefRow,
};
use crate::format::schema::{CodedIndex, TableId, Token};
use crate::format::writer::build_metadata;
use crate::format::{utils, Metadata, TableStream};
use crate::pe::raw::COMIMAGE_FLAGS_STRONGNAMESIGNED;
use crate::pe::rewriter::rewrite_image;
use crate::pe::PeImage;
use crate::plan::{Plan, Projection, WriteStrategy};
use crate::strongname::{sign_image, StrongNameKey};

/// The signature blob of `InternalsVisibleToAttribute(String)`:
/// `HASTHIS | paramCount=1 | return=VOID | param=STRING`.
const IVT_CTOR_SIGNATURE: [u8; 4] = [0x20, 0x01, 0x01, 0x0E];

const IVT_TYPE_NAME: &str = "InternalsVisibleToAttribute";
const IVT_TYPE_NAMESPACE: &str = "System.Runtime.CompilerServices";

/// Runtime assemblies preferred as the resolution scope for a new
/// `InternalsVisibleToAttribute` type reference, in order.
const RUNTIME_ASSEMBLY_NAMES: &[&str] = &[
    "mscorlib",
    "System.Runtime",
    "netstandard",
    "System.Private.CoreLib",
];

/// The identity written into a redirected assembly reference.
#[derive(Debug, Clone, Copy)]
pub enum RefIdentity<'a> {
    /// No identity: the reference becomes name-only.
    None,
    /// An 8-byte public key token.
    Token(&'a [u8]),
    /// A full public key blob; sets the reference's PublicKey flag.
    PublicKey(&'a [u8]),
}

/// An editor over one managed assembly image.
///
/// The source bytes are never mutated; all edits are staged in a plan and
/// materialized by [`save`](Editor::save). A failed save leaves the plan
/// intact so it can be retried after correction.
pub struct Editor {
    data: Vec<u8>,
    pe: PeImage,
    metadata: Metadata,
    tables: TableStream,
    plan: Plan,
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor")
            .field("metadata_size", &self.pe.metadata_size)
            .field("version", &self.metadata.version)
            .finish()
    }
}

impl Editor {
    /// Opens an assembly image from a file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(std::fs::read(path)?)
    }

    /// Parses an assembly image from an in-memory buffer.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        let pe = PeImage::parse(&data)?;
        let blob = pe.metadata_bytes(&data);
        let metadata = Metadata::parse(blob)?;
        let tables = TableStream::parse(metadata.table_stream_bytes(blob)?)?;

        if tables.row_count(TableId::Module) != 1 {
            return Err(ErrorKind::BadImage("image does not have exactly one Module row").into());
        }
        if tables.row_count(TableId::Assembly) > 1 {
            return Err(ErrorKind::BadImage("image has more than one Assembly row").into());
        }

        let plan = Plan::new(
            tables.rows,
            tables.widths.clone(),
            metadata.heap_size("#Strings"),
            metadata.heap_size("#Blob"),
            metadata.heap_size("#GUID"),
        );

        Ok(Self {
            data,
            pe,
            metadata,
            tables,
            plan,
        })
    }

    /// The raw bytes of the source image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The parsed PE container.
    pub fn pe(&self) -> &PeImage {
        &self.pe
    }

    /// The parsed metadata root.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The parsed table stream directory.
    pub fn tables(&self) -> &TableStream {
        &self.tables
    }

    fn metadata_blob(&self) -> &[u8] {
        self.pe.metadata_bytes(&self.data)
    }

    /// Resolves a string index against the source heap or the plan's
    /// appends.
    fn lookup_string(&self, index: u32) -> Result<String> {
        if index < self.metadata.heap_size("#Strings") {
            Ok(self
                .metadata
                .string_heap(self.metadata_blob())?
                .get(index)?
                .to_string())
        } else {
            self.plan
                .strings
                .get(index)
                .map(str::to_string)
                .ok_or_else(|| {
                    ErrorKind::BrokenReference("string index outside both heaps").into()
                })
        }
    }

    /// The assembly manifest row, override-aware.
    pub fn assembly_row(&self) -> Result<AssemblyRow> {
        if self.tables.row_count(TableId::Assembly) == 0 {
            return Err(ErrorKind::BrokenReference("image has no assembly manifest").into());
        }
        if let Some(row) = self.plan.assembly.get(&1) {
            return Ok(*row);
        }
        let bytes = self
            .tables
            .row_bytes(self.table_stream_bytes()?, TableId::Assembly, 1)?;
        AssemblyRow::read(bytes, &self.tables.widths)
    }

    /// The simple name of the assembly, reflecting a pending rename.
    pub fn assembly_name(&self) -> Result<String> {
        let row = self.assembly_row()?;
        self.lookup_string(row.name)
    }

    fn table_stream_bytes(&self) -> Result<&[u8]> {
        self.metadata.table_stream_bytes(self.metadata_blob())
    }

    fn assembly_ref_row(&self, rid: u32) -> Result<AssemblyRefRow> {
        if let Some(row) = self.plan.assembly_refs.get(&rid) {
            return Ok(*row);
        }
        let bytes = self
            .tables
            .row_bytes(self.table_stream_bytes()?, TableId::AssemblyRef, rid)?;
        AssemblyRefRow::read(bytes, &self.tables.widths)
    }

    fn type_def_row(&self, rid: u32) -> Result<TypeDefRow> {
        if let Some(row) = self.plan.type_defs.get(&rid) {
            return Ok(*row);
        }
        let bytes = self
            .tables
            .row_bytes(self.table_stream_bytes()?, TableId::TypeDef, rid)?;
        TypeDefRow::read(bytes, &self.tables.widths)
    }

    /// Renames the assembly. Version, flags and key material are untouched.
    pub fn rename(&mut self, new_name: &str) -> Result<()> {
        let mut row = self.assembly_row()?;
        row.name = self.plan.strings.intern(new_name);
        self.plan.assembly.insert(1, row);
        Ok(())
    }

    /// Replaces the assembly's public key blob and marks the manifest as
    /// carrying a full key.
    pub fn set_public_key(&mut self, public_key_blob: &[u8]) -> Result<()> {
        let mut row = self.assembly_row()?;
        row.public_key = self.plan.blobs.intern(public_key_blob)?;
        row.flags |= 0x0001;
        self.plan.assembly.insert(1, row);
        Ok(())
    }

    /// Clears the assembly's public key, leaving it unsigned.
    pub fn clear_public_key(&mut self) -> Result<()> {
        let mut row = self.assembly_row()?;
        row.public_key = 0;
        row.flags &= !0x0001;
        self.plan.assembly.insert(1, row);
        Ok(())
    }

    /// Redirects every assembly reference whose simple name matches
    /// `source_name` (case-insensitively) to `new_name` with the given
    /// identity. Returns whether any reference matched.
    pub fn redirect_assembly_ref(
        &mut self,
        source_name: &str,
        new_name: &str,
        identity: RefIdentity<'_>,
    ) -> Result<bool> {
        let mut matched = false;
        for rid in 1..=self.tables.row_count(TableId::AssemblyRef) {
            let row = self.assembly_ref_row(rid)?;
            if !self
                .lookup_string(row.name)?
                .eq_ignore_ascii_case(source_name)
            {
                continue;
            }
            matched = true;

            let mut updated = row;
            updated.name = self.plan.strings.intern(new_name);
            match identity {
                RefIdentity::None => {
                    updated.public_key_or_token = 0;
                    updated.flags &= !0x0001;
                }
                RefIdentity::Token(token) => {
                    updated.public_key_or_token = self.plan.blobs.intern(token)?;
                    updated.flags &= !0x0001;
                }
                RefIdentity::PublicKey(key) => {
                    updated.public_key_or_token = self.plan.blobs.intern(key)?;
                    updated.flags |= 0x0001;
                }
            }
            self.plan.assembly_refs.insert(rid, updated);
        }
        Ok(matched)
    }

    /// Rewrites every externally visible type to assembly-internal
    /// visibility. Returns the number of types changed.
    pub fn internalize_types(&mut self) -> Result<u32> {
        let mut changed = 0;
        for rid in 1..=self.tables.row_count(TableId::TypeDef) {
            let row = self.type_def_row(rid)?;
            if row.is_visible() {
                self.plan.type_defs.insert(rid, row.make_internal());
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Grants `friend_name` access to this assembly's internals by attaching
    /// an `InternalsVisibleToAttribute` to the assembly manifest.
    ///
    /// When `public_key` is given, the attribute argument carries it as
    /// uppercase hex, which is required when the friend resolves a signed
    /// assembly.
    pub fn add_friend(&mut self, friend_name: &str, public_key: Option<&[u8]>) -> Result<()> {
        if self.tables.row_count(TableId::Assembly) == 0 {
            return Err(ErrorKind::BrokenReference("image has no assembly manifest").into());
        }

        let argument = match public_key {
            Some(key) => {
                let mut hex = String::with_capacity(key.len() * 2);
                for byte in key {
                    hex.push_str(&format!("{byte:02X}"));
                }
                format!("{friend_name}, PublicKey={hex}")
            }
            None => friend_name.to_string(),
        };

        let mut value = vec![0x01, 0x00];
        utils::encode_unsigned(argument.len() as u32, &mut value)?;
        value.extend_from_slice(argument.as_bytes());
        value.extend_from_slice(&[0x00, 0x00]);

        let type_ref_rid = self.ensure_ivt_type_ref()?;
        let ctor_rid = self.ensure_ivt_ctor_ref(type_ref_rid)?;

        let row = CustomAttributeRow {
            parent: CodedIndex::HasCustomAttribute.encode(Token::new(TableId::Assembly, 1))?,
            attr_type: CodedIndex::CustomAttributeType
                .encode(Token::new(TableId::MemberRef, ctor_rid))?,
            value: self.plan.blobs.intern(&value)?,
        };
        self.plan.append_custom_attribute(row);
        Ok(())
    }

    /// Finds or appends the TypeRef for `InternalsVisibleToAttribute`.
    fn ensure_ivt_type_ref(&mut self) -> Result<u32> {
        let source_count = self.tables.row_count(TableId::TypeRef);
        for rid in 1..=source_count {
            let row = TypeRefRow::read(
                self.tables
                    .row_bytes(self.table_stream_bytes()?, TableId::TypeRef, rid)?,
                &self.tables.widths,
            )?;
            if self.lookup_string(row.name)? == IVT_TYPE_NAME
                && self.lookup_string(row.namespace)? == IVT_TYPE_NAMESPACE
            {
                return Ok(rid);
            }
        }
        for (i, row) in self.plan.new_type_refs.iter().enumerate() {
            if self.lookup_string(row.name)? == IVT_TYPE_NAME
                && self.lookup_string(row.namespace)? == IVT_TYPE_NAMESPACE
            {
                return Ok(source_count + i as u32 + 1);
            }
        }

        let scope_rid = self.runtime_assembly_ref()?;
        let row = TypeRefRow {
            resolution_scope: CodedIndex::ResolutionScope
                .encode(Token::new(TableId::AssemblyRef, scope_rid))?,
            name: self.plan.strings.intern(IVT_TYPE_NAME),
            namespace: self.plan.strings.intern(IVT_TYPE_NAMESPACE),
        };
        Ok(self.plan.append_type_ref(row))
    }

    /// Picks an assembly reference to anchor the attribute type: a
    /// well-known runtime assembly when one is referenced, otherwise the
    /// first reference in the table.
    fn runtime_assembly_ref(&self) -> Result<u32> {
        let count = self.tables.row_count(TableId::AssemblyRef);
        if count == 0 {
            return Err(ErrorKind::BrokenReference(
                "no assembly reference can anchor the attribute type",
            )
            .into());
        }
        for wanted in RUNTIME_ASSEMBLY_NAMES {
            for rid in 1..=count {
                let row = self.assembly_ref_row(rid)?;
                if self.lookup_string(row.name)?.eq_ignore_ascii_case(wanted) {
                    return Ok(rid);
                }
            }
        }
        Ok(1)
    }

    /// Finds or appends the MemberRef for the attribute's `(String)`
    /// constructor.
    fn ensure_ivt_ctor_ref(&mut self, type_ref_rid: u32) -> Result<u32> {
        let class =
            CodedIndex::MemberRefParent.encode(Token::new(TableId::TypeRef, type_ref_rid))?;

        let source_count = self.tables.row_count(TableId::MemberRef);
        let blob_heap_size = self.metadata.heap_size("#Blob");
        for rid in 1..=source_count {
            let row = MemberRefRow::read(
                self.tables
                    .row_bytes(self.table_stream_bytes()?, TableId::MemberRef, rid)?,
                &self.tables.widths,
            )?;
            if row.class != class || self.lookup_string(row.name)? != ".ctor" {
                continue;
            }
            if row.signature < blob_heap_size
                && self
                    .metadata
                    .blob_heap(self.metadata_blob())?
                    .get(row.signature)?
                    == IVT_CTOR_SIGNATURE
            {
                return Ok(rid);
            }
        }
        for (i, row) in self.plan.new_member_refs.iter().enumerate() {
            if row.class == class && self.lookup_string(row.name)? == ".ctor" {
                return Ok(source_count + i as u32 + 1);
            }
        }

        let row = MemberRefRow {
            class,
            name: self.plan.strings.intern(".ctor"),
            signature: self.plan.blobs.intern(&IVT_CTOR_SIGNATURE)?,
        };
        Ok(self.plan.append_member_ref(row))
    }

    /// Renders the edited image into a fresh byte buffer.
    #[tracing::instrument(level = "debug", skip_all)]
    fn render(&self, key: Option<&StrongNameKey>) -> Result<Vec<u8>> {
        let projection = self.plan.project();
        let mut out = match projection.strategy {
            WriteStrategy::InPlacePatch => self.patch_in_place(&projection)?,
            WriteStrategy::Rebuild => {
                let blob = self.metadata_blob();
                let new_metadata =
                    build_metadata(blob, &self.metadata, &self.tables, &self.plan, &projection)?;
                rewrite_image(&self.data, &self.pe, &new_metadata)?
            }
        };

        // An untouched image saves byte-identically, signature included.
        if self.plan.is_empty() && key.is_none() {
            return Ok(out);
        }

        // Finalize the strong-name state against the rewritten layout.
        let new_pe = PeImage::parse(&out)?;
        let window = new_pe.strong_name_range()?;
        match (window, key) {
            (Some(window), Some(key)) => {
                sign_image(&mut out, new_pe.checksum_offset(), window, key)?;
                patch_strong_name_flag(&mut out, &new_pe, true)?;
            }
            (Some(window), None) => {
                out[window].fill(0);
                patch_strong_name_flag(&mut out, &new_pe, false)?;
            }
            (None, Some(_)) => {
                return Err(ErrorKind::Key("image has no strong-name signature slot").into());
            }
            (None, None) => {}
        }
        Ok(out)
    }

    /// Copies the source image and overwrites the staged rows at their
    /// original offsets. Only valid when the projection proves no byte
    /// layout changed.
    fn patch_in_place(&self, projection: &Projection) -> Result<Vec<u8>> {
        debug_assert_eq!(projection.strategy, WriteStrategy::InPlacePatch);
        let mut out = self.data.clone();
        let stream_base =
            self.pe.metadata_offset + self.metadata.table_stream_entry()?.offset as usize;
        let widths = &projection.widths;

        let mut patch = |table: TableId, rid: u32, bytes: &[u8]| -> Result<()> {
            let range = self.tables.row_range(table, rid)?;
            out[stream_base + range.start..stream_base + range.end].copy_from_slice(bytes);
            Ok(())
        };

        let mut buf = Vec::new();
        for (rid, row) in &self.plan.assembly {
            buf.clear();
            row.write(&mut buf, widths);
            patch(TableId::Assembly, *rid, &buf)?;
        }
        for (rid, row) in &self.plan.assembly_refs {
            buf.clear();
            row.write(&mut buf, widths);
            patch(TableId::AssemblyRef, *rid, &buf)?;
        }
        for (rid, row) in &self.plan.type_defs {
            buf.clear();
            row.write(&mut buf, widths);
            patch(TableId::TypeDef, *rid, &buf)?;
        }
        Ok(out)
    }

    /// Saves the edited image, optionally re-signing it with `key`.
    ///
    /// The output is written to a temporary file in the target directory and
    /// renamed into place, so an existing file at `path` (including the
    /// source itself) is never left half-written.
    pub fn save(&self, path: impl AsRef<Path>, key: Option<&StrongNameKey>) -> Result<()> {
        let rendered = self.render(key)?;
        let path = path.as_ref();
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut file = tempfile::NamedTempFile::new_in(dir.unwrap_or(Path::new(".")))?;
        file.write_all(&rendered)?;
        file.persist(path)
            .map_err(|e| Error::new(ErrorKind::Io, e))?;
        Ok(())
    }

    /// Renders the edited image into memory without touching the file
    /// system.
    pub fn render_to_vec(&self, key: Option<&StrongNameKey>) -> Result<Vec<u8>> {
        self.render(key)
    }
}

fn patch_strong_name_flag(out: &mut [u8], pe: &PeImage, signed: bool) -> Result<()> {
    use scroll::{Pread, Pwrite, LE};
    // The flags field sits after cb, the runtime version and the metadata
    // directory.
    let offset = pe.cli_offset + 16;
    let flags: u32 = out.pread_with(offset, LE)?;
    let flags = if signed {
        flags | COMIMAGE_FLAGS_STRONGNAMESIGNED
    } else {
        flags & !COMIMAGE_FLAGS_STRONGNAMESIGNED
    };
    out.pwrite_with(flags, offset, LE)?;
    Ok(())
}
